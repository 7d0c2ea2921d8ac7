//! Directory record store and namespace operations.
//!
//! Directory contents are a sequence of block-sized chunks holding
//! variable-length records: `inode (u32) | rec_len (u16) | name_len (u8) |
//! file_type (u8) | name`. Records are 4-byte aligned, at least 12 bytes
//! long and never cross a chunk boundary; the last record of a chunk is
//! extended to reach the chunk's end. A record with inode 0 is a free slot
//! that keeps its `rec_len` (a tombstone).
//!
//! Insertion reuses tombstones or splits the free tail of an in-use record,
//! appending a fresh chunk only when no chunk has room. Deletion merges the
//! victim into its predecessor, or tombstones it when it leads its chunk.
//!
//! Each chunk is validated once per mount (the buffer's `checked` flag
//! caches the verdict); a chunk that fails validation is reported as
//! corruption and skipped by lookups.
//!
//! Namespace operations (create, link, unlink, mkdir, rmdir, rename, ...)
//! live here too. Concurrent mutations of one directory are assumed to be
//! serialised by the caller, as a VFS does with the parent directory lock;
//! the inode and buffer locks below keep lookups and readdir safe against
//! concurrent writers regardless.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bytemuck::{Pod, Zeroable};

use crate::errors::{CanFail, FsError, FsResult};
use crate::fs::ext2::inode::{Ext2Inode, FileMode, InodeRef, FAST_SYMLINK_MAX};
use crate::fs::ext2::sb::NAME_MAX;
use crate::fs::ext2::{ext2_error, Ext2Fs};
use crate::fs::{DirEntry, FsDirectory};
use crate::io::cache::Buffer;

/// `rename` flag: fail with `Exists` instead of replacing the target.
pub const RENAME_NOREPLACE: u32 = 0x1;

/// Fixed header of a directory record; the name bytes follow.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct RawDirEntry {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: u8,
}

/// Size of the record header.
pub(crate) const DIRENT_HEADER_LEN: usize = core::mem::size_of::<RawDirEntry>();

/// Canonical record length for a name of `name_len` bytes: header plus
/// name, rounded up to 4 bytes.
pub(crate) fn dir_rec_len(name_len: usize) -> usize {
    (DIRENT_HEADER_LEN + name_len + 3) & !3
}

/// Smallest possible record.
pub(crate) const MIN_DIRENT_LEN: usize = 12;

impl RawDirEntry {
    pub(crate) fn inode(&self) -> u32 {
        u32::from_le(self.inode)
    }

    pub(crate) fn rec_len(&self) -> usize {
        u16::from_le(self.rec_len) as usize
    }
}

fn read_de(data: &[u8], offset: usize) -> RawDirEntry {
    bytemuck::pod_read_unaligned(&data[offset..offset + DIRENT_HEADER_LEN])
}

fn write_de(data: &mut [u8], offset: usize, de: &RawDirEntry) {
    data[offset..offset + DIRENT_HEADER_LEN].copy_from_slice(bytemuck::bytes_of(de));
}

/// Writes a complete record (header plus name) at `offset`.
pub(crate) fn write_record(data: &mut [u8], offset: usize, ino: u32, rec_len: usize, name: &[u8]) {
    write_de(
        data,
        offset,
        &RawDirEntry {
            inode: ino.to_le(),
            rec_len: (rec_len as u16).to_le(),
            name_len: name.len() as u8,
            file_type: 0,
        },
    );
    data[offset + DIRENT_HEADER_LEN..offset + DIRENT_HEADER_LEN + name.len()]
        .copy_from_slice(name);
}

fn names_match(data: &[u8], offset: usize, de: &RawDirEntry, name: &[u8]) -> bool {
    de.inode() != 0
        && usize::from(de.name_len) == name.len()
        && &data[offset + DIRENT_HEADER_LEN..offset + DIRENT_HEADER_LEN + name.len()] == name
}

impl Ext2Fs {
    /// Maps logical directory block `n` without allocating.
    fn map_dir_block(&self, dir: &Ext2Inode, n: u32) -> FsResult<u32> {
        if n as usize >= super::inode::EXT2_NDIR_BLOCKS {
            return Err(FsError::Invalid);
        }
        let block = dir.direct(n as usize);
        if block == 0 {
            ext2_error!(
                self,
                "dir_chunk",
                "directory #{} has a hole at chunk {n}",
                dir.ino
            );
            return Err(FsError::Corrupt);
        }
        Ok(block)
    }

    /// Returns the buffer for chunk `n` of `dir`, validating its records on
    /// first access.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Corrupt`] (reported) when validation fails and
    /// [`FsError::Io`] when the chunk cannot be read.
    fn dir_chunk(&self, dir: &Ext2Inode, n: u32) -> FsResult<Arc<Buffer>> {
        let block = self.map_dir_block(dir, n)?;
        let bh = self.cache.get(block)?;
        if !bh.is_checked() {
            self.check_dir_chunk(dir, n, &bh)?;
        }
        Ok(bh)
    }

    /// Validates every record of a directory chunk: minimum and aligned
    /// record lengths, record length covering the name, no chunk-boundary
    /// crossing, inode numbers within range, and records tiling the chunk
    /// exactly.
    fn check_dir_chunk(&self, dir: &Ext2Inode, n: u32, bh: &Buffer) -> CanFail<FsError> {
        let chunk_size = self.sbi.block_size as usize;
        let max_inumber = self.sbi.inodes_count;

        let limit = (dir.size as usize).saturating_sub(n as usize * chunk_size);
        if limit < chunk_size {
            // Directory sizes are a multiple of the chunk size; a short
            // final chunk means the size field itself is corrupted.
            ext2_error!(
                self,
                "check_dir_chunk",
                "size of directory #{} is not a multiple of chunk size",
                dir.ino
            );
            return Err(FsError::Corrupt);
        }

        let error = {
            let data = bh.read();
            let mut error: Option<(&str, usize, RawDirEntry)> = None;
            let mut offs = 0usize;
            while offs + MIN_DIRENT_LEN <= chunk_size {
                let de = read_de(&data, offs);
                let rec_len = de.rec_len();

                if rec_len < MIN_DIRENT_LEN {
                    error = Some(("rec_len is smaller than minimal", offs, de));
                    break;
                }
                if rec_len % 4 != 0 {
                    error = Some(("unaligned directory entry", offs, de));
                    break;
                }
                if rec_len < dir_rec_len(usize::from(de.name_len)) {
                    error = Some(("rec_len is too small for name_len", offs, de));
                    break;
                }
                if offs + rec_len > chunk_size {
                    error = Some(("directory entry across blocks", offs, de));
                    break;
                }
                if de.inode() > max_inumber {
                    error = Some(("inode out of bounds", offs, de));
                    break;
                }
                offs += rec_len;
            }
            if error.is_none() && offs != chunk_size {
                let de = read_de(&data, offs.min(chunk_size - MIN_DIRENT_LEN));
                error = Some(("entry spans the chunk boundary", offs, de));
            }
            error.map(|(msg, offs, de)| (msg, offs, de.inode(), de.rec_len(), de.name_len))
        };

        if let Some((msg, offs, inode, rec_len, name_len)) = error {
            ext2_error!(
                self,
                "check_dir_chunk",
                "bad entry in directory #{}: {msg} - offset={}, inode={inode}, \
                 rec_len={rec_len}, name_len={name_len}",
                dir.ino,
                n as usize * chunk_size + offs
            );
            return Err(FsError::Corrupt);
        }

        bh.set_checked();
        Ok(())
    }

    /// Finds the record for `name` in `dir`.
    ///
    /// Returns the pinned chunk buffer together with the record's offset
    /// inside it; the caller keeps the buffer alive for as long as it uses
    /// the offset.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Corrupt`] on a zero-length record (chunks that
    /// fail whole-chunk validation are skipped instead).
    pub(crate) fn find_entry(
        &self,
        dir: &Ext2Inode,
        name: &[u8],
    ) -> FsResult<Option<(Arc<Buffer>, u32, usize)>> {
        let chunk_size = self.sbi.block_size as usize;
        let npages = dir.size as usize / chunk_size;

        for n in 0..npages {
            let bh = match self.dir_chunk(dir, n as u32) {
                Ok(bh) => bh,
                // A bad chunk was reported; keep scanning the others.
                Err(FsError::Corrupt) => continue,
                Err(err) => return Err(err),
            };

            let found = {
                let data = bh.read();
                let mut found = None;
                let mut offs = 0usize;
                while offs + MIN_DIRENT_LEN <= chunk_size {
                    let de = read_de(&data, offs);
                    if de.rec_len() == 0 {
                        drop(data);
                        ext2_error!(
                            self,
                            "find_entry",
                            "zero-length directory entry in #{}",
                            dir.ino
                        );
                        return Err(FsError::Corrupt);
                    }
                    if names_match(&data, offs, &de, name) {
                        found = Some(offs);
                        break;
                    }
                    offs += de.rec_len();
                }
                found
            };

            if let Some(offs) = found {
                return Ok(Some((bh, n as u32, offs)));
            }
        }
        Ok(None)
    }

    /// Returns the `..` record of `dir`: the second record of chunk 0.
    fn dotdot(&self, dir: &Ext2Inode) -> FsResult<(Arc<Buffer>, usize)> {
        let bh = self.dir_chunk(dir, 0)?;
        let offset = {
            let data = bh.read();
            read_de(&data, 0).rec_len()
        };
        Ok((bh, offset))
    }

    /// Resolves `name` to an inode number without instantiating the inode.
    pub fn inode_by_name(&self, dir: &InodeRef, name: &[u8]) -> FsResult<Option<u32>> {
        let dir = dir.read();
        Ok(self
            .find_entry(&dir, name)?
            .map(|(bh, _, offs)| {
                let data = bh.read();
                read_de(&data, offs).inode()
            }))
    }

    /// Repoints the record at `offset` to `ino`.
    fn set_link(
        &self,
        dir: &mut Ext2Inode,
        bh: &Arc<Buffer>,
        offset: usize,
        ino: u32,
        update_times: bool,
    ) -> CanFail<FsError> {
        {
            let mut data = bh.write();
            let mut de = read_de(&data, offset);
            de.inode = ino.to_le();
            de.file_type = 0;
            write_de(&mut data, offset, &de);
        }
        bh.mark_dirty();

        if update_times {
            let now = self.now();
            dir.mtime = now;
            dir.ctime = now;
        }
        dir.bump_version();
        dir.mark_dirty();
        if self.is_sync() {
            self.cache.write_buffer(bh)?;
            self.do_write_inode(dir, true)?;
        }
        Ok(())
    }

    /// Inserts a record `name -> ino` into `dir`.
    ///
    /// The first fitting slot wins: a tombstone large enough, or the free
    /// tail of an in-use record (which gets split). When no existing chunk
    /// has room a fresh chunk is appended past end-of-file, allocating a
    /// directory block through the mapping layer.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Exists`] when the name is already present,
    /// [`FsError::NoSpace`] when the directory cannot grow any further.
    pub(crate) fn add_link(&self, dir: &mut Ext2Inode, name: &[u8], ino: u32) -> CanFail<FsError> {
        let chunk_size = self.sbi.block_size as usize;
        let reclen = dir_rec_len(name.len());
        let npages = dir.size as usize / chunk_size;

        for n in 0..=npages {
            if n == npages {
                // Every existing chunk is full: extend the directory.
                let bh = match self.get_block(dir, n as u32, true)? {
                    Some(bh) => bh,
                    None => return Err(FsError::NoSpace),
                };
                {
                    let mut data = bh.write();
                    write_record(&mut data, 0, ino, chunk_size, name);
                }
                bh.mark_dirty();
                dir.size += chunk_size as u32;
                return self.commit_add(dir, &bh);
            }

            let bh = self.dir_chunk(dir, n as u32)?;
            let slot = {
                let data = bh.read();
                let mut slot = None;
                let mut offs = 0usize;
                while offs + reclen <= chunk_size {
                    let de = read_de(&data, offs);
                    let rec_len = de.rec_len();
                    if rec_len == 0 {
                        drop(data);
                        ext2_error!(
                            self,
                            "add_link",
                            "zero-length directory entry in #{}",
                            dir.ino
                        );
                        return Err(FsError::Io);
                    }
                    if names_match(&data, offs, &de, name) {
                        return Err(FsError::Exists);
                    }
                    let name_space = dir_rec_len(usize::from(de.name_len));
                    if de.inode() == 0 && rec_len >= reclen {
                        // A tombstone keeps its full record length.
                        slot = Some((offs, rec_len, false));
                        break;
                    }
                    if rec_len >= name_space + reclen {
                        slot = Some((offs, rec_len, true));
                        break;
                    }
                    offs += rec_len;
                }
                slot
            };

            let Some((offs, rec_len, split)) = slot else {
                continue;
            };

            {
                let mut data = bh.write();
                if split {
                    // Shrink the in-use record to its actual length and
                    // place the new one in the freed tail.
                    let mut de = read_de(&data, offs);
                    let name_space = dir_rec_len(usize::from(de.name_len));
                    de.rec_len = (name_space as u16).to_le();
                    write_de(&mut data, offs, &de);
                    write_record(&mut data, offs + name_space, ino, rec_len - name_space, name);
                } else {
                    write_record(&mut data, offs, ino, rec_len, name);
                }
            }
            bh.mark_dirty();
            return self.commit_add(dir, &bh);
        }

        Err(FsError::NoSpace)
    }

    /// Common tail of directory mutations: timestamps, version, dirtiness,
    /// synchronous flush.
    fn commit_add(&self, dir: &mut Ext2Inode, bh: &Arc<Buffer>) -> CanFail<FsError> {
        let now = self.now();
        dir.mtime = now;
        dir.ctime = now;
        dir.bump_version();
        dir.mark_dirty();
        if self.is_sync() {
            self.cache.write_buffer(bh)?;
            self.do_write_inode(dir, true)?;
        }
        Ok(())
    }

    /// Deletes the record at `offset` of the given chunk by merging it into
    /// the preceding record; the first record of a chunk is tombstoned
    /// instead (there is nothing to merge it into).
    pub(crate) fn delete_entry(
        &self,
        dir: &mut Ext2Inode,
        bh: &Arc<Buffer>,
        offset: usize,
    ) -> CanFail<FsError> {
        {
            let mut data = bh.write();

            // Find the record immediately preceding the victim.
            let mut pde: Option<usize> = None;
            let mut offs = 0usize;
            while offs < offset {
                let de = read_de(&data, offs);
                if de.rec_len() == 0 {
                    drop(data);
                    ext2_error!(
                        self,
                        "delete_entry",
                        "zero-length directory entry in #{}",
                        dir.ino
                    );
                    return Err(FsError::Io);
                }
                pde = Some(offs);
                offs = offs + de.rec_len();
            }

            let victim = read_de(&data, offset);
            match pde {
                Some(prev) => {
                    let mut de = read_de(&data, prev);
                    let merged = offset + victim.rec_len() - prev;
                    de.rec_len = (merged as u16).to_le();
                    write_de(&mut data, prev, &de);
                }
                None => {
                    let mut de = victim;
                    de.inode = 0;
                    write_de(&mut data, offset, &de);
                }
            }
        }
        bh.mark_dirty();
        self.commit_add(dir, bh)
    }

    /// Writes the initial `.` and `..` records of a fresh directory.
    pub(crate) fn make_empty(
        &self,
        inode: &mut Ext2Inode,
        parent_ino: u32,
    ) -> CanFail<FsError> {
        let chunk_size = self.sbi.block_size as usize;
        let bh = match self.get_block(inode, 0, true)? {
            Some(bh) => bh,
            None => return Err(FsError::NoSpace),
        };

        {
            let mut data = bh.write();
            write_record(&mut data, 0, inode.ino, dir_rec_len(1), b".");
            write_record(
                &mut data,
                dir_rec_len(1),
                parent_ino,
                chunk_size - dir_rec_len(1),
                b"..",
            );
        }
        bh.mark_dirty();

        inode.size = chunk_size as u32;
        inode.mark_dirty();
        if self.is_sync() {
            self.cache.write_buffer(&bh)?;
        }
        Ok(())
    }

    /// Whether `dir` contains only `.` and `..` (and `.` points at the
    /// directory itself). Unreadable or corrupt chunks count as not empty,
    /// so removal stays refused.
    pub(crate) fn is_empty_dir(&self, dir: &Ext2Inode) -> bool {
        let chunk_size = self.sbi.block_size as usize;
        let npages = dir.size as usize / chunk_size;

        for n in 0..npages {
            let Ok(bh) = self.dir_chunk(dir, n as u32) else {
                return false;
            };
            let data = bh.read();

            let mut offs = 0usize;
            while offs + MIN_DIRENT_LEN <= chunk_size {
                let de = read_de(&data, offs);
                if de.rec_len() == 0 {
                    drop(data);
                    ext2_error!(
                        self,
                        "is_empty_dir",
                        "zero-length directory entry in #{}",
                        dir.ino
                    );
                    return false;
                }
                if de.inode() != 0 {
                    if de.name_len == 0 {
                        return false;
                    }
                    let name = &data[offs + DIRENT_HEADER_LEN
                        ..offs + DIRENT_HEADER_LEN + usize::from(de.name_len)];
                    if name[0] != b'.' {
                        return false;
                    }
                    if de.name_len > 2 {
                        return false;
                    }
                    if de.name_len < 2 {
                        if de.inode() != dir.ino {
                            return false;
                        }
                    } else if name[1] != b'.' {
                        return false;
                    }
                }
                offs += de.rec_len();
            }
        }
        true
    }
}

/// Iterator over a directory's live records.
///
/// The iterator keeps a byte position into the directory and the version it
/// was observed at. When the directory mutates between steps, the position
/// is revalidated by walking the current chunk's records from its start, so
/// iteration never lands in the middle of a record.
pub struct Ext2Directory {
    fs: Arc<Ext2Fs>,
    inode: InodeRef,
    pos: u64,
    version: u64,
}

impl Ext2Directory {
    /// Opens `inode` for iteration.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Invalid`] when `inode` is not a directory.
    pub fn open(fs: Arc<Ext2Fs>, inode: InodeRef) -> FsResult<Self> {
        let version = {
            let guard = inode.read();
            if !guard.mode.is_dir() {
                return Err(FsError::Invalid);
            }
            guard.version
        };
        Ok(Self {
            fs,
            inode,
            pos: 0,
            version,
        })
    }

    /// Walks chunk records from the chunk start to find the first record
    /// boundary at or after `target`.
    fn validate_position(data: &[u8], target: usize) -> usize {
        let mut offs = 0usize;
        while offs < target {
            let de = read_de(data, offs);
            if de.rec_len() == 0 {
                break;
            }
            offs += de.rec_len();
        }
        offs
    }

    fn next_entry(&mut self) -> FsResult<Option<DirEntry>> {
        let chunk_size = u64::from(self.fs.sbi.block_size);
        let dir = self.inode.read();
        let size = u64::from(dir.size);

        while self.pos + MIN_DIRENT_LEN as u64 <= size {
            let n = (self.pos / chunk_size) as u32;
            let bh = match self.fs.dir_chunk(&dir, n) {
                Ok(bh) => bh,
                Err(err) => {
                    // Skip the rest of the bad chunk so a later call can
                    // make progress.
                    self.pos = u64::from(n + 1) * chunk_size;
                    return Err(err);
                }
            };
            let data = bh.read();

            let mut offs = (self.pos % chunk_size) as usize;
            if dir.version != self.version {
                // The directory changed under us: land back on a record
                // boundary before going on.
                if offs != 0 {
                    offs = Self::validate_position(&data, offs);
                    self.pos = u64::from(n) * chunk_size + offs as u64;
                }
                self.version = dir.version;
            }

            while offs + MIN_DIRENT_LEN <= chunk_size as usize {
                let de = read_de(&data, offs);
                if de.rec_len() == 0 {
                    drop(data);
                    drop(dir);
                    ext2_error!(self.fs, "readdir", "zero-length directory entry");
                    return Err(FsError::Corrupt);
                }

                self.pos = u64::from(n) * chunk_size + (offs + de.rec_len()) as u64;
                if de.inode() != 0 {
                    let name = data[offs + DIRENT_HEADER_LEN
                        ..offs + DIRENT_HEADER_LEN + usize::from(de.name_len)]
                        .to_vec();
                    return Ok(Some(DirEntry {
                        inode: de.inode(),
                        name,
                    }));
                }
                offs += de.rec_len();
            }
            // Chunk exhausted, move to the next one.
            self.pos = u64::from(n + 1) * chunk_size;
        }
        Ok(None)
    }
}

impl Iterator for Ext2Directory {
    type Item = FsResult<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

impl FsDirectory for Ext2Directory {
    fn is_root_dir(&self) -> FsResult<bool> {
        Ok(self.inode.read().ino == super::sb::ROOT_INO)
    }

    fn size(&self) -> FsResult<usize> {
        Ok(self.inode.read().size as usize)
    }
}

fn check_name(name: &[u8]) -> CanFail<FsError> {
    if name.is_empty() || name == b"." || name == b".." || name.contains(&0) {
        return Err(FsError::Invalid);
    }
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

// Namespace operations. Directory-mutating entry points assume the caller
// serialises concurrent modifications of any one directory, the way a VFS
// holds the parent directory lock across them.
impl Ext2Fs {
    /// Looks `name` up in `dir` and instantiates the child inode.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::NameTooLong`] for names over 255 bytes and
    /// propagates read errors; a missing name is `Ok(None)`.
    pub fn lookup(&self, dir: &InodeRef, name: &[u8]) -> FsResult<Option<InodeRef>> {
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }
        let ino = self.inode_by_name(dir, name)?;
        match ino {
            Some(ino) => Ok(Some(self.iget(ino)?)),
            None => Ok(None),
        }
    }

    /// Common tail of non-directory creations: link the fresh inode into
    /// the parent, unwinding the allocation on failure.
    fn add_nondir(&self, dir: &InodeRef, name: &[u8], inode: InodeRef) -> FsResult<InodeRef> {
        let ino = inode.read().ino;
        let res = {
            let mut dir = dir.write();
            self.add_link(&mut dir, name, ino)
        };
        match res {
            Ok(()) => Ok(inode),
            Err(err) => {
                inode.write().links_count = 0;
                let _ = self.release(inode);
                Err(err)
            }
        }
    }

    /// Creates a regular file.
    ///
    /// # Errors
    ///
    /// `Exists` for a taken name, `NoSpace` when out of inodes, plus the
    /// usual read-only and validation failures.
    pub fn create(
        &self,
        dir: &InodeRef,
        name: &[u8],
        perm: u16,
        uid: u16,
        gid: u16,
    ) -> FsResult<InodeRef> {
        self.check_writable()?;
        check_name(name)?;

        let inode = {
            let dir = dir.read();
            self.alloc_inode(&dir, FileMode::regular(perm), uid, gid)?
        };
        self.add_nondir(dir, name, inode)
    }

    /// Creates a special file (device node, fifo or socket).
    ///
    /// # Errors
    ///
    /// As [`Ext2Fs::create`]; `Invalid` when `mode` carries no file type.
    pub fn mknod(
        &self,
        dir: &InodeRef,
        name: &[u8],
        mode: FileMode,
        rdev: u32,
        uid: u16,
        gid: u16,
    ) -> FsResult<InodeRef> {
        self.check_writable()?;
        check_name(name)?;
        let Some(file_type) = mode.file_type() else {
            return Err(FsError::Invalid);
        };

        let inode = {
            let dir = dir.read();
            self.alloc_inode(&dir, mode, uid, gid)?
        };
        if matches!(
            file_type,
            crate::fs::FileType::CharacterDevice | crate::fs::FileType::BlockDevice
        ) {
            inode.write().set_device(rdev);
        }
        self.add_nondir(dir, name, inode)
    }

    /// Creates a symbolic link holding `target`.
    ///
    /// Targets up to [`FAST_SYMLINK_MAX`] bytes are stored inline in the
    /// inode's block pointer array; longer ones go through a data block;
    /// anything past one block fails.
    ///
    /// # Errors
    ///
    /// `NameTooLong` when the target exceeds the block size.
    pub fn symlink(
        &self,
        dir: &InodeRef,
        name: &[u8],
        target: &[u8],
        uid: u16,
        gid: u16,
    ) -> FsResult<InodeRef> {
        self.check_writable()?;
        check_name(name)?;

        if target.is_empty() {
            return Err(FsError::Invalid);
        }
        if target.len() > self.sbi.block_size as usize {
            return Err(FsError::NameTooLong);
        }

        let inode = {
            let dir = dir.read();
            self.alloc_inode(&dir, FileMode::symlink(), uid, gid)?
        };

        {
            let mut guard = inode.write();
            if target.len() <= FAST_SYMLINK_MAX {
                let inline = guard.inline_bytes_mut();
                inline[..target.len()].copy_from_slice(target);
                inline[target.len()..].fill(0);
            } else {
                let bh = match self.get_block(&mut guard, 0, true) {
                    Ok(Some(bh)) => bh,
                    Ok(None) => return Err(FsError::NoSpace),
                    Err(err) => {
                        guard.links_count = 0;
                        drop(guard);
                        let _ = self.release(inode);
                        return Err(err);
                    }
                };
                let mut data = bh.write();
                data[..target.len()].copy_from_slice(target);
                data[target.len()..].fill(0);
                drop(data);
                bh.mark_dirty();
            }
            guard.size = target.len() as u32;
            guard.mark_dirty();
        }

        self.add_nondir(dir, name, inode)
    }

    /// Adds a hard link `name -> target` in `dir`.
    ///
    /// # Errors
    ///
    /// `Exists` for a taken name; `Invalid` when `target` is a directory.
    pub fn link(&self, dir: &InodeRef, name: &[u8], target: &InodeRef) -> CanFail<FsError> {
        self.check_writable()?;
        check_name(name)?;

        let ino = {
            let mut target = target.write();
            if target.mode.is_dir() {
                return Err(FsError::Invalid);
            }
            target.ctime = self.now();
            target.links_count += 1;
            target.mark_dirty();
            target.ino
        };

        let res = {
            let mut dir = dir.write();
            self.add_link(&mut dir, name, ino)
        };
        if res.is_err() {
            let mut target = target.write();
            target.links_count -= 1;
            target.mark_dirty();
        }
        res
    }

    /// Removes `name` from `dir`, decrementing the target's link count.
    /// Returns a handle on the unlinked inode.
    fn unlink_impl(&self, dir: &InodeRef, name: &[u8], allow_dir: bool) -> FsResult<InodeRef> {
        self.check_writable()?;
        if name == b"." || name == b".." {
            return Err(FsError::Invalid);
        }

        let mut dir_guard = dir.write();
        let (bh, _, offs) = self
            .find_entry(&dir_guard, name)?
            .ok_or(FsError::NoEnt)?;
        let ino = {
            let data = bh.read();
            read_de(&data, offs).inode()
        };
        let target = self.iget(ino)?;

        {
            let target_guard = target.read();
            if target_guard.mode.is_dir() && !allow_dir {
                return Err(FsError::Invalid);
            }
        }

        self.delete_entry(&mut dir_guard, &bh, offs)?;
        let dir_ctime = dir_guard.ctime;
        drop(dir_guard);

        {
            let mut target_guard = target.write();
            target_guard.ctime = dir_ctime;
            target_guard.links_count = target_guard.links_count.saturating_sub(1);
            target_guard.mark_dirty();
        }
        Ok(target)
    }

    /// Removes a non-directory entry. The inode's storage is released once
    /// the last handle on it is dropped.
    ///
    /// # Errors
    ///
    /// `NoEnt` for a missing name, `Invalid` when the target is a
    /// directory (use [`Ext2Fs::rmdir`]).
    pub fn unlink(&self, dir: &InodeRef, name: &[u8]) -> CanFail<FsError> {
        let target = self.unlink_impl(dir, name, false)?;
        self.release(target)
    }

    /// Creates a directory, with its initial `.` and `..` records.
    ///
    /// # Errors
    ///
    /// As [`Ext2Fs::create`], plus `NoSpace` when the first chunk cannot be
    /// allocated.
    pub fn mkdir(
        &self,
        dir: &InodeRef,
        name: &[u8],
        perm: u16,
        uid: u16,
        gid: u16,
    ) -> FsResult<InodeRef> {
        self.check_writable()?;
        check_name(name)?;

        let parent_ino = {
            // The new `..` entry will reference the parent; take the link
            // count up front and roll it back on failure.
            let mut dir_guard = dir.write();
            dir_guard.links_count += 1;
            dir_guard.mark_dirty();
            dir_guard.ino
        };

        let res: FsResult<InodeRef> = (|| {
            let inode = {
                let dir_guard = dir.read();
                self.alloc_inode(&dir_guard, FileMode::directory(perm), uid, gid)?
            };

            let res: CanFail<FsError> = (|| {
                {
                    let mut guard = inode.write();
                    // One link for the entry in the parent, one for `.`.
                    guard.links_count += 1;
                    self.make_empty(&mut guard, parent_ino)?;
                }
                let mut dir_guard = dir.write();
                self.add_link(&mut dir_guard, name, inode.read().ino)
            })();

            match res {
                Ok(()) => Ok(inode),
                Err(err) => {
                    inode.write().links_count = 0;
                    let _ = self.release(inode);
                    Err(err)
                }
            }
        })();

        if res.is_err() {
            let mut dir_guard = dir.write();
            dir_guard.links_count -= 1;
            dir_guard.mark_dirty();
        }
        res
    }

    /// Removes an empty directory.
    ///
    /// # Errors
    ///
    /// `NotEmpty` when the directory still holds entries, `Invalid` when
    /// the target is not a directory, `NoEnt` when the name is missing.
    pub fn rmdir(&self, dir: &InodeRef, name: &[u8]) -> CanFail<FsError> {
        self.check_writable()?;

        let target = self.lookup(dir, name)?.ok_or(FsError::NoEnt)?;
        {
            let target_guard = target.read();
            if !target_guard.mode.is_dir() {
                return Err(FsError::Invalid);
            }
            if !self.is_empty_dir(&target_guard) {
                drop(target_guard);
                let _ = self.release(target);
                return Err(FsError::NotEmpty);
            }
        }

        let unlinked = match self.unlink_impl(dir, name, true) {
            Ok(inode) => inode,
            Err(err) => {
                let _ = self.release(target);
                return Err(err);
            }
        };

        {
            // Drop the `.` self-link and the parent's `..` back-link.
            let mut target_guard = unlinked.write();
            target_guard.size = 0;
            target_guard.links_count = target_guard.links_count.saturating_sub(1);
            target_guard.mark_dirty();
        }
        {
            let mut dir_guard = dir.write();
            dir_guard.links_count -= 1;
            dir_guard.mark_dirty();
        }

        self.release(unlinked)?;
        self.release(target)
    }

    /// Renames `old_name` in `old_dir` to `new_name` in `new_dir`.
    ///
    /// `flags` may be empty or [`RENAME_NOREPLACE`]. An existing target is
    /// replaced atomically by repointing its record at the source inode; a
    /// directory move across parents rewrites the `..` record and fixes
    /// both parents' link counts.
    ///
    /// # Errors
    ///
    /// `Exists` under `NOREPLACE`, `NotEmpty` when a directory would
    /// replace a non-empty directory, `NoEnt` when the source is missing,
    /// `Invalid` for unknown flags.
    pub fn rename(
        &self,
        old_dir: &InodeRef,
        old_name: &[u8],
        new_dir: &InodeRef,
        new_name: &[u8],
        flags: u32,
    ) -> CanFail<FsError> {
        self.check_writable()?;
        if flags & !RENAME_NOREPLACE != 0 {
            return Err(FsError::Invalid);
        }
        check_name(new_name)?;
        if old_name == b"." || old_name == b".." || old_name.is_empty() {
            return Err(FsError::Invalid);
        }

        let same_dir = Arc::ptr_eq(old_dir, new_dir);

        let old_ino = {
            let old_dir_guard = old_dir.read();
            let (bh, _, offs) = self
                .find_entry(&old_dir_guard, old_name)?
                .ok_or(FsError::NoEnt)?;
            let data = bh.read();
            read_de(&data, offs).inode()
        };
        let old_inode = self.iget(old_ino)?;
        let old_is_dir = old_inode.read().mode.is_dir();

        // For a directory moving to a new parent, its `..` record needs
        // rewriting afterwards; locate it up front so a corrupt child
        // fails the operation before anything is mutated.
        let dotdot_loc = if old_is_dir && !same_dir {
            let old_inode_guard = old_inode.read();
            Some(self.dotdot(&old_inode_guard)?)
        } else {
            None
        };

        let existing = {
            let new_dir_guard = new_dir.read();
            self.find_entry(&new_dir_guard, new_name)?
        };

        if let Some((new_bh, _, new_offs)) = existing {
            if flags & RENAME_NOREPLACE != 0 {
                return Err(FsError::Exists);
            }
            let new_ino = {
                let data = new_bh.read();
                read_de(&data, new_offs).inode()
            };
            if new_ino == old_ino {
                // Renaming something onto itself is a no-op.
                return Ok(());
            }
            let new_inode = self.iget(new_ino)?;
            let new_is_dir = new_inode.read().mode.is_dir();

            if old_is_dir != new_is_dir {
                // Directories replace directories, files replace files.
                return Err(FsError::Invalid);
            }
            if old_is_dir {
                let new_inode_guard = new_inode.read();
                if !self.is_empty_dir(&new_inode_guard) {
                    return Err(FsError::NotEmpty);
                }
            }

            // Atomically repoint the target record at the source inode,
            // then drop the displaced inode's links.
            {
                let mut new_dir_guard = new_dir.write();
                self.set_link(&mut new_dir_guard, &new_bh, new_offs, old_ino, true)?;
            }
            {
                let mut new_inode_guard = new_inode.write();
                new_inode_guard.ctime = self.now();
                new_inode_guard.links_count = new_inode_guard.links_count.saturating_sub(1);
                if new_is_dir {
                    // The displaced directory also loses its `.` self-link.
                    new_inode_guard.links_count =
                        new_inode_guard.links_count.saturating_sub(1);
                }
                new_inode_guard.mark_dirty();
            }
            // A displaced directory's `..` link to the new parent is exactly
            // offset by the arriving directory's `..`, so the new parent's
            // link count needs no adjustment here.
            let _ = self.release(new_inode);
        } else {
            {
                let mut new_dir_guard = new_dir.write();
                self.add_link(&mut new_dir_guard, new_name, old_ino)?;
                if old_is_dir && !same_dir {
                    new_dir_guard.links_count += 1;
                    new_dir_guard.mark_dirty();
                }
            }
        }

        {
            let mut old_inode_guard = old_inode.write();
            old_inode_guard.ctime = self.now();
            old_inode_guard.mark_dirty();
        }

        // Remove the old entry. Offsets into the old chunk may have been
        // reshuffled by the insertion above when both names share a
        // directory, so look the record up again.
        {
            let mut old_dir_guard = old_dir.write();
            let (bh, _, offs) = self
                .find_entry(&old_dir_guard, old_name)?
                .ok_or(FsError::NoEnt)?;
            self.delete_entry(&mut old_dir_guard, &bh, offs)?;
        }

        if let Some((dotdot_bh, dotdot_offs)) = dotdot_loc {
            let new_parent_ino = new_dir.read().ino;
            {
                let mut old_inode_guard = old_inode.write();
                self.set_link(
                    &mut old_inode_guard,
                    &dotdot_bh,
                    dotdot_offs,
                    new_parent_ino,
                    false,
                )?;
            }
            let mut old_dir_guard = old_dir.write();
            old_dir_guard.links_count -= 1;
            old_dir_guard.mark_dirty();
        }

        self.release(old_inode)
    }

    /// Reads a symlink's target.
    ///
    /// # Errors
    ///
    /// `Invalid` when the inode is not a symlink; `Corrupt` when the
    /// stored length or block pointer is inconsistent.
    pub fn readlink(&self, inode: &InodeRef) -> FsResult<Vec<u8>> {
        let guard = inode.read();
        if !guard.mode.is_link() {
            return Err(FsError::Invalid);
        }
        let len = guard.size as usize;

        if guard.is_fast_symlink() {
            if len > FAST_SYMLINK_MAX {
                drop(guard);
                ext2_error!(self, "readlink", "inline symlink target too long");
                return Err(FsError::Corrupt);
            }
            return Ok(guard.inline_bytes()[..len].to_vec());
        }

        if len > self.sbi.block_size as usize {
            drop(guard);
            ext2_error!(self, "readlink", "symlink target longer than a block");
            return Err(FsError::Corrupt);
        }
        let block = guard.direct(0);
        if block == 0 {
            drop(guard);
            ext2_error!(self, "readlink", "slow symlink without a data block");
            return Err(FsError::Corrupt);
        }
        let bh = self.cache.get(block)?;
        let data = bh.read();
        Ok(data[..len].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_lengths_are_aligned_with_a_floor_of_twelve() {
        assert_eq!(dir_rec_len(1), 12);
        assert_eq!(dir_rec_len(2), 12);
        assert_eq!(dir_rec_len(4), 12);
        assert_eq!(dir_rec_len(5), 16);
        assert_eq!(dir_rec_len(255), 264);
    }

    #[test]
    fn record_header_round_trips_through_unaligned_storage() {
        let mut data = [0u8; 32];
        write_record(&mut data, 4, 42, 16, b"hello");

        let de = read_de(&data, 4);
        assert_eq!(de.inode(), 42);
        assert_eq!(de.rec_len(), 16);
        assert_eq!(de.name_len, 5);
        assert!(names_match(&data, 4, &de, b"hello"));
        assert!(!names_match(&data, 4, &de, b"hellO"));
        assert!(!names_match(&data, 4, &de, b"hell"));
    }

    #[test]
    fn tombstones_never_match() {
        let mut data = [0u8; 32];
        write_record(&mut data, 0, 0, 12, b"x");
        let de = read_de(&data, 0);
        assert!(!names_match(&data, 0, &de, b"x"));
    }

    #[test]
    fn name_validation() {
        assert!(check_name(b"regular").is_ok());
        assert_eq!(check_name(b"").unwrap_err(), FsError::Invalid);
        assert_eq!(check_name(b".").unwrap_err(), FsError::Invalid);
        assert_eq!(check_name(b"..").unwrap_err(), FsError::Invalid);
        assert_eq!(check_name(b"nul\0byte").unwrap_err(), FsError::Invalid);
        assert_eq!(check_name(&[b'a'; 256]).unwrap_err(), FsError::NameTooLong);
        assert!(check_name(&[b'a'; 255]).is_ok());
    }
}
