//! Inode handling.
//!
//! An inode is the base structure holding data about a filesystem object.
//! On disk it lives in its group's inode table; in memory it is shared as a
//! locked handle out of the mount's inode cache and carries a small state
//! machine: `New` (never written), `Loaded` (matches disk), `Dirty` (needs
//! write-back).
//!
//! The direct block pointer array is kept in on-disk (little-endian) byte
//! order in memory, so write-back copies it verbatim; every read or update
//! of an individual pointer goes through [`Ext2Inode::direct`] /
//! [`Ext2Inode::set_direct`].

use alloc::sync::Arc;
use bytemuck::{Pod, Zeroable};
use spin::RwLock;

use crate::errors::{CanFail, FsError, FsResult};
use crate::fs::ext2::sb::ROOT_INO;
use crate::fs::ext2::{ext2_debug, ext2_error, Ext2Fs};
use crate::fs::{FileType, SetAttr, Stat};
use crate::io::cache::Buffer;

/// Number of direct block pointers in an inode.
pub const EXT2_NDIR_BLOCKS: usize = 12;
/// Total block pointer slots (direct plus the reserved indirect tail).
pub const EXT2_N_BLOCKS: usize = 15;

/// Longest symlink target stored inline in the block pointer array,
/// derived from the array's size.
pub const FAST_SYMLINK_MAX: usize = EXT2_N_BLOCKS * core::mem::size_of::<u32>();

/// File mode: type in the upper four bits, permissions below.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct FileMode(pub u16);

impl FileMode {
    const S_IFMT: u16 = 0xf000;

    pub const S_IFIFO: u16 = 0x1000;
    pub const S_IFCHR: u16 = 0x2000;
    pub const S_IFDIR: u16 = 0x4000;
    pub const S_IFBLK: u16 = 0x6000;
    pub const S_IFREG: u16 = 0x8000;
    pub const S_IFLNK: u16 = 0xa000;
    pub const S_IFSOCK: u16 = 0xc000;

    /// Set-group-id bit.
    pub const S_ISGID: u16 = 0x0400;

    /// Creates a regular-file mode with `perm` permission bits.
    pub fn regular(perm: u16) -> Self {
        Self(Self::S_IFREG | (perm & !Self::S_IFMT))
    }

    /// Creates a directory mode with `perm` permission bits.
    pub fn directory(perm: u16) -> Self {
        Self(Self::S_IFDIR | (perm & !Self::S_IFMT))
    }

    /// Creates a symlink mode (always `0o777` permissions).
    pub fn symlink() -> Self {
        Self(Self::S_IFLNK | 0o777)
    }

    /// The file type encoded in the mode, if any.
    pub fn file_type(self) -> Option<FileType> {
        match self.0 & Self::S_IFMT {
            Self::S_IFREG => Some(FileType::Regular),
            Self::S_IFDIR => Some(FileType::Directory),
            Self::S_IFLNK => Some(FileType::SymbolicLink),
            Self::S_IFCHR => Some(FileType::CharacterDevice),
            Self::S_IFBLK => Some(FileType::BlockDevice),
            Self::S_IFIFO => Some(FileType::Fifo),
            Self::S_IFSOCK => Some(FileType::Socket),
            _ => None,
        }
    }

    pub fn is_dir(self) -> bool {
        self.0 & Self::S_IFMT == Self::S_IFDIR
    }

    pub fn is_reg(self) -> bool {
        self.0 & Self::S_IFMT == Self::S_IFREG
    }

    pub fn is_link(self) -> bool {
        self.0 & Self::S_IFMT == Self::S_IFLNK
    }

    /// Replaces the permission bits, keeping the type bits.
    pub fn set_permissions(&mut self, perm: u16) {
        self.0 = (self.0 & Self::S_IFMT) | (perm & !Self::S_IFMT);
    }
}

/// An inode as laid out in the on-disk inode table (128 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct RawInode {
    /// Type and permissions.
    pub i_mode: u16,
    /// User id.
    pub i_uid: u16,
    /// Size in bytes.
    pub i_size: u32,
    /// Timestamp of the last access.
    pub i_atime: u32,
    /// Timestamp of the last metadata change.
    pub i_ctime: u32,
    /// Timestamp of the last content change.
    pub i_mtime: u32,
    /// Timestamp of the deletion.
    pub i_dtime: u32,
    /// Group id.
    pub i_gid: u16,
    /// Number of hard links.
    pub i_links_count: u16,
    /// Allocated size in 512-byte units.
    pub i_blocks: u32,
    pub i_flags: u32,
    pub i_osd1: u32,
    /// Direct block pointers plus the reserved indirect slots.
    pub i_block: [u32; EXT2_N_BLOCKS],
    pub i_generation: u32,
    pub i_file_acl: u32,
    pub i_dir_acl: u32,
    pub i_faddr: u32,
    pub i_osd2: [u8; 12],
}

/// Lifecycle state of an in-memory inode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeState {
    /// Just allocated, never written to disk.
    New,
    /// Read from disk and unchanged since.
    Loaded,
    /// Modified, pending write-back.
    Dirty,
}

/// The in-memory inode.
#[derive(Debug)]
pub struct Ext2Inode {
    pub ino: u32,
    pub mode: FileMode,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub links_count: u16,
    /// Allocated size in 512-byte units.
    pub blocks: u32,
    pub flags: u32,
    /// Block pointers, kept in on-disk byte order.
    pub(crate) i_block: [u32; EXT2_N_BLOCKS],
    /// Group the inode was allocated in; block allocation starts here.
    pub(crate) block_group: u32,
    pub(crate) state: InodeState,
    /// Bumped on every directory content mutation; readdir positions are
    /// revalidated against it.
    pub(crate) version: u64,
}

/// Shared handle on an in-memory inode.
pub type InodeRef = Arc<RwLock<Ext2Inode>>;

impl Ext2Inode {
    /// Value of direct block pointer `n`, in host byte order.
    pub fn direct(&self, n: usize) -> u32 {
        u32::from_le(self.i_block[n])
    }

    /// Stores `block` into direct pointer slot `n`.
    pub(crate) fn set_direct(&mut self, n: usize, block: u32) {
        self.i_block[n] = block.to_le();
    }

    pub fn file_type(&self) -> Option<FileType> {
        self.mode.file_type()
    }

    /// A fast symlink stores its target in the block pointer array and owns
    /// no data blocks.
    pub fn is_fast_symlink(&self) -> bool {
        self.mode.is_link() && self.blocks == 0
    }

    /// The block pointer array viewed as inline symlink storage.
    pub(crate) fn inline_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.i_block)
    }

    pub(crate) fn inline_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.i_block)
    }

    /// Flags the inode as needing write-back. A `New` inode stays `New`
    /// until its first write-back.
    pub(crate) fn mark_dirty(&mut self) {
        if self.state == InodeState::Loaded {
            self.state = InodeState::Dirty;
        }
    }

    /// Bumps the directory version counter.
    pub(crate) fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    /// Stores a device number, using the historical encoding when it fits.
    pub(crate) fn set_device(&mut self, rdev: u32) {
        let major = rdev >> 20;
        let minor = rdev & 0xfffff;
        if major < 256 && minor < 256 {
            self.set_direct(0, (major << 8) | minor);
            self.set_direct(1, 0);
        } else {
            self.set_direct(0, 0);
            self.set_direct(1, (minor & 0xff) | (major << 8) | ((minor & !0xffu32) << 12));
        }
    }

    /// Reads back a device number stored by [`Ext2Inode::set_device`].
    pub fn device(&self) -> u32 {
        let old = self.direct(0);
        if old != 0 {
            ((old >> 8) << 20) | (old & 0xff)
        } else {
            let new = self.direct(1);
            (((new >> 8) & 0xfff) << 20) | ((new & 0xff) | ((new >> 12) & 0xfff00))
        }
    }

    /// Attributes as reported to callers.
    pub fn stat(&self) -> Stat {
        Stat {
            ino: self.ino,
            mode: self.mode.0,
            nlink: self.links_count,
            uid: self.uid,
            gid: self.gid,
            size: u64::from(self.size),
            blocks: self.blocks,
            atime: self.atime,
            ctime: self.ctime,
            mtime: self.mtime,
        }
    }
}

impl Ext2Fs {
    /// Locates inode `ino` in its group's inode table.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Invalid`] (after reporting) for reserved or
    /// out-of-range inode numbers; the root inode is permitted below
    /// `first_ino`.
    fn inode_location(&self, ino: u32) -> FsResult<(u32, usize)> {
        if ino == 0
            || (ino != ROOT_INO && ino < self.sbi.first_ino)
            || ino > self.sbi.inodes_count
        {
            ext2_error!(self, "inode_location", "bad inode number: {ino}");
            return Err(FsError::Invalid);
        }

        let group = (ino - 1) / self.sbi.inodes_per_group;
        let desc = *self.groups.get(group)?.lock();

        let mut offset = ((ino - 1) % self.sbi.inodes_per_group) as usize
            * usize::from(self.sbi.inode_size);
        let block = desc.inode_table() + (offset / self.sbi.block_size as usize) as u32;
        offset %= self.sbi.block_size as usize;

        Ok((block, offset))
    }

    /// Returns a shared handle on inode `ino`, reading it from the inode
    /// table on first use.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] on read failure, [`FsError::Invalid`] for a
    /// bad inode number and [`FsError::Corrupt`] for an inode whose record
    /// contradicts itself (deleted but referenced).
    pub fn iget(&self, ino: u32) -> FsResult<InodeRef> {
        if let Some(inode) = self.icache.lock().get(&ino) {
            return Ok(inode.clone());
        }

        ext2_debug!(self, "request to get ino: {ino}");
        let (block, offset) = self.inode_location(ino)?;
        let bh = self.cache.get(block)?;
        let raw: RawInode = {
            let data = bh.read();
            bytemuck::pod_read_unaligned(&data[offset..offset + core::mem::size_of::<RawInode>()])
        };

        let links_count = u16::from_le(raw.i_links_count);
        let dtime = u32::from_le(raw.i_dtime);
        if links_count == 0 && dtime != 0 {
            ext2_error!(self, "iget", "deleted inode referenced: {ino}");
            return Err(FsError::Corrupt);
        }

        let inode = Ext2Inode {
            ino,
            mode: FileMode(u16::from_le(raw.i_mode)),
            uid: u16::from_le(raw.i_uid),
            gid: u16::from_le(raw.i_gid),
            size: u32::from_le(raw.i_size),
            atime: u32::from_le(raw.i_atime),
            ctime: u32::from_le(raw.i_ctime),
            mtime: u32::from_le(raw.i_mtime),
            dtime,
            links_count,
            blocks: u32::from_le(raw.i_blocks),
            flags: u32::from_le(raw.i_flags),
            // The block pointer array stays in little-endian order; no
            // byteswap on read or write-back.
            i_block: raw.i_block,
            block_group: (ino - 1) / self.sbi.inodes_per_group,
            state: InodeState::Loaded,
            version: 1,
        };

        let inode = Arc::new(RwLock::new(inode));
        let mut icache = self.icache.lock();
        let entry = icache.entry(ino).or_insert(inode);
        Ok(entry.clone())
    }

    /// Writes `inode` back to its slot in the inode table.
    ///
    /// On success the inode transitions to `Loaded`.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] when the slot cannot be read or (with
    /// `sync`) flushed.
    pub(crate) fn do_write_inode(&self, inode: &mut Ext2Inode, sync: bool) -> CanFail<FsError> {
        let (block, offset) = self.inode_location(inode.ino)?;
        let bh = self.cache.get(block)?;

        let raw = RawInode {
            i_mode: inode.mode.0.to_le(),
            i_uid: inode.uid.to_le(),
            i_size: inode.size.to_le(),
            i_atime: inode.atime.to_le(),
            i_ctime: inode.ctime.to_le(),
            i_mtime: inode.mtime.to_le(),
            i_dtime: inode.dtime.to_le(),
            i_gid: inode.gid.to_le(),
            i_links_count: inode.links_count.to_le(),
            i_blocks: inode.blocks.to_le(),
            i_flags: inode.flags.to_le(),
            i_osd1: 0,
            i_block: inode.i_block,
            i_generation: 0,
            i_file_acl: 0,
            i_dir_acl: 0,
            i_faddr: 0,
            i_osd2: [0; 12],
        };

        {
            let mut data = bh.write();
            // Larger inode records keep their extension bytes zeroed for
            // records we created ourselves.
            if inode.state == InodeState::New {
                let record_len = usize::from(self.sbi.inode_size);
                data[offset..offset + record_len].fill(0);
            }
            data[offset..offset + core::mem::size_of::<RawInode>()]
                .copy_from_slice(bytemuck::bytes_of(&raw));
        }
        bh.mark_dirty();

        if sync {
            if let Err(err) = self.cache.write_buffer(&bh) {
                log::error!(
                    "ext2: I/O error syncing inode {} (block {block})",
                    inode.ino
                );
                return Err(err);
            }
        }
        inode.state = InodeState::Loaded;
        Ok(())
    }

    /// Writes an inode handle back to disk (see [`Ext2Fs::do_write_inode`]).
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] on write failure.
    pub fn write_inode(&self, inode: &InodeRef, sync: bool) -> CanFail<FsError> {
        let mut inode = inode.write();
        self.do_write_inode(&mut inode, sync)
    }

    /// Allocates a fresh inode as a child of `parent`.
    ///
    /// Ownership follows the usual rules: the group id is inherited from a
    /// set-group-id parent directory, and a directory created under one
    /// inherits the bit itself.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::NoSpace`] when no inode is free, or any error of
    /// the bitmap probe.
    pub(crate) fn alloc_inode(
        &self,
        parent: &Ext2Inode,
        mut mode: FileMode,
        uid: u16,
        gid: u16,
    ) -> FsResult<InodeRef> {
        let ino = self.new_inode(parent, mode.is_dir())?;

        let gid = if parent.mode.0 & FileMode::S_ISGID != 0 {
            if mode.is_dir() {
                mode.0 |= FileMode::S_ISGID;
            }
            parent.gid
        } else {
            gid
        };

        let now = self.now();
        let inode = Ext2Inode {
            ino,
            mode,
            uid,
            gid,
            size: 0,
            atime: now,
            ctime: now,
            mtime: now,
            dtime: 0,
            links_count: 1,
            blocks: 0,
            flags: parent.flags,
            i_block: [0; EXT2_N_BLOCKS],
            block_group: (ino - 1) / self.sbi.inodes_per_group,
            state: InodeState::New,
            version: 1,
        };

        let inode = Arc::new(RwLock::new(inode));
        let mut icache = self.icache.lock();
        if icache.contains_key(&ino) {
            drop(icache);
            ext2_error!(self, "alloc_inode", "inode number already in use - inode={ino}");
            return Err(FsError::Corrupt);
        }
        icache.insert(ino, inode.clone());
        Ok(inode)
    }

    /// Drops a handle previously obtained from [`Ext2Fs::iget`] or a
    /// creation operation.
    ///
    /// When the last outside handle on an unlinked inode goes away, the
    /// inode is evicted: its data blocks are released, its deletion time is
    /// stamped, the record is written and the bitmap bit cleared.
    ///
    /// # Errors
    ///
    /// Returns I/O errors from the eviction write-back.
    pub fn release(&self, inode: InodeRef) -> CanFail<FsError> {
        let ino = inode.read().ino;
        drop(inode);

        let evict = {
            let mut icache = self.icache.lock();
            match icache.get(&ino) {
                // Only the cache itself still holds the inode.
                Some(entry) if Arc::strong_count(entry) == 1 => {
                    if entry.read().links_count == 0 {
                        icache.remove(&ino)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(entry) = evict {
            self.evict_inode(&entry)?;
        }
        Ok(())
    }

    /// Destroys an unlinked inode: truncate, stamp `dtime`, write the
    /// record, free the bitmap bit.
    fn evict_inode(&self, inode: &InodeRef) -> CanFail<FsError> {
        let mut inode = inode.write();
        ext2_debug!(self, "evicting inode {}", inode.ino);

        if inode.blocks != 0 {
            self.truncate_blocks(&mut inode, 0);
        }
        inode.size = 0;
        inode.dtime = self.now();
        inode.mark_dirty();
        self.do_write_inode(&mut inode, self.is_sync())?;

        let is_dir = inode.mode.is_dir();
        let ino = inode.ino;
        drop(inode);
        self.free_inode(ino, is_dir);
        Ok(())
    }

    /// Maps logical block `iblock` of `inode` to a filesystem block.
    ///
    /// Returns `(block, count, new)`; `count == 0` reports a hole (only
    /// when `create` is unset). With `create`, a missing block is allocated
    /// and accounted into the inode.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Invalid`] past the direct range,
    /// [`FsError::NoSpace`] when the allocator is exhausted.
    pub(crate) fn get_blocks(
        &self,
        inode: &mut Ext2Inode,
        iblock: u32,
        create: bool,
    ) -> FsResult<(u32, u32, bool)> {
        ext2_debug!(
            self,
            "looking for block {iblock} of inode {} create: {create}",
            inode.ino
        );

        // Only direct blocks are supported.
        if iblock >= EXT2_NDIR_BLOCKS as u32 {
            return Err(FsError::Invalid);
        }

        let block_no = inode.direct(iblock as usize);
        if block_no > 0 {
            return Ok((block_no, 1, false));
        }
        if !create {
            return Ok((0, 0, false));
        }

        let mut count = 1u32;
        let block = self.new_blocks(inode, &mut count)?;
        inode.set_direct(iblock as usize, block);
        inode.blocks += count * (self.sbi.block_size / 512);
        inode.mark_dirty();
        ext2_debug!(
            self,
            "allocated block {block} for iblock {iblock} of inode {}",
            inode.ino
        );
        Ok((block, count, true))
    }

    /// Buffer-level wrapper over [`Ext2Fs::get_blocks`]: returns the cached
    /// buffer backing logical block `iblock`, or `None` for a hole.
    ///
    /// A newly allocated block is zeroed before being handed out.
    ///
    /// # Errors
    ///
    /// Propagates mapping and read errors.
    pub(crate) fn get_block(
        &self,
        inode: &mut Ext2Inode,
        iblock: u32,
        create: bool,
    ) -> FsResult<Option<Arc<Buffer>>> {
        let (block, count, new) = self.get_blocks(inode, iblock, create)?;
        if count == 0 {
            return Ok(None);
        }

        let bh = self.cache.get(block)?;
        if new {
            bh.write().fill(0);
            bh.mark_dirty();
        }
        Ok(Some(bh))
    }

    /// Releases every data block at or after byte `offset`.
    ///
    /// Contiguous runs are freed in one allocator call each; the freed
    /// slots are zeroed in place. Only regular files, directories and slow
    /// symlinks carry freeable blocks.
    pub(crate) fn truncate_blocks(&self, inode: &mut Ext2Inode, offset: u64) {
        let mode = inode.mode;
        if !(mode.is_reg() || mode.is_dir() || mode.is_link()) {
            return;
        }
        if inode.is_fast_symlink() {
            return;
        }

        let block_size = u64::from(self.sbi.block_size);
        let first_kept = (offset.div_ceil(block_size) as usize).min(EXT2_NDIR_BLOCKS);

        let sectors_per_block = self.sbi.block_size / 512;
        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for slot in first_kept..EXT2_NDIR_BLOCKS {
            let nr = inode.direct(slot);
            if nr == 0 {
                continue;
            }
            inode.set_direct(slot, 0);
            if run_len == 0 {
                run_start = nr;
                run_len = 1;
            } else if nr == run_start + run_len {
                run_len += 1;
            } else {
                let freed = self.free_blocks(run_start, run_len);
                inode.blocks = inode.blocks.saturating_sub(freed * sectors_per_block);
                run_start = nr;
                run_len = 1;
            }
        }
        if run_len > 0 {
            let freed = self.free_blocks(run_start, run_len);
            inode.blocks = inode.blocks.saturating_sub(freed * sectors_per_block);
        }
        inode.mark_dirty();
    }

    /// Truncates or extends `inode` to `new_size` bytes.
    ///
    /// Extension is lazy: no blocks are allocated, the added range reads as
    /// zeros until written. Shrinking zeroes the tail of the last kept
    /// block so that a later extension reads zeros there too.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Invalid`] for inode types without truncatable
    /// content or sizes beyond the direct-block range.
    pub(crate) fn setsize(&self, inode: &mut Ext2Inode, new_size: u64) -> CanFail<FsError> {
        let mode = inode.mode;
        if !(mode.is_reg() || mode.is_dir() || mode.is_link()) || inode.is_fast_symlink() {
            return Err(FsError::Invalid);
        }
        if new_size > self.sbi.max_file_size() {
            return Err(FsError::Invalid);
        }

        let old_size = u64::from(inode.size);
        if new_size < old_size {
            // Zero the tail of the final kept block.
            let block_size = u64::from(self.sbi.block_size);
            let tail = (new_size % block_size) as usize;
            if tail != 0 {
                if let Some(bh) = self.get_block(inode, (new_size / block_size) as u32, false)? {
                    bh.write()[tail..].fill(0);
                    bh.mark_dirty();
                }
            }
            self.truncate_blocks(inode, new_size);
        }

        inode.size = new_size as u32;
        let now = self.now();
        inode.mtime = now;
        inode.ctime = now;
        inode.mark_dirty();
        if self.is_sync() {
            self.do_write_inode(inode, true)?;
        }
        Ok(())
    }

    /// Reports the physical block backing logical block `iblock`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Invalid`] past the direct-block range.
    pub fn bmap(&self, inode: &InodeRef, iblock: u32) -> FsResult<Option<u32>> {
        if iblock >= EXT2_NDIR_BLOCKS as u32 {
            return Err(FsError::Invalid);
        }
        let block = inode.read().direct(iblock as usize);
        Ok((block != 0).then_some(block))
    }

    /// Reports an inode's attributes.
    pub fn getattr(&self, inode: &InodeRef) -> Stat {
        inode.read().stat()
    }

    /// Applies attribute changes; a size change truncates or extends the
    /// content.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::ReadOnly`] on a read-only mount, or any error of
    /// the entailed truncation.
    pub fn setattr(&self, inode: &InodeRef, attr: &SetAttr) -> CanFail<FsError> {
        self.check_writable()?;
        let mut inode = inode.write();

        if let Some(size) = attr.size {
            if size != u64::from(inode.size) {
                self.setsize(&mut inode, size)?;
            }
        }
        if let Some(mode) = attr.mode {
            inode.mode.set_permissions(mode);
        }
        if let Some(uid) = attr.uid {
            inode.uid = uid;
        }
        if let Some(gid) = attr.gid {
            inode.gid = gid;
        }
        if let Some(atime) = attr.atime {
            inode.atime = atime;
        }
        if let Some(mtime) = attr.mtime {
            inode.mtime = mtime;
        }
        inode.ctime = self.now();
        inode.mark_dirty();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_inode_is_128_bytes() {
        assert_eq!(core::mem::size_of::<RawInode>(), 128);
    }

    #[test]
    fn inline_symlink_capacity_follows_the_block_array() {
        assert_eq!(FAST_SYMLINK_MAX, 60);
    }

    #[test]
    fn mode_type_extraction() {
        assert_eq!(FileMode::regular(0o644).file_type(), Some(FileType::Regular));
        assert_eq!(
            FileMode::directory(0o755).file_type(),
            Some(FileType::Directory)
        );
        assert_eq!(FileMode::symlink().file_type(), Some(FileType::SymbolicLink));
        assert!(FileMode::directory(0o755).is_dir());
        assert!(!FileMode::regular(0o644).is_dir());
        assert_eq!(FileMode(0).file_type(), None);
    }

    #[test]
    fn set_permissions_keeps_the_type_bits() {
        let mut mode = FileMode::regular(0o600);
        mode.set_permissions(0o755);
        assert!(mode.is_reg());
        assert_eq!(mode.0 & 0o7777, 0o755);
    }

    #[test]
    fn device_numbers_round_trip() {
        let mut inode = Ext2Inode {
            ino: 12,
            mode: FileMode(FileMode::S_IFCHR),
            uid: 0,
            gid: 0,
            size: 0,
            atime: 0,
            ctime: 0,
            mtime: 0,
            dtime: 0,
            links_count: 1,
            blocks: 0,
            flags: 0,
            i_block: [0; EXT2_N_BLOCKS],
            block_group: 0,
            state: InodeState::New,
            version: 1,
        };

        // Small numbers use the historical encoding in slot 0.
        inode.set_device((5 << 20) | 1);
        assert_ne!(inode.direct(0), 0);
        assert_eq!(inode.device(), (5 << 20) | 1);

        // Large ones fall back to the extended encoding in slot 1.
        inode.set_device((300 << 20) | 7);
        assert_eq!(inode.direct(0), 0);
        assert_eq!(inode.device(), (300 << 20) | 7);
    }

    #[test]
    fn direct_slots_are_stored_little_endian() {
        let mut inode = Ext2Inode {
            ino: 15,
            mode: FileMode::regular(0o644),
            uid: 0,
            gid: 0,
            size: 0,
            atime: 0,
            ctime: 0,
            mtime: 0,
            dtime: 0,
            links_count: 1,
            blocks: 0,
            flags: 0,
            i_block: [0; EXT2_N_BLOCKS],
            block_group: 0,
            state: InodeState::New,
            version: 1,
        };

        inode.set_direct(3, 0x0102_0304);
        assert_eq!(inode.direct(3), 0x0102_0304);
        // The backing array holds disk byte order regardless of host.
        assert_eq!(inode.inline_bytes()[12..16], [0x04, 0x03, 0x02, 0x01]);
    }
}
