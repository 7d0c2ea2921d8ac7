//! Regular file content access.
//!
//! [`Ext2File`] wraps an inode handle with a cursor and moves bytes through
//! the block mapping layer: reads fall back to zeros over holes, writes
//! allocate missing blocks one at a time. Since only direct blocks exist,
//! any access past `12 * block_size` is rejected before it can touch the
//! allocator.

use alloc::sync::Arc;

use crate::errors::{FsError, FsResult};
use crate::fs::ext2::inode::InodeRef;
use crate::fs::ext2::Ext2Fs;
use crate::fs::{FsFile, Seek};

/// An open regular file.
pub struct Ext2File {
    fs: Arc<Ext2Fs>,
    inode: InodeRef,
    cursor: usize,
}

impl Ext2File {
    /// Opens `inode` for content access.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Invalid`] when the inode is not a regular file.
    pub fn open(fs: Arc<Ext2Fs>, inode: InodeRef) -> FsResult<Self> {
        if !inode.read().mode.is_reg() {
            return Err(FsError::Invalid);
        }
        Ok(Self {
            fs,
            inode,
            cursor: 0,
        })
    }

    /// The inode backing this file.
    pub fn inode(&self) -> &InodeRef {
        &self.inode
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> FsResult<usize> {
        let block_size = self.fs.sbi.block_size as usize;
        let inode = self.inode.read();
        let size = inode.size as usize;

        if offset >= size {
            return Ok(0);
        }
        let count = buf.len().min(size - offset);

        let mut done = 0usize;
        while done < count {
            let pos = offset + done;
            let iblock = pos / block_size;
            let in_block = pos % block_size;
            let chunk = (block_size - in_block).min(count - done);

            let block = inode.direct(iblock);
            if block == 0 {
                // A hole reads as zeros.
                buf[done..done + chunk].fill(0);
            } else {
                let bh = self.fs.cache.get(block)?;
                let data = bh.read();
                buf[done..done + chunk].copy_from_slice(&data[in_block..in_block + chunk]);
            }
            done += chunk;
        }
        Ok(count)
    }

    fn write_at(&mut self, offset: usize, buf: &[u8]) -> FsResult<usize> {
        self.fs.check_writable()?;
        let block_size = self.fs.sbi.block_size as usize;
        let end = offset + buf.len();

        // Reject the whole write before any allocator traffic when it
        // would reach past the last direct block.
        if end as u64 > self.fs.sbi.max_file_size() {
            return Err(FsError::Invalid);
        }

        let mut inode = self.inode.write();
        let old_size = u64::from(inode.size);

        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done;
            let iblock = (pos / block_size) as u32;
            let in_block = pos % block_size;
            let chunk = (block_size - in_block).min(buf.len() - done);

            let bh = match self.fs.get_block(&mut inode, iblock, true) {
                Ok(Some(bh)) => bh,
                Ok(None) => return Err(FsError::NoSpace),
                Err(err) => {
                    // Drop anything allocated past the old end of file by
                    // the failed extension.
                    if end as u64 > old_size {
                        self.fs.truncate_blocks(&mut inode, old_size);
                    }
                    return Err(err);
                }
            };

            {
                let mut data = bh.write();
                data[in_block..in_block + chunk].copy_from_slice(&buf[done..done + chunk]);
            }
            bh.mark_dirty();
            if self.fs.is_sync() {
                self.fs.cache.write_buffer(&bh)?;
            }
            done += chunk;
        }

        if end as u64 > old_size {
            inode.size = end as u32;
        }
        let now = self.fs.now();
        inode.mtime = now;
        inode.ctime = now;
        inode.mark_dirty();
        if self.fs.is_sync() {
            self.fs.do_write_inode(&mut inode, true)?;
        }
        Ok(buf.len())
    }
}

impl FsFile for Ext2File {
    fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let count = self.read_at(self.cursor, buf)?;
        self.cursor += count;
        Ok(count)
    }

    fn write(&mut self, buf: &[u8]) -> FsResult<usize> {
        let count = self.write_at(self.cursor, buf)?;
        self.cursor += count;
        Ok(count)
    }

    fn seek(&mut self, pos: Seek) -> usize {
        match pos {
            Seek::Backward(count) => {
                self.cursor = self.cursor.saturating_sub(count);
            }
            Seek::Current => (),
            Seek::Forward(count) => {
                let size = self.inode.read().size as usize;
                self.cursor = self.cursor.saturating_add(count).min(size);
            }
        }
        self.cursor
    }

    fn size(&self) -> FsResult<usize> {
        Ok(self.inode.read().size as usize)
    }

    fn truncate(&mut self, size: usize) -> FsResult<usize> {
        let mut inode = self.inode.write();
        self.fs.setsize(&mut inode, size as u64)?;
        drop(inode);

        self.cursor = self.cursor.min(size);
        Ok(size)
    }

    fn extend(&mut self, size: usize) -> FsResult<usize> {
        if size < self.size()? {
            return Err(FsError::Invalid);
        }
        let mut inode = self.inode.write();
        self.fs.setsize(&mut inode, size as u64)?;
        Ok(size)
    }
}
