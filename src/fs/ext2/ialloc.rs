//! Inode allocation.
//!
//! Free inodes are managed by one bitmap per block group. Group selection
//! aims for locality: a new inode lands in its parent directory's group
//! when that group still has both free inodes and free blocks, then falls
//! back to a quadratic probe seeded with the parent's inode number, then to
//! a plain linear scan for any free inode.

use alloc::sync::Arc;

use crate::errors::{FsError, FsResult};
use crate::fs::ext2::inode::Ext2Inode;
use crate::fs::ext2::{bitmap, ext2_debug, ext2_error, Ext2Fs};
use crate::io::cache::Buffer;

impl Ext2Fs {
    /// Reads group `group`'s inode bitmap.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] when the bitmap block cannot be read.
    pub(crate) fn read_inode_bitmap(&self, group: u32) -> FsResult<Arc<Buffer>> {
        let bitmap_blk = self.groups.get(group)?.lock().inode_bitmap();
        self.cache.get(bitmap_blk)
    }

    /// Picks the block group a new child of `parent` should be allocated
    /// in. Returns `None` when no group has a free inode left.
    fn find_group(&self, parent: &Ext2Inode) -> Option<u32> {
        let ngroups = self.sbi.groups_count;
        let parent_group = parent.block_group % ngroups;

        // Try to place the inode in its parent directory's group.
        if let Ok(g) = self.groups.get(parent_group) {
            let desc = g.lock();
            if desc.free_inodes_count() != 0 && desc.free_blocks_count() != 0 {
                return Some(parent_group);
            }
        }

        // Quadratic probe for a group with both free inodes and free
        // blocks. Adding the parent's inode number spreads children of
        // different directories that share a home group.
        let mut group = (parent_group + parent.ino) % ngroups;
        let mut i = 1;
        while i < ngroups {
            group += i;
            if group >= ngroups {
                group -= ngroups;
            }
            if let Ok(g) = self.groups.get(group) {
                let desc = g.lock();
                if desc.free_inodes_count() != 0 && desc.free_blocks_count() != 0 {
                    return Some(group);
                }
            }
            i <<= 1;
        }

        // That failed: take a free inode anywhere, even in a group with no
        // free blocks.
        let mut group = parent_group;
        for _ in 0..ngroups {
            group = (group + 1) % ngroups;
            if let Ok(g) = self.groups.get(group) {
                if g.lock().free_inodes_count() != 0 {
                    return Some(group);
                }
            }
        }

        None
    }

    /// Allocates an on-disk inode for a new child of `parent`, returning
    /// its inode number. The in-memory inode is initialised by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::NoSpace`] when every group is out of inodes,
    /// [`FsError::Io`] on bitmap read failures, [`FsError::Corrupt`] when
    /// the chosen bit maps to a reserved or out-of-range inode number.
    pub(crate) fn new_inode(&self, parent: &Ext2Inode, is_dir: bool) -> FsResult<u32> {
        let ngroups = self.sbi.groups_count;
        let inodes_pg = self.sbi.inodes_per_group;

        let mut group_no = self.find_group(parent).ok_or(FsError::NoSpace)?;

        for _ in 0..ngroups {
            let group = self.groups.get(group_no)?;
            let bh = self.read_inode_bitmap(group_no)?;

            let bit = {
                let mut desc = group.lock();
                let mut data = bh.write();

                match bitmap::find_next_zero_bit(&data, inodes_pg, 0) {
                    Some(bit) => {
                        bitmap::set_bit(&mut data, bit);
                        desc.add_free_inodes(-1);
                        if is_dir {
                            desc.add_used_dirs(1);
                        }
                        self.groups.write_back(&self.sbi, group_no, &desc);
                        Some(bit)
                    }
                    // The group looked free when selected but filled up in
                    // the meantime; move on to the next one.
                    None => None,
                }
            };

            let Some(bit) = bit else {
                group_no = (group_no + 1) % ngroups;
                continue;
            };

            bh.mark_dirty();
            if self.is_sync() {
                self.cache.write_buffer(&bh)?;
            }

            let ino = group_no * inodes_pg + bit + 1;
            if ino < self.sbi.first_ino || ino > self.sbi.inodes_count {
                ext2_error!(
                    self,
                    "new_inode",
                    "reserved inode or inode > inodes count - block_group = {group_no}, inode = {ino}"
                );
                return Err(FsError::Corrupt);
            }

            self.free_inodes.add(-1);
            if is_dir {
                self.dirs_count.add(1);
            }
            ext2_debug!(self, "allocating inode {ino}");
            return Ok(ino);
        }

        Err(FsError::NoSpace)
    }

    /// Marks inode `ino` free again.
    ///
    /// Reserved or out-of-range numbers and already-clear bits are reported
    /// as corruption through the error policy.
    pub(crate) fn free_inode(&self, ino: u32, is_dir: bool) {
        ext2_debug!(self, "freeing inode {ino}");

        if ino < self.sbi.first_ino || ino > self.sbi.inodes_count {
            ext2_error!(self, "free_inode", "reserved or nonexistent inode {ino}");
            return;
        }

        let group_no = (ino - 1) / self.sbi.inodes_per_group;
        let bit = (ino - 1) % self.sbi.inodes_per_group;

        let Ok(bh) = self.read_inode_bitmap(group_no) else {
            return;
        };
        let Ok(group) = self.groups.get(group_no) else {
            return;
        };

        let prev = {
            let mut desc = group.lock();
            let mut data = bh.write();
            let prev = bitmap::clear_bit(&mut data, bit);
            if prev {
                desc.add_free_inodes(1);
                if is_dir {
                    desc.add_used_dirs(-1);
                }
                self.groups.write_back(&self.sbi, group_no, &desc);
            }
            prev
        };

        bh.mark_dirty();
        if self.is_sync() {
            let _ = self.cache.write_buffer(&bh);
        }

        if prev {
            self.free_inodes.add(1);
            if is_dir {
                self.dirs_count.add(-1);
            }
        } else {
            ext2_error!(self, "free_inode", "bit already cleared for inode {ino}");
        }
    }

    /// Exact number of free inodes, summed over the group descriptors.
    pub fn count_free_inodes(&self) -> u64 {
        let mut count = 0u64;
        for group in 0..self.sbi.groups_count {
            if let Ok(g) = self.groups.get(group) {
                count += u64::from(g.lock().free_inodes_count());
            }
        }
        count
    }

    /// Exact number of directories, summed over the group descriptors.
    pub fn count_dirs(&self) -> u64 {
        let mut count = 0u64;
        for group in 0..self.sbi.groups_count {
            if let Ok(g) = self.groups.get(group) {
                count += u64::from(g.lock().used_dirs_count());
            }
        }
        count
    }
}
