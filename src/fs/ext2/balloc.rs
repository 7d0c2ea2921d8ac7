//! Data block allocation.
//!
//! Free blocks are managed by one bitmap per block group. Allocation starts
//! from the owning inode's home group for locality and scans every group at
//! most once; within a group it grabs a run of consecutive free bits, so a
//! caller asking for several blocks gets back how many were actually
//! obtained.
//!
//! A group's block bitmap is validated the first time it is read: the bits
//! covering the group's own metadata (both bitmaps and the inode table)
//! must be set. Groups whose bitmap fails validation are marked bad and
//! skipped by the allocator.

use alloc::sync::Arc;

use crate::errors::{FsError, FsResult};
use crate::fs::ext2::inode::Ext2Inode;
use crate::fs::ext2::{bitmap, ext2_debug, ext2_error, Ext2Fs};
use crate::io::cache::Buffer;

#[inline]
fn in_range(block: u32, first: u32, len: u32) -> bool {
    block >= first && block <= first + len - 1
}

impl Ext2Fs {
    /// Reads group `group`'s block bitmap, validating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Corrupt`] (after routing the report through the
    /// error policy) when the metadata bits are not set, and [`FsError::Io`]
    /// when the bitmap block cannot be read.
    pub(crate) fn read_block_bitmap(&self, group: u32) -> FsResult<Arc<Buffer>> {
        let desc = *self.groups.get(group)?.lock();
        let bitmap_blk = desc.block_bitmap();
        let bh = self.cache.get(bitmap_blk)?;

        if bh.is_checked() {
            return Ok(bh);
        }

        let first_block = self.sbi.group_first_block(group);
        let valid = {
            let data = bh.read();
            let bb_off = desc.block_bitmap() - first_block;
            let ib_off = desc.inode_bitmap() - first_block;
            let it_off = desc.inode_table() - first_block;
            let it_end = it_off + self.sbi.itb_per_group;

            bitmap::test_bit(&data, bb_off)
                && bitmap::test_bit(&data, ib_off)
                && bitmap::find_next_zero_bit(&data, it_end, it_off).is_none()
        };

        if !valid {
            self.groups.get(group)?.mark_bad();
            ext2_error!(
                self,
                "read_block_bitmap",
                "invalid block bitmap - block_group = {group}, block = {bitmap_blk}"
            );
            return Err(FsError::Corrupt);
        }

        bh.set_checked();
        Ok(bh)
    }

    /// Allocates up to `*count` consecutive blocks for `inode`.
    ///
    /// On success, returns the filesystem-wide number of the first block of
    /// the run and updates `*count` to the number actually allocated. The
    /// caller accounts the new blocks into the inode.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::NoSpace`] once every group has been tried, and
    /// [`FsError::Io`] when a bitmap cannot be read.
    pub(crate) fn new_blocks(&self, inode: &Ext2Inode, count: &mut u32) -> FsResult<u32> {
        if self.free_blocks.sum() <= 0 {
            return Err(FsError::NoSpace);
        }

        let ngroups = self.sbi.groups_count;
        let start_group = inode.block_group % ngroups;

        // Visit each group exactly once, starting from the inode's group.
        for bgi in 0..ngroups {
            let group_no = (start_group + bgi) % ngroups;
            let group = self.groups.get(group_no)?;
            if group.is_bad() {
                continue;
            }
            if group.lock().free_blocks_count() == 0 {
                continue;
            }

            let bh = match self.read_block_bitmap(group_no) {
                Ok(bh) => bh,
                // A bad bitmap disables the group; keep scanning the rest.
                Err(FsError::Corrupt) => continue,
                Err(err) => return Err(err),
            };

            let nblocks = self.sbi.group_block_span(group_no);
            let (first_free, num) = {
                let mut desc = group.lock();
                let mut data = bh.write();

                let Some(first_free) = bitmap::find_next_zero_bit(&data, nblocks, 0) else {
                    continue;
                };
                let mut num = 0u32;
                while num < *count
                    && first_free + num < nblocks
                    && !bitmap::set_bit(&mut data, first_free + num)
                {
                    num += 1;
                }

                desc.add_free_blocks(-(num as i32));
                self.groups.write_back(&self.sbi, group_no, &desc);
                (first_free, num)
            };

            bh.mark_dirty();
            if self.is_sync() {
                self.cache.write_buffer(&bh)?;
            }
            self.free_blocks.add(-i64::from(num));

            let ret_block = self.sbi.group_first_block(group_no) + first_free;
            ext2_debug!(
                self,
                "allocating {num} block(s) at {ret_block} in bg {group_no}"
            );
            *count = num;
            return Ok(ret_block);
        }

        Err(FsError::NoSpace)
    }

    /// Frees the run `block..block + count`.
    ///
    /// Invalid runs (outside the data area, or overlapping the group's own
    /// metadata) and already-clear bits are reported as corruption through
    /// the error policy; valid bits of the run are freed regardless.
    ///
    /// Returns the number of blocks actually freed.
    pub(crate) fn free_blocks(&self, block: u32, count: u32) -> u32 {
        let sbi = &self.sbi;
        let end = block.wrapping_add(count).wrapping_sub(1);

        // The run must lie strictly inside the data area and clear of the
        // primary superblock.
        if count == 0
            || end < block
            || block <= sbi.first_data_block
            || end >= sbi.blocks_count
            || (block <= sbi.sb_block && end >= sbi.sb_block)
        {
            ext2_error!(
                self,
                "free_blocks",
                "freeing invalid data blocks - block = {block}, count = {count}"
            );
            return 0;
        }

        let group_no = (block - sbi.first_data_block) / sbi.blocks_per_group;
        let bit = (block - sbi.first_data_block) % sbi.blocks_per_group;
        ext2_debug!(
            self,
            "freeing block(s) {block}-{end} from bg {group_no}"
        );

        let Ok(bh) = self.read_block_bitmap(group_no) else {
            return 0;
        };
        let Ok(group) = self.groups.get(group_no) else {
            return 0;
        };

        // Within the owning group the run must not touch the bitmaps or the
        // inode table.
        let desc = *group.lock();
        if in_range(desc.block_bitmap(), block, count)
            || in_range(desc.inode_bitmap(), block, count)
            || in_range(block, desc.inode_table(), sbi.itb_per_group)
            || in_range(end, desc.inode_table(), sbi.itb_per_group)
        {
            ext2_error!(
                self,
                "free_blocks",
                "freeing blocks in system zones - block = {block}, count = {count}"
            );
            return 0;
        }

        let mut already_clear = 0u32;
        let freed = {
            let mut desc = group.lock();
            let mut data = bh.write();

            let mut freed = 0u32;
            for i in 0..count {
                if bitmap::clear_bit(&mut data, bit + i) {
                    freed += 1;
                } else {
                    already_clear += 1;
                }
            }
            desc.add_free_blocks(freed as i32);
            self.groups.write_back(&self.sbi, group_no, &desc);
            freed
        };

        bh.mark_dirty();
        if self.is_sync() {
            let _ = self.cache.write_buffer(&bh);
        }

        if already_clear != 0 {
            ext2_error!(
                self,
                "free_blocks",
                "{already_clear} bit(s) already cleared in run starting at block {block}"
            );
        }
        if freed != 0 {
            self.free_blocks.add(i64::from(freed));
        }
        ext2_debug!(self, "freed: {freed}");
        freed
    }

    /// Exact number of free blocks, summed over the group descriptors.
    pub fn count_free_blocks(&self) -> u64 {
        let mut count = 0u64;
        for group in 0..self.sbi.groups_count {
            if let Ok(g) = self.groups.get(group) {
                count += u64::from(g.lock().free_blocks_count());
            }
        }
        count
    }
}
