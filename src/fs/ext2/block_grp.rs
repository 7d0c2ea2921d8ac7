//! Block group descriptors.
//!
//! Block groups are a logical grouping of contiguous blocks on disk. Each
//! group carries its own block bitmap, inode bitmap and inode table, located
//! by a fixed-size descriptor record. The descriptor table follows the
//! superblock and is backed up at the start of every group.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bytemuck::{Pod, Zeroable};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{Mutex, MutexGuard};

use crate::errors::{FsError, FsResult};
use crate::fs::ext2::sb::{Sbi, DESC_SIZE};
use crate::io::cache::{Buffer, BufferCache};

/// A group descriptor as laid out on disk (32 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct RawGroupDescriptor {
    /// Block number of the block bitmap.
    pub bg_block_bitmap: u32,
    /// Block number of the inode bitmap.
    pub bg_inode_bitmap: u32,
    /// First block of the inode table.
    pub bg_inode_table: u32,
    /// Number of unallocated blocks in the group.
    pub bg_free_blocks_count: u16,
    /// Number of unallocated inodes in the group.
    pub bg_free_inodes_count: u16,
    /// Number of directories in the group.
    pub bg_used_dirs_count: u16,
    _pad: u16,
    _reserved: [u8; 12],
}

impl RawGroupDescriptor {
    pub fn block_bitmap(&self) -> u32 {
        u32::from_le(self.bg_block_bitmap)
    }

    pub fn inode_bitmap(&self) -> u32 {
        u32::from_le(self.bg_inode_bitmap)
    }

    pub fn inode_table(&self) -> u32 {
        u32::from_le(self.bg_inode_table)
    }

    pub fn free_blocks_count(&self) -> u16 {
        u16::from_le(self.bg_free_blocks_count)
    }

    pub fn free_inodes_count(&self) -> u16 {
        u16::from_le(self.bg_free_inodes_count)
    }

    pub fn used_dirs_count(&self) -> u16 {
        u16::from_le(self.bg_used_dirs_count)
    }

    /// Adjusts the free-blocks counter by `delta`.
    pub fn add_free_blocks(&mut self, delta: i32) {
        let count = i32::from(self.free_blocks_count()) + delta;
        self.bg_free_blocks_count = (count as u16).to_le();
    }

    /// Adjusts the free-inodes counter by `delta`.
    pub fn add_free_inodes(&mut self, delta: i32) {
        let count = i32::from(self.free_inodes_count()) + delta;
        self.bg_free_inodes_count = (count as u16).to_le();
    }

    /// Adjusts the used-directories counter by `delta`.
    pub fn add_used_dirs(&mut self, delta: i32) {
        let count = i32::from(self.used_dirs_count()) + delta;
        self.bg_used_dirs_count = (count as u16).to_le();
    }
}

/// In-memory state of one block group.
///
/// The descriptor mutex is the per-group spin lock: it covers the descriptor
/// counters and serialises every mutation of the group's bitmaps.
pub struct BlockGroup {
    desc: Mutex<RawGroupDescriptor>,
    /// Set when the group's block bitmap failed validation; allocation
    /// skips such groups.
    bad: AtomicBool,
}

impl BlockGroup {
    /// Locks the group, returning its descriptor for inspection or update.
    pub fn lock(&self) -> MutexGuard<'_, RawGroupDescriptor> {
        self.desc.lock()
    }

    pub fn is_bad(&self) -> bool {
        self.bad.load(Ordering::Acquire)
    }

    pub fn mark_bad(&self) {
        self.bad.store(true, Ordering::Release);
    }
}

/// The full descriptor table: per-group state plus the pinned buffers the
/// on-disk table was read from.
pub struct Groups {
    groups: Vec<BlockGroup>,
    /// Descriptor-table buffers, one per `gdb_count` block, pinned for the
    /// lifetime of the mount.
    table: Vec<Arc<Buffer>>,
}

impl Groups {
    /// Device block holding the `nr`-th block of the descriptor table.
    pub fn descriptor_block(sbi: &Sbi, nr: u32) -> u32 {
        sbi.sb_block + 1 + nr
    }

    /// Reads the descriptor table from `cache`.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] when a table block cannot be read.
    pub fn load(cache: &BufferCache, sbi: &Sbi) -> FsResult<Self> {
        let mut table = Vec::new();
        for nr in 0..sbi.gdb_count {
            table.push(cache.get(Self::descriptor_block(sbi, nr))?);
        }

        let mut groups = Vec::new();
        for group in 0..sbi.groups_count {
            let block = (group / sbi.desc_per_block) as usize;
            let offset = ((group % sbi.desc_per_block) * DESC_SIZE) as usize;
            let data = table[block].read();
            let desc: RawGroupDescriptor =
                bytemuck::pod_read_unaligned(&data[offset..offset + DESC_SIZE as usize]);
            drop(data);

            groups.push(BlockGroup {
                desc: Mutex::new(desc),
                bad: AtomicBool::new(false),
            });
        }

        Ok(Self { groups, table })
    }

    /// Returns the state of group `group`, bounds-checked.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Corrupt`] for a group number past the descriptor
    /// table.
    pub fn get(&self, group: u32) -> FsResult<&BlockGroup> {
        self.groups.get(group as usize).ok_or(FsError::Corrupt)
    }

    pub fn count(&self) -> u32 {
        self.groups.len() as u32
    }

    /// Writes `desc` through to the pinned descriptor-table buffer.
    ///
    /// Callers hold the group lock across the descriptor update and this
    /// write-through, so the buffer never lags the in-memory counters.
    pub fn write_back(&self, sbi: &Sbi, group: u32, desc: &RawGroupDescriptor) {
        let block = (group / sbi.desc_per_block) as usize;
        let offset = ((group % sbi.desc_per_block) * DESC_SIZE) as usize;
        let buffer = &self.table[block];

        let mut data = buffer.write();
        data[offset..offset + DESC_SIZE as usize].copy_from_slice(bytemuck::bytes_of(desc));
        drop(data);
        buffer.mark_dirty();
    }

    /// Validates every descriptor: the bitmap blocks and the whole inode
    /// table must lie inside their group's block range.
    ///
    /// Returns the offending group on failure.
    pub fn check_descriptors(&self, sbi: &Sbi) -> Result<(), u32> {
        for group in 0..self.count() {
            let desc = self.groups[group as usize].lock();
            let first = sbi.group_first_block(group);
            let last = sbi.group_last_block(group);

            let block_bitmap = desc.block_bitmap();
            if block_bitmap < first || block_bitmap > last {
                return Err(group);
            }

            let inode_bitmap = desc.inode_bitmap();
            if inode_bitmap < first || inode_bitmap > last {
                return Err(group);
            }

            let itb_first = desc.inode_table();
            let itb_last = itb_first + sbi.itb_per_group - 1;
            if itb_first < first || itb_last > last {
                return Err(group);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn descriptor_record_is_packed() {
        assert_eq!(size_of::<RawGroupDescriptor>(), DESC_SIZE as usize);
    }

    #[test]
    fn counter_updates_round_trip_through_le_storage() {
        let mut desc = RawGroupDescriptor::zeroed();
        desc.add_free_blocks(100);
        desc.add_free_blocks(-1);
        assert_eq!(desc.free_blocks_count(), 99);

        desc.add_free_inodes(7);
        assert_eq!(desc.free_inodes_count(), 7);

        desc.add_used_dirs(2);
        desc.add_used_dirs(-1);
        assert_eq!(desc.used_dirs_count(), 1);
    }
}
