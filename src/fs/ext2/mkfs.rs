//! Filesystem creation.
//!
//! Writes a fresh ext2-lite image onto a block device: superblock,
//! descriptor table, per-group bitmaps and inode tables, the reserved
//! inodes and a root directory holding `.` and `..`. Every group gets a
//! backup of the superblock and the descriptor table at its start.
//!
//! Bitmap bits past a group's real span (the last group is usually
//! partial) are set, so free-bit scans and zero-bit popcounts agree with
//! the descriptor counters.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bytemuck::Zeroable;

use crate::errors::{CanFail, FsError};
use crate::fs::ext2::block_grp::RawGroupDescriptor;
use crate::fs::ext2::dir::{dir_rec_len, write_record};
use crate::fs::ext2::inode::{FileMode, RawInode, EXT2_N_BLOCKS};
use crate::fs::ext2::sb::{
    RawSuperblock, DESC_SIZE, EXT2_MAGIC, GOOD_OLD_FIRST_INO, GOOD_OLD_INODE_SIZE, ROOT_INO,
    STATE_VALID_FS, SUPERBLOCK_OFFSET,
};
use crate::fs::ext2::{bitmap, ErrorsBehaviour};
use crate::fs::Clock;
use crate::io::BlockDevice;

/// Parameters for a new filesystem.
pub struct MkfsOptions {
    /// Block size in bytes; a power of two, at least 1024.
    pub block_size: u32,
    /// Blocks per group; defaults to the bitmap capacity (`block_size * 8`).
    pub blocks_per_group: Option<u32>,
    /// Inodes per group.
    pub inodes_per_group: u32,
    /// Filesystem UUID.
    pub uuid: [u8; 16],
    /// Volume label, truncated to 16 bytes.
    pub label: &'static str,
    /// Default error behaviour recorded in the superblock.
    pub errors: ErrorsBehaviour,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            block_size: 1024,
            blocks_per_group: None,
            inodes_per_group: 1024,
            uuid: [0; 16],
            label: "",
            errors: ErrorsBehaviour::RemountRo,
        }
    }
}

fn write_block(
    dev: &Arc<dyn BlockDevice>,
    block_size: u32,
    block: u32,
    data: &[u8],
) -> CanFail<FsError> {
    dev.write_at(u64::from(block) * u64::from(block_size), data)
}

/// Creates an ext2-lite filesystem covering the whole of `dev`.
///
/// # Errors
///
/// Returns [`FsError::Invalid`] when the requested geometry does not fit
/// the device (groups smaller than their own metadata, degenerate sizes),
/// and [`FsError::Io`] on write failure.
pub fn mkfs(dev: &Arc<dyn BlockDevice>, opts: &MkfsOptions, clock: &dyn Clock) -> CanFail<FsError> {
    let bs = opts.block_size;
    if !bs.is_power_of_two() || bs < 1024 {
        return Err(FsError::Invalid);
    }

    let blocks_count = (dev.size() / u64::from(bs)) as u32;
    let first_data_block: u32 = if bs == 1024 { 1 } else { 0 };
    if blocks_count <= first_data_block + 1 {
        return Err(FsError::Invalid);
    }

    let blocks_per_group = opts.blocks_per_group.unwrap_or(bs * 8).min(bs * 8);
    let inodes_per_group = opts.inodes_per_group.min(bs * 8);
    if blocks_per_group == 0 || inodes_per_group == 0 {
        return Err(FsError::Invalid);
    }

    let groups_count = (blocks_count - first_data_block - 1) / blocks_per_group + 1;
    let inodes_count = groups_count * inodes_per_group;

    let inodes_per_block = bs / u32::from(GOOD_OLD_INODE_SIZE);
    let itb_per_group = inodes_per_group.div_ceil(inodes_per_block);
    let gdb_count = (groups_count * DESC_SIZE).div_ceil(bs);
    // Superblock backup, descriptor-table backup, both bitmaps, inode table.
    let meta_per_group = 1 + gdb_count + 2 + itb_per_group;

    let now = clock.now();
    let mut descriptors: Vec<RawGroupDescriptor> = Vec::new();
    let mut free_blocks_total = 0u32;
    let mut free_inodes_total = 0u32;

    let zero_block = vec![0u8; bs as usize];

    for group in 0..groups_count {
        let first = first_data_block + group * blocks_per_group;
        let span = blocks_per_group.min(blocks_count - first);
        // Group 0 additionally holds the root directory's data block.
        let extra = if group == 0 { 1 } else { 0 };
        if span <= meta_per_group + extra {
            return Err(FsError::Invalid);
        }

        let block_bitmap_blk = first + 1 + gdb_count;
        let inode_bitmap_blk = block_bitmap_blk + 1;
        let inode_table_blk = inode_bitmap_blk + 1;

        // Block bitmap: metadata (and the root block in group 0) used,
        // every bit past the group's span padded to "used".
        let mut bits = vec![0u8; bs as usize];
        for bit in 0..meta_per_group + extra {
            bitmap::set_bit(&mut bits, bit);
        }
        for bit in span..bs * 8 {
            bitmap::set_bit(&mut bits, bit);
        }
        write_block(dev, bs, block_bitmap_blk, &bits)?;
        let group_free_blocks = span - meta_per_group - extra;

        // Inode bitmap: the reserved inodes live in group 0.
        let reserved = if group == 0 { GOOD_OLD_FIRST_INO - 1 } else { 0 };
        let mut bits = vec![0u8; bs as usize];
        for bit in 0..reserved {
            bitmap::set_bit(&mut bits, bit);
        }
        for bit in inodes_per_group..bs * 8 {
            bitmap::set_bit(&mut bits, bit);
        }
        write_block(dev, bs, inode_bitmap_blk, &bits)?;
        let group_free_inodes = inodes_per_group - reserved;

        for blk in 0..itb_per_group {
            write_block(dev, bs, inode_table_blk + blk, &zero_block)?;
        }

        let mut desc = RawGroupDescriptor::zeroed();
        desc.bg_block_bitmap = block_bitmap_blk.to_le();
        desc.bg_inode_bitmap = inode_bitmap_blk.to_le();
        desc.bg_inode_table = inode_table_blk.to_le();
        desc.add_free_blocks(group_free_blocks as i32);
        desc.add_free_inodes(group_free_inodes as i32);
        if group == 0 {
            desc.add_used_dirs(1);
        }
        descriptors.push(desc);

        free_blocks_total += group_free_blocks;
        free_inodes_total += group_free_inodes;
    }

    // Root directory: the first data block of group 0.
    let root_block = first_data_block + meta_per_group;
    {
        let mut chunk = vec![0u8; bs as usize];
        write_record(&mut chunk, 0, ROOT_INO, dir_rec_len(1), b".");
        write_record(
            &mut chunk,
            dir_rec_len(1),
            ROOT_INO,
            bs as usize - dir_rec_len(1),
            b"..",
        );
        write_block(dev, bs, root_block, &chunk)?;
    }

    // Root inode, in the slot for inode 2 of group 0.
    {
        let mut raw = RawInode::zeroed();
        raw.i_mode = (FileMode::directory(0o755).0).to_le();
        raw.i_size = bs.to_le();
        raw.i_atime = now.to_le();
        raw.i_ctime = now.to_le();
        raw.i_mtime = now.to_le();
        // One link for `.`, one for `..` (the root is its own parent).
        raw.i_links_count = 2u16.to_le();
        raw.i_blocks = (bs / 512).to_le();
        let mut i_block = [0u32; EXT2_N_BLOCKS];
        i_block[0] = root_block.to_le();
        raw.i_block = i_block;

        let inode_table_blk = u32::from_le(descriptors[0].bg_inode_table);
        let offset = u64::from(inode_table_blk) * u64::from(bs)
            + u64::from((ROOT_INO - 1) * u32::from(GOOD_OLD_INODE_SIZE));
        dev.write_at(offset, bytemuck::bytes_of(&raw))?;
    }

    // Descriptor table, padded to whole blocks.
    let mut table = vec![0u8; (gdb_count * bs) as usize];
    for (i, desc) in descriptors.iter().enumerate() {
        let offset = i * DESC_SIZE as usize;
        table[offset..offset + DESC_SIZE as usize].copy_from_slice(bytemuck::bytes_of(desc));
    }

    // Superblock record.
    let mut sb = RawSuperblock::zeroed();
    sb.s_inodes_count = inodes_count.to_le();
    sb.s_blocks_count = blocks_count.to_le();
    sb.s_free_blocks_count = free_blocks_total.to_le();
    sb.s_free_inodes_count = free_inodes_total.to_le();
    sb.s_first_data_block = first_data_block.to_le();
    sb.s_log_block_size = (bs.trailing_zeros() - 10).to_le();
    sb.s_log_frag_size = sb.s_log_block_size;
    sb.s_blocks_per_group = blocks_per_group.to_le();
    sb.s_frags_per_group = blocks_per_group.to_le();
    sb.s_inodes_per_group = inodes_per_group.to_le();
    sb.s_max_mnt_count = u16::MAX.to_le();
    sb.s_magic = EXT2_MAGIC.to_le();
    sb.s_state = STATE_VALID_FS.to_le();
    sb.s_errors = match opts.errors {
        ErrorsBehaviour::Continue => 1u16,
        ErrorsBehaviour::RemountRo => 2u16,
        ErrorsBehaviour::Panic => 3u16,
    }
    .to_le();
    sb.s_lastcheck = now.to_le();
    sb.s_rev_level = 1u32.to_le();
    sb.s_first_ino = GOOD_OLD_FIRST_INO.to_le();
    sb.s_inode_size = GOOD_OLD_INODE_SIZE.to_le();
    sb.s_uuid = opts.uuid;
    let label = opts.label.as_bytes();
    let len = label.len().min(sb.s_volume_name.len());
    sb.s_volume_name[..len].copy_from_slice(&label[..len]);

    // Primary copies, then the per-group backups.
    dev.write_at(SUPERBLOCK_OFFSET, bytemuck::bytes_of(&sb))?;
    write_block(
        dev,
        bs,
        (SUPERBLOCK_OFFSET / u64::from(bs)) as u32 + 1,
        &table,
    )?;
    for group in 1..groups_count {
        let first = first_data_block + group * blocks_per_group;
        dev.write_at(u64::from(first) * u64::from(bs), bytemuck::bytes_of(&sb))?;
        write_block(dev, bs, first + 1, &table)?;
    }

    Ok(())
}
