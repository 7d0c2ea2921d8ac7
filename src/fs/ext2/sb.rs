//! On-disk superblock structures.
//!
//! The superblock lives at byte [`SUPERBLOCK_OFFSET`] of the device and
//! describes the filesystem geometry (block size, group sizes, counts) along
//! with its state and error policy. A backup copy sits at the start of every
//! block group.
//!
//! Multi-byte fields are stored little-endian and are kept in disk byte
//! order in memory; every access goes through the `from_le`/`to_le`
//! accessors below.

use bytemuck::{Pod, Zeroable};

use crate::errors::{FsError, FsResult};

/// Byte offset of the primary superblock from the beginning of the device.
pub const SUPERBLOCK_OFFSET: u64 = 1024;

/// The ext2 signature.
pub const EXT2_MAGIC: u16 = 0xef53;

/// Inode number of the root directory.
pub const ROOT_INO: u32 = 2;

/// Filesystem state: cleanly unmounted.
pub const STATE_VALID_FS: u16 = 1;
/// Filesystem state: errors detected.
pub const STATE_ERROR_FS: u16 = 2;

/// `s_errors`: log and continue.
pub const ERRORS_CONTINUE: u16 = 1;
/// `s_errors`: remount read-only.
pub const ERRORS_RO: u16 = 2;
/// `s_errors`: panic.
pub const ERRORS_PANIC: u16 = 3;

/// Revision without the extended superblock fields.
pub const GOOD_OLD_REV: u32 = 0;
/// Highest supported revision.
pub const MAX_SUPP_REV: u32 = 1;
/// Inode record size in revision 0.
pub const GOOD_OLD_INODE_SIZE: u16 = 128;
/// First non-reserved inode in revision 0.
pub const GOOD_OLD_FIRST_INO: u32 = 11;

/// Size of a group descriptor record on disk.
pub const DESC_SIZE: u32 = 32;

/// Longest permitted entry name, in bytes.
pub const NAME_MAX: usize = 255;

/// The ext2 superblock as laid out on disk (1024 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct RawSuperblock {
    /// Total number of inodes in the filesystem.
    pub s_inodes_count: u32,
    /// Total number of blocks in the filesystem.
    pub s_blocks_count: u32,
    /// Number of blocks reserved for the superuser.
    pub s_r_blocks_count: u32,
    /// Total number of unallocated blocks.
    pub s_free_blocks_count: u32,
    /// Total number of unallocated inodes.
    pub s_free_inodes_count: u32,
    /// Block number of the block containing the superblock.
    pub s_first_data_block: u32,
    /// `log2(block_size) - 10`.
    pub s_log_block_size: u32,
    /// `log2(fragment_size) - 10`.
    pub s_log_frag_size: u32,
    /// The number of blocks per block group.
    pub s_blocks_per_group: u32,
    /// The number of fragments per block group.
    pub s_frags_per_group: u32,
    /// The number of inodes per block group.
    pub s_inodes_per_group: u32,
    /// Timestamp of the last mount operation.
    pub s_mtime: u32,
    /// Timestamp of the last write operation.
    pub s_wtime: u32,
    /// Number of mounts since the last consistency check.
    pub s_mnt_count: u16,
    /// Number of mounts allowed before a consistency check must be done.
    pub s_max_mnt_count: u16,
    /// The ext2 signature.
    pub s_magic: u16,
    /// The filesystem's state.
    pub s_state: u16,
    /// The action to perform when an error is detected.
    pub s_errors: u16,
    /// The minor version.
    pub s_minor_rev_level: u16,
    /// Timestamp of the last consistency check.
    pub s_lastcheck: u32,
    /// Interval between mandatory consistency checks.
    pub s_checkinterval: u32,
    /// Id of the operating system that created the filesystem.
    pub s_creator_os: u32,
    /// The major revision level.
    pub s_rev_level: u32,
    /// UID that can use reserved blocks.
    pub s_def_resuid: u16,
    /// GID that can use reserved blocks.
    pub s_def_resgid: u16,

    // Extended superblock fields (revision >= 1)
    /// The first non-reserved inode.
    pub s_first_ino: u32,
    /// Size of the inode structure in bytes.
    pub s_inode_size: u16,
    /// Block group hosting this superblock copy.
    pub s_block_group_nr: u16,
    /// Optional feature set.
    pub s_feature_compat: u32,
    /// Required feature set.
    pub s_feature_incompat: u32,
    /// Features required for writing.
    pub s_feature_ro_compat: u32,
    /// Filesystem UUID.
    pub s_uuid: [u8; 16],
    /// Volume name.
    pub s_volume_name: [u8; 16],
    /// Path the volume was last mounted to.
    pub s_last_mounted: [u8; 64],
    /// Compression algorithms in use.
    pub s_algo_bitmap: u32,
    /// Number of blocks to preallocate for files.
    pub s_prealloc_blocks: u8,
    /// Number of blocks to preallocate for directories.
    pub s_prealloc_dir_blocks: u8,
    _pad: u16,
    /// Journal UUID.
    pub s_journal_uuid: [u8; 16],
    /// Journal inode.
    pub s_journal_inum: u32,
    /// Journal device.
    pub s_journal_dev: u32,
    /// Head of the orphan inode list.
    pub s_last_orphan: u32,

    _reserved: [u8; 788],
}

impl RawSuperblock {
    /// Whether the signature field holds the ext2 magic.
    pub fn magic_valid(&self) -> bool {
        u16::from_le(self.s_magic) == EXT2_MAGIC
    }

    /// Size of a block in bytes.
    pub fn block_size(&self) -> u32 {
        1024 << u32::from_le(self.s_log_block_size)
    }

    pub fn blocks_count(&self) -> u32 {
        u32::from_le(self.s_blocks_count)
    }

    pub fn inodes_count(&self) -> u32 {
        u32::from_le(self.s_inodes_count)
    }

    pub fn first_data_block(&self) -> u32 {
        u32::from_le(self.s_first_data_block)
    }

    pub fn blocks_per_group(&self) -> u32 {
        u32::from_le(self.s_blocks_per_group)
    }

    pub fn inodes_per_group(&self) -> u32 {
        u32::from_le(self.s_inodes_per_group)
    }

    pub fn rev_level(&self) -> u32 {
        u32::from_le(self.s_rev_level)
    }

    pub fn state(&self) -> u16 {
        u16::from_le(self.s_state)
    }

    pub fn set_state(&mut self, state: u16) {
        self.s_state = state.to_le();
    }

    pub fn errors_behaviour(&self) -> u16 {
        u16::from_le(self.s_errors)
    }

    pub fn mnt_count(&self) -> u16 {
        u16::from_le(self.s_mnt_count)
    }

    pub fn set_mnt_count(&mut self, count: u16) {
        self.s_mnt_count = count.to_le();
    }

    pub fn lastcheck(&self) -> u32 {
        u32::from_le(self.s_lastcheck)
    }

    pub fn checkinterval(&self) -> u32 {
        u32::from_le(self.s_checkinterval)
    }

    pub fn set_mtime(&mut self, ts: u32) {
        self.s_mtime = ts.to_le();
    }

    pub fn set_wtime(&mut self, ts: u32) {
        self.s_wtime = ts.to_le();
    }

    pub fn set_free_blocks_count(&mut self, count: u32) {
        self.s_free_blocks_count = count.to_le();
    }

    pub fn set_free_inodes_count(&mut self, count: u32) {
        self.s_free_inodes_count = count.to_le();
    }

    /// Whether any (compat, incompat or ro-compat) feature bit is set.
    pub fn has_feature_bits(&self) -> bool {
        self.s_feature_compat != 0 || self.s_feature_incompat != 0 || self.s_feature_ro_compat != 0
    }

    /// Size of an on-disk inode record in bytes.
    pub fn inode_size(&self) -> u16 {
        if self.rev_level() >= 1 {
            u16::from_le(self.s_inode_size)
        } else {
            GOOD_OLD_INODE_SIZE
        }
    }

    /// First inode number available for regular allocation.
    pub fn first_ino(&self) -> u32 {
        if self.rev_level() >= 1 {
            u32::from_le(self.s_first_ino)
        } else {
            GOOD_OLD_FIRST_INO
        }
    }

    /// Filesystem id: the two halves of the UUID folded together.
    pub fn fsid(&self) -> u64 {
        let lo = u64::from_le_bytes(self.s_uuid[..8].try_into().unwrap_or([0; 8]));
        let hi = u64::from_le_bytes(self.s_uuid[8..].try_into().unwrap_or([0; 8]));
        lo ^ hi
    }
}

/// Geometry derived from a validated superblock, computed once at mount.
#[derive(Clone, Copy, Debug)]
pub struct Sbi {
    pub block_size: u32,
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub first_data_block: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub first_ino: u32,
    /// Number of block groups.
    pub groups_count: u32,
    /// Group descriptors per descriptor-table block.
    pub desc_per_block: u32,
    /// Blocks occupied by the group descriptor table.
    pub gdb_count: u32,
    /// Inode records per inode-table block.
    pub inodes_per_block: u32,
    /// Blocks occupied by one group's inode table.
    pub itb_per_group: u32,
    /// Device block holding the primary superblock.
    pub sb_block: u32,
    /// Byte offset of the superblock inside that block.
    pub sb_offset: usize,
}

impl Sbi {
    /// Derives the mount geometry from `sb`.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Corrupt`] when the geometry is degenerate (zero
    /// group sizes, inode records larger than a block, bitmaps that would
    /// not fit in one block).
    pub fn new(sb: &RawSuperblock) -> FsResult<Self> {
        let block_size = sb.block_size();
        let blocks_per_group = sb.blocks_per_group();
        let inodes_per_group = sb.inodes_per_group();
        let inode_size = sb.inode_size();

        if blocks_per_group == 0 || inodes_per_group == 0 {
            return Err(FsError::Corrupt);
        }
        // Each bitmap must fit in a single block.
        if blocks_per_group > block_size * 8 || inodes_per_group > block_size * 8 {
            return Err(FsError::Corrupt);
        }

        let inodes_per_block = block_size / u32::from(inode_size);
        if inodes_per_block == 0 {
            return Err(FsError::Corrupt);
        }

        let blocks_count = sb.blocks_count();
        let first_data_block = sb.first_data_block();
        if first_data_block >= blocks_count {
            return Err(FsError::Corrupt);
        }

        let groups_count = (blocks_count - first_data_block - 1) / blocks_per_group + 1;
        let desc_per_block = block_size / DESC_SIZE;
        let gdb_count = groups_count.div_ceil(desc_per_block);
        let itb_per_group = inodes_per_group.div_ceil(inodes_per_block);

        if inodes_per_group > u32::from(u16::MAX) || blocks_per_group > u32::from(u16::MAX) {
            return Err(FsError::Corrupt);
        }

        Ok(Self {
            block_size,
            blocks_count,
            inodes_count: sb.inodes_count(),
            first_data_block,
            blocks_per_group,
            inodes_per_group,
            inode_size,
            first_ino: sb.first_ino(),
            groups_count,
            desc_per_block,
            gdb_count,
            inodes_per_block,
            itb_per_group,
            sb_block: (SUPERBLOCK_OFFSET / u64::from(block_size)) as u32,
            sb_offset: (SUPERBLOCK_OFFSET % u64::from(block_size)) as usize,
        })
    }

    /// First block belonging to group `group`.
    pub fn group_first_block(&self, group: u32) -> u32 {
        self.first_data_block + group * self.blocks_per_group
    }

    /// Last block belonging to group `group`.
    pub fn group_last_block(&self, group: u32) -> u32 {
        let end = self.group_first_block(group) + self.blocks_per_group - 1;
        end.min(self.blocks_count - 1)
    }

    /// Number of blocks actually present in group `group` (the last group
    /// may be partial).
    pub fn group_block_span(&self, group: u32) -> u32 {
        self.group_last_block(group) - self.group_first_block(group) + 1
    }

    /// Highest byte offset addressable through the direct block pointers.
    pub fn max_file_size(&self) -> u64 {
        u64::from(self.block_size) * super::inode::EXT2_NDIR_BLOCKS as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    fn sample_sb() -> RawSuperblock {
        let mut sb = RawSuperblock::zeroed();
        sb.s_magic = EXT2_MAGIC.to_le();
        sb.s_log_block_size = 0u32.to_le();
        sb.s_blocks_count = 8192u32.to_le();
        sb.s_inodes_count = 2048u32.to_le();
        sb.s_first_data_block = 1u32.to_le();
        sb.s_blocks_per_group = 8192u32.to_le();
        sb.s_inodes_per_group = 2048u32.to_le();
        sb.s_rev_level = 1u32.to_le();
        sb.s_inode_size = 128u16.to_le();
        sb.s_first_ino = 11u32.to_le();
        sb
    }

    #[test]
    fn record_is_exactly_one_kibibyte() {
        assert_eq!(size_of::<RawSuperblock>(), 1024);
    }

    #[test]
    fn geometry_for_a_single_group_image() {
        let sb = sample_sb();
        assert!(sb.magic_valid());

        let sbi = Sbi::new(&sb).unwrap();
        assert_eq!(sbi.block_size, 1024);
        assert_eq!(sbi.groups_count, 1);
        assert_eq!(sbi.desc_per_block, 32);
        assert_eq!(sbi.gdb_count, 1);
        assert_eq!(sbi.inodes_per_block, 8);
        assert_eq!(sbi.itb_per_group, 256);
        assert_eq!(sbi.sb_block, 1);
        assert_eq!(sbi.sb_offset, 0);
        assert_eq!(sbi.group_first_block(0), 1);
        assert_eq!(sbi.group_last_block(0), 8191);
        assert_eq!(sbi.group_block_span(0), 8191);
        assert_eq!(sbi.max_file_size(), 12 * 1024);
    }

    #[test]
    fn four_kib_blocks_place_the_superblock_inside_block_zero() {
        let mut sb = sample_sb();
        sb.s_log_block_size = 2u32.to_le();
        sb.s_first_data_block = 0u32.to_le();
        sb.s_blocks_per_group = 4096u32.to_le();

        let sbi = Sbi::new(&sb).unwrap();
        assert_eq!(sbi.block_size, 4096);
        assert_eq!(sbi.sb_block, 0);
        assert_eq!(sbi.sb_offset, 1024);
    }

    #[test]
    fn degenerate_geometry_is_rejected() {
        let mut sb = sample_sb();
        sb.s_blocks_per_group = 0u32.to_le();
        assert_eq!(Sbi::new(&sb).unwrap_err(), FsError::Corrupt);

        let mut sb = sample_sb();
        // Bitmap would not fit in one block.
        sb.s_blocks_per_group = (1024 * 8 + 1u32).to_le();
        assert_eq!(Sbi::new(&sb).unwrap_err(), FsError::Corrupt);
    }

    #[test]
    fn revision_zero_forces_defaults() {
        let mut sb = sample_sb();
        sb.s_rev_level = GOOD_OLD_REV.to_le();
        sb.s_inode_size = 256u16.to_le();
        sb.s_first_ino = 42u32.to_le();
        assert_eq!(sb.inode_size(), GOOD_OLD_INODE_SIZE);
        assert_eq!(sb.first_ino(), GOOD_OLD_FIRST_INO);
    }
}
