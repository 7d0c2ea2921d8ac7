//! Read/write implementation of a simplified second extended filesystem.
//!
//! The filesystem divides a block device into block groups, each carrying a
//! block bitmap, an inode bitmap, an inode table and data blocks. A single
//! superblock at a fixed offset describes the overall geometry, and a group
//! descriptor table locates the per-group structures.
//!
//! Only direct block pointers are supported (12 per inode), which bounds the
//! maximum file size to `12 * block_size`. There is no journal, no extended
//! attributes and no feature negotiation: the on-disk format is plain ext2
//! revision 0/1 with zero feature bits.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod errors;
pub mod fs;
pub mod io;
