//! Storage device access.
//!
//! The filesystem reads and writes its backing store through the
//! [`BlockDevice`] contract, and caches device blocks in pinned, lockable
//! buffers (see [`cache`]). [`MemDisk`] provides a RAM-backed device, mainly
//! for tests and image manipulation.

use alloc::vec;
use alloc::vec::Vec;
use spin::RwLock;

use crate::errors::{CanFail, FsError};

pub mod cache;

/// A byte-addressable storage device.
///
/// Offsets are absolute device offsets in bytes. Implementations must be
/// safe to call from multiple threads; the filesystem serialises access to
/// any given block through its buffer cache, but distinct blocks are read
/// and written concurrently.
pub trait BlockDevice: Send + Sync {
    /// Total size of the device in bytes.
    fn size(&self) -> u64;

    /// Reads `buf.len()` bytes starting at byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] if the range is out of bounds or the transfer
    /// fails.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> CanFail<FsError>;

    /// Writes `buf` starting at byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] if the range is out of bounds or the transfer
    /// fails.
    fn write_at(&self, offset: u64, buf: &[u8]) -> CanFail<FsError>;
}

/// A RAM-backed [`BlockDevice`].
pub struct MemDisk {
    data: RwLock<Vec<u8>>,
}

impl MemDisk {
    /// Creates a zero-filled device of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; len]),
        }
    }

    /// Wraps an existing image.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Returns a copy of the whole image.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl BlockDevice for MemDisk {
    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> CanFail<FsError> {
        let data = self.data.read();
        let start = usize::try_from(offset).map_err(|_| FsError::Io)?;
        let end = start.checked_add(buf.len()).ok_or(FsError::Io)?;

        if end > data.len() {
            return Err(FsError::Io);
        }

        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> CanFail<FsError> {
        let mut data = self.data.write();
        let start = usize::try_from(offset).map_err(|_| FsError::Io)?;
        let end = start.checked_add(buf.len()).ok_or(FsError::Io)?;

        if end > data.len() {
            return Err(FsError::Io);
        }

        data[start..end].copy_from_slice(buf);
        Ok(())
    }
}
