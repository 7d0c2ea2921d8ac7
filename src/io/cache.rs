//! Block buffer cache.
//!
//! Every filesystem block read goes through [`BufferCache::get`], which
//! returns a pinned ([`alloc::sync::Arc`]) and lockable ([`spin::RwLock`])
//! [`Buffer`] keyed by block number. Buffers are held for the lifetime of
//! the mount: a validation flag set on a buffer (see [`Buffer::set_checked`])
//! therefore stays meaningful until unmount.
//!
//! Dirty buffers are written back by [`BufferCache::sync`], or eagerly by
//! [`BufferCache::write_buffer`] on synchronous mounts.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use hashbrown::HashMap;
use spin::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::errors::{CanFail, FsError, FsResult};
use crate::io::BlockDevice;

/// A single cached device block.
pub struct Buffer {
    block_no: u32,
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
    checked: AtomicBool,
}

impl Buffer {
    /// Number of the device block held by this buffer.
    pub fn block_no(&self) -> u32 {
        self.block_no
    }

    /// Locks the buffer contents for shared reading.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Locks the buffer contents for exclusive modification.
    ///
    /// The caller is responsible for calling [`Buffer::mark_dirty`] once the
    /// contents have actually changed.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    /// Flags the buffer as out of sync with the device.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Whether the buffer holds modifications not yet written back.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Whether the buffer contents already passed structure validation.
    pub fn is_checked(&self) -> bool {
        self.checked.load(Ordering::Acquire)
    }

    /// Records that the buffer contents passed structure validation.
    pub fn set_checked(&self) {
        self.checked.store(true, Ordering::Release);
    }
}

/// Cache of device blocks, keyed by block number.
pub struct BufferCache {
    dev: Arc<dyn BlockDevice>,
    block_size: u32,
    buffers: Mutex<HashMap<u32, Arc<Buffer>>>,
}

impl BufferCache {
    /// Creates an empty cache reading `block_size`-sized blocks from `dev`.
    pub fn new(dev: Arc<dyn BlockDevice>, block_size: u32) -> Self {
        Self {
            dev,
            block_size,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Size in bytes of the blocks managed by this cache.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Returns the buffer for `block_no`, reading it from the device on a
    /// cache miss.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] if the device read fails.
    pub fn get(&self, block_no: u32) -> FsResult<Arc<Buffer>> {
        if let Some(buffer) = self.buffers.lock().get(&block_no) {
            return Ok(buffer.clone());
        }

        // The device read happens outside the map lock so that misses on
        // distinct blocks do not serialise each other.
        let mut data = vec![0u8; self.block_size as usize];
        self.dev
            .read_at(u64::from(block_no) * u64::from(self.block_size), &mut data)?;

        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(block_no).or_insert_with(|| {
            Arc::new(Buffer {
                block_no,
                data: RwLock::new(data.into_boxed_slice()),
                dirty: AtomicBool::new(false),
                checked: AtomicBool::new(false),
            })
        });

        Ok(buffer.clone())
    }

    /// Writes a buffer's contents to the device and clears its dirty flag.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] if the device write fails; the dirty flag is
    /// left set in that case.
    pub fn write_buffer(&self, buffer: &Buffer) -> CanFail<FsError> {
        let data = buffer.read();
        self.dev.write_at(
            u64::from(buffer.block_no) * u64::from(self.block_size),
            &data,
        )?;
        buffer.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Writes back every dirty buffer.
    ///
    /// # Errors
    ///
    /// Returns the first device error encountered; remaining dirty buffers
    /// keep their flag.
    pub fn sync(&self) -> CanFail<FsError> {
        let dirty: Vec<Arc<Buffer>> = self
            .buffers
            .lock()
            .values()
            .filter(|b| b.is_dirty())
            .cloned()
            .collect();

        for buffer in dirty {
            self.write_buffer(&buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemDisk;

    #[test]
    fn cache_returns_pinned_buffers() {
        let disk = Arc::new(MemDisk::new(8192));
        disk.write_at(2048, &[7u8; 1024]).unwrap();

        let cache = BufferCache::new(disk, 1024);
        let a = cache.get(2).unwrap();
        let b = cache.get(2).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.read()[0], 7);
    }

    #[test]
    fn dirty_buffers_reach_the_device_on_sync() {
        let disk = Arc::new(MemDisk::new(8192));
        let cache = BufferCache::new(disk.clone(), 1024);

        let buffer = cache.get(3).unwrap();
        buffer.write()[0] = 0x5A;
        buffer.mark_dirty();

        let mut probe = [0u8; 1];
        disk.read_at(3 * 1024, &mut probe).unwrap();
        assert_eq!(probe[0], 0);

        cache.sync().unwrap();
        assert!(!buffer.is_dirty());
        disk.read_at(3 * 1024, &mut probe).unwrap();
        assert_eq!(probe[0], 0x5A);
    }
}
