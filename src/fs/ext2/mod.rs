//! Read/write ext2-lite filesystem core.
//!
//! The implementation is split the same way the on-disk format is:
//! - [`sb`]: superblock record and mount geometry
//! - [`block_grp`]: group descriptor table
//! - [`bitmap`]: bit operations over cached bitmap blocks
//! - [`balloc`]/[`ialloc`]: block and inode allocators
//! - [`inode`]: inode table access, block mapping, truncation
//! - [`dir`]: directory record store and namespace operations
//! - [`file`]: file content access and symlink targets
//! - [`mkfs`]: fresh image creation
//!
//! [`Ext2Fs`] ties these together: it owns the buffer cache, the in-memory
//! inode cache, the global free counters and the mount state, and routes
//! corruption reports through the configured error policy.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use hashbrown::HashMap;
use spin::Mutex;

use crate::errors::{CanFail, FsError, FsResult};
use crate::fs::Clock;
use crate::io::cache::{Buffer, BufferCache};
use crate::io::BlockDevice;

pub(crate) mod balloc;
pub(crate) mod bitmap;
pub mod block_grp;
#[cfg(test)]
mod fs_tests;
pub(crate) mod ialloc;
pub mod dir;
pub mod file;
pub mod inode;
pub mod mkfs;
pub mod sb;

pub use dir::Ext2Directory;
pub use file::Ext2File;

use block_grp::Groups;
use inode::{InodeRef, InodeState};
use sb::{RawSuperblock, Sbi, SUPERBLOCK_OFFSET};

/// Mount flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MountFlags(u32);

impl MountFlags {
    /// Empty flag set.
    pub const EMPTY: Self = Self(0);

    /// Mount read-only: every mutating operation fails with `ReadOnly`.
    pub const RDONLY: Self = Self(0x1);

    /// Synchronous mount: bitmap, inode-table and directory mutations flush
    /// their buffers before returning.
    pub const SYNCHRONOUS: Self = Self(0x2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for MountFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for MountFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// What to do when on-disk corruption is detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorsBehaviour {
    /// Log the error and keep running.
    Continue,
    /// Force the mount read-only.
    RemountRo,
    /// Abort.
    Panic,
}

/// Parsed mount options.
#[derive(Clone, Copy, Debug)]
pub struct MountOptions {
    pub errors: ErrorsBehaviour,
    /// Verbose trace output.
    pub debug: bool,
}

impl MountOptions {
    /// Parses a comma-separated option string, starting from `defaults`
    /// (usually derived from the superblock's `s_errors` field).
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Invalid`] on an unknown option.
    pub fn parse(options: &str, defaults: MountOptions) -> FsResult<Self> {
        let mut opts = defaults;
        for token in options.split(',') {
            match token {
                "" => {}
                "errors=continue" => opts.errors = ErrorsBehaviour::Continue,
                "errors=remount-ro" => opts.errors = ErrorsBehaviour::RemountRo,
                "errors=panic" => opts.errors = ErrorsBehaviour::Panic,
                "debug" => opts.debug = true,
                _ => return Err(FsError::Invalid),
            }
        }
        Ok(opts)
    }

    fn defaults_from(sb: &RawSuperblock) -> MountOptions {
        let errors = match sb.errors_behaviour() {
            sb::ERRORS_PANIC => ErrorsBehaviour::Panic,
            sb::ERRORS_CONTINUE => ErrorsBehaviour::Continue,
            _ => ErrorsBehaviour::RemountRo,
        };
        MountOptions {
            errors,
            debug: false,
        }
    }
}

const COUNTER_SHARDS: usize = 8;

/// Striped counter: writers spread over the shards, readers sum them.
///
/// The sum is exact whenever it does not race a concurrent update, which is
/// the reconciliation discipline used at `statfs`/`sync_fs` time (both run
/// under the superblock lock).
pub(crate) struct ShardedCounter {
    shards: [AtomicI64; COUNTER_SHARDS],
    cursor: AtomicUsize,
}

impl ShardedCounter {
    pub(crate) fn new(initial: i64) -> Self {
        let counter = Self {
            shards: Default::default(),
            cursor: AtomicUsize::new(0),
        };
        counter.shards[0].store(initial, Ordering::Relaxed);
        counter
    }

    pub(crate) fn add(&self, delta: i64) {
        let shard = self.cursor.fetch_add(1, Ordering::Relaxed) % COUNTER_SHARDS;
        self.shards[shard].fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn sum(&self) -> i64 {
        self.shards.iter().map(|s| s.load(Ordering::Relaxed)).sum()
    }

    /// Folds the counter back to an exactly known value.
    pub(crate) fn reconcile(&self, exact: i64) {
        let current = self.sum();
        if current != exact {
            self.shards[0].fetch_add(exact - current, Ordering::Relaxed);
        }
    }
}

/// Mutable superblock state, guarded by the superblock spin lock.
struct SbState {
    /// The on-disk superblock record, kept in disk byte order.
    sb: RawSuperblock,
    opts: MountOptions,
    flags: MountFlags,
    /// `s_state` as read at mount, plus any error bits raised since. This is
    /// what gets written back at unmount.
    mount_state: u16,
    /// Cached `statfs` overhead (metadata blocks), constant per geometry.
    overhead: Option<u64>,
}

/// Values reported by `statfs`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Statfs {
    pub block_size: u32,
    /// Data capacity: total blocks minus filesystem overhead.
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub namelen: u32,
    pub fsid: u64,
}

/// An instance of the ext2-lite filesystem.
pub struct Ext2Fs {
    pub(crate) cache: BufferCache,
    /// Pinned buffer holding the primary superblock.
    sbuf: Arc<Buffer>,
    pub(crate) sbi: Sbi,
    pub(crate) groups: Groups,
    state: Mutex<SbState>,
    pub(crate) free_blocks: ShardedCounter,
    pub(crate) free_inodes: ShardedCounter,
    pub(crate) dirs_count: ShardedCounter,
    pub(crate) icache: Mutex<HashMap<u32, InodeRef>>,
    clock: Arc<dyn Clock>,
}

impl Ext2Fs {
    /// Probes `dev` for an ext2 superblock.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] if the device cannot be read.
    pub fn detect(dev: &Arc<dyn BlockDevice>) -> FsResult<bool> {
        let mut raw = vec![0u8; core::mem::size_of::<RawSuperblock>()];
        dev.read_at(SUPERBLOCK_OFFSET, &mut raw)?;
        let sb: RawSuperblock = bytemuck::pod_read_unaligned(&raw);
        Ok(sb.magic_valid())
    }

    /// Mounts the filesystem found on `dev`.
    ///
    /// `options` is a comma-separated option string (see [`MountOptions`]);
    /// `clock` provides inode and superblock timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Invalid`] when no valid ext2 filesystem is found
    /// or it carries feature bits, [`FsError::Corrupt`] when descriptors or
    /// the root inode fail validation, [`FsError::Io`] on device errors.
    pub fn mount(
        dev: Arc<dyn BlockDevice>,
        options: &str,
        mut flags: MountFlags,
        clock: Arc<dyn Clock>,
    ) -> FsResult<Arc<Self>> {
        // First probe with the minimal block size; re-read below once the
        // real block size is known.
        let mut raw = vec![0u8; core::mem::size_of::<RawSuperblock>()];
        dev.read_at(SUPERBLOCK_OFFSET, &mut raw)?;
        let probe: RawSuperblock = bytemuck::pod_read_unaligned(&raw);

        if !probe.magic_valid() {
            log::error!("ext2: mount: can't find an ext2 filesystem on this device");
            return Err(FsError::Invalid);
        }

        let opts = MountOptions::parse(options, MountOptions::defaults_from(&probe))?;

        if probe.has_feature_bits() {
            log::error!("ext2: mount: couldn't mount because of unsupported features");
            return Err(FsError::Invalid);
        }
        if probe.rev_level() >= 1 {
            let inode_size = u16::from_le(probe.s_inode_size);
            if inode_size < sb::GOOD_OLD_INODE_SIZE
                || !inode_size.is_power_of_two()
                || u32::from(inode_size) > probe.block_size()
            {
                log::error!("ext2: mount: unsupported inode size: {inode_size}");
                return Err(FsError::Invalid);
            }
        }
        if probe.rev_level() > sb::MAX_SUPP_REV {
            log::error!("ext2: mount: revision level too high, forcing read-only mode");
            flags |= MountFlags::RDONLY;
        }

        let sbi = Sbi::new(&probe)?;

        // Re-read the superblock at the chosen block size, through the
        // cache, so a pinned buffer backs later write-backs.
        let cache = BufferCache::new(dev, sbi.block_size);
        let sbuf = cache.get(sbi.sb_block)?;
        let sb: RawSuperblock = {
            let data = sbuf.read();
            bytemuck::pod_read_unaligned(&data[sbi.sb_offset..sbi.sb_offset + 1024])
        };
        if !sb.magic_valid() {
            log::error!("ext2: mount: magic mismatch on second superblock read");
            return Err(FsError::Invalid);
        }

        let groups = Groups::load(&cache, &sbi)?;
        if let Err(group) = groups.check_descriptors(&sbi) {
            log::error!("ext2: mount: group descriptors corrupted (group {group})");
            return Err(FsError::Corrupt);
        }

        let mount_state = sb.state();
        let fs = Arc::new(Self {
            cache,
            sbuf,
            sbi,
            state: Mutex::new(SbState {
                sb,
                opts,
                flags,
                mount_state,
                overhead: None,
            }),
            free_blocks: ShardedCounter::new(0),
            free_inodes: ShardedCounter::new(0),
            dirs_count: ShardedCounter::new(0),
            groups,
            icache: Mutex::new(HashMap::new()),
            clock,
        });

        fs.free_blocks.reconcile(fs.count_free_blocks() as i64);
        fs.free_inodes.reconcile(fs.count_free_inodes() as i64);
        fs.dirs_count.reconcile(fs.count_dirs() as i64);

        fs.check_super(mount_state);

        // Make sure the root inode looks sane before handing the mount out.
        let root = fs.iget(sb::ROOT_INO)?;
        {
            let root = root.read();
            if root.file_type() != Some(crate::fs::FileType::Directory)
                || root.blocks == 0
                || root.size == 0
            {
                log::error!("ext2: mount: corrupt root inode, run e2fsck");
                return Err(FsError::Corrupt);
            }
        }

        {
            let mut state = fs.state.lock();
            let now = fs.clock.now();
            let count = state.sb.mnt_count();
            state.sb.set_mnt_count(count.wrapping_add(1));
            state.sb.set_mtime(now);
        }
        if !fs.is_read_only() {
            fs.sync_fs(true)?;
        }

        if opts.debug {
            log::debug!(
                "ext2: mounted: bs={}, gc={}, bpg={}, ipg={}",
                fs.sbi.block_size,
                fs.sbi.groups_count,
                fs.sbi.blocks_per_group,
                fs.sbi.inodes_per_group
            );
        }

        Ok(fs)
    }

    /// Logs the fsck-related warnings the original mount path emits.
    fn check_super(&self, mount_state: u16) {
        if self.is_read_only() {
            return;
        }
        let (lastcheck, checkinterval) = {
            let state = self.state.lock();
            (state.sb.lastcheck(), state.sb.checkinterval())
        };
        if mount_state & sb::STATE_VALID_FS == 0 {
            log::warn!("ext2: mounting unchecked fs, running e2fsck is recommended");
        } else if mount_state & sb::STATE_ERROR_FS != 0 {
            log::warn!("ext2: mounting fs with errors, running e2fsck is recommended");
        } else if checkinterval != 0 && lastcheck.wrapping_add(checkinterval) <= self.now() {
            log::warn!("ext2: checktime reached, running e2fsck is recommended");
        }
    }

    /// Returns a handle on the root directory inode.
    ///
    /// # Errors
    ///
    /// Propagates [`FsError::Io`]/[`FsError::Corrupt`] from the inode read.
    pub fn root(self: &Arc<Self>) -> FsResult<InodeRef> {
        self.iget(sb::ROOT_INO)
    }

    pub(crate) fn now(&self) -> u32 {
        self.clock.now()
    }

    pub fn is_read_only(&self) -> bool {
        self.state.lock().flags.contains(MountFlags::RDONLY)
    }

    pub(crate) fn is_sync(&self) -> bool {
        self.state.lock().flags.contains(MountFlags::SYNCHRONOUS)
    }

    pub(crate) fn debug_enabled(&self) -> bool {
        self.state.lock().opts.debug
    }

    /// Fails mutating operations on read-only mounts.
    pub(crate) fn check_writable(&self) -> CanFail<FsError> {
        if self.is_read_only() {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Records an on-disk inconsistency and routes it through the configured
    /// error policy.
    ///
    /// Must not be called with a group lock held: the policy path takes the
    /// superblock lock, which nests outside group locks.
    pub(crate) fn report_error(&self, context: &str, args: fmt::Arguments<'_>) {
        log::error!("ext2: error: {context}: {args}");

        let (behaviour, was_writable) = {
            let mut state = self.state.lock();
            let was_writable = !state.flags.contains(MountFlags::RDONLY);
            if was_writable {
                state.mount_state |= sb::STATE_ERROR_FS;
                let with_error = state.sb.state() | sb::STATE_ERROR_FS;
                state.sb.set_state(with_error);
            }
            (state.opts.errors, was_writable)
        };

        if was_writable {
            // Persist the error flag before acting on it, best effort.
            let _ = self.sync_super(true);
        }

        match behaviour {
            ErrorsBehaviour::Panic => {
                panic!("ext2: panic forced after error");
            }
            ErrorsBehaviour::RemountRo => {
                let mut state = self.state.lock();
                if !state.flags.contains(MountFlags::RDONLY) {
                    log::error!("ext2: error: remounting filesystem read-only");
                    state.flags |= MountFlags::RDONLY;
                }
            }
            ErrorsBehaviour::Continue => {}
        }
    }

    /// Writes the superblock record back to its pinned buffer, recomputing
    /// the free counters; flushes the buffer when `wait` is set.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] when the flush fails.
    pub fn sync_super(&self, wait: bool) -> CanFail<FsError> {
        {
            let mut state = self.state.lock();
            let free_blocks = self.count_free_blocks();
            let free_inodes = self.count_free_inodes();
            state.sb.set_free_blocks_count(free_blocks as u32);
            state.sb.set_free_inodes_count(free_inodes as u32);
            let now = self.now();
            state.sb.set_wtime(now);
            self.free_blocks.reconcile(free_blocks as i64);
            self.free_inodes.reconcile(free_inodes as i64);

            let mut data = self.sbuf.write();
            let offset = self.sbi.sb_offset;
            data[offset..offset + 1024].copy_from_slice(bytemuck::bytes_of(&state.sb));
        }
        self.sbuf.mark_dirty();

        if wait {
            self.cache.write_buffer(&self.sbuf)?;
        }
        Ok(())
    }

    /// Writes back dirty inodes and the superblock; with `wait`, flushes
    /// every dirty buffer to the device.
    ///
    /// Clears the `VALID_FS` flag in the on-disk record on a writable
    /// mount: without a journal, a mounted filesystem is dirty by
    /// definition until cleanly unmounted.
    ///
    /// # Errors
    ///
    /// Returns the first I/O error encountered.
    pub fn sync_fs(&self, wait: bool) -> CanFail<FsError> {
        let inodes: Vec<InodeRef> = self.icache.lock().values().cloned().collect();
        for inode in inodes {
            let mut inode = inode.write();
            // `New` inodes have never reached their table slot; `Dirty` ones
            // have stale slots. Both need a write-back.
            if inode.state != InodeState::Loaded {
                self.do_write_inode(&mut inode, false)?;
            }
        }

        {
            let mut state = self.state.lock();
            let current = state.sb.state();
            if current & sb::STATE_VALID_FS != 0 {
                state.sb.set_state(current & !sb::STATE_VALID_FS);
            }
        }
        self.sync_super(wait)?;

        if wait {
            self.cache.sync()?;
        }
        Ok(())
    }

    /// Cleanly detaches the filesystem: syncs everything and restores the
    /// state field (including `VALID_FS` if the run was error-free).
    ///
    /// # Errors
    ///
    /// Returns the first I/O error encountered; the filesystem may be left
    /// partially synced.
    pub fn unmount(&self) -> CanFail<FsError> {
        if !self.is_read_only() {
            self.sync_fs(true)?;
            {
                let mut state = self.state.lock();
                let mount_state = state.mount_state;
                state.sb.set_state(mount_state);
                let mut data = self.sbuf.write();
                let offset = self.sbi.sb_offset;
                data[offset..offset + 1024].copy_from_slice(bytemuck::bytes_of(&state.sb));
            }
            self.sbuf.mark_dirty();
            self.cache.write_buffer(&self.sbuf)?;
        }
        Ok(())
    }

    /// Reports filesystem capacity and usage.
    pub fn statfs(&self) -> Statfs {
        let mut state = self.state.lock();

        let overhead = *state.overhead.get_or_insert_with(|| {
            // All blocks before the first data block, plus, per group, the
            // superblock backup, the descriptor-table backup, both bitmaps
            // and the inode table.
            let mut overhead = u64::from(self.sbi.first_data_block);
            for group in 0..self.sbi.groups_count {
                overhead += u64::from(self.bg_has_super(group) as u32)
                    + self.bg_num_gdb(group) as u64
                    + 2
                    + u64::from(self.sbi.itb_per_group);
            }
            overhead
        });

        let bfree = self.count_free_blocks();
        let ffree = self.count_free_inodes();
        state.sb.set_free_blocks_count(bfree as u32);
        state.sb.set_free_inodes_count(ffree as u32);
        self.free_blocks.reconcile(bfree as i64);
        self.free_inodes.reconcile(ffree as i64);

        Statfs {
            block_size: self.sbi.block_size,
            blocks: u64::from(self.sbi.blocks_count) - overhead,
            bfree,
            bavail: bfree,
            files: u64::from(self.sbi.inodes_count),
            ffree,
            namelen: sb::NAME_MAX as u32,
            fsid: state.sb.fsid(),
        }
    }

    /// Whether group `group` carries a superblock backup. Always true in
    /// this variant (no sparse-superblock support).
    pub fn bg_has_super(&self, _group: u32) -> bool {
        true
    }

    /// Number of descriptor-table blocks in group `group`.
    pub fn bg_num_gdb(&self, group: u32) -> u32 {
        if self.bg_has_super(group) {
            self.sbi.gdb_count
        } else {
            0
        }
    }

    /// Changes mount flags and options on a live mount.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Invalid`] on a malformed option string, I/O
    /// errors from the entailed sync.
    pub fn remount(&self, flags: MountFlags, options: &str) -> CanFail<FsError> {
        let defaults = {
            let state = self.state.lock();
            state.opts
        };
        let new_opts = MountOptions::parse(options, defaults)?;

        let was_ro = self.is_read_only();
        if !was_ro {
            self.sync_fs(true)?;
        }
        let want_ro = flags.contains(MountFlags::RDONLY);
        if want_ro == was_ro {
            let mut state = self.state.lock();
            state.opts = new_opts;
            state.flags = flags | if was_ro { MountFlags::RDONLY } else { MountFlags::EMPTY };
            return Ok(());
        }

        if want_ro {
            // Going read-only: persist the current state so the filesystem
            // is marked valid again if the run was clean.
            {
                let mut state = self.state.lock();
                let mount_state = state.mount_state;
                state.sb.set_state(mount_state);
                let now = self.now();
                state.sb.set_mtime(now);
                state.flags = flags;
                state.opts = new_opts;
            }
            self.sync_super(true)?;
        } else {
            // Going read-write: re-read the state from the record (an fsck
            // may have updated it while we were read-only) and re-validate.
            let mount_state = {
                let mut state = self.state.lock();
                state.mount_state = state.sb.state();
                state.flags = flags;
                state.opts = new_opts;
                state.mount_state
            };
            self.check_super(mount_state);
            self.sync_fs(true)?;
        }
        Ok(())
    }

    /// Renders the active mount options, in the order the original driver
    /// reports them.
    pub fn show_options(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        match state.opts.errors {
            ErrorsBehaviour::RemountRo => {
                let def = state.sb.errors_behaviour();
                if def == sb::ERRORS_PANIC || def == sb::ERRORS_CONTINUE {
                    out.push_str(",errors=remount-ro");
                }
            }
            ErrorsBehaviour::Continue => out.push_str(",errors=continue"),
            ErrorsBehaviour::Panic => out.push_str(",errors=panic"),
        }
        if state.opts.debug {
            out.push_str(",debug");
        }
        out
    }
}

impl Drop for Ext2Fs {
    fn drop(&mut self) {
        // Detaching without an explicit unmount still leaves a consistent
        // image behind, best effort.
        let _ = self.unmount();
    }
}

/// Routes a corruption report through the mount's error policy.
macro_rules! ext2_error {
    ($fs:expr, $ctx:expr, $($arg:tt)*) => {
        $fs.report_error($ctx, format_args!($($arg)*))
    };
}
pub(crate) use ext2_error;

/// Trace output, enabled by the `debug` mount option.
macro_rules! ext2_debug {
    ($fs:expr, $($arg:tt)*) => {
        if $fs.debug_enabled() {
            log::debug!("ext2: {}", format_args!($($arg)*));
        }
    };
}
pub(crate) use ext2_debug;

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> MountOptions {
        MountOptions {
            errors: ErrorsBehaviour::RemountRo,
            debug: false,
        }
    }

    #[test]
    fn option_parsing_overrides_defaults() {
        let opts = MountOptions::parse("errors=panic,debug", defaults()).unwrap();
        assert_eq!(opts.errors, ErrorsBehaviour::Panic);
        assert!(opts.debug);

        let opts = MountOptions::parse("", defaults()).unwrap();
        assert_eq!(opts.errors, ErrorsBehaviour::RemountRo);
        assert!(!opts.debug);

        let opts = MountOptions::parse("errors=continue", defaults()).unwrap();
        assert_eq!(opts.errors, ErrorsBehaviour::Continue);
    }

    #[test]
    fn unknown_options_are_rejected() {
        assert_eq!(
            MountOptions::parse("acl", defaults()).unwrap_err(),
            FsError::Invalid
        );
        assert_eq!(
            MountOptions::parse("errors=ignore", defaults()).unwrap_err(),
            FsError::Invalid
        );
    }

    #[test]
    fn sharded_counter_sums_exactly() {
        let counter = ShardedCounter::new(100);
        for _ in 0..17 {
            counter.add(-2);
        }
        for _ in 0..5 {
            counter.add(3);
        }
        assert_eq!(counter.sum(), 100 - 34 + 15);

        counter.reconcile(42);
        assert_eq!(counter.sum(), 42);
    }

    #[test]
    fn mount_flags_compose() {
        let flags = MountFlags::RDONLY | MountFlags::SYNCHRONOUS;
        assert!(flags.contains(MountFlags::RDONLY));
        assert!(flags.contains(MountFlags::SYNCHRONOUS));
        assert!(!MountFlags::EMPTY.contains(MountFlags::RDONLY));
    }
}
