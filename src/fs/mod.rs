//! File-system related code.
//!
//! Contains the ext2-lite implementation along with the small set of
//! filesystem-independent abstractions it is written against: the
//! [`FsFile`] and [`FsDirectory`] traits, the [`Clock`] time source and the
//! attribute structures exchanged with callers.

use alloc::vec::Vec;

use crate::errors::FsResult;

pub mod ext2;

/// `Seek` provides a way to move the internal cursor of a file, or to
/// retrieve the current position of the cursor using `Seek::Current`.
pub enum Seek {
    /// Moves the cursor backwards of the provided number of bytes.
    Backward(usize),

    /// Does not move the cursor, used to retrieve the current position.
    Current,

    /// Moves the cursor forward of the provided number of bytes.
    Forward(usize),
}

/// Source of wall-clock time, injected at mount.
///
/// The core stamps inode times and superblock write times but owns no clock
/// of its own; the embedder provides one.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now(&self) -> u32;
}

/// A [`Clock`] that always reports the same instant. Useful for tests and
/// for reproducible image creation.
pub struct FixedClock(pub u32);

impl Clock for FixedClock {
    fn now(&self) -> u32 {
        self.0
    }
}

/// File type carried by an inode's mode field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    SymbolicLink,
    CharacterDevice,
    BlockDevice,
    Fifo,
    Socket,
}

/// A directory entry as reported by directory iteration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode number the entry points at.
    pub inode: u32,

    /// Raw name bytes (not NUL-terminated).
    pub name: Vec<u8>,
}

/// File attributes reported by `getattr`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub ino: u32,
    pub mode: u16,
    pub nlink: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u64,
    /// Allocated size in 512-byte units.
    pub blocks: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
}

/// Attribute changes applied by `setattr`. `None` fields are left untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetAttr {
    pub mode: Option<u16>,
    pub uid: Option<u16>,
    pub gid: Option<u16>,
    pub size: Option<u64>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

/// A trait to represent a file-system independent file.
///
/// This offers basic functionalities when working with files.
pub trait FsFile {
    /// Reads some bytes from the file into `buf`, starting at the internal
    /// cursor, and returns how many bytes were read. Holes read as zeros.
    ///
    /// # Errors
    ///
    /// In case of any I/O error, a generic error will be returned.
    fn read(&mut self, buf: &mut [u8]) -> FsResult<usize>;

    /// Writes `buf` at the internal cursor, allocating blocks as needed, and
    /// returns how many bytes were written.
    ///
    /// # Errors
    ///
    /// Fails with `Invalid` when the write would extend past the last direct
    /// block, and with `NoSpace` when the allocator is exhausted.
    fn write(&mut self, buf: &[u8]) -> FsResult<usize>;

    /// Changes the position of the file's internal cursor and returns the
    /// new offset in bytes.
    fn seek(&mut self, pos: Seek) -> usize;

    /// Returns the size of the file, in bytes.
    fn size(&self) -> FsResult<usize>;

    /// Truncates the file, changing the size of the underlying file to
    /// `size`.
    ///
    /// # Errors
    ///
    /// In case of any I/O error, a generic error will be returned.
    fn truncate(&mut self, size: usize) -> FsResult<usize>;

    /// Extends the file to `size` bytes. The newly added bytes read as
    /// zeros.
    ///
    /// # Errors
    ///
    /// In case of any I/O error, a generic error will be returned.
    fn extend(&mut self, size: usize) -> FsResult<usize>;
}

/// A trait to represent a file-system independent directory.
pub trait FsDirectory: Iterator<Item = FsResult<DirEntry>> {
    /// Returns `true` if the directory is the file system's root directory.
    fn is_root_dir(&self) -> FsResult<bool>;

    /// Returns the size of the directory contents, in bytes.
    fn size(&self) -> FsResult<usize>;
}
