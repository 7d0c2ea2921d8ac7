//! Error types shared by the filesystem layers.

use core::fmt;

/// `CanFail` is a return type for functions that are allowed to fail, and
/// don't need to return anything.
pub type CanFail<E> = Result<(), E>;

/// Return type used throughout the filesystem code.
pub type FsResult<T> = Result<T, FsError>;

/// Error kinds surfaced by filesystem operations.
///
/// `Corrupt` is special: in addition to being returned it is always routed
/// through the mount's configured error policy (continue, remount read-only
/// or panic).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    /// No free block or inode left to satisfy an allocation.
    NoSpace,

    /// The requested name does not exist in the directory.
    NoEnt,

    /// The name already exists in the directory.
    Exists,

    /// Directory removal attempted on a non-empty directory.
    NotEmpty,

    /// A name or symlink target exceeds the supported length.
    NameTooLong,

    /// Malformed argument (out-of-range block, unsupported offset, ...).
    Invalid,

    /// The underlying device failed to read or write.
    Io,

    /// An on-disk structure failed validation.
    Corrupt,

    /// Mutation attempted on a read-only mount.
    ReadOnly,

    /// Memory allocation failure.
    NoMem,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::NoSpace => "no space left on device",
            FsError::NoEnt => "no such file or directory",
            FsError::Exists => "file exists",
            FsError::NotEmpty => "directory not empty",
            FsError::NameTooLong => "name too long",
            FsError::Invalid => "invalid argument",
            FsError::Io => "input/output error",
            FsError::Corrupt => "structure needs cleaning",
            FsError::ReadOnly => "read-only filesystem",
            FsError::NoMem => "out of memory",
        };

        f.write_str(msg)
    }
}
