//! User/semantic and resource-exhaustion errors.
//!
//! Programmer errors and on-disk corruption (spec §7, first bullet)
//! are not represented here: they are `panic!`/`assert!`s at the call
//! site, matching the teacher's own style.

use core::fmt;

/// Errors a syscall-level FS operation can surface. Maps to the "-1"
/// of the C-flavored syscall surface (spec §6); the reason is kept
/// here instead of being discarded, since nothing in the spec forbids
/// a richer Rust-native error type at this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// No such file or directory.
    NotFound,
    /// A path component that should be a directory is not one.
    NotADirectory,
    /// An operation that refuses directories was given one.
    IsADirectory,
    /// `unlink` on a non-empty directory.
    DirectoryNotEmpty,
    /// `create`/`link`/`symlink` target name already exists with an
    /// incompatible type.
    NameExists,
    /// The block allocator ran out of free blocks.
    NoSpace,
    /// The inode allocator ran out of free inodes.
    NoInodes,
    /// A write would extend a file past `MAXFILE` blocks.
    FileTooLarge,
    /// `link` across two different devices.
    CrossDevice,
    /// Symlink resolution exceeded `MAX_SYMLINK_DEPTH`.
    SymlinkLoop,
    /// Malformed argument (e.g. empty path, oversized name).
    InvalidArgument,
    /// A `T_DEVICE` inode names a major number with no registered driver.
    NoSuchDevice,
    /// Caller tried to write through a read-only handle, or vice versa.
    BadFileMode,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::NotFound => "no such file or directory",
            FsError::NotADirectory => "not a directory",
            FsError::IsADirectory => "is a directory",
            FsError::DirectoryNotEmpty => "directory not empty",
            FsError::NameExists => "name already exists",
            FsError::NoSpace => "no space left on device",
            FsError::NoInodes => "out of inodes",
            FsError::FileTooLarge => "file too large",
            FsError::CrossDevice => "cross-device link",
            FsError::SymlinkLoop => "too many levels of symbolic links",
            FsError::InvalidArgument => "invalid argument",
            FsError::NoSuchDevice => "no such device",
            FsError::BadFileMode => "bad file descriptor mode",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for FsError {}

pub type FsResult<T> = Result<T, FsError>;
