//! Error kinds surfaced by the metadata engine.
//!
//! Every operation in the core returns one of these kinds; the dispatcher
//! maps them onto the bridge's errno surface just before replying.

use std::fmt;
use std::io;

use fuser::Errno;
use log::error;

/// Result alias used throughout the crate.
pub type FsResult<T> = Result<T, FsError>;

/// Error kinds produced by the filesystem core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// A path component does not exist.
    NotFound,
    /// Traversal descended through a regular file.
    NotDirectory,
    /// A file operation was applied to a directory (or vice versa).
    IsDirectory,
    /// Insert with a name already present in the parent.
    Exists,
    /// rmdir of a directory that still has children.
    NotEmpty,
    /// Node arena, string table, or block pool is full.
    NoSpace,
    /// Path too long, name too long, or an out-of-range argument.
    InvalidArgument,
    /// WAL write failed, region attach failed, or another I/O fault.
    Io,
    /// Mutation attempted while the filesystem is degraded to read-only.
    ReadOnly,
    /// Rename across directories, which this filesystem does not support.
    CrossDevice,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::NotFound => "no such file or directory",
            FsError::NotDirectory => "not a directory",
            FsError::IsDirectory => "is a directory",
            FsError::Exists => "file exists",
            FsError::NotEmpty => "directory not empty",
            FsError::NoSpace => "no space left in region",
            FsError::InvalidArgument => "invalid argument",
            FsError::Io => "input/output error",
            FsError::ReadOnly => "read-only file system",
            FsError::CrossDevice => "cross-directory rename not supported",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for FsError {}

impl From<FsError> for Errno {
    fn from(err: FsError) -> Errno {
        match err {
            FsError::NotFound => Errno::ENOENT,
            FsError::NotDirectory => Errno::ENOTDIR,
            FsError::IsDirectory => Errno::EISDIR,
            FsError::Exists => Errno::EEXIST,
            FsError::NotEmpty => Errno::ENOTEMPTY,
            FsError::NoSpace => Errno::ENOSPC,
            FsError::InvalidArgument => Errno::EINVAL,
            FsError::Io => Errno::EIO,
            FsError::ReadOnly => Errno::EROFS,
            FsError::CrossDevice => Errno::EXDEV,
        }
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> FsError {
        // The io::Error carries detail the enum cannot; keep it in the log.
        error!("I/O failure: {err}");
        FsError::Io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(i32::from(Errno::from(FsError::NotFound)), i32::from(Errno::ENOENT));
        assert_eq!(i32::from(Errno::from(FsError::NoSpace)), i32::from(Errno::ENOSPC));
        assert_eq!(i32::from(Errno::from(FsError::CrossDevice)), i32::from(Errno::EXDEV));
    }
}
