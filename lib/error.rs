//! Error kinds shared by every tree and by the caching engine.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every error a tree operation can surface.
#[derive(Debug, Error)]
pub enum Error {
    /// The file does not exist.
    #[error("{0}: file does not exist")]
    NotExist(String),

    /// The file already exists.
    #[error("{0}: file already exists")]
    Exists(String),

    /// Permission denied.
    #[error("{0}: permission denied")]
    Perm(String),

    /// The tree is read-only, or the backing tree refused a write.
    #[error("{0}: read-only file system")]
    ReadOnly(String),

    /// A file operation was attempted on a directory.
    #[error("{0}: is a directory")]
    IsDir(String),

    /// A directory operation was attempted on a file.
    #[error("{0}: not a directory")]
    NotDir(String),

    /// A directory with entries cannot be removed.
    #[error("{0}: directory not empty")]
    NotEmpty(String),

    /// A move whose target lies inside its source.
    #[error("{0}: inconsistent move")]
    Inconsistent(String),

    /// A predicate evaluated to false.
    #[error("{0}: false")]
    NoMatch(String),

    /// A malformed control request.
    #[error("{0}: bad ctl request")]
    BadCtl(String),

    /// A path that cannot be made absolute and canonical.
    #[error("{0}: bad path")]
    BadPath(String),

    /// An invalidation reader did not keep up and was evicted.
    #[error("slow reader client: closing its /Chg")]
    SlowReader,

    /// The tree has been closed.
    #[error("{0}: closed")]
    Closed(String),

    /// A write past the size a tree can hold.
    #[error("{0}: file too large")]
    TooLarge(String),

    /// Malformed wire data.
    #[error("protocol error: {0}")]
    Proto(String),

    /// An I/O failure, usually against the backing tree.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for [`Error::NotExist`], including I/O errors reporting a missing file.
    #[must_use]
    pub fn is_not_exist(&self) -> bool {
        match self {
            Self::NotExist(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True for [`Error::Perm`].
    #[must_use]
    pub fn is_perm(&self) -> bool {
        matches!(self, Self::Perm(_))
    }

    /// True for [`Error::ReadOnly`].
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly(_))
    }

    /// True for [`Error::Exists`].
    #[must_use]
    pub fn is_exists(&self) -> bool {
        matches!(self, Self::Exists(_))
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        match e {
            Error::NotExist(_) => libc::ENOENT,
            Error::Exists(_) => libc::EEXIST,
            Error::Perm(_) => libc::EACCES,
            Error::ReadOnly(_) => libc::EROFS,
            Error::IsDir(_) => libc::EISDIR,
            Error::NotDir(_) => libc::ENOTDIR,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::Inconsistent(_) | Error::BadCtl(_) | Error::BadPath(_) => libc::EINVAL,
            Error::NoMatch(_) => libc::ENOENT,
            Error::SlowReader => libc::EPIPE,
            Error::Closed(_) => libc::ESHUTDOWN,
            Error::TooLarge(_) => libc::EFBIG,
            Error::Proto(_) => libc::EPROTO,
            Error::Io(ref io_err) => io_err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
