use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Catalog entry not found")]
    NotFound,

    #[error("Catalog entry already exists")]
    AlreadyExists,

    #[error("Name too long")]
    NameTooLong,

    #[error("Invalid name")]
    InvalidName,

    #[error("Out of memory")]
    OutOfMemory,

    #[error("No space left on volume")]
    NoSpace,

    #[error("Too many links")]
    TooManyLinks,

    #[error("Cnode {0} is busy")]
    Busy(u32),

    /// Catalog state changed under the caller; the whole lookup must be redone.
    #[error("Catalog changed during lookup, retry")]
    RetryLookup,

    #[error("Reserved name")]
    ReservedName,

    #[error("Volume is inconsistent: {0}")]
    VolumeInconsistent(String),

    #[error("Directory not empty")]
    NotEmpty,

    #[error("Not a directory")]
    NotDirectory,

    #[error("Is a directory")]
    IsDirectory,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation not permitted")]
    PermissionDenied,
}

impl CatalogError {
    /// POSIX errno reported at the VFS boundary.
    pub fn errno(&self) -> i32 {
        match self {
            CatalogError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            CatalogError::Json(_) => libc::EIO,
            CatalogError::NotFound => libc::ENOENT,
            CatalogError::AlreadyExists => libc::EEXIST,
            CatalogError::NameTooLong => libc::ENAMETOOLONG,
            CatalogError::InvalidName => libc::EINVAL,
            CatalogError::OutOfMemory => libc::ENOMEM,
            CatalogError::NoSpace => libc::ENOSPC,
            CatalogError::TooManyLinks => libc::EMLINK,
            CatalogError::Busy(_) => libc::EBUSY,
            CatalogError::RetryLookup => libc::EAGAIN,
            CatalogError::ReservedName => libc::EPERM,
            CatalogError::VolumeInconsistent(_) => libc::EIO,
            CatalogError::NotEmpty => libc::ENOTEMPTY,
            CatalogError::NotDirectory => libc::ENOTDIR,
            CatalogError::IsDirectory => libc::EISDIR,
            CatalogError::InvalidArgument(_) => libc::EINVAL,
            CatalogError::PermissionDenied => libc::EPERM,
        }
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;
