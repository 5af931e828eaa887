use thiserror::Error;

use crate::tree::manifest::ChunkId;

/// Outcome of a single filesystem call. Every OS call resolves to exactly one
/// of these or success.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("bad file handle {0}")]
    BadHandle(u64),

    #[error("IO error: {0}")]
    Io(String),

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("corrupt manifest for {path}: {reason}")]
    CorruptManifest { path: String, reason: String },

    #[error("filesystem busy")]
    Busy,
}

impl FsError {
    /// POSIX errno reported to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::PermissionDenied(_) => libc::EACCES,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::Io(_) => libc::EIO,
            FsError::NetworkUnavailable(_) => libc::ENETUNREACH,
            FsError::CorruptManifest { .. } => libc::EIO,
            FsError::Busy => libc::EBUSY,
        }
    }

}

impl From<StoreError> for FsError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => FsError::Io(format!("chunk {} missing from store", id)),
            StoreError::Unavailable(msg) => FsError::NetworkUnavailable(msg),
            StoreError::Corrupt(msg) => FsError::Io(format!("corrupt chunk: {}", msg)),
            StoreError::Io(msg) => FsError::Io(msg),
            StoreError::TimedOut(_) => FsError::Busy,
        }
    }
}

/// Failures reported by the storage collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("chunk {0} not found")]
    NotFound(ChunkId),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("store IO error: {0}")]
    Io(String),

    /// Retrying stopped because the caller's deadline would pass first.
    #[error("out of time: {0}")]
    TimedOut(String),
}

impl StoreError {
    /// Only unavailability is worth retrying; a missing chunk stays missing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum MountError {
    #[error("{0} is already mounted")]
    AlreadyMounted(String),

    #[error("permission denied mounting {0}")]
    PermissionDenied(String),

    #[error("invalid mount target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("failed to load metadata snapshot: {0}")]
    Metadata(#[from] StoreError),

    #[error("OS mount failed: {0}")]
    Os(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum UnmountError {
    #[error("{0} is not mounted")]
    NotMounted(String),

    #[error("unmount timed out with uncommitted data; retry later")]
    Busy,

    #[error("final flush failed: {0}")]
    Flush(#[from] FsError),
}

pub type FsResult<T> = std::result::Result<T, FsError>;
