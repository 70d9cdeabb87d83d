//! Crate-wide error type.
//!
//! Every component returns [`Error`]; the `fuser` facade in [`crate::fs`] is the only place
//! these get mapped down to POSIX errno values.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The resolved path does not exist, locally or on the remote. Surfaces as `ENOENT`.
    #[error("no such path: {0}")]
    NotFound(String),

    /// The path exists but is not the type the caller required (e.g. `read` on a directory).
    #[error("wrong entry type for path: {0}")]
    WrongType(String),

    /// The remote reported an entry whose mode is none of regular/directory/symlink.
    #[error("unsupported remote entry type for path: {0}")]
    UnsupportedEntryType(String),

    /// A supplied source URI did not match the one already recorded for this mirror.
    #[error("source URI {supplied:?} does not match known source URI {known:?}")]
    SourceUriMismatch { supplied: String, known: String },

    /// The source URI was not well-formed (missing host, non-absolute remote path, ...).
    #[error("invalid source URI {0:?}: {1}")]
    InvalidSourceUri(String, String),

    /// The metadata store is internally inconsistent (bad segment intersection, missing
    /// config row on an existing store, schema version with no upgrade path).
    #[error("metadata store corrupted: {0}")]
    MetadataCorruption(String),

    /// The remote returned fewer bytes than requested somewhere other than end-of-file.
    #[error("short read from remote for {path} at offset {offset}: got {got} of {expected} bytes")]
    ShortRead { path: String, offset: u64, expected: usize, got: usize },

    /// A local filesystem operation against the mirror failed.
    #[error("target I/O error at {path:?}: {source}")]
    TargetIo { path: PathBuf, #[source] source: std::io::Error },

    /// The SQLite-backed metadata store failed.
    #[error("metadata store error: {0}")]
    Metadata(#[from] rusqlite::Error),

    /// The SSH/SFTP session failed.
    #[error("source connection error: {0}")]
    Source(#[from] ssh2::Error),

    /// None of the configured authentication methods (agent, default key pair, password)
    /// were accepted by the remote host.
    #[error("no authentication method succeeded for user {0:?}")]
    AuthenticationFailed(String),

    /// The remote's host key did not check out against `~/.ssh/known_hosts`.
    #[error("host key check failed for {0:?}: {1}")]
    HostKeyRejected(String, String),

    /// Generic local I/O failure not otherwise categorised.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn target_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::TargetIo { path: path.into(), source }
    }

    /// Map this error to the `libc` errno the FUSE host should report to the kernel.
    pub fn as_errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::WrongType(_) => libc::EINVAL,
            Error::UnsupportedEntryType(_) => libc::EIO,
            Error::SourceUriMismatch { .. } => libc::EIO,
            Error::InvalidSourceUri(..) => libc::EIO,
            Error::MetadataCorruption(_) => libc::EIO,
            Error::ShortRead { .. } => libc::EIO,
            Error::TargetIo { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            Error::Metadata(_) => libc::EIO,
            Error::Source(_) => libc::EIO,
            Error::AuthenticationFailed(_) => libc::EACCES,
            Error::HostKeyRejected(..) => libc::EACCES,
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
