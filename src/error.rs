//! Error taxonomy shared across the crate

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure mode a sync operation can surface.
///
/// Filesystem failures are split from socket failures (`Io` vs `Transport`)
/// because recovery differs: a transport error kills the session, a local I/O
/// error only aborts the current operation.
#[derive(Debug, Error)]
pub enum Error {
    /// The path is not usable for the requested role (e.g. scan root that is
    /// not a directory, or a non-UTF-8 file name).
    #[error("invalid path: {0}")]
    InvalidPath(PathBuf),

    /// A file-only operation was invoked on a directory node.
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),

    /// A file recorded in a tree no longer exists on disk.
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    /// Local filesystem read/write/stat failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Malformed bytes on the wire: truncation, bad tags, invalid UTF-8,
    /// trailing garbage, or an unsafe relative path.
    #[error("wire error: {0}")]
    Wire(String),

    /// A declared length exceeds the protocol limit.
    #[error("{what} of {size} bytes exceeds limit of {max}")]
    SizeLimit {
        what: &'static str,
        size: u64,
        max: u64,
    },

    /// The session was closed; the caller must establish a new one.
    #[error("session closed")]
    SessionClosed,

    /// Socket-level failure (connect, read, write, reset).
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
}

impl Error {
    pub(crate) fn wire(msg: impl Into<String>) -> Self {
        Error::Wire(msg.into())
    }

    /// Open failure for a path we expect to exist, mapping the not-found case
    /// to its own variant.
    pub(crate) fn from_open(err: io::Error, path: &std::path::Path) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Error::FileNotFound(path.to_path_buf())
        } else {
            Error::Io(err)
        }
    }
}
