//! Crate-specific error types for mapped-segment.

use std::io;
use thiserror::Error;

/// Result alias for mapped-segment operations.
pub type Result<T> = std::result::Result<T, MappedFileError>;

/// Error type covering capacity, visibility, mode and OS-level failures.
#[derive(Debug, Error)]
pub enum MappedFileError {
    /// A buffer pool was supplied for a read-only open.
    #[error("buffer pool supplied for read-only file")]
    PoolForReadOnly,

    /// A write (or the resume offset on open) would pass the file capacity.
    /// Positions are left unchanged.
    #[error("write beyond capacity: position={position}, len={len}, capacity={capacity}")]
    WriteBeyond {
        /// Position the write would start at.
        position: u64,
        /// Number of bytes requested.
        len: u64,
        /// Current file size.
        capacity: u64,
    },

    /// A read offset lies beyond the visible boundary. No bytes were copied.
    #[error("read beyond visible boundary: offset={offset}, boundary={boundary}")]
    ReadBeyond {
        /// Requested offset.
        offset: u64,
        /// Read boundary at the time of the call.
        boundary: u64,
    },

    /// OS-level failure, tagged with the operation that failed.
    #[error("{op} failed: {source}")]
    Io {
        /// Operation name (`open`, `truncate`, `map`, ...).
        op: &'static str,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Operation not valid for the file's open mode.
    #[error("invalid access mode: {0}")]
    InvalidMode(&'static str),

    /// A write arrived after `done_write` released the write buffer.
    #[error("write session ended: write buffer already returned to its pool")]
    WriteSessionEnded,

    /// The file has no live mapping (a previous remap failed).
    #[error("file is not mapped")]
    NotMapped,

    /// The commit drain gave up under a bounded or cancelled retry policy.
    /// The buffered bytes are still held and will be retried by the next commit.
    #[error("commit aborted after {attempts} attempt(s): {source}")]
    CommitAborted {
        /// Attempts made before giving up.
        attempts: u32,
        /// Last drain error.
        #[source]
        source: io::Error,
    },
}

/// Attach an operation name to an `io::Result`.
pub(crate) trait IoContext<T> {
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|source| MappedFileError::Io { op, source })
    }
}
