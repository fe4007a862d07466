//! High-level helpers for managing segment files.
//!
//! Provides convenience functions that wrap [`MappedFile`] constructors.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::errors::{IoContext, Result};
use crate::mmap::{MappedFile, OpenMode, WriteMode};
use crate::pool::BufferPool;

/// Create a new segment file of `size` bytes, buffered through `pool` when given.
///
/// # Errors
///
/// Returns errors from [`MappedFile::create`].
pub fn create_file<P: AsRef<Path>>(
    path: P,
    size: u64,
    write_mode: WriteMode,
    pool: Option<Arc<dyn BufferPool>>,
) -> Result<MappedFile> {
    MappedFile::create(path, size, write_mode, pool)
}

/// Open an existing segment file to append from `resume`, or read-only up to
/// `resume` when `writable` is false.
///
/// # Errors
///
/// Returns errors from [`MappedFile::open`].
pub fn open_file<P: AsRef<Path>>(
    path: P,
    resume: u64,
    writable: bool,
    write_mode: WriteMode,
    pool: Option<Arc<dyn BufferPool>>,
) -> Result<MappedFile> {
    let mode = if writable {
        OpenMode::Write
    } else {
        OpenMode::ReadOnly
    };
    MappedFile::open(path, resume, mode, write_mode, pool)
}

/// Delete the file at `path`. Close any [`MappedFile`] on it first; on Unix
/// the data lives on until the last handle drops.
///
/// # Errors
///
/// Returns `Io` if the delete fails.
pub fn remove_file<P: AsRef<Path>>(path: P) -> Result<()> {
    fs::remove_file(path).op("remove")
}

#[cfg(feature = "async")]
pub mod r#async {
    //! Async helpers (Tokio) that keep blocking file work off the async threads.
    use std::io;
    use std::path::Path;
    use std::sync::Arc;

    use tokio::fs as tfs;

    use crate::errors::{IoContext, MappedFileError, Result};
    use crate::mmap::{MappedFile, OpenMode, WriteMode};
    use crate::pool::BufferPool;

    /// Create and size a new file asynchronously, then map it.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file exists or cannot be sized, and errors from
    /// [`MappedFile::open`].
    pub async fn create_file_async<P: AsRef<Path>>(
        path: P,
        size: u64,
        write_mode: WriteMode,
        pool: Option<Arc<dyn BufferPool>>,
    ) -> Result<MappedFile> {
        let path_ref = path.as_ref();
        let file = tfs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path_ref)
            .await
            .op("open")?;
        file.set_len(size).await.op("truncate")?;
        drop(file);
        MappedFile::open(path_ref, 0, OpenMode::Write, write_mode, pool)
    }

    /// Run [`MappedFile::commit`] on Tokio's blocking pool.
    ///
    /// With an unbounded retry policy the commit may never finish while the
    /// storage is failing; give the file a bounded or cancellable
    /// [`RetryPolicy`](crate::RetryPolicy) to get the task back.
    ///
    /// # Errors
    ///
    /// Errors from the commit, or `Io` if the blocking task panicked.
    pub async fn commit_async(file: Arc<MappedFile>) -> Result<u64> {
        tokio::task::spawn_blocking(move || file.commit())
            .await
            .map_err(|e| MappedFileError::Io {
                op: "commit",
                source: io::Error::new(io::ErrorKind::Other, e),
            })?
    }
}
