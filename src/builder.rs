//! Builder for opening a [`MappedFile`] with non-default collaborators.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::Result;
use crate::mapping::{Mapper, OsMapper};
use crate::mmap::{MappedFile, OpenMode, WriteMode};
use crate::pool::BufferPool;
use crate::retry::RetryPolicy;

/// Options for opening a [`MappedFile`].
///
/// Defaults: [`OpenMode::Write`], size 0, [`WriteMode::Mapped`], no pool,
/// [`OsMapper`], [`RetryPolicy::default`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use mapped_segment::{MappedFile, RetryPolicy, VecPool, WriteMode};
///
/// let file = MappedFile::builder("00000002.seg")
///     .size(64 * 1024)
///     .write_mode(WriteMode::Descriptor)
///     .pool(Arc::new(VecPool::default()))
///     .retry(RetryPolicy::bounded(Duration::from_millis(100), 50))
///     .create()?;
/// # Ok::<(), mapped_segment::MappedFileError>(())
/// ```
pub struct MappedFileBuilder {
    pub(crate) path: PathBuf,
    pub(crate) mode: OpenMode,
    pub(crate) size: u64,
    pub(crate) write_mode: WriteMode,
    pub(crate) pool: Option<Arc<dyn BufferPool>>,
    pub(crate) mapper: Arc<dyn Mapper>,
    pub(crate) retry: RetryPolicy,
}

impl MappedFileBuilder {
    /// Options for `path` with the defaults above.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            mode: OpenMode::Write,
            size: 0,
            write_mode: WriteMode::default(),
            pool: None,
            mapper: Arc::new(OsMapper),
            retry: RetryPolicy::default(),
        }
    }

    /// How to open the file.
    #[must_use]
    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    /// Size of a new file, or resume offset into an existing one.
    #[must_use]
    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Where writes land.
    #[must_use]
    pub fn write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }

    /// Buffer writes with a buffer leased from `pool`.
    #[must_use]
    pub fn pool(mut self, pool: Arc<dyn BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Mapping implementation to use.
    #[must_use]
    pub fn mapper(mut self, mapper: Arc<dyn Mapper>) -> Self {
        self.mapper = mapper;
        self
    }

    /// Retry policy for descriptor-mode commits.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Open with the configured mode.
    ///
    /// # Errors
    ///
    /// See [`MappedFile::open`].
    pub fn open(self) -> Result<MappedFile> {
        MappedFile::open_with(self)
    }

    /// Create a new file, whatever mode was configured.
    ///
    /// # Errors
    ///
    /// See [`MappedFile::create`].
    pub fn create(self) -> Result<MappedFile> {
        self.mode(OpenMode::Create).open()
    }
}

impl std::fmt::Debug for MappedFileBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFileBuilder")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("size", &self.size)
            .field("write_mode", &self.write_mode)
            .field("pool", &self.pool.is_some())
            .field("mapper", &self.mapper)
            .field("retry", &self.retry)
            .finish()
    }
}
