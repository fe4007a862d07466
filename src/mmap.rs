//! Memory-mapped append file: lifecycle, read path, resize and sync.
//!
//! The write and commit path lives in [`crate::write`], page pinning in
//! [`crate::lock`].

use std::{
    fs::{self, File, OpenOptions},
    io::{Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
    time::SystemTime,
};

use parking_lot::{Mutex, RwLock};

use crate::builder::MappedFileBuilder;
use crate::errors::{IoContext, MappedFileError, Result};
use crate::mapping::{Mapper, Region};
use crate::pool::BufferPool;
use crate::retry::RetryPolicy;
use crate::utils::visible_len;
use crate::view::{MappedBytes, ReadGuard};

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing file for reading only.
    ReadOnly,
    /// Open an existing file for reading and appending.
    Write,
    /// Create a new file; fails if it already exists.
    Create,
}

impl OpenMode {
    /// Whether the mode carries write intent.
    #[must_use]
    pub fn is_writable(self) -> bool {
        !matches!(self, OpenMode::ReadOnly)
    }
}

/// Where written bytes land once they leave the write buffer (or directly,
/// when the file has no buffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Copy into the writable mapping.
    #[default]
    Mapped,
    /// Write through the file descriptor; the mapping is read-only.
    Descriptor,
}

/// Write buffer leased from a pool.
pub(crate) struct Leased {
    pub(crate) buf: Vec<u8>,
    pool: Arc<dyn BufferPool>,
}

impl Leased {
    pub(crate) fn release(mut self) {
        self.buf.clear();
        self.pool.release(self.buf);
    }
}

/// Write target, fixed at open time.
pub(crate) enum WriteTarget {
    ReadOnly,
    /// Bytes accumulate in a leased buffer and are committed to `sink`.
    /// The slot empties for good after `done_write` or close.
    Buffered {
        sink: WriteMode,
        slot: Mutex<Option<Leased>>,
    },
    MappedDirect,
    Descriptor,
}

/// Memory-mapped file appended to by one writer and read by many.
///
/// Positions obey `commit_position <= wrote_position <= len`. Readers see
/// `[0, read_position)`: the commit position for buffered files, the wrote
/// position otherwise. Buffered bytes stay invisible until
/// [`commit`](MappedFile::commit).
///
/// `write`, `write_vectored`, `write_at`, `resize` and `shrink` are
/// serialized internally; `commit`, `done_write` and reads may run alongside
/// them from other threads. Share the file across threads with `Arc`.
///
/// Position values and the bytes at those positions are not one atomic
/// snapshot; take [`read_lock`](MappedFile::read_lock) to read several ranges
/// against one mapping.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use mapped_segment::{MappedFile, VecPool, WriteMode};
///
/// let pool = Arc::new(VecPool::default());
/// let file = MappedFile::create("00000001.seg", 1024, WriteMode::Mapped, Some(pool))?;
/// file.write(b"hello")?;
/// file.commit()?;
///
/// let mut buf = [0u8; 5];
/// assert_eq!(file.read(0, &mut buf)?, 5);
/// file.close()?;
/// # Ok::<(), mapped_segment::MappedFileError>(())
/// ```
pub struct MappedFile {
    pub(crate) path: PathBuf,
    pub(crate) mode: OpenMode,
    pub(crate) write_mode: WriteMode,
    pub(crate) file: File,
    pub(crate) file_size: AtomicU64,
    pub(crate) wrote_position: AtomicU64,
    pub(crate) commit_position: AtomicU64,
    pub(crate) target: WriteTarget,
    // Only the mapping swap in resize/close takes this exclusively.
    pub(crate) region: RwLock<Option<Region>>,
    pub(crate) writer: Mutex<()>,
    pub(crate) mapper: Arc<dyn Mapper>,
    pub(crate) retry: RetryPolicy,
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("write_mode", &self.write_mode)
            .field("len", &self.len())
            .field("wrote_position", &self.wrote_position())
            .field("commit_position", &self.commit_position())
            .field("buffered", &self.is_buffered())
            .finish()
    }
}

impl MappedFile {
    /// Start configuring a file at `path`.
    pub fn builder<P: AsRef<Path>>(path: P) -> MappedFileBuilder {
        MappedFileBuilder::new(path)
    }

    /// Open or create `path` according to `mode`.
    ///
    /// For [`OpenMode::Create`], `size` is the size of the new file. Otherwise
    /// it is the offset to resume writing (or reading up to) in the existing
    /// file, whose actual size becomes the capacity.
    ///
    /// A `pool` makes writes buffered; it is rejected for read-only opens.
    ///
    /// # Errors
    ///
    /// - `PoolForReadOnly` if a pool is given with [`OpenMode::ReadOnly`].
    /// - `WriteBeyond` if the resume offset exceeds the existing file size.
    /// - `Io` for open, truncate, stat, seek or map failures.
    pub fn open<P: AsRef<Path>>(
        path: P,
        size: u64,
        mode: OpenMode,
        write_mode: WriteMode,
        pool: Option<Arc<dyn BufferPool>>,
    ) -> Result<Self> {
        let mut builder = Self::builder(path)
            .mode(mode)
            .size(size)
            .write_mode(write_mode);
        if let Some(pool) = pool {
            builder = builder.pool(pool);
        }
        builder.open()
    }

    /// Create a new file of `size` bytes. Same as [`open`](MappedFile::open)
    /// with [`OpenMode::Create`].
    ///
    /// # Errors
    ///
    /// See [`open`](MappedFile::open); also fails if the file exists.
    pub fn create<P: AsRef<Path>>(
        path: P,
        size: u64,
        write_mode: WriteMode,
        pool: Option<Arc<dyn BufferPool>>,
    ) -> Result<Self> {
        Self::open(path, size, OpenMode::Create, write_mode, pool)
    }

    pub(crate) fn open_with(b: MappedFileBuilder) -> Result<Self> {
        let writable = b.mode.is_writable();
        if !writable && b.pool.is_some() {
            return Err(MappedFileError::PoolForReadOnly);
        }

        let file = match b.mode {
            OpenMode::ReadOnly => OpenOptions::new().read(true).open(&b.path),
            OpenMode::Write => OpenOptions::new().read(true).write(true).open(&b.path),
            OpenMode::Create => OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&b.path),
        }
        .op("open")?;

        // From here on `file` closes itself on every early return; the
        // buffer is leased last so nothing else needs undoing.
        let (file_size, resume) = if b.mode == OpenMode::Create {
            file.set_len(b.size).op("truncate")?;
            (b.size, 0)
        } else {
            let actual = file.metadata().op("stat")?.len();
            if b.size > actual {
                return Err(MappedFileError::WriteBeyond {
                    position: b.size,
                    len: 0,
                    capacity: actual,
                });
            }
            if writable && b.write_mode == WriteMode::Descriptor {
                (&file).seek(SeekFrom::Start(b.size)).op("seek")?;
            }
            (actual, b.size)
        };

        let map_writable = writable && b.write_mode == WriteMode::Mapped;
        let region = map_checked(b.mapper.as_ref(), &file, map_writable, file_size)?;

        let target = match (writable, b.pool, b.write_mode) {
            (false, _, _) => WriteTarget::ReadOnly,
            (true, Some(pool), sink) => WriteTarget::Buffered {
                sink,
                slot: Mutex::new(Some(Leased {
                    buf: pool.acquire(),
                    pool,
                })),
            },
            (true, None, WriteMode::Mapped) => WriteTarget::MappedDirect,
            (true, None, WriteMode::Descriptor) => WriteTarget::Descriptor,
        };

        log::debug!(
            "opened {} ({:?}, {:?}): size={file_size} resume={resume}",
            b.path.display(),
            b.mode,
            b.write_mode
        );

        Ok(Self {
            path: b.path,
            mode: b.mode,
            write_mode: b.write_mode,
            file,
            file_size: AtomicU64::new(file_size),
            wrote_position: AtomicU64::new(resume),
            commit_position: AtomicU64::new(resume),
            target,
            region: RwLock::new(Some(region)),
            writer: Mutex::new(()),
            mapper: b.mapper,
            retry: b.retry,
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mode the file was opened with.
    #[must_use]
    pub fn open_mode(&self) -> OpenMode {
        self.mode
    }

    /// Where writes land.
    #[must_use]
    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    /// Current file size, which is also the write capacity.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    /// Whether the file has zero capacity.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset up to which the caller has written, buffered bytes included.
    #[must_use]
    pub fn wrote_position(&self) -> u64 {
        self.wrote_position.load(Ordering::Acquire)
    }

    /// Offset up to which buffered bytes have reached the mapping or file.
    /// Equals the wrote position for unbuffered files.
    #[must_use]
    pub fn commit_position(&self) -> u64 {
        if self.is_buffered() {
            self.commit_position.load(Ordering::Acquire)
        } else {
            self.wrote_position()
        }
    }

    /// Read boundary: bytes `[0, read_position)` are visible to readers.
    #[must_use]
    pub fn read_position(&self) -> u64 {
        self.commit_position()
    }

    /// Whether writes go through a write buffer.
    #[must_use]
    pub fn is_buffered(&self) -> bool {
        matches!(self.target, WriteTarget::Buffered { .. })
    }

    /// Whether the wrote position reached the capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.wrote_position() >= self.len()
    }

    /// Modification time of the backing file.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the metadata query fails.
    pub fn last_modified(&self) -> Result<SystemTime> {
        self.file.metadata().op("stat")?.modified().op("stat")
    }

    /// Read visible bytes at `offset` into `buf`, returning how many were
    /// copied. Short reads are normal near the read boundary.
    ///
    /// # Errors
    ///
    /// - `ReadBeyond` if `offset` is at or past the read boundary (a read
    ///   exactly at the boundary is allowed only for an empty `buf`).
    /// - `NotMapped` if a failed resize left the file without a mapping.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let region = self.region.read();
        self.read_mapped(region.as_ref(), offset, buf)
    }

    /// Take the shared mapping lock for several reads in a row. Resize waits
    /// until the guard drops.
    ///
    /// Do not call write-path methods while holding the guard.
    pub fn read_lock(&self) -> ReadGuard<'_> {
        ReadGuard::new(self, self.region.read())
    }

    /// The visible prefix `[0, read_position)` of the mapping, borrowed under
    /// the shared mapping lock. Resize waits until it drops.
    pub fn mapped_bytes(&self) -> MappedBytes<'_> {
        let region = self.region.read();
        let visible = self.read_position();
        MappedBytes::new(region, visible)
    }

    pub(crate) fn read_mapped(
        &self,
        region: Option<&Region>,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let boundary = self.read_position();
        let n = visible_len(offset, buf.len(), boundary)?;
        if n == 0 {
            return Ok(0);
        }
        let region = region.ok_or(MappedFileError::NotMapped)?;
        #[allow(clippy::cast_possible_truncation)]
        let start = offset as usize;
        if start + n > region.len() {
            return Err(MappedFileError::ReadBeyond { offset, boundary });
        }
        // SAFETY: [start, start + n) is below the read boundary and inside the
        // mapping; writers only touch bytes at or past the boundary, and the
        // mapping cannot be swapped while the shared lock is held.
        unsafe { region.copy_out(start, &mut buf[..n]) };
        Ok(n)
    }

    /// Truncate or extend the file to `new_size` and remap it.
    ///
    /// Returns at once when the size is unchanged. Otherwise pending buffered
    /// bytes are committed first, and a wrote position past `new_size` is
    /// clamped. Readers are excluded while the mapping is swapped.
    ///
    /// # Errors
    ///
    /// - `InvalidMode` for read-only files.
    /// - `Io` for flush, truncate, unmap or map failures. If mapping the new
    ///   size fails the file is left unmapped and reads report `NotMapped`.
    /// - `InvalidMode` if the mapper hands back a region of the wrong size or
    ///   access; the file is left unmapped as above.
    /// - `CommitAborted` if committing pending bytes gave up.
    pub fn resize(&self, new_size: u64) -> Result<()> {
        let _writer = self.writer.lock();
        self.resize_locked(new_size)
    }

    /// Commit, then resize the file down to the wrote position, dropping the
    /// preallocated tail. Used to seal a segment.
    ///
    /// # Errors
    ///
    /// See [`resize`](MappedFile::resize).
    pub fn shrink(&self) -> Result<()> {
        let _writer = self.writer.lock();
        if self.mode.is_writable() {
            self.commit()?;
        }
        self.resize_locked(self.wrote_position())
    }

    pub(crate) fn resize_locked(&self, new_size: u64) -> Result<()> {
        if !self.mode.is_writable() {
            return Err(MappedFileError::InvalidMode("resize requires a writable file"));
        }
        // Only resize changes the size, and the writer lock is held.
        let old_size = self.len();
        if old_size == new_size && self.region.read().is_some() {
            return Ok(());
        }
        self.commit()?;

        let mut region = self.region.write();

        if let Some(old) = region.as_ref() {
            self.mapper.flush(old, 0, old.len()).op("msync")?;
        }
        self.file.set_len(new_size).op("truncate")?;
        if let Some(old) = region.take() {
            self.mapper.unmap(old).op("munmap")?;
        }
        *region = Some(map_checked(
            self.mapper.as_ref(),
            &self.file,
            self.maps_writable(),
            new_size,
        )?);
        self.file_size.store(new_size, Ordering::Release);

        let wrote = self.wrote_position();
        if wrote > new_size {
            self.wrote_position.store(new_size, Ordering::Release);
            self.commit_position.store(new_size, Ordering::Release);
            if self.writes_descriptor() {
                (&self.file).seek(SeekFrom::Start(new_size)).op("seek")?;
            }
        }

        log::debug!(
            "resized {}: {old_size} -> {new_size} (wrote={})",
            self.path.display(),
            self.wrote_position()
        );
        Ok(())
    }

    /// Flush written data to stable storage: the mapping in mapped mode, the
    /// descriptor in descriptor mode. No-op for read-only files.
    ///
    /// # Errors
    ///
    /// Returns `Io` if `msync`/`fsync` fails, `NotMapped` if there is no mapping.
    pub fn sync(&self) -> Result<()> {
        if !self.mode.is_writable() {
            return Ok(());
        }
        match self.write_mode {
            WriteMode::Mapped => {
                let region = self.region.read();
                let region = region.as_ref().ok_or(MappedFileError::NotMapped)?;
                self.mapper.flush(region, 0, region.len()).op("msync")
            }
            WriteMode::Descriptor => self.file.sync_all().op("fsync"),
        }
    }

    /// Delete the backing file. Does not close this handle.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be removed.
    pub fn remove(&self) -> Result<()> {
        fs::remove_file(&self.path).op("remove")
    }

    /// Commit pending buffered bytes, unmap, return the write buffer to its
    /// pool and close the descriptor.
    ///
    /// Dropping the file does the same, logging instead of returning errors.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the remaining steps still run.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let mut first_err = None;

        if let WriteTarget::Buffered { sink, slot } = &self.target {
            let mut slot = slot.lock();
            if let Some(leased) = slot.as_mut() {
                if let Err(e) = self.commit_leased(*sink, leased) {
                    first_err.get_or_insert(e);
                }
            }
            if let Some(leased) = slot.take() {
                leased.release();
            }
        }

        if let Some(region) = self.region.get_mut().take() {
            if let Err(e) = self.mapper.unmap(region).op("munmap") {
                first_err.get_or_insert(e);
            }
            log::debug!("closed {}", self.path.display());
        }

        first_err.map_or(Ok(()), Err)
    }

    pub(crate) fn maps_writable(&self) -> bool {
        self.mode.is_writable() && self.write_mode == WriteMode::Mapped
    }

    pub(crate) fn writes_descriptor(&self) -> bool {
        self.mode.is_writable() && self.write_mode == WriteMode::Descriptor
    }
}

/// Map through `mapper` and make sure the region is what was asked for.
/// Copies into the mapping rely on a writable region of the full size.
fn map_checked(mapper: &dyn Mapper, file: &File, writable: bool, len: u64) -> Result<Region> {
    let region = mapper.map(file, writable, len).op("map")?;
    let len_ok = u64::try_from(region.len()).is_ok_and(|l| l == len);
    let access_ok = region.is_empty() || region.is_writable() == writable;
    if len_ok && access_ok {
        return Ok(region);
    }
    log::error!(
        "mapper returned {region:?}, wanted len={len} writable={writable}"
    );
    if let Err(e) = mapper.unmap(region) {
        log::error!("unmapping rejected region: {e}");
    }
    Err(MappedFileError::InvalidMode(
        "mapper returned a mapping with the wrong size or access",
    ))
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::error!("releasing {}: {e}", self.path.display());
        }
    }
}
