//! Borrowed views of a file's mapping held under the shared mapping lock.

use std::ops::Deref;

use parking_lot::RwLockReadGuard;

use crate::errors::Result;
use crate::mapping::Region;
use crate::mmap::MappedFile;

/// Shared mapping lock held across several reads.
///
/// # Examples
///
/// ```no_run
/// use mapped_segment::{MappedFile, OpenMode, WriteMode};
///
/// let file = MappedFile::open("00000001.seg", 64, OpenMode::ReadOnly, WriteMode::Mapped, None)?;
/// let guard = file.read_lock();
/// let mut header = [0u8; 8];
/// let mut body = [0u8; 56];
/// guard.read(0, &mut header)?;
/// guard.read(8, &mut body)?;
/// # Ok::<(), mapped_segment::MappedFileError>(())
/// ```
pub struct ReadGuard<'a> {
    file: &'a MappedFile,
    region: RwLockReadGuard<'a, Option<Region>>,
}

impl<'a> ReadGuard<'a> {
    pub(crate) fn new(file: &'a MappedFile, region: RwLockReadGuard<'a, Option<Region>>) -> Self {
        Self { file, region }
    }

    /// Same as [`MappedFile::read`], without re-taking the lock.
    ///
    /// # Errors
    ///
    /// See [`MappedFile::read`].
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.read_mapped(self.region.as_ref(), offset, buf)
    }

    /// Current read boundary.
    #[must_use]
    pub fn read_position(&self) -> u64 {
        self.file.read_position()
    }
}

/// Visible bytes of the mapping, frozen at the read boundary observed when
/// the view was taken.
pub struct MappedBytes<'a> {
    region: RwLockReadGuard<'a, Option<Region>>,
    len: usize,
}

impl<'a> MappedBytes<'a> {
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn new(region: RwLockReadGuard<'a, Option<Region>>, visible: u64) -> Self {
        let mapped = region.as_ref().map_or(0, Region::len);
        let len = (visible as usize).min(mapped);
        Self { region, len }
    }
}

impl Deref for MappedBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.region.as_ref() {
            // SAFETY: [0, len) was visible when the view was taken; writers only
            // touch bytes past the boundary, and repositioning below it or
            // remapping needs the exclusive lock this view blocks.
            Some(region) => unsafe { region.slice(0, self.len) },
            None => &[],
        }
    }
}

impl std::fmt::Debug for MappedBytes<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedBytes").field("len", &self.len).finish()
    }
}
