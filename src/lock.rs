//! Pinning the mapping in physical memory so its pages are not swapped out.

use crate::errors::{IoContext, MappedFileError, Result};
use crate::mmap::MappedFile;

impl MappedFile {
    /// Pin the whole mapping in physical memory.
    ///
    /// Usually needs elevated privileges or a raised memlock limit. The pin is
    /// dropped implicitly when the mapping is replaced by a resize or released
    /// by close.
    ///
    /// # Platform-specific behavior
    ///
    /// - **Unix**: `mlock`
    /// - **Windows**: `VirtualLock`
    ///
    /// # Errors
    ///
    /// Returns `Io` if the OS refuses, `NotMapped` if there is no mapping.
    pub fn mlock(&self) -> Result<()> {
        let region = self.region.read();
        let region = region.as_ref().ok_or(MappedFileError::NotMapped)?;
        self.mapper.pin(region).op("mlock")
    }

    /// Undo [`mlock`](MappedFile::mlock).
    ///
    /// # Errors
    ///
    /// Returns `Io` if the OS refuses, `NotMapped` if there is no mapping.
    pub fn munlock(&self) -> Result<()> {
        let region = self.region.read();
        let region = region.as_ref().ok_or(MappedFileError::NotMapped)?;
        self.mapper.unpin(region).op("munlock")
    }
}
