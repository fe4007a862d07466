//! Mapping facade: the OS operations a [`MappedFile`](crate::MappedFile) needs
//! from its mapped region, behind a trait so they can be substituted.

use std::fmt;
use std::fs::File;
use std::io;

use memmap2::{Mmap, MmapMut, MmapOptions};

/// A mapping of a file into the address space.
///
/// Owned exclusively by one [`MappedFile`](crate::MappedFile). Dropping it
/// unmaps the memory, which also releases any page pins on it.
pub struct Region {
    map: MapVariant,
    // Base address captured at map time so writers and readers can address
    // disjoint ranges through a shared borrow.
    ptr: *mut u8,
    len: usize,
}

enum MapVariant {
    Empty,
    Ro(Mmap),
    Rw(MmapMut),
}

// SAFETY: the pointer addresses memory owned by `map`, which is itself Send
// and Sync. Every access through it is bounds-checked by the owner, and
// concurrent accesses are confined to disjoint ranges by the position protocol.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("len", &self.len)
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl Region {
    /// Map `len` bytes of `file`, writable or read-only.
    ///
    /// A zero length yields an empty region without calling into the OS.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the mapping fails or `len` does not fit the
    /// address space.
    pub fn map(file: &File, writable: bool, len: u64) -> io::Result<Self> {
        let len = usize::try_from(len).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "mapping length exceeds address space")
        })?;
        if len == 0 {
            return Ok(Self::empty());
        }
        let mut opts = MmapOptions::new();
        opts.len(len);
        if writable {
            // SAFETY: the file stays open for as long as the owner holds the
            // region, and the owner is the only writer through this mapping.
            let mut m = unsafe { opts.map_mut(file)? };
            let ptr = m.as_mut_ptr();
            Ok(Self {
                map: MapVariant::Rw(m),
                ptr,
                len,
            })
        } else {
            // SAFETY: read-only mapping of an open file.
            let m = unsafe { opts.map(file)? };
            let ptr = m.as_ptr().cast_mut();
            Ok(Self {
                map: MapVariant::Ro(m),
                ptr,
                len,
            })
        }
    }

    /// A region of length zero.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            map: MapVariant::Empty,
            ptr: std::ptr::NonNull::dangling().as_ptr(),
            len: 0,
        }
    }

    /// Mapped length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region maps zero bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether bytes may be copied into the region.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        matches!(self.map, MapVariant::Rw(_))
    }

    /// Flush `[offset, offset + len)` to stable storage. No-op for read-only
    /// or empty regions.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `msync`/`FlushViewOfFile`.
    pub fn flush_range(&self, offset: usize, len: usize) -> io::Result<()> {
        match &self.map {
            MapVariant::Rw(m) if len > 0 => m.flush_range(offset, len),
            _ => Ok(()),
        }
    }

    /// Copy `data` into the region at `offset`.
    ///
    /// # Safety
    ///
    /// The region must be writable, `offset + data.len()` must be within
    /// bounds, and no other thread may read or write that range concurrently.
    pub(crate) unsafe fn copy_in(&self, offset: usize, data: &[u8]) {
        debug_assert!(self.is_writable());
        debug_assert!(offset + data.len() <= self.len);
        std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
    }

    /// Copy bytes from the region at `offset` into `buf`.
    ///
    /// # Safety
    ///
    /// `offset + buf.len()` must be within bounds and no thread may write that
    /// range concurrently.
    pub(crate) unsafe fn copy_out(&self, offset: usize, buf: &mut [u8]) {
        debug_assert!(offset + buf.len() <= self.len);
        std::ptr::copy_nonoverlapping(self.ptr.add(offset), buf.as_mut_ptr(), buf.len());
    }

    /// Borrow `[offset, offset + len)` of the region.
    ///
    /// # Safety
    ///
    /// The range must be within bounds and must not be written while the
    /// returned slice is alive.
    pub(crate) unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts(self.ptr.add(offset), len)
    }

    fn base(&self) -> *const libc::c_void {
        self.ptr as *const libc::c_void
    }
}

/// OS memory-mapping operations used by [`MappedFile`](crate::MappedFile).
///
/// The default [`OsMapper`] goes straight to the OS; tests substitute
/// implementations that fail on demand.
pub trait Mapper: Send + Sync + fmt::Debug {
    /// Map `len` bytes of `file`.
    ///
    /// # Errors
    ///
    /// Returns the OS error when mapping fails.
    fn map(&self, file: &File, writable: bool, len: u64) -> io::Result<Region>;

    /// Release a mapping.
    ///
    /// # Errors
    ///
    /// Returns the OS error when unmapping fails.
    fn unmap(&self, region: Region) -> io::Result<()>;

    /// Flush a byte range of the mapping to stable storage.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the flush fails.
    fn flush(&self, region: &Region, offset: usize, len: usize) -> io::Result<()>;

    /// Pin the whole mapping in physical memory.
    ///
    /// # Errors
    ///
    /// Returns the OS error, typically a permission or rlimit failure.
    fn pin(&self, region: &Region) -> io::Result<()>;

    /// Undo [`Mapper::pin`].
    ///
    /// # Errors
    ///
    /// Returns the OS error when unpinning fails.
    fn unpin(&self, region: &Region) -> io::Result<()>;
}

/// [`Mapper`] backed by memmap2 and the platform lock calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsMapper;

impl Mapper for OsMapper {
    fn map(&self, file: &File, writable: bool, len: u64) -> io::Result<Region> {
        Region::map(file, writable, len)
    }

    fn unmap(&self, region: Region) -> io::Result<()> {
        drop(region);
        Ok(())
    }

    fn flush(&self, region: &Region, offset: usize, len: usize) -> io::Result<()> {
        region.flush_range(offset, len)
    }

    fn pin(&self, region: &Region) -> io::Result<()> {
        if region.is_empty() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            // SAFETY: base..base+len is a live mapping owned by `region`.
            if unsafe { libc::mlock(region.base(), region.len()) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        #[cfg(windows)]
        {
            extern "system" {
                fn VirtualLock(lpAddress: *const core::ffi::c_void, dwSize: usize) -> i32;
            }
            // SAFETY: base..base+len is a live mapping owned by `region`.
            if unsafe { VirtualLock(region.base().cast(), region.len()) } == 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(())
    }

    fn unpin(&self, region: &Region) -> io::Result<()> {
        if region.is_empty() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            // SAFETY: base..base+len is a live mapping owned by `region`.
            if unsafe { libc::munlock(region.base(), region.len()) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        #[cfg(windows)]
        {
            extern "system" {
                fn VirtualUnlock(lpAddress: *const core::ffi::c_void, dwSize: usize) -> i32;
            }
            // SAFETY: base..base+len is a live mapping owned by `region`.
            if unsafe { VirtualUnlock(region.base().cast(), region.len()) } == 0 {
                let err = io::Error::last_os_error();
                // ERROR_NOT_LOCKED: nothing was pinned
                if err.raw_os_error() != Some(158) {
                    return Err(err);
                }
            }
        }

        Ok(())
    }
}
