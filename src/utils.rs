//! Utility helpers for page size, capacity checks and visible-range math.

use crate::errors::{MappedFileError, Result};

/// Get the system page size in bytes.
#[must_use]
pub fn page_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "windows")] {
            windows_page_size()
        } else {
            unix_page_size()
        }
    }
}

#[cfg(target_os = "windows")]
fn windows_page_size() -> usize {
    use std::mem::MaybeUninit;
    #[allow(non_snake_case)]
    #[repr(C)]
    struct SYSTEM_INFO {
        wProcessorArchitecture: u16,
        wReserved: u16,
        dwPageSize: u32,
        lpMinimumApplicationAddress: *mut core::ffi::c_void,
        lpMaximumApplicationAddress: *mut core::ffi::c_void,
        dwActiveProcessorMask: usize,
        dwNumberOfProcessors: u32,
        dwProcessorType: u32,
        dwAllocationGranularity: u32,
        wProcessorLevel: u16,
        wProcessorRevision: u16,
    }
    extern "system" {
        fn GetSystemInfo(lpSystemInfo: *mut SYSTEM_INFO);
    }
    let mut sysinfo = MaybeUninit::<SYSTEM_INFO>::uninit();
    // SAFETY: GetSystemInfo fully initializes the struct it is given.
    unsafe {
        GetSystemInfo(sysinfo.as_mut_ptr());
        sysinfo.assume_init().dwPageSize as usize
    }
}

#[cfg(not(target_os = "windows"))]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn unix_page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE is safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE).max(0) as usize }
}

/// Check that `len` bytes starting at `position` fit in `capacity`.
///
/// # Errors
///
/// Returns `MappedFileError::WriteBeyond` when `position + len > capacity`.
pub fn ensure_capacity(position: u64, len: u64, capacity: u64) -> Result<()> {
    match position.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(MappedFileError::WriteBeyond {
            position,
            len,
            capacity,
        }),
    }
}

/// Number of bytes a read of `want` bytes at `offset` may copy when only
/// `[0, boundary)` is visible.
///
/// A read starting exactly at the boundary is only allowed when it asks for
/// nothing; otherwise it would observe bytes that are not yet visible.
///
/// # Errors
///
/// Returns `MappedFileError::ReadBeyond` if `offset` lies beyond the boundary.
#[allow(clippy::cast_possible_truncation)]
pub fn visible_len(offset: u64, want: usize, boundary: u64) -> Result<usize> {
    if offset > boundary || (offset == boundary && want > 0) {
        return Err(MappedFileError::ReadBeyond { offset, boundary });
    }
    // boundary - offset never exceeds the mapping length, which fits in usize
    Ok(want.min((boundary - offset) as usize))
}
