use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Attempts to win the race between releasing an over-sized reservation and
/// re-reserving its aligned interior.
const ALIGN_ATTEMPTS: usize = 8;

fn system_info() -> SYSTEM_INFO {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

/// Returns the system allocation granularity.
///
/// `VirtualAlloc` addresses must be aligned to this value (typically 64KB),
/// which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    match system_info().dwAllocationGranularity as usize {
        0 => 65536,
        gran => gran,
    }
}

pub fn page_size() -> usize {
    match system_info().dwPageSize as usize {
        0 => 4096,
        size => size,
    }
}

pub struct RegionInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl RegionInner {
    /// Reserves and commits `len` bytes at an `align`-aligned address.
    ///
    /// Windows cannot release part of a reservation, so this reserves
    /// `len + align`, releases it, and re-reserves exactly at the aligned
    /// address inside it. Another thread may grab that range in between, in
    /// which case the dance is retried.
    ///
    /// # Safety
    ///
    /// `len` must be non-zero and `align` a power of two.
    pub unsafe fn map_aligned(len: usize, align: usize) -> io::Result<Self> {
        if align <= allocation_granularity() {
            let ptr =
                unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
            if ptr.is_null() {
                return Err(Error::last_os_error());
            }
            return Ok(Self { ptr, len });
        }

        let padded = len
            .checked_add(align)
            .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?;

        for _ in 0..ALIGN_ATTEMPTS {
            let reserved = unsafe { VirtualAlloc(ptr::null(), padded, MEM_RESERVE, PAGE_READWRITE) };
            if reserved.is_null() {
                return Err(Error::last_os_error());
            }
            let aligned = (reserved as usize + align - 1) & !(align - 1);
            unsafe {
                // MEM_RELEASE requires dwSize to be 0
                VirtualFree(reserved, 0, MEM_RELEASE);
            }

            let ptr = unsafe {
                VirtualAlloc(
                    aligned as *const std::ffi::c_void,
                    len,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_READWRITE,
                )
            };
            if !ptr.is_null() {
                return Ok(Self { ptr, len });
            }
        }

        Err(Error::new(
            io::ErrorKind::AddrInUse,
            "could not reserve an aligned region",
        ))
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}
