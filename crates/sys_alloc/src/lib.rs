//! Aligned anonymous memory regions mapped straight from the OS.
//!
//! Memory handed out by this crate never passes through the Rust global
//! allocator, so it is invisible to any tracing heap built on top of it.

use std::io;

#[cfg(all(unix, not(miri)))]
mod unix;
#[cfg(all(unix, not(miri)))]
use unix as os;

#[cfg(all(windows, not(miri)))]
mod windows;
#[cfg(all(windows, not(miri)))]
use windows as os;

#[cfg(miri)]
mod fallback;
#[cfg(miri)]
use fallback as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
pub fn allocation_granularity() -> usize {
    os::allocation_granularity()
}

/// Rounds `n` up to the next multiple of `align`, which must be a power of two.
///
/// Returns `None` on overflow.
#[must_use]
pub const fn align_up(n: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match n.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// An anonymous read-write region whose start is aligned to a requested boundary.
///
/// The region is zero-filled when mapped and unmapped when dropped.
pub struct Region {
    inner: os::RegionInner,
}

impl Region {
    /// Maps `len` bytes aligned to `align`.
    ///
    /// `align` must be a power of two. Alignments below the page size are
    /// rounded up to the page size, and `len` is rounded up to a whole number
    /// of pages.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length or a non power-of-two
    /// alignment, and the OS error if the mapping fails.
    pub fn map_aligned(len: usize, align: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        if !align.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }

        let page = page_size();
        let align = align.max(page);
        let len = align_up(len, page)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "length overflows"))?;

        // SAFETY: len and align were validated above.
        let inner = unsafe { os::RegionInner::map_aligned(len, align)? };
        debug_assert_eq!(inner.ptr() as usize & (align - 1), 0);
        Ok(Self { inner })
    }

    /// Returns a pointer to the start of the region.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the region in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the region is empty. Mapped regions never are.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns `true` if `addr` lies inside the region.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.ptr() as usize;
        addr >= base && addr - base < self.len()
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

// SAFETY: a Region exclusively owns its mapping; the pointer is only an address.
unsafe impl Send for Region {}
// SAFETY: &Region exposes no interior mutation.
unsafe impl Sync for Region {}
