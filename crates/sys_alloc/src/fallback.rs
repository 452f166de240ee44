//! Miri has no `mmap`/`VirtualAlloc`; regions come from `std::alloc` instead.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io::{self, Error};

pub const fn page_size() -> usize {
    4096
}

pub const fn allocation_granularity() -> usize {
    4096
}

pub struct RegionInner {
    ptr: *mut u8,
    layout: Layout,
}

impl RegionInner {
    pub unsafe fn map_aligned(len: usize, align: usize) -> io::Result<Self> {
        let layout = Layout::from_size_align(len, align)
            .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::from(io::ErrorKind::OutOfMemory));
        }
        Ok(Self { ptr, layout })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub const fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}
