//! Source of the memory that work buffers live in.
//!
//! Work buffers must sit outside any traced heap: the collector must never
//! scan (or free) its own mark work. Providers hand out raw spans that the
//! pool carves up itself.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use sys_alloc::Region;

/// Accounting class of a span request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum SpanClass {
    /// Ordinary managed heap memory.
    Heap = 0,
    /// Collector work buffer storage.
    WorkBuf = 1,
}

impl SpanClass {
    const COUNT: usize = 2;
}

/// Allocates and frees spans of manually managed memory.
///
/// # Safety
///
/// A span returned by `alloc_span` must be writable, at least `bytes` long,
/// aligned to `align`, disjoint from every other live span, and untouched by
/// anyone else until passed back to `free_span`.
pub unsafe trait MemoryProvider: Send + Sync {
    /// Allocates a span, or `None` if memory is exhausted.
    fn alloc_span(&self, bytes: usize, align: usize, class: SpanClass) -> Option<NonNull<u8>>;

    /// Returns a span.
    ///
    /// # Safety
    ///
    /// `base`, `bytes` and `class` must match an earlier `alloc_span` whose
    /// span has not been freed yet, and nothing may access it afterwards.
    unsafe fn free_span(&self, base: NonNull<u8>, bytes: usize, class: SpanClass);
}

/// [`MemoryProvider`] that maps every span straight from the OS.
#[derive(Debug, Default)]
pub struct SysAllocProvider {
    regions: Mutex<HashMap<usize, Region>>,
    in_use: [AtomicUsize; SpanClass::COUNT],
}

impl SysAllocProvider {
    /// Creates a provider with no spans mapped.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently mapped for `class`.
    #[must_use]
    pub fn bytes_in_use(&self, class: SpanClass) -> usize {
        self.in_use[class as usize].load(Ordering::Relaxed)
    }

    /// Number of spans currently mapped.
    #[must_use]
    pub fn span_count(&self) -> usize {
        self.regions.lock().len()
    }
}

// SAFETY: each span is its own fresh mapping, owned by the map until freed.
unsafe impl MemoryProvider for SysAllocProvider {
    fn alloc_span(&self, bytes: usize, align: usize, class: SpanClass) -> Option<NonNull<u8>> {
        let region = Region::map_aligned(bytes, align).ok()?;
        let base = NonNull::new(region.ptr())?;
        self.in_use[class as usize].fetch_add(region.len(), Ordering::Relaxed);
        self.regions.lock().insert(base.as_ptr() as usize, region);
        Some(base)
    }

    unsafe fn free_span(&self, base: NonNull<u8>, bytes: usize, class: SpanClass) {
        let region = self.regions.lock().remove(&(base.as_ptr() as usize));
        if let Some(region) = region {
            debug_assert!(
                region.contains(base.as_ptr() as usize + bytes.max(1) - 1),
                "freed span of {bytes} bytes overruns its {}-byte mapping",
                region.len()
            );
            self.in_use[class as usize].fetch_sub(region.len(), Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_free() {
        let provider = SysAllocProvider::new();
        let page = sys_alloc::page_size();
        let span = provider
            .alloc_span(8 * page, page, SpanClass::WorkBuf)
            .expect("span");
        assert_eq!(span.as_ptr() as usize % page, 0);
        assert_eq!(provider.bytes_in_use(SpanClass::WorkBuf), 8 * page);
        assert_eq!(provider.bytes_in_use(SpanClass::Heap), 0);
        assert_eq!(provider.span_count(), 1);

        unsafe {
            span.as_ptr().write(7);
            provider.free_span(span, 8 * page, SpanClass::WorkBuf);
        }
        assert_eq!(provider.bytes_in_use(SpanClass::WorkBuf), 0);
        assert_eq!(provider.span_count(), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "overruns its")]
    fn test_free_span_checks_length() {
        let provider = SysAllocProvider::new();
        let page = sys_alloc::page_size();
        let span = provider.alloc_span(page, page, SpanClass::WorkBuf).unwrap();
        unsafe { provider.free_span(span, 2 * page, SpanClass::WorkBuf) };
    }

    #[test]
    fn test_classes_are_tracked_separately() {
        let provider = SysAllocProvider::new();
        let page = sys_alloc::page_size();
        let a = provider.alloc_span(page, page, SpanClass::Heap).unwrap();
        let b = provider.alloc_span(page, page, SpanClass::WorkBuf).unwrap();
        assert_eq!(provider.bytes_in_use(SpanClass::Heap), page);
        assert_eq!(provider.bytes_in_use(SpanClass::WorkBuf), page);
        unsafe {
            provider.free_span(a, page, SpanClass::Heap);
            provider.free_span(b, page, SpanClass::WorkBuf);
        }
    }
}
