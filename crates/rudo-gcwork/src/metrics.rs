//! Work pool counters.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Snapshot of a [`WorkPool`](crate::WorkPool)'s counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Spans obtained from the memory provider.
    pub spans_mapped: usize,
    /// Times an idle span was reused instead of mapping a new one.
    pub spans_reused: usize,
    /// Spans returned to the memory provider.
    pub spans_freed: usize,
    /// Spans currently backing buffers.
    pub spans_busy: usize,
    /// Idle spans waiting to be freed or reused.
    pub spans_free: usize,
    /// Buffers carved out of spans (fresh or reused).
    pub buffers_carved: usize,
    /// Buffers published to the full list.
    pub full_puts: usize,
}

/// Live counters behind [`PoolStats`]. Relaxed: they are diagnostics.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) spans_mapped: AtomicUsize,
    pub(crate) spans_reused: AtomicUsize,
    pub(crate) spans_freed: AtomicUsize,
    pub(crate) buffers_carved: AtomicUsize,
    pub(crate) full_puts: AtomicUsize,
}

impl PoolCounters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, spans_busy: usize, spans_free: usize) -> PoolStats {
        PoolStats {
            spans_mapped: self.spans_mapped.load(Ordering::Relaxed),
            spans_reused: self.spans_reused.load(Ordering::Relaxed),
            spans_freed: self.spans_freed.load(Ordering::Relaxed),
            spans_busy,
            spans_free,
            buffers_carved: self.buffers_carved.load(Ordering::Relaxed),
            full_puts: self.full_puts.load(Ordering::Relaxed),
        }
    }
}
