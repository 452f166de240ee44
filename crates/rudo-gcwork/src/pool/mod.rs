//! Global work buffer pool.
//!
//! Two lock-free stacks hold every buffer not owned by a worker: `empty`
//! (count 0) and `full` (count > 0, possibly partially filled). When both run
//! dry, `get_empty` carves a new span into buffers under the span lock. At the
//! end of marking, once `full` is confirmed empty, spans are handed back to the
//! memory provider in small batches.
//!
//! # Lifecycle
//!
//! 1. Build the pool with [`WorkPool::builder`] (or [`WorkPool::new`]) before
//!    the first worker touches it.
//! 2. During marking, workers go through [`MarkQueue`](crate::MarkQueue),
//!    which only ever moves whole buffers in and out of the pool.
//! 3. After every queue has been disposed, call [`WorkPool::prepare_free`]
//!    and then [`WorkPool::free_all`] (or [`WorkPool::free_batch`] from a
//!    background task) with the phase set to [`GcPhase::Off`].

mod provider;
mod spans;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

pub use provider::{MemoryProvider, SpanClass, SysAllocProvider};

use self::spans::{Span, SpanDirectory, SpanRegistry};
use crate::config::{ConfigError, PoolConfig};
use crate::fatal::{throw, Fatal};
use crate::lfstack::{self, LfNode, LfStack, NodeArena, NodeId};
use crate::metrics::{PoolCounters, PoolStats};
use crate::phase::{GcPhase, NoSignal, PhaseCell, ScanWorkCounter, ScanWorkSink, WorkSignal};
use crate::workbuf::{BufLayout, WorkBuf};

/// Shared pool of mark work buffers.
///
/// Buffers only ever move through the pool's own stacks. The pool is not a
/// [`NodeArena`], so a buffer cannot be linked onto any other [`LfStack`]:
///
/// ```compile_fail
/// use rudo_gcwork::{LfStack, PoolConfig, WorkPool};
///
/// let pool = WorkPool::new(PoolConfig::default()).unwrap();
/// let held = pool.get_empty();
/// let stack = LfStack::new();
/// stack.push(&pool, held.id());
/// ```
pub struct WorkPool {
    config: PoolConfig,
    layout: BufLayout,
    empty: CachePadded<LfStack>,
    full: CachePadded<LfStack>,
    spans: Mutex<SpanRegistry>,
    directory: SpanDirectory,
    provider: Box<dyn MemoryProvider>,
    phase: PhaseCell,
    signal: Box<dyn WorkSignal>,
    bytes_marked: AtomicU64,
    scan_work: Arc<dyn ScanWorkSink>,
    counters: PoolCounters,
}

/// Assembles a [`WorkPool`] with non-default collaborators.
pub struct WorkPoolBuilder {
    config: PoolConfig,
    provider: Option<Box<dyn MemoryProvider>>,
    signal: Option<Box<dyn WorkSignal>>,
    scan_work: Option<Arc<dyn ScanWorkSink>>,
}

impl WorkPoolBuilder {
    /// Use `provider` for span memory instead of [`SysAllocProvider`].
    #[must_use]
    pub fn provider(mut self, provider: impl MemoryProvider + 'static) -> Self {
        self.provider = Some(Box::new(provider));
        self
    }

    /// Call `signal` whenever work is published during marking.
    #[must_use]
    pub fn work_signal(mut self, signal: impl WorkSignal + 'static) -> Self {
        self.signal = Some(Box::new(signal));
        self
    }

    /// Send disposed heap scan work to `sink` instead of a private counter.
    #[must_use]
    pub fn scan_work_sink(mut self, sink: Arc<dyn ScanWorkSink>) -> Self {
        self.scan_work = Some(sink);
        self
    }

    /// Builds the pool. No memory is mapped until the first buffer is needed.
    ///
    /// # Errors
    ///
    /// Returns the configuration error, if any.
    pub fn build(self) -> Result<WorkPool, ConfigError> {
        let config = self.config;
        config.validate()?;
        Ok(WorkPool {
            config,
            layout: config.layout(),
            empty: CachePadded::new(LfStack::new()),
            full: CachePadded::new(LfStack::new()),
            spans: Mutex::new(SpanRegistry::default()),
            directory: SpanDirectory::new(
                config.max_spans,
                config.buffers_per_span(),
                config.buffer_bytes,
            ),
            provider: self
                .provider
                .unwrap_or_else(|| Box::new(SysAllocProvider::new())),
            phase: PhaseCell::new(GcPhase::Off),
            signal: self.signal.unwrap_or_else(|| Box::new(NoSignal)),
            bytes_marked: AtomicU64::new(0),
            scan_work: self
                .scan_work
                .unwrap_or_else(|| Arc::new(ScanWorkCounter::new())),
            counters: PoolCounters::default(),
        })
    }
}

impl WorkPool {
    /// Pool backed by OS-mapped spans with no work signal.
    ///
    /// # Errors
    ///
    /// Returns the configuration error, if any.
    pub fn new(config: PoolConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    /// Starts building a pool.
    #[must_use]
    pub fn builder(config: PoolConfig) -> WorkPoolBuilder {
        WorkPoolBuilder {
            config,
            provider: None,
            signal: None,
            scan_work: None,
        }
    }

    /// The pool's configuration.
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Entries per buffer.
    #[must_use]
    pub const fn buffer_capacity(&self) -> usize {
        self.layout.capacity()
    }

    /// Current collector phase.
    #[must_use]
    pub fn phase(&self) -> GcPhase {
        self.phase.get()
    }

    /// Moves the collector to `phase`.
    pub fn set_phase(&self, phase: GcPhase) {
        self.phase.set(phase);
    }

    /// Bytes marked by all disposed queues.
    #[must_use]
    pub fn bytes_marked(&self) -> u64 {
        self.bytes_marked.load(Ordering::Relaxed)
    }

    /// Returns `true` if no buffer is waiting on the full list.
    #[must_use]
    pub fn full_is_empty(&self) -> bool {
        self.full.is_empty()
    }

    /// Snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let spans = self.spans.lock();
        self.counters.snapshot(spans.busy.len(), spans.free.len())
    }

    /// Arena view for the crate's own stacks over this pool's buffers.
    pub(crate) const fn arena(&self) -> PoolArena<'_> {
        PoolArena(self)
    }

    /// Handle for a buffer the caller owns: just popped from a stack of this
    /// pool, or the head of a stack only the caller can reach.
    pub(crate) fn claim(&self, id: NodeId) -> WorkBuf<'_> {
        let header = self.directory.header(id);
        // SAFETY: callers only pass ids they own exclusively.
        unsafe { WorkBuf::from_raw(id, header, self.layout.capacity()) }
    }

    /// Checks `buf` came from this pool and returns its id.
    pub(crate) fn adopt(&self, buf: WorkBuf<'_>) -> NodeId {
        if self.directory.header(buf.id()) != buf.header() {
            throw(Fatal::ForeignBuffer {
                index: buf.id().index(),
            });
        }
        buf.into_id()
    }

    /// Takes an empty buffer, allocating more if none are left.
    pub fn get_empty(&self) -> WorkBuf<'_> {
        if let Some(id) = self.empty.pop(&self.arena()) {
            let buf = self.claim(id);
            if !buf.is_empty() {
                throw(Fatal::BufferNotEmpty { len: buf.len() });
            }
            return buf;
        }
        self.refill()
    }

    /// Returns an empty buffer to the pool. Fatal if it holds entries.
    pub fn put_empty<'p>(&'p self, buf: WorkBuf<'p>) {
        if !buf.is_empty() {
            throw(Fatal::BufferNotEmpty { len: buf.len() });
        }
        let id = self.adopt(buf);
        self.empty.push(&self.arena(), id);
    }

    /// Publishes a non-empty buffer for any worker to take.
    ///
    /// Partially filled buffers are accepted: a worker that balances or
    /// disposes mid-cycle must be able to give work away rather than hoard it.
    pub fn put_full<'p>(&'p self, buf: WorkBuf<'p>) {
        if buf.is_empty() {
            throw(Fatal::BufferEmpty);
        }
        let id = self.adopt(buf);
        PoolCounters::bump(&self.counters.full_puts, 1);
        self.full.push(&self.arena(), id);
    }

    /// Takes a published buffer if one is immediately available. Never waits.
    pub fn try_get_full(&self) -> Option<WorkBuf<'_>> {
        let id = self.full.pop(&self.arena())?;
        let buf = self.claim(id);
        if buf.is_empty() {
            throw(Fatal::BufferEmpty);
        }
        Some(buf)
    }

    /// Splits `buf` for stealing.
    ///
    /// The upper half of `buf` moves into a fresh buffer that is returned to
    /// the caller; `buf` itself, still holding the lower half, is published.
    pub fn handoff<'p>(&'p self, mut buf: WorkBuf<'p>) -> WorkBuf<'p> {
        let mut half = self.get_empty();
        buf.split_upper_half_into(&mut half);
        crate::tracing::log_handoff(half.len(), buf.len());
        self.put_full(buf);
        half
    }

    #[cold]
    fn refill(&self) -> WorkBuf<'_> {
        let reused = self.spans.lock().reuse_free();
        let (span, fresh) = match reused {
            Some(span) => {
                PoolCounters::bump(&self.counters.spans_reused, 1);
                crate::tracing::log_span_reuse(span.slot, self.directory.buffers_per_span());
                (span, false)
            }
            None => (self.map_span(), true),
        };

        let first = self.carve(span, 0, fresh);
        for i in 1..self.directory.buffers_per_span() {
            let buf = self.carve(span, i, fresh);
            self.put_empty(buf);
        }
        PoolCounters::bump(
            &self.counters.buffers_carved,
            self.directory.buffers_per_span(),
        );
        first
    }

    fn carve(&self, span: Span, i: usize, fresh: bool) -> WorkBuf<'_> {
        let id = self.directory.node_id(span.slot, i);
        let header = self.directory.header_in(span, i);
        // SAFETY: the span is busy and none of its buffers are on a stack:
        // either it was just mapped, or prepare_free retired it and wiped the
        // empty list. Fresh spans get a zeroed push count; reused ones keep
        // theirs.
        let buf = unsafe { WorkBuf::init(id, header, self.layout.capacity(), !fresh) };
        lfstack::validate_node(&self.arena(), id, header.as_ptr() as usize);
        buf
    }

    fn map_span(&self) -> Span {
        let bytes = self.config.span_bytes;
        let slot = self.spans.lock().claim_slot(self.config.max_spans);
        let Some(slot) = slot else {
            throw(Fatal::SpanDirectoryFull {
                max_spans: self.config.max_spans,
            });
        };
        let Some(base) = self
            .provider
            .alloc_span(bytes, sys_alloc::page_size(), SpanClass::WorkBuf)
        else {
            self.spans.lock().release_slot(slot);
            throw(Fatal::OutOfMemory { bytes });
        };

        let span = Span { slot, base };
        self.directory.install(span);
        self.spans.lock().busy.push(span);
        PoolCounters::bump(&self.counters.spans_mapped, 1);
        crate::tracing::log_span_alloc(slot, bytes, self.directory.buffers_per_span());
        span
    }

    /// Moves every busy span to the free set so it can be reclaimed.
    ///
    /// Reclaiming while the full list still holds work is fatal.
    ///
    /// # Safety
    ///
    /// Every buffer must be back on the empty list: all queues disposed, the
    /// full list drained and no [`WorkBuf`] held by the caller. Spans moved
    /// to the free set are carved afresh when reused.
    pub unsafe fn prepare_free(&self) {
        let mut spans = self.spans.lock();
        if !self.full.is_empty() {
            throw(Fatal::FreeWithPendingWork);
        }
        // Every buffer is on the empty list, so which span each came from no
        // longer matters.
        self.empty.clear();
        let moved = spans.retire_busy();
        crate::tracing::log_prepare_free(moved);
    }

    /// Returns up to `free_batch_spans` idle spans to the memory provider.
    ///
    /// Does nothing unless the phase is [`GcPhase::Off`]. Returns `true` if
    /// idle spans remain and this should be called again.
    ///
    /// # Safety
    ///
    /// No [`WorkBuf`] obtained from this pool may be alive: the memory
    /// behind freed spans is unmapped.
    pub unsafe fn free_batch(&self) -> bool {
        let mut spans = self.spans.lock();
        if self.phase.get() != GcPhase::Off || spans.free.is_empty() {
            return false;
        }

        let mut freed = 0;
        while freed < self.config.free_batch_spans {
            let Some(span) = spans.free.pop() else {
                break;
            };
            self.directory.vacate(span.slot);
            spans.release_slot(span.slot);
            // SAFETY: the span came from this provider and, per the caller's
            // contract, nothing references it.
            unsafe {
                self.provider
                    .free_span(span.base, self.config.span_bytes, SpanClass::WorkBuf);
            }
            freed += 1;
        }
        PoolCounters::bump(&self.counters.spans_freed, freed);

        let remaining = spans.free.len();
        crate::tracing::log_free_batch(freed, remaining);
        remaining > 0
    }

    /// Frees every idle span, yielding the thread between batches.
    ///
    /// # Safety
    ///
    /// Same contract as [`WorkPool::free_batch`].
    pub unsafe fn free_all(&self) {
        let _span = crate::tracing::span_reclaim(self.spans.lock().free.len());
        // SAFETY: forwarded from the caller.
        while unsafe { self.free_batch() } {
            std::thread::yield_now();
        }
    }

    pub(crate) fn add_bytes_marked(&self, bytes: u64) {
        self.bytes_marked.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_heap_scan_work(&self, work: i64) {
        self.scan_work.add_heap_scan_work(work);
    }

    /// Tells idle workers about freshly published work, if marking.
    pub(crate) fn enlist_worker(&self) {
        if self.phase.get() == GcPhase::Mark {
            self.signal.enlist_worker();
        }
    }
}

/// Resolves buffer ids of one pool. Never exposed: outside the crate a
/// stack could relink buffers sitting on `empty` or `full`.
#[derive(Clone, Copy)]
pub(crate) struct PoolArena<'a>(&'a WorkPool);

// SAFETY: ids resolve through the span directory, whose slots stay installed
// for as long as any buffer of that span can be on a stack (until free_batch,
// whose contract rules that out).
unsafe impl NodeArena for PoolArena<'_> {
    fn node(&self, id: NodeId) -> &LfNode {
        let header = self.0.directory.header(id);
        // SAFETY: the header lies in a mapped span and the node is only
        // accessed through its atomics.
        unsafe { &(*header.as_ptr()).node }
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        let bytes = self.config.span_bytes;
        let spans = self.spans.get_mut();
        for span in spans.busy.drain(..).chain(spans.free.drain(..)) {
            // SAFETY: no WorkBuf can outlive the pool it borrows from.
            unsafe {
                self.provider
                    .free_span(span.base, bytes, SpanClass::WorkBuf);
            }
        }
    }
}

impl fmt::Debug for WorkPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkPool")
            .field("config", &self.config)
            .field("phase", &self.phase.get())
            .field("empty", &!self.empty.is_empty())
            .field("full", &!self.full.is_empty())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;
    use std::sync::atomic::AtomicUsize;

    fn pool(capacity: usize) -> WorkPool {
        WorkPool::new(PoolConfig::with_capacity(capacity)).unwrap()
    }

    #[test]
    fn test_get_empty_carves_a_span() {
        let pool = pool(4);
        let buf = pool.get_empty();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 4);

        let stats = pool.stats();
        assert_eq!(stats.spans_mapped, 1);
        assert_eq!(stats.spans_busy, 1);
        assert_eq!(stats.buffers_carved, pool.config().buffers_per_span());
        pool.put_empty(buf);
    }

    #[test]
    fn test_get_empty_reuses_before_mapping() {
        let pool = pool(4);
        let per_span = pool.config().buffers_per_span();
        let bufs: Vec<_> = (0..per_span).map(|_| pool.get_empty()).collect();
        assert_eq!(pool.stats().spans_mapped, 1);
        let extra = pool.get_empty();
        assert_eq!(pool.stats().spans_mapped, 2);
        pool.put_empty(extra);
        for buf in bufs {
            pool.put_empty(buf);
        }
    }

    #[test]
    fn test_full_roundtrip() {
        let pool = pool(4);
        assert!(pool.try_get_full().is_none());

        let mut buf = pool.get_empty();
        buf.push(0x10);
        buf.push(0x20);
        pool.put_full(buf);
        assert!(!pool.full_is_empty());
        assert_eq!(pool.stats().full_puts, 1);

        let mut buf = pool.try_get_full().expect("published buffer");
        assert_eq!(buf.as_slice(), &[0x10, 0x20]);
        assert!(pool.try_get_full().is_none());
        buf.clear();
        pool.put_empty(buf);
    }

    #[test]
    fn test_handoff_splits_in_half() {
        let pool = pool(8);
        let mut buf = pool.get_empty();
        buf.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7]);
        let mut kept = pool.handoff(buf);
        assert_eq!(kept.as_slice(), &[5, 6, 7]);

        let mut published = pool.try_get_full().unwrap();
        assert_eq!(published.as_slice(), &[1, 2, 3, 4]);
        kept.clear();
        published.clear();
        pool.put_empty(kept);
        pool.put_empty(published);
    }

    #[test]
    #[should_panic(expected = "workbuf is not empty")]
    fn test_put_empty_rejects_entries() {
        let pool = pool(4);
        let mut buf = pool.get_empty();
        buf.push(1);
        pool.put_empty(buf);
    }

    #[test]
    #[should_panic(expected = "workbuf is empty")]
    fn test_put_full_rejects_empty() {
        let pool = pool(4);
        let buf = pool.get_empty();
        pool.put_full(buf);
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn test_put_rejects_foreign_buffer() {
        let a = pool(4);
        let b = pool(4);
        let _warm = b.get_empty();
        let buf = a.get_empty();
        b.put_empty(buf);
    }

    #[test]
    fn test_prepare_free_and_reclaim() {
        let pool = pool(4);
        let per_span = pool.config().buffers_per_span();
        let bufs: Vec<_> = (0..=per_span * 2).map(|_| pool.get_empty()).collect();
        for buf in bufs {
            pool.put_empty(buf);
        }
        let mapped = pool.stats().spans_mapped;
        assert_eq!(mapped, 3);

        unsafe { pool.prepare_free() };
        let stats = pool.stats();
        assert_eq!(stats.spans_busy, 0);
        assert_eq!(stats.spans_free, mapped);

        unsafe { pool.free_all() };
        let stats = pool.stats();
        assert_eq!(stats.spans_free, 0);
        assert_eq!(stats.spans_freed, mapped);

        // The pool still works after reclamation.
        let buf = pool.get_empty();
        assert_eq!(pool.stats().spans_mapped, mapped + 1);
        pool.put_empty(buf);
    }

    #[test]
    fn test_free_batch_is_bounded() {
        let mut config = PoolConfig::with_capacity(4);
        config.set_free_batch_spans(1);
        let pool = WorkPool::new(config).unwrap();
        let per_span = config.buffers_per_span();
        let bufs: Vec<_> = (0..per_span * 3).map(|_| pool.get_empty()).collect();
        for buf in bufs {
            pool.put_empty(buf);
        }
        unsafe { pool.prepare_free() };
        assert_eq!(pool.stats().spans_free, 3);

        assert!(unsafe { pool.free_batch() });
        assert!(unsafe { pool.free_batch() });
        assert!(!unsafe { pool.free_batch() });
        assert_eq!(pool.stats().spans_freed, 3);
    }

    #[test]
    fn test_free_batch_waits_for_phase_off() {
        let pool = pool(4);
        let buf = pool.get_empty();
        pool.put_empty(buf);
        unsafe { pool.prepare_free() };
        pool.set_phase(GcPhase::Mark);
        assert!(!unsafe { pool.free_batch() });
        assert_eq!(pool.stats().spans_free, 1);
        pool.set_phase(GcPhase::Off);
        assert!(!unsafe { pool.free_batch() });
        assert_eq!(pool.stats().spans_free, 0);
    }

    #[test]
    fn test_reused_span_after_prepare_free() {
        let pool = pool(4);
        let buf = pool.get_empty();
        pool.put_empty(buf);
        unsafe { pool.prepare_free() };

        let buf = pool.get_empty();
        let stats = pool.stats();
        assert_eq!(stats.spans_reused, 1);
        assert_eq!(stats.spans_mapped, 1);
        assert_eq!(stats.spans_busy, 1);
        pool.put_empty(buf);
    }

    #[test]
    #[should_panic(expected = "cannot free workbufs")]
    fn test_prepare_free_with_pending_work() {
        let pool = pool(4);
        let mut buf = pool.get_empty();
        buf.push(1);
        pool.put_full(buf);
        unsafe { pool.prepare_free() };
    }

    struct Exhausted;

    unsafe impl MemoryProvider for Exhausted {
        fn alloc_span(&self, _: usize, _: usize, _: SpanClass) -> Option<NonNull<u8>> {
            None
        }

        unsafe fn free_span(&self, _: NonNull<u8>, _: usize, _: SpanClass) {}
    }

    #[test]
    #[should_panic(expected = "out of memory")]
    fn test_provider_exhaustion_is_fatal() {
        let pool = WorkPool::builder(PoolConfig::default())
            .provider(Exhausted)
            .build()
            .unwrap();
        let _ = pool.get_empty();
    }

    #[test]
    #[should_panic(expected = "span directory full")]
    fn test_directory_exhaustion_is_fatal() {
        let mut config = PoolConfig::with_capacity(4);
        config.set_max_spans(1);
        let pool = WorkPool::new(config).unwrap();
        let _bufs: Vec<_> = (0..=config.buffers_per_span())
            .map(|_| pool.get_empty())
            .collect();
    }

    #[test]
    fn test_enlist_only_while_marking() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let pool = WorkPool::builder(PoolConfig::default())
            .work_signal(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .build()
            .unwrap();

        pool.enlist_worker();
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        pool.set_phase(GcPhase::Mark);
        pool.enlist_worker();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        pool.set_phase(GcPhase::MarkTermination);
        pool.enlist_worker();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_held_buffer_is_never_handed_out_again() {
        let pool = pool(4);
        let held = pool.get_empty();
        let top = pool.get_empty();
        let top_id = top.id();
        pool.put_empty(top);

        let per_span = pool.config().buffers_per_span();
        let taken: Vec<_> = (0..per_span * 2).map(|_| pool.get_empty()).collect();
        assert_eq!(taken[0].id(), top_id);
        assert!(taken.iter().all(|buf| buf.id() != held.id()));

        for buf in taken {
            pool.put_empty(buf);
        }
        pool.put_empty(held);
    }

    #[test]
    fn test_buffers_are_validated_nodes() {
        let pool = pool(4);
        let buf = pool.get_empty();
        let addr = std::ptr::from_ref(pool.arena().node(buf.id())) as usize;
        assert_eq!(addr, buf.header().as_ptr() as usize);
        pool.put_empty(buf);
    }
}
