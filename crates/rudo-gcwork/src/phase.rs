//! Collaborators outside the work layer: the collector phase, the
//! work-availability signal and the scan work accumulator.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

/// Collector phase as seen by the work pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum GcPhase {
    /// No collection in progress. Work buffer spans may be reclaimed.
    #[default]
    Off = 0,
    /// Concurrent marking. Publishing work wakes idle workers.
    Mark = 1,
    /// Mark termination. Work may still move, but nobody is woken for it.
    MarkTermination = 2,
}

impl GcPhase {
    #[must_use]
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Mark,
            2 => Self::MarkTermination,
            _ => Self::Off,
        }
    }
}

/// Shared, atomically readable [`GcPhase`].
#[derive(Debug, Default)]
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    /// Starts in `phase`.
    #[must_use]
    pub const fn new(phase: GcPhase) -> Self {
        Self(AtomicU8::new(phase as u8))
    }

    /// Current phase.
    #[must_use]
    pub fn get(&self) -> GcPhase {
        GcPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `phase`.
    pub fn set(&self, phase: GcPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

/// Fire-and-forget notification that work was published to the full list.
///
/// Only called while the phase is [`GcPhase::Mark`]. Implementations must not
/// block and must not call back into the queue that raised the signal.
pub trait WorkSignal: Send + Sync {
    /// Encourage an idle worker to start marking.
    fn enlist_worker(&self);
}

impl<F: Fn() + Send + Sync> WorkSignal for F {
    fn enlist_worker(&self) {
        self();
    }
}

/// A signal nobody listens to.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSignal;

impl WorkSignal for NoSignal {
    fn enlist_worker(&self) {}
}

/// Destination of heap scan work flushed by [`MarkQueue::dispose`].
///
/// [`MarkQueue::dispose`]: crate::MarkQueue::dispose
pub trait ScanWorkSink: Send + Sync {
    /// Adds `work` units of heap scan work.
    fn add_heap_scan_work(&self, work: i64);
}

/// Default [`ScanWorkSink`]: a plain atomic accumulator.
#[derive(Debug, Default)]
pub struct ScanWorkCounter(AtomicI64);

impl ScanWorkCounter {
    /// Starts at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    /// Total work accumulated so far.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Returns the total and resets it to zero.
    pub fn take(&self) -> i64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

impl ScanWorkSink for ScanWorkCounter {
    fn add_heap_scan_work(&self, work: i64) {
        self.0.fetch_add(work, Ordering::Relaxed);
    }
}
