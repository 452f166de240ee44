//! Per-worker mark queue.
//!
//! Each marking worker owns one [`MarkQueue`]. The queue keeps two buffers
//! locally so that a worker bouncing around a buffer boundary (push one,
//! pop one, push one...) swaps between its own buffers instead of hitting the
//! pool on every call. Only when both local buffers are full (or both empty)
//! does a whole buffer move to or from the pool.
//!
//! Queue state is single-owner: every operation takes `&mut self`, so a
//! queue can never be re-entered mid-mutation. The work signal only runs once
//! the queue is consistent again.
//!
//! A queue holding entries is not proof that work remains globally, and an
//! empty queue is not proof that it doesn't: other workers may hold work in
//! their own local buffers.

use std::fmt;
use std::mem;

use crate::lfstack::LfStack;
use crate::pool::WorkPool;
use crate::workbuf::WorkBuf;

/// The two locally cached buffers. They exist together or not at all.
struct Local<'p> {
    primary: WorkBuf<'p>,
    secondary: WorkBuf<'p>,
}

impl<'p> Local<'p> {
    /// Primary starts empty; secondary takes published work when there is some.
    fn acquire(pool: &'p WorkPool) -> Self {
        let primary = pool.get_empty();
        let secondary = pool
            .try_get_full()
            .unwrap_or_else(|| pool.get_empty());
        Self { primary, secondary }
    }

    fn swap(&mut self) {
        mem::swap(&mut self.primary, &mut self.secondary);
    }

    /// Makes room in the primary for at least one entry.
    ///
    /// Returns `true` if a buffer was published to the pool.
    fn make_room(&mut self, pool: &'p WorkPool) -> bool {
        if !self.primary.is_full() {
            return false;
        }
        self.swap();
        if !self.primary.is_full() {
            return false;
        }
        let full = mem::replace(&mut self.primary, pool.get_empty());
        pool.put_full(full);
        true
    }
}

/// A marking worker's view of the shared [`WorkPool`].
///
/// Entries are opaque `usize` words, normally grey object addresses.
///
/// Dropping a queue disposes it, returning its buffers to the pool.
///
/// # Examples
///
/// ```
/// use rudo_gcwork::{MarkQueue, PoolConfig, WorkPool};
///
/// let pool = WorkPool::new(PoolConfig::default()).unwrap();
/// let mut queue = MarkQueue::new(&pool);
/// queue.put(0x1000);
/// queue.put(0x2000);
/// assert_eq!(queue.try_get(), Some(0x2000));
/// assert_eq!(queue.try_get(), Some(0x1000));
/// assert_eq!(queue.try_get(), None);
/// ```
pub struct MarkQueue<'p> {
    pub(crate) pool: &'p WorkPool,
    local: Option<Local<'p>>,
    bytes_marked: u64,
    heap_scan_work: i64,
    flushed_work: bool,
    /// Relocation patch buffers, never visible to other workers.
    pub(crate) patches: LfStack,
}

impl<'p> MarkQueue<'p> {
    /// Creates a queue over `pool`. No buffers are taken until first use.
    #[must_use]
    pub fn new(pool: &'p WorkPool) -> Self {
        Self {
            pool,
            local: None,
            bytes_marked: 0,
            heap_scan_work: 0,
            flushed_work: false,
            patches: LfStack::new(),
        }
    }

    /// The pool this queue draws from.
    #[must_use]
    pub const fn pool(&self) -> &'p WorkPool {
        self.pool
    }

    fn local(&mut self) -> &mut Local<'p> {
        let pool = self.pool;
        self.local.get_or_insert_with(|| Local::acquire(pool))
    }

    fn published(&mut self) {
        self.flushed_work = true;
        self.pool.enlist_worker();
    }

    /// Queues `obj`.
    ///
    /// When the primary buffer is full it swaps with the secondary; if that
    /// one is full as well, it is published and replaced with an empty
    /// buffer.
    pub fn put(&mut self, obj: usize) {
        let pool = self.pool;
        let local = self.local();
        let flushed = local.make_room(pool);
        let pushed = local.primary.push(obj);
        debug_assert!(pushed);
        if flushed {
            self.published();
        }
    }

    /// Queues `obj` only if the primary buffer has room.
    ///
    /// Returns `false` (leaving the queue untouched) when the caller should
    /// fall back to [`put`](Self::put).
    #[inline]
    pub fn put_fast(&mut self, obj: usize) -> bool {
        self.local
            .as_mut()
            .is_some_and(|local| local.primary.push(obj))
    }

    /// Queues every entry of `objs`.
    ///
    /// Behaves exactly like calling [`put`](Self::put) for each entry in
    /// order, but copies whole runs into the primary buffer and only swaps or
    /// publishes at buffer boundaries.
    pub fn put_batch(&mut self, objs: &[usize]) {
        if objs.is_empty() {
            return;
        }
        let pool = self.pool;
        let local = self.local();
        let mut flushed = false;
        let mut rest = objs;
        while !rest.is_empty() {
            flushed |= local.make_room(pool);
            let n = local.primary.extend_from_slice(rest);
            rest = &rest[n..];
        }
        if flushed {
            self.published();
        }
    }

    /// Takes an entry, from local buffers first and then from the pool.
    ///
    /// `None` only means that nothing was immediately available to this
    /// worker.
    pub fn try_get(&mut self) -> Option<usize> {
        let pool = self.pool;
        let local = self.local();
        if local.primary.is_empty() {
            local.swap();
            if local.primary.is_empty() {
                let stolen = pool.try_get_full()?;
                let drained = mem::replace(&mut local.primary, stolen);
                pool.put_empty(drained);
            }
        }
        local.primary.pop()
    }

    /// Takes an entry from the primary buffer only. Never swaps or touches
    /// the pool.
    #[inline]
    pub fn try_get_fast(&mut self) -> Option<usize> {
        self.local.as_mut()?.primary.pop()
    }

    /// Returns every local buffer to the pool and flushes the counters.
    ///
    /// Must be called whenever a worker stops marking for good, so that
    /// termination detection never races against unpublished local work.
    /// Pending relocation patches are discarded. The queue can be used again
    /// afterwards.
    pub fn dispose(&mut self) {
        let pool = self.pool;
        if let Some(Local { primary, secondary }) = self.local.take() {
            for buf in [primary, secondary] {
                if buf.is_empty() {
                    pool.put_empty(buf);
                } else {
                    pool.put_full(buf);
                    self.flushed_work = true;
                }
            }
        }
        if self.bytes_marked != 0 {
            pool.add_bytes_marked(mem::take(&mut self.bytes_marked));
        }
        if self.heap_scan_work != 0 {
            pool.add_heap_scan_work(mem::take(&mut self.heap_scan_work));
        }
        self.discard_patches();
    }

    /// Gives some locally cached work to the pool.
    ///
    /// Publishes the secondary buffer if it holds anything; otherwise splits
    /// the primary if it holds more than
    /// [`balance_threshold`](crate::PoolConfig::balance_threshold) entries.
    /// Neither case changes the total number of queued entries.
    pub fn balance(&mut self) {
        let pool = self.pool;
        let Some(mut local) = self.local.take() else {
            return;
        };
        let moved = if !local.secondary.is_empty() {
            let secondary = mem::replace(&mut local.secondary, pool.get_empty());
            pool.put_full(secondary);
            true
        } else if local.primary.len() > pool.config().balance_threshold {
            local.primary = pool.handoff(local.primary);
            true
        } else {
            false
        };
        self.local = Some(local);
        if moved {
            self.published();
        }
    }

    /// Returns `true` if no entries are held locally.
    ///
    /// Says nothing about the pool or other workers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.local
            .as_ref()
            .is_none_or(|local| local.primary.is_empty() && local.secondary.is_empty())
    }

    /// Entries held locally.
    #[must_use]
    pub fn len(&self) -> usize {
        self.local
            .as_ref()
            .map_or(0, |local| local.primary.len() + local.secondary.len())
    }

    /// Records `bytes` of newly marked objects, flushed on dispose.
    pub const fn add_bytes_marked(&mut self, bytes: u64) {
        self.bytes_marked += bytes;
    }

    /// Records `work` units of heap scanning, flushed on dispose.
    pub const fn add_heap_scan_work(&mut self, work: i64) {
        self.heap_scan_work += work;
    }

    /// Bytes marked since the last dispose.
    #[must_use]
    pub const fn bytes_marked(&self) -> u64 {
        self.bytes_marked
    }

    /// Heap scan work since the last dispose.
    #[must_use]
    pub const fn heap_scan_work(&self) -> i64 {
        self.heap_scan_work
    }

    /// Returns `true` if this queue has published work since the flag was
    /// last reset.
    ///
    /// Mark termination uses this to detect work that appeared after it
    /// started checking.
    #[must_use]
    pub const fn flushed_work(&self) -> bool {
        self.flushed_work
    }

    /// Clears the [`flushed_work`](Self::flushed_work) flag.
    pub const fn reset_flushed_work(&mut self) {
        self.flushed_work = false;
    }
}

impl Drop for MarkQueue<'_> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for MarkQueue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkQueue")
            .field("len", &self.len())
            .field("bytes_marked", &self.bytes_marked)
            .field("heap_scan_work", &self.heap_scan_work)
            .field("flushed_work", &self.flushed_work)
            .field("pending_patches", &self.has_pending_patches())
            .finish_non_exhaustive()
    }
}
