//! Span bookkeeping for the work buffer pool.
//!
//! Spans are tracked twice: the [`SpanRegistry`] (behind the pool's mutex)
//! knows which spans back live buffers and which are idle, and the
//! [`SpanDirectory`] maps node ids to buffer addresses without locking, since
//! every `pop` on a pool stack resolves one.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::fatal::{throw, Fatal};
use crate::lfstack::NodeId;
use crate::workbuf::WorkBufHeader;

/// One provider span, identified by its directory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span {
    pub(crate) slot: usize,
    pub(crate) base: NonNull<u8>,
}

// SAFETY: a Span is bookkeeping; access to its memory goes through WorkBuf.
unsafe impl Send for Span {}

/// Which spans back live buffers (`busy`) and which can go back to the
/// provider (`free`).
#[derive(Debug, Default)]
pub(crate) struct SpanRegistry {
    pub(crate) free: Vec<Span>,
    pub(crate) busy: Vec<Span>,
    vacant: Vec<usize>,
    next_slot: usize,
}

impl SpanRegistry {
    /// Moves a free span to busy and returns it.
    pub(crate) fn reuse_free(&mut self) -> Option<Span> {
        let span = self.free.pop()?;
        self.busy.push(span);
        Some(span)
    }

    /// Reserves a directory slot for a new span.
    pub(crate) fn claim_slot(&mut self, max_spans: usize) -> Option<usize> {
        if let Some(slot) = self.vacant.pop() {
            return Some(slot);
        }
        if self.next_slot < max_spans {
            self.next_slot += 1;
            return Some(self.next_slot - 1);
        }
        None
    }

    /// Gives a directory slot back.
    pub(crate) fn release_slot(&mut self, slot: usize) {
        self.vacant.push(slot);
    }

    /// Moves every busy span to the free set; returns how many moved.
    pub(crate) fn retire_busy(&mut self) -> usize {
        let n = self.busy.len();
        self.free.append(&mut self.busy);
        n
    }
}

/// Lock-free map from node ids to buffer headers.
///
/// Node id `slot * buffers_per_span + i` is buffer `i` of the span in `slot`.
#[derive(Debug)]
pub(crate) struct SpanDirectory {
    bases: Box<[AtomicPtr<u8>]>,
    buffers_per_span: usize,
    buffer_bytes: usize,
}

impl SpanDirectory {
    pub(crate) fn new(max_spans: usize, buffers_per_span: usize, buffer_bytes: usize) -> Self {
        Self {
            bases: (0..max_spans)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            buffers_per_span,
            buffer_bytes,
        }
    }

    pub(crate) const fn buffers_per_span(&self) -> usize {
        self.buffers_per_span
    }

    /// Publishes `span` so its buffers resolve.
    pub(crate) fn install(&self, span: Span) {
        self.bases[span.slot].store(span.base.as_ptr(), Ordering::Release);
    }

    /// Stops `slot` from resolving.
    pub(crate) fn vacate(&self, slot: usize) {
        self.bases[slot].store(std::ptr::null_mut(), Ordering::Release);
    }

    /// Id of buffer `i` in the span at `slot`.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn node_id(&self, slot: usize, i: usize) -> NodeId {
        // Config validation keeps every id within u32.
        NodeId::new((slot * self.buffers_per_span + i) as u32)
    }

    /// Address of buffer `i` within `span`.
    pub(crate) fn header_in(&self, span: Span, i: usize) -> NonNull<WorkBufHeader> {
        offset(span.base, i * self.buffer_bytes)
    }

    /// Resolves `id` to its buffer header. Fatal for an unmapped span.
    pub(crate) fn header(&self, id: NodeId) -> NonNull<WorkBufHeader> {
        let index = id.index() as usize;
        let slot = index / self.buffers_per_span;
        let base = self
            .bases
            .get(slot)
            .map_or(std::ptr::null_mut(), |b| b.load(Ordering::Acquire));
        let Some(base) = NonNull::new(base) else {
            throw(Fatal::StaleNode { index: id.index() });
        };
        offset(base, (index % self.buffers_per_span) * self.buffer_bytes)
    }
}

fn offset(base: NonNull<u8>, bytes: usize) -> NonNull<WorkBufHeader> {
    let p = base.as_ptr().wrapping_add(bytes).cast::<WorkBufHeader>();
    // SAFETY: offsets stay inside a span, which never ends at the top of memory.
    unsafe { NonNull::new_unchecked(p) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(slot: usize, base: usize) -> Span {
        Span {
            slot,
            base: NonNull::new(base as *mut u8).unwrap(),
        }
    }

    #[test]
    fn test_claim_slots_in_order_then_reuse() {
        let mut reg = SpanRegistry::default();
        assert_eq!(reg.claim_slot(2), Some(0));
        assert_eq!(reg.claim_slot(2), Some(1));
        assert_eq!(reg.claim_slot(2), None);
        reg.release_slot(0);
        assert_eq!(reg.claim_slot(2), Some(0));
    }

    #[test]
    fn test_retire_and_reuse() {
        let mut reg = SpanRegistry::default();
        reg.busy.push(span(0, 0x1000));
        reg.busy.push(span(1, 0x2000));
        assert_eq!(reg.retire_busy(), 2);
        assert!(reg.busy.is_empty());
        assert_eq!(reg.free.len(), 2);

        let s = reg.reuse_free().unwrap();
        assert_eq!(reg.busy, vec![s]);
        assert_eq!(reg.free.len(), 1);
    }

    #[test]
    fn test_directory_resolves_ids() {
        let dir = SpanDirectory::new(4, 8, 64);
        dir.install(span(2, 0x10_000));
        let id = dir.node_id(2, 3);
        assert_eq!(id.index(), 19);
        assert_eq!(dir.header(id).as_ptr() as usize, 0x10_000 + 3 * 64);
        assert_eq!(
            dir.header_in(span(2, 0x10_000), 3).as_ptr() as usize,
            0x10_000 + 3 * 64
        );
    }

    #[test]
    #[should_panic(expected = "unmapped span")]
    fn test_directory_rejects_vacant_slot() {
        let dir = SpanDirectory::new(4, 8, 64);
        dir.install(span(1, 0x10_000));
        dir.vacate(1);
        let _ = dir.header(dir.node_id(1, 0));
    }
}
