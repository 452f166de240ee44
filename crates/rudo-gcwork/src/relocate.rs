//! Relocation patch list.
//!
//! While an object is being moved, a worker records every slot that points
//! into it as a `(slot address, offset)` pair. Once the copy is done,
//! [`MarkQueue::apply_patches`] rewrites each slot from the old location to
//! the new one.
//!
//! Pairs are stored two words at a time in ordinary work buffers, chained on
//! a stack private to the queue. Buffers must have an odd capacity: a pair is
//! never split, so the last slot of every buffer stays unused.

use crate::fatal::{throw, Fatal};
use crate::queue::MarkQueue;

impl MarkQueue<'_> {
    /// Records that the word at `slot` points `offset` bytes into the object
    /// being moved.
    pub fn record_patch(&mut self, slot: usize, offset: usize) {
        let pool = self.pool;
        let capacity = pool.buffer_capacity();
        if capacity % 2 == 0 {
            throw(Fatal::EvenPatchCapacity { capacity });
        }

        // The patch stack is private to this queue, so its head buffer is
        // ours to fill in place while it stays linked.
        if let Some(id) = self.patches.head() {
            let mut buf = pool.claim(id);
            if buf.remaining() >= 2 {
                buf.push(slot);
                buf.push(offset);
                return;
            }
        }

        let mut buf = pool.get_empty();
        buf.push(slot);
        buf.push(offset);
        self.patches.push(&pool.arena(), pool.adopt(buf));
    }

    /// Returns `true` if recorded patches are waiting to be applied.
    #[must_use]
    pub fn has_pending_patches(&self) -> bool {
        !self.patches.is_empty()
    }

    /// Rewrites every recorded slot from `source_base + offset` to
    /// `dest_base + offset` and returns the patch buffers to the pool.
    ///
    /// A slot holding anything other than `source_base + offset` is fatal:
    /// it was overwritten after being recorded, or recorded against the
    /// wrong object.
    ///
    /// # Safety
    ///
    /// Every recorded slot address must be valid for reads and writes of a
    /// `usize`, and no other thread may access those slots during the call.
    pub unsafe fn apply_patches(&mut self, source_base: usize, dest_base: usize) {
        let pool = self.pool;
        while let Some(id) = self.patches.pop(&pool.arena()) {
            let mut buf = pool.claim(id);
            for pair in buf.as_slice().chunks_exact(2) {
                let (slot, offset) = (pair[0], pair[1]);
                let ptr = slot as *mut usize;
                let expected = source_base.wrapping_add(offset);
                // SAFETY: upheld by the caller.
                let found = unsafe { ptr.read() };
                if found != expected {
                    throw(Fatal::PatchMismatch {
                        slot,
                        expected,
                        found,
                    });
                }
                // SAFETY: as above.
                unsafe { ptr.write(dest_base.wrapping_add(offset)) };
            }
            buf.clear();
            pool.put_empty(buf);
        }
    }

    /// Drops recorded patches without applying them.
    pub(crate) fn discard_patches(&mut self) {
        let pool = self.pool;
        while let Some(id) = self.patches.pop(&pool.arena()) {
            let mut buf = pool.claim(id);
            buf.clear();
            pool.put_empty(buf);
        }
    }
}
