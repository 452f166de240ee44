//! Work buffers: fixed-capacity arrays of grey object addresses.
//!
//! A buffer is a [`WorkBufHeader`] followed directly by `capacity` word
//! slots, all inside a span of provider memory. [`WorkBuf`] is the owning
//! handle. It is moved into the pool when published and moved out when
//! acquired, so at most one worker can touch a buffer's contents at a time.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use crate::lfstack::{LfNode, NodeId};

/// In-memory header of a work buffer. The node must stay the first field.
#[repr(C)]
#[derive(Debug)]
pub struct WorkBufHeader {
    pub(crate) node: LfNode,
    nobj: usize,
}

/// Size of [`WorkBufHeader`]; entries start right after it.
pub const HEADER_BYTES: usize = size_of::<WorkBufHeader>();

/// Byte size and entry capacity of every buffer in a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufLayout {
    bytes: usize,
    capacity: usize,
}

impl BufLayout {
    /// Alignment every buffer start must honour.
    pub const ALIGN: usize = align_of::<WorkBufHeader>();

    /// Layout of a `bytes`-sized buffer.
    #[must_use]
    pub const fn new(bytes: usize) -> Self {
        Self {
            bytes,
            capacity: bytes.saturating_sub(HEADER_BYTES) / size_of::<usize>(),
        }
    }

    /// Buffer size in bytes, header included.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }

    /// Number of entries a buffer holds.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Exclusive handle to one work buffer, borrowed from the storage it lives in.
///
/// Dropping a `WorkBuf` without handing it back to its pool leaks the buffer
/// until the pool's spans are reclaimed.
pub struct WorkBuf<'p> {
    id: NodeId,
    header: NonNull<WorkBufHeader>,
    capacity: usize,
    _storage: PhantomData<&'p ()>,
}

// SAFETY: a WorkBuf is the only handle to its buffer; moving it between
// threads moves that exclusive access.
unsafe impl Send for WorkBuf<'_> {}

impl WorkBuf<'_> {
    /// Wraps the buffer at `header`, writing a fresh header.
    ///
    /// # Safety
    ///
    /// `header` must point to `HEADER_BYTES + capacity` words of writable
    /// memory that nothing else references, aligned to [`BufLayout::ALIGN`].
    pub(crate) unsafe fn init(
        id: NodeId,
        header: NonNull<WorkBufHeader>,
        capacity: usize,
        keep_push_count: bool,
    ) -> Self {
        let p = header.as_ptr();
        unsafe {
            if keep_push_count {
                (*p).node.unlink();
            } else {
                std::ptr::addr_of_mut!((*p).node).write(LfNode::new());
            }
            std::ptr::addr_of_mut!((*p).nobj).write(0);
        }
        Self {
            id,
            header,
            capacity,
            _storage: PhantomData,
        }
    }

    /// Reclaims a buffer popped from a pool stack.
    ///
    /// # Safety
    ///
    /// The caller must have just taken ownership of `id` (by popping it) and
    /// `header` must be its initialised header.
    pub(crate) const unsafe fn from_raw(
        id: NodeId,
        header: NonNull<WorkBufHeader>,
        capacity: usize,
    ) -> Self {
        Self {
            id,
            header,
            capacity,
            _storage: PhantomData,
        }
    }

    /// Gives up the handle, returning the node id to push.
    pub(crate) fn into_id(self) -> NodeId {
        self.id
    }

    pub(crate) const fn header(&self) -> NonNull<WorkBufHeader> {
        self.header
    }

    /// Node id of this buffer within its pool.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    fn entries_ptr(&self) -> *mut usize {
        // SAFETY: entries follow the header inside the same buffer.
        unsafe { self.header.as_ptr().add(1).cast::<usize>() }
    }

    /// Number of entries held.
    #[must_use]
    pub fn len(&self) -> usize {
        // SAFETY: we own the buffer.
        unsafe { (*self.header.as_ptr()).nobj }
    }

    fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity);
        // SAFETY: we own the buffer.
        unsafe { (*self.header.as_ptr()).nobj = len };
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `true` if no entries are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if no more entries fit.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Free slots left.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.len()
    }

    /// Appends `word`. Returns `false` if the buffer is full.
    pub fn push(&mut self, word: usize) -> bool {
        let len = self.len();
        if len == self.capacity {
            return false;
        }
        // SAFETY: len < capacity, so the slot is inside the buffer.
        unsafe { self.entries_ptr().add(len).write(word) };
        self.set_len(len + 1);
        true
    }

    /// Removes and returns the last entry.
    pub fn pop(&mut self) -> Option<usize> {
        let len = self.len().checked_sub(1)?;
        self.set_len(len);
        // SAFETY: the slot at len was written before nobj covered it.
        Some(unsafe { self.entries_ptr().add(len).read() })
    }

    /// The held entries, oldest first.
    #[must_use]
    pub fn as_slice(&self) -> &[usize] {
        // SAFETY: the first len slots are initialised and owned by us.
        unsafe { std::slice::from_raw_parts(self.entries_ptr(), self.len()) }
    }

    /// The held entries, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [usize] {
        // SAFETY: as for as_slice, and &mut self is exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.entries_ptr(), self.len()) }
    }

    /// Copies as much of `words` as fits; returns how many were copied.
    pub fn extend_from_slice(&mut self, words: &[usize]) -> usize {
        let len = self.len();
        let n = words.len().min(self.capacity - len);
        // SAFETY: the destination range [len, len + n) is within capacity and
        // cannot overlap a caller-provided slice.
        unsafe {
            std::ptr::copy_nonoverlapping(words.as_ptr(), self.entries_ptr().add(len), n);
        }
        self.set_len(len + n);
        n
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.set_len(0);
    }

    /// Moves the upper half of the entries into the empty buffer `dst`.
    ///
    /// `self` keeps the lower `len - len / 2` entries.
    pub fn split_upper_half_into(&mut self, dst: &mut Self) {
        debug_assert!(dst.is_empty());
        let len = self.len();
        let n = len / 2;
        let keep = len - n;
        dst.extend_from_slice(&self.as_slice()[keep..]);
        self.set_len(keep);
    }
}

impl fmt::Debug for WorkBuf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkBuf")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Heap-backed buffer storage for exercising `WorkBuf` alone.
    struct Scratch {
        words: Box<[u64]>,
        capacity: usize,
    }

    impl Scratch {
        fn new(capacity: usize) -> Self {
            let bytes = HEADER_BYTES + capacity * size_of::<usize>();
            Self {
                words: vec![0u64; bytes.div_ceil(8)].into_boxed_slice(),
                capacity,
            }
        }

        fn buf(&mut self) -> WorkBuf<'_> {
            let header = NonNull::new(self.words.as_mut_ptr().cast::<WorkBufHeader>()).unwrap();
            unsafe { WorkBuf::init(NodeId::new(0), header, self.capacity, false) }
        }
    }

    #[test]
    fn test_layout() {
        let layout = BufLayout::new(HEADER_BYTES + 5 * size_of::<usize>());
        assert_eq!(layout.capacity(), 5);
        assert_eq!(BufLayout::new(0).capacity(), 0);
        assert_eq!(HEADER_BYTES % BufLayout::ALIGN, 0);
    }

    #[test]
    fn test_push_pop() {
        let mut scratch = Scratch::new(3);
        let mut buf = scratch.buf();
        assert!(buf.is_empty());
        assert!(buf.push(1));
        assert!(buf.push(2));
        assert!(buf.push(3));
        assert!(buf.is_full());
        assert!(!buf.push(4));
        assert_eq!(buf.as_slice(), &[1, 2, 3]);
        assert_eq!(buf.pop(), Some(3));
        assert_eq!(buf.pop(), Some(2));
        assert_eq!(buf.pop(), Some(1));
        assert_eq!(buf.pop(), None);
    }

    #[test]
    fn test_extend_from_slice_stops_at_capacity() {
        let mut scratch = Scratch::new(4);
        let mut buf = scratch.buf();
        buf.push(9);
        assert_eq!(buf.extend_from_slice(&[1, 2, 3, 4, 5]), 3);
        assert_eq!(buf.as_slice(), &[9, 1, 2, 3]);
        assert_eq!(buf.extend_from_slice(&[6]), 0);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_split_upper_half() {
        let mut a = Scratch::new(8);
        let mut b = Scratch::new(8);
        let mut src = a.buf();
        let mut dst = b.buf();
        src.extend_from_slice(&[1, 2, 3, 4, 5]);
        src.split_upper_half_into(&mut dst);
        assert_eq!(src.as_slice(), &[1, 2, 3]);
        assert_eq!(dst.as_slice(), &[4, 5]);
    }

    #[test]
    fn test_clear() {
        let mut scratch = Scratch::new(2);
        let mut buf = scratch.buf();
        buf.push(1);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.pop(), None);
    }
}
