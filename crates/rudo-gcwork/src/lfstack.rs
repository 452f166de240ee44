//! Lock-free intrusive stack over arena-resident nodes.
//!
//! The stack head is a single `u64` holding `(node index + 1, push count)`.
//! Push and pop are plain CAS-retry loops on that word, making this a Treiber
//! stack. The per-node push counter makes each push of the same node produce
//! a different head value, so a popper holding a stale head (the node was
//! popped, reused and pushed again between its load and its CAS) fails the
//! CAS instead of installing a stale `next`.
//!
//! # Capacity and ABA bound
//!
//! The low 32 bits hold `index + 1` and the high 32 bits hold the push
//! counter. An arena may therefore hold at most [`NodeId::MAX`]` + 1` nodes.
//! The counter wraps after 2^32 pushes of one node; a stale CAS can only
//! succeed if a single node is pushed exactly a multiple of 2^32 times while
//! another thread sits between its load and its CAS. We accept that.
//!
//! Nodes never leave their arena while a stack can reach them, so `pop` may
//! always read `next` of a node it lost the race for.

use std::fmt;

use crossbeam::utils::Backoff;

#[cfg(loom)]
use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::fatal::{throw, Fatal};

const INDEX_BITS: u32 = 32;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

/// Index of a node within its arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    /// Largest index that survives packing.
    pub const MAX: u32 = u32::MAX - 1;

    /// Wraps an arena index.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the arena index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Packs a node index and push count into a head word.
///
/// An index of `u32::MAX` carries into the count bits and does not unpack.
#[inline]
const fn pack(id: NodeId, count: u32) -> u64 {
    ((count as u64) << INDEX_BITS) | (id.0 as u64 + 1)
}

/// Recovers the node index from a head word. `None` for an empty word.
#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn unpack(word: u64) -> Option<NodeId> {
    match word & INDEX_MASK {
        0 => None,
        low => Some(NodeId(low as u32 - 1)),
    }
}

/// Link embedded at the start of every stack-managed object.
#[derive(Debug)]
#[repr(C)]
pub struct LfNode {
    next: AtomicU64,
    push_count: AtomicU32,
}

impl LfNode {
    /// Creates an unlinked node with a zero push count.
    #[must_use]
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
            push_count: AtomicU32::new(0),
        }
    }

    /// Creates an unlinked node with a zero push count.
    #[must_use]
    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
            push_count: AtomicU32::new(0),
        }
    }

    /// Number of times this node has been pushed (wrapping).
    #[must_use]
    pub fn push_count(&self) -> u32 {
        self.push_count.load(Ordering::Relaxed)
    }

    /// Clears the link, keeping the push count.
    pub(crate) fn unlink(&self) {
        self.next.store(0, Ordering::Relaxed);
    }
}

impl Default for LfNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves node indices to the nodes themselves.
///
/// # Safety
///
/// For every index ever pushed onto a stack, `node` must keep returning the
/// same `LfNode` for as long as any stack can still reach that index.
pub unsafe trait NodeArena {
    /// Returns the node stored at `id`.
    fn node(&self, id: NodeId) -> &LfNode;
}

/// A fixed set of nodes owned by a boxed slice, indexed `0..len`.
#[derive(Debug)]
pub struct NodeSlab {
    nodes: Box<[LfNode]>,
}

impl NodeSlab {
    /// Allocates `len` unlinked nodes.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the packable index range.
    #[must_use]
    pub fn new(len: usize) -> Self {
        assert!(
            len <= NodeId::MAX as usize + 1,
            "NodeSlab length {len} exceeds the packable range"
        );
        Self {
            nodes: (0..len).map(|_| LfNode::new()).collect(),
        }
    }

    /// Number of nodes in the slab.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the slab holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates over all ids in the slab.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        #[allow(clippy::cast_possible_truncation)]
        (0..self.nodes.len()).map(|i| NodeId::new(i as u32))
    }
}

// SAFETY: the boxed slice never moves or shrinks while the slab lives.
unsafe impl NodeArena for NodeSlab {
    fn node(&self, id: NodeId) -> &LfNode {
        &self.nodes[id.0 as usize]
    }
}

/// Checks that a freshly allocated node can be used with [`LfStack`].
///
/// `addr` is where the caller's allocator placed the node. It must be exactly
/// where the arena resolves `id` to, which proves the node lives in arena
/// storage rather than somewhere the arena does not control. The index must
/// also survive packing with the largest push count.
///
/// Call once per node, at allocation time. Failures are fatal.
pub fn validate_node<A: NodeArena + ?Sized>(arena: &A, id: NodeId, addr: usize) {
    if unpack(pack(id, u32::MAX)) != Some(id) {
        throw(Fatal::BadNodeIndex { index: id.0 });
    }
    let resolved = std::ptr::from_ref(arena.node(id)) as usize;
    if resolved != addr {
        throw(Fatal::NodeOutsideArena {
            index: id.0,
            addr,
            resolved,
        });
    }
}

/// Head of a lock-free LIFO of arena nodes. Zero means empty.
#[derive(Debug)]
pub struct LfStack {
    head: AtomicU64,
}

impl LfStack {
    /// Creates an empty stack.
    #[must_use]
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
        }
    }

    /// Creates an empty stack.
    #[must_use]
    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
        }
    }

    /// Pushes `id`, relinquishing the caller's ownership of that node.
    ///
    /// Everything the caller wrote to the node's storage before the push is
    /// visible to whoever pops it.
    pub fn push<A: NodeArena + ?Sized>(&self, arena: &A, id: NodeId) {
        let node = arena.node(id);
        let count = node.push_count.load(Ordering::Relaxed).wrapping_add(1);
        node.push_count.store(count, Ordering::Relaxed);

        let new = pack(id, count);
        if unpack(new) != Some(id) {
            throw(Fatal::InvalidPacking {
                index: id.0,
                count,
                packed: new,
            });
        }

        let backoff = Backoff::new();
        let mut old = self.head.load(Ordering::Relaxed);
        loop {
            node.next.store(old, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(old, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => {
                    old = current;
                    backoff.spin();
                }
            }
        }
    }

    /// Pops the most recently pushed node, or `None` if the stack is empty.
    ///
    /// On success the caller becomes the sole owner of the node.
    pub fn pop<A: NodeArena + ?Sized>(&self, arena: &A) -> Option<NodeId> {
        let backoff = Backoff::new();
        let mut old = self.head.load(Ordering::Acquire);
        loop {
            if old == 0 {
                return None;
            }
            let Some(id) = unpack(old) else {
                throw(Fatal::CorruptHead { word: old });
            };
            let next = arena.node(id).next.load(Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(old, next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => return Some(id),
                Err(current) => {
                    old = current;
                    backoff.spin();
                }
            }
        }
    }

    /// Returns the top node without removing it.
    ///
    /// Only meaningful when no other thread mutates the stack concurrently:
    /// the answer may be stale the moment it is returned otherwise.
    #[must_use]
    pub fn head(&self) -> Option<NodeId> {
        unpack(self.head.load(Ordering::Acquire))
    }

    /// Returns `true` if the stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == 0
    }

    /// Forgets every node on the stack.
    ///
    /// The nodes are not touched; the caller must own them all by other means.
    pub(crate) fn clear(&self) {
        self.head.store(0, Ordering::Release);
    }
}

impl Default for LfStack {
    fn default() -> Self {
        Self::new()
    }
}
