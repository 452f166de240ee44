//! Invariant violations.
//!
//! Nothing in this crate reports a broken invariant as a `Result`: a corrupt
//! work list means marking can no longer be trusted, and continuing would
//! free live objects. [`throw`] prints a diagnostic and aborts the process.
//!
//! Test builds (and the `test-util` feature) panic instead of aborting so the
//! fatal paths can be exercised with `#[should_panic]`.

use std::fmt;

/// A broken invariant of the mark work layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fatal {
    /// A pushed node's index did not survive the head-word packing.
    InvalidPacking {
        /// Node index.
        index: u32,
        /// Push count at the time of the push.
        count: u32,
        /// The packed head word.
        packed: u64,
    },
    /// A node index cannot be packed at all.
    BadNodeIndex {
        /// Node index.
        index: u32,
    },
    /// A node's storage is not where its arena says it is.
    NodeOutsideArena {
        /// Node index.
        index: u32,
        /// Where the node was actually placed.
        addr: usize,
        /// Where the arena resolves the index to.
        resolved: usize,
    },
    /// A non-zero head word with no node index in it.
    CorruptHead {
        /// The head word.
        word: u64,
    },
    /// A node index refers to a span that is not mapped.
    StaleNode {
        /// Node index.
        index: u32,
    },
    /// A buffer was handed to a pool that did not create it.
    ForeignBuffer {
        /// Node index.
        index: u32,
    },
    /// The memory provider could not supply a work buffer span.
    OutOfMemory {
        /// Bytes requested.
        bytes: usize,
    },
    /// Every slot of the span directory is taken.
    SpanDirectoryFull {
        /// Directory capacity.
        max_spans: usize,
    },
    /// A buffer headed for the empty list still holds entries.
    BufferNotEmpty {
        /// Entries held.
        len: usize,
    },
    /// A buffer headed for (or popped from) the full list holds nothing.
    BufferEmpty,
    /// Span reclamation attempted while the full list still has work.
    FreeWithPendingWork,
    /// The relocation patch list needs an odd buffer capacity.
    EvenPatchCapacity {
        /// Buffer capacity.
        capacity: usize,
    },
    /// A recorded slot no longer holds the pre-move address.
    PatchMismatch {
        /// The recorded slot address.
        slot: usize,
        /// What the slot should hold.
        expected: usize,
        /// What it holds.
        found: usize,
    },
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPacking {
                index,
                count,
                packed,
            } => write!(
                f,
                "lfstack.push invalid packing: node={index} cnt={count:#x} packed={packed:#x}"
            ),
            Self::BadNodeIndex { index } => write!(f, "bad lfnode index {index}"),
            Self::NodeOutsideArena {
                index,
                addr,
                resolved,
            } => write!(
                f,
                "lfstack node {index} allocated outside its arena: addr={addr:#x} arena={resolved:#x}"
            ),
            Self::CorruptHead { word } => write!(f, "lfstack head corrupt: {word:#x}"),
            Self::StaleNode { index } => {
                write!(f, "work buffer {index} refers to an unmapped span")
            }
            Self::ForeignBuffer { index } => {
                write!(f, "work buffer {index} does not belong to this pool")
            }
            Self::OutOfMemory { bytes } => {
                write!(f, "out of memory allocating {bytes} bytes of work buffers")
            }
            Self::SpanDirectoryFull { max_spans } => {
                write!(f, "work buffer span directory full ({max_spans} spans)")
            }
            Self::BufferNotEmpty { len } => write!(f, "workbuf is not empty ({len} entries)"),
            Self::BufferEmpty => f.write_str("workbuf is empty"),
            Self::FreeWithPendingWork => f.write_str("cannot free workbufs when work.full != 0"),
            Self::EvenPatchCapacity { capacity } => {
                write!(f, "workbuf len is even ({capacity})")
            }
            Self::PatchMismatch {
                slot,
                expected,
                found,
            } => write!(
                f,
                "address mismatch in old pointer: slot={slot:#x} expected={expected:#x} found={found:#x}"
            ),
        }
    }
}

/// Reports `fatal` and terminates.
#[cold]
#[inline(never)]
#[track_caller]
pub fn throw(fatal: Fatal) -> ! {
    crate::tracing::log_fatal(&fatal);

    #[cfg(any(test, feature = "test-util"))]
    {
        panic!("fatal error: {fatal}");
    }

    #[cfg(not(any(test, feature = "test-util")))]
    {
        eprintln!("fatal error: {fatal}");
        eprintln!("  at {}", std::panic::Location::caller());
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_violation() {
        assert_eq!(Fatal::BufferEmpty.to_string(), "workbuf is empty");
        assert_eq!(
            Fatal::BufferNotEmpty { len: 3 }.to_string(),
            "workbuf is not empty (3 entries)"
        );
        let msg = Fatal::PatchMismatch {
            slot: 0x10,
            expected: 0x20,
            found: 0x30,
        }
        .to_string();
        assert!(msg.contains("expected=0x20"));
        assert!(msg.contains("found=0x30"));
    }

    #[test]
    #[should_panic(expected = "fatal error: out of memory")]
    fn test_throw_panics_under_test() {
        throw(Fatal::OutOfMemory { bytes: 4096 });
    }
}
