//! Mark work distribution for a parallel, concurrent garbage collector.
//!
//! `rudo-gcwork` moves "grey" object references between marking workers
//! with as little contention as possible:
//!
//! - **[`LfStack`]**: a lock-free Treiber stack over arena nodes addressed by
//!   [`NodeId`], the only primitive shared between workers.
//! - **[`WorkBuf`]**: a fixed-capacity array of entries, the unit in which
//!   work moves between workers.
//! - **[`WorkPool`]**: the global `empty` and `full` buffer lists, plus span
//!   bookkeeping that maps buffer storage from a [`MemoryProvider`] outside
//!   any traced heap.
//! - **[`MarkQueue`]**: a worker's double-buffered local cache over the pool,
//!   with work stealing (`balance`) and a relocation patch list.
//!
//! Broken invariants are never reported as errors: they terminate the
//! process (see [`Fatal`]).
//!
//! # Quick Start
//!
//! ```
//! use rudo_gcwork::{GcPhase, MarkQueue, PoolConfig, WorkPool};
//!
//! let pool = WorkPool::new(PoolConfig::default()).unwrap();
//! pool.set_phase(GcPhase::Mark);
//!
//! std::thread::scope(|s| {
//!     for worker in 0..4 {
//!         let pool = &pool;
//!         s.spawn(move || {
//!             let mut queue = MarkQueue::new(pool);
//!             for i in 0..1000 {
//!                 queue.put(worker * 1000 + i);
//!             }
//!             while let Some(_obj) = queue.try_get() {
//!                 // scan the object, queueing its children
//!             }
//!             queue.dispose();
//!         });
//!     }
//! });
//!
//! pool.set_phase(GcPhase::Off);
//! // SAFETY: every queue has been disposed and dropped, so every buffer is
//! // back on the empty list.
//! unsafe {
//!     pool.prepare_free();
//!     pool.free_all();
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod fatal;
mod lfstack;
mod metrics;
mod phase;
mod pool;
mod queue;
mod relocate;
mod tracing;
mod workbuf;

pub use config::{
    ConfigError, PoolConfig, DEFAULT_BALANCE_THRESHOLD, DEFAULT_BUFFER_BYTES,
    DEFAULT_FREE_BATCH_SPANS, DEFAULT_MAX_SPANS, DEFAULT_SPAN_BYTES,
};
pub use fatal::Fatal;
pub use lfstack::{validate_node, LfNode, LfStack, NodeArena, NodeId, NodeSlab};
pub use metrics::PoolStats;
pub use phase::{GcPhase, NoSignal, PhaseCell, ScanWorkCounter, ScanWorkSink, WorkSignal};
pub use pool::{MemoryProvider, SpanClass, SysAllocProvider, WorkPool, WorkPoolBuilder};
pub use queue::MarkQueue;
pub use workbuf::{BufLayout, WorkBuf, WorkBufHeader, HEADER_BYTES};
