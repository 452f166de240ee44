//! Work buffer tracing support.
//!
//! When the `tracing` feature is enabled, the cold paths of the pool (span
//! allocation, reuse and reclamation) emit structured events. Hot paths
//! (`put`, `try_get`) never log. Without the feature every helper here is an
//! empty inline function.

#[cfg(feature = "tracing")]
mod internal {
    use tracing::{span, Level};

    use crate::fatal::Fatal;

    /// Create a span covering a span-reclamation pass.
    pub fn span_reclaim(spans: usize) -> span::EnteredSpan {
        span!(Level::DEBUG, "workbuf_reclaim", spans = spans).entered()
    }

    /// A span was obtained from the memory provider and carved into buffers.
    pub fn log_span_alloc(span_index: usize, bytes: usize, buffers: usize) {
        tracing::debug!(span_index, bytes, buffers, "workbuf_span_alloc");
    }

    /// A previously freed span was moved back to the busy set.
    pub fn log_span_reuse(span_index: usize, buffers: usize) {
        tracing::debug!(span_index, buffers, "workbuf_span_reuse");
    }

    /// All busy spans were moved to the free set.
    pub fn log_prepare_free(spans: usize) {
        tracing::debug!(spans, "workbuf_prepare_free");
    }

    /// One reclamation batch finished.
    pub fn log_free_batch(freed: usize, remaining: usize) {
        tracing::debug!(freed, remaining, "workbuf_free_batch");
    }

    /// A buffer was split for stealing.
    pub fn log_handoff(kept: usize, published: usize) {
        tracing::trace!(kept, published, "workbuf_handoff");
    }

    /// An invariant violation is about to terminate the process.
    pub fn log_fatal(fatal: &Fatal) {
        tracing::error!(error = %fatal, "workbuf_fatal");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
mod internal {
    use crate::fatal::Fatal;

    /// Stub guard when tracing is disabled.
    pub struct Entered;

    #[inline]
    pub fn span_reclaim(_spans: usize) -> Entered {
        Entered
    }

    #[inline]
    pub fn log_span_alloc(_span_index: usize, _bytes: usize, _buffers: usize) {}

    #[inline]
    pub fn log_span_reuse(_span_index: usize, _buffers: usize) {}

    #[inline]
    pub fn log_prepare_free(_spans: usize) {}

    #[inline]
    pub fn log_free_batch(_freed: usize, _remaining: usize) {}

    #[inline]
    pub fn log_handoff(_kept: usize, _published: usize) {}

    #[inline]
    pub fn log_fatal(_fatal: &Fatal) {}
}

pub use internal::*;
