//! Pool configuration.

use std::fmt;

use crate::lfstack::NodeId;
use crate::workbuf::{BufLayout, HEADER_BYTES};

/// Default size of one work buffer in bytes; larger values mean less contention.
pub const DEFAULT_BUFFER_BYTES: usize = 2048;
/// Default span size requested from the memory provider at a time.
pub const DEFAULT_SPAN_BYTES: usize = 32 << 10;
/// Default number of span directory slots.
pub const DEFAULT_MAX_SPANS: usize = 1 << 16;
/// Default number of spans returned to the provider per reclamation batch.
pub const DEFAULT_FREE_BATCH_SPANS: usize = 64;
/// Default primary-buffer length above which `balance` splits it.
pub const DEFAULT_BALANCE_THRESHOLD: usize = 4;

/// Sizing of the work buffer pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Bytes per work buffer, header included.
    pub buffer_bytes: usize,
    /// Bytes per span obtained from the memory provider.
    pub span_bytes: usize,
    /// Maximum number of spans mapped at once.
    pub max_spans: usize,
    /// Spans returned to the provider per `free_batch` call.
    pub free_batch_spans: usize,
    /// `balance` splits the primary buffer when it holds more entries than this.
    pub balance_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: DEFAULT_BUFFER_BYTES,
            span_bytes: DEFAULT_SPAN_BYTES,
            max_spans: DEFAULT_MAX_SPANS,
            free_batch_spans: DEFAULT_FREE_BATCH_SPANS,
            balance_threshold: DEFAULT_BALANCE_THRESHOLD,
        }
    }
}

impl PoolConfig {
    /// Configuration whose buffers hold exactly `capacity` entries.
    ///
    /// The span grows to the smallest size of at least
    /// [`DEFAULT_SPAN_BYTES`] that is a whole number of both pages and
    /// buffers. Mostly useful for tests, where tiny buffers make overflow
    /// easy to reach.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let buffer_bytes = HEADER_BYTES + capacity * std::mem::size_of::<usize>();
        let unit = lcm(buffer_bytes, sys_alloc::page_size());
        Self {
            buffer_bytes,
            span_bytes: DEFAULT_SPAN_BYTES.div_ceil(unit) * unit,
            ..Self::default()
        }
    }

    /// Set the work buffer size in bytes.
    pub const fn set_buffer_bytes(&mut self, bytes: usize) {
        self.buffer_bytes = bytes;
    }

    /// Set the span size in bytes.
    pub const fn set_span_bytes(&mut self, bytes: usize) {
        self.span_bytes = bytes;
    }

    /// Set the span directory size.
    pub const fn set_max_spans(&mut self, spans: usize) {
        self.max_spans = spans;
    }

    /// Set how many spans one reclamation batch frees.
    pub const fn set_free_batch_spans(&mut self, spans: usize) {
        self.free_batch_spans = spans;
    }

    /// Set the `balance` split threshold.
    pub const fn set_balance_threshold(&mut self, threshold: usize) {
        self.balance_threshold = threshold;
    }

    /// Buffer layout implied by `buffer_bytes`.
    #[must_use]
    pub const fn layout(&self) -> BufLayout {
        BufLayout::new(self.buffer_bytes)
    }

    /// Number of buffers carved from each span.
    #[must_use]
    pub const fn buffers_per_span(&self) -> usize {
        if self.buffer_bytes == 0 {
            0
        } else {
            self.span_bytes / self.buffer_bytes
        }
    }

    /// Checks the configuration against the layout constraints.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let word = std::mem::size_of::<usize>();
        if self.buffer_bytes < HEADER_BYTES + 2 * word {
            return Err(ConfigError::BufferTooSmall {
                buffer_bytes: self.buffer_bytes,
                min: HEADER_BYTES + 2 * word,
            });
        }
        if self.buffer_bytes % BufLayout::ALIGN != 0 {
            return Err(ConfigError::BufferMisaligned {
                buffer_bytes: self.buffer_bytes,
                align: BufLayout::ALIGN,
            });
        }
        let page = sys_alloc::page_size();
        if self.span_bytes < self.buffer_bytes
            || self.span_bytes % page != 0
            || self.span_bytes % self.buffer_bytes != 0
        {
            return Err(ConfigError::BadSpanSize {
                span_bytes: self.span_bytes,
                buffer_bytes: self.buffer_bytes,
                page_size: page,
            });
        }
        if self.max_spans == 0 {
            return Err(ConfigError::NoSpans);
        }
        let nodes = self
            .max_spans
            .checked_mul(self.buffers_per_span())
            .unwrap_or(usize::MAX);
        if nodes > NodeId::MAX as usize + 1 {
            return Err(ConfigError::TooManyBuffers {
                buffers: nodes,
                max: NodeId::MAX as usize + 1,
            });
        }
        if self.free_batch_spans == 0 {
            return Err(ConfigError::ZeroFreeBatch);
        }
        Ok(())
    }
}

/// A `PoolConfig` that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Buffers must hold a header and at least two entries.
    BufferTooSmall {
        /// Configured size.
        buffer_bytes: usize,
        /// Smallest usable size.
        min: usize,
    },
    /// Buffer size must keep every header aligned.
    BufferMisaligned {
        /// Configured size.
        buffer_bytes: usize,
        /// Required alignment.
        align: usize,
    },
    /// Spans must be whole pages and a whole number of buffers.
    BadSpanSize {
        /// Configured span size.
        span_bytes: usize,
        /// Configured buffer size.
        buffer_bytes: usize,
        /// OS page size.
        page_size: usize,
    },
    /// The span directory needs at least one slot.
    NoSpans,
    /// More buffers than node indices can address.
    TooManyBuffers {
        /// Buffers the configuration could create.
        buffers: usize,
        /// Addressable maximum.
        max: usize,
    },
    /// Reclamation batches must free at least one span.
    ZeroFreeBatch,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall { buffer_bytes, min } => {
                write!(f, "buffer size {buffer_bytes} is below the minimum {min}")
            }
            Self::BufferMisaligned {
                buffer_bytes,
                align,
            } => write!(f, "buffer size {buffer_bytes} is not a multiple of {align}"),
            Self::BadSpanSize {
                span_bytes,
                buffer_bytes,
                page_size,
            } => write!(
                f,
                "span size {span_bytes} must be a multiple of the page size {page_size} \
                 and of the buffer size {buffer_bytes}"
            ),
            Self::NoSpans => f.write_str("max_spans must be at least 1"),
            Self::TooManyBuffers { buffers, max } => {
                write!(f, "{buffers} buffers exceed the addressable {max}")
            }
            Self::ZeroFreeBatch => f.write_str("free_batch_spans must be at least 1"),
        }
    }
}

impl std::error::Error for ConfigError {}

const fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

const fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = PoolConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.buffers_per_span(), 16);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_default_capacity_is_odd() {
        assert_eq!(PoolConfig::default().layout().capacity(), 253);
    }

    #[test]
    fn test_with_capacity() {
        for cap in [2, 4, 5, 64] {
            let config = PoolConfig::with_capacity(cap);
            assert_eq!(config.validate(), Ok(()));
            assert_eq!(config.layout().capacity(), cap);
        }
    }

    #[test]
    fn test_rejects_tiny_buffer() {
        let config = PoolConfig::with_capacity(1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_rejects_misaligned_buffer() {
        let mut config = PoolConfig::default();
        config.set_buffer_bytes(2047);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BufferMisaligned { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_span() {
        let mut config = PoolConfig::default();
        config.set_span_bytes(sys_alloc::page_size() + 1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadSpanSize { .. })
        ));

        let mut config = PoolConfig::default();
        config.set_buffer_bytes(64 << 10);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadSpanSize { .. })
        ));
    }

    #[test]
    fn test_rejects_span_with_leftover_bytes() {
        let mut config = PoolConfig::with_capacity(4);
        config.set_span_bytes(DEFAULT_SPAN_BYTES);
        assert_ne!(DEFAULT_SPAN_BYTES % config.buffer_bytes, 0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadSpanSize { .. })
        ));
    }

    #[test]
    fn test_with_capacity_spans_fit_whole_buffers() {
        for cap in [2, 3, 4, 5, 9, 15, 64] {
            let config = PoolConfig::with_capacity(cap);
            assert!(config.span_bytes >= DEFAULT_SPAN_BYTES);
            assert_eq!(config.span_bytes % config.buffer_bytes, 0);
            assert_eq!(config.span_bytes % sys_alloc::page_size(), 0);
            assert_eq!(
                config.buffers_per_span() * config.buffer_bytes,
                config.span_bytes
            );
        }
    }

    #[test]
    fn test_rejects_unaddressable_pool() {
        let mut config = PoolConfig::with_capacity(2);
        config.set_max_spans(usize::MAX / 2);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooManyBuffers { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_counts() {
        let mut config = PoolConfig::default();
        config.set_max_spans(0);
        assert_eq!(config.validate(), Err(ConfigError::NoSpans));

        let mut config = PoolConfig::default();
        config.set_free_batch_spans(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroFreeBatch));
    }

    #[test]
    fn test_error_display() {
        let err = ConfigError::BufferTooSmall {
            buffer_bytes: 8,
            min: 40,
        };
        assert_eq!(err.to_string(), "buffer size 8 is below the minimum 40");
    }
}
