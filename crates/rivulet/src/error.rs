use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Boxed error produced by a failing source.
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// Configuration invariant violations, reported before any work starts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// `max_parallelism` must allow at least one worker.
    #[error("max_parallelism must be at least 1")]
    ZeroParallelism,

    /// `channel_capacity` must hold at least one result.
    #[error("channel_capacity must be at least 1")]
    ZeroChannelCapacity,

    /// Adaptive bounds must satisfy `1 <= min <= max`.
    #[error("adaptive concurrency bounds invalid: min={min}, max={max}")]
    AdaptiveBounds { min: usize, max: usize },

    /// The adaptive `initial` cap must lie within `[min, max]`.
    #[error("adaptive initial concurrency {initial} outside [{min}, {max}]")]
    AdaptiveInitialOutOfRange {
        initial: usize,
        min: usize,
        max: usize,
    },

    /// The adaptive sampler needs a non-zero interval.
    #[error("adaptive sample_interval must be positive")]
    ZeroSampleInterval,

    /// Refill rate must be positive for tokens to ever accrue.
    #[error("rate limit tokens_per_second must be positive")]
    NonPositiveRate,

    /// An operation may never cost more than the bucket can hold.
    #[error("rate limit tokens_per_op ({tokens_per_op}) exceeds burst_capacity ({burst_capacity})")]
    TokensPerOpExceedsBurst {
        tokens_per_op: f64,
        burst_capacity: f64,
    },

    /// Breaker thresholds must be positive to be meaningful.
    #[error("circuit breaker {field} must be positive")]
    NonPositiveBreakerThreshold { field: &'static str },

    /// A zero open timeout would re-probe immediately.
    #[error("circuit breaker open_timeout must be positive")]
    ZeroOpenTimeout,

    /// A per-item timeout of zero would fail every item.
    #[error("per_item_timeout must be positive")]
    ZeroItemTimeout,
}

/// Terminal outcome of a single item, tagged so retry classification and
/// `on_error` can match on the kind.
#[derive(Debug, Error)]
pub enum ItemError<E> {
    /// The worker function returned an error.
    #[error("worker failed: {0}")]
    Worker(E),

    /// The per-item deadline elapsed before the worker finished.
    #[error("worker timed out after {0:?}")]
    Timeout(Duration),

    /// The circuit is open; the call was not attempted.
    #[error("circuit is open; call not permitted")]
    CircuitOpen,

    /// The engine was cancelled while this item was pending.
    #[error("operation cancelled")]
    Cancelled,
}

impl<E> ItemError<E> {
    /// Returns true if this error came from the worker itself.
    pub fn is_worker(&self) -> bool {
        matches!(self, ItemError::Worker(_))
    }

    /// Returns true if the per-item deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ItemError::Timeout(_))
    }

    /// Returns true if the circuit breaker rejected the call.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ItemError::CircuitOpen)
    }

    /// Returns the worker error if present.
    pub fn into_worker(self) -> Option<E> {
        match self {
            ItemError::Worker(e) => Some(e),
            _ => None,
        }
    }
}

/// Composite error carrying every non-suppressed failure from a
/// `CollectAndContinue` run, with the source index of each entry.
#[derive(Debug)]
pub struct AggregateError<E> {
    errors: Vec<(usize, ItemError<E>)>,
}

impl<E> AggregateError<E> {
    pub(crate) fn new(errors: Vec<(usize, ItemError<E>)>) -> Self {
        Self { errors }
    }

    /// The collected failures, in completion order.
    pub fn errors(&self) -> &[(usize, ItemError<E>)] {
        &self.errors
    }

    /// Consumes the aggregate, yielding the collected failures.
    pub fn into_errors(self) -> Vec<(usize, ItemError<E>)> {
        self.errors
    }

    /// Number of collected failures.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// True when nothing was collected. The engine never surfaces an empty
    /// aggregate; this exists for symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl<E> fmt::Display for AggregateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} item(s) failed", self.errors.len())
    }
}

impl<E: fmt::Debug> std::error::Error for AggregateError<E> {}

/// Terminal error of one engine invocation.
#[derive(Debug, Error)]
pub enum PipelineError<E> {
    /// The configuration violated an invariant; nothing ran.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The source failed to produce an item.
    #[error("source failed: {0}")]
    Source(SourceError),

    /// A single item failed terminally (FailFast, or a non-aggregated mode).
    #[error("item {index} failed: {error}")]
    Item { index: usize, error: ItemError<E> },

    /// One or more items failed under `CollectAndContinue`.
    #[error("{0}")]
    Aggregate(AggregateError<E>),

    /// The caller cancelled the invocation.
    #[error("pipeline cancelled")]
    Cancelled,
}

impl<E> PipelineError<E> {
    /// Returns true if the invocation ended because the caller cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }

    /// Returns true for a single-item failure caused by an open circuit.
    pub fn is_circuit_open(&self) -> bool {
        matches!(
            self,
            PipelineError::Item {
                error: ItemError::CircuitOpen,
                ..
            }
        )
    }

    /// Returns the aggregate if this is a `CollectAndContinue` composite.
    pub fn into_aggregate(self) -> Option<AggregateError<E>> {
        match self {
            PipelineError::Aggregate(agg) => Some(agg),
            _ => None,
        }
    }
}
