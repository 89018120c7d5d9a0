use crate::backoff::BackoffStrategy;
use crate::breaker::CircuitState;
use crate::error::{ConfigError, ItemError};
use crate::events::PipelineEvent;
use crate::metrics::PipelineCounters;
use rivulet_core::{EventListener, EventListeners};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How per-item errors steer the whole invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// First non-suppressed error cancels all in-flight work and is
    /// surfaced to the caller.
    #[default]
    FailFast,
    /// Errors are collected; the run continues and ends with a composite
    /// error if anything was collected.
    CollectAndContinue,
    /// Errors are observed via `on_error` and then dropped.
    BestEffort,
}

/// Token-bucket rate limit settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub(crate) tokens_per_second: f64,
    pub(crate) burst_capacity: f64,
    pub(crate) tokens_per_op: f64,
}

impl RateLimit {
    /// Creates a limit refilling at `tokens_per_second` up to
    /// `burst_capacity`, costing one token per operation.
    pub fn new(tokens_per_second: f64, burst_capacity: f64) -> Self {
        Self {
            tokens_per_second,
            burst_capacity,
            tokens_per_op: 1.0,
        }
    }

    /// Sets the token cost of a single worker admission.
    pub fn tokens_per_op(mut self, tokens: f64) -> Self {
        self.tokens_per_op = tokens;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tokens_per_second <= 0.0 {
            return Err(ConfigError::NonPositiveRate);
        }
        if self.tokens_per_op > self.burst_capacity {
            return Err(ConfigError::TokensPerOpExceedsBurst {
                tokens_per_op: self.tokens_per_op,
                burst_capacity: self.burst_capacity,
            });
        }
        Ok(())
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerSettings {
    pub(crate) failure_threshold: u32,
    pub(crate) success_threshold: u32,
    pub(crate) open_timeout: Duration,
    pub(crate) sampling_window: Option<Duration>,
}

impl CircuitBreakerSettings {
    /// Creates breaker settings. Without a sampling window the failure
    /// threshold counts consecutive failures.
    pub fn new(failure_threshold: u32, success_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            open_timeout,
            sampling_window: None,
        }
    }

    /// Counts failures within a sliding time window instead of
    /// consecutively.
    pub fn sampling_window(mut self, window: Duration) -> Self {
        self.sampling_window = Some(window);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::NonPositiveBreakerThreshold {
                field: "failure_threshold",
            });
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::NonPositiveBreakerThreshold {
                field: "success_threshold",
            });
        }
        if self.open_timeout.is_zero() {
            return Err(ConfigError::ZeroOpenTimeout);
        }
        Ok(())
    }
}

/// How the adaptive controller moves the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdaptiveStrategy {
    /// Additive increase (+1), multiplicative decrease (halve).
    #[default]
    Aimd,
    /// Increase by ~10% of the cap, decrease by halving.
    Aggressive,
    /// Increase by 1, decrease to three quarters.
    Gradual,
}

/// Adaptive concurrency settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveConcurrency {
    pub(crate) min: usize,
    pub(crate) max: usize,
    pub(crate) initial: Option<usize>,
    pub(crate) sample_interval: Duration,
    pub(crate) min_success_rate: f64,
    pub(crate) target_latency: Option<Duration>,
    pub(crate) increase_strategy: AdaptiveStrategy,
    pub(crate) decrease_strategy: AdaptiveStrategy,
}

impl AdaptiveConcurrency {
    /// Creates adaptive settings with the cap bounded by `[min, max]`,
    /// re-evaluated every `sample_interval`.
    ///
    /// Defaults: start at `max`, require a 95% success rate, no latency
    /// target, AIMD in both directions.
    pub fn new(min: usize, max: usize, sample_interval: Duration) -> Self {
        Self {
            min,
            max,
            initial: None,
            sample_interval,
            min_success_rate: 0.95,
            target_latency: None,
            increase_strategy: AdaptiveStrategy::default(),
            decrease_strategy: AdaptiveStrategy::default(),
        }
    }

    /// Sets the starting cap.
    pub fn initial(mut self, initial: usize) -> Self {
        self.initial = Some(initial);
        self
    }

    /// Sets the success rate below which the cap is narrowed.
    pub fn min_success_rate(mut self, rate: f64) -> Self {
        self.min_success_rate = rate;
        self
    }

    /// Narrows the cap when average latency over a window exceeds this.
    pub fn target_latency(mut self, latency: Duration) -> Self {
        self.target_latency = Some(latency);
        self
    }

    /// Sets the widening strategy.
    pub fn increase_strategy(mut self, strategy: AdaptiveStrategy) -> Self {
        self.increase_strategy = strategy;
        self
    }

    /// Sets the narrowing strategy.
    pub fn decrease_strategy(mut self, strategy: AdaptiveStrategy) -> Self {
        self.decrease_strategy = strategy;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min < 1 || self.min > self.max {
            return Err(ConfigError::AdaptiveBounds {
                min: self.min,
                max: self.max,
            });
        }
        if let Some(initial) = self.initial {
            if initial < self.min || initial > self.max {
                return Err(ConfigError::AdaptiveInitialOutOfRange {
                    initial,
                    min: self.min,
                    max: self.max,
                });
            }
        }
        if self.sample_interval.is_zero() {
            return Err(ConfigError::ZeroSampleInterval);
        }
        Ok(())
    }
}

pub(crate) type TransientPredicate<E> = Arc<dyn Fn(&ItemError<E>) -> bool + Send + Sync>;
pub(crate) type ErrorHook<E> = Arc<dyn Fn(usize, &ItemError<E>) -> bool + Send + Sync>;
pub(crate) type RetryHook<E> = Arc<dyn Fn(usize, u32, &ItemError<E>) + Send + Sync>;

/// Configuration for one engine invocation. Built with
/// [`ParallelConfig::builder`] and frozen once the engine starts.
pub struct ParallelConfig<E> {
    pub(crate) max_parallelism: usize,
    pub(crate) channel_capacity: usize,
    pub(crate) error_mode: ErrorMode,
    pub(crate) max_retries: u32,
    pub(crate) base_delay: Duration,
    pub(crate) backoff: BackoffStrategy,
    pub(crate) is_transient: TransientPredicate<E>,
    pub(crate) per_item_timeout: Option<Duration>,
    pub(crate) ordered_output: bool,
    pub(crate) rate_limit: Option<RateLimit>,
    pub(crate) circuit_breaker: Option<CircuitBreakerSettings>,
    pub(crate) adaptive: Option<AdaptiveConcurrency>,
    pub(crate) on_error: Option<ErrorHook<E>>,
    pub(crate) on_retry: Option<RetryHook<E>>,
    pub(crate) listeners: EventListeners<PipelineEvent>,
    pub(crate) name: String,
    pub(crate) cancellation: Option<CancellationToken>,
    pub(crate) counters: Option<Arc<PipelineCounters>>,
}

impl<E> ParallelConfig<E> {
    /// Creates a builder with defaults.
    pub fn builder() -> ParallelConfigBuilder<E> {
        ParallelConfigBuilder::new()
    }

    /// Checks every configuration invariant, reporting the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallelism == 0 {
            return Err(ConfigError::ZeroParallelism);
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ZeroChannelCapacity);
        }
        if let Some(timeout) = self.per_item_timeout {
            if timeout.is_zero() {
                return Err(ConfigError::ZeroItemTimeout);
            }
        }
        if let Some(limit) = &self.rate_limit {
            limit.validate()?;
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }
        if let Some(adaptive) = &self.adaptive {
            adaptive.validate()?;
        }
        Ok(())
    }
}

impl<E> Default for ParallelConfig<E> {
    fn default() -> Self {
        ParallelConfigBuilder::new().build()
    }
}

/// Builder for [`ParallelConfig`].
pub struct ParallelConfigBuilder<E> {
    max_parallelism: usize,
    channel_capacity: Option<usize>,
    error_mode: ErrorMode,
    max_retries: u32,
    base_delay: Duration,
    backoff: BackoffStrategy,
    is_transient: TransientPredicate<E>,
    per_item_timeout: Option<Duration>,
    ordered_output: bool,
    rate_limit: Option<RateLimit>,
    circuit_breaker: Option<CircuitBreakerSettings>,
    adaptive: Option<AdaptiveConcurrency>,
    on_error: Option<ErrorHook<E>>,
    on_retry: Option<RetryHook<E>>,
    listeners: EventListeners<PipelineEvent>,
    name: String,
    cancellation: Option<CancellationToken>,
    counters: Option<Arc<PipelineCounters>>,
}

impl<E> Default for ParallelConfigBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ParallelConfigBuilder<E> {
    /// Creates a builder with defaults.
    ///
    /// Defaults: parallelism = hardware concurrency, channel capacity =
    /// twice the parallelism, `FailFast`, no retries, exponential backoff
    /// from 100ms, every worker/timeout error considered transient,
    /// unordered output, no resilience primitives.
    pub fn new() -> Self {
        Self {
            max_parallelism: default_parallelism(),
            channel_capacity: None,
            error_mode: ErrorMode::default(),
            max_retries: 0,
            base_delay: Duration::from_millis(100),
            backoff: BackoffStrategy::default(),
            is_transient: Arc::new(|_| true),
            per_item_timeout: None,
            ordered_output: false,
            rate_limit: None,
            circuit_breaker: None,
            adaptive: None,
            on_error: None,
            on_retry: None,
            listeners: EventListeners::new(),
            name: String::from("<unnamed>"),
            cancellation: None,
            counters: None,
        }
    }

    /// Caps the number of concurrently executing workers.
    pub fn max_parallelism(mut self, n: usize) -> Self {
        self.max_parallelism = n;
        self
    }

    /// Bounds in-flight-but-unemitted results; full channels pause workers
    /// and, transitively, spawning.
    pub fn channel_capacity(mut self, n: usize) -> Self {
        self.channel_capacity = Some(n);
        self
    }

    /// Selects how per-item errors steer the invocation.
    pub fn error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = mode;
        self
    }

    /// Maximum retries per item (0 = no retry).
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Base delay fed to the backoff strategy.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Selects the backoff strategy for retry sleeps.
    pub fn backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the predicate deciding which per-item errors are retried.
    /// `CircuitOpen` and `Cancelled` are never offered to the predicate.
    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ItemError<E>) -> bool + Send + Sync + 'static,
    {
        self.is_transient = Arc::new(predicate);
        self
    }

    /// Deadline for a single worker attempt.
    pub fn per_item_timeout(mut self, timeout: Duration) -> Self {
        self.per_item_timeout = Some(timeout);
        self
    }

    /// Emits results in source order instead of completion order.
    pub fn ordered_output(mut self, ordered: bool) -> Self {
        self.ordered_output = ordered;
        self
    }

    /// Gates worker admission through a token bucket.
    pub fn rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    /// Short-circuits workers through a circuit breaker.
    pub fn circuit_breaker(mut self, settings: CircuitBreakerSettings) -> Self {
        self.circuit_breaker = Some(settings);
        self
    }

    /// Replaces the fixed parallelism cap with an adaptive controller.
    pub fn adaptive_concurrency(mut self, settings: AdaptiveConcurrency) -> Self {
        self.adaptive = Some(settings);
        self
    }

    /// Names this invocation; the name labels events, logs, and metrics.
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Couples the invocation to a caller-held cancellation token.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Shares a diagnostic counter block with the caller for pull-based
    /// export.
    pub fn counters(mut self, counters: Arc<PipelineCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Registers a raw event listener.
    pub fn listener<L>(mut self, listener: L) -> Self
    where
        L: EventListener<PipelineEvent> + 'static,
    {
        self.listeners.add(listener);
        self
    }

    /// Called with the item index before its first worker invocation.
    pub fn on_start_item<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.listeners.add(move |event: &PipelineEvent| {
            if let PipelineEvent::ItemStarted { index, .. } = event {
                f(*index);
            }
        });
        self
    }

    /// Called with the item index once its final outcome is known.
    pub fn on_complete_item<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.listeners.add(move |event: &PipelineEvent| {
            if let PipelineEvent::ItemCompleted { index, .. } = event {
                f(*index);
            }
        });
        self
    }

    /// Called with `(index, attempt, error)` before each retry sleep.
    pub fn on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(usize, u32, &ItemError<E>) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(f));
        self
    }

    /// Called with `(index, error)` once per terminal item error; returning
    /// `true` suppresses the error in `FailFast` and `CollectAndContinue`.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(usize, &ItemError<E>) -> bool + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called with the in-flight count when the dispatcher has to wait for
    /// a concurrency permit.
    pub fn on_throttle<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.listeners.add(move |event: &PipelineEvent| {
            if let PipelineEvent::Throttled { in_flight, .. } = event {
                f(*in_flight);
            }
        });
        self
    }

    /// Called once when in-flight work drains to zero after the source is
    /// exhausted.
    pub fn on_drain<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.listeners.add(move |event: &PipelineEvent| {
            if let PipelineEvent::Drained { pending, .. } = event {
                f(*pending);
            }
        });
        self
    }

    /// Called with `(old, new)` on each circuit breaker transition.
    pub fn on_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.listeners.add(move |event: &PipelineEvent| {
            if let PipelineEvent::CircuitTransition { from, to, .. } = event {
                f(*from, *to);
            }
        });
        self
    }

    /// Called with `(old, new)` when the adaptive controller moves the cap.
    pub fn on_concurrency_change<F>(mut self, f: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.listeners.add(move |event: &PipelineEvent| {
            if let PipelineEvent::ConcurrencyChanged { old, new, .. } = event {
                f(*old, *new);
            }
        });
        self
    }

    /// Finishes the builder. Invariants are checked when the engine starts.
    pub fn build(self) -> ParallelConfig<E> {
        let channel_capacity = self
            .channel_capacity
            .unwrap_or_else(|| self.max_parallelism.saturating_mul(2).max(1));
        ParallelConfig {
            max_parallelism: self.max_parallelism,
            channel_capacity,
            error_mode: self.error_mode,
            max_retries: self.max_retries,
            base_delay: self.base_delay,
            backoff: self.backoff,
            is_transient: self.is_transient,
            per_item_timeout: self.per_item_timeout,
            ordered_output: self.ordered_output,
            rate_limit: self.rate_limit,
            circuit_breaker: self.circuit_breaker,
            adaptive: self.adaptive,
            on_error: self.on_error,
            on_retry: self.on_retry,
            listeners: self.listeners,
            name: self.name,
            cancellation: self.cancellation,
            counters: self.counters,
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
