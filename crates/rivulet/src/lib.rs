//! Bounded-parallel async transforms over finite input sequences.
//!
//! Rivulet runs a user-supplied async worker over every item of a finite
//! source with a hard concurrency cap and backpressure, and hands the
//! results back as a materialized list, a lazy stream, or nothing at all.
//! Along the way it can retry transient failures with configurable backoff,
//! enforce per-item timeouts, gate admission through a token-bucket rate
//! limiter and a circuit breaker, and adapt the concurrency cap to observed
//! latency and success rates.
//!
//! # Entry points
//!
//! - [`transform`] — collect every result into a `Vec`.
//! - [`transform_stream`] — consume results lazily as a [`futures::Stream`].
//! - [`for_each`] — run for side effects only.
//!
//! All three take a source (anything convertible to [`ParallelSource`]), a
//! worker `Fn(item, CancellationToken) -> Future<Output = Result<R, E>>`,
//! and a [`ParallelConfig`]. They must be called within a Tokio runtime.
//!
//! # Basic use
//!
//! ```
//! use rivulet::{transform, ParallelConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ParallelConfig::<std::io::Error>::builder()
//!     .max_parallelism(8)
//!     .build();
//!
//! let doubled = transform(
//!     vec![1, 2, 3, 4, 5],
//!     |x: i32, _cancel| async move { Ok::<_, std::io::Error>(x * 2) },
//!     config,
//! )
//! .await?;
//! assert_eq!(doubled.len(), 5);
//! # Ok(())
//! # }
//! ```
//!
//! # Retry, timeout, and error modes
//!
//! ```
//! use rivulet::{transform, BackoffStrategy, ErrorMode, ParallelConfig};
//! use std::time::Duration;
//!
//! # #[derive(Debug)]
//! # struct FetchError;
//! # impl std::fmt::Display for FetchError {
//! #     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//! #         write!(f, "fetch failed")
//! #     }
//! # }
//! # async fn example() {
//! let config = ParallelConfig::<FetchError>::builder()
//!     .max_parallelism(16)
//!     .max_retries(3)
//!     .base_delay(Duration::from_millis(50))
//!     .backoff(BackoffStrategy::ExponentialJitter)
//!     .per_item_timeout(Duration::from_secs(2))
//!     .error_mode(ErrorMode::CollectAndContinue)
//!     .on_retry(|index, attempt, _err| {
//!         eprintln!("item {index}: retry attempt {attempt}");
//!     })
//!     .build();
//! # let _ = config;
//! # }
//! ```
//!
//! # Ordered streaming
//!
//! ```
//! use futures::StreamExt;
//! use rivulet::{transform_stream, ParallelConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ParallelConfig::<std::io::Error>::builder()
//!     .max_parallelism(4)
//!     .ordered_output(true)
//!     .build();
//!
//! let mut results = transform_stream(
//!     vec!["a", "b", "c"],
//!     |s: &'static str, _cancel| async move { Ok::<_, std::io::Error>(s.to_uppercase()) },
//!     config,
//! )?;
//! while let Some(item) = results.next().await {
//!     println!("{}", item?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Cancellation
//!
//! A caller-held [`CancellationToken`](tokio_util::sync::CancellationToken)
//! registered via
//! [`cancellation_token`](ParallelConfigBuilder::cancellation_token)
//! propagates to every suspension point: the source pull, permit and rate
//! acquisition, retry sleeps, and the worker itself (through the token it
//! receives). Cancelling terminates the invocation with
//! [`PipelineError::Cancelled`] after in-flight workers wind down.
//!
//! # Features
//!
//! - `tracing` — structured logs for retries, circuit transitions, and
//!   cancellation.
//! - `metrics` — counters, gauges, and histograms labelled by pipeline
//!   name.

mod adaptive;
mod backoff;
mod breaker;
mod config;
mod dispatcher;
mod error;
mod events;
mod limiter;
mod metrics;
mod output;
mod source;

pub use backoff::BackoffStrategy;
pub use breaker::CircuitState;
pub use config::{
    AdaptiveConcurrency, AdaptiveStrategy, CircuitBreakerSettings, ErrorMode, ParallelConfig,
    ParallelConfigBuilder, RateLimit,
};
pub use error::{AggregateError, ConfigError, ItemError, PipelineError, SourceError};
pub use events::PipelineEvent;
pub use metrics::{CountersSnapshot, PipelineCounters};
pub use output::TransformStream;
pub use source::ParallelSource;

use dispatcher::{drive, EngineShared};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Runs `worker` over every source item and returns a lazy result stream.
///
/// The stream yields one `Ok` per successful item — in completion order, or
/// in source order with
/// [`ordered_output`](ParallelConfigBuilder::ordered_output) — and, if the
/// invocation fails, a single terminal `Err` after the last item.
///
/// Fails immediately with a [`ConfigError`] if the configuration violates
/// an invariant; no work starts in that case.
pub fn transform_stream<T, R, E, W, Fut, S>(
    source: S,
    worker: W,
    config: ParallelConfig<E>,
) -> Result<TransformStream<R, E>, ConfigError>
where
    S: Into<ParallelSource<T>>,
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    W: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    config.validate()?;
    let ordered = config.ordered_output;
    let capacity = config.channel_capacity;

    let shared = EngineShared::new(config);
    let guard = shared.token.clone();
    let (tx, rx) = mpsc::channel(capacity);
    let driver = tokio::spawn(drive(source.into(), Arc::new(worker), shared, tx));
    Ok(TransformStream::new(rx, ordered, driver, guard))
}

/// Runs `worker` over every source item and collects the results.
///
/// In unordered mode the `Vec` holds results in completion order; with
/// [`ordered_output`](ParallelConfigBuilder::ordered_output) it holds them
/// in source order. Any terminal failure is returned instead of the list.
pub async fn transform<T, R, E, W, Fut, S>(
    source: S,
    worker: W,
    config: ParallelConfig<E>,
) -> Result<Vec<R>, PipelineError<E>>
where
    S: Into<ParallelSource<T>>,
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    W: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let mut stream = transform_stream(source, worker, config)?;
    let mut results = Vec::new();
    while let Some(item) = stream.next().await {
        results.push(item?);
    }
    Ok(results)
}

/// Runs `worker` over every source item for its side effects.
pub async fn for_each<T, R, E, W, Fut, S>(
    source: S,
    worker: W,
    config: ParallelConfig<E>,
) -> Result<(), PipelineError<E>>
where
    S: Into<ParallelSource<T>>,
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    W: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let mut stream = transform_stream(source, worker, config)?;
    while let Some(item) = stream.next().await {
        item?;
    }
    Ok(())
}
