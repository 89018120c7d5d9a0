use crate::adaptive::AdaptiveController;
use crate::backoff::BackoffStrategy;
use crate::breaker::CircuitBreaker;
use crate::config::{ErrorHook, ErrorMode, ParallelConfig, RetryHook, TransientPredicate};
use crate::error::{AggregateError, ItemError, PipelineError, SourceError};
use crate::events::PipelineEvent;
use crate::limiter::TokenBucket;
use crate::metrics::PipelineCounters;
use crate::output::Completion;
use crate::source::ParallelSource;
use rivulet_core::EventListeners;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

/// Records terminal failures according to the error mode.
struct ErrorSink<E> {
    first: Mutex<Option<(usize, ItemError<E>)>>,
    collected: Mutex<Vec<(usize, ItemError<E>)>>,
}

impl<E> ErrorSink<E> {
    fn new() -> Self {
        Self {
            first: Mutex::new(None),
            collected: Mutex::new(Vec::new()),
        }
    }

    /// Keeps only the first non-suppressed failure; later ones are
    /// discarded.
    fn record_first(&self, index: usize, error: ItemError<E>) {
        let mut first = self.first.lock().unwrap_or_else(|e| e.into_inner());
        if first.is_none() {
            *first = Some((index, error));
        }
    }

    fn collect(&self, index: usize, error: ItemError<E>) {
        self.collected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((index, error));
    }

    fn take_first(&self) -> Option<(usize, ItemError<E>)> {
        self.first.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn take_collected(&self) -> Vec<(usize, ItemError<E>)> {
        std::mem::take(&mut self.collected.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Everything one invocation shares between the driver and its workers.
/// Owned by the invocation; dropped when the driver returns and the stream
/// is consumed.
pub(crate) struct EngineShared<E> {
    error_mode: ErrorMode,
    max_parallelism: usize,
    max_retries: u32,
    base_delay: Duration,
    backoff: BackoffStrategy,
    is_transient: TransientPredicate<E>,
    per_item_timeout: Option<Duration>,
    on_error: Option<ErrorHook<E>>,
    on_retry: Option<RetryHook<E>>,
    name: String,
    listeners: Arc<EventListeners<PipelineEvent>>,
    counters: Arc<PipelineCounters>,
    breaker: Option<CircuitBreaker>,
    bucket: Option<TokenBucket>,
    adaptive: Option<Arc<AdaptiveController>>,
    gate: Arc<Semaphore>,
    caller: CancellationToken,
    pub(crate) token: CancellationToken,
    sink: ErrorSink<E>,
}

impl<E> EngineShared<E> {
    /// Builds the shared state and starts the configured resilience
    /// primitives. Must run inside a Tokio runtime.
    pub(crate) fn new(config: ParallelConfig<E>) -> Arc<Self> {
        let listeners = Arc::new(config.listeners);
        let counters = config
            .counters
            .unwrap_or_else(|| Arc::new(PipelineCounters::new()));
        let caller = config.cancellation.unwrap_or_default();
        let token = caller.child_token();

        let breaker = config.circuit_breaker.map(|settings| {
            CircuitBreaker::new(settings, Arc::clone(&listeners), config.name.clone())
        });
        let bucket = config.rate_limit.as_ref().map(TokenBucket::new);
        let (adaptive, gate) = match config.adaptive {
            Some(settings) => {
                let controller = AdaptiveController::start(
                    settings,
                    Arc::clone(&listeners),
                    config.name.clone(),
                );
                let gate = controller.semaphore();
                (Some(controller), gate)
            }
            None => (None, Arc::new(Semaphore::new(config.max_parallelism))),
        };

        Arc::new(Self {
            error_mode: config.error_mode,
            max_parallelism: config.max_parallelism,
            max_retries: config.max_retries,
            base_delay: config.base_delay,
            backoff: config.backoff,
            is_transient: config.is_transient,
            per_item_timeout: config.per_item_timeout,
            on_error: config.on_error,
            on_retry: config.on_retry,
            name: config.name,
            listeners,
            counters,
            breaker,
            bucket,
            adaptive,
            gate,
            caller,
            token,
            sink: ErrorSink::new(),
        })
    }

    fn in_flight(&self) -> usize {
        let cap = self
            .adaptive
            .as_ref()
            .map(|a| a.cap())
            .unwrap_or(self.max_parallelism);
        cap.saturating_sub(self.gate.available_permits())
    }

    /// Final-outcome bookkeeping for one index; fires before the result is
    /// published to the output channel.
    fn complete(&self, index: usize) {
        self.counters.inc_completed();
        self.listeners.emit(&PipelineEvent::ItemCompleted {
            pipeline_name: self.name.clone(),
            timestamp: Instant::now(),
            index,
        });
    }
}

/// The scheduling loop: one permit, one rate token, one source item, one
/// spawned worker, until the source is exhausted or the engine cancels.
/// Joins every worker before returning the terminal outcome.
pub(crate) async fn drive<T, R, E, W, Fut>(
    mut source: ParallelSource<T>,
    worker: Arc<W>,
    shared: Arc<EngineShared<E>>,
    tx: mpsc::Sender<Completion<R>>,
) -> Result<(), PipelineError<E>>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    W: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let mut tasks = JoinSet::new();
    let mut next_index = 0usize;
    let mut source_error: Option<SourceError> = None;
    let mut exhausted = false;

    loop {
        if shared.token.is_cancelled() {
            break;
        }

        let permit = match shared.gate.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                shared.counters.inc_throttles();

                #[cfg(feature = "metrics")]
                counter!("rivulet_throttle_total", "pipeline" => shared.name.clone())
                    .increment(1);

                shared.listeners.emit(&PipelineEvent::Throttled {
                    pipeline_name: shared.name.clone(),
                    timestamp: Instant::now(),
                    in_flight: shared.in_flight(),
                });
                tokio::select! {
                    biased;
                    _ = shared.token.cancelled() => break,
                    acquired = shared.gate.clone().acquire_owned() => match acquired {
                        Ok(permit) => permit,
                        Err(_) => break,
                    }
                }
            }
            Err(TryAcquireError::Closed) => break,
        };

        if let Some(bucket) = &shared.bucket {
            if bucket.acquire(&shared.token).await.is_err() {
                break;
            }
        }

        let pulled = tokio::select! {
            biased;
            _ = shared.token.cancelled() => break,
            item = source.next() => item,
        };
        match pulled {
            Ok(Some(payload)) => {
                let index = next_index;
                next_index += 1;
                shared.counters.inc_started();

                #[cfg(feature = "metrics")]
                counter!("rivulet_items_started_total", "pipeline" => shared.name.clone())
                    .increment(1);

                shared.listeners.emit(&PipelineEvent::ItemStarted {
                    pipeline_name: shared.name.clone(),
                    timestamp: Instant::now(),
                    index,
                });

                let worker = Arc::clone(&worker);
                let shared = Arc::clone(&shared);
                let tx = tx.clone();
                tasks.spawn(async move {
                    run_item(index, payload, worker, shared, tx, permit).await;
                });
            }
            Ok(None) => {
                exhausted = true;
                break;
            }
            Err(error) => {
                source_error = Some(error);
                shared.token.cancel();
                break;
            }
        }
    }
    drop(tx);

    let pending = tasks.len();
    while let Some(joined) = tasks.join_next().await {
        if let Err(_join_error) = joined {
            #[cfg(feature = "tracing")]
            tracing::warn!(pipeline = %shared.name, error = %_join_error, "worker task failed to join");
        }
    }

    if exhausted && pending > 0 {
        shared.counters.inc_drains();
        shared.listeners.emit(&PipelineEvent::Drained {
            pipeline_name: shared.name.clone(),
            timestamp: Instant::now(),
            pending,
        });
    }

    if let Some(controller) = &shared.adaptive {
        controller.stop().await;
    }

    if shared.caller.is_cancelled() {
        #[cfg(feature = "tracing")]
        tracing::debug!(pipeline = %shared.name, "pipeline cancelled by caller");
        return Err(PipelineError::Cancelled);
    }
    if let Some(error) = source_error {
        return Err(PipelineError::Source(error));
    }
    if let Some((index, error)) = shared.sink.take_first() {
        return Err(PipelineError::Item { index, error });
    }
    let collected = shared.sink.take_collected();
    if !collected.is_empty() {
        return Err(PipelineError::Aggregate(AggregateError::new(collected)));
    }
    Ok(())
}

/// One worker task: run the retry state machine, route the outcome through
/// the error mode, publish, then release the concurrency permit.
async fn run_item<T, R, E, W, Fut>(
    index: usize,
    payload: T,
    worker: Arc<W>,
    shared: Arc<EngineShared<E>>,
    tx: mpsc::Sender<Completion<R>>,
    permit: tokio::sync::OwnedSemaphorePermit,
) where
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    W: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let outcome = attempt_loop(index, payload, worker.as_ref(), &shared).await;
    // publishing happens while the permit is still held, so a full output
    // channel transitively pauses spawning
    let _permit = permit;

    match outcome {
        // the engine is terminating; there is no outcome to publish
        Err(ItemError::Cancelled) => {}
        Ok(value) => {
            #[cfg(feature = "metrics")]
            counter!("rivulet_items_total", "pipeline" => shared.name.clone(), "outcome" => "success")
                .increment(1);

            shared.complete(index);
            publish(&shared, &tx, Completion::Value { index, value }).await;
        }
        Err(error) => {
            shared.counters.inc_failures();

            #[cfg(feature = "metrics")]
            counter!("rivulet_items_total", "pipeline" => shared.name.clone(), "outcome" => "failure")
                .increment(1);

            let suppressed = shared
                .on_error
                .as_ref()
                .map(|hook| hook(index, &error))
                .unwrap_or(false);
            shared.complete(index);

            match shared.error_mode {
                ErrorMode::FailFast => {
                    if suppressed {
                        publish(&shared, &tx, Completion::Skip { index }).await;
                    } else {
                        shared.sink.record_first(index, error);
                        shared.token.cancel();
                    }
                }
                ErrorMode::CollectAndContinue => {
                    if !suppressed {
                        shared.sink.collect(index, error);
                    }
                    publish(&shared, &tx, Completion::Skip { index }).await;
                }
                ErrorMode::BestEffort => {
                    publish(&shared, &tx, Completion::Skip { index }).await;
                }
            }
        }
    }
}

/// The per-item state machine of retry, timeout, and breaker admission.
async fn attempt_loop<T, R, E, W, Fut>(
    index: usize,
    payload: T,
    worker: &W,
    shared: &EngineShared<E>,
) -> Result<R, ItemError<E>>
where
    T: Clone,
    W: Fn(T, CancellationToken) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let mut attempt: u32 = 0;
    let mut previous_delay = Duration::ZERO;

    loop {
        if shared.token.is_cancelled() {
            return Err(ItemError::Cancelled);
        }
        if let Some(breaker) = &shared.breaker {
            if !breaker.try_acquire() {
                return Err(ItemError::CircuitOpen);
            }
        }

        // the attempt token merges engine cancellation with the per-item
        // deadline into the one signal the worker sees
        let attempt_token = shared.token.child_token();
        let started = Instant::now();
        let result = match shared.per_item_timeout {
            Some(limit) => {
                match timeout(limit, worker(payload.clone(), attempt_token.clone())).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(error)) => Err(ItemError::Worker(error)),
                    Err(_elapsed) => {
                        attempt_token.cancel();
                        Err(ItemError::Timeout(limit))
                    }
                }
            }
            None => worker(payload.clone(), attempt_token.clone())
                .await
                .map_err(ItemError::Worker),
        };
        let latency = started.elapsed();

        #[cfg(feature = "metrics")]
        histogram!("rivulet_attempt_duration_seconds", "pipeline" => shared.name.clone())
            .record(latency.as_secs_f64());

        match result {
            Ok(value) => {
                if let Some(breaker) = &shared.breaker {
                    breaker.record_success();
                }
                if let Some(controller) = &shared.adaptive {
                    controller.record(true, latency);
                }
                return Ok(value);
            }
            Err(error) => {
                if shared.token.is_cancelled() {
                    return Err(ItemError::Cancelled);
                }
                if let Some(breaker) = &shared.breaker {
                    breaker.record_failure();
                }
                if let Some(controller) = &shared.adaptive {
                    controller.record(false, latency);
                }

                if attempt < shared.max_retries && (shared.is_transient)(&error) {
                    attempt += 1;
                    shared.counters.inc_retries();

                    #[cfg(feature = "metrics")]
                    counter!("rivulet_retries_total", "pipeline" => shared.name.clone())
                        .increment(1);

                    if let Some(hook) = &shared.on_retry {
                        hook(index, attempt, &error);
                    }
                    let delay =
                        shared
                            .backoff
                            .next_delay(shared.base_delay, attempt, &mut previous_delay);

                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        pipeline = %shared.name,
                        index,
                        attempt,
                        delay_ms = delay.as_millis(),
                        "retrying after delay"
                    );

                    shared.listeners.emit(&PipelineEvent::RetryScheduled {
                        pipeline_name: shared.name.clone(),
                        timestamp: Instant::now(),
                        index,
                        attempt,
                        delay,
                    });

                    tokio::select! {
                        biased;
                        _ = shared.token.cancelled() => return Err(ItemError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                    continue;
                }
                return Err(error);
            }
        }
    }
}

async fn publish<R, E>(
    shared: &EngineShared<E>,
    tx: &mpsc::Sender<Completion<R>>,
    completion: Completion<R>,
) {
    tokio::select! {
        biased;
        _ = shared.token.cancelled() => {}
        _ = tx.send(completion) => {}
    }
}
