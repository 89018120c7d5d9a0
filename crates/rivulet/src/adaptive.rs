use crate::config::{AdaptiveConcurrency, AdaptiveStrategy};
use crate::events::PipelineEvent;
use rivulet_core::EventListeners;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "metrics")]
use metrics::gauge;

impl AdaptiveStrategy {
    pub(crate) fn increase(&self, cap: usize, max: usize) -> usize {
        let next = match self {
            AdaptiveStrategy::Aimd | AdaptiveStrategy::Gradual => cap + 1,
            AdaptiveStrategy::Aggressive => cap + (cap / 10).max(1),
        };
        next.min(max)
    }

    pub(crate) fn decrease(&self, cap: usize, min: usize) -> usize {
        let next = match self {
            AdaptiveStrategy::Aimd | AdaptiveStrategy::Aggressive => cap / 2,
            AdaptiveStrategy::Gradual => cap * 3 / 4,
        };
        next.max(min)
    }
}

#[derive(Default)]
struct WindowStats {
    successes: u64,
    failures: u64,
    latency_sum: Duration,
}

/// Adaptive concurrency controller.
///
/// Owns the concurrency semaphore. Workers record each attempt's outcome and
/// latency; a periodic sampler evaluates the window and widens or narrows
/// the cap. Widening releases permits; narrowing hands the surplus to a
/// background task that acquires and holds it, so the cap shrinks as
/// in-flight work completes.
pub(crate) struct AdaptiveController {
    semaphore: Arc<Semaphore>,
    cap: AtomicUsize,
    window: Mutex<WindowStats>,
    settings: AdaptiveConcurrency,
    listeners: Arc<EventListeners<PipelineEvent>>,
    name: String,
    shutdown: CancellationToken,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl AdaptiveController {
    pub(crate) fn start(
        settings: AdaptiveConcurrency,
        listeners: Arc<EventListeners<PipelineEvent>>,
        name: String,
    ) -> Arc<Self> {
        let initial = settings.initial.unwrap_or(settings.max);
        let controller = Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(initial)),
            cap: AtomicUsize::new(initial),
            window: Mutex::new(WindowStats::default()),
            settings,
            listeners,
            name,
            shutdown: CancellationToken::new(),
            sampler: Mutex::new(None),
        });

        let sampler = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = controller.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(controller.settings.sample_interval) => {
                            controller.evaluate_window();
                        }
                    }
                }
            })
        };
        *controller.sampler.lock().unwrap_or_else(|e| e.into_inner()) = Some(sampler);
        controller
    }

    pub(crate) fn semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.semaphore)
    }

    pub(crate) fn cap(&self) -> usize {
        self.cap.load(Ordering::Relaxed)
    }

    /// Records one worker attempt into the current window.
    pub(crate) fn record(&self, success: bool, latency: Duration) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if success {
            window.successes += 1;
        } else {
            window.failures += 1;
        }
        window.latency_sum += latency;
    }

    fn evaluate_window(&self) {
        let window = {
            let mut guard = self.window.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        let total = window.successes + window.failures;
        if total == 0 {
            return;
        }

        let success_rate = window.successes as f64 / total as f64;
        let avg_latency = window.latency_sum / total as u32;
        let over_latency = self
            .settings
            .target_latency
            .map(|target| avg_latency > target)
            .unwrap_or(false);

        let old = self.cap.load(Ordering::Relaxed);
        let new = if success_rate < self.settings.min_success_rate || over_latency {
            self.settings.decrease_strategy.decrease(old, self.settings.min)
        } else {
            self.settings.increase_strategy.increase(old, self.settings.max)
        };
        if new == old {
            return;
        }

        self.cap.store(new, Ordering::Relaxed);
        if new > old {
            self.semaphore.add_permits(new - old);
        } else {
            let surplus = (old - new) as u32;
            let semaphore = Arc::clone(&self.semaphore);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    acquired = semaphore.acquire_many_owned(surplus) => {
                        if let Ok(permits) = acquired {
                            permits.forget();
                        }
                    }
                }
            });
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            pipeline = %self.name,
            old,
            new,
            success_rate,
            "adaptive concurrency cap changed"
        );

        #[cfg(feature = "metrics")]
        gauge!("rivulet_concurrency_cap", "pipeline" => self.name.clone()).set(new as f64);

        self.listeners.emit(&PipelineEvent::ConcurrencyChanged {
            pipeline_name: self.name.clone(),
            timestamp: Instant::now(),
            old,
            new,
        });
    }

    /// Stops the sampler and any pending shrink tasks.
    pub(crate) async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self
            .sampler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
