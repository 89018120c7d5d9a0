use crate::config::CircuitBreakerSettings;
use crate::events::PipelineEvent;
use rivulet_core::EventListeners;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

#[cfg(feature = "metrics")]
use metrics::counter;

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls are admitted.
    Closed,
    /// Calls are rejected until the open timeout elapses.
    Open,
    /// Probe calls are admitted; outcomes decide recovery.
    HalfOpen,
}

impl CircuitState {
    fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }
}

/// Per-invocation circuit breaker.
///
/// Opens on consecutive failures (or on a count of failures within
/// `sampling_window`, when configured), rejects while open, admits a probe
/// after `open_timeout`, and closes again after `success_threshold`
/// consecutive probe successes. Deadlines run on the tokio clock, so paused
/// test time drives them deterministically.
pub(crate) struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    settings: CircuitBreakerSettings,
    listeners: Arc<EventListeners<PipelineEvent>>,
    name: String,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Instant,
    failure_times: VecDeque<Instant>,
}

impl CircuitBreaker {
    pub(crate) fn new(
        settings: CircuitBreakerSettings,
        listeners: Arc<EventListeners<PipelineEvent>>,
        name: String,
    ) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: Instant::now(),
                failure_times: VecDeque::new(),
            }),
            settings,
            listeners,
            name,
        }
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Requests entry for one call. Returns false when the call must be
    /// rejected with `CircuitOpen`.
    pub(crate) fn try_acquire(&self) -> bool {
        let transition = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => return true,
                CircuitState::Open => {
                    if inner.opened_at.elapsed() >= self.settings.open_timeout {
                        inner.transition_to(CircuitState::HalfOpen)
                    } else {
                        return false;
                    }
                }
            }
        };
        self.notify(transition);
        true
    }

    pub(crate) fn record_success(&self) {
        let transition = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.consecutive_failures = 0;
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.settings.success_threshold {
                        inner.transition_to(CircuitState::Closed)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        self.notify(transition);
    }

    pub(crate) fn record_failure(&self) {
        let transition = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.state {
                CircuitState::HalfOpen => inner.transition_to(CircuitState::Open),
                CircuitState::Closed => {
                    let tripped = if let Some(window) = self.settings.sampling_window {
                        let now = Instant::now();
                        inner.failure_times.push_back(now);
                        while let Some(&oldest) = inner.failure_times.front() {
                            if now.duration_since(oldest) > window {
                                inner.failure_times.pop_front();
                            } else {
                                break;
                            }
                        }
                        inner.failure_times.len() as u32 >= self.settings.failure_threshold
                    } else {
                        inner.consecutive_failures += 1;
                        inner.consecutive_failures >= self.settings.failure_threshold
                    };
                    if tripped {
                        inner.transition_to(CircuitState::Open)
                    } else {
                        None
                    }
                }
                // a straggler finishing after the circuit opened
                CircuitState::Open => None,
            }
        };
        self.notify(transition);
    }

    /// Events and metrics fire outside the state lock.
    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };

        #[cfg(feature = "tracing")]
        tracing::info!(pipeline = %self.name, from = ?from, to = ?to, "circuit state transition");

        #[cfg(feature = "metrics")]
        counter!(
            "rivulet_circuit_transitions_total",
            "pipeline" => self.name.clone(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);

        #[cfg(not(feature = "metrics"))]
        let _ = CircuitState::as_str;

        self.listeners.emit(&PipelineEvent::CircuitTransition {
            pipeline_name: self.name.clone(),
            timestamp: std::time::Instant::now(),
            from,
            to,
        });
    }
}

impl BreakerInner {
    fn transition_to(&mut self, state: CircuitState) -> Option<(CircuitState, CircuitState)> {
        if self.state == state {
            return None;
        }
        let from = self.state;
        self.state = state;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.failure_times.clear();
        if state == CircuitState::Open {
            self.opened_at = Instant::now();
        }
        Some((from, state))
    }
}
