use crate::config::RateLimit;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Token-bucket rate limiter with continuous refill.
///
/// Tokens accrue at `tokens_per_second` up to `burst_capacity`; each
/// admission costs `tokens_per_op`. Refill is driven by the tokio monotonic
/// clock, so wall-clock jumps cannot mint or destroy tokens and paused test
/// time governs refill deterministically.
pub(crate) struct TokenBucket {
    state: Mutex<BucketState>,
    rate: f64,
    capacity: f64,
    tokens_per_op: f64,
}

struct BucketState {
    available: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub(crate) fn new(limit: &RateLimit) -> Self {
        Self {
            state: Mutex::new(BucketState {
                available: limit.burst_capacity,
                last_refill: Instant::now(),
            }),
            rate: limit.tokens_per_second,
            capacity: limit.burst_capacity,
            tokens_per_op: limit.tokens_per_op,
        }
    }

    /// Attempts to take `tokens_per_op` tokens. On failure returns the
    /// minimum wait until enough tokens will have accrued.
    pub(crate) fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        state.available =
            (state.available + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        state.last_refill = now;

        if state.available >= self.tokens_per_op {
            state.available -= self.tokens_per_op;
            Ok(())
        } else {
            let deficit = self.tokens_per_op - state.available;
            Err(Duration::from_secs_f64(deficit / self.rate))
        }
    }

    /// Waits until a token is available or the engine is cancelled.
    pub(crate) async fn acquire(&self, cancel: &CancellationToken) -> Result<(), ()> {
        loop {
            match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    // a zero-length sleep cannot advance a paused clock
                    let wait = wait.max(Duration::from_micros(100));
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(()),
                        _ = sleep(wait) => {}
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn available(&self) -> f64 {
        self.state.lock().unwrap().available
    }
}
