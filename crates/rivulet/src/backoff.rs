use rand::Rng;
use std::time::Duration;

/// Strategy for computing the delay before each retry attempt.
///
/// `attempt` is 1-based: the first retry computes with `attempt = 1`.
/// Jittered strategies draw uniformly from `[0, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// `base * 2^(attempt-1)`.
    #[default]
    Exponential,
    /// Uniform over `[0, base * 2^(attempt-1))`.
    ExponentialJitter,
    /// AWS-style decorrelated jitter: first retry uniform over `[0, base)`,
    /// then `base + U(0, 3*prev - base)`, carrying the previous delay.
    DecorrelatedJitter,
    /// `base * attempt`.
    Linear,
    /// Uniform over `[0, base * attempt)`.
    LinearJitter,
}

impl BackoffStrategy {
    /// Computes the delay for the given retry attempt.
    ///
    /// `previous` carries state between attempts for `DecorrelatedJitter`;
    /// it is updated to the returned delay on every call.
    pub(crate) fn next_delay(
        &self,
        base: Duration,
        attempt: u32,
        previous: &mut Duration,
    ) -> Duration {
        debug_assert!(attempt >= 1);
        let delay = match self {
            BackoffStrategy::Exponential => scale_pow2(base, attempt),
            BackoffStrategy::ExponentialJitter => jitter(scale_pow2(base, attempt)),
            BackoffStrategy::DecorrelatedJitter => {
                if attempt == 1 {
                    jitter(base)
                } else {
                    let spread = previous
                        .saturating_mul(3)
                        .saturating_sub(base);
                    base.saturating_add(jitter(spread))
                }
            }
            BackoffStrategy::Linear => base.saturating_mul(attempt),
            BackoffStrategy::LinearJitter => jitter(base.saturating_mul(attempt)),
        };
        *previous = delay;
        delay
    }
}

fn scale_pow2(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

fn jitter(upper: Duration) -> Duration {
    if upper.is_zero() {
        return Duration::ZERO;
    }
    let secs = rand::rng().random_range(0.0..upper.as_secs_f64());
    Duration::from_secs_f64(secs)
}
