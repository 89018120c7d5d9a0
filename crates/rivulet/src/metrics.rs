use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free diagnostic counters for one engine invocation.
///
/// The engine increments these as it runs; callers that passed the block in
/// via [`ParallelConfigBuilder::counters`](crate::ParallelConfigBuilder::counters)
/// read them with [`snapshot`](Self::snapshot) whenever they like.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub(crate) items_started: AtomicU64,
    pub(crate) items_completed: AtomicU64,
    pub(crate) total_retries: AtomicU64,
    pub(crate) total_failures: AtomicU64,
    pub(crate) throttle_events: AtomicU64,
    pub(crate) drain_events: AtomicU64,
}

/// Point-in-time copy of [`PipelineCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    /// Items handed to a worker task.
    pub items_started: u64,
    /// Items that reached a final outcome.
    pub items_completed: u64,
    /// Retry attempts across all items.
    pub total_retries: u64,
    /// Terminal per-item failures (before error-mode routing).
    pub total_failures: u64,
    /// Times the dispatcher had to wait for a concurrency permit.
    pub throttle_events: u64,
    /// Times in-flight work drained to zero after source exhaustion.
    pub drain_events: u64,
}

impl PipelineCounters {
    /// Creates a zeroed counter block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads all counters. Each load is individually atomic; the snapshot as
    /// a whole is not a consistent cut across counters.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            items_started: self.items_started.load(Ordering::Relaxed),
            items_completed: self.items_completed.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            throttle_events: self.throttle_events.load(Ordering::Relaxed),
            drain_events: self.drain_events.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn inc_started(&self) {
        self.items_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_completed(&self) {
        self.items_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_retries(&self) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_failures(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_throttles(&self) {
        self.throttle_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_drains(&self) {
        self.drain_events.fetch_add(1, Ordering::Relaxed);
    }
}
