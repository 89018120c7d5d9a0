use crate::breaker::CircuitState;
use rivulet_core::EngineEvent;
use std::time::{Duration, Instant};

/// Events emitted by one engine invocation.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// An item was handed to a worker task.
    ItemStarted {
        pipeline_name: String,
        timestamp: Instant,
        index: usize,
    },
    /// An item reached its final outcome (success or terminal error).
    ItemCompleted {
        pipeline_name: String,
        timestamp: Instant,
        index: usize,
    },
    /// A retry is about to sleep before the next attempt.
    RetryScheduled {
        pipeline_name: String,
        timestamp: Instant,
        index: usize,
        attempt: u32,
        delay: Duration,
    },
    /// The dispatcher had to wait for a concurrency permit.
    Throttled {
        pipeline_name: String,
        timestamp: Instant,
        in_flight: usize,
    },
    /// In-flight work drained to zero after the source was exhausted.
    Drained {
        pipeline_name: String,
        timestamp: Instant,
        pending: usize,
    },
    /// The circuit breaker changed state.
    CircuitTransition {
        pipeline_name: String,
        timestamp: Instant,
        from: CircuitState,
        to: CircuitState,
    },
    /// The adaptive controller adjusted the concurrency cap.
    ConcurrencyChanged {
        pipeline_name: String,
        timestamp: Instant,
        old: usize,
        new: usize,
    },
}

impl EngineEvent for PipelineEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::ItemStarted { .. } => "item_started",
            PipelineEvent::ItemCompleted { .. } => "item_completed",
            PipelineEvent::RetryScheduled { .. } => "retry_scheduled",
            PipelineEvent::Throttled { .. } => "throttled",
            PipelineEvent::Drained { .. } => "drained",
            PipelineEvent::CircuitTransition { .. } => "circuit_transition",
            PipelineEvent::ConcurrencyChanged { .. } => "concurrency_changed",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            PipelineEvent::ItemStarted { timestamp, .. }
            | PipelineEvent::ItemCompleted { timestamp, .. }
            | PipelineEvent::RetryScheduled { timestamp, .. }
            | PipelineEvent::Throttled { timestamp, .. }
            | PipelineEvent::Drained { timestamp, .. }
            | PipelineEvent::CircuitTransition { timestamp, .. }
            | PipelineEvent::ConcurrencyChanged { timestamp, .. } => *timestamp,
        }
    }

    fn pipeline_name(&self) -> &str {
        match self {
            PipelineEvent::ItemStarted { pipeline_name, .. }
            | PipelineEvent::ItemCompleted { pipeline_name, .. }
            | PipelineEvent::RetryScheduled { pipeline_name, .. }
            | PipelineEvent::Throttled { pipeline_name, .. }
            | PipelineEvent::Drained { pipeline_name, .. }
            | PipelineEvent::CircuitTransition { pipeline_name, .. }
            | PipelineEvent::ConcurrencyChanged { pipeline_name, .. } => pipeline_name,
        }
    }
}
