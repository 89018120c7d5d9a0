//! Listener plumbing for engine events.
//!
//! Each engine invocation carries the listeners registered on its
//! configuration. Components hand events to [`EventListeners::emit`] as the
//! run progresses; dispatch is panic-isolated so a misbehaving observer can
//! neither take down the engine nor starve the listeners behind it.

use std::sync::Arc;
use std::time::Instant;

/// An observable moment in an engine invocation.
pub trait EngineEvent: Send + Sync + std::fmt::Debug {
    /// Kind of event, e.g. "item_started" or "circuit_transition".
    fn event_type(&self) -> &'static str;

    /// When the event occurred.
    fn timestamp(&self) -> Instant;

    /// Name of the pipeline that emitted it.
    fn pipeline_name(&self) -> &str;
}

/// Receives engine events.
///
/// Any `Fn(&E)` closure is a listener; implement the trait directly only
/// when the observer carries state of its own.
pub trait EventListener<E: EngineEvent>: Send + Sync {
    /// Called once per emitted event.
    fn on_event(&self, event: &E);
}

impl<E, F> EventListener<E> for F
where
    E: EngineEvent,
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        self(event)
    }
}

/// The listeners registered for one engine invocation.
#[derive(Clone)]
pub struct EventListeners<E: EngineEvent> {
    registered: Vec<Arc<dyn EventListener<E>>>,
}

impl<E: EngineEvent> EventListeners<E> {
    /// An empty set.
    pub fn new() -> Self {
        Self {
            registered: Vec::new(),
        }
    }

    /// Registers a listener behind the ones already present.
    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener<E> + 'static,
    {
        self.registered.push(Arc::new(listener));
    }

    /// Hands `event` to every listener in registration order.
    ///
    /// A panicking listener is reported (a warning under `tracing`, a
    /// counter under `metrics`) and skipped; the rest still run.
    pub fn emit(&self, event: &E) {
        for listener in &self.registered {
            let guarded = std::panic::AssertUnwindSafe(|| listener.on_event(event));
            if let Err(_payload) = std::panic::catch_unwind(guarded) {
                #[cfg(any(feature = "tracing", feature = "metrics"))]
                report_panicked_listener(event, _payload);
            }
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.registered.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }
}

impl<E: EngineEvent> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(feature = "tracing", feature = "metrics"))]
fn report_panicked_listener<E: EngineEvent>(
    event: &E,
    _payload: Box<dyn std::any::Any + Send>,
) {
    #[cfg(feature = "tracing")]
    {
        let message = _payload
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| _payload.downcast_ref::<&'static str>().copied())
            .unwrap_or("opaque panic payload");
        tracing::warn!(
            pipeline = event.pipeline_name(),
            event_type = event.event_type(),
            panic = message,
            "event listener panicked"
        );
    }

    #[cfg(feature = "metrics")]
    metrics::counter!(
        "rivulet_listener_panics_total",
        "pipeline" => event.pipeline_name().to_string(),
        "event_type" => event.event_type().to_string()
    )
    .increment(1);
}
