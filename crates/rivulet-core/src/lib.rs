//! Core infrastructure for the rivulet engine.
//!
//! This crate provides the event system used by the engine for
//! observability: a trait for engine events, listener registration, and
//! panic-isolated dispatch.

pub mod events;

pub use events::{EngineEvent, EventListener, EventListeners};
