//! NATS JetStream integration.
//!
//! Publishes run state changes for downstream consumers.

pub mod publisher;

pub use publisher::{NatsError, NatsPublisher, RunNotification};
