//! Topic-based publish/subscribe transport.
//!
//! The controller only publishes and agents only subscribe. Delivery is
//! at-least-once; ordering and partition assignment are left to the broker.

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

use std::future::Future;

use anyhow::Result;

/// A message received from a subscribed topic.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Publishes opaque payloads to named topics.
pub trait Publisher: Send + Sync + 'static {
    /// Publish one payload, returning once the broker accepted it.
    fn publish(&self, topic: &str, payload: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Flush outstanding messages and release broker resources.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Consumes payloads from a single topic under a consumer group.
pub trait Subscriber: Send {
    /// Wait for the next delivery. `None` means the topic was closed.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Delivery>>> + Send;

    /// Mark a delivery as processed.
    fn ack(&mut self, delivery: &Delivery) -> Result<()>;
}
