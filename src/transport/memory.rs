use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Delivery, Publisher, Subscriber};

/// In-process broker used by standalone mode and tests.
///
/// Each topic buffers messages until its single subscriber attaches, so
/// nothing published before `subscribe` is lost. A strict broker instead
/// rejects messages for topics nobody has subscribed to.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
    strict: bool,
}

struct Topic {
    tx: Option<mpsc::UnboundedSender<(i64, Vec<u8>)>>,
    rx: Option<mpsc::UnboundedReceiver<(i64, Vec<u8>)>>,
    next_offset: i64,
    acked: u64,
    failing: bool,
}

impl Topic {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
            next_offset: 0,
            acked: 0,
            failing: false,
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that only accepts messages for subscribed topics.
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }

    /// Attach the subscriber for `topic`. A topic has at most one.
    pub fn subscribe(&self, topic: &str) -> Result<MemorySubscriber> {
        let mut topics = self.topics.lock();
        let state = topics.entry(topic.to_string()).or_insert_with(Topic::new);

        let Some(rx) = state.rx.take() else {
            bail!("topic {topic} already has a subscriber");
        };

        Ok(MemorySubscriber {
            broker: self.clone(),
            topic: topic.to_string(),
            rx,
        })
    }

    /// Make every publish to `topic` fail until cleared.
    pub fn set_failing(&self, topic: &str, failing: bool) {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.to_string())
            .or_insert_with(Topic::new)
            .failing = failing;
    }

    /// Stop accepting messages on `topic`. The subscriber drains what is
    /// buffered and then sees the end of the stream.
    pub fn close_topic(&self, topic: &str) {
        if let Some(state) = self.topics.lock().get_mut(topic) {
            state.tx = None;
        }
    }

    /// Number of messages accepted on `topic`.
    pub fn published(&self, topic: &str) -> u64 {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |t| t.next_offset as u64)
    }

    /// Number of deliveries acknowledged on `topic`.
    pub fn acked(&self, topic: &str) -> u64 {
        self.topics.lock().get(topic).map_or(0, |t| t.acked)
    }
}

impl Publisher for MemoryBroker {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let mut topics = self.topics.lock();
        let state = topics.entry(topic.to_string()).or_insert_with(Topic::new);

        if state.failing {
            bail!("publishing to {topic}: broker unavailable");
        }

        let Some(tx) = &state.tx else {
            bail!("publishing to {topic}: topic closed");
        };

        // The receiver is still parked here until someone subscribes.
        if self.strict && state.rx.is_some() {
            bail!("publishing to {topic}: no subscriber");
        }

        let offset = state.next_offset;
        if tx.send((offset, payload.to_vec())).is_err() {
            bail!("publishing to {topic}: subscriber dropped");
        }
        state.next_offset += 1;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Receiving half of a [`MemoryBroker`] topic.
pub struct MemorySubscriber {
    broker: MemoryBroker,
    topic: String,
    rx: mpsc::UnboundedReceiver<(i64, Vec<u8>)>,
}

impl Subscriber for MemorySubscriber {
    async fn recv(&mut self) -> Result<Option<Delivery>> {
        Ok(self.rx.recv().await.map(|(offset, payload)| Delivery {
            topic: self.topic.clone(),
            partition: 0,
            offset,
            payload,
        }))
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        if let Some(state) = self.broker.topics.lock().get_mut(&delivery.topic) {
            state.acked += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffers_until_subscribed() {
        let broker = MemoryBroker::new();
        broker.publish("bj01-task", b"one").await.expect("publish");
        broker.publish("bj01-task", b"two").await.expect("publish");

        let mut sub = broker.subscribe("bj01-task").expect("subscribe");
        let first = sub.recv().await.expect("recv").expect("delivery");
        assert_eq!(first.payload, b"one");
        assert_eq!(first.offset, 0);
        sub.ack(&first).expect("ack");

        let second = sub.recv().await.expect("recv").expect("delivery");
        assert_eq!(second.offset, 1);

        assert_eq!(broker.published("bj01-task"), 2);
        assert_eq!(broker.acked("bj01-task"), 1);
    }

    #[tokio::test]
    async fn test_single_subscriber_per_topic() {
        let broker = MemoryBroker::new();
        let _sub = broker.subscribe("t").expect("first");
        assert!(broker.subscribe("t").is_err());
    }

    #[tokio::test]
    async fn test_failing_topic() {
        let broker = MemoryBroker::new();
        broker.set_failing("t", true);
        assert!(broker.publish("t", b"x").await.is_err());
        assert_eq!(broker.published("t"), 0);

        broker.set_failing("t", false);
        broker.publish("t", b"x").await.expect("publish");
        assert_eq!(broker.published("t"), 1);
    }

    #[tokio::test]
    async fn test_strict_requires_subscriber() {
        let broker = MemoryBroker::strict();
        assert!(broker.publish("other-task", b"x").await.is_err());

        let mut sub = broker.subscribe("bj01-task").expect("subscribe");
        broker.publish("bj01-task", b"x").await.expect("publish");
        assert!(sub.recv().await.expect("recv").is_some());
    }

    #[tokio::test]
    async fn test_close_topic_ends_stream() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("t").expect("subscribe");
        broker.publish("t", b"last").await.expect("publish");
        broker.close_topic("t");

        assert!(sub.recv().await.expect("recv").is_some());
        assert!(sub.recv().await.expect("recv").is_none());
        assert!(broker.publish("t", b"late").await.is_err());
    }
}
