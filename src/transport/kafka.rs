use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;

use super::{Delivery, Publisher, Subscriber};
use crate::config::TransportConfig;

/// Synchronous-acknowledgement producer used by the controller.
pub struct KafkaPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(cfg: &TransportConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", cfg.brokers.join(","))
            .set("acks", "all")
            .set("message.send.max.retries", "5")
            .set("message.timeout.ms", cfg.produce_timeout.as_millis().to_string())
            .create()
            .context("creating kafka producer")?;

        Ok(Self {
            producer,
            timeout: cfg.produce_timeout,
        })
    }
}

impl Publisher for KafkaPublisher {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let record = FutureRecord::<(), [u8]>::to(topic).payload(payload);

        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| anyhow!(e))
            .with_context(|| format!("publishing to {topic}"))
    }

    async fn close(&self) -> Result<()> {
        self.producer
            .flush(Timeout::After(self.timeout))
            .context("flushing kafka producer")
    }
}

/// Consumer-group subscriber used by agents.
///
/// Offsets are stored only on [`Subscriber::ack`] and committed in the
/// background, so an unacked message is redelivered after a restart.
pub struct KafkaSubscriber {
    consumer: StreamConsumer,
}

impl KafkaSubscriber {
    pub fn new(cfg: &TransportConfig, group: &str, topic: &str) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", cfg.brokers.join(","))
            .set("group.id", group)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("partition.assignment.strategy", "roundrobin")
            .set("session.timeout.ms", cfg.session_timeout.as_millis().to_string())
            .set(
                "heartbeat.interval.ms",
                cfg.heartbeat_interval.as_millis().to_string(),
            )
            .create()
            .context("creating kafka consumer")?;

        consumer
            .subscribe(&[topic])
            .with_context(|| format!("subscribing to {topic}"))?;

        Ok(Self { consumer })
    }
}

impl Subscriber for KafkaSubscriber {
    async fn recv(&mut self) -> Result<Option<Delivery>> {
        let msg = self.consumer.recv().await.context("receiving message")?;

        Ok(Some(Delivery {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            payload: msg.payload().unwrap_or_default().to_vec(),
        }))
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        self.consumer
            .store_offset(&delivery.topic, delivery.partition, resume_offset(delivery))
            .with_context(|| {
                format!(
                    "storing offset {} for {}/{}",
                    delivery.offset, delivery.topic, delivery.partition
                )
            })
    }
}

/// Offset stored on ack: the next one the group should consume.
fn resume_offset(delivery: &Delivery) -> i64 {
    delivery.offset + 1
}
