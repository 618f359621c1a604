use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::config::ClientConfig;
use rdkafka::message::Message;
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::util::Timeout;
use rdkafka::ClientContext;
use tracing::{debug, warn};

use super::ResultSink;
use crate::config::KafkaSinkConfig;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Relays result batches to a Kafka topic.
///
/// Sends are fire-and-forget: the producer's polling thread reports delivery
/// failures to the log, and `store` never returns an error.
pub struct KafkaSink {
    producer: ThreadedProducer<DeliveryLogger>,
    topic: String,
    flush_timeout: Duration,
}

/// Logs failed deliveries from the producer's polling thread.
pub struct DeliveryLogger;

impl ClientContext for DeliveryLogger {}

impl ProducerContext for DeliveryLogger {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _: Self::DeliveryOpaque) {
        if let Err((e, msg)) = result {
            warn!(error = %e, topic = msg.topic(), "result delivery failed");
        }
    }
}

impl KafkaSink {
    pub fn new(cfg: &KafkaSinkConfig, brokers: &[String]) -> Result<Self> {
        let producer: ThreadedProducer<DeliveryLogger> = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("compression.codec", &cfg.compression)
            .create_with_context(DeliveryLogger)
            .context("creating kafka result producer")?;

        Ok(Self {
            producer,
            topic: cfg.topic.clone(),
            flush_timeout: FLUSH_TIMEOUT,
        })
    }

    /// Bound on how long `close` waits for queued batches.
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }
}

impl ResultSink for KafkaSink {
    async fn store(&self, records: Vec<String>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let data = records.join("\n");
        let record = BaseRecord::<(), str>::to(&self.topic).payload(&data);

        match self.producer.send(record) {
            Ok(()) => debug!(records = records.len(), topic = %self.topic, "queued result batch"),
            Err((e, _)) => warn!(error = %e, topic = %self.topic, "dropping result batch"),
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.producer
            .flush(Timeout::After(self.flush_timeout))
            .context("flushing kafka result producer")
    }
}
