//! Result sinks for formatted measurement lines.

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod victoriametrics;

use std::future::Future;

use anyhow::Result;

use crate::config::{SinkConfig, SinkKind};

/// Accepts batches of line-protocol records.
pub trait ResultSink: Send + Sync + 'static {
    /// Store one batch. Each call may be a single backend write.
    fn store(&self, records: Vec<String>) -> impl Future<Output = Result<()>> + Send;

    /// Flush and release backend resources.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// The configured sink backend.
pub enum Sink {
    #[cfg(feature = "kafka")]
    Kafka(kafka::KafkaSink),
    VictoriaMetrics(victoriametrics::VictoriaMetricsSink),
}

impl Sink {
    /// Build the backend selected by `cfg.kind`.
    pub fn from_config(cfg: &SinkConfig, brokers: &[String]) -> Result<Self> {
        match cfg.kind {
            #[cfg(feature = "kafka")]
            SinkKind::Kafka => Ok(Self::Kafka(kafka::KafkaSink::new(&cfg.kafka, brokers)?)),
            #[cfg(not(feature = "kafka"))]
            SinkKind::Kafka => {
                let _ = brokers;
                anyhow::bail!("sink type kafka requires building with the `kafka` feature")
            }
            SinkKind::VictoriaMetrics => Ok(Self::VictoriaMetrics(
                victoriametrics::VictoriaMetricsSink::new(&cfg.victoriametrics)?,
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(feature = "kafka")]
            Self::Kafka(_) => "kafka",
            Self::VictoriaMetrics(_) => "victoriametrics",
        }
    }
}

impl ResultSink for Sink {
    async fn store(&self, records: Vec<String>) -> Result<()> {
        match self {
            #[cfg(feature = "kafka")]
            Self::Kafka(s) => s.store(records).await,
            Self::VictoriaMetrics(s) => s.store(records).await,
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            #[cfg(feature = "kafka")]
            Self::Kafka(s) => s.close().await,
            Self::VictoriaMetrics(s) => s.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_defaults_to_victoriametrics() {
        let sink = Sink::from_config(&SinkConfig::default(), &[]).expect("sink");
        assert_eq!(sink.name(), "victoriametrics");
    }

    #[cfg(not(feature = "kafka"))]
    #[test]
    fn test_kafka_requires_feature() {
        let cfg = SinkConfig {
            kind: SinkKind::Kafka,
            ..Default::default()
        };
        let err = Sink::from_config(&cfg, &[]).err().expect("error");
        assert!(err.to_string().contains("kafka"));
    }
}
