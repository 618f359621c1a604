use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::format::format_lines;
use super::identity::NodeIdentity;
use crate::metrics::Metrics;
use crate::model::{Measurement, PingTarget, TaskKind, TaskPayload};
use crate::probe::Prober;
use crate::sink::ResultSink;

/// Executes one decoded task message.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Task type this handler serves.
    fn kind(&self) -> TaskKind;

    /// Run the task and store its results. Returns the number of records
    /// stored.
    async fn execute(&self, metric_name: &str, payload: TaskPayload) -> Result<usize>;
}

/// Probes every target concurrently and stores one line per target.
pub struct PingHandler<P, S> {
    kind: TaskKind,
    prober: Arc<P>,
    sink: Arc<S>,
    source: NodeIdentity,
    limit: Option<Arc<Semaphore>>,
    metrics: Arc<Metrics>,
}

impl<P: Prober, S: ResultSink> PingHandler<P, S> {
    /// `max_concurrency` of 0 leaves the fan-out unbounded.
    pub fn new(
        kind: TaskKind,
        prober: Arc<P>,
        sink: Arc<S>,
        source: NodeIdentity,
        max_concurrency: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let limit = (max_concurrency > 0).then(|| Arc::new(Semaphore::new(max_concurrency)));

        Self {
            kind,
            prober,
            sink,
            source,
            limit,
            metrics,
        }
    }

    /// Probe all targets and wait for every result. Output order matches
    /// input order; a probe task that dies yields a failed measurement.
    pub async fn probe_all(&self, targets: Vec<PingTarget>) -> Vec<Measurement> {
        let mut set = JoinSet::new();

        for (idx, target) in targets.iter().cloned().enumerate() {
            let prober = Arc::clone(&self.prober);
            let limit = self.limit.clone();

            set.spawn(async move {
                let _permit = match limit {
                    Some(sem) => sem.acquire_owned().await.ok(),
                    None => None,
                };
                (idx, prober.probe(&target).await)
            });
        }

        let mut slots: Vec<Option<Measurement>> = vec![None; targets.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, m)) => {
                    if let Some(slot) = slots.get_mut(idx) {
                        *slot = Some(m);
                    }
                }
                Err(e) => warn!(error = %e, "probe task failed"),
            }
        }

        slots
            .into_iter()
            .zip(targets)
            .map(|(slot, target)| {
                slot.unwrap_or_else(|| Measurement::failed(target, "probe task aborted"))
            })
            .collect()
    }
}

#[async_trait]
impl<P: Prober, S: ResultSink> TaskHandler for PingHandler<P, S> {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    async fn execute(&self, metric_name: &str, payload: TaskPayload) -> Result<usize> {
        let measurements = self.probe_all(payload.into_targets()).await;

        for m in &measurements {
            let result = if m.error.is_some() { "error" } else { "ok" };
            self.metrics.probes.with_label_values(&[result]).inc();
        }

        let lines = format_lines(metric_name, &self.source, &measurements);
        let count = lines.len();

        if let Err(e) = self.sink.store(lines).await {
            self.metrics.sink_errors.inc();
            return Err(e).context("storing results");
        }
        self.metrics.records_stored.inc_by(count as f64);

        debug!(metric = %metric_name, records = count, "stored results");

        Ok(count)
    }
}
