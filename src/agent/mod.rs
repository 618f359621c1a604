//! Agent role: consumes task messages for one node and executes them.

pub mod format;
pub mod handler;
pub mod identity;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::Metrics;
use crate::model::{DecodeError, DispatchMessage, TaskKind, TaskPayload};
use crate::transport::Subscriber;
use handler::TaskHandler;

/// Pause after a failed receive before polling again.
const RECV_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("no handler registered for task type {0}")]
    NoHandler(TaskKind),
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

/// What became of one inbound message. Every outcome is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Executed { records: usize },
    Failed,
    Skipped,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Executed { .. } => "executed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Routes task messages to the handler registered for their type.
pub struct Agent {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
    metrics: Arc<Metrics>,
}

impl Agent {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            handlers: HashMap::new(),
            metrics,
        }
    }

    /// Register `handler` for its task type, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        let kind = handler.kind();
        if self.handlers.insert(kind, handler).is_some() {
            warn!(task_type = %kind, "replaced task handler");
        }
    }

    /// Decode `params` for `task_name` and run the matching handler.
    pub async fn execute(
        &self,
        task_name: &str,
        metric_name: &str,
        params: &[Value],
    ) -> Result<usize, ExecuteError> {
        let kind = TaskKind::from_name(task_name)
            .ok_or_else(|| DecodeError::UnknownTaskType(task_name.to_string()))?;

        let handler = self
            .handlers
            .get(&kind)
            .ok_or(ExecuteError::NoHandler(kind))?;

        let payload = TaskPayload::decode(kind, params)?;

        Ok(handler.execute(metric_name, payload).await?)
    }

    /// Process one raw message. Never fails; problems are logged and
    /// reflected in the outcome.
    pub async fn handle_message(&self, raw: &[u8]) -> Outcome {
        let msg: DispatchMessage = match serde_json::from_slice(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, bytes = raw.len(), "discarding undecodable message");
                return Outcome::Skipped;
            }
        };

        let metric_name = msg.effective_metric_name();

        match self.execute(&msg.task_name, metric_name, &msg.params).await {
            Ok(records) => {
                info!(task = %msg.task_name, metric = %metric_name, records, "task executed");
                Outcome::Executed { records }
            }
            Err(
                e @ (ExecuteError::Decode(DecodeError::UnknownTaskType(_))
                | ExecuteError::NoHandler(_)),
            ) => {
                warn!(task = %msg.task_name, error = %e, "skipping message");
                Outcome::Skipped
            }
            Err(e) => {
                let err = format!("{e:#}");
                error!(
                    task = %msg.task_name,
                    metric = %metric_name,
                    error = %err,
                    "task execution failed",
                );
                Outcome::Failed
            }
        }
    }

    /// Consume until `cancel` fires or the subscription ends. Each delivery
    /// is acknowledged after it has been handled; cancellation does not
    /// interrupt a message already being handled.
    pub async fn run<S: Subscriber>(
        &self,
        subscriber: &mut S,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(handlers = self.handlers.len(), "agent consuming");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = subscriber.recv() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    let outcome = self.handle_message(&delivery.payload).await;
                    self.metrics
                        .messages
                        .with_label_values(&[outcome.label()])
                        .inc();

                    if let Err(e) = subscriber.ack(&delivery) {
                        warn!(error = %e, offset = delivery.offset, "acknowledging message failed");
                    }
                }
                Ok(None) => {
                    info!("subscription closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "receiving message failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECV_RETRY_DELAY) => {}
                    }
                }
            }
        }

        info!("agent stopped consuming");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::transport::memory::MemoryBroker;
    use crate::transport::Publisher;

    struct RecordingHandler {
        kind: TaskKind,
        calls: Mutex<Vec<(String, TaskPayload)>>,
        fail: bool,
    }

    impl RecordingHandler {
        fn new(kind: TaskKind, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                calls: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        fn kind(&self) -> TaskKind {
            self.kind
        }

        async fn execute(&self, metric_name: &str, payload: TaskPayload) -> Result<usize> {
            let n = payload.targets().len();
            self.calls.lock().push((metric_name.to_string(), payload));
            if self.fail {
                anyhow::bail!("sink unavailable");
            }
            Ok(n)
        }
    }

    fn agent_with(handler: Arc<RecordingHandler>) -> Agent {
        let mut agent = Agent::new(Arc::new(Metrics::new().expect("metrics")));
        agent.register(handler);
        agent
    }

    fn message(task: &str, metric: &str, params: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({"taskName": task, "metricName": metric, "params": params}))
            .expect("encode")
    }

    #[tokio::test]
    async fn test_executes_registered_handler() {
        let h = RecordingHandler::new(TaskKind::PingMesh, false);
        let agent = agent_with(Arc::clone(&h));

        let params = json!([{"ip": "10.0.0.1"}, {"ip": "10.0.0.2"}]);
        let outcome = agent.handle_message(&message("pingMesh", "mesh", params)).await;

        assert_eq!(outcome, Outcome::Executed { records: 2 });
        let calls = h.calls.lock();
        assert_eq!(calls[0].0, "mesh");
        assert_eq!(calls[0].1.targets().len(), 2);
    }

    #[tokio::test]
    async fn test_metric_name_defaults_to_task_name() {
        let h = RecordingHandler::new(TaskKind::GatewayPing, false);
        let agent = agent_with(Arc::clone(&h));

        let raw = serde_json::to_vec(&json!({"taskName": "gatewayPing", "params": ["192.168.0.1"]}))
            .expect("encode");
        assert_eq!(agent.handle_message(&raw).await, Outcome::Executed { records: 1 });
        assert_eq!(h.calls.lock()[0].0, "gatewayPing");
    }

    #[tokio::test]
    async fn test_undecodable_message_skipped() {
        let h = RecordingHandler::new(TaskKind::PingMesh, false);
        let agent = agent_with(Arc::clone(&h));

        assert_eq!(agent.handle_message(b"{not json").await, Outcome::Skipped);
        assert!(h.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_task_type_skipped() {
        let h = RecordingHandler::new(TaskKind::PingMesh, false);
        let agent = agent_with(Arc::clone(&h));

        let outcome = agent
            .handle_message(&message("traceroute", "tr", json!([{"ip": "10.0.0.1"}])))
            .await;
        assert_eq!(outcome, Outcome::Skipped);

        // Known type without a registered handler.
        let outcome = agent
            .handle_message(&message("gatewayPing", "gw", json!(["10.0.0.1"])))
            .await;
        assert_eq!(outcome, Outcome::Skipped);
        assert!(h.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_params_fail_without_executing() {
        let h = RecordingHandler::new(TaskKind::PingMesh, false);
        let agent = agent_with(Arc::clone(&h));

        let err = agent
            .execute("pingMesh", "mesh", &[json!({"ip": "10.0.0.1"}), json!(42)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecuteError::Decode(DecodeError::InvalidRecord { index: 1, .. })
        ));

        let outcome = agent
            .handle_message(&message("pingMesh", "mesh", json!([])))
            .await;
        assert_eq!(outcome, Outcome::Failed);
        assert!(h.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_is_failed_outcome() {
        let h = RecordingHandler::new(TaskKind::PingMesh, true);
        let agent = agent_with(Arc::clone(&h));

        let outcome = agent
            .handle_message(&message("pingMesh", "mesh", json!([{"ip": "10.0.0.1"}])))
            .await;
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(h.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_run_acks_every_message() {
        let h = RecordingHandler::new(TaskKind::PingMesh, false);
        let agent = agent_with(Arc::clone(&h));
        let broker = MemoryBroker::new();

        for raw in [
            message("pingMesh", "mesh", json!([{"ip": "10.0.0.1"}])),
            b"garbage".to_vec(),
            message("traceroute", "tr", json!([])),
            message("pingMesh", "mesh", json!([{"nodeName": "no-ip"}])),
        ] {
            broker.publish("bj01-task", &raw).await.expect("publish");
        }
        broker.close_topic("bj01-task");

        let mut sub = broker.subscribe("bj01-task").expect("subscribe");
        agent
            .run(&mut sub, CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(broker.acked("bj01-task"), 4);
        assert_eq!(h.calls.lock().len(), 1);

        let messages = &agent.metrics.messages;
        assert_eq!(messages.with_label_values(&["executed"]).get(), 1.0);
        assert_eq!(messages.with_label_values(&["skipped"]).get(), 2.0);
        assert_eq!(messages.with_label_values(&["failed"]).get(), 1.0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let agent = agent_with(RecordingHandler::new(TaskKind::PingMesh, false));
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("bj01-task").expect("subscribe");

        let cancel = CancellationToken::new();
        cancel.cancel();

        agent.run(&mut sub, cancel).await.expect("run");
        assert_eq!(broker.acked("bj01-task"), 0);
    }
}
