//! Controller role: task registry and per-task dispatchers.

pub mod api;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::Metrics;
use crate::model::{topic_for_node, DispatchMessage, InvalidTask, TaskDefinition};
use crate::transport::Publisher;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid task: {0}")]
    Invalid(#[from] InvalidTask),
    #[error("task {0:?} not found")]
    NotFound(String),
    #[error("registry is shut down")]
    ShutDown,
}

/// Owns task definitions and runs one dispatcher per definition.
///
/// Every dispatcher token is a child of the registry-wide shutdown token, so
/// cancelling either one stops it.
pub struct TaskRegistry<P: Publisher> {
    publisher: Arc<P>,
    metrics: Arc<Metrics>,
    state: RwLock<State>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct State {
    tasks: HashMap<String, TaskDefinition>,
    runners: HashMap<String, Runner>,
}

struct Runner {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl<P: Publisher> TaskRegistry<P> {
    pub fn new(publisher: Arc<P>, metrics: Arc<Metrics>) -> Self {
        Self {
            publisher,
            metrics,
            state: RwLock::new(State::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Store `task` and (re)start its dispatcher. A dispatcher already
    /// running under the same metric name is cancelled first.
    pub fn add_or_replace(&self, task: TaskDefinition) -> Result<(), RegistryError> {
        task.validate()?;

        if self.shutdown.is_cancelled() {
            return Err(RegistryError::ShutDown);
        }

        let key = task.metric_name.clone();
        let mut state = self.state.write();

        if let Some(old) = state.runners.remove(&key) {
            old.cancel.cancel();
            info!(task = %key, "replacing running task");
        }

        let runner = self.spawn_dispatcher(task.clone());
        state.runners.insert(key.clone(), runner);
        state.tasks.insert(key.clone(), task);
        self.metrics.tasks_running.set(state.runners.len() as f64);

        info!(task = %key, "task started");

        Ok(())
    }

    /// Store `task` without starting it; [`start_all`](Self::start_all)
    /// launches it later. A task that is already running is replaced.
    pub fn preload(&self, task: TaskDefinition) -> Result<(), RegistryError> {
        task.validate()?;

        let mut state = self.state.write();
        if state.runners.contains_key(&task.metric_name) {
            drop(state);
            return self.add_or_replace(task);
        }

        state.tasks.insert(task.metric_name.clone(), task);
        Ok(())
    }

    /// Cancel and forget the task stored under `metric_name`.
    pub fn remove(&self, metric_name: &str) -> Result<TaskDefinition, RegistryError> {
        let mut state = self.state.write();

        let task = state
            .tasks
            .remove(metric_name)
            .ok_or_else(|| RegistryError::NotFound(metric_name.to_string()))?;

        if let Some(runner) = state.runners.remove(metric_name) {
            runner.cancel.cancel();
        }
        self.metrics.tasks_running.set(state.runners.len() as f64);

        info!(task = %metric_name, "task removed");

        Ok(task)
    }

    /// Snapshot of all definitions, ordered by metric name.
    pub fn list(&self) -> Vec<TaskDefinition> {
        let mut tasks: Vec<_> = self.state.read().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.metric_name.cmp(&b.metric_name));
        tasks
    }

    pub fn get(&self, metric_name: &str) -> Option<TaskDefinition> {
        self.state.read().tasks.get(metric_name).cloned()
    }

    /// Number of live dispatchers.
    pub fn running(&self) -> usize {
        self.state
            .read()
            .runners
            .values()
            .filter(|r| !r.handle.is_finished())
            .count()
    }

    /// Start a dispatcher for every stored task that has none. Returns how
    /// many were started.
    pub fn start_all(&self) -> usize {
        if self.shutdown.is_cancelled() {
            return 0;
        }

        let mut state = self.state.write();

        let pending: Vec<TaskDefinition> = state
            .tasks
            .iter()
            .filter(|(key, _)| !state.runners.contains_key(*key))
            .map(|(_, task)| task.clone())
            .collect();

        for task in &pending {
            let runner = self.spawn_dispatcher(task.clone());
            state.runners.insert(task.metric_name.clone(), runner);
        }
        self.metrics.tasks_running.set(state.runners.len() as f64);

        if !pending.is_empty() {
            info!(count = pending.len(), "started tasks");
        }

        pending.len()
    }

    /// Stop every dispatcher, wait for them to exit, then close the
    /// publisher. Further adds are rejected.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();

        let runners: Vec<Runner> = {
            let mut state = self.state.write();
            state.runners.drain().map(|(_, r)| r).collect()
        };

        for runner in runners {
            if let Err(e) = runner.handle.await {
                warn!(error = %e, "dispatcher task failed");
            }
        }
        self.metrics.tasks_running.set(0.0);

        self.publisher.close().await?;

        info!("task registry stopped");

        Ok(())
    }

    fn spawn_dispatcher(&self, task: TaskDefinition) -> Runner {
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(run_dispatcher(
            task,
            Arc::clone(&self.publisher),
            Arc::clone(&self.metrics),
            cancel.clone(),
        ));

        Runner { cancel, handle }
    }
}

/// Publishes the task's message to every node: once immediately, then once
/// per interval until cancelled. Ticks never overlap.
async fn run_dispatcher<P: Publisher>(
    task: TaskDefinition,
    publisher: Arc<P>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    let payload = match serde_json::to_vec(&DispatchMessage::for_task(&task)) {
        Ok(payload) => payload,
        Err(e) => {
            error!(task = %task.metric_name, error = %e, "encoding dispatch message");
            return;
        }
    };

    let mut ticker = tokio::time::interval(task.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        dispatch(&task, &payload, publisher.as_ref(), &metrics, &cancel).await;
    }

    debug!(task = %task.metric_name, "dispatcher stopped");
}

async fn dispatch<P: Publisher>(
    task: &TaskDefinition,
    payload: &[u8],
    publisher: &P,
    metrics: &Metrics,
    cancel: &CancellationToken,
) {
    for node in &task.node_names {
        if cancel.is_cancelled() {
            return;
        }

        let topic = topic_for_node(node);
        match publisher.publish(&topic, payload).await {
            Ok(()) => {
                metrics
                    .dispatches
                    .with_label_values(&[task.metric_name.as_str()])
                    .inc();
            }
            Err(e) => {
                metrics
                    .publish_errors
                    .with_label_values(&[task.metric_name.as_str()])
                    .inc();
                warn!(
                    task = %task.metric_name,
                    node = %node,
                    error = %e,
                    "publishing task message failed",
                );
            }
        }
    }

    debug!(task = %task.metric_name, nodes = task.node_names.len(), "dispatched");
}
