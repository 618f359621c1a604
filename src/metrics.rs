use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "netdetect";

/// Prometheus metrics shared by the controller and agent roles.
///
/// All metrics use the "netdetect" namespace. Each role only touches the
/// series it owns; the rest stay at zero.
pub struct Metrics {
    registry: Registry,

    // === Controller ===
    /// Messages published per task.
    pub dispatches: CounterVec,
    /// Failed per-node publishes per task.
    pub publish_errors: CounterVec,
    /// Dispatchers currently running.
    pub tasks_running: Gauge,

    // === Agent ===
    /// Inbound messages by outcome (executed/failed/skipped).
    pub messages: CounterVec,
    /// Probes by result (ok/error).
    pub probes: CounterVec,
    /// Result lines handed to the sink.
    pub records_stored: Counter,
    /// Batches the sink failed to store.
    pub sink_errors: Counter,
}

impl Metrics {
    /// Creates a metrics instance with every series registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let dispatches = CounterVec::new(
            Opts::new("dispatches_total", "Messages published per task.").namespace(NAMESPACE),
            &["task"],
        )?;
        let publish_errors = CounterVec::new(
            Opts::new(
                "publish_errors_total",
                "Per-node publish failures per task.",
            )
            .namespace(NAMESPACE),
            &["task"],
        )?;
        let tasks_running = Gauge::with_opts(
            Opts::new("tasks_running", "Number of running task dispatchers.").namespace(NAMESPACE),
        )?;
        let messages = CounterVec::new(
            Opts::new(
                "agent_messages_total",
                "Inbound task messages by outcome.",
            )
            .namespace(NAMESPACE),
            &["outcome"],
        )?;
        let probes = CounterVec::new(
            Opts::new("probes_total", "Probes executed by result.").namespace(NAMESPACE),
            &["result"],
        )?;
        let records_stored = Counter::with_opts(
            Opts::new(
                "records_stored_total",
                "Result lines handed to the sink.",
            )
            .namespace(NAMESPACE),
        )?;
        let sink_errors = Counter::with_opts(
            Opts::new("sink_errors_total", "Result batches the sink failed to store.")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(dispatches.clone()))?;
        registry.register(Box::new(publish_errors.clone()))?;
        registry.register(Box::new(tasks_running.clone()))?;
        registry.register(Box::new(messages.clone()))?;
        registry.register(Box::new(probes.clone()))?;
        registry.register(Box::new(records_stored.clone()))?;
        registry.register(Box::new(sink_errors.clone()))?;

        Ok(Self {
            registry,
            dispatches,
            publish_errors,
            tasks_running,
            messages,
            probes,
            records_stored,
            sink_errors,
        })
    }

    /// Router serving `/metrics` and `/healthz`.
    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(state)
    }

    /// Current metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }
}

/// Binds `addr` and serves `app` until `cancel` fires. Returns the bound
/// address once the listener is up.
pub async fn serve(addr: &str, app: Router, cancel: CancellationToken) -> Result<SocketAddr> {
    let bind_addr = bind_addr(addr);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("listening on {bind_addr}"))?;

    let local_addr = listener.local_addr().context("getting local address")?;

    tokio::spawn(async move {
        tracing::info!(addr = %local_addr, "http server started");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "http server error");
        }
    });

    Ok(local_addr)
}

/// Expands the ":port" shorthand to all interfaces.
fn bind_addr(addr: &str) -> String {
    if addr.is_empty() {
        "0.0.0.0:9090".to_string()
    } else if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
