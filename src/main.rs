use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use netdetect::agent::handler::PingHandler;
use netdetect::agent::identity::NodeIdentity;
use netdetect::agent::Agent;
use netdetect::config::{Config, Overrides};
use netdetect::controller::{api, TaskRegistry};
use netdetect::metrics::{self, Metrics};
use netdetect::model::{topic_for_node, TaskKind};
use netdetect::probe::IcmpProber;
use netdetect::sink::{ResultSink, Sink};
use netdetect::transport::memory::MemoryBroker;
use netdetect::transport::{Publisher, Subscriber};

/// Distributed network probe scheduler and agent.
#[derive(Parser)]
#[command(name = "netdetect", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error). Overrides
    /// `log_level` from the file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller: schedule tasks and serve the control API.
    Controller,
    /// Run an agent: consume this node's tasks and write results.
    Agent,
    /// Run controller and agent in one process over an in-memory broker.
    Standalone,
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("netdetect {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    cfg.apply(&cli.overrides);

    // Initialize tracing.
    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting netdetect",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        match cli.command {
            Command::Controller => run_controller(cfg).await,
            Command::Agent => run_agent(cfg).await,
            Command::Standalone => run_standalone(cfg).await,
            Command::Version => Ok(()),
        }
    })
}

#[cfg(feature = "kafka")]
async fn run_controller(cfg: Config) -> Result<()> {
    use netdetect::transport::kafka::KafkaPublisher;

    cfg.validate_controller()?;

    let metrics = Arc::new(Metrics::new().context("creating metrics")?);
    let publisher = Arc::new(KafkaPublisher::new(&cfg.transport)?);
    let cancel = CancellationToken::new();

    let registry = start_controller(&cfg, publisher, metrics, cancel.clone()).await?;

    shutdown_signal().await?;

    registry.shutdown().await?;
    cancel.cancel();

    tracing::info!("controller stopped");

    Ok(())
}

#[cfg(not(feature = "kafka"))]
async fn run_controller(_cfg: Config) -> Result<()> {
    anyhow::bail!(
        "the controller needs the `kafka` feature; use `standalone` for a single-process setup"
    )
}

#[cfg(feature = "kafka")]
async fn run_agent(cfg: Config) -> Result<()> {
    use netdetect::model::group_for_node;
    use netdetect::transport::kafka::KafkaSubscriber;

    cfg.validate_agent()?;

    let identity = NodeIdentity::resolve(&cfg).context("resolving node identity")?;
    let topic = non_empty_or(&cfg.transport.topic, || topic_for_node(&identity.node_name));
    let group = non_empty_or(&cfg.transport.group, || group_for_node(&identity.node_name));

    let metrics = Arc::new(Metrics::new().context("creating metrics")?);
    let sink = Arc::new(Sink::from_config(&cfg.sink, &cfg.transport.brokers)?);
    let agent = build_agent(&cfg, identity, Arc::clone(&sink), Arc::clone(&metrics))?;
    let subscriber = KafkaSubscriber::new(&cfg.transport, &group, &topic)?;

    tracing::info!(topic = %topic, group = %group, sink = sink.name(), "agent configured");

    run_consumer(&cfg, agent, subscriber, sink, metrics).await
}

#[cfg(not(feature = "kafka"))]
async fn run_agent(_cfg: Config) -> Result<()> {
    anyhow::bail!(
        "the agent needs the `kafka` feature; use `standalone` for a single-process setup"
    )
}

/// Controller and a single local agent sharing an in-memory broker. Only
/// tasks that list this node are executed.
async fn run_standalone(cfg: Config) -> Result<()> {
    cfg.validate_controller()?;
    cfg.validate_agent()?;

    let identity = NodeIdentity::resolve(&cfg).context("resolving node identity")?;
    let topic = topic_for_node(&identity.node_name);

    let metrics = Arc::new(Metrics::new().context("creating metrics")?);
    let broker = MemoryBroker::strict();
    let subscriber = broker.subscribe(&topic)?;

    let cancel = CancellationToken::new();
    let registry =
        start_controller(&cfg, Arc::new(broker), Arc::clone(&metrics), cancel.clone()).await?;

    let sink = Arc::new(Sink::from_config(&cfg.sink, &cfg.transport.brokers)?);
    let agent = build_agent(&cfg, identity, Arc::clone(&sink), Arc::clone(&metrics))?;

    tracing::info!(topic = %topic, sink = sink.name(), "standalone mode");

    let result = run_consumer(&cfg, agent, subscriber, sink, metrics).await;

    registry.shutdown().await?;
    cancel.cancel();

    result
}

/// Loads the configured tasks, starts their dispatchers and serves the
/// control API until `cancel` fires.
async fn start_controller<P: Publisher>(
    cfg: &Config,
    publisher: Arc<P>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> Result<Arc<TaskRegistry<P>>> {
    let registry = Arc::new(TaskRegistry::new(publisher, Arc::clone(&metrics)));

    for task in &cfg.controller.tasks {
        registry
            .preload(task.clone())
            .with_context(|| format!("loading task {}", task.metric_name))?;
    }
    registry.start_all();

    let app = api::router(Arc::clone(&registry)).merge(metrics.router());
    metrics::serve(&cfg.controller.listen_addr, app, cancel)
        .await
        .context("starting control API")?;

    Ok(registry)
}

fn build_agent<S: ResultSink>(
    cfg: &Config,
    identity: NodeIdentity,
    sink: Arc<S>,
    metrics: Arc<Metrics>,
) -> Result<Agent> {
    let prober = Arc::new(IcmpProber::new(&cfg.probe).context("creating ICMP prober")?);

    let mut agent = Agent::new(Arc::clone(&metrics));
    for kind in TaskKind::ALL {
        agent.register(Arc::new(PingHandler::new(
            kind,
            Arc::clone(&prober),
            Arc::clone(&sink),
            identity.clone(),
            cfg.probe.max_concurrency,
            Arc::clone(&metrics),
        )));
    }

    Ok(agent)
}

/// Serves health metrics and consumes until a shutdown signal, then drains
/// the consumer and closes the sink.
async fn run_consumer<Sub, S>(
    cfg: &Config,
    agent: Agent,
    mut subscriber: Sub,
    sink: Arc<S>,
    metrics: Arc<Metrics>,
) -> Result<()>
where
    Sub: Subscriber + 'static,
    S: ResultSink,
{
    let cancel = CancellationToken::new();

    metrics::serve(&cfg.health.addr, metrics.router(), cancel.clone())
        .await
        .context("starting health metrics server")?;

    let consume_cancel = cancel.clone();
    let consumer = tokio::spawn(async move { agent.run(&mut subscriber, consume_cancel).await });

    shutdown_signal().await?;
    cancel.cancel();

    consumer.await.context("joining consumer task")??;
    sink.close().await.context("closing sink")?;

    tracing::info!("agent stopped");

    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}

#[cfg(feature = "kafka")]
fn non_empty_or(value: &str, fallback: impl FnOnce() -> String) -> String {
    if value.is_empty() {
        fallback()
    } else {
        value.to_string()
    }
}
