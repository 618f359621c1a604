use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::model::TaskDefinition;

/// Top-level configuration shared by the controller and agent roles.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Node this agent serves. Derived from the hostname when empty.
    #[serde(default)]
    pub node_name: String,

    /// Regex applied to the hostname to derive the node name. The first
    /// capture group is used. Default: "cdn([^-]*)".
    #[serde(default = "default_node_name_pattern")]
    pub node_name_pattern: String,

    /// Pub/sub transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Result sink configuration.
    #[serde(default)]
    pub sink: SinkConfig,

    /// ICMP probe configuration.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Controller role configuration.
    #[serde(default)]
    pub controller: ControllerConfig,
}

/// Pub/sub transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Broker addresses. Default: ["localhost:9092"].
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,

    /// Agent consumer group. Default: "<node>-agent".
    #[serde(default)]
    pub group: String,

    /// Agent topic. Default: "<node>-task".
    #[serde(default)]
    pub topic: String,

    /// Consumer session timeout. Default: 20s.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Consumer heartbeat interval. Default: 6s.
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Maximum time a publish may wait for broker acknowledgement. Default: 5s.
    #[serde(default = "default_produce_timeout", with = "humantime_serde")]
    pub produce_timeout: Duration,
}

/// Result sink backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Relay formatted lines to a Kafka topic.
    Kafka,
    /// Write lines to the VictoriaMetrics influx endpoint.
    #[value(name = "victoriametrics")]
    VictoriaMetrics,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kafka => f.write_str("kafka"),
            Self::VictoriaMetrics => f.write_str("victoriametrics"),
        }
    }
}

/// Result sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Backend to use. Default: victoriametrics.
    #[serde(rename = "type", default = "default_sink_kind")]
    pub kind: SinkKind,

    /// Kafka relay settings.
    #[serde(default)]
    pub kafka: KafkaSinkConfig,

    /// VictoriaMetrics settings.
    #[serde(default)]
    pub victoriametrics: VictoriaMetricsConfig,
}

/// Kafka relay sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaSinkConfig {
    /// Topic receiving result batches. Default: "net_detect_result".
    #[serde(default = "default_result_topic")]
    pub topic: String,

    /// Producer compression codec. Default: "snappy".
    #[serde(default = "default_kafka_compression")]
    pub compression: String,
}

/// VictoriaMetrics HTTP write configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct VictoriaMetricsConfig {
    /// Base URL (e.g., "http://localhost:8428").
    #[serde(default = "default_vm_address")]
    pub address: String,

    /// Basic auth username, sent with every write even when empty.
    /// Default: "net_detect".
    #[serde(default = "default_vm_username")]
    pub username: String,

    /// Basic auth password.
    #[serde(default)]
    pub password: String,

    /// Per-request timeout. Default: 10s.
    #[serde(default = "default_vm_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Total attempts per batch on transport failure. Default: 3.
    #[serde(default = "default_vm_max_retries")]
    pub max_retries: u32,

    /// Request body compression: "none" or "gzip". Default: "none".
    #[serde(default = "default_vm_compression")]
    pub compression: String,
}

/// ICMP probe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Echo requests per target. Default: 10.
    #[serde(default = "default_probe_count")]
    pub count: u16,

    /// Spacing between echo requests. Default: 100ms.
    #[serde(default = "default_probe_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Overall deadline for one target. Default: 1s.
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Maximum concurrent probes per execution. 0 means unbounded.
    #[serde(default)]
    pub max_concurrency: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address (e.g., ":9090").
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Controller role configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Control API listen address. Default: ":8088".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Tasks registered at startup.
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

/// Command-line overrides. Any flag that is set wins over the file.
#[derive(Debug, Default, Clone, clap::Args)]
pub struct Overrides {
    /// Comma-separated broker list.
    #[arg(long, value_delimiter = ',', global = true)]
    pub brokers: Vec<String>,

    /// Agent consumer group.
    #[arg(long, global = true)]
    pub group: Option<String>,

    /// Agent topic.
    #[arg(long, global = true)]
    pub topic: Option<String>,

    /// Node name (skips hostname derivation).
    #[arg(long, global = true)]
    pub node_name: Option<String>,

    /// Result sink backend.
    #[arg(long, value_enum, global = true)]
    pub storage: Option<SinkKind>,

    /// VictoriaMetrics base URL.
    #[arg(long, global = true)]
    pub vm_address: Option<String>,

    /// VictoriaMetrics basic auth username.
    #[arg(long, global = true)]
    pub vm_username: Option<String>,

    /// VictoriaMetrics basic auth password.
    #[arg(long, global = true)]
    pub vm_password: Option<String>,

    /// VictoriaMetrics request timeout (e.g., "10s").
    #[arg(long, value_parser = humantime::parse_duration, global = true)]
    pub vm_timeout: Option<Duration>,

    /// VictoriaMetrics total attempts per batch.
    #[arg(long, global = true)]
    pub vm_max_retries: Option<u32>,

    /// Echo requests per target.
    #[arg(long, global = true)]
    pub ping_count: Option<u16>,

    /// Spacing between echo requests (e.g., "100ms").
    #[arg(long, value_parser = humantime::parse_duration, global = true)]
    pub ping_interval: Option<Duration>,

    /// Overall probe deadline per target (e.g., "1s").
    #[arg(long, value_parser = humantime::parse_duration, global = true)]
    pub ping_timeout: Option<Duration>,

    /// Control API listen address.
    #[arg(long, global = true)]
    pub listen_addr: Option<String>,

    /// Health metrics listen address.
    #[arg(long, global = true)]
    pub health_addr: Option<String>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_node_name_pattern() -> String {
    "cdn([^-]*)".to_string()
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(6)
}

fn default_produce_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_sink_kind() -> SinkKind {
    SinkKind::VictoriaMetrics
}

fn default_result_topic() -> String {
    "net_detect_result".to_string()
}

fn default_kafka_compression() -> String {
    "snappy".to_string()
}

fn default_vm_address() -> String {
    "http://localhost:8428".to_string()
}

fn default_vm_username() -> String {
    "net_detect".to_string()
}

fn default_vm_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_vm_max_retries() -> u32 {
    3
}

fn default_vm_compression() -> String {
    "none".to_string()
}

fn default_probe_count() -> u16 {
    10
}

fn default_probe_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_listen_addr() -> String {
    ":8088".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            node_name: String::new(),
            node_name_pattern: default_node_name_pattern(),
            transport: TransportConfig::default(),
            sink: SinkConfig::default(),
            probe: ProbeConfig::default(),
            health: HealthConfig::default(),
            controller: ControllerConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            group: String::new(),
            topic: String::new(),
            session_timeout: default_session_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            produce_timeout: default_produce_timeout(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: default_sink_kind(),
            kafka: KafkaSinkConfig::default(),
            victoriametrics: VictoriaMetricsConfig::default(),
        }
    }
}

impl Default for KafkaSinkConfig {
    fn default() -> Self {
        Self {
            topic: default_result_topic(),
            compression: default_kafka_compression(),
        }
    }
}

impl Default for VictoriaMetricsConfig {
    fn default() -> Self {
        Self {
            address: default_vm_address(),
            username: default_vm_username(),
            password: String::new(),
            timeout: default_vm_timeout(),
            max_retries: default_vm_max_retries(),
            compression: default_vm_compression(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            count: default_probe_count(),
            interval: default_probe_interval(),
            timeout: default_probe_timeout(),
            max_concurrency: 0,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            tasks: Vec::new(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file. Validation is role specific and
    /// runs after command-line overrides are applied.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        // An empty document means "all defaults".
        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(data).context("decoding YAML")
    }

    /// Apply command-line overrides on top of file values.
    pub fn apply(&mut self, o: &Overrides) {
        if !o.brokers.is_empty() {
            self.transport.brokers = o.brokers.clone();
        }
        if let Some(group) = &o.group {
            self.transport.group = group.clone();
        }
        if let Some(topic) = &o.topic {
            self.transport.topic = topic.clone();
        }
        if let Some(node_name) = &o.node_name {
            self.node_name = node_name.clone();
        }
        if let Some(kind) = o.storage {
            self.sink.kind = kind;
        }

        let vm = &mut self.sink.victoriametrics;
        if let Some(address) = &o.vm_address {
            vm.address = address.clone();
        }
        if let Some(username) = &o.vm_username {
            vm.username = username.clone();
        }
        if let Some(password) = &o.vm_password {
            vm.password = password.clone();
        }
        if let Some(timeout) = o.vm_timeout {
            vm.timeout = timeout;
        }
        if let Some(retries) = o.vm_max_retries {
            vm.max_retries = retries;
        }

        if let Some(count) = o.ping_count {
            self.probe.count = count;
        }
        if let Some(interval) = o.ping_interval {
            self.probe.interval = interval;
        }
        if let Some(timeout) = o.ping_timeout {
            self.probe.timeout = timeout;
        }

        if let Some(addr) = &o.listen_addr {
            self.controller.listen_addr = addr.clone();
        }
        if let Some(addr) = &o.health_addr {
            self.health.addr = addr.clone();
        }
    }

    /// Validate the settings the agent role depends on.
    pub fn validate_agent(&self) -> Result<()> {
        self.validate_transport()?;

        if self.node_name.is_empty() {
            regex::Regex::new(&self.node_name_pattern).with_context(|| {
                format!("node_name_pattern {:?} is not a valid regex", self.node_name_pattern)
            })?;
        }

        if self.probe.count == 0 {
            bail!("probe.count must be positive");
        }
        if self.probe.timeout.is_zero() {
            bail!("probe.timeout must be positive");
        }

        match self.sink.kind {
            SinkKind::Kafka => {
                if self.sink.kafka.topic.is_empty() {
                    bail!("sink.kafka.topic is required");
                }
            }
            SinkKind::VictoriaMetrics => {
                let vm = &self.sink.victoriametrics;
                if vm.address.is_empty() {
                    bail!("sink.victoriametrics.address is required");
                }
                reqwest::Url::parse(&vm.address).with_context(|| {
                    format!("sink.victoriametrics.address {:?} is not a valid URL", vm.address)
                })?;
                if vm.timeout.is_zero() {
                    bail!("sink.victoriametrics.timeout must be positive");
                }
                if vm.max_retries == 0 {
                    bail!("sink.victoriametrics.max_retries must be at least 1");
                }
                match vm.compression.as_str() {
                    "" | "none" | "gzip" => {}
                    other => bail!("sink.victoriametrics.compression {other:?} is not supported"),
                }
            }
        }

        Ok(())
    }

    /// Validate the settings the controller role depends on.
    pub fn validate_controller(&self) -> Result<()> {
        self.validate_transport()?;

        if self.controller.listen_addr.is_empty() {
            bail!("controller.listen_addr is required");
        }

        for task in &self.controller.tasks {
            task.validate()
                .with_context(|| format!("controller.tasks entry {:?}", task.metric_name))?;
        }

        Ok(())
    }

    fn validate_transport(&self) -> Result<()> {
        if self.transport.brokers.is_empty() {
            bail!("transport.brokers is required");
        }
        if self.transport.brokers.iter().any(|b| b.trim().is_empty()) {
            bail!("transport.brokers must not contain empty entries");
        }

        Ok(())
    }
}
