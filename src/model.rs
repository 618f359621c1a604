//! Task definitions, wire messages and probe results.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Topic an agent for `node` consumes from.
pub fn topic_for_node(node: &str) -> String {
    format!("{node}-task")
}

/// Default consumer group for the agent serving `node`.
pub fn group_for_node(node: &str) -> String {
    format!("{node}-agent")
}

/// A recurring probe job managed by the controller, keyed by `metric_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// Task type name sent to agents (e.g. "pingMesh").
    pub name: String,

    /// Registry key and the measurement name written by agents.
    #[serde(default)]
    pub metric_name: String,

    /// Nodes receiving a message on every tick.
    #[serde(default)]
    pub node_names: Vec<String>,

    /// Opaque parameter records forwarded verbatim.
    #[serde(default)]
    pub params: Vec<Value>,

    /// Dispatch period. Accepts "30s" style strings or integer nanoseconds.
    #[serde(with = "interval")]
    pub interval: Duration,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Structural problems with a [`TaskDefinition`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidTask {
    #[error("metricName is required")]
    MissingMetricName,
    #[error("interval must be positive")]
    ZeroInterval,
}

impl TaskDefinition {
    pub fn validate(&self) -> Result<(), InvalidTask> {
        if self.metric_name.is_empty() {
            return Err(InvalidTask::MissingMetricName);
        }
        if self.interval.is_zero() {
            return Err(InvalidTask::ZeroInterval);
        }
        Ok(())
    }
}

mod interval {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Nanos(u64),
            Text(String),
        }

        match Raw::deserialize(d)? {
            Raw::Nanos(n) => Ok(Duration::from_nanos(n)),
            Raw::Text(s) => humantime::parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// Message published to a node's topic once per tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMessage {
    pub task_name: String,
    #[serde(default)]
    pub metric_name: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl DispatchMessage {
    pub fn for_task(task: &TaskDefinition) -> Self {
        Self {
            task_name: task.name.clone(),
            metric_name: task.metric_name.clone(),
            params: task.params.clone(),
        }
    }

    /// Measurement name to write, falling back to the task name.
    pub fn effective_metric_name(&self) -> &str {
        if self.metric_name.is_empty() {
            &self.task_name
        } else {
            &self.metric_name
        }
    }
}

/// Task types an agent knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Full mesh ping between nodes; params are target objects.
    PingMesh,
    /// Reachability of gateways; params are bare IPs or target objects.
    GatewayPing,
}

impl TaskKind {
    pub const ALL: [TaskKind; 2] = [TaskKind::PingMesh, TaskKind::GatewayPing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PingMesh => "pingMesh",
            Self::GatewayPing => "gatewayPing",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single host to probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingTarget {
    #[serde(default, alias = "target")]
    pub ip: String,
    #[serde(default, alias = "targetNode")]
    pub node_name: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl PingTarget {
    pub fn from_ip(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ..Default::default()
        }
    }
}

/// Why a message's parameters were rejected.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown task type {0:?}")]
    UnknownTaskType(String),
    #[error("param {index}: {source}")]
    InvalidRecord {
        index: usize,
        source: serde_json::Error,
    },
    #[error("param {index}: ip is required")]
    MissingAddress { index: usize },
    #[error("no valid targets")]
    NoTargets,
}

/// Parameters decoded for a specific task type.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPayload {
    PingMesh(Vec<PingTarget>),
    GatewayPing(Vec<PingTarget>),
}

impl TaskPayload {
    /// Decode `params` for `kind`. Fails closed: one bad record rejects the
    /// whole message.
    pub fn decode(kind: TaskKind, params: &[Value]) -> Result<Self, DecodeError> {
        let mut targets = Vec::with_capacity(params.len());

        for (index, param) in params.iter().enumerate() {
            let target = match (kind, param) {
                (TaskKind::GatewayPing, Value::String(ip)) => PingTarget::from_ip(ip.clone()),
                _ => PingTarget::deserialize(param)
                    .map_err(|source| DecodeError::InvalidRecord { index, source })?,
            };

            if target.ip.trim().is_empty() {
                return Err(DecodeError::MissingAddress { index });
            }

            targets.push(target);
        }

        if targets.is_empty() {
            return Err(DecodeError::NoTargets);
        }

        Ok(match kind {
            TaskKind::PingMesh => Self::PingMesh(targets),
            TaskKind::GatewayPing => Self::GatewayPing(targets),
        })
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            Self::PingMesh(_) => TaskKind::PingMesh,
            Self::GatewayPing(_) => TaskKind::GatewayPing,
        }
    }

    pub fn targets(&self) -> &[PingTarget] {
        match self {
            Self::PingMesh(t) | Self::GatewayPing(t) => t,
        }
    }

    pub fn into_targets(self) -> Vec<PingTarget> {
        match self {
            Self::PingMesh(t) | Self::GatewayPing(t) => t,
        }
    }
}

/// Address family of a probed target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
    Unknown,
}

impl From<IpAddr> for IpVersion {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

impl IpVersion {
    /// Family of a textual address; host names are `Unknown`.
    pub fn of(addr: &str) -> Self {
        addr.parse::<IpAddr>().map_or(Self::Unknown, Self::from)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V4 => "IPv4",
            Self::V6 => "IPv6",
            Self::Unknown => "Unknown",
        }
    }
}

/// Result of probing one target. RTT values are milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub target: PingTarget,
    pub source_ip: String,
    pub ip_version: IpVersion,
    pub packets_sent: u32,
    pub packets_recv: u32,
    pub rtt_min: f64,
    pub rtt_max: f64,
    pub rtt_avg: f64,
    pub rtt_std_dev: f64,
    pub error: Option<String>,
    pub timestamp: SystemTime,
}

impl Measurement {
    /// A measurement for a probe that could not run at all.
    pub fn failed(target: PingTarget, error: impl Into<String>) -> Self {
        let ip_version = IpVersion::of(&target.ip);
        Self {
            target,
            source_ip: String::new(),
            ip_version,
            packets_sent: 0,
            packets_recv: 0,
            rtt_min: 0.0,
            rtt_max: 0.0,
            rtt_avg: 0.0,
            rtt_std_dev: 0.0,
            error: Some(error.into()),
            timestamp: SystemTime::now(),
        }
    }

    pub fn packets_lost(&self) -> u32 {
        self.packets_sent.saturating_sub(self.packets_recv)
    }
}
