use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::config::Config;

/// Names identifying the probing side of every result line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_name: String,
    pub host_name: String,
}

impl NodeIdentity {
    /// Uses the configured node name, or derives one from the hostname.
    pub fn resolve(cfg: &Config) -> Result<Self> {
        let host_name = gethostname::gethostname()
            .into_string()
            .map_err(|raw| anyhow::anyhow!("hostname {raw:?} is not valid UTF-8"))?;

        let node_name = if cfg.node_name.is_empty() {
            derive_node_name(&host_name, &cfg.node_name_pattern)?
        } else {
            cfg.node_name.clone()
        };

        Ok(Self {
            node_name,
            host_name,
        })
    }
}

/// First capture group of `pattern` matched against `host_name`, or the whole
/// match when the pattern has no groups.
pub fn derive_node_name(host_name: &str, pattern: &str) -> Result<String> {
    let re = Regex::new(pattern)
        .with_context(|| format!("compiling node name pattern {pattern:?}"))?;

    let Some(caps) = re.captures(host_name) else {
        bail!("hostname {host_name:?} does not match node name pattern {pattern:?}");
    };

    let name = caps
        .get(1)
        .or_else(|| caps.get(0))
        .map(|m| m.as_str())
        .unwrap_or_default();

    if name.is_empty() {
        bail!("node name derived from hostname {host_name:?} is empty");
    }

    Ok(name.to_string())
}
