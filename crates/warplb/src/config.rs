//! Load-balancer configuration (`warplb.toml`).
//!
//! ```toml
//! [reconciler]
//! retry_backoff_min = "50ms"
//! retry_backoff_max = "1m"
//! prune_interval = "5m"
//! map_timeout = "1s"
//!
//! [loadbalancer]
//! enable_session_affinity = true
//! node_port_min = 30000
//! node_port_max = 32767
//! node_name = "node-1"
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::types::TrafficPolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbConfig {
    pub reconciler: ReconcilerConfig,
    pub loadbalancer: LoadBalancerConfig,
}

/// Retry, prune and map-call timing. Durations are strings such as
/// `"10ms"`, `"5s"` or `"1m"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub retry_backoff_min: String,
    pub retry_backoff_max: String,
    pub prune_interval: String,
    pub map_timeout: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retry_backoff_min: "50ms".to_string(),
            retry_backoff_max: "1m".to_string(),
            prune_interval: "5m".to_string(),
            map_timeout: "1s".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub enable_session_affinity: bool,
    pub node_port_min: u16,
    pub node_port_max: u16,
    /// Size of the service (and reverse NAT) ID space.
    pub max_services: u32,
    /// Size of the backend ID space.
    pub max_backends: u32,
    pub ext_traffic_policy: TrafficPolicy,
    pub int_traffic_policy: TrafficPolicy,
    /// This node, for `Local` traffic policy.
    pub node_name: String,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            enable_session_affinity: true,
            node_port_min: 30000,
            node_port_max: 32767,
            max_services: 65535,
            max_backends: 65535,
            ext_traffic_policy: TrafficPolicy::Cluster,
            int_traffic_policy: TrafficPolicy::Cluster,
            node_name: String::new(),
        }
    }
}

impl LbConfig {
    /// Load and validate a TOML config file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: LbConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let r = &self.reconciler;
        let min = require_duration("retry_backoff_min", &r.retry_backoff_min)?;
        let max = require_duration("retry_backoff_max", &r.retry_backoff_max)?;
        if min > max {
            bail!("retry_backoff_min ({min:?}) exceeds retry_backoff_max ({max:?})");
        }
        require_duration("prune_interval", &r.prune_interval)?;
        if require_duration("map_timeout", &r.map_timeout)?.is_zero() {
            bail!("map_timeout must be non-zero");
        }

        let lb = &self.loadbalancer;
        if lb.node_port_min > lb.node_port_max {
            bail!(
                "node_port_min ({}) exceeds node_port_max ({})",
                lb.node_port_min,
                lb.node_port_max
            );
        }
        // Service IDs double as reverse NAT IDs, which are 16 bits wide.
        if lb.max_services == 0 || lb.max_services > u32::from(u16::MAX) {
            bail!("max_services must be within 1..=65535, got {}", lb.max_services);
        }
        if lb.max_backends == 0 {
            bail!("max_backends must be non-zero");
        }
        Ok(())
    }

    pub fn retry_backoff_min(&self) -> Duration {
        parse_duration(&self.reconciler.retry_backoff_min).unwrap_or(Duration::from_millis(50))
    }

    pub fn retry_backoff_max(&self) -> Duration {
        parse_duration(&self.reconciler.retry_backoff_max).unwrap_or(Duration::from_secs(60))
    }

    pub fn prune_interval(&self) -> Duration {
        parse_duration(&self.reconciler.prune_interval).unwrap_or(Duration::from_secs(300))
    }

    pub fn map_timeout(&self) -> Duration {
        parse_duration(&self.reconciler.map_timeout).unwrap_or(Duration::from_secs(1))
    }

    /// Settings for the frontend reconciler.
    pub fn reconciler_config(&self) -> warplb_reconciler::Config {
        warplb_reconciler::Config {
            retry_backoff_min: self.retry_backoff_min(),
            retry_backoff_max: self.retry_backoff_max(),
            prune_interval: self.prune_interval(),
        }
    }
}

fn require_duration(field: &str, value: &str) -> anyhow::Result<Duration> {
    parse_duration(value).with_context(|| format!("{field}: invalid duration {value:?}"))
}

/// Parse "10ms", "5s", "2m", "1h" or a bare number of seconds. Values that
/// overflow are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok()?.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok()?.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
