//! Cluster configuration parser (TOML).

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::transport::RetryPolicy;
use crate::types::{ClusterNode, FailoverSettings, NodeId, ServiceAddress};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster: ClusterSection,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    /// Node that starts out as primary.
    pub primary: NodeId,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    pub host: String,
}

/// Well-known ports. Every other service binds a dynamic port that the
/// primary distributes at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsConfig {
    pub internal_comm: u16,
    pub events_json: u16,
    pub events_binary: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            internal_comm: 41001,
            events_json: 41003,
            events_binary: 41004,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub connection_retry_count: u32,
    pub connection_retry_delay: String,
    pub game_start_timeout: String,
    pub frame_start_timeout: String,
    pub frame_end_timeout: String,
    pub render_timeout: String,
    /// Pause between attempts to bind external servers after promotion.
    pub promotion_retry_delay: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connection_retry_count: 10,
            connection_retry_delay: "500ms".to_string(),
            game_start_timeout: "30s".to_string(),
            frame_start_timeout: "5s".to_string(),
            frame_end_timeout: "5s".to_string(),
            render_timeout: "5s".to_string(),
            promotion_retry_delay: "1s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub enabled: bool,
    pub critical_nodes: Vec<NodeId>,
    pub backup_candidates: Vec<NodeId>,
}

/// Parsed barrier timeouts and retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub game_start: Duration,
    pub frame_start: Duration,
    pub frame_end: Duration,
    pub render: Duration,
    pub promotion_retry_delay: Duration,
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check cross-references between sections and parse every duration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.nodes.is_empty() {
            return Err(ConfigError::Invalid("cluster has no nodes".into()));
        }

        let mut ids = BTreeSet::new();
        for node in &self.cluster.nodes {
            if node.id.is_empty() {
                return Err(ConfigError::Invalid("node with empty id".into()));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate node id {}", node.id)));
            }
        }

        if !ids.contains(self.cluster.primary.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "primary {} is not a configured node",
                self.cluster.primary
            )));
        }

        for id in &self.failover.critical_nodes {
            if !ids.contains(id.as_str()) {
                return Err(ConfigError::Invalid(format!("critical node {id} is not configured")));
            }
        }

        let mut seen = BTreeSet::new();
        for id in &self.failover.backup_candidates {
            if !ids.contains(id.as_str()) {
                return Err(ConfigError::Invalid(format!("backup candidate {id} is not configured")));
            }
            if !seen.insert(id.as_str()) {
                return Err(ConfigError::Invalid(format!("backup candidate {id} listed twice")));
            }
        }

        if self.network.connection_retry_count == 0 {
            return Err(ConfigError::Invalid("connection_retry_count must be at least 1".into()));
        }

        self.retry_policy()?;
        self.timeouts()?;
        Ok(())
    }

    pub fn node(&self, node_id: &str) -> Option<ClusterNode> {
        self.cluster
            .nodes
            .iter()
            .find(|n| n.id == node_id)
            .map(|n| ClusterNode {
                id: n.id.clone(),
                host: n.host.clone(),
            })
    }

    pub fn node_ids(&self) -> BTreeSet<NodeId> {
        self.cluster.nodes.iter().map(|n| n.id.clone()).collect()
    }

    /// Well-known internal-comm address of a node.
    pub fn internal_comm_address(&self, node_id: &str) -> Option<ServiceAddress> {
        self.node(node_id)
            .map(|n| ServiceAddress::new(n.host, self.ports.internal_comm))
    }

    pub fn failover_settings(&self) -> FailoverSettings {
        FailoverSettings {
            enabled: self.failover.enabled,
            critical_nodes: self.failover.critical_nodes.iter().cloned().collect(),
            backup_candidates: self.failover.backup_candidates.clone(),
            backups_configured: !self.failover.backup_candidates.is_empty(),
        }
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        Ok(RetryPolicy {
            attempts: self.network.connection_retry_count,
            delay: parse_duration(&self.network.connection_retry_delay)?,
        })
    }

    pub fn timeouts(&self) -> Result<Timeouts, ConfigError> {
        Ok(Timeouts {
            game_start: parse_duration(&self.network.game_start_timeout)?,
            frame_start: parse_duration(&self.network.frame_start_timeout)?,
            frame_end: parse_duration(&self.network.frame_end_timeout)?,
            render: parse_duration(&self.network.render_timeout)?,
            promotion_retry_delay: parse_duration(&self.network.promotion_retry_delay)?,
        })
    }
}

/// Parse `"250ms"` or `"5s"` into a `Duration`.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let trimmed = s.trim();
    let parsed = if let Some(ms) = trimmed.strip_suffix("ms") {
        ms.trim().parse::<u64>().map(Duration::from_millis)
    } else if let Some(secs) = trimmed.strip_suffix('s') {
        secs.trim().parse::<u64>().map(Duration::from_secs)
    } else {
        return Err(ConfigError::Duration(s.to_string()));
    };
    parsed.map_err(|_| ConfigError::Duration(s.to_string()))
}
