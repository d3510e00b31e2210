//! node configuration
//!
//! one explicitly constructed [`Config`] is passed to every role. values come
//! from the built-in defaults, then an optional toml file, then cli/env
//! overrides applied by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use quorum_primitives::{FilterParams, KeyPair};
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};
use crate::topic::Topics;

/// how the aggregator decides a responder belongs to the quorum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MembershipGate {
    /// bloom filter only; a non-member passes with probability ~false_positive_rate
    #[default]
    Bloom,
    /// bloom filter and the privately stored sampled address list
    Exact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCounts {
    pub monitor: usize,
    pub publisher: usize,
    pub aggregator: usize,
}

impl Default for WorkerCounts {
    fn default() -> Self {
        Self {
            monitor: 1,
            publisher: 1,
            aggregator: 1,
        }
    }
}

/// work queue channel names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Channels {
    /// incoming task descriptors
    pub synthesis: String,
    /// published tasks waiting for their deadline
    pub aggregation: String,
    /// selected responses for delivery
    pub results: String,
}

impl Default for Channels {
    fn default() -> Self {
        Self {
            synthesis: "synthesis".into(),
            aggregation: "aggregation".into(),
            results: "results".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// topic namespace
    pub namespace: String,
    /// protocol version segment of every topic
    pub protocol_version: u32,
    /// gossip relay rest endpoint
    pub gossip_url: String,
    /// embedding service endpoint; the local hashing embedder is used when unset
    pub embedding_url: Option<String>,
    /// sled directory for the queue and store
    pub data_dir: PathBuf,
    /// long-lived node key, hex. never written back out
    #[serde(skip_serializing)]
    pub private_key: Option<String>,

    /// participants sampled per task, and the acceptance threshold
    pub quorum_size: u32,
    /// filter capacity; defaults to `quorum_size`
    pub filter_capacity: Option<u32>,
    pub false_positive_rate: f64,
    pub membership_gate: MembershipGate,

    pub monitoring_interval_secs: u64,
    pub polling_interval_secs: u64,
    pub task_timeout_secs: u64,
    /// registry entries older than this are not sampled
    pub node_ttl_secs: u64,

    /// extra attempts for transient transport failures
    pub transport_retries: u32,
    pub retry_backoff_millis: u64,
    pub request_timeout_secs: u64,

    pub workers: WorkerCounts,
    pub channels: Channels,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "dria".into(),
            protocol_version: 0,
            gossip_url: "http://127.0.0.1:8645".into(),
            embedding_url: None,
            data_dir: PathBuf::from("./quorumd.db"),
            private_key: None,
            quorum_size: 3,
            filter_capacity: None,
            false_positive_rate: 0.01,
            membership_gate: MembershipGate::Bloom,
            monitoring_interval_secs: 10,
            polling_interval_secs: 5,
            task_timeout_secs: 180,
            node_ttl_secs: 60,
            transport_retries: 2,
            retry_backoff_millis: 500,
            request_timeout_secs: 30,
            workers: WorkerCounts::default(),
            channels: Channels::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))?;
        Ok(config)
    }

    /// defaults, or the given toml file when present
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| NodeError::Config(format!("{}: {}", p.display(), e)))?;
                Self::from_toml_str(&raw)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(NodeError::Config(format!("invalid namespace {:?}", self.namespace)));
        }
        if self.quorum_size == 0 {
            return Err(NodeError::Config("quorum_size must be at least 1".into()));
        }
        if self.filter_capacity() < self.quorum_size {
            return Err(NodeError::Config(format!(
                "filter_capacity {} is below quorum_size {}",
                self.filter_capacity(),
                self.quorum_size
            )));
        }
        FilterParams::optimal(self.filter_capacity(), self.false_positive_rate)
            .map_err(|e| NodeError::Config(e.to_string()))?;
        if let Some(key) = &self.private_key {
            KeyPair::from_hex(key).map_err(|e| NodeError::Config(e.to_string()))?;
        }
        Ok(())
    }

    pub fn filter_capacity(&self) -> u32 {
        self.filter_capacity.unwrap_or(self.quorum_size)
    }

    /// the node's long-lived key
    pub fn keypair(&self) -> Result<KeyPair> {
        let key = self
            .private_key
            .as_deref()
            .ok_or_else(|| NodeError::Config("no private key configured".into()))?;
        KeyPair::from_hex(key).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn topics(&self) -> Topics {
        Topics::new(self.namespace.clone(), self.protocol_version)
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval_secs)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_millis)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.filter_capacity(), 3);
        assert_eq!(config.topics().heartbeat(), "/dria/0/heartbeat/proto");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            quorum_size = 5
            membership_gate = "exact"

            [workers]
            aggregator = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.quorum_size, 5);
        assert_eq!(config.membership_gate, MembershipGate::Exact);
        assert_eq!(config.workers.aggregator, 4);
        assert_eq!(config.workers.monitor, 1);
        assert_eq!(config.channels.synthesis, "synthesis");
    }

    #[test]
    fn test_undersized_filter_rejected() {
        let config = Config {
            quorum_size: 5,
            filter_capacity: Some(3),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));
    }

    #[test]
    fn test_bad_rate_and_key_rejected() {
        let config = Config {
            false_positive_rate: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            private_key: Some("not hex".into()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keypair_required() {
        assert!(Config::default().keypair().is_err());

        let key = KeyPair::generate();
        let config = Config {
            private_key: Some(key.secret_hex()),
            ..Config::default()
        };
        assert_eq!(config.keypair().unwrap().address(), key.address());
    }
}
