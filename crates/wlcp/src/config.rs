// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for wlcp.
//!
//! Loaded from a YAML file. A handful of environment variables override
//! the file so the same image can run on every node:
//!
//! | Variable            | Effect                                  |
//! |---------------------|-----------------------------------------|
//! | `NODE_POD_IP`       | address this node advertises            |
//! | `WLCP_DATABASE_URL` | replaces `database_url`                 |
//! | `WLCP_REDIS_URL`    | replaces `redis_url`                    |

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Largest node id the id generator can encode (10 bits).
pub const MAX_NODE_ID: i64 = 1023;

/// A provisioner endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionerEndpoint {
    pub host: String,
    pub port: u16,
}

/// Routes images from `source` through the registry mirror `cache`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCacheRule {
    pub source: String,
    pub cache: String,
}

/// Control plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node id, also the id generator's node field
    pub node_id: i64,
    /// Address this node advertises; filled from `NODE_POD_IP`
    #[serde(default)]
    pub node_address: String,
    /// false runs a single always-leader node
    #[serde(default)]
    pub cluster: bool,
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    pub database_url: String,
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,
    /// Required in cluster mode; standalone nodes fall back to an in-process bus
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_http_bind_addr")]
    pub http_bind_addr: SocketAddr,
    /// Public URL the platform is reached on
    pub access_url: String,
    /// Host suffix used for port-proxy subdomains
    pub app_hostname: String,
    #[serde(default)]
    pub git_use_tls: bool,
    pub provisioners: Vec<ProvisionerEndpoint>,
    #[serde(default)]
    pub provisioner_tls_skip_verify: bool,
    #[serde(default)]
    pub registry_caches: Vec<RegistryCacheRule>,
    #[serde(default = "default_agent_connection_update_frequency", with = "duration_str")]
    pub agent_connection_update_frequency: Duration,
    #[serde(default = "default_agent_stats_refresh_interval", with = "duration_str")]
    pub agent_stats_refresh_interval: Duration,
    #[serde(default = "default_leader_tick", with = "duration_str")]
    pub leader_tick: Duration,
    #[serde(default = "default_node_ttl", with = "duration_str")]
    pub node_ttl: Duration,
    #[serde(default = "num_cpus::get")]
    pub worker_pool_size: usize,
    #[serde(default = "default_drain_timeout", with = "duration_str")]
    pub drain_timeout: Duration,
}

fn default_cluster_name() -> String {
    "wlcp".to_string()
}

fn default_database_max_connections() -> u32 {
    10
}

fn default_http_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_agent_connection_update_frequency() -> Duration {
    Duration::from_secs(3)
}

fn default_agent_stats_refresh_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_leader_tick() -> Duration {
    Duration::from_secs(1)
}

fn default_node_ttl() -> Duration {
    Duration::from_secs(10)
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Config {
    /// Load the YAML file at `path`, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_yaml(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML without touching the environment.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(ip) = std::env::var("NODE_POD_IP")
            && !ip.is_empty()
        {
            self.node_address = ip;
        }
        if let Ok(url) = std::env::var("WLCP_DATABASE_URL")
            && !url.is_empty()
        {
            self.database_url = url;
        }
        if let Ok(url) = std::env::var("WLCP_REDIS_URL")
            && !url.is_empty()
        {
            self.redis_url = Some(url);
        }
    }

    /// Check the invariants every component relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0..=MAX_NODE_ID).contains(&self.node_id) {
            return Err(ConfigError::InvalidNodeId(self.node_id));
        }
        if self.provisioners.is_empty() {
            return Err(ConfigError::NoProvisioners);
        }
        self.parsed_access_url()?;
        if self.cluster && self.redis_url.is_none() {
            return Err(ConfigError::MissingRedisUrl);
        }
        if self.worker_pool_size == 0 {
            return Err(ConfigError::Invalid("worker_pool_size must be at least 1"));
        }
        if self.leader_tick.is_zero() {
            return Err(ConfigError::Invalid("leader_tick must be positive"));
        }
        Ok(())
    }

    /// `access_url` as a parsed URL.
    pub fn parsed_access_url(&self) -> Result<url::Url, ConfigError> {
        url::Url::parse(&self.access_url)
            .map_err(|e| ConfigError::InvalidAccessUrl(format!("{}: {}", self.access_url, e)))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    /// The config file is not valid YAML for [`Config`].
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// The node id does not fit the id generator's node field.
    #[error("snowflake id misconfigured: node_id {0} outside 0..=1023")]
    InvalidNodeId(i64),
    /// No provisioner endpoints were configured.
    #[error("At least one provisioner endpoint is required")]
    NoProvisioners,
    /// `access_url` is not a URL.
    #[error("Invalid access_url: {0}")]
    InvalidAccessUrl(String),
    /// Cluster mode needs the cache tier.
    #[error("redis_url is required when cluster is enabled")]
    MissingRedisUrl,
    /// Any other invalid value.
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Serde adapter for human-readable durations (`"3s"`, `"5m"`, `"1h"`).
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
node_id: 3
database_url: postgres://localhost/wlcp
access_url: https://gigo.dev
app_hostname: gigo.dev
provisioners:
  - host: prov-0
    port: 7443
"#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_yaml(MINIMAL).unwrap();

        assert_eq!(config.node_id, 3);
        assert!(!config.cluster);
        assert_eq!(config.cluster_name, "wlcp");
        assert_eq!(config.database_max_connections, 10);
        assert_eq!(config.agent_connection_update_frequency, Duration::from_secs(3));
        assert_eq!(config.agent_stats_refresh_interval, Duration::from_secs(300));
        assert_eq!(config.leader_tick, Duration::from_secs(1));
        assert_eq!(config.node_ttl, Duration::from_secs(10));
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
        assert_eq!(config.worker_pool_size, num_cpus::get());
        assert!(config.redis_url.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_duration_strings() {
        let raw = format!(
            "{}agent_connection_update_frequency: 500ms\nleader_tick: 2s\ndrain_timeout: 1m\n",
            MINIMAL
        );
        let config = Config::from_yaml(&raw).unwrap();
        assert_eq!(config.agent_connection_update_frequency, Duration::from_millis(500));
        assert_eq!(config.leader_tick, Duration::from_secs(2));
        assert_eq!(config.drain_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_bad_duration_rejected() {
        let raw = format!("{}leader_tick: soon\n", MINIMAL);
        assert!(matches!(Config::from_yaml(&raw), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_node_id_out_of_range() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.node_id = 1024;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidNodeId(1024))));
        config.node_id = -1;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidNodeId(-1))));
    }

    #[test]
    fn test_empty_provisioners_rejected() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.provisioners.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoProvisioners)));
    }

    #[test]
    fn test_cluster_requires_redis() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.cluster = true;
        assert!(matches!(config.validate(), Err(ConfigError::MissingRedisUrl)));
        config.redis_url = Some("redis://localhost".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_access_url() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.access_url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidAccessUrl(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.provisioners.len(), 1);
        assert_eq!(config.provisioners[0].host, "prov-0");
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load("/nonexistent/wlcp.yaml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
