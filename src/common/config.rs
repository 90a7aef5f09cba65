//! Configuration for geofs components
//!
//! One TOML document shared by all three roles; each role reads the
//! sections it needs. The storage server's `heartbeat_interval` is also
//! the period of the coordinator's control loops.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub storage_server: StorageServerConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Listen host
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding metadata.json
    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: PathBuf,

    /// Max payload per chunk (bytes)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Target replica count
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Weight of the normalized-distance term in placement scoring
    #[serde(default = "default_distance_weight")]
    pub distance_weight: f64,

    /// Weight of the space-utilization term in placement scoring
    #[serde(default = "default_space_weight")]
    pub space_weight: f64,

    /// Deadline for outbound RPCs (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7000
}
fn default_metadata_dir() -> PathBuf {
    PathBuf::from("data/metadata")
}
fn default_chunk_size() -> u64 {
    64 * 1024 * 1024 // 64 MiB
}
fn default_replication_factor() -> usize {
    3
}
fn default_distance_weight() -> f64 {
    0.6
}
fn default_space_weight() -> f64 {
    0.4
}
fn default_request_timeout() -> u64 {
    30
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            metadata_dir: default_metadata_dir(),
            chunk_size: default_chunk_size(),
            replication_factor: default_replication_factor(),
            distance_weight: default_distance_weight(),
            space_weight: default_space_weight(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Storage server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageServerConfig {
    /// Starting port for auto-assignment
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Directory for chunk payloads
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds between heartbeats; also the coordinator's control-loop period
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    /// Per-server capacity in MiB
    #[serde(default = "default_space_limit_mb")]
    pub space_limit_mb: u64,
}

fn default_base_port() -> u16 {
    7100
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data/chunks")
}
fn default_heartbeat_interval() -> u64 {
    5
}
fn default_space_limit_mb() -> u64 {
    1024
}

impl Default for StorageServerConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            data_dir: default_data_dir(),
            heartbeat_interval: default_heartbeat_interval(),
            space_limit_mb: default_space_limit_mb(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Client-side split size; should equal the coordinator's chunk_size
    #[serde(default = "default_chunk_size")]
    pub upload_chunk_size: u64,

    /// Attempts per chunk before surfacing an error
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

fn default_max_retries() -> usize {
    3
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            upload_chunk_size: default_chunk_size(),
            max_retries: default_max_retries(),
        }
    }
}

impl Config {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.coordinator.chunk_size == 0 {
            return Err(crate::Error::InvalidConfig("chunk_size must be > 0".into()));
        }
        if self.coordinator.replication_factor == 0 {
            return Err(crate::Error::InvalidConfig(
                "replication_factor must be > 0".into(),
            ));
        }
        let w_dist = self.coordinator.distance_weight;
        let w_space = self.coordinator.space_weight;
        if w_dist < 0.0 || w_space < 0.0 {
            return Err(crate::Error::InvalidConfig(
                "placement weights must be non-negative".into(),
            ));
        }
        if w_dist == 0.0 && w_space == 0.0 {
            return Err(crate::Error::InvalidConfig(
                "at least one placement weight must be positive".into(),
            ));
        }
        if self.storage_server.heartbeat_interval == 0 {
            return Err(crate::Error::InvalidConfig(
                "heartbeat_interval must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Coordinator listen address as host:port
    pub fn coordinator_addr(&self) -> String {
        format!("{}:{}", self.coordinator.host, self.coordinator.port)
    }

    /// Outbound RPC deadline
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.coordinator.request_timeout_secs)
    }

    /// Storage-server capacity in bytes
    pub fn space_limit_bytes(&self) -> u64 {
        self.storage_server.space_limit_mb * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.coordinator.port, 7000);
        assert_eq!(config.coordinator.chunk_size, 64 * 1024 * 1024);
        assert_eq!(config.coordinator.replication_factor, 3);
        assert!((config.coordinator.distance_weight - 0.6).abs() < f64::EPSILON);
        assert!((config.coordinator.space_weight - 0.4).abs() < f64::EPSILON);
        assert_eq!(config.storage_server.heartbeat_interval, 5);
        config.validate().unwrap();
    }

    #[test]
    fn test_sectioned_parse() {
        let config: Config = toml::from_str(
            r#"
            [coordinator]
            host = "0.0.0.0"
            port = 9000
            replication_factor = 2

            [storage_server]
            base_port = 9100
            space_limit_mb = 512

            [client]
            upload_chunk_size = 1024
            "#,
        )
        .unwrap();
        assert_eq!(config.coordinator_addr(), "0.0.0.0:9000");
        assert_eq!(config.coordinator.replication_factor, 2);
        assert_eq!(config.storage_server.base_port, 9100);
        assert_eq!(config.space_limit_bytes(), 512 * 1024 * 1024);
        assert_eq!(config.client.upload_chunk_size, 1024);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config {
            coordinator: CoordinatorConfig::default(),
            storage_server: StorageServerConfig::default(),
            client: ClientConfig::default(),
        };
        config.coordinator.replication_factor = 0;
        assert!(config.validate().is_err());

        config.coordinator.replication_factor = 3;
        config.coordinator.distance_weight = 0.0;
        config.coordinator.space_weight = 0.0;
        assert!(config.validate().is_err());

        config.coordinator.distance_weight = -1.0;
        assert!(config.validate().is_err());
    }
}
