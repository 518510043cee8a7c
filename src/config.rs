//! Application Configuration
//!
//! Settings are read from a YAML file with documented defaults for anything
//! missing. A remote key-value service can then override individual fields,
//! and command-line flags override both. Overrides are applied field by
//! field: a source that has nothing to say about a field leaves it alone.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use log::{info, warn};

use crate::remote_config;
use crate::storage::config::StoreBackend;

/// Environment variable carrying the resolved configuration to worker processes
pub const WORKER_CONFIG_ENV: &str = "DOCSVC_WORKER_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration in {origin}: {source}")]
    Parse {
        origin: String,
        source: serde_yaml::Error,
    },

    #[error("failed to serialize configuration: {0}")]
    Serialize(serde_yaml::Error),

    #[error("remote configuration unavailable: {0}")]
    Remote(String),
}

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub data: DataSettings,
    pub store: StoreSettings,
    pub logs: LogSettings,
    pub extract: ExtractSettings,
    pub remote: RemoteSettings,
}

/// HTTP listener and process model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Run a coordinator with one worker process per slot
    pub cluster: bool,
    /// Worker processes in cluster mode, 0 means one per CPU
    pub workers: usize,
    /// Event loop threads inside each worker
    pub threads: usize,
    /// Largest accepted document in bytes
    pub max_payload_size: usize,
    /// Workers that live at least this long are replaced without delay
    pub min_uptime_secs: u64,
    pub respawn_backoff_ms: u64,
    pub max_respawn_backoff_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cluster: false,
            workers: 0,
            threads: 1,
            max_payload_size: 64 * 1024 * 1024,
            min_uptime_secs: 5,
            respawn_backoff_ms: 100,
            max_respawn_backoff_ms: 30_000,
        }
    }
}

/// Local filesystem backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    pub dir: String,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            dir: "./data".to_string(),
        }
    }
}

/// Backing store selection and Riak connection details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// Riak servers as `host:port`
    pub servers: Vec<String>,
    /// Base client id; each worker appends its index
    pub client: String,
    pub pool: String,
    /// Bucket used when a request names none
    pub bucket: String,
    pub connect_timeout_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            servers: vec!["localhost:8098".to_string()],
            client: "document-service-client".to_string(),
            pool: "document-service-pool".to_string(),
            bucket: "documents".to_string(),
            connect_timeout_secs: 5,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub dir: String,
    pub level: String,
    /// log4rs YAML file used instead of the built-in layout when it exists
    pub config_file: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: "./logs".to_string(),
            level: "info".to_string(),
            config_file: "server_log.yaml".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractSettings {
    /// Tika server base URL; plain text extraction only when unset
    pub tika_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ExtractSettings {
    fn default() -> Self {
        Self {
            tika_url: None,
            timeout_secs: 30,
        }
    }
}

/// Remote configuration service (etcd v2 HTTP API)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Directory holding this service's keys
    pub prefix: String,
    /// Directory whose values list the Riak servers
    pub servers_key: String,
    pub timeout_secs: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 4001,
            prefix: "document-service".to_string(),
            servers_key: "riak/servers".to_string(),
            timeout_secs: 2,
        }
    }
}

/// Field-by-field overrides from the remote service or the command line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub cluster: Option<bool>,
    pub servers: Option<Vec<String>>,
    pub client: Option<String>,
    pub pool: Option<String>,
    pub bucket: Option<String>,
    pub logs_dir: Option<String>,
    pub logs_level: Option<String>,
}

impl ConfigOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Combine two override sets, `other` winning where both have a value
    pub fn merge(self, other: ConfigOverrides) -> Self {
        Self {
            port: other.port.or(self.port),
            cluster: other.cluster.or(self.cluster),
            servers: other.servers.or(self.servers),
            client: other.client.or(self.client),
            pool: other.pool.or(self.pool),
            bucket: other.bucket.or(self.bucket),
            logs_dir: other.logs_dir.or(self.logs_dir),
            logs_level: other.logs_level.or(self.logs_level),
        }
    }

    pub fn apply(self, config: &mut AppConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(cluster) = self.cluster {
            config.server.cluster = cluster;
        }
        if let Some(servers) = self.servers {
            config.store.servers = servers;
        }
        if let Some(client) = self.client {
            config.store.client = client;
        }
        if let Some(pool) = self.pool {
            config.store.pool = pool;
        }
        if let Some(bucket) = self.bucket {
            config.store.bucket = bucket;
        }
        if let Some(dir) = self.logs_dir {
            config.logs.dir = dir;
        }
        if let Some(level) = self.logs_level {
            config.logs.level = level;
        }
    }
}

impl AppConfig {
    /// Load configuration from file, use defaults if not found
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&content, &path.display().to_string())?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(content: &str, origin: &str) -> Result<Self, ConfigError> {
        // An empty file parses as null rather than an empty mapping.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            origin: origin.to_string(),
            source,
        })
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(ConfigError::Serialize)
    }

    /// Configuration handed down by the coordinator, if this process is a worker
    pub fn from_worker_env() -> Result<Option<Self>, ConfigError> {
        match std::env::var(WORKER_CONFIG_ENV) {
            Ok(content) => Self::from_yaml(&content, WORKER_CONFIG_ENV).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Point the remote lookup at an explicit endpoint, enabling it
    pub fn set_remote_endpoint(&mut self, host: Option<String>, port: Option<u16>) {
        if let Some(host) = host.filter(|h| !h.is_empty()) {
            self.remote.host = host;
            self.remote.enabled = true;
        }
        if let Some(port) = port {
            self.remote.port = port;
            self.remote.enabled = true;
        }
    }

    /// Apply remote overrides, then command-line overrides
    ///
    /// An unreachable remote service is logged and the local settings stay
    /// in effect.
    pub async fn resolve(mut self, cli: ConfigOverrides) -> Self {
        let mut remote = ConfigOverrides::default();
        if self.remote.enabled {
            match remote_config::load_remote(&self.remote).await {
                Ok(overrides) => {
                    info!("Applying configuration from {}:{}", self.remote.host, self.remote.port);
                    remote = overrides;
                }
                Err(e) => warn!("{}, using local configuration", e),
            }
        }
        remote.merge(cli).apply(&mut self);
        self
    }

    /// Number of worker processes to run in cluster mode
    pub fn worker_count(&self) -> usize {
        if self.server.workers > 0 {
            return self.server.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}
