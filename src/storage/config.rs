//! Configuration for document storage backends

use crate::config::{DataSettings, StoreSettings};
use crate::error::StoreError;
use crate::storage::{
    local_store::LocalStore, memory_store::MemoryStore, riak_store::RiakStore, DocumentStore,
};
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Available document storage backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Riak cluster over its HTTP interface
    Riak,
    /// Directory on the local filesystem
    #[default]
    Local,
    /// In-process map, lost on restart
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "riak" | "kv" => Ok(StoreBackend::Riak),
            "local" | "fs" | "filesystem" => Ok(StoreBackend::Local),
            "memory" | "mock" => Ok(StoreBackend::Memory),
            _ => Err(format!("Unknown storage backend: {}", s)),
        }
    }
}

/// Storage settings resolved for one worker process
///
/// Built once at worker startup and never changed afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Backend servers as `host:port`
    pub servers: Vec<String>,
    /// Client identity presented to the backend, unique per worker
    pub client_id: String,
    /// Connection pool name, used in logs and the user agent
    pub pool_name: String,
    /// Bucket used when a request does not name one
    pub default_bucket: String,
    pub connect_timeout: Duration,
}

impl StorageConfig {
    /// Derive the storage settings for the worker with the given index
    ///
    /// Sibling workers share one configuration, so the worker index is
    /// appended to the client id to keep their identities distinct.
    pub fn for_worker(settings: &StoreSettings, worker_index: usize) -> Self {
        let client_id = if settings.client.is_empty() {
            worker_index.to_string()
        } else {
            format!("{}-{}", settings.client, worker_index)
        };

        Self {
            servers: settings.servers.clone(),
            client_id,
            pool_name: settings.pool.clone(),
            default_bucket: settings.bucket.clone(),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
        }
    }
}

/// Create a storage instance for the configured backend
pub fn create_store(
    backend: StoreBackend,
    storage: &StorageConfig,
    data: &DataSettings,
) -> Result<Arc<dyn DocumentStore>, StoreError> {
    let store: Arc<dyn DocumentStore> = match backend {
        StoreBackend::Riak => {
            info!(
                "Using Riak storage backend, pool {} over {:?} as client {}",
                storage.pool_name, storage.servers, storage.client_id
            );
            Arc::new(RiakStore::new(storage)?)
        }
        StoreBackend::Local => {
            info!("Using local storage backend with data dir: {}", data.dir);
            Arc::new(LocalStore::new(&data.dir)?)
        }
        StoreBackend::Memory => {
            info!("Using in-memory storage backend");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_settings(client: &str) -> StoreSettings {
        StoreSettings {
            client: client.to_string(),
            ..StoreSettings::default()
        }
    }

    #[test]
    fn test_store_backend_from_str() {
        assert_eq!("riak".parse::<StoreBackend>().unwrap(), StoreBackend::Riak);
        assert_eq!("RIAK".parse::<StoreBackend>().unwrap(), StoreBackend::Riak);
        assert_eq!("local".parse::<StoreBackend>().unwrap(), StoreBackend::Local);
        assert_eq!("fs".parse::<StoreBackend>().unwrap(), StoreBackend::Local);
        assert_eq!("memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert_eq!("Mock".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);

        assert!("invalid".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_client_id_is_unique_per_worker() {
        let settings = store_settings("document-service-client");
        let first = StorageConfig::for_worker(&settings, 1);
        let second = StorageConfig::for_worker(&settings, 2);

        assert_eq!(first.client_id, "document-service-client-1");
        assert_eq!(second.client_id, "document-service-client-2");
        assert_eq!(first.servers, second.servers);
        assert_eq!(first.default_bucket, second.default_bucket);
    }

    #[test]
    fn test_client_id_without_base_name() {
        let config = StorageConfig::for_worker(&store_settings(""), 7);
        assert_eq!(config.client_id, "7");
    }

    #[test]
    fn test_create_store() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataSettings {
            dir: dir.path().to_string_lossy().into_owned(),
        };
        let storage = StorageConfig::for_worker(&StoreSettings::default(), 1);

        let memory = create_store(StoreBackend::Memory, &storage, &data).unwrap();
        assert_eq!(memory.name(), "memory");

        let local = create_store(StoreBackend::Local, &storage, &data).unwrap();
        assert_eq!(local.name(), "local");

        let riak = create_store(StoreBackend::Riak, &storage, &data).unwrap();
        assert_eq!(riak.name(), "riak");
    }
}
