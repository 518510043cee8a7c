//! Remote configuration overrides
//!
//! Settings can be pulled from any `KeyValueSource`. The production source is
//! an etcd server spoken to over its v2 HTTP API; `StoreSource` reads the same
//! keys out of a document bucket instead.

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConfigError, ConfigOverrides, RemoteSettings};
use crate::storage::DocumentStore;

const MAX_VALUE_SIZE: usize = 64 * 1024;

/// Hierarchical string key-value lookups
#[async_trait]
pub trait KeyValueSource: Send + Sync {
    /// Value stored at `key`, `None` if absent
    async fn get(&self, key: &str) -> Result<Option<String>, ConfigError>;

    /// Values stored directly under directory `key`, ordered by key
    async fn list(&self, key: &str) -> Result<Vec<String>, ConfigError>;
}

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    node: EtcdNode,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    #[serde(default)]
    key: String,
    value: Option<String>,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
}

/// etcd v2 HTTP client
pub struct EtcdSource {
    client: Client,
    base_url: String,
}

impl EtcdSource {
    pub fn new(settings: &RemoteSettings) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(remote_error)?;
        Ok(Self {
            client,
            base_url: format!("http://{}:{}", settings.host, settings.port),
        })
    }

    /// Check that the server answers at all
    pub async fn probe(&self) -> Result<(), ConfigError> {
        self.client
            .get(format!("{}/version", self.base_url))
            .send()
            .await
            .map_err(|e| ConfigError::Remote(format!("etcd server {} not available: {}", self.base_url, e)))?;
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Option<EtcdNode>, ConfigError> {
        let url = format!("{}/v2/keys/{}", self.base_url, key.trim_start_matches('/'));
        let response = self.client.get(&url).send().await.map_err(remote_error)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: EtcdResponse = response.json().await.map_err(remote_error)?;
                Ok(Some(body.node))
            }
            status => Err(ConfigError::Remote(format!("etcd returned {} for {}", status, key))),
        }
    }
}

fn remote_error(e: reqwest::Error) -> ConfigError {
    ConfigError::Remote(e.to_string())
}

#[async_trait]
impl KeyValueSource for EtcdSource {
    async fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        Ok(self.fetch(key).await?.and_then(|node| node.value))
    }

    async fn list(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        let mut nodes = match self.fetch(key).await? {
            Some(node) => node.nodes,
            None => return Ok(Vec::new()),
        };
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(nodes.into_iter().filter_map(|node| node.value).collect())
    }
}

/// Key-value view over a document store bucket
///
/// `get` reads the document named by the key; `list` reads every document
/// in the namespace named by the key.
pub struct StoreSource {
    store: Arc<dyn DocumentStore>,
    bucket: String,
}

impl StoreSource {
    pub fn new(store: Arc<dyn DocumentStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }
}

fn store_error(e: crate::error::StoreError) -> ConfigError {
    ConfigError::Remote(e.to_string())
}

#[async_trait]
impl KeyValueSource for StoreSource {
    async fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let document = match self.store.get(&self.bucket, key).await {
            Ok(document) => document,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(store_error(e)),
        };
        let raw = document.into_bytes(MAX_VALUE_SIZE).await.map_err(store_error)?;
        Ok(Some(String::from_utf8_lossy(&raw).trim().to_string()))
    }

    async fn list(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        let values = self.store.list(key).await.map_err(store_error)?;
        Ok(values
            .iter()
            .map(|raw| String::from_utf8_lossy(raw).trim().to_string())
            .collect())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read every known override key from `source`
///
/// Absent or unparsable values leave their field unset; transport errors
/// abort the whole lookup.
pub async fn fetch_overrides(
    source: &dyn KeyValueSource,
    settings: &RemoteSettings,
) -> Result<ConfigOverrides, ConfigError> {
    let prefix = settings.prefix.trim_end_matches('/');
    let key = |name: &str| format!("{}/{}", prefix, name);

    let mut overrides = ConfigOverrides::default();

    if let Some(raw) = source.get(&key("port")).await? {
        match raw.trim().parse::<u16>() {
            Ok(port) => overrides.port = Some(port),
            Err(_) => warn!("Ignoring remote port value {:?}", raw),
        }
    }
    if let Some(raw) = source.get(&key("cluster")).await? {
        match parse_flag(&raw) {
            Some(flag) => overrides.cluster = Some(flag),
            None => warn!("Ignoring remote cluster value {:?}", raw),
        }
    }

    overrides.client = source.get(&key("riak/client")).await?;
    overrides.pool = source.get(&key("riak/pool")).await?;
    overrides.bucket = source.get(&key("riak/bucket")).await?;
    overrides.logs_dir = source.get(&key("logs/dir")).await?;
    overrides.logs_level = source.get(&key("logs/level")).await?;

    let servers = source.list(&settings.servers_key).await?;
    if !servers.is_empty() {
        overrides.servers = Some(servers);
    }

    debug!("Remote overrides: {:?}", overrides);
    Ok(overrides)
}

/// Probe the configured etcd server and read overrides from it
pub async fn load_remote(settings: &RemoteSettings) -> Result<ConfigOverrides, ConfigError> {
    let source = EtcdSource::new(settings)?;
    source.probe().await?;
    info!("Getting configuration from etcd at {}:{}", settings.host, settings.port);
    fetch_overrides(&source, settings).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_store::MemoryStore;
    use crate::storage::ByteStream;
    use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
    use bytes::Bytes;
    use futures::stream::{self, StreamExt};
    use serde_json::json;

    fn settings(port: u16) -> RemoteSettings {
        RemoteSettings {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port,
            ..RemoteSettings::default()
        }
    }

    async fn fake_etcd(req: HttpRequest) -> HttpResponse {
        let key = req.path().trim_start_matches("/v2/keys/");
        let node = |k: &str, v: &str| json!({ "key": format!("/{}", k), "value": v });
        match key {
            "/version" => HttpResponse::Ok().json(json!({ "etcdserver": "2.3.8" })),
            "document-service/port" => HttpResponse::Ok().json(json!({ "node": node(key, "9300") })),
            "document-service/cluster" => HttpResponse::Ok().json(json!({ "node": node(key, "maybe") })),
            "document-service/riak/bucket" => {
                HttpResponse::Ok().json(json!({ "node": node(key, "remote-docs") }))
            }
            "riak/servers" => HttpResponse::Ok().json(json!({
                "node": {
                    "key": "/riak/servers",
                    "dir": true,
                    "nodes": [
                        node("riak/servers/2", "riak2:8098"),
                        node("riak/servers/1", "riak1:8098"),
                    ]
                }
            })),
            _ => HttpResponse::NotFound().json(json!({ "errorCode": 100, "message": "Key not found" })),
        }
    }

    #[actix_web::test]
    async fn test_overrides_from_fake_etcd() {
        let server = HttpServer::new(|| App::new().default_service(web::get().to(fake_etcd)))
            .workers(1)
            .bind(("127.0.0.1", 0))
            .unwrap();
        let port = server.addrs()[0].port();
        let running = server.run();
        let control = running.handle();
        actix_web::rt::spawn(running);

        let overrides = load_remote(&settings(port)).await.unwrap();
        assert_eq!(overrides.port, Some(9300));
        // Unparsable values are skipped.
        assert_eq!(overrides.cluster, None);
        assert_eq!(overrides.bucket.as_deref(), Some("remote-docs"));
        assert_eq!(overrides.client, None);
        assert_eq!(
            overrides.servers,
            Some(vec!["riak1:8098".to_string(), "riak2:8098".to_string()])
        );

        control.stop(true).await;
    }

    #[tokio::test]
    async fn test_unreachable_etcd() {
        let err = load_remote(&settings(1)).await.err().unwrap();
        assert!(matches!(err, ConfigError::Remote(_)));
    }

    fn value(text: &'static str) -> ByteStream {
        stream::once(async move { Ok(Bytes::from_static(text.as_bytes())) }).boxed()
    }

    #[tokio::test]
    async fn test_store_source_overrides() {
        let store = Arc::new(MemoryStore::new());
        store.put("config", "document-service/port", "text/plain", value("9400\n")).await.unwrap();
        store.put("config", "document-service/cluster", "text/plain", value("true")).await.unwrap();
        store.put("config", "document-service/logs/level", "text/plain", value("debug")).await.unwrap();
        store.put("riak/servers", "b", "text/plain", value("riak-b:8098")).await.unwrap();
        store.put("riak/servers", "a", "text/plain", value("riak-a:8098")).await.unwrap();

        let source = StoreSource::new(store, "config");
        let overrides = fetch_overrides(&source, &RemoteSettings::default()).await.unwrap();

        assert_eq!(overrides.port, Some(9400));
        assert_eq!(overrides.cluster, Some(true));
        assert_eq!(overrides.logs_level.as_deref(), Some("debug"));
        assert_eq!(overrides.bucket, None);
        assert_eq!(
            overrides.servers,
            Some(vec!["riak-a:8098".to_string(), "riak-b:8098".to_string()])
        );
    }

    #[tokio::test]
    async fn test_empty_source_gives_no_overrides() {
        let source = StoreSource::new(Arc::new(MemoryStore::new()), "config");
        let overrides = fetch_overrides(&source, &RemoteSettings::default()).await.unwrap();
        assert!(overrides.is_empty());
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" 0 "), Some(false));
        assert_eq!(parse_flag("sometimes"), None);
    }
}
