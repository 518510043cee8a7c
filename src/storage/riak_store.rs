//! Riak document storage implementation over the Riak HTTP interface
//!
//! One `reqwest::Client` per worker holds the connection pool; requests
//! rotate across the configured servers. Reads fail over to the next server
//! when a connection cannot be established. Writes do not, because the
//! request body is a one-shot stream that cannot be replayed.

use crate::error::StoreError;
use crate::storage::config::StorageConfig;
use crate::storage::{
    collect_stream, ByteStream, DocumentStore, PutReceipt, StoredDocument, DEFAULT_CONTENT_TYPE,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use futures::TryStreamExt;
use log::{debug, warn};
use reqwest::header::{CONTENT_TYPE, ETAG};
use reqwest::{Body, Client, Response, StatusCode};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};

const CLIENT_ID_HEADER: &str = "X-Riak-ClientId";
const MAX_LISTED_VALUE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct KeyListing {
    #[serde(default)]
    keys: Vec<String>,
}

/// Document store backed by a Riak cluster
pub struct RiakStore {
    client: Client,
    servers: Vec<String>,
    next_server: AtomicUsize,
    client_id: String,
}

impl RiakStore {
    pub fn new(config: &StorageConfig) -> Result<Self, StoreError> {
        let servers: Vec<String> = if config.servers.is_empty() {
            vec![base_url("localhost:8098")]
        } else {
            config.servers.iter().map(|s| base_url(s)).collect()
        };

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(format!(
                "{}/{} ({})",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                config.pool_name
            ))
            .build()?;

        Ok(Self {
            client,
            servers,
            next_server: AtomicUsize::new(0),
            client_id: config.client_id.clone(),
        })
    }

    /// Base URLs of the servers this store rotates over
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Index of the server the next request starts at
    fn pick_server(&self) -> usize {
        self.next_server.fetch_add(1, Ordering::Relaxed) % self.servers.len()
    }

    fn object_url(server: &str, bucket: &str, key: &str) -> String {
        format!(
            "{}/buckets/{}/keys/{}",
            server,
            urlencoding::encode(bucket),
            urlencoding::encode(key)
        )
    }

    /// GET with failover across servers on connection errors
    async fn get_with_failover(&self, path: impl Fn(&str) -> String) -> Result<Response, StoreError> {
        let start = self.pick_server();
        let mut last_error = None;

        for attempt in 0..self.servers.len() {
            let server = &self.servers[(start + attempt) % self.servers.len()];
            let request = self
                .client
                .get(path(server))
                .header(CLIENT_ID_HEADER, &self.client_id);

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() || e.is_timeout() => {
                    warn!("Riak server {} unreachable, trying next: {}", server, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        match last_error {
            Some(e) => Err(e.into()),
            None => Err(StoreError::Backend {
                status: 0,
                message: "no Riak servers configured".to_string(),
            }),
        }
    }

    async fn backend_error(response: Response) -> StoreError {
        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .unwrap_or_else(|e| format!("unreadable response body: {}", e));
        StoreError::Backend { status, message }
    }
}

/// Turn `host:port` into an HTTP base URL, leaving full URLs alone
fn base_url(server: &str) -> String {
    let trimmed = server.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

fn header_value(response: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

#[async_trait]
impl DocumentStore for RiakStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<StoredDocument, StoreError> {
        let response = self
            .get_with_failover(|server| Self::object_url(server, bucket, key))
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(StoreError::not_found(bucket, key)),
            status if !status.is_success() => return Err(Self::backend_error(response).await),
            _ => {}
        }

        let content_type = header_value(&response, CONTENT_TYPE)
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let etag = header_value(&response, ETAG).map(|e| e.trim_matches('"').to_string());
        let content_length = response.content_length();

        debug!("Riak: opened {}/{} ({:?} bytes)", bucket, key, content_length);
        Ok(StoredDocument {
            content_type,
            content_length,
            etag,
            body: response.bytes_stream().map_err(StoreError::from).boxed(),
        })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        body: ByteStream,
    ) -> Result<PutReceipt, StoreError> {
        let server = &self.servers[self.pick_server()];
        let counted = CountingStream::new(body);
        let written = counted.counter();

        let response = self
            .client
            .put(Self::object_url(server, bucket, key))
            .header(CLIENT_ID_HEADER, &self.client_id)
            .header(CONTENT_TYPE, content_type)
            .body(Body::wrap_stream(counted))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::backend_error(response).await);
        }

        let etag = header_value(&response, ETAG).map(|e| e.trim_matches('"').to_string());
        let size = written.load(Ordering::Relaxed) as u64;
        debug!("Riak: wrote {} bytes for {}/{} via {}", size, bucket, key, server);
        Ok(PutReceipt { size, etag })
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Bytes>, StoreError> {
        let response = self
            .get_with_failover(|server| {
                format!("{}/buckets/{}/keys?keys=true", server, urlencoding::encode(namespace))
            })
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Self::backend_error(response).await);
        }

        let mut listing: KeyListing = response.json().await?;
        listing.keys.sort();

        let mut values = Vec::with_capacity(listing.keys.len());
        for key in &listing.keys {
            match self.get(namespace, key).await {
                Ok(doc) => values.push(collect_stream(doc.body, MAX_LISTED_VALUE_SIZE).await?),
                // Listings are eventually consistent; a key can vanish in between.
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(values)
    }

    fn name(&self) -> &'static str {
        "riak"
    }
}

/// Pass-through stream that counts the bytes handed to the HTTP client
struct CountingStream {
    inner: ByteStream,
    count: std::sync::Arc<AtomicUsize>,
}

impl CountingStream {
    fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            count: std::sync::Arc::new(AtomicUsize::new(0)),
        }
    }

    fn counter(&self) -> std::sync::Arc<AtomicUsize> {
        self.count.clone()
    }
}

impl futures::Stream for CountingStream {
    type Item = Result<Bytes, StoreError>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let polled = self.inner.poll_next_unpin(cx);
        if let std::task::Poll::Ready(Some(Ok(chunk))) = &polled {
            self.count.fetch_add(chunk.len(), Ordering::Relaxed);
        }
        polled
    }
}
