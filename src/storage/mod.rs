//! Document Storage Layer Abstraction
//!
//! This module provides an abstraction over key-value document backends,
//! allowing the gateway to run against a Riak cluster, a local directory or
//! an in-process map without affecting the routing layer above it.
//!
//! Bodies move through the layer as byte streams in both directions so a
//! backend never needs to hold a whole document in memory.

pub mod config;
pub mod local_store;
pub mod memory_store;
pub mod riak_store;


use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::StoreError;

/// Stream of body chunks flowing to or from a backend
pub type ByteStream = BoxStream<'static, Result<Bytes, StoreError>>;

/// Content type used when neither the client nor the key says otherwise
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A document as returned by a backend, body not yet consumed
pub struct StoredDocument {
    /// Content type recorded when the document was written
    pub content_type: String,
    /// Body length when the backend knows it up front
    pub content_length: Option<u64>,
    /// Entity tag reported by the backend
    pub etag: Option<String>,
    pub body: ByteStream,
}

impl StoredDocument {
    /// Wrap an in-memory body
    pub fn from_bytes(content_type: impl Into<String>, data: Bytes, etag: Option<String>) -> Self {
        let len = data.len() as u64;
        Self {
            content_type: content_type.into(),
            content_length: Some(len),
            etag,
            body: stream::once(async move { Ok(data) }).boxed(),
        }
    }

    /// Drain the body into memory, failing once it grows past `limit` bytes
    pub async fn into_bytes(self, limit: usize) -> Result<Bytes, StoreError> {
        collect_stream(self.body, limit).await
    }
}

/// Acknowledgement of a completed write
#[derive(Debug, Clone, PartialEq)]
pub struct PutReceipt {
    /// Bytes written
    pub size: u64,
    pub etag: Option<String>,
}

/// Trait defining the document storage interface
///
/// Keys are always resolved by the caller: a backend never invents one.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Open a document for reading
    ///
    /// A missing document is reported as `StoreError::NotFound` before any
    /// body bytes are produced.
    async fn get(&self, bucket: &str, key: &str) -> Result<StoredDocument, StoreError>;

    /// Write a document, replacing any previous value under the same key
    ///
    /// An error item in `body` aborts the write and nothing becomes visible.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        body: ByteStream,
    ) -> Result<PutReceipt, StoreError>;

    /// Values stored under a namespace, ordered by key
    async fn list(&self, namespace: &str) -> Result<Vec<Bytes>, StoreError>;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

/// Collect a body stream into one buffer
pub async fn collect_stream(mut body: ByteStream, limit: usize) -> Result<Bytes, StoreError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if buffer.len() + chunk.len() > limit {
            return Err(StoreError::TooLarge { limit });
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

/// Content type for a document whose writer did not supply one
pub fn guess_content_type(key: &str) -> String {
    mime_guess::from_path(key)
        .first_raw()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type("report.pdf"), "application/pdf");
        assert_eq!(guess_content_type("notes.txt"), "text/plain");
        assert_eq!(guess_content_type("2b7c9a10-uuid"), DEFAULT_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_collect_stream_respects_limit() {
        let body: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ])
        .boxed();
        assert_eq!(collect_stream(body, 64).await.unwrap(), Bytes::from_static(b"hello world"));

        let body: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ])
        .boxed();
        assert!(matches!(
            collect_stream(body, 8).await,
            Err(StoreError::TooLarge { limit: 8 })
        ));
    }

    #[tokio::test]
    async fn test_collect_stream_propagates_errors() {
        let body: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(StoreError::Aborted("connection reset".into())),
        ])
        .boxed();
        assert!(matches!(collect_stream(body, 64).await, Err(StoreError::Aborted(_))));
    }

    #[tokio::test]
    async fn test_stored_document_from_bytes() {
        let doc = StoredDocument::from_bytes("text/plain", Bytes::from_static(b"abc"), None);
        assert_eq!(doc.content_length, Some(3));
        assert_eq!(doc.into_bytes(16).await.unwrap(), Bytes::from_static(b"abc"));
    }
}
