//! In-memory implementation of DocumentStore, used by tests and `backend: memory`

use crate::error::StoreError;
use crate::storage::{collect_stream, ByteStream, DocumentStore, PutReceipt, StoredDocument};
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
struct MemoryDocument {
    content_type: String,
    data: Bytes,
    etag: String,
}

type Buckets = HashMap<String, BTreeMap<String, MemoryDocument>>;

/// In-memory document store
pub struct MemoryStore {
    // bucket -> key -> document
    data: Arc<Mutex<Buckets>>,
    max_document_size: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Store that refuses documents larger than `max_document_size`
    pub fn with_limit(max_document_size: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            max_document_size,
        }
    }

    fn buckets(&self) -> MutexGuard<'_, Buckets> {
        // The map holds no invariant a panicking writer could break halfway.
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of documents in a bucket
    pub fn document_count(&self, bucket: &str) -> usize {
        self.buckets().get(bucket).map(|docs| docs.len()).unwrap_or(0)
    }

    /// Check if a document exists
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.buckets()
            .get(bucket)
            .map(|docs| docs.contains_key(key))
            .unwrap_or(false)
    }

    /// Remove every document
    pub fn clear(&self) {
        self.buckets().clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<StoredDocument, StoreError> {
        let document = self
            .buckets()
            .get(bucket)
            .and_then(|docs| docs.get(key))
            .cloned()
            .ok_or_else(|| StoreError::not_found(bucket, key))?;

        debug!("Memory: read {} bytes for {}/{}", document.data.len(), bucket, key);
        Ok(StoredDocument::from_bytes(
            document.content_type,
            document.data,
            Some(document.etag),
        ))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        body: ByteStream,
    ) -> Result<PutReceipt, StoreError> {
        // Nothing is inserted until the whole body has arrived.
        let data = collect_stream(body, self.max_document_size).await?;
        let etag = hex::encode(md5::compute(&data).0);
        let size = data.len() as u64;

        self.buckets().entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            MemoryDocument {
                content_type: content_type.to_string(),
                data,
                etag: etag.clone(),
            },
        );

        debug!("Memory: wrote {} bytes for {}/{}", size, bucket, key);
        Ok(PutReceipt {
            size,
            etag: Some(etag),
        })
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Bytes>, StoreError> {
        Ok(self
            .buckets()
            .get(namespace)
            .map(|docs| docs.values().map(|doc| doc.data.clone()).collect())
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::{self, StreamExt};

    fn body(parts: &[&'static [u8]]) -> ByteStream {
        stream::iter(parts.iter().map(|p| Ok(Bytes::from_static(p))).collect::<Vec<_>>()).boxed()
    }

    #[tokio::test]
    async fn test_memory_store_basic_operations() {
        let store = MemoryStore::new();
        assert_eq!(store.document_count("docs"), 0);
        assert!(!store.contains("docs", "a"));

        let receipt = store
            .put("docs", "a", "text/plain", body(&[b"Hello, ", b"Memory!"]))
            .await
            .unwrap();
        assert_eq!(receipt.size, 14);
        assert!(store.contains("docs", "a"));

        let doc = store.get("docs", "a").await.unwrap();
        assert_eq!(doc.content_type, "text/plain");
        assert_eq!(doc.etag, receipt.etag);
        assert_eq!(doc.into_bytes(1024).await.unwrap(), Bytes::from_static(b"Hello, Memory!"));
    }

    #[tokio::test]
    async fn test_memory_store_error_cases() {
        let store = MemoryStore::new();
        let err = store.get("docs", "missing").await.err().unwrap();
        assert!(err.is_not_found());

        let aborted: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(StoreError::Aborted("client disconnected".into())),
        ])
        .boxed();
        assert!(store.put("docs", "a", "text/plain", aborted).await.is_err());
        assert!(!store.contains("docs", "a"));

        let small = MemoryStore::with_limit(4);
        assert!(matches!(
            small.put("docs", "a", "text/plain", body(&[b"too long"])).await,
            Err(StoreError::TooLarge { limit: 4 })
        ));
    }

    #[tokio::test]
    async fn test_memory_store_list_is_ordered_by_key() {
        let store = MemoryStore::new();
        store.put("ns", "b", "text/plain", body(&[b"second"])).await.unwrap();
        store.put("ns", "a", "text/plain", body(&[b"first"])).await.unwrap();
        store.put("other", "c", "text/plain", body(&[b"elsewhere"])).await.unwrap();

        let values = store.list("ns").await.unwrap();
        assert_eq!(values, vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);
        assert!(store.list("empty").await.unwrap().is_empty());

        store.clear();
        assert_eq!(store.document_count("ns"), 0);
    }
}
