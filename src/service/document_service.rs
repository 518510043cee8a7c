//! Document service layer that provides a clean interface to the storage abstraction

use std::sync::Arc;

use log::{debug, error, info};

use crate::error::DocumentError;
use crate::extract::{Extraction, TextExtractor};
use crate::service::document_context::DocumentContext;
use crate::storage::{ByteStream, DocumentStore, PutReceipt, StoredDocument};

/// Document operations on top of an injected store and extractor
pub struct DocumentService {
    store: Arc<dyn DocumentStore>,
    extractor: Arc<dyn TextExtractor>,
    default_bucket: String,
    max_payload_size: usize,
}

impl DocumentService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        extractor: Arc<dyn TextExtractor>,
        default_bucket: impl Into<String>,
        max_payload_size: usize,
    ) -> Self {
        Self {
            store,
            extractor,
            default_bucket: default_bucket.into(),
            max_payload_size,
        }
    }

    pub fn default_bucket(&self) -> &str {
        &self.default_bucket
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    pub fn store_backend(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Open a document for streaming
    pub async fn fetch(&self, context: &DocumentContext) -> Result<StoredDocument, DocumentError> {
        match self.store.get(&context.bucket, &context.key).await {
            Ok(document) => Ok(document),
            Err(e) if e.is_not_found() => {
                info!("Document {} not found", context.label());
                Err(e.into())
            }
            Err(e) => {
                error!("Failed to read {} from {}: {}", context.label(), self.store.name(), e);
                Err(e.into())
            }
        }
    }

    /// Write a document body under an already resolved key
    pub async fn store(
        &self,
        context: &DocumentContext,
        content_type: &str,
        body: ByteStream,
    ) -> Result<PutReceipt, DocumentError> {
        let receipt = self
            .store
            .put(&context.bucket, &context.key, content_type, body)
            .await
            .map_err(|e| {
                error!("Failed to write {} to {}: {}", context.label(), self.store.name(), e);
                DocumentError::from(e)
            })?;
        debug!(
            "Stored {} ({} bytes, {}) in {}",
            context.label(),
            receipt.size,
            content_type,
            self.store.name()
        );
        Ok(receipt)
    }

    /// Fetch a document whole and run it through the extractor
    pub async fn extract(&self, context: &DocumentContext) -> Result<Extraction, DocumentError> {
        let document = self.fetch(context).await?;
        let content_type = document.content_type.clone();
        let data = document
            .into_bytes(self.max_payload_size)
            .await
            .map_err(|e| {
                error!("Failed to buffer {} for extraction: {}", context.label(), e);
                DocumentError::from(e)
            })?;

        self.extractor
            .extract(&content_type, data)
            .await
            .map_err(|e| {
                error!(
                    "{} extraction failed for {}: {}",
                    self.extractor.name(),
                    context.label(),
                    e
                );
                DocumentError::from(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::PlainTextExtractor;
    use crate::storage::memory_store::MemoryStore;
    use bytes::Bytes;
    use futures::stream::{self, StreamExt};

    fn service(limit: usize) -> DocumentService {
        DocumentService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(PlainTextExtractor),
            "documents",
            limit,
        )
    }

    fn body(data: &'static [u8]) -> ByteStream {
        stream::once(async move { Ok(Bytes::from_static(data)) }).boxed()
    }

    #[tokio::test]
    async fn test_store_then_fetch() {
        let service = service(1024);
        let context = DocumentContext::new(None, service.default_bucket(), "k".into());
        service.store(&context, "text/plain", body(b"hello")).await.unwrap();

        let document = service.fetch(&context).await.unwrap();
        assert_eq!(document.content_type, "text/plain");
        assert_eq!(document.into_bytes(1024).await.unwrap(), Bytes::from_static(b"hello"));
        assert!(service.store_backend().get("documents", "k").await.is_ok());
    }

    #[tokio::test]
    async fn test_fetch_missing_is_resource_not_found() {
        let service = service(1024);
        let context = DocumentContext::new(Some("b"), service.default_bucket(), "nope".into());
        let err = service.fetch(&context).await.err().unwrap();
        assert_eq!(err.code(), "ResourceNotFound");
    }

    #[tokio::test]
    async fn test_extract() {
        let service = service(1024);
        let context = DocumentContext::new(None, service.default_bucket(), "notes".into());
        service.store(&context, "text/plain", body(b"some notes")).await.unwrap();
        let extraction = service.extract(&context).await.unwrap();
        assert_eq!(extraction.text, "some notes");

        let pdf = DocumentContext::new(None, service.default_bucket(), "pdf".into());
        service.store(&pdf, "application/pdf", body(b"%PDF-1.4")).await.unwrap();
        assert_eq!(service.extract(&pdf).await.err().unwrap().code(), "InternalError");

        let missing = DocumentContext::new(None, service.default_bucket(), "missing".into());
        assert_eq!(service.extract(&missing).await.err().unwrap().code(), "ResourceNotFound");
    }

    #[tokio::test]
    async fn test_extract_respects_payload_limit() {
        let service = service(4);
        let context = DocumentContext::new(None, service.default_bucket(), "big".into());
        service.store(&context, "text/plain", body(b"longer than four")).await.unwrap();
        assert_eq!(service.extract(&context).await.err().unwrap().code(), "InternalError");
    }
}
