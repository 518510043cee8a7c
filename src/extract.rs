//! Text extraction bridge
//!
//! Turns a stored document into `{text, meta}`. The heavy lifting is
//! delegated to an Apache Tika server when one is configured; otherwise only
//! documents that already are text can be extracted.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ExtractSettings;
use crate::error::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("no text extraction available for content type {0}")]
    Unsupported(String),

    #[error("document is not valid UTF-8 text: {0}")]
    Decode(#[from] std::string::FromUtf8Error),

    #[error("extraction service responded with status {status}: {message}")]
    Service { status: u16, message: String },

    #[error("extraction service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Text and metadata pulled out of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub text: String,
    pub meta: Map<String, Value>,
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, content_type: &str, document: Bytes) -> Result<Extraction, ExtractError>;

    fn name(&self) -> &'static str;
}

/// Extractor for documents that are text already
#[derive(Debug, Default, Clone)]
pub struct PlainTextExtractor;

impl PlainTextExtractor {
    fn handles(content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        essence.starts_with("text/") || essence == "application/json" || essence.ends_with("+json")
    }
}

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, content_type: &str, document: Bytes) -> Result<Extraction, ExtractError> {
        if !Self::handles(content_type) {
            return Err(ExtractError::Unsupported(content_type.to_string()));
        }

        let mut meta = Map::new();
        meta.insert("Content-Type".to_string(), Value::from(content_type));
        meta.insert("Content-Length".to_string(), Value::from(document.len()));
        let text = String::from_utf8(document.to_vec())?;
        Ok(Extraction { text, meta })
    }

    fn name(&self) -> &'static str {
        "plain"
    }
}

/// Extractor backed by a Tika server's `/tika` and `/meta` endpoints
pub struct TikaExtractor {
    client: Client,
    base_url: String,
}

impl TikaExtractor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ExtractError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn call(
        &self,
        endpoint: &str,
        accept: &str,
        content_type: &str,
        document: Bytes,
    ) -> Result<reqwest::Response, ExtractError> {
        let response = self
            .client
            .put(format!("{}/{}", self.base_url, endpoint))
            .header(ACCEPT, accept)
            .header(CONTENT_TYPE, content_type)
            .body(document)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ExtractError::Service {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl TextExtractor for TikaExtractor {
    async fn extract(&self, content_type: &str, document: Bytes) -> Result<Extraction, ExtractError> {
        let text = async {
            let response = self.call("tika", "text/plain", content_type, document.clone()).await?;
            Ok::<_, ExtractError>(response.text().await?)
        };
        let meta = async {
            let response = self
                .call("meta", "application/json", content_type, document.clone())
                .await?;
            Ok::<_, ExtractError>(response.json::<Map<String, Value>>().await?)
        };

        let (text, meta) = futures::try_join!(text, meta)?;
        debug!("Tika extracted {} characters, {} metadata fields", text.len(), meta.len());
        Ok(Extraction { text, meta })
    }

    fn name(&self) -> &'static str {
        "tika"
    }
}

/// Build the extractor selected by configuration
pub fn create_extractor(settings: &ExtractSettings) -> Result<Arc<dyn TextExtractor>, ExtractError> {
    match settings.tika_url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) => {
            info!("Using Tika text extraction at {}", url);
            Ok(Arc::new(TikaExtractor::new(
                url,
                Duration::from_secs(settings.timeout_secs),
            )?))
        }
        None => {
            info!("Using plain text extraction");
            Ok(Arc::new(PlainTextExtractor))
        }
    }
}
