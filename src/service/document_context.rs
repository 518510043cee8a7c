//! Per-request addressing for document operations

use serde::{Deserialize, Serialize};

/// Query string accepted by every document route
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentQuery {
    pub bucket: Option<String>,
    pub extract: Option<String>,
}

impl DocumentQuery {
    /// `extract` is on when present with any value but `false` or `0`
    pub fn wants_extraction(&self) -> bool {
        match self.extract.as_deref() {
            None => false,
            Some(value) => !matches!(value.trim().to_ascii_lowercase().as_str(), "false" | "0"),
        }
    }
}

/// Resolved bucket and key of one request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentContext {
    pub bucket: String,
    pub key: String,
    /// Whether the key was generated for this request
    pub generated: bool,
}

impl DocumentContext {
    /// Context for a caller-supplied key, falling back to `default_bucket`
    pub fn new(bucket: Option<&str>, default_bucket: &str, key: String) -> Self {
        Self {
            bucket: resolve_bucket(bucket, default_bucket),
            key,
            generated: false,
        }
    }

    pub fn with_generated_key(bucket: Option<&str>, default_bucket: &str, key: String) -> Self {
        Self {
            generated: true,
            ..Self::new(bucket, default_bucket, key)
        }
    }

    /// Label used in logs
    pub fn label(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }
}

fn resolve_bucket(requested: Option<&str>, default_bucket: &str) -> String {
    match requested.map(str::trim) {
        Some(bucket) if !bucket.is_empty() => bucket.to_string(),
        _ => default_bucket.to_string(),
    }
}
