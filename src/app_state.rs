//! Application State Management
//!
//! This module provides the application state that contains all services
//! and their dependencies, following the dependency injection pattern.

use std::sync::Arc;
use log::info;

use crate::config::AppConfig;
use crate::error::StoreError;
use crate::extract::{create_extractor, PlainTextExtractor, TextExtractor};
use crate::service::document_service::DocumentService;
use crate::storage::config::{create_store, StorageConfig};
use crate::storage::memory_store::MemoryStore;
use crate::storage::DocumentStore;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to create document store: {0}")]
    Store(#[from] StoreError),

    #[error("failed to create text extractor: {0}")]
    Extractor(#[from] crate::extract::ExtractError),
}

/// Application state containing all services and their dependencies
#[derive(Clone)]
pub struct AppState {
    pub document_service: Arc<DocumentService>,
    pub config: AppConfig,
    /// Index of the worker process owning this state
    pub worker_index: usize,
}

impl AppState {
    /// Create application state from configuration for one worker
    pub fn from_config(config: AppConfig, worker_index: usize) -> Result<Self, StateError> {
        info!("Initializing application state for worker {}", worker_index);

        let storage = StorageConfig::for_worker(&config.store, worker_index);
        let store = create_store(config.store.backend, &storage, &config.data)?;
        let extractor = create_extractor(&config.extract)?;

        let state = Self::with_components(config, worker_index, store, extractor);
        info!("Application state initialized successfully");
        Ok(state)
    }

    /// Application state over an explicit store and extractor
    pub fn with_components(
        config: AppConfig,
        worker_index: usize,
        store: Arc<dyn DocumentStore>,
        extractor: Arc<dyn TextExtractor>,
    ) -> Self {
        let document_service = Arc::new(DocumentService::new(
            store,
            extractor,
            config.store.bucket.clone(),
            config.server.max_payload_size,
        ));
        Self {
            document_service,
            config,
            worker_index,
        }
    }

    /// Application state over the given store with default settings
    pub fn with_store(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_components(AppConfig::default(), 1, store, Arc::new(PlainTextExtractor))
    }

    /// Create application state for testing with an in-memory backend
    pub fn new_for_testing() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }
}
