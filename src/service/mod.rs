//service/mod.rs
pub mod document_context;
pub mod document_service;

use std::future::Future;
use std::pin::pin;

use actix_web::http::header::CONTENT_TYPE;
use actix_web::{web, HttpRequest, HttpResponse};
use futures::future::poll_fn;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::error::DocumentError;
use crate::keygen::generate_key;
use crate::pipeline::{PumpOutcome, RequestBody, ResponsePipeline};
use crate::service::document_context::{DocumentContext, DocumentQuery};
use crate::storage::guess_content_type;

/// Body returned for a successful store
#[derive(Debug, Serialize, Deserialize)]
pub struct StoreResponse {
    pub key: String,
    pub message: String,
}

/// `bucket` and `key` MDC entries for one request
///
/// The entries are thread-local and actix interleaves requests on a thread,
/// so they are set only while the request's own future is being polled.
struct LogScope {
    bucket: String,
    key: String,
}

impl LogScope {
    fn new(context: &DocumentContext) -> Self {
        Self {
            bucket: context.bucket.clone(),
            key: context.key.clone(),
        }
    }

    fn enter(&self) -> log_mdc::ExtendGuard {
        log_mdc::extend_scoped([("bucket", self.bucket.as_str()), ("key", self.key.as_str())])
    }

    async fn run<F: Future>(self, future: F) -> F::Output {
        let mut future = pin!(future);
        poll_fn(|cx| {
            let _entered = self.enter();
            future.as_mut().poll(cx)
        })
        .await
    }
}

fn context_handler(key: Option<String>, query: &DocumentQuery, app_state: &AppState) -> DocumentContext {
    let default_bucket = app_state.document_service.default_bucket();
    match key {
        Some(key) => DocumentContext::new(query.bucket.as_deref(), default_bucket, key),
        None => DocumentContext::with_generated_key(query.bucket.as_deref(), default_bucket, generate_key()),
    }
}

/// Content type recorded for an upload: the client's header, else a guess from the key
fn content_type_handler(req: &HttpRequest, key: &str) -> String {
    req.headers()
        .get(CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|ct| !ct.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| guess_content_type(key))
}

pub async fn get_service(
    key: String,
    query: DocumentQuery,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, DocumentError> {
    if key.trim().is_empty() {
        return Err(DocumentError::MissingParameter("Supply a document key".to_string()));
    }
    let context = context_handler(Some(key), &query, &app_state);
    LogScope::new(&context)
        .run(fetch_document(context, query, app_state))
        .await
}

async fn fetch_document(
    context: DocumentContext,
    query: DocumentQuery,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, DocumentError> {
    let service = &app_state.document_service;

    if query.wants_extraction() {
        debug!("GET with extraction for {}", context.label());
        let extraction = service.extract(&context).await?;
        return Ok(HttpResponse::Ok().json(extraction));
    }

    debug!("GET service called for {}", context.label());
    let document = service.fetch(&context).await?;
    ResponsePipeline::respond(document, context.label()).await
}

pub async fn put_service(
    key: Option<String>,
    query: DocumentQuery,
    payload: web::Payload,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, DocumentError> {
    if matches!(&key, Some(k) if k.trim().is_empty()) {
        return Err(DocumentError::MissingParameter("Supply a document key".to_string()));
    }
    let context = context_handler(key, &query, &app_state);
    LogScope::new(&context)
        .run(store_document(context, payload, req, app_state))
        .await
}

async fn store_document(
    context: DocumentContext,
    payload: web::Payload,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, DocumentError> {
    let content_type = content_type_handler(&req, &context.key);
    let service = &app_state.document_service;
    debug!(
        "PUT service called for {} ({}, generated key: {})",
        context.label(),
        content_type,
        context.generated
    );

    // Nothing reaches the store until the client has sent at least one byte.
    let body = RequestBody::begin(payload, service.max_payload_size()).await?;
    let (stream, pump) = body.into_pipe();
    let (outcome, stored) = futures::join!(pump, service.store(&context, &content_type, stream));

    match outcome {
        PumpOutcome::TooLarge { limit } => {
            warn!("Upload for {} exceeded {} bytes", context.label(), limit);
            return Err(DocumentError::InternalError(format!(
                "document exceeds {} bytes",
                limit
            )));
        }
        PumpOutcome::ClientAborted(reason) => {
            warn!("Client aborted upload for {}: {}", context.label(), reason);
            return Err(DocumentError::InternalError(format!(
                "upload aborted: {}",
                reason
            )));
        }
        PumpOutcome::Complete { .. } | PumpOutcome::StoreClosed => {}
    }

    let receipt = stored?;
    info!("Document {} added ({} bytes)", context.label(), receipt.size);
    Ok(HttpResponse::Ok().json(StoreResponse {
        key: context.key,
        message: "document added".to_string(),
    }))
}
