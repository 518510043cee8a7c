//! HTTP routes of the document gateway
//!
//! | Method | Path              | Handler                 |
//! |--------|-------------------|-------------------------|
//! | GET    | `/document/{key}` | `get_document`          |
//! | GET    | `/document`       | `missing_key` (400)     |
//! | PUT    | `/document`       | `put_document`          |
//! | PUT    | `/document/{key}` | `put_document_with_key` |
//!
//! Anything else reaches `route_not_found`, whose plain-text body is
//! deliberately different from the structured `ResourceNotFound` error.

use actix_web::{get, put, web, HttpRequest, HttpResponse};
use log::debug;

use crate::app_state::AppState;
use crate::error::DocumentError;
use crate::service::document_context::DocumentQuery;
use crate::service::{get_service, put_service};

#[get("/document/{key}")]
pub async fn get_document(
    path: web::Path<String>,
    query: web::Query<DocumentQuery>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, DocumentError> {
    get_service(path.into_inner(), query.into_inner(), app_state).await
}

#[get("/document")]
pub async fn missing_key() -> Result<HttpResponse, DocumentError> {
    Err(DocumentError::MissingParameter(
        "Supply a document key: GET /document/{key}".to_string(),
    ))
}

#[put("/document")]
pub async fn put_document(
    query: web::Query<DocumentQuery>,
    payload: web::Payload,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, DocumentError> {
    put_service(None, query.into_inner(), payload, req, app_state).await
}

#[put("/document/{key}")]
pub async fn put_document_with_key(
    path: web::Path<String>,
    query: web::Query<DocumentQuery>,
    payload: web::Payload,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, DocumentError> {
    put_service(Some(path.into_inner()), query.into_inner(), payload, req, app_state).await
}

pub async fn route_not_found(req: HttpRequest) -> HttpResponse {
    debug!("No route for {} {}", req.method(), req.path());
    HttpResponse::NotFound()
        .content_type("text/plain; charset=utf-8")
        .body(format!("Route '{}' was not found", req.path()))
}

/// Register every document route plus the catch-all
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(get_document)
        .service(missing_key)
        .service(put_document)
        .service(put_document_with_key)
        .default_service(web::to(route_not_found));
}
