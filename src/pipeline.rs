//! Streaming pipeline between client connections and storage backends
//!
//! Inbound, `RequestBody` pumps the client payload through a bounded channel
//! into the store, so a write never buffers the whole document. The first
//! non-empty chunk is awaited before the store is touched, which is how an
//! empty body is rejected up front.
//!
//! Outbound, `ResponsePipeline` pulls the first chunk from the backend before
//! any header is committed. Its phases:
//!
//! ```text
//! AwaitingFirstChunk --ok--> Streaming --end--> Finished
//!         |                      |
//!       error                  error
//!         v                      v
//!   InternalError response    Aborted (connection closed, status already sent)
//! ```
//!
//! Exactly one response leaves the pipeline whichever way it ends.

use std::pin::Pin;
use std::task::{Context, Poll};

use actix_web::body::SizedStream;
use actix_web::error::PayloadError;
use actix_web::http::header::{self, EntityTag};
use actix_web::HttpResponse;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, Stream, StreamExt};
use log::{debug, error, warn};

use crate::error::{DocumentError, StoreError};
use crate::storage::{ByteStream, StoredDocument};

/// Chunks buffered between the socket and the backend
const PIPE_DEPTH: usize = 8;

/// How the inbound pump finished
#[derive(Debug, Clone, PartialEq)]
pub enum PumpOutcome {
    /// Whole body delivered to the store
    Complete { bytes: u64 },
    /// Client payload failed, usually a disconnect
    ClientAborted(String),
    /// Body grew past the configured limit
    TooLarge { limit: usize },
    /// Store stopped reading before the body ended
    StoreClosed,
}

/// Client request body with its first chunk already received
pub struct RequestBody<S> {
    first: Bytes,
    rest: S,
    limit: usize,
}

impl<S> RequestBody<S>
where
    S: Stream<Item = Result<Bytes, PayloadError>> + Unpin,
{
    /// Wait for the first non-empty chunk of `payload`
    ///
    /// Returns `MissingParameter` when the client sent no bytes at all.
    pub async fn begin(mut payload: S, limit: usize) -> Result<Self, DocumentError> {
        while let Some(chunk) = payload.next().await {
            let chunk = chunk.map_err(|e| {
                warn!("Error reading request body: {}", e);
                DocumentError::InternalError(format!("error reading request body: {}", e))
            })?;
            if chunk.is_empty() {
                continue;
            }
            if chunk.len() > limit {
                return Err(DocumentError::InternalError(
                    StoreError::TooLarge { limit }.to_string(),
                ));
            }
            return Ok(Self {
                first: chunk,
                rest: payload,
                limit,
            });
        }
        Err(DocumentError::MissingParameter(
            "Supply a document in the request body".to_string(),
        ))
    }

    /// Split into the stream handed to the store and the pump that feeds it
    ///
    /// Both halves must be polled together; the pump stops as soon as the
    /// store drops its end.
    pub fn into_pipe(self) -> (ByteStream, impl std::future::Future<Output = PumpOutcome>) {
        let (mut tx, rx) = mpsc::channel::<Result<Bytes, StoreError>>(PIPE_DEPTH);
        let Self { first, mut rest, limit } = self;

        let pump = async move {
            let mut received = first.len();
            if tx.send(Ok(first)).await.is_err() {
                return PumpOutcome::StoreClosed;
            }

            while let Some(chunk) = rest.next().await {
                match chunk {
                    Ok(chunk) => {
                        received += chunk.len();
                        if received > limit {
                            let _ = tx.send(Err(StoreError::TooLarge { limit })).await;
                            return PumpOutcome::TooLarge { limit };
                        }
                        if tx.send(Ok(chunk)).await.is_err() {
                            return PumpOutcome::StoreClosed;
                        }
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        let _ = tx.send(Err(StoreError::Aborted(reason.clone()))).await;
                        return PumpOutcome::ClientAborted(reason);
                    }
                }
            }
            PumpOutcome::Complete {
                bytes: received as u64,
            }
        };

        (rx.boxed(), pump)
    }
}

/// Phase of an outbound document stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingFirstChunk,
    Streaming,
    Finished,
    Aborted,
}

/// Outbound half: backend stream to HTTP response
pub struct ResponsePipeline {
    body: ByteStream,
    pending: Option<Bytes>,
    phase: Phase,
    sent: u64,
    label: String,
}

impl ResponsePipeline {
    pub fn new(body: ByteStream, label: impl Into<String>) -> Self {
        Self {
            body,
            pending: None,
            phase: Phase::AwaitingFirstChunk,
            sent: 0,
            label: label.into(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Pull the first chunk; errors here still become a proper error response
    pub async fn prime(&mut self) -> Result<(), DocumentError> {
        match self.body.next().await {
            Some(Ok(chunk)) => {
                self.pending = Some(chunk);
                self.phase = Phase::Streaming;
                Ok(())
            }
            Some(Err(e)) => {
                error!("Reading {} failed before headers were sent: {}", self.label, e);
                self.phase = Phase::Aborted;
                Err(e.into())
            }
            None => {
                self.phase = Phase::Finished;
                Ok(())
            }
        }
    }

    /// Build the success response around a primed pipeline
    pub fn into_response(self, document_type: &str, length: Option<u64>, etag: Option<&str>) -> HttpResponse {
        let mut builder = HttpResponse::Ok();
        builder.insert_header((header::CONTENT_TYPE, document_type.to_string()));
        if let Some(tag) = etag {
            builder.insert_header(header::ETag(EntityTag::new_strong(tag.to_string())));
        }
        match length {
            Some(length) => builder.body(SizedStream::new(length, self)),
            None => builder.streaming(self),
        }
    }

    /// Open `document` for streaming, mapping pre-header failures to errors
    pub async fn respond(document: StoredDocument, label: impl Into<String>) -> Result<HttpResponse, DocumentError> {
        let StoredDocument {
            content_type,
            content_length,
            etag,
            body,
        } = document;

        let mut pipeline = Self::new(body, label);
        pipeline.prime().await?;
        Ok(pipeline.into_response(&content_type, content_length, etag.as_deref()))
    }
}

impl Stream for ResponsePipeline {
    type Item = Result<Bytes, StoreError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(chunk) = this.pending.take() {
            this.sent += chunk.len() as u64;
            return Poll::Ready(Some(Ok(chunk)));
        }

        match this.phase {
            Phase::Finished | Phase::Aborted => return Poll::Ready(None),
            Phase::AwaitingFirstChunk => this.phase = Phase::Streaming,
            Phase::Streaming => {}
        }

        match this.body.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Status is already on the wire; closing the connection is all that is left.
                error!(
                    "Stream for {} failed after {} bytes were sent: {}",
                    this.label, this.sent, e
                );
                this.phase = Phase::Aborted;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                debug!("Finished streaming {} ({} bytes)", this.label, this.sent);
                this.phase = Phase::Finished;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::{to_bytes, MessageBody};
    use actix_web::http::StatusCode;
    use futures::stream;

    fn payload(
        parts: Vec<Result<&'static str, PayloadError>>,
    ) -> impl Stream<Item = Result<Bytes, PayloadError>> + Unpin {
        stream::iter(parts.into_iter().map(|p| p.map(|s| Bytes::from_static(s.as_bytes()))))
    }

    #[tokio::test]
    async fn test_empty_body_is_missing_parameter() {
        let err = RequestBody::begin(payload(vec![]), 1024).await.err().unwrap();
        assert_eq!(err.code(), "MissingParameter");

        let err = RequestBody::begin(payload(vec![Ok(""), Ok("")]), 1024)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "MissingParameter");
    }

    #[tokio::test]
    async fn test_pipe_delivers_whole_body() {
        let body = RequestBody::begin(payload(vec![Ok(""), Ok("abc"), Ok("def")]), 1024)
            .await
            .unwrap();
        let (stream, pump) = body.into_pipe();
        let (outcome, collected) = futures::join!(pump, crate::storage::collect_stream(stream, 1024));

        assert_eq!(outcome, PumpOutcome::Complete { bytes: 6 });
        assert_eq!(collected.unwrap(), Bytes::from_static(b"abcdef"));
    }

    #[tokio::test]
    async fn test_pipe_forwards_client_abort() {
        let body = RequestBody::begin(
            payload(vec![Ok("abc"), Err(PayloadError::Incomplete(None))]),
            1024,
        )
        .await
        .unwrap();
        let (stream, pump) = body.into_pipe();
        let (outcome, collected) = futures::join!(pump, crate::storage::collect_stream(stream, 1024));

        assert!(matches!(outcome, PumpOutcome::ClientAborted(_)));
        assert!(matches!(collected, Err(StoreError::Aborted(_))));
    }

    #[tokio::test]
    async fn test_pipe_enforces_limit() {
        let body = RequestBody::begin(payload(vec![Ok("abc"), Ok("defgh")]), 6)
            .await
            .unwrap();
        let (stream, pump) = body.into_pipe();
        let (outcome, collected) = futures::join!(pump, crate::storage::collect_stream(stream, 1024));

        assert_eq!(outcome, PumpOutcome::TooLarge { limit: 6 });
        assert!(matches!(collected, Err(StoreError::TooLarge { limit: 6 })));
    }

    #[tokio::test]
    async fn test_pipe_stops_when_store_gives_up() {
        let body = RequestBody::begin(payload(vec![Ok("abc"), Ok("def"), Ok("ghi")]), 1024)
            .await
            .unwrap();
        let (stream, pump) = body.into_pipe();
        drop(stream);
        assert_eq!(pump.await, PumpOutcome::StoreClosed);
    }

    #[actix_web::test]
    async fn test_error_before_headers_becomes_internal_error() {
        let body: ByteStream = stream::iter(vec![Err(StoreError::Aborted("backend reset".into()))]).boxed();
        let doc = StoredDocument {
            content_type: "text/plain".into(),
            content_length: None,
            etag: None,
            body,
        };
        let err = ResponsePipeline::respond(doc, "docs/k").await.err().unwrap();
        assert_eq!(err.code(), "InternalError");
    }

    #[actix_web::test]
    async fn test_error_after_headers_truncates_body() {
        let body: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"first")),
            Err(StoreError::Aborted("backend reset".into())),
        ])
        .boxed();
        let mut pipeline = ResponsePipeline::new(body, "docs/k");
        pipeline.prime().await.unwrap();
        assert_eq!(pipeline.phase(), Phase::Streaming);

        let resp = pipeline.into_response("text/plain", None, None);
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(to_bytes(resp.into_body()).await.is_err());
    }

    #[actix_web::test]
    async fn test_successful_stream_keeps_headers() {
        let doc = StoredDocument {
            content_type: "application/pdf".into(),
            content_length: Some(10),
            etag: Some("abc123".into()),
            body: stream::iter(vec![
                Ok(Bytes::from_static(b"%PDF-")),
                Ok(Bytes::from_static(b"1.4\n\0")),
            ])
            .boxed(),
        };
        let resp = ResponsePipeline::respond(doc, "docs/paper").await.unwrap();
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "application/pdf");
        assert_eq!(resp.headers().get(header::ETAG).unwrap(), "\"abc123\"");

        let body = resp.into_body();
        assert_eq!(body.size(), actix_web::body::BodySize::Sized(10));
        assert_eq!(to_bytes(body).await.unwrap(), Bytes::from_static(b"%PDF-1.4\n\0"));
    }

    #[actix_web::test]
    async fn test_empty_document() {
        let doc = StoredDocument::from_bytes("text/plain", Bytes::new(), None);
        let mut pipeline = ResponsePipeline::new(doc.body, "docs/empty");
        pipeline.prime().await.unwrap();
        // An empty chunk is still a chunk; the stream ends right after it.
        let resp = pipeline.into_response("text/plain", Some(0), None);
        assert!(to_bytes(resp.into_body()).await.unwrap().is_empty());
    }
}
