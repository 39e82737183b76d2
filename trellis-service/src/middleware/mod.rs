//! Framework-provided middlewares
//!
//! Request ID stamping and request logging. Authentication middleware lives
//! in [`crate::auth`].

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::exchange::{AttrKey, Exchange};
use crate::pipeline::{Middleware, Next};

/// Attribute key carrying the request ID
pub const REQUEST_ID: AttrKey<String> = AttrKey::new("trellis.request_id");

/// Header used to accept and emit request IDs
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Stamps each exchange with a request ID
///
/// An incoming `x-request-id` is propagated; otherwise a UUID is generated.
/// The ID is stored in the attribute bag and echoed on the response.
#[derive(Debug, Default)]
pub struct RequestId;

#[async_trait]
impl Middleware for RequestId {
    async fn handle(&self, exchange: Arc<Exchange>, next: Next) -> Result<()> {
        let id = exchange
            .request()
            .header(REQUEST_ID_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        exchange.attributes().insert(REQUEST_ID, id.clone());
        exchange.response().insert_header(REQUEST_ID_HEADER, &id)?;

        next.run(exchange).await
    }
}

/// Logs one line per request with method, path, status, and duration
#[derive(Debug, Default)]
pub struct RequestLogger;

#[async_trait]
impl Middleware for RequestLogger {
    async fn handle(&self, exchange: Arc<Exchange>, next: Next) -> Result<()> {
        let method = exchange.request().method().clone();
        let path = exchange.request().path().to_string();
        let started = Instant::now();

        let result = next.run(Arc::clone(&exchange)).await;

        let elapsed = started.elapsed();
        let status = exchange.response().status();
        match &result {
            Ok(()) => {
                tracing::info!(
                    method = %method,
                    path = %path,
                    status = status.as_u16(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "request completed"
                );
            }
            Err(e) => {
                tracing::warn!(
                    method = %method,
                    path = %path,
                    error = %e,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "request failed"
                );
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testing;
    use crate::pipeline::Pipeline;
    use http::StatusCode;

    fn echo_terminal() -> Arc<dyn crate::pipeline::Handler> {
        Arc::new(|ex: Arc<Exchange>| async move {
            ex.response().send_text(StatusCode::OK, "ok").await
        })
    }

    #[tokio::test]
    async fn test_request_id_generated() {
        let pipeline = Pipeline::builder().with(RequestId).build();
        let (ex, sink) = testing::get("/");
        pipeline
            .execute(Arc::clone(&ex), echo_terminal())
            .await
            .unwrap();

        let id = ex.attributes().get(REQUEST_ID).unwrap();
        let (_, headers, _) = sink.collect().await.unwrap();
        assert_eq!(headers.get(REQUEST_ID_HEADER).unwrap(), id.as_str());
    }

    #[tokio::test]
    async fn test_request_id_propagated() {
        let pipeline = Pipeline::builder().with(RequestId).build();
        let (ex, _sink) = testing::exchange(
            http::Request::get("/")
                .header(REQUEST_ID_HEADER, "req-42")
                .body(bytes::Bytes::new())
                .unwrap(),
        );
        pipeline
            .execute(Arc::clone(&ex), echo_terminal())
            .await
            .unwrap();
        assert_eq!(ex.attributes().get(REQUEST_ID).unwrap(), "req-42");
    }

    #[tokio::test]
    async fn test_logger_passes_through() {
        let pipeline = Pipeline::builder().with(RequestLogger).build();
        let (ex, sink) = testing::get("/logged");
        pipeline.execute(ex, echo_terminal()).await.unwrap();
        let (status, _, body) = sink.collect().await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, bytes::Bytes::from("ok"));
    }
}
