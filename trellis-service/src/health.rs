//! Health and readiness handlers
//!
//! Register them like any route:
//!
//! ```rust,no_run
//! # use trellis_service::prelude::*;
//! # fn build(builder: AppBuilder) -> Result<AppBuilder> {
//! builder.route(Method::GET, "/health", trellis_service::health::health)
//! # }
//! ```

use std::sync::Arc;

use http::StatusCode;
use serde::Serialize;

use crate::error::Result;
use crate::exchange::Exchange;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Liveness probe: always 200 while the process serves requests
pub async fn health(exchange: Arc<Exchange>) -> Result<()> {
    exchange
        .response()
        .send_json(StatusCode::OK, &HealthResponse { status: "ok" })
        .await
}

/// Readiness probe
///
/// The server answers once routing is live; embedders needing dependency
/// checks wrap this with their own handler.
pub async fn readiness(exchange: Arc<Exchange>) -> Result<()> {
    exchange
        .response()
        .send_json(StatusCode::OK, &HealthResponse { status: "ready" })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testing;

    #[tokio::test]
    async fn test_health_shape() {
        let (ex, sink) = testing::get("/health");
        health(ex).await.unwrap();

        let (status, headers, body) = sink.collect().await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers.get(http::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(&body[..], br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_readiness_shape() {
        let (ex, sink) = testing::get("/ready");
        readiness(ex).await.unwrap();
        let (status, _, body) = sink.collect().await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], br#"{"status":"ready"}"#);
    }
}
