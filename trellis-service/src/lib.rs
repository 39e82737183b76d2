//! # trellis-service
//!
//! Web application platform built around four interlocking runtime
//! subsystems:
//!
//! - **Pipeline + router**: radix-tree route matching with path parameters
//!   and a composable middleware chain with short-circuit semantics
//! - **Streaming reverse proxy**: zero-copy body forwarding with
//!   per-upstream circuit breakers (closed / open / half-open, sliding
//!   window failure counting)
//! - **WebSocket channel layer**: in-memory pub/sub over named groups with
//!   partial-failure accounting
//! - **Task queue**: durable store with priority + scheduled claiming,
//!   exponential-backoff retries, and stale-lease recovery
//!
//! ## Example
//!
//! ```rust,no_run
//! use trellis_service::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let app = AppBuilder::new(config)?
//!         .middleware(RequestId)
//!         .middleware(RequestLogger)
//!         .route(Method::GET, "/users/:id", |ex: Arc<Exchange>| async move {
//!             let params = ex.attributes().get(PATH_PARAMS).unwrap();
//!             let id = params.get("id").unwrap_or("unknown").to_string();
//!             ex.response()
//!                 .send_text(StatusCode::OK, format!("User ID: {id}"))
//!                 .await
//!         })?
//!         .task("welcome-email", task_fn(|ctx: TaskContext| async move {
//!             tracing::info!(task_id = %ctx.task_id, "sending welcome email");
//!             Ok(serde_json::Value::Null)
//!         }))
//!         .build()?;
//!
//!     app.run().await
//! }
//! ```

#![warn(missing_docs)]

pub mod app;
pub mod auth;
pub mod channels;
pub mod config;
pub mod error;
pub mod exchange;
pub mod health;
pub mod middleware;
pub mod negotiation;
pub mod observability;
pub mod pipeline;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod tasks;
pub mod websocket;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::app::{App, AppBuilder, AppHandle, CHANNELS, DISPATCHER, PROXY};
    pub use crate::auth::{
        ApiKeyAuth, ApiKeySource, AuthMiddleware, AuthResult, AuthStrategy, BasicAuth,
        BearerAuth, Credentials, FormAuth, JwtCodec, Principal, PRINCIPAL,
    };
    pub use crate::channels::{ChannelLayer, SendOptions, SendResult};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::exchange::{
        AttrKey, Attributes, Cookie, Exchange, Request, Response, SameSite,
    };
    pub use crate::health::{health, readiness};
    pub use crate::middleware::{RequestId, RequestLogger};
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{middleware_fn, Handler, Middleware, Next, Pipeline};
    pub use crate::proxy::{
        BreakerRegistry, CircuitBreaker, CircuitState, ProxyClient, ProxyError, ProxyOptions,
    };
    pub use crate::routing::{PathParams, Router, PATH_PARAMS};
    pub use crate::tasks::{
        task_fn, EnqueueOptions, TaskContext, TaskDispatcher, TaskEvent, TaskEvents,
        TaskHandler, TaskPriority, TaskRecord, TaskRegistry, TaskStatus, TaskStore, TaskWorker,
    };
    pub use crate::websocket::{
        ChannelAwareHandler, SessionId, WebSocketHandler, WebSocketMessage, WebSocketSession,
        WsRouter,
    };

    #[cfg(feature = "database")]
    pub use crate::tasks::PgTaskStore;
    pub use crate::tasks::InMemoryTaskStore;

    pub use http::{Method, StatusCode};
    pub use std::sync::Arc;

    // Re-export the async runtime and utility crates handlers lean on
    pub use async_trait::async_trait;
    pub use serde::{Deserialize, Serialize};
    pub use tokio;
    pub use tracing::{debug, error, info, instrument, trace, warn};
}
