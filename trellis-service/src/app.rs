//! Application assembly
//!
//! [`AppBuilder`] wires the runtime objects together: router, pipeline,
//! WebSocket routes, channel layer, breaker registry, proxy client, and the
//! task queue. Nothing lives in process-wide statics; handlers reach the
//! services either through captured handles or through the well-known
//! attribute keys attached to every exchange and session.

use std::sync::Arc;
use std::time::Duration;

use http::Method;
use tokio_util::sync::CancellationToken;

use crate::channels::ChannelLayer;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::exchange::AttrKey;
use crate::pipeline::{Handler, Middleware, Pipeline, PipelineBuilder};
use crate::proxy::{BreakerConfig, BreakerRegistry, ProxyClient, ProxyConfig};
use crate::routing::Router;
use crate::server::{shutdown_signal, Server, ServerContext, Services};
use crate::tasks::{
    InMemoryTaskStore, TaskDispatcher, TaskEvents, TaskHandler, TaskRegistry, TaskStore,
    TaskWorker,
};
use crate::websocket::{WebSocketHandler, WsRouter};

/// Attribute key carrying the channel layer handle
pub const CHANNELS: AttrKey<Arc<ChannelLayer>> = AttrKey::new("trellis.channels");

/// Attribute key carrying the proxy client handle
pub const PROXY: AttrKey<Arc<ProxyClient>> = AttrKey::new("trellis.proxy");

/// Attribute key carrying the task dispatcher
pub const DISPATCHER: AttrKey<TaskDispatcher> = AttrKey::new("trellis.dispatcher");

/// Builder for an [`App`]
///
/// The shared services exist as soon as the builder does, so route closures
/// can capture their handles directly.
pub struct AppBuilder {
    config: Config,
    router: Router,
    pipeline: PipelineBuilder,
    ws_routes: WsRouter,
    registry: TaskRegistry,
    store: Option<Arc<dyn TaskStore>>,
    channels: Arc<ChannelLayer>,
    breakers: Arc<BreakerRegistry>,
    proxy: Arc<ProxyClient>,
    events: TaskEvents,
}

impl AppBuilder {
    /// Start building from configuration
    pub fn new(config: Config) -> Result<Self> {
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::from(
            &config.proxy.breaker,
        )));
        let proxy = Arc::new(ProxyClient::new(
            ProxyConfig::from(&config.proxy),
            Arc::clone(&breakers),
        )?);

        Ok(Self {
            config,
            router: Router::new(),
            pipeline: Pipeline::builder(),
            ws_routes: WsRouter::new(),
            registry: TaskRegistry::new(),
            store: None,
            channels: Arc::new(ChannelLayer::new()),
            breakers,
            proxy,
            events: TaskEvents::default(),
        })
    }

    /// Channel layer handle, for capture in handlers
    pub fn channels(&self) -> Arc<ChannelLayer> {
        Arc::clone(&self.channels)
    }

    /// Proxy client handle, for capture in handlers
    pub fn proxy(&self) -> Arc<ProxyClient> {
        Arc::clone(&self.proxy)
    }

    /// Breaker registry handle
    pub fn breakers(&self) -> Arc<BreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    /// Register an HTTP route
    pub fn route(mut self, method: Method, pattern: &str, handler: impl Handler) -> Result<Self> {
        self.router.route(method, pattern, handler)?;
        Ok(self)
    }

    /// Append a middleware to the pipeline
    #[must_use]
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.pipeline = self.pipeline.with(middleware);
        self
    }

    /// Register a WebSocket route
    pub fn ws_route(mut self, pattern: &str, handler: impl WebSocketHandler) -> Result<Self> {
        self.ws_routes.route(pattern, handler)?;
        Ok(self)
    }

    /// Register a task handler under `name`
    #[must_use]
    pub fn task(mut self, name: &str, handler: impl TaskHandler) -> Self {
        self.registry.register(name, handler);
        self
    }

    /// Use an explicit task store instead of the in-memory default
    #[must_use]
    pub fn task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Connect the Postgres task store from the `database` config section
    #[cfg(feature = "database")]
    pub async fn with_postgres_store(mut self) -> Result<Self> {
        let db = self.config.database.clone().ok_or_else(|| {
            Error::Config(Box::new(figment::Error::from(
                "database section missing".to_string(),
            )))
        })?;
        let store = crate::tasks::PgTaskStore::connect(&db).await?;
        store.init_schema().await?;
        self.store = Some(Arc::new(store));
        Ok(self)
    }

    /// Assemble the application
    pub fn build(self) -> Result<App> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let registry = Arc::new(self.registry);
        let dispatcher = TaskDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            &self.config.worker,
        );
        let worker = Arc::new(TaskWorker::new(
            store,
            registry,
            self.events.clone(),
            self.config.worker.clone(),
        ));

        let context = Arc::new(ServerContext {
            pipeline: self.pipeline.build(),
            router: Arc::new(self.router),
            ws_routes: Arc::new(self.ws_routes),
            services: Services {
                channels: Arc::clone(&self.channels),
                proxy: Arc::clone(&self.proxy),
                dispatcher: dispatcher.clone(),
            },
            response_capacity: 32,
            ws_queue_capacity: self.config.channels.send_queue_capacity,
        });

        Ok(App {
            config: self.config,
            channels: self.channels,
            breakers: self.breakers,
            proxy: self.proxy,
            dispatcher,
            worker,
            events: self.events,
            context,
        })
    }
}

/// Assembled application
pub struct App {
    config: Config,
    channels: Arc<ChannelLayer>,
    breakers: Arc<BreakerRegistry>,
    proxy: Arc<ProxyClient>,
    dispatcher: TaskDispatcher,
    worker: Arc<TaskWorker>,
    events: TaskEvents,
    context: Arc<ServerContext>,
}

impl App {
    /// Application configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Channel layer handle
    pub fn channels(&self) -> Arc<ChannelLayer> {
        Arc::clone(&self.channels)
    }

    /// Circuit-breaker registry handle
    pub fn breakers(&self) -> Arc<BreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    /// Proxy client handle
    pub fn proxy(&self) -> Arc<ProxyClient> {
        Arc::clone(&self.proxy)
    }

    /// Task dispatcher
    pub fn dispatcher(&self) -> TaskDispatcher {
        self.dispatcher.clone()
    }

    /// Task event bus
    pub fn events(&self) -> TaskEvents {
        self.events.clone()
    }

    /// Bind the server and start the worker without blocking
    ///
    /// Useful for tests and embeddings that manage their own lifecycle.
    pub async fn start(self) -> Result<AppHandle> {
        let server = Server::new(&self.config.service, Arc::clone(&self.context));
        let bound = server.bind().await?;
        let addr = bound.local_addr();
        let cancel = bound.shutdown_handle();

        let worker = Arc::clone(&self.worker);
        let worker_task = tokio::spawn(Arc::clone(&self.worker).start());
        let server_task = tokio::spawn(bound.serve());

        Ok(AppHandle {
            addr,
            cancel,
            worker,
            worker_task,
            server_task,
            channels: self.channels,
        })
    }

    /// Run until SIGINT/SIGTERM, then shut down gracefully
    pub async fn run(self) -> Result<()> {
        let timeout = self.config.service.shutdown_timeout();
        let handle = self.start().await?;
        tracing::info!(addr = %handle.addr(), "application started");

        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        handle.shutdown(timeout).await
    }
}

/// A running application
pub struct AppHandle {
    addr: std::net::SocketAddr,
    cancel: CancellationToken,
    worker: Arc<TaskWorker>,
    worker_task: tokio::task::JoinHandle<()>,
    server_task: tokio::task::JoinHandle<Result<()>>,
    channels: Arc<ChannelLayer>,
}

impl AppHandle {
    /// The bound server address
    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    /// Stop accepting, drain the worker, and release the channel layer
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.cancel.cancel();
        let server_result = match self.server_task.await {
            Ok(result) => result,
            Err(e) => Err(Error::internal(format!("server task panicked: {e}"))),
        };

        self.worker.stop(timeout).await;
        let _ = self.worker_task.await;
        self.channels.close().await;

        server_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Exchange;
    use crate::pipeline::{middleware_fn, Next};
    use crate::proxy::{CircuitState, ProxyOptions};
    use crate::routing::PATH_PARAMS;
    use crate::websocket::{ChannelAwareHandler, WebSocketSession};
    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use http::StatusCode;
    use std::sync::Arc;
    use tokio::sync::Notify;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.service.host = "127.0.0.1".to_string();
        config.service.port = 0;
        // Keep connection drain short; idle keep-alive sockets otherwise
        // hold the full default budget.
        config.service.shutdown_timeout_secs = 1;
        config
    }

    async fn get(addr: std::net::SocketAddr, path: &str) -> (StatusCode, String) {
        let response = reqwest::get(format!("http://{addr}{path}")).await.unwrap();
        let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
        let body = response.text().await.unwrap();
        (status, body)
    }

    #[tokio::test]
    async fn test_route_with_parameters() {
        let app = AppBuilder::new(test_config())
            .unwrap()
            .route(Method::GET, "/users/:id", |ex: Arc<Exchange>| async move {
                let params = ex.attributes().get(PATH_PARAMS).unwrap();
                let id = params.get("id").unwrap().to_string();
                ex.response()
                    .send_text(StatusCode::OK, format!("User ID: {id}"))
                    .await
            })
            .unwrap()
            .build()
            .unwrap();

        let handle = app.start().await.unwrap();
        let (status, body) = get(handle.addr(), "/users/123").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "User ID: 123");

        handle.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = AppBuilder::new(test_config())
            .unwrap()
            .route(Method::GET, "/", |ex: Arc<Exchange>| async move {
                ex.response().send_text(StatusCode::OK, "root").await
            })
            .unwrap()
            .build()
            .unwrap();

        let handle = app.start().await.unwrap();
        let (status, body) = get(handle.addr(), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "Route not found: /nope");

        handle.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_middleware_headers_applied() {
        let app = AppBuilder::new(test_config())
            .unwrap()
            .middleware(middleware_fn(|ex: Arc<Exchange>, next: Next| async move {
                ex.response().insert_header("x-middleware-1", "one")?;
                next.run(ex).await
            }))
            .middleware(middleware_fn(|ex: Arc<Exchange>, next: Next| async move {
                ex.response().insert_header("x-middleware-2", "two")?;
                next.run(ex).await
            }))
            .route(Method::GET, "/ping", |ex: Arc<Exchange>| async move {
                ex.response().send_text(StatusCode::OK, "pong").await
            })
            .unwrap()
            .build()
            .unwrap();

        let handle = app.start().await.unwrap();
        let response = reqwest::get(format!("http://{}/ping", handle.addr()))
            .await
            .unwrap();
        assert_eq!(response.headers().get("x-middleware-1").unwrap(), "one");
        assert_eq!(response.headers().get("x-middleware-2").unwrap(), "two");

        handle.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_is_500() {
        let app = AppBuilder::new(test_config())
            .unwrap()
            .route(Method::GET, "/boom", |_ex: Arc<Exchange>| async move {
                Err(Error::internal("exploded"))
            })
            .unwrap()
            .build()
            .unwrap();

        let handle = app.start().await.unwrap();
        let (status, body) = get(handle.addr(), "/boom").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "Internal Server Error");

        handle.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    struct Echo;

    #[async_trait]
    impl crate::websocket::WebSocketHandler for Echo {
        async fn on_connect(&self, session: &Arc<WebSocketSession>) -> anyhow::Result<()> {
            let channels = session.attributes().get(CHANNELS).unwrap();
            channels.group_add("echo", Arc::clone(session)).await;
            Ok(())
        }

        async fn on_text(
            &self,
            session: &Arc<WebSocketSession>,
            text: String,
        ) -> anyhow::Result<()> {
            let id = session
                .attributes()
                .get(PATH_PARAMS)
                .and_then(|p| p.get("id").map(str::to_string))
                .unwrap_or_default();
            session.send_text(format!("[{id}] {text}")).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_websocket_echo_and_group_cleanup() {
        let builder = AppBuilder::new(test_config()).unwrap();
        let channels = builder.channels();
        let app = builder
            .ws_route(
                "/ws/echo/:id",
                ChannelAwareHandler::new(Arc::clone(&channels), Echo),
            )
            .unwrap()
            .build()
            .unwrap();

        let handle = app.start().await.unwrap();
        let url = format!("ws://{}/ws/echo/abc", handle.addr());
        let (mut socket, _response) =
            tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        socket.send(WsMessage::Text("hi".to_string())).await.unwrap();
        let reply = socket.next().await.unwrap().unwrap();
        assert_eq!(reply, WsMessage::Text("[abc] hi".to_string()));
        assert_eq!(channels.group_size("echo").await, 1);

        socket.close(None).await.unwrap();

        // Close-frame handling removes the session from every group
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while channels.group_size("echo").await != 0 {
            assert!(tokio::time::Instant::now() < deadline, "group never drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_websocket_unknown_path_rejected() {
        let app = AppBuilder::new(test_config())
            .unwrap()
            .ws_route("/ws/known", Echo)
            .unwrap()
            .build()
            .unwrap();

        let handle = app.start().await.unwrap();
        let url = format!("ws://{}/ws/unknown", handle.addr());
        let result = tokio_tungstenite::connect_async(url.as_str()).await;
        assert!(result.is_err());

        handle.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    fn upstream_app(config: Config) -> AppBuilder {
        AppBuilder::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_proxy_breaker_opens_and_recovers() {
        // Reserve a port with nothing listening on it
        let reserved = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = reserved.local_addr().unwrap().port();
        drop(reserved);
        let upstream_url = format!("http://127.0.0.1:{upstream_port}");
        let authority = format!("127.0.0.1:{upstream_port}");

        let mut config = test_config();
        config.proxy.connect_timeout_ms = 300;
        config.proxy.breaker.failure_threshold = 2;
        config.proxy.breaker.reset_timeout_ms = 50;
        config.proxy.breaker.success_threshold = 1;

        let builder = AppBuilder::new(config).unwrap();
        let proxy = builder.proxy();
        let breakers = builder.breakers();
        let target = upstream_url.clone();
        let app = builder
            .route(Method::GET, "/relay", move |ex: Arc<Exchange>| {
                let proxy = Arc::clone(&proxy);
                let target = target.clone();
                async move { proxy.proxy_to(&ex, &target, ProxyOptions::default()).await }
            })
            .unwrap()
            .build()
            .unwrap();
        let handle = app.start().await.unwrap();

        // Two connection failures trip the breaker
        let (status, _) = get(handle.addr(), "/relay").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let (status, _) = get(handle.addr(), "/relay").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        // Third call fails fast with circuit open
        let (status, body) = get(handle.addr(), "/relay").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains(&authority), "{body}");
        assert_eq!(
            breakers.get(&authority).unwrap().state(),
            CircuitState::Open
        );

        // Bring the upstream to life on the reserved port
        let mut upstream_config = test_config();
        upstream_config.service.port = upstream_port;
        let upstream = upstream_app(upstream_config)
            .route(Method::GET, "/relay", |ex: Arc<Exchange>| async move {
                ex.response().send_text(StatusCode::OK, "upstream alive").await
            })
            .unwrap()
            .build()
            .unwrap();
        let upstream_handle = upstream.start().await.unwrap();

        // After the reset timeout the probe is admitted and succeeds
        tokio::time::sleep(Duration::from_millis(80)).await;
        let (status, body) = get(handle.addr(), "/relay").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "upstream alive");
        assert_eq!(
            breakers.get(&authority).unwrap().state(),
            CircuitState::Closed
        );

        upstream_handle.shutdown(Duration::from_secs(1)).await.unwrap();
        handle.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_proxy_streams_body_byte_for_byte() {
        let payload: Vec<u8> = (0..1_048_576u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let upstream = upstream_app(test_config())
            .route(Method::GET, "/blob", move |ex: Arc<Exchange>| {
                let payload = payload.clone();
                async move {
                    for chunk in payload.chunks(65_536) {
                        ex.response().write(chunk.to_vec()).await?;
                    }
                    ex.response().end();
                    Ok(())
                }
            })
            .unwrap()
            .build()
            .unwrap();
        let upstream_handle = upstream.start().await.unwrap();
        let upstream_url = format!("http://{}", upstream_handle.addr());

        let builder = AppBuilder::new(test_config()).unwrap();
        let proxy = builder.proxy();
        let app = builder
            .route(Method::GET, "/blob", move |ex: Arc<Exchange>| {
                let proxy = Arc::clone(&proxy);
                let target = upstream_url.clone();
                async move { proxy.proxy_to(&ex, &target, ProxyOptions::default()).await }
            })
            .unwrap()
            .build()
            .unwrap();
        let handle = app.start().await.unwrap();

        let response = reqwest::get(format!("http://{}/blob", handle.addr()))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body = response.bytes().await.unwrap();
        assert_eq!(body.len(), expected.len());
        assert_eq!(&body[..], &expected[..]);

        upstream_handle.shutdown(Duration::from_secs(1)).await.unwrap();
        handle.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_proxy_streams_chunks_before_upstream_finishes() {
        let release = Arc::new(Notify::new());
        let gate = Arc::clone(&release);

        let upstream = upstream_app(test_config())
            .route(Method::GET, "/stream", move |ex: Arc<Exchange>| {
                let gate = Arc::clone(&gate);
                async move {
                    ex.response()
                        .insert_header("content-type", "text/event-stream")?;
                    ex.response().write("data: one\n\n").await?;
                    gate.notified().await;
                    ex.response().write("data: two\n\n").await?;
                    ex.response().end();
                    Ok(())
                }
            })
            .unwrap()
            .build()
            .unwrap();
        let upstream_handle = upstream.start().await.unwrap();
        let upstream_url = format!("http://{}", upstream_handle.addr());

        let builder = AppBuilder::new(test_config()).unwrap();
        let proxy = builder.proxy();
        let app = builder
            .route(Method::GET, "/stream", move |ex: Arc<Exchange>| {
                let proxy = Arc::clone(&proxy);
                let target = upstream_url.clone();
                async move { proxy.proxy_to(&ex, &target, ProxyOptions::default()).await }
            })
            .unwrap()
            .build()
            .unwrap();
        let handle = app.start().await.unwrap();

        let response = reqwest::get(format!("http://{}/stream", handle.addr()))
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        let mut stream = response.bytes_stream();
        // First chunk flows through while the upstream is still blocked
        let first = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("first chunk should arrive before upstream completes")
            .unwrap()
            .unwrap();
        assert_eq!(&first[..], b"data: one\n\n");

        release.notify_one();
        let mut rest = Vec::new();
        while let Some(chunk) = stream.next().await {
            rest.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(&rest[..], b"data: two\n\n");

        upstream_handle.shutdown(Duration::from_secs(1)).await.unwrap();
        handle.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_proxy_timeout_maps_to_504() {
        let upstream = upstream_app(test_config())
            .route(Method::GET, "/slow", |ex: Arc<Exchange>| async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                ex.response().send_text(StatusCode::OK, "late").await
            })
            .unwrap()
            .build()
            .unwrap();
        let upstream_handle = upstream.start().await.unwrap();
        let upstream_url = format!("http://{}", upstream_handle.addr());

        let mut config = test_config();
        config.proxy.request_timeout_ms = 100;
        let builder = AppBuilder::new(config).unwrap();
        let proxy = builder.proxy();
        let app = builder
            .route(Method::GET, "/slow", move |ex: Arc<Exchange>| {
                let proxy = Arc::clone(&proxy);
                let target = upstream_url.clone();
                async move { proxy.proxy_to(&ex, &target, ProxyOptions::default()).await }
            })
            .unwrap()
            .build()
            .unwrap();
        let handle = app.start().await.unwrap();

        let (status, _) = get(handle.addr(), "/slow").await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);

        upstream_handle.shutdown(Duration::from_secs(1)).await.unwrap();
        handle.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatcher_reachable_from_handler() {
        let app = AppBuilder::new(test_config())
            .unwrap()
            .task(
                "audit",
                crate::tasks::task_fn(|_ctx| async move { Ok(serde_json::Value::Null) }),
            )
            .route(Method::POST, "/audit", |ex: Arc<Exchange>| async move {
                let dispatcher = ex.attributes().get(DISPATCHER).unwrap();
                let id = dispatcher
                    .enqueue(
                        "audit",
                        serde_json::json!({"at": "now"}),
                        Default::default(),
                    )
                    .await?;
                ex.response().send_text(StatusCode::ACCEPTED, id).await
            })
            .unwrap()
            .build()
            .unwrap();

        let handle = app.start().await.unwrap();
        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/audit", handle.addr()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 202);
        assert!(!response.text().await.unwrap().is_empty());
        drop(client);

        handle.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
