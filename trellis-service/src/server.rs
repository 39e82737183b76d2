//! HTTP/WebSocket server with graceful shutdown
//!
//! One task per accepted connection. Plain requests become an
//! [`Exchange`] and run through the pipeline with the router as terminal;
//! upgrade requests bypass the pipeline, match the WebSocket route table,
//! and hand the socket to a session driver after the RFC 6455 handshake.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, Stream, StreamExt};
use http::{header, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::channels::ChannelLayer;
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::exchange::{Exchange, Request, Response};
use crate::pipeline::{Handler, Pipeline};
use crate::proxy::ProxyClient;
use crate::routing::{Router, PATH_PARAMS};
use crate::tasks::TaskDispatcher;
use crate::websocket::{WebSocketHandler, WebSocketMessage, WebSocketSession, WsRouter};

type HttpResponse = http::Response<BoxBody<Bytes, std::io::Error>>;

/// Runtime services attached to every exchange and session
pub(crate) struct Services {
    pub(crate) channels: Arc<ChannelLayer>,
    pub(crate) proxy: Arc<ProxyClient>,
    pub(crate) dispatcher: TaskDispatcher,
}

impl Services {
    fn attach(&self, exchange: &Exchange) {
        exchange
            .attributes()
            .insert(crate::app::CHANNELS, Arc::clone(&self.channels));
        exchange
            .attributes()
            .insert(crate::app::PROXY, Arc::clone(&self.proxy));
        exchange
            .attributes()
            .insert(crate::app::DISPATCHER, self.dispatcher.clone());
    }
}

/// Everything the request path needs, shared across connections
pub(crate) struct ServerContext {
    pub(crate) pipeline: Pipeline,
    pub(crate) router: Arc<Router>,
    pub(crate) ws_routes: Arc<WsRouter>,
    pub(crate) services: Services,
    pub(crate) response_capacity: usize,
    pub(crate) ws_queue_capacity: usize,
}

/// Server bound to its configured address
pub struct Server {
    host: String,
    port: u16,
    shutdown_timeout: Duration,
    context: Arc<ServerContext>,
}

impl Server {
    pub(crate) fn new(service: &ServiceConfig, context: Arc<ServerContext>) -> Self {
        Self {
            host: service.host.clone(),
            port: service.port,
            shutdown_timeout: service.shutdown_timeout(),
            context,
        }
    }

    /// Bind the listener without serving yet
    pub(crate) async fn bind(self) -> Result<BoundServer> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "server listening");

        Ok(BoundServer {
            listener,
            local_addr,
            shutdown_timeout: self.shutdown_timeout,
            context: self.context,
            cancel: CancellationToken::new(),
        })
    }

    /// Bind and serve until SIGINT/SIGTERM
    pub async fn serve(self) -> Result<()> {
        let bound = self.bind().await?;
        let cancel = bound.shutdown_handle();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            cancel.cancel();
        });
        bound.serve().await
    }
}

/// A listening server; serving stops when the shutdown handle fires
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown_timeout: Duration,
    context: Arc<ServerContext>,
    cancel: CancellationToken,
}

impl BoundServer {
    /// The bound address, useful with port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Token that stops the accept loop when cancelled
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept connections until the shutdown handle fires, then drain
    pub async fn serve(self) -> Result<()> {
        let tracker = TaskTracker::new();

        loop {
            let accepted = tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, remote) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let context = Arc::clone(&self.context);
            tracker.spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    handle_request(Arc::clone(&context), req, remote)
                });
                let connection = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades();
                if let Err(e) = connection.await {
                    tracing::debug!(remote = %remote, error = %e, "connection closed with error");
                }
            });
        }

        tracker.close();
        if tokio::time::timeout(self.shutdown_timeout, tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("connection drain timed out");
        }
        tracing::info!("server shutdown complete");
        Ok(())
    }
}

/// Wait for SIGINT or SIGTERM
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn handle_request(
    context: Arc<ServerContext>,
    req: http::Request<Incoming>,
    remote: SocketAddr,
) -> std::result::Result<HttpResponse, Infallible> {
    if is_upgrade_request(&req) {
        return Ok(handle_upgrade(context, req, remote).await);
    }

    let cancel = CancellationToken::new();
    let (response, sink) = Response::channel(context.response_capacity);
    let request = Request::from_hyper(req, Some(remote));
    let exchange = Arc::new(Exchange::new(request, response, cancel.clone()));
    context.services.attach(&exchange);

    let pipeline = context.pipeline.clone();
    let terminal = router_terminal(Arc::clone(&context.router));
    let task_exchange = Arc::clone(&exchange);
    tokio::spawn(async move {
        match pipeline.execute(Arc::clone(&task_exchange), terminal).await {
            Ok(()) => {
                // A handler that returned without finishing still owes the
                // client a complete (possibly empty) response.
                task_exchange.response().end();
            }
            Err(e) => complete_with_error(&task_exchange, e).await,
        }
    });

    let Some(head) = sink.head().await else {
        // The pipeline task died without committing anything
        return Ok(plain_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error",
        ));
    };

    let mut builder = http::Response::builder().status(head.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = head.headers;
    }
    let body = StreamBody::new(ChannelBody {
        rx: head.body,
        _cancel_on_drop: cancel.drop_guard(),
    });
    Ok(builder
        .body(BodyExt::boxed(body))
        .unwrap_or_else(|_| {
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }))
}

/// Handler/pipeline error: 500 (or the error's status) when nothing was
/// sent yet, abrupt termination when the head is already committed.
async fn complete_with_error(exchange: &Exchange, error: Error) {
    if matches!(error, Error::ClientDisconnected) || exchange.is_cancelled() {
        tracing::debug!("client went away mid-request");
        return;
    }

    if exchange.response().committed() {
        tracing::error!(error = %error, "handler failed after response commit");
        exchange.response().abort();
        return;
    }

    let status = error.status_code();
    let body = if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %error, "handler failed");
        "Internal Server Error".to_string()
    } else {
        tracing::warn!(error = %error, status = status.as_u16(), "request failed");
        error.to_string()
    };
    if let Err(e) = exchange.response().send_text(status, body).await {
        tracing::debug!(error = %e, "could not deliver error response");
    }
}

/// Terminal step: route lookup, parameter binding, 404 fallback
fn router_terminal(router: Arc<Router>) -> Arc<dyn Handler> {
    Arc::new(move |exchange: Arc<Exchange>| {
        let router = Arc::clone(&router);
        async move {
            let method = exchange.request().method().clone();
            let path = exchange.request().path().to_string();
            match router.search(&method, &path) {
                Some((handler, params)) => {
                    exchange.attributes().insert(PATH_PARAMS, params);
                    handler.call(exchange).await
                }
                None => {
                    exchange
                        .response()
                        .send_text(StatusCode::NOT_FOUND, format!("Route not found: {path}"))
                        .await
                }
            }
        }
    })
}

struct ChannelBody {
    rx: mpsc::Receiver<std::io::Result<Bytes>>,
    _cancel_on_drop: tokio_util::sync::DropGuard,
}

impl Stream for ChannelBody {
    type Item = std::io::Result<Frame<Bytes>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|result| result.map(Frame::data)))
    }
}

fn plain_response(status: StatusCode, body: impl Into<String>) -> HttpResponse {
    http::Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from(body.into()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("static response is valid")
}

fn is_upgrade_request<B>(req: &http::Request<B>) -> bool {
    let connection_has_upgrade = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);

    let upgrade_is_websocket = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    connection_has_upgrade && upgrade_is_websocket
}

/// Match the WS route table, perform the handshake, and hand the socket to
/// the session driver. Unknown paths are rejected with 404 at upgrade time.
async fn handle_upgrade(
    context: Arc<ServerContext>,
    mut req: http::Request<Incoming>,
    remote: SocketAddr,
) -> HttpResponse {
    let path = req.uri().path().to_string();
    let Some((handler, params)) = context.ws_routes.search(&path) else {
        return plain_response(StatusCode::NOT_FOUND, format!("Route not found: {path}"));
    };

    let Some(key) = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .map(|v| v.as_bytes().to_vec())
    else {
        return plain_response(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
    };
    let accept = derive_accept_key(&key);

    let capacity = context.ws_queue_capacity;
    let channels = Arc::clone(&context.services.channels);
    let upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match upgrade.await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let stream = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                drive_session(stream, handler, params, channels, capacity).await;
            }
            Err(e) => {
                tracing::warn!(remote = %remote, error = %e, "websocket upgrade failed");
            }
        }
    });

    http::Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .body(Full::new(Bytes::new()).map_err(|never| match never {}).boxed())
        .expect("static response is valid")
}

async fn drive_session(
    stream: WebSocketStream<TokioIo<Upgraded>>,
    handler: Arc<dyn WebSocketHandler>,
    params: crate::routing::PathParams,
    channels: Arc<ChannelLayer>,
    capacity: usize,
) {
    let (mut sink, mut source) = stream.split();
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let session = Arc::new(WebSocketSession::new(tx));
    session.attributes().insert(PATH_PARAMS, params);
    session
        .attributes()
        .insert(crate::app::CHANNELS, Arc::clone(&channels));

    tracing::debug!(session_id = %session.id(), "websocket session opened");

    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let is_close = matches!(message, WebSocketMessage::Close { .. });
            if sink.send(message.into_wire()).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
        let _ = sink.close().await;
    });

    if let Err(e) = handler.on_connect(&session).await {
        handler.on_error(&session, &e).await;
    }

    while let Some(frame) = source.next().await {
        match frame {
            Ok(wire) => {
                let Some(message) = WebSocketMessage::from_wire(wire) else {
                    continue;
                };
                let outcome = match message {
                    WebSocketMessage::Text(text) => handler.on_text(&session, text).await,
                    WebSocketMessage::Binary(data) => handler.on_binary(&session, data).await,
                    WebSocketMessage::Ping(data) => handler.on_ping(&session, data).await,
                    WebSocketMessage::Pong(data) => handler.on_pong(&session, data).await,
                    WebSocketMessage::Close { code, reason } => {
                        let _ = session.send(WebSocketMessage::close(code, "")).await;
                        session.mark_closed();
                        handler.on_close(&session, code, &reason).await;
                        break;
                    }
                };
                if let Err(e) = outcome {
                    handler.on_error(&session, &e).await;
                }
            }
            Err(e) => {
                session.mark_closed();
                let error = anyhow::anyhow!("websocket transport error: {e}");
                handler.on_error(&session, &error).await;
                break;
            }
        }
    }

    // Peer vanished without a close frame
    if session.is_open() {
        session.mark_closed();
        handler.on_close(&session, None, "").await;
    }

    if tokio::time::timeout(Duration::from_millis(200), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    tracing::debug!(session_id = %session.id(), "websocket session closed");
}
