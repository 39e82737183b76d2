//! WebSocket handler lifecycle

use std::sync::Arc;

use async_trait::async_trait;

use crate::channels::ChannelLayer;
use crate::websocket::session::WebSocketSession;

/// Lifecycle hooks for a WebSocket route
///
/// `on_connect` fires once after the upgrade completes; frames from one
/// session arrive in order; the close frame fires `on_close`; an error
/// returned from any hook fires `on_error`. All hooks default to no-ops.
#[async_trait]
pub trait WebSocketHandler: Send + Sync + 'static {
    /// A session finished its handshake
    async fn on_connect(&self, session: &Arc<WebSocketSession>) -> anyhow::Result<()> {
        let _ = session;
        Ok(())
    }

    /// A text frame arrived
    async fn on_text(&self, session: &Arc<WebSocketSession>, text: String) -> anyhow::Result<()> {
        let _ = (session, text);
        Ok(())
    }

    /// A binary frame arrived
    async fn on_binary(
        &self,
        session: &Arc<WebSocketSession>,
        data: Vec<u8>,
    ) -> anyhow::Result<()> {
        let _ = (session, data);
        Ok(())
    }

    /// A ping frame arrived; the transport answers pongs itself
    async fn on_ping(&self, session: &Arc<WebSocketSession>, data: Vec<u8>) -> anyhow::Result<()> {
        let _ = (session, data);
        Ok(())
    }

    /// A pong frame arrived
    async fn on_pong(&self, session: &Arc<WebSocketSession>, data: Vec<u8>) -> anyhow::Result<()> {
        let _ = (session, data);
        Ok(())
    }

    /// The peer closed the session
    async fn on_close(&self, session: &Arc<WebSocketSession>, code: Option<u16>, reason: &str) {
        let _ = (session, code, reason);
    }

    /// A hook returned an error
    async fn on_error(&self, session: &Arc<WebSocketSession>, error: &anyhow::Error) {
        let _ = session;
        tracing::warn!(session_id = %session.id(), error = %error, "websocket handler error");
    }
}

/// Wraps a handler with channel-layer cleanup
///
/// On close and on error the session is removed from every group, so a
/// dropped connection never leaves dangling group membership.
pub struct ChannelAwareHandler<H> {
    channels: Arc<ChannelLayer>,
    inner: H,
}

impl<H: WebSocketHandler> ChannelAwareHandler<H> {
    /// Wrap `inner`, cleaning up membership in `channels`
    pub fn new(channels: Arc<ChannelLayer>, inner: H) -> Self {
        Self { channels, inner }
    }
}

#[async_trait]
impl<H: WebSocketHandler> WebSocketHandler for ChannelAwareHandler<H> {
    async fn on_connect(&self, session: &Arc<WebSocketSession>) -> anyhow::Result<()> {
        self.inner.on_connect(session).await
    }

    async fn on_text(&self, session: &Arc<WebSocketSession>, text: String) -> anyhow::Result<()> {
        self.inner.on_text(session, text).await
    }

    async fn on_binary(
        &self,
        session: &Arc<WebSocketSession>,
        data: Vec<u8>,
    ) -> anyhow::Result<()> {
        self.inner.on_binary(session, data).await
    }

    async fn on_ping(&self, session: &Arc<WebSocketSession>, data: Vec<u8>) -> anyhow::Result<()> {
        self.inner.on_ping(session, data).await
    }

    async fn on_pong(&self, session: &Arc<WebSocketSession>, data: Vec<u8>) -> anyhow::Result<()> {
        self.inner.on_pong(session, data).await
    }

    async fn on_close(&self, session: &Arc<WebSocketSession>, code: Option<u16>, reason: &str) {
        self.inner.on_close(session, code, reason).await;
        self.channels.discard_all(session.id()).await;
    }

    async fn on_error(&self, session: &Arc<WebSocketSession>, error: &anyhow::Error) {
        self.inner.on_error(session, error).await;
        self.channels.discard_all(session.id()).await;
    }
}
