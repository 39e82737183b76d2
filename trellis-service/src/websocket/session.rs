//! WebSocket session handle with a bounded outbound queue
//!
//! The server owns the socket; handlers and the channel layer talk to a
//! session through its queue. The queue keeps fan-out non-blocking: a slow
//! recipient fills its own queue without stalling broadcasts to others.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::exchange::Attributes;
use crate::websocket::message::WebSocketMessage;

/// Unique identifier for a WebSocket session
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new unique session ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An active WebSocket session
///
/// Lives from upgrade acceptance until the close frame. Outbound messages go
/// through a bounded queue drained by the connection's writer task.
pub struct WebSocketSession {
    id: SessionId,
    sender: mpsc::Sender<WebSocketMessage>,
    attributes: Attributes,
    open: AtomicBool,
}

impl fmt::Debug for WebSocketSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketSession")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl WebSocketSession {
    /// Create a session around an outbound queue sender
    #[must_use]
    pub fn new(sender: mpsc::Sender<WebSocketMessage>) -> Self {
        Self {
            id: SessionId::new(),
            sender,
            attributes: Attributes::new(),
            open: AtomicBool::new(true),
        }
    }

    /// This session's unique ID
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Typed per-session attributes (path params, principal, app state)
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// True until a close frame is processed or the connection errors
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queue a message, waiting for queue capacity
    pub async fn send(&self, message: WebSocketMessage) -> Result<()> {
        if !self.is_open() {
            return Err(Error::WebSocket("session is closed".to_string()));
        }
        self.sender
            .send(message)
            .await
            .map_err(|_| Error::WebSocket("session writer is gone".to_string()))
    }

    /// Queue a text message
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(WebSocketMessage::Text(text.into())).await
    }

    /// Queue a binary message
    pub async fn send_binary(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.send(WebSocketMessage::Binary(data.into())).await
    }

    /// Queue a message without waiting; fails when the queue is full
    ///
    /// Used by broadcast so one slow recipient cannot stall the fan-out.
    pub fn try_send(&self, message: WebSocketMessage) -> Result<()> {
        if !self.is_open() {
            return Err(Error::WebSocket("session is closed".to_string()));
        }
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::WebSocket("session send queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                Error::WebSocket("session writer is gone".to_string())
            }
        })
    }

    /// Queue a close frame and mark the session closed
    pub async fn close(&self, code: Option<u16>, reason: impl Into<String>) -> Result<()> {
        let result = self.send(WebSocketMessage::close(code, reason)).await;
        self.mark_closed();
        result
    }

    /// Flip the open flag; called by the connection driver
    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (tx, mut rx) = mpsc::channel(4);
        let session = WebSocketSession::new(tx);

        session.send_text("hello").await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(WebSocketMessage::Text("hello".to_string()))
        );
    }

    #[tokio::test]
    async fn test_closed_session_rejects_sends() {
        let (tx, _rx) = mpsc::channel(4);
        let session = WebSocketSession::new(tx);
        session.mark_closed();

        assert!(!session.is_open());
        assert!(session.send_text("late").await.is_err());
        assert!(session.try_send(WebSocketMessage::Text("late".into())).is_err());
    }

    #[tokio::test]
    async fn test_try_send_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let session = WebSocketSession::new(tx);

        session.try_send(WebSocketMessage::Text("one".into())).unwrap();
        assert!(session.try_send(WebSocketMessage::Text("two".into())).is_err());
    }
}
