//! WebSocket message model

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WireMessage;

/// A WebSocket frame as seen by handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSocketMessage {
    /// UTF-8 text frame
    Text(String),
    /// Binary frame
    Binary(Vec<u8>),
    /// Ping control frame
    Ping(Vec<u8>),
    /// Pong control frame
    Pong(Vec<u8>),
    /// Close frame with optional code and reason
    Close {
        /// Close code, when supplied by the peer
        code: Option<u16>,
        /// Close reason, empty when absent
        reason: String,
    },
}

impl WebSocketMessage {
    /// Build a close message
    #[must_use]
    pub fn close(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self::Close {
            code,
            reason: reason.into(),
        }
    }

    pub(crate) fn from_wire(message: WireMessage) -> Option<Self> {
        match message {
            WireMessage::Text(text) => Some(Self::Text(text)),
            WireMessage::Binary(data) => Some(Self::Binary(data)),
            WireMessage::Ping(data) => Some(Self::Ping(data)),
            WireMessage::Pong(data) => Some(Self::Pong(data)),
            WireMessage::Close(frame) => Some(match frame {
                Some(frame) => Self::Close {
                    code: Some(frame.code.into()),
                    reason: frame.reason.into_owned(),
                },
                None => Self::Close {
                    code: None,
                    reason: String::new(),
                },
            }),
            // Raw frames never surface from a configured stream
            WireMessage::Frame(_) => None,
        }
    }

    pub(crate) fn into_wire(self) -> WireMessage {
        match self {
            Self::Text(text) => WireMessage::Text(text),
            Self::Binary(data) => WireMessage::Binary(data),
            Self::Ping(data) => WireMessage::Ping(data),
            Self::Pong(data) => WireMessage::Pong(data),
            Self::Close { code, reason } => WireMessage::Close(Some(CloseFrame {
                code: CloseCode::from(code.unwrap_or(1000)),
                reason: reason.into(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_roundtrip() {
        let msg = WebSocketMessage::Text("hi".to_string());
        let wire = msg.clone().into_wire();
        assert_eq!(WebSocketMessage::from_wire(wire), Some(msg));
    }

    #[test]
    fn test_close_roundtrip() {
        let msg = WebSocketMessage::close(Some(1001), "going away");
        let wire = msg.clone().into_wire();
        assert_eq!(WebSocketMessage::from_wire(wire), Some(msg));
    }

    #[test]
    fn test_close_without_frame() {
        let parsed = WebSocketMessage::from_wire(WireMessage::Close(None));
        assert_eq!(
            parsed,
            Some(WebSocketMessage::Close {
                code: None,
                reason: String::new()
            })
        );
    }
}
