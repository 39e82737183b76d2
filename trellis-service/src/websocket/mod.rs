//! WebSocket sessions, handlers, and route matching

mod handler;
mod message;
mod session;

pub use handler::{ChannelAwareHandler, WebSocketHandler};
pub use message::WebSocketMessage;
pub use session::{SessionId, WebSocketSession};

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::routing::radix::RadixTree;
use crate::routing::{normalize_path, PathParams};

/// WebSocket route table
///
/// The same radix matcher as the HTTP router: `:name` / `{name}` capture one
/// segment, literals must match exactly, no wildcards. Matched parameters
/// land on the session's attribute bag under
/// [`PATH_PARAMS`](crate::routing::PATH_PARAMS).
#[derive(Default)]
pub struct WsRouter {
    tree: RadixTree<Arc<dyn WebSocketHandler>>,
}

impl WsRouter {
    /// Create an empty route table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a path pattern
    pub fn route(&mut self, pattern: &str, handler: impl WebSocketHandler) -> Result<&mut Self> {
        self.route_arc(pattern, Arc::new(handler))
    }

    /// Register an already-shared handler
    pub fn route_arc(
        &mut self,
        pattern: &str,
        handler: Arc<dyn WebSocketHandler>,
    ) -> Result<&mut Self> {
        let normalized = normalize_path(pattern);
        self.tree
            .insert(&normalized, handler)
            .map_err(|e| Error::RouteConflict(format!("{normalized}: {e}")))?;
        Ok(self)
    }

    /// Match an upgrade request path
    pub fn search(&self, path: &str) -> Option<(Arc<dyn WebSocketHandler>, PathParams)> {
        let normalized = normalize_path(path);
        let (handler, params) = self.tree.find(&normalized)?;
        Some((Arc::clone(handler), PathParams::new(params)))
    }

    /// Number of registered WebSocket routes
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// True when no route is registered
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
