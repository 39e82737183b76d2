//! In-memory pub/sub channel layer for WebSocket groups
//!
//! Two indexes are kept consistent under one mutex: group name to member
//! sessions, and session ID to joined groups. A session appears in a group's
//! member set exactly when the group appears in the session's group set.
//! Broadcast fans out through each session's bounded queue with `try_send`,
//! so a slow recipient fails its own delivery instead of stalling the loop.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::websocket::{SessionId, WebSocketMessage, WebSocketSession};

/// One failed delivery during a broadcast
#[derive(Debug, Clone)]
pub struct SendFailure {
    /// The session that did not receive the message
    pub session_id: SessionId,
    /// Why delivery failed
    pub reason: String,
}

/// Outcome of a group broadcast
#[derive(Debug, Default)]
pub struct SendResult {
    /// Sessions the message was queued for
    pub sent: usize,
    /// Sessions that did not receive it
    pub failed: usize,
    /// Per-session failure details
    pub errors: Vec<SendFailure>,
}

/// Broadcast options
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Raise the first delivery error after every session was attempted
    pub raise_first_error: bool,
}

#[derive(Default)]
struct ChannelState {
    groups: HashMap<String, HashMap<SessionId, Arc<WebSocketSession>>>,
    sessions: HashMap<SessionId, HashSet<String>>,
}

/// In-memory channel layer
///
/// Construct one per application and share it by handle.
#[derive(Default)]
pub struct ChannelLayer {
    state: Mutex<ChannelState>,
    closed: AtomicBool,
}

impl ChannelLayer {
    /// Create an empty layer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to a group, creating the group on first member
    pub async fn group_add(&self, group: &str, session: Arc<WebSocketSession>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock().await;
        let session_id = session.id();
        state
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(session_id, session);
        state
            .sessions
            .entry(session_id)
            .or_default()
            .insert(group.to_string());

        tracing::debug!(group = %group, session_id = %session_id, "session joined group");
    }

    /// Remove a session from one group, pruning the group when empty
    pub async fn group_discard(&self, group: &str, session_id: SessionId) {
        let mut state = self.state.lock().await;
        let group_empty = state
            .groups
            .get_mut(group)
            .map(|members| {
                members.remove(&session_id);
                members.is_empty()
            })
            .unwrap_or(false);
        if group_empty {
            state.groups.remove(group);
        }

        let session_empty = state
            .sessions
            .get_mut(&session_id)
            .map(|groups| {
                groups.remove(group);
                groups.is_empty()
            })
            .unwrap_or(false);
        if session_empty {
            state.sessions.remove(&session_id);
        }

        tracing::debug!(group = %group, session_id = %session_id, "session left group");
    }

    /// Remove a session from every group it is in
    pub async fn discard_all(&self, session_id: SessionId) {
        let mut state = self.state.lock().await;
        let Some(groups) = state.sessions.remove(&session_id) else {
            return;
        };
        for group in groups {
            let group_empty = state
                .groups
                .get_mut(&group)
                .map(|members| {
                    members.remove(&session_id);
                    members.is_empty()
                })
                .unwrap_or(false);
            if group_empty {
                state.groups.remove(&group);
            }
        }

        tracing::debug!(session_id = %session_id, "session removed from all groups");
    }

    /// Broadcast a text message to a group
    pub async fn group_send(
        &self,
        group: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<SendResult> {
        self.broadcast(group, WebSocketMessage::Text(text.to_string()), options)
            .await
    }

    /// Broadcast a binary message to a group
    pub async fn group_send_binary(
        &self,
        group: &str,
        data: &[u8],
        options: SendOptions,
    ) -> Result<SendResult> {
        self.broadcast(group, WebSocketMessage::Binary(data.to_vec()), options)
            .await
    }

    /// Sessions currently in a group
    pub async fn group_sessions(&self, group: &str) -> Vec<Arc<WebSocketSession>> {
        let state = self.state.lock().await;
        state
            .groups
            .get(group)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Groups a session has joined
    pub async fn session_groups(&self, session_id: SessionId) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .sessions
            .get(&session_id)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of sessions in a group
    pub async fn group_size(&self, group: &str) -> usize {
        let state = self.state.lock().await;
        state.groups.get(group).map_or(0, HashMap::len)
    }

    /// True when the session is a member of the group
    pub async fn is_in_group(&self, group: &str, session_id: SessionId) -> bool {
        let state = self.state.lock().await;
        state
            .groups
            .get(group)
            .is_some_and(|members| members.contains_key(&session_id))
    }

    /// Names of all non-empty groups
    pub async fn all_groups(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.groups.keys().cloned().collect()
    }

    /// Drop all membership state and refuse further joins
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut state = self.state.lock().await;
        let groups = state.groups.len();
        state.groups.clear();
        state.sessions.clear();
        tracing::info!(groups, "channel layer closed");
    }

    /// Every session in the group is attempted; closed sessions and full
    /// queues count as failures. Delivery order per recipient follows the
    /// order of broadcasts under this lock.
    async fn broadcast(
        &self,
        group: &str,
        message: WebSocketMessage,
        options: SendOptions,
    ) -> Result<SendResult> {
        let state = self.state.lock().await;
        let mut result = SendResult::default();

        if let Some(members) = state.groups.get(group) {
            for (session_id, session) in members {
                if !session.is_open() {
                    result.failed += 1;
                    result.errors.push(SendFailure {
                        session_id: *session_id,
                        reason: "session is closed".to_string(),
                    });
                    continue;
                }
                match session.try_send(message.clone()) {
                    Ok(()) => result.sent += 1,
                    Err(e) => {
                        result.failed += 1;
                        result.errors.push(SendFailure {
                            session_id: *session_id,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        drop(state);

        tracing::debug!(
            group = %group,
            sent = result.sent,
            failed = result.failed,
            "broadcast completed"
        );

        if options.raise_first_error {
            if let Some(first) = result.errors.first() {
                return Err(Error::WebSocket(format!(
                    "broadcast to {} failed for session {}: {}",
                    group, first.session_id, first.reason
                )));
            }
        }
        Ok(result)
    }
}
