use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fb_channels::{MessageId, SenderId};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for operator-facing text.
    pub fn short(&self) -> &str {
        self.0
            .char_indices()
            .nth(8)
            .map_or(self.0.as_str(), |(end, _)| &self.0[..end])
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    AwaitingRemote,
    Closed,
}

/// What happens to a session once a remote reply has been routed into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyDisposition {
    #[default]
    KeepOpen,
    CloseOnReply,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeSession {
    pub id: SessionId,
    pub state: SessionState,
    pub disposition: ReplyDisposition,
    pub created_at: DateTime<Utc>,
    pub awaiting_since: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
}

impl BridgeSession {
    pub fn new(id: SessionId, disposition: ReplyDisposition, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state: SessionState::Open,
            disposition,
            created_at: now,
            awaiting_since: None,
            last_activity: now,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Called once a chunk has been sent and correlated. Restarts the awaiting clock.
    pub fn mark_awaiting(&mut self, now: DateTime<Utc>) {
        if self.state != SessionState::Closed {
            self.state = SessionState::AwaitingRemote;
            self.awaiting_since = Some(now);
        }
        self.last_activity = now;
    }

    /// Transition after a reply was delivered to the local side.
    pub fn reply_routed(&mut self, now: DateTime<Utc>) {
        self.state = match self.disposition {
            ReplyDisposition::KeepOpen => SessionState::Open,
            ReplyDisposition::CloseOnReply => SessionState::Closed,
        };
        self.awaiting_since = None;
        self.last_activity = now;
    }

    pub fn close(&mut self, now: DateTime<Utc>) {
        self.state = SessionState::Closed;
        self.awaiting_since = None;
        self.last_activity = now;
    }

    pub fn awaiting_expired(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        self.state == SessionState::AwaitingRemote
            && self
                .awaiting_since
                .is_some_and(|since| now.signed_duration_since(since) >= timeout)
    }
}

/// A reply from the remote party, resolved to the session it answers.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteReply {
    pub session_id: SessionId,
    pub text: String,
    pub remote_message_id: MessageId,
    pub sender_id: SenderId,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForwardReport {
    pub session_id: SessionId,
    pub total_chunks: usize,
    pub message_ids: Vec<MessageId>,
}

/// Events emitted by the local session layer that the bridge consumes.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Outbound { session_id: SessionId, text: String },
    Closed { session_id: SessionId },
}

/// The local side of the bridge: whatever owns the interactive sessions.
#[async_trait]
pub trait LocalSession: Send + Sync {
    async fn route_reply(&self, reply: RemoteReply) -> anyhow::Result<()>;

    /// The session sat in AwaitingRemote past its timeout and has been closed.
    async fn session_expired(&self, _session_id: &SessionId) {}

    /// Outcome of a forward that was started from a [`SessionEvent::Outbound`].
    async fn delivery_report(&self, _session_id: &SessionId, _outcome: &Result<ForwardReport>) {}
}
