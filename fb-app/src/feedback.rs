//! The tool-facing boundary: ask the remote operator for feedback and wait.
//!
//! The relay holds the bridge only when the remote channel is configured. With
//! no bridge every request resolves to [`FeedbackOutcome::Unavailable`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fb_bridge::{Bridge, ForwardReport, LocalSession, RemoteReply, ReplyDisposition, SessionId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FeedbackOutcome {
    Reply {
        session_id: SessionId,
        text: String,
        sender_id: String,
        received_at: DateTime<Utc>,
    },
    TimedOut {
        session_id: SessionId,
        waited_secs: u64,
    },
    /// The bridge expired the session before the request's own timeout.
    Expired {
        session_id: SessionId,
        waited_secs: u64,
    },
    Unavailable {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        delivered_chunks: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_chunks: Option<usize>,
    },
}

impl FeedbackOutcome {
    fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
            delivered_chunks: None,
            total_chunks: None,
        }
    }
}

/// Pending feedback requests, keyed by bridge session. This is the bridge's
/// local side; it owns no reference back to the bridge.
type Pending = HashMap<SessionId, oneshot::Sender<RemoteReply>>;

#[derive(Debug, Default)]
pub struct ReplyWaiters {
    pending: Mutex<Pending>,
}

impl ReplyWaiters {
    fn register(&self, session_id: SessionId) -> oneshot::Receiver<RemoteReply> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(session_id, tx);
        rx
    }

    fn cancel(&self, session_id: &SessionId) {
        self.lock().remove(session_id);
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LocalSession for ReplyWaiters {
    async fn route_reply(&self, reply: RemoteReply) -> anyhow::Result<()> {
        let session_id = reply.session_id.clone();
        let Some(waiter) = self.lock().remove(&session_id) else {
            return Err(anyhow::anyhow!(
                "no pending feedback request for session {session_id}"
            ));
        };
        waiter
            .send(reply)
            .map_err(|_| anyhow::anyhow!("feedback request for session {session_id} went away"))
    }

    async fn session_expired(&self, session_id: &SessionId) {
        // Dropping the sender wakes the waiting request with an error.
        self.cancel(session_id);
    }

    async fn delivery_report(
        &self,
        session_id: &SessionId,
        outcome: &fb_bridge::Result<ForwardReport>,
    ) {
        match outcome {
            Ok(report) => tracing::debug!(
                session_id = %session_id,
                chunks = report.total_chunks,
                "session event delivered"
            ),
            Err(error) => {
                tracing::warn!(session_id = %session_id, %error, "session event not delivered")
            }
        }
    }
}

pub struct FeedbackRelay {
    bridge: Option<Arc<Bridge>>,
    waiters: Arc<ReplyWaiters>,
}

impl FeedbackRelay {
    pub fn disabled() -> Self {
        Self {
            bridge: None,
            waiters: Arc::new(ReplyWaiters::default()),
        }
    }

    /// `waiters` must be the local side the bridge was built with.
    pub fn new(bridge: Arc<Bridge>, waiters: Arc<ReplyWaiters>) -> Self {
        Self {
            bridge: Some(bridge),
            waiters,
        }
    }

    pub fn bridge(&self) -> Option<&Arc<Bridge>> {
        self.bridge.as_ref()
    }

    /// Send `summary` to the remote operator and wait up to `timeout` for a reply.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn request_feedback(&self, summary: &str, timeout: Duration) -> FeedbackOutcome {
        let Some(bridge) = self.bridge.as_ref() else {
            return FeedbackOutcome::unavailable("remote channel is not configured");
        };

        let session_id = SessionId::generate();
        if let Err(error) = bridge.open_session(session_id.clone(), ReplyDisposition::CloseOnReply)
        {
            tracing::warn!(session_id = %session_id, %error, "feedback session not opened");
            return FeedbackOutcome::unavailable(error.to_string());
        }
        let started = Instant::now();
        // Register before sending so a fast reply cannot arrive unobserved.
        let reply_rx = self.waiters.register(session_id.clone());

        if let Err(error) = bridge.forward(&session_id, summary).await {
            tracing::warn!(session_id = %session_id, %error, "feedback request not delivered");
            self.waiters.cancel(&session_id);
            bridge.close_session(&session_id);
            let (delivered, total) = error.delivered_chunks().unzip();
            return FeedbackOutcome::Unavailable {
                reason: error.to_string(),
                delivered_chunks: delivered,
                total_chunks: total,
            };
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => {
                tracing::info!(session_id = %session_id, "feedback received");
                FeedbackOutcome::Reply {
                    session_id,
                    text: reply.text,
                    sender_id: reply.sender_id.into_inner(),
                    received_at: reply.received_at,
                }
            }
            Ok(Err(_)) => {
                let waited_secs = started.elapsed().as_secs();
                tracing::info!(session_id = %session_id, waited_secs, "feedback session expired");
                self.waiters.cancel(&session_id);
                bridge.close_session(&session_id);
                FeedbackOutcome::Expired {
                    session_id,
                    waited_secs,
                }
            }
            Err(_) => {
                tracing::info!(session_id = %session_id, ?timeout, "feedback request timed out");
                self.waiters.cancel(&session_id);
                bridge.close_session(&session_id);
                FeedbackOutcome::TimedOut {
                    session_id,
                    waited_secs: timeout.as_secs(),
                }
            }
        }
    }

    /// One-way message: delivered through the bridge, then the session is closed
    /// so replies to it are ignored.
    pub async fn notify(&self, text: &str) -> anyhow::Result<ForwardReport> {
        let bridge = self
            .bridge
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("remote channel is not configured"))?;
        let session_id = SessionId::generate();
        let report = bridge.forward(&session_id, text).await;
        bridge.close_session(&session_id);
        Ok(report?)
    }
}
