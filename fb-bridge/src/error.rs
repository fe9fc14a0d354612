use crate::session::SessionId;
use fb_channels::MessageId;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// A single atomic unit cannot fit in one chunk even on its own.
    #[error("{unit} of {len} chars does not fit in a chunk budget of {budget}")]
    ChunkTooLarge {
        unit: &'static str,
        len: usize,
        budget: usize,
    },

    #[error("correlation for remote message {0} already recorded")]
    DuplicateKey(MessageId),

    #[error(
        "session {session_id}: gave up waiting for rate limit after {waited:?} ({delivered}/{total} chunks delivered)"
    )]
    DeliveryFailed {
        session_id: SessionId,
        delivered: usize,
        total: usize,
        waited: Duration,
    },

    #[error(
        "remote channel unavailable after {attempts} attempts ({delivered}/{total} chunks delivered): {reason}"
    )]
    ChannelUnavailable {
        attempts: u32,
        delivered: usize,
        total: usize,
        reason: String,
    },

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("session {0} is closed")]
    SessionClosed(SessionId),

    #[error("session {session_id} closed while forwarding ({delivered}/{total} chunks delivered)")]
    ClosedMidForward {
        session_id: SessionId,
        delivered: usize,
        total: usize,
    },

    #[error("session limit of {limit} reached; refusing to open {session_id}")]
    SessionLimit { session_id: SessionId, limit: usize },

    #[error("session {session_id} has {capacity} messages queued; dropping new outbound text")]
    QueueFull {
        session_id: SessionId,
        capacity: usize,
    },

    #[error("refusing to forward an empty message")]
    EmptyMessage,

    #[error("invalid bridge config: {0}")]
    InvalidConfig(String),
}

impl BridgeError {
    /// Chunks that reached the remote party before the failure, if the error
    /// interrupted a partially delivered forward.
    pub fn delivered_chunks(&self) -> Option<(usize, usize)> {
        match self {
            Self::DeliveryFailed {
                delivered, total, ..
            }
            | Self::ChannelUnavailable {
                delivered, total, ..
            }
            | Self::ClosedMidForward {
                delivered, total, ..
            } => Some((*delivered, *total)),
            _ => None,
        }
    }
}
