//! Bidirectional bridge between local feedback sessions and a remote chat channel.

pub mod bridge;
pub mod chunker;
pub mod config;
pub mod correlation;
pub mod cursor;
pub mod error;
pub mod format;
pub mod rate_limit;
pub mod session;

pub use bridge::{Bridge, BridgeStatus};
pub use chunker::{Chunk, MessageChunker, part_marker, reassemble};
pub use config::{BridgeConfig, RateLimitConfig};
pub use correlation::{CorrelationEntry, CorrelationStore};
pub use cursor::{CursorStore, MemoryCursorStore};
pub use error::{BridgeError, Result};
pub use format::{FormatConfig, format_outbound};
pub use rate_limit::{Acquire, RateLimiter};
pub use session::{
    BridgeSession, ForwardReport, LocalSession, RemoteReply, ReplyDisposition, SessionEvent,
    SessionId, SessionState,
};
