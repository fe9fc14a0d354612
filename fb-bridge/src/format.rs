use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const HEADER: &str = "🤖 Feedback request";
const REPLY_HINT: &str = "💬 Reply to this message to respond.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatConfig {
    #[serde(default = "default_true")]
    pub include_session_id: bool,
    #[serde(default = "default_true")]
    pub include_timestamp: bool,
    #[serde(default = "default_true")]
    pub include_reply_hint: bool,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            include_session_id: true,
            include_timestamp: true,
            include_reply_hint: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Wrap `body` for the remote party. Plain text, no parse mode.
pub fn format_outbound(
    cfg: &FormatConfig,
    session_id: &SessionId,
    body: &str,
    now: DateTime<Utc>,
) -> String {
    let mut out = String::with_capacity(body.len() + 128);
    out.push_str(HEADER);
    out.push('\n');
    if cfg.include_session_id {
        out.push_str("Session: ");
        out.push_str(session_id.short());
        out.push('\n');
    }
    if cfg.include_timestamp {
        out.push_str(&format!("Time: {} UTC\n", now.format("%Y-%m-%d %H:%M:%S")));
    }
    out.push('\n');
    out.push_str(body.trim_end());
    if cfg.include_reply_hint {
        out.push_str("\n\n---\n");
        out.push_str(REPLY_HINT);
    }
    out
}
