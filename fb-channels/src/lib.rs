//! Remote chat channel transport for the feedback bridge.
//!
//! Channels are pure I/O: they send text into a remote chat and turn the remote
//! platform's updates into [`RemoteUpdate`] values. Correlation, chunking and rate
//! limiting live in `fb-bridge`.

mod error;
mod telegram;
mod traits;
mod types;
mod validation;
mod webhook;

pub use error::{ChannelError, Result};
pub use telegram::{TelegramChannel, escape_markdown_v2, parse_webhook_update};
pub use traits::RemoteChannel;
pub use types::{
    BotIdentity, ChatId, MessageId, OutboundText, ParseMode, RemoteUpdate, SenderId,
    SentMessage, UpdateBatch,
};
pub use validation::{validate_bot_token, validate_chat_id};
pub use webhook::{TELEGRAM_SECRET_HEADER, webhook_router};
