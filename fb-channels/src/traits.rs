use crate::error::Result;
use crate::types::{BotIdentity, ChatId, OutboundText, SentMessage, UpdateBatch};
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Unique channel identifier, e.g. "telegram".
    fn channel_id(&self) -> &str;

    /// Send one text message into `chat_id`. The returned id is what a later
    /// reply will reference.
    async fn send_text(&self, chat_id: &ChatId, message: OutboundText) -> Result<SentMessage>;

    /// Fetch updates at or after `cursor`, waiting up to `timeout` for new ones.
    async fn poll_updates(&self, cursor: i64, timeout: Duration) -> Result<UpdateBatch>;

    /// Check credentials and report who we are talking as.
    async fn identity(&self) -> Result<BotIdentity>;
}
