use async_trait::async_trait;
use std::sync::Mutex;

/// Where the last-seen poll cursor lives between restarts.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<i64>>;
    async fn save(&self, cursor: i64) -> anyhow::Result<()>;
}

/// Process-local store; the cursor is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursor: Mutex<Option<i64>>,
}

impl MemoryCursorStore {
    pub fn new(initial: Option<i64>) -> Self {
        Self {
            cursor: Mutex::new(initial),
        }
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self) -> anyhow::Result<Option<i64>> {
        Ok(*self
            .cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    async fn save(&self, cursor: i64) -> anyhow::Result<()> {
        *self
            .cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(cursor);
        Ok(())
    }
}
