//! File-backed persistence for bridge state that must survive restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fb_bridge::CursorStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CURSOR_FILE: &str = "telegram-cursor.json";

#[derive(Debug, Serialize, Deserialize)]
struct CursorRecord {
    cursor: i64,
    updated_at: DateTime<Utc>,
}

/// Keeps the last-seen poll cursor as a small JSON document under the data dir.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(CURSOR_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self) -> anyhow::Result<Option<i64>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "read cursor state {}: {e}",
                    self.path.display()
                ));
            }
        };
        let record: CursorRecord = serde_json::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse cursor state {}: {e}", self.path.display()))?;
        Ok(Some(record.cursor))
    }

    async fn save(&self, cursor: i64) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| anyhow::anyhow!("create data dir {}: {e}", parent.display()))?;
        }
        let record = CursorRecord {
            cursor,
            updated_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&record)?;

        // Write then rename so a crash never leaves a truncated file behind.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| anyhow::anyhow!("write cursor state {}: {e}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| anyhow::anyhow!("replace cursor state {}: {e}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::FileCursorStore;
    use fb_bridge::CursorStore;

    #[tokio::test]
    async fn missing_file_means_no_cursor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCursorStore::new(dir.path());
        assert_eq!(store.load().await.expect("load"), None);
    }

    #[tokio::test]
    async fn saved_cursor_survives_a_new_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("data");
        FileCursorStore::new(&nested)
            .save(1234)
            .await
            .expect("save");
        FileCursorStore::new(&nested)
            .save(1240)
            .await
            .expect("overwrite");

        let reopened = FileCursorStore::new(&nested);
        assert_eq!(reopened.load().await.expect("load"), Some(1240));
        assert!(!reopened.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCursorStore::new(dir.path());
        tokio::fs::write(store.path(), "not json")
            .await
            .expect("write");
        let err = store.load().await.expect_err("corrupt");
        assert!(err.to_string().contains("parse cursor state"));
    }
}
