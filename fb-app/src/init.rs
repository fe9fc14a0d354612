//! Configuration scaffolding for `feedback-bridge init`.
//!
//! Writes a commented template config under `~/.feedback-bridge/` without
//! overwriting anything already there.

use anyhow::Result;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

const CONFIG_FILE: &str = "config.toml";
const CONFIG_TEMPLATE: &str = include_str!("../../config-templates/config.toml");

pub async fn initialize(config_path: Option<PathBuf>) -> Result<InitReport> {
    let config_path = config_path.unwrap_or_else(crate::config::default_config_path);
    let root = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid config path: {}", config_path.display()))?
        .to_path_buf();
    let file_name = config_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(CONFIG_FILE)
        .to_string();
    initialize_at_root(&root, &file_name).await
}

pub async fn initialize_at_root(root: &Path, file_name: &str) -> Result<InitReport> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| anyhow::anyhow!("create config root {}: {e}", root.display()))?;

    let mut report = InitReport {
        root: root.to_path_buf(),
        created: Vec::new(),
        skipped: Vec::new(),
    };

    let target = root.join(file_name);
    match tokio::fs::metadata(&target).await {
        Ok(_) => report.skipped.push(target),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::write(&target, CONFIG_TEMPLATE)
                .await
                .map_err(|e| anyhow::anyhow!("write config template {}: {e}", target.display()))?;
            report.created.push(target);
        }
        Err(err) => {
            return Err(anyhow::anyhow!(
                "inspect config path {}: {err}",
                target.display()
            ));
        }
    }

    Ok(report)
}
