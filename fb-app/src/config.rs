//! Feedback bridge configuration loader.

use fb_bridge::BridgeConfig;
use fb_channels::{validate_bot_token, validate_chat_id};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedbackBridgeConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelegramMode {
    #[default]
    Poll,
    Webhook,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    /// Numeric chat id, or `@channelname` for public channels.
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub mode: TelegramMode,
    /// Public HTTPS URL Telegram should push updates to in webhook mode.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// Override for self-hosted Bot API servers.
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound for any HTTP request, including a blocking feedback request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_feedback_timeout_secs")]
    pub default_feedback_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            request_timeout_secs: default_request_timeout_secs(),
            max_in_flight: default_max_in_flight(),
            default_feedback_timeout_secs: default_feedback_timeout_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_request_timeout_secs() -> u64 {
    900
}

fn default_max_in_flight() -> usize {
    64
}

fn default_feedback_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    /// Where bridge state (the poll cursor) is kept. Default: `~/.feedback-bridge/data`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl RuntimeConfig {
    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(path) => expand_home(path),
            None => default_data_dir(),
        }
    }
}

impl FeedbackBridgeConfig {
    /// Read the TOML file, apply environment overrides, then validate. A missing
    /// file is treated as an empty one so env-only setups work.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found; using defaults");
                String::new()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        let mut cfg = Self::parse(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| env(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = v;
            self.telegram.enabled = true;
        }
        if let Some(v) = var("TELEGRAM_CHAT_ID") {
            self.telegram.chat_id = v;
        }
        if let Some(v) = var("FEEDBACK_BRIDGE_WEBHOOK_URL") {
            self.telegram.webhook_url = Some(v);
            self.telegram.mode = TelegramMode::Webhook;
        }
        if let Some(v) = var("FEEDBACK_BRIDGE_WEBHOOK_SECRET") {
            self.telegram.webhook_secret = Some(v);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.bridge
            .validate()
            .map_err(|e| anyhow::anyhow!("bridge: {e}"))?;
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server.port must be > 0"));
        }
        if self.server.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("server.request_timeout_secs must be > 0"));
        }
        if self.server.max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.max_in_flight must be > 0"));
        }

        if !self.telegram.enabled {
            return Ok(());
        }
        if !validate_bot_token(&self.telegram.bot_token) {
            return Err(anyhow::anyhow!(
                "telegram.bot_token is missing or malformed (expected <bot id>:<secret>)"
            ));
        }
        if !validate_chat_id(&self.telegram.chat_id) {
            return Err(anyhow::anyhow!(
                "telegram.chat_id must be a numeric id or @channelname, got {:?}",
                self.telegram.chat_id
            ));
        }
        if self.telegram.mode == TelegramMode::Webhook {
            let url = self.telegram.webhook_url.as_deref().unwrap_or_default();
            if !url.starts_with("https://") {
                return Err(anyhow::anyhow!(
                    "telegram.webhook_url must be an https:// URL in webhook mode"
                ));
            }
        }
        Ok(())
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

pub fn default_config_path() -> PathBuf {
    home_dir().join(".feedback-bridge").join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    home_dir().join(".feedback-bridge").join("data")
}

#[cfg(test)]
mod tests {
    use super::{FeedbackBridgeConfig, TelegramMode};
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_file_is_a_disabled_but_valid_config() {
        let cfg = FeedbackBridgeConfig::parse("").expect("parse");
        assert!(!cfg.telegram.enabled);
        assert_eq!(cfg.server.port, 8765);
        assert_eq!(cfg.bridge.max_message_length, 4096);
        cfg.validate().expect("valid");
    }

    #[test]
    fn sections_parse_with_defaults_filled_in() {
        let cfg = FeedbackBridgeConfig::parse(
            r#"
            [telegram]
            enabled = true
            bot_token = "123456:ABC-def"
            chat_id = "-100200300"

            [bridge]
            route_unthreaded_replies = true
            [bridge.rate_limit]
            max_requests = 20

            [server]
            port = 9000
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.telegram.mode, TelegramMode::Poll);
        assert!(cfg.bridge.route_unthreaded_replies);
        assert_eq!(cfg.bridge.rate_limit.max_requests, 20);
        assert_eq!(cfg.bridge.rate_limit.window_secs, 60);
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.bind, "127.0.0.1");
        cfg.validate().expect("valid");
    }

    #[test]
    fn env_overrides_enable_telegram() {
        let mut cfg = FeedbackBridgeConfig::default();
        cfg.apply_env_overrides(env(&[
            ("TELEGRAM_BOT_TOKEN", "42:secret"),
            ("TELEGRAM_CHAT_ID", "@team_feedback"),
            ("FEEDBACK_BRIDGE_WEBHOOK_SECRET", "  "),
        ]));
        assert!(cfg.telegram.enabled);
        assert_eq!(cfg.telegram.bot_token, "42:secret");
        assert_eq!(cfg.telegram.chat_id, "@team_feedback");
        assert_eq!(cfg.telegram.webhook_secret, None);
        cfg.validate().expect("valid");
    }

    #[test]
    fn webhook_url_override_switches_mode() {
        let mut cfg = FeedbackBridgeConfig::default();
        cfg.apply_env_overrides(env(&[
            ("TELEGRAM_BOT_TOKEN", "42:secret"),
            ("TELEGRAM_CHAT_ID", "42"),
            ("FEEDBACK_BRIDGE_WEBHOOK_URL", "http://insecure.example/hook"),
        ]));
        assert_eq!(cfg.telegram.mode, TelegramMode::Webhook);
        assert!(cfg.validate().is_err(), "plain http webhook must be rejected");
    }

    #[test]
    fn malformed_credentials_are_rejected() {
        let mut cfg = FeedbackBridgeConfig::default();
        cfg.telegram.enabled = true;
        cfg.telegram.bot_token = "not-a-token".to_string();
        cfg.telegram.chat_id = "42".to_string();
        assert!(cfg.validate().is_err());

        cfg.telegram.bot_token = "42:secret".to_string();
        cfg.telegram.chat_id = "team".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn data_dir_expands_home() {
        let cfg = FeedbackBridgeConfig::parse("[runtime]\ndata_dir = \"~/state\"\n")
            .expect("parse");
        let dir = cfg.runtime.data_dir();
        assert!(dir.ends_with("state"));
        assert!(!dir.starts_with("~"));

        let cfg = FeedbackBridgeConfig::parse("[runtime]\ndata_dir = \"/var/lib/fb\"\n")
            .expect("parse");
        assert_eq!(
            cfg.runtime.data_dir(),
            std::path::PathBuf::from("/var/lib/fb")
        );
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = FeedbackBridgeConfig::load(Some(dir.path().join("absent.toml"))).await;
        // Env credentials may be present on the machine running the tests, so
        // only assert that loading did not fail on the missing file itself.
        if let Err(e) = cfg {
            assert!(!e.to_string().contains("read config"), "{e}");
        }
    }

    #[tokio::test]
    async fn unparsable_file_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[telegram\n").await.expect("write");
        let err = FeedbackBridgeConfig::load(Some(path.clone()))
            .await
            .expect_err("parse error");
        assert!(err.to_string().contains(&path.display().to_string()));
    }
}
