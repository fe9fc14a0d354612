use crate::error::{BridgeError, Result};
use crate::format::FormatConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Knobs for one bridge instance. Loaded once and never mutated while the bridge runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default = "default_correlation_ttl_secs")]
    pub correlation_ttl_secs: u64,
    /// Upper bound on the total time one chunk may spend waiting for rate-limit capacity.
    #[serde(default = "default_max_rate_wait_secs")]
    pub max_rate_wait_secs: u64,
    #[serde(default = "default_send_max_attempts")]
    pub send_max_attempts: u32,
    #[serde(default = "default_poll_max_attempts")]
    pub poll_max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_awaiting_timeout_secs")]
    pub awaiting_timeout_secs: u64,
    /// Cap on sessions that are not Closed. Opening one more fails with `SessionLimit`.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Route replies that do not quote a bridge message to the most recent awaiting session.
    #[serde(default)]
    pub route_unthreaded_replies: bool,
    /// Post an uncorrelated notice to the chat when an event-driven session
    /// starts and when it is closed.
    #[serde(default)]
    pub lifecycle_notices: bool,
    #[serde(default)]
    pub format: FormatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_rate_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_rate_max_requests(),
            window_secs: default_rate_window_secs(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_message_length: default_max_message_length(),
            rate_limit: RateLimitConfig::default(),
            correlation_ttl_secs: default_correlation_ttl_secs(),
            max_rate_wait_secs: default_max_rate_wait_secs(),
            send_max_attempts: default_send_max_attempts(),
            poll_max_attempts: default_poll_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_secs: default_poll_timeout_secs(),
            awaiting_timeout_secs: default_awaiting_timeout_secs(),
            max_sessions: default_max_sessions(),
            route_unthreaded_replies: false,
            lifecycle_notices: false,
            format: FormatConfig::default(),
        }
    }
}

fn default_max_message_length() -> usize {
    4096
}

fn default_rate_max_requests() -> usize {
    30
}

fn default_rate_window_secs() -> u64 {
    60
}

fn default_correlation_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_rate_wait_secs() -> u64 {
    30
}

fn default_send_max_attempts() -> u32 {
    5
}

fn default_poll_max_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    250
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_poll_timeout_secs() -> u64 {
    25
}

fn default_awaiting_timeout_secs() -> u64 {
    30 * 60
}

fn default_max_sessions() -> usize {
    32
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_message_length == 0 {
            return Err(BridgeError::InvalidConfig(
                "max_message_length must be > 0".to_string(),
            ));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(BridgeError::InvalidConfig(
                "rate_limit.max_requests must be > 0".to_string(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(BridgeError::InvalidConfig(
                "rate_limit.window_secs must be > 0".to_string(),
            ));
        }
        if self.send_max_attempts == 0 || self.poll_max_attempts == 0 {
            return Err(BridgeError::InvalidConfig(
                "send_max_attempts and poll_max_attempts must be > 0".to_string(),
            ));
        }
        if self.max_sessions == 0 {
            return Err(BridgeError::InvalidConfig(
                "max_sessions must be > 0".to_string(),
            ));
        }
        if self.correlation_ttl_secs == 0 {
            return Err(BridgeError::InvalidConfig(
                "correlation_ttl_secs must be > 0".to_string(),
            ));
        }
        if self.retry_max_ms < self.retry_base_ms {
            return Err(BridgeError::InvalidConfig(
                "retry_max_ms must be >= retry_base_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }

    pub fn correlation_ttl(&self) -> Duration {
        Duration::from_secs(self.correlation_ttl_secs)
    }

    pub fn max_rate_wait(&self) -> Duration {
        Duration::from_secs(self.max_rate_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn awaiting_timeout(&self) -> Duration {
        Duration::from_secs(self.awaiting_timeout_secs)
    }

    /// Backoff before retry number `attempt` (1-based): doubles from `retry_base_ms`,
    /// capped at `retry_max_ms`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .retry_base_ms
            .saturating_mul(1_u64 << exp)
            .min(self.retry_max_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::BridgeConfig;
    use std::time::Duration;

    #[test]
    fn empty_table_uses_defaults() {
        let cfg: BridgeConfig = toml::from_str("").expect("parse empty");
        assert_eq!(cfg.max_message_length, 4096);
        assert_eq!(cfg.rate_limit.max_requests, 30);
        assert_eq!(cfg.rate_limit.window_secs, 60);
        assert_eq!(cfg.correlation_ttl(), Duration::from_secs(86_400));
        assert!(!cfg.route_unthreaded_replies);
        assert!(cfg.format.include_reply_hint);
        assert_eq!(cfg.max_sessions, 32);
        assert!(!cfg.lifecycle_notices);
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn partial_rate_limit_table_keeps_other_defaults() {
        let cfg: BridgeConfig = toml::from_str(
            r#"
            max_message_length = 1000
            [rate_limit]
            max_requests = 20
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.max_message_length, 1000);
        assert_eq!(cfg.rate_limit.max_requests, 20);
        assert_eq!(cfg.rate_limit.window_secs, 60);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut cfg = BridgeConfig::default();
        cfg.rate_limit.window_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = BridgeConfig::default();
        cfg.max_message_length = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = BridgeConfig::default();
        cfg.send_max_attempts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = BridgeConfig::default();
        cfg.max_sessions = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.retry_delay(1), Duration::from_millis(250));
        assert_eq!(cfg.retry_delay(2), Duration::from_millis(500));
        assert_eq!(cfg.retry_delay(4), Duration::from_millis(2000));
        assert_eq!(cfg.retry_delay(20), Duration::from_secs(30));
        assert_eq!(cfg.retry_delay(u32::MAX), Duration::from_secs(30));
    }
}
