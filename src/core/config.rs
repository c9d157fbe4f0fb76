use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::session::Qos;

const CONFIG_ENV: &str = "FRAMEWIRE_CONFIG";

/// Top-level configuration for a Framewire server.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Listener and connection limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address, e.g. `0.0.0.0:9010`.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Maximum size of a single WebSocket message (one frame).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Hard cap on live sessions; upgrades beyond it are rejected.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Per-connection outbound queue depth; overflow closes the connection.
    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,
    /// Reject frames with unknown type bytes instead of passing them through.
    #[serde(default)]
    pub strict_frames: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_frame_bytes: default_max_frame_bytes(),
            max_sessions: default_max_sessions(),
            send_queue_depth: default_send_queue_depth(),
            strict_frames: false,
        }
    }
}

/// Delivery-guarantee tuning shared by every session.
#[derive(Debug, Clone, Deserialize)]
pub struct ReliabilityConfig {
    /// How long a detached session survives before eviction.
    #[serde(default = "default_idle_ttl_ms")]
    pub idle_ttl_ms: u64,
    /// First retry delay for QoS1 frames and QoS2 stages.
    #[serde(default = "default_base_retry_ms")]
    pub base_retry_ms: u64,
    /// Retry delay ceiling.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Retransmission attempts before a delivery is abandoned.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Inbound-dedup retention. Absent means the full session lifetime.
    #[serde(default)]
    pub dedup_window_ms: Option<u64>,
    /// QoS applied to handlers registered without one.
    #[serde(default)]
    pub qos_default: QosDefault,
    /// Cap on in-flight QoS1 entries per session.
    #[serde(default = "default_max_outbox")]
    pub max_outbox_per_session: usize,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            idle_ttl_ms: default_idle_ttl_ms(),
            base_retry_ms: default_base_retry_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_retries: default_max_retries(),
            dedup_window_ms: None,
            qos_default: QosDefault::default(),
            max_outbox_per_session: default_max_outbox(),
        }
    }
}

impl ReliabilityConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    pub fn base_retry(&self) -> Duration {
        Duration::from_millis(self.base_retry_ms)
    }

    /// `min(base * 2^attempts, max_backoff)`.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempts);
        let delay = self.base_retry_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    pub fn dedup_window(&self) -> Option<Duration> {
        self.dedup_window_ms.map(Duration::from_millis)
    }
}

/// Serde-friendly wrapper for the default QoS level.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QosDefault {
    #[default]
    Qos0,
    Qos1,
    Qos2,
}

impl QosDefault {
    pub fn as_qos(self) -> Qos {
        match self {
            Self::Qos0 => Qos::AtMostOnce,
            Self::Qos1 => Qos::AtLeastOnce,
            Self::Qos2 => Qos::ExactlyOnce,
        }
    }
}

impl FromStr for QosDefault {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "qos0" | "0" => Ok(Self::Qos0),
            "qos1" | "1" => Ok(Self::Qos1),
            "qos2" | "2" => Ok(Self::Qos2),
            other => bail!("invalid reliability.qos_default {}", other),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelemetryConfig {
    /// Tracing filter directive, e.g. `info` or `framewire=debug`.
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from a path resolved via FRAMEWIRE_CONFIG, or the
    /// default `config/framewire.toml` when unset.
    pub fn load_from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/framewire.toml"));
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&data)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reliability.base_retry_ms == 0 {
            bail!("reliability.base_retry_ms must be positive");
        }
        if self.reliability.max_backoff_ms < self.reliability.base_retry_ms {
            bail!("reliability.max_backoff_ms must be >= base_retry_ms");
        }
        if self.server.send_queue_depth == 0 {
            bail!("server.send_queue_depth must be positive");
        }
        if self.server.max_frame_bytes < 9 {
            bail!("server.max_frame_bytes must cover at least a frame header");
        }
        Ok(())
    }
}

/// A starter configuration file written by `framewire init`.
pub const SAMPLE_CONFIG: &str = r#"[server]
listen_addr = "0.0.0.0:9010"
max_frame_bytes = 1048576
max_sessions = 16384
send_queue_depth = 1024
strict_frames = false

[reliability]
idle_ttl_ms = 3000
base_retry_ms = 50
max_backoff_ms = 200
max_retries = 3
qos_default = "qos0"
max_outbox_per_session = 1024
# dedup_window_ms = 60000   # absent: dedup entries live for the session

[telemetry]
log_level = "info"
"#;

fn default_listen_addr() -> String {
    "0.0.0.0:9010".to_string()
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

fn default_max_sessions() -> usize {
    16_384
}

fn default_send_queue_depth() -> usize {
    1024
}

fn default_idle_ttl_ms() -> u64 {
    3000
}

fn default_base_retry_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    200
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_outbox() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.reliability.idle_ttl_ms, 3000);
        assert_eq!(config.reliability.base_retry_ms, 50);
        assert_eq!(config.reliability.max_retries, 3);
        assert!(config.reliability.dedup_window_ms.is_none());
    }

    #[test]
    fn test_sample_config_parses() {
        let config: Config = toml::from_str(SAMPLE_CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:9010");
        assert_eq!(config.telemetry.log_level.as_deref(), Some("info"));
    }

    #[test]
    fn test_backoff_is_capped() {
        let reliability = ReliabilityConfig::default();
        assert_eq!(reliability.backoff_delay(0), Duration::from_millis(50));
        assert_eq!(reliability.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(reliability.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(reliability.backoff_delay(3), Duration::from_millis(200));
        assert_eq!(reliability.backoff_delay(63), Duration::from_millis(200));
    }

    #[test]
    fn test_qos_default_parse() {
        assert_eq!(QosDefault::from_str("qos2").unwrap(), QosDefault::Qos2);
        assert_eq!(QosDefault::from_str("1").unwrap(), QosDefault::Qos1);
        assert!(QosDefault::from_str("best-effort").is_err());
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let mut config = Config::default();
        config.reliability.max_backoff_ms = 10;
        assert!(config.validate().is_err());
    }
}
