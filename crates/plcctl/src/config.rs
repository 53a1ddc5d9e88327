//! Core configuration
//!
//! A single struct passed to the session manager at construction. The
//! external bootstrap decides when the environment is read; the core only
//! supplies the defaults and the `from_env` helper.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Default ENIP explicit-messaging TCP port.
pub const DEFAULT_PORT: u16 = 44818;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_POOL_SIZE: usize = 2;
const DEFAULT_HEARTBEAT_MS: u64 = 1000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 2000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;
const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_RECONNECT_RETRIES: u32 = 5;
const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 200;
const MAX_RECONNECT_BACKOFF_MS: u64 = 3200;
const DEFAULT_KEEP_ALIVE_PATTERN: &[u8] = b"plcctl";

/// Configuration for the session core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Default PLC host when a session does not override it.
    pub host: String,

    /// Default ENIP port.
    pub port: u16,

    /// Connections per endpoint pool.
    pub pool_size: usize,

    /// Bearer token consumed by the external HTTP surface. Carried
    /// verbatim, never interpreted by the core.
    pub auth_token: String,

    /// Keep-alive interval.
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Opaque bytes sent as NOP data by the keep-alive task.
    pub keep_alive_pattern: Vec<u8>,

    /// Deadline for one external operation end to end.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,

    /// Deadline for completing one length-prefixed read.
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,

    /// Deadline for TCP connect.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Deadline for obtaining a pooled connection.
    #[serde(with = "duration_ms")]
    pub acquire_timeout: Duration,

    /// Re-establishment attempts before a session is closed.
    pub reconnect_retries: u32,

    /// Base re-establishment backoff; doubles per attempt, capped.
    #[serde(with = "duration_ms")]
    pub reconnect_backoff: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            pool_size: DEFAULT_POOL_SIZE,
            auth_token: String::new(),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            keep_alive_pattern: DEFAULT_KEEP_ALIVE_PATTERN.to_vec(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            acquire_timeout: Duration::from_millis(DEFAULT_ACQUIRE_TIMEOUT_MS),
            reconnect_retries: DEFAULT_RECONNECT_RETRIES,
            reconnect_backoff: Duration::from_millis(DEFAULT_RECONNECT_BACKOFF_MS),
        }
    }
}

impl CoreConfig {
    /// Build a configuration from `PLCCTL_*` environment overrides.
    ///
    /// Malformed values fall back to the default with a warning rather than
    /// failing startup.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("PLCCTL_HOST") {
            if !host.is_empty() {
                config.host = host;
            }
        }

        if let Some(port) = env_parse::<u16>("PLCCTL_PORT") {
            config.port = port;
        }

        if let Some(size) = env_parse::<usize>("PLCCTL_POOL_SIZE") {
            if size == 0 {
                warn!("PLCCTL_POOL_SIZE=0 ignored, keeping {}", config.pool_size);
            } else {
                config.pool_size = size;
            }
        }

        if let Ok(token) = std::env::var("PLCCTL_AUTH_TOKEN") {
            config.auth_token = token;
        }

        if let Some(ms) = env_parse::<u64>("PLCCTL_KEEPALIVE_MS") {
            config.heartbeat_interval = Duration::from_millis(ms);
        }

        if let Ok(pattern) = std::env::var("PLCCTL_PATTERN") {
            match hex::decode(pattern.trim()) {
                Ok(bytes) => config.keep_alive_pattern = bytes,
                Err(e) => warn!("PLCCTL_PATTERN is not valid hex ({}), keeping default", e),
            }
        }

        config
    }

    /// Backoff delay before re-establishment attempt `attempt` (0-based):
    /// base * 2^attempt, capped at 3.2 s.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.reconnect_backoff.as_millis() as u64;
        let ms = base.saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(ms.min(MAX_RECONNECT_BACKOFF_MS))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("{}={:?} is not valid, keeping default", key, raw);
            None
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 44818);
        assert_eq!(config.pool_size, 2);
        assert!(config.auth_token.is_empty());
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1000));
        assert_eq!(config.keep_alive_pattern, b"plcctl");
    }

    #[test]
    fn test_backoff_schedule_caps() {
        let config = CoreConfig::default();
        let delays: Vec<u64> = (0..5)
            .map(|a| config.backoff_delay(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![200, 400, 800, 1600, 3200]);
        // past the cap the schedule stays flat
        assert_eq!(config.backoff_delay(10), Duration::from_millis(3200));
    }

    #[test]
    fn test_serde_round_trip() {
        let config = CoreConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: CoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, config.port);
        assert_eq!(back.request_timeout, config.request_timeout);
    }
}
