//! Configuration management for the check-in server.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Call `dotenvy::dotenv()` first to pick up a local `.env` file.

use crate::pipeline::worst_case;
use crate::session::{REPLY_MARGIN, SessionConfig};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        /// Variable name
        key: &'static str,
        /// Raw value
        value: String,
        /// Parser message
        reason: String,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Gate behavior
    pub checkin: CheckInConfig,
    /// Application server configuration
    pub server: ServerConfig,
    /// `PostgreSQL` configuration; in-memory ports when absent
    pub postgres: Option<PostgresConfig>,
}

/// Gate timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInConfig {
    /// Decode cooldown in milliseconds (default: 1500)
    pub cooldown_ms: u64,
    /// Bound on each store call in milliseconds (default: 3000)
    pub store_timeout_ms: u64,
    /// Bound on waiting for a scan or override reply in milliseconds (default: 10000)
    pub result_timeout_ms: u64,
    /// Idle time after which an open session is closed, in milliseconds (default: 1800000)
    pub session_idle_ms: u64,
}

impl CheckInConfig {
    /// Per-store-call timeout
    #[must_use]
    pub const fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Idle time after which the server closes a session
    #[must_use]
    pub const fn session_idle(&self) -> Duration {
        Duration::from_millis(self.session_idle_ms)
    }

    /// Session timing derived from this configuration
    #[must_use]
    pub const fn session(&self) -> SessionConfig {
        SessionConfig {
            cooldown: Duration::from_millis(self.cooldown_ms),
            result_timeout: Duration::from_millis(self.result_timeout_ms),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Log level used when `RUST_LOG` is unset
    pub log_level: String,
    /// Metrics server host (for Prometheus scraping)
    pub metrics_host: String,
    /// Metrics server port
    pub metrics_port: u16,
}

/// `PostgreSQL` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// `PostgreSQL` connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a numeric variable does not parse,
    /// or if the result timeout cannot cover a validation whose every store
    /// call runs up to the store timeout.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let checkin = CheckInConfig {
            cooldown_ms: parse_or(&lookup, "CHECKIN_COOLDOWN_MS", 1500)?,
            store_timeout_ms: parse_or(&lookup, "CHECKIN_STORE_TIMEOUT_MS", 3000)?,
            result_timeout_ms: parse_or(&lookup, "CHECKIN_RESULT_TIMEOUT_MS", 10_000)?,
            session_idle_ms: parse_or(&lookup, "CHECKIN_SESSION_IDLE_MS", 1_800_000)?,
        };
        let required = worst_case(checkin.store_timeout()) + REPLY_MARGIN;
        if checkin.session().result_timeout < required {
            return Err(ConfigError::Invalid {
                key: "CHECKIN_RESULT_TIMEOUT_MS",
                value: checkin.result_timeout_ms.to_string(),
                reason: format!(
                    "must be at least {}ms to outlast three store calls of {}ms",
                    required.as_millis(),
                    checkin.store_timeout_ms
                ),
            });
        }

        Ok(Self {
            checkin,
            server: ServerConfig {
                host: text("SERVER_HOST", "0.0.0.0"),
                port: parse_or(&lookup, "SERVER_PORT", 8080)?,
                log_level: text("LOG_LEVEL", "info"),
                metrics_host: text("METRICS_HOST", "0.0.0.0"),
                metrics_port: parse_or(&lookup, "METRICS_PORT", 9090)?,
            },
            postgres: match lookup("DATABASE_URL") {
                Some(url) if !url.trim().is_empty() => Some(PostgresConfig {
                    url,
                    max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
                }),
                _ => None,
            },
        })
    }

    /// HTTP bind address
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Metrics bind address
    #[must_use]
    pub fn metrics_address(&self) -> String {
        format!("{}:{}", self.server.metrics_host, self.server.metrics_port)
    }
}

fn parse_or<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.checkin.cooldown_ms, 1500);
        assert_eq!(config.checkin.store_timeout(), Duration::from_secs(3));
        assert_eq!(config.checkin.session().result_timeout, Duration::from_secs(10));
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.metrics_address(), "0.0.0.0:9090");
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.checkin.session_idle(), Duration::from_secs(1800));
        assert!(config.postgres.is_none());
    }

    #[test]
    fn overrides_are_read() {
        let config = load(&[
            ("CHECKIN_COOLDOWN_MS", "800"),
            ("SERVER_PORT", "3000"),
            ("DATABASE_URL", "postgres://localhost/checkin"),
            ("DATABASE_MAX_CONNECTIONS", "4"),
        ])
        .unwrap();
        assert_eq!(config.checkin.session().cooldown, Duration::from_millis(800));
        assert_eq!(config.server.port, 3000);
        let postgres = config.postgres.unwrap();
        assert_eq!(postgres.max_connections, 4);
    }

    #[test]
    fn result_timeout_must_outlast_store_calls() {
        let error = load(&[
            ("CHECKIN_STORE_TIMEOUT_MS", "4000"),
            ("CHECKIN_RESULT_TIMEOUT_MS", "10000"),
        ])
        .unwrap_err();
        assert!(matches!(
            error,
            ConfigError::Invalid { key: "CHECKIN_RESULT_TIMEOUT_MS", .. }
        ));

        let config = load(&[
            ("CHECKIN_STORE_TIMEOUT_MS", "4000"),
            ("CHECKIN_RESULT_TIMEOUT_MS", "12500"),
        ])
        .unwrap();
        assert_eq!(config.checkin.session().result_timeout, Duration::from_millis(12_500));
    }

    #[test]
    fn invalid_number_is_reported() {
        let error = load(&[("SERVER_PORT", "eighty")]).unwrap_err();
        assert!(matches!(
            error,
            ConfigError::Invalid { key: "SERVER_PORT", .. }
        ));
    }
}
