//! Room service configuration.
//!
//! Configuration is loaded from environment variables. Every variable has a
//! default; malformed values are rejected at startup.

use crate::actors::PoolConfig;

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default port of the WebSocket and inspection server.
pub const DEFAULT_LISTEN_PORT: u16 = 5781;

/// Default bind host.
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Default idle expiration in seconds (one hour).
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 3600;

/// Default idle sweep period in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;

/// Default room allow-list.
pub const DEFAULT_ALLOWED_ROOMS: &str = "chatroom";

/// Room service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port of the WebSocket and inspection server (default: 5781).
    pub listen_port: u16,

    /// Bind host (default: "0.0.0.0").
    pub bind_host: String,

    /// Rooms idle for this long are evicted (default: 3600).
    pub idle_timeout_seconds: u64,

    /// Period of the idle sweep (default: 60).
    pub sweep_interval_seconds: u64,

    /// Room ids clients may connect to (default: "chatroom").
    pub allowed_rooms: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let listen_port = if let Some(value_str) = vars.get("APP_LISTEN_PORT") {
            let value: u16 = value_str.parse().map_err(|e| {
                ConfigError::InvalidValue(format!(
                    "APP_LISTEN_PORT must be a valid port, got '{value_str}': {e}"
                ))
            })?;

            if value == 0 {
                return Err(ConfigError::InvalidValue(
                    "APP_LISTEN_PORT must be greater than 0".to_string(),
                ));
            }

            value
        } else {
            DEFAULT_LISTEN_PORT
        };

        let bind_host = vars
            .get("ROOM_BIND_HOST")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_HOST.to_string());

        let idle_timeout_seconds = parse_seconds(
            vars,
            "ROOM_IDLE_TIMEOUT_SECONDS",
            DEFAULT_IDLE_TIMEOUT_SECONDS,
        )?;

        let sweep_interval_seconds = parse_seconds(
            vars,
            "ROOM_SWEEP_INTERVAL_SECONDS",
            DEFAULT_SWEEP_INTERVAL_SECONDS,
        )?;

        let allowed_rooms: Vec<String> = vars
            .get("ROOM_ALLOWED_IDS")
            .map_or(DEFAULT_ALLOWED_ROOMS, String::as_str)
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();

        if allowed_rooms.is_empty() {
            return Err(ConfigError::InvalidValue(
                "ROOM_ALLOWED_IDS must name at least one room".to_string(),
            ));
        }

        Ok(Config {
            listen_port,
            bind_host,
            idle_timeout_seconds,
            sweep_interval_seconds,
            allowed_rooms,
        })
    }

    /// Socket address to bind, as `host:port`.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.listen_port)
    }

    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_seconds),
            sweep_interval: Duration::from_secs(self.sweep_interval_seconds),
        }
    }
}

/// Positive number of seconds, or the default when unset.
fn parse_seconds(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    let Some(value_str) = vars.get(name) else {
        return Ok(default);
    };

    let value: u64 = value_str.parse().map_err(|e| {
        ConfigError::InvalidValue(format!(
            "{name} must be a valid positive integer, got '{value_str}': {e}"
        ))
    })?;

    if value == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "{name} must be greater than 0"
        )));
    }

    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("defaults should load");

        assert_eq!(config.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(config.bind_host, DEFAULT_BIND_HOST);
        assert_eq!(config.idle_timeout_seconds, DEFAULT_IDLE_TIMEOUT_SECONDS);
        assert_eq!(config.sweep_interval_seconds, DEFAULT_SWEEP_INTERVAL_SECONDS);
        assert_eq!(config.allowed_rooms, vec!["chatroom".to_string()]);
        assert_eq!(config.bind_address(), "0.0.0.0:5781");
    }

    #[test]
    fn test_from_vars_custom_values() {
        let vars = HashMap::from([
            ("APP_LISTEN_PORT".to_string(), "9000".to_string()),
            ("ROOM_BIND_HOST".to_string(), "127.0.0.1".to_string()),
            ("ROOM_IDLE_TIMEOUT_SECONDS".to_string(), "120".to_string()),
            ("ROOM_SWEEP_INTERVAL_SECONDS".to_string(), "5".to_string()),
            (
                "ROOM_ALLOWED_IDS".to_string(),
                "chatroom, lobby ,,standup".to_string(),
            ),
        ]);

        let config = Config::from_vars(&vars).unwrap();

        assert_eq!(config.bind_address(), "127.0.0.1:9000");
        assert_eq!(config.allowed_rooms, vec!["chatroom", "lobby", "standup"]);
        assert_eq!(
            config.pool_config(),
            PoolConfig {
                idle_timeout: Duration::from_secs(120),
                sweep_interval: Duration::from_secs(5),
            }
        );
    }

    #[test]
    fn test_zero_idle_timeout_rejected() {
        let vars = HashMap::from([("ROOM_IDLE_TIMEOUT_SECONDS".to_string(), "0".to_string())]);

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("greater than 0"))
        );
    }

    #[test]
    fn test_non_numeric_values_rejected() {
        for name in [
            "APP_LISTEN_PORT",
            "ROOM_IDLE_TIMEOUT_SECONDS",
            "ROOM_SWEEP_INTERVAL_SECONDS",
        ] {
            let vars = HashMap::from([(name.to_string(), "soon".to_string())]);
            let result = Config::from_vars(&vars);
            assert!(
                matches!(result, Err(ConfigError::InvalidValue(ref msg)) if msg.contains(name)),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn test_empty_allow_list_rejected() {
        let vars = HashMap::from([("ROOM_ALLOWED_IDS".to_string(), " , ".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
