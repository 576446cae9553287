//! Server configuration, with environment overrides.

use std::time::Duration;

use thiserror::Error;

use scribe_core::DEFAULT_HISTORY_LIMIT;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum clients per room
    pub max_clients_per_room: usize,
    /// Event channel capacity per room
    pub broadcast_capacity: usize,
    /// Committed operations kept per room for rebasing late submissions
    pub history_limit: usize,
    /// Cursors not refreshed for longer than this are dropped
    pub presence_timeout: Duration,
    /// How often stale cursors are swept
    pub sweep_interval: Duration,
    /// Content of a newly created room
    pub initial_text: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            max_clients_per_room: 100,
            broadcast_capacity: 256,
            history_limit: DEFAULT_HISTORY_LIMIT,
            presence_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            initial_text: String::new(),
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is not valid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl ServerConfig {
    /// Defaults overridden by `SCRIBE_*` variables (and `PORT`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    ///
    /// `SCRIBE_BIND_ADDR` replaces the whole address; otherwise `PORT`
    /// replaces only the port of the default address.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("SCRIBE_BIND_ADDR") {
            config.bind_addr = addr;
        } else if let Some(port) = lookup("PORT") {
            let port: u16 = parse("PORT", &port)?;
            let host = config
                .bind_addr
                .rsplit_once(':')
                .map_or("127.0.0.1", |(host, _)| host);
            config.bind_addr = format!("{host}:{port}");
        }
        if let Some(v) = lookup("SCRIBE_MAX_CLIENTS") {
            config.max_clients_per_room = parse("SCRIBE_MAX_CLIENTS", &v)?;
        }
        if let Some(v) = lookup("SCRIBE_HISTORY_LIMIT") {
            config.history_limit = parse("SCRIBE_HISTORY_LIMIT", &v)?;
        }
        if let Some(v) = lookup("SCRIBE_PRESENCE_TIMEOUT_MS") {
            config.presence_timeout = Duration::from_millis(parse("SCRIBE_PRESENCE_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("SCRIBE_SWEEP_INTERVAL_MS") {
            config.sweep_interval = Duration::from_millis(parse("SCRIBE_SWEEP_INTERVAL_MS", &v)?);
        }
        if let Some(text) = lookup("SCRIBE_INITIAL_TEXT") {
            config.initial_text = text;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients_per_room == 0 {
            return Err(ConfigError::Zero("max_clients_per_room"));
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Zero("broadcast_capacity"));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Zero("sweep_interval"));
        }
        Ok(())
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
