//! Configuration loading: TOML file with environment variable overrides.
//!
//! Looks for `courier.toml` in the working directory. Every field has a
//! sensible default so the file is optional. Environment variables take
//! precedence over file values.

use std::str::FromStr;

use serde::Deserialize;

use courier_adapter_amqp_lapin::AmqpConfig;
use courier_app::DurableBusConfig;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bus flavour and tap subscription.
    pub bus: BusConfig,
    /// Broker connection, used by the durable and dual modes.
    pub amqp: AmqpConfig,
    /// Durable bus topology and reconnection.
    pub durable: DurableBusConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Which transport carries events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusMode {
    /// Handlers in this process only.
    #[default]
    InProcess,
    /// Broker-backed.
    Durable,
    /// Publish to both, consume from the broker.
    Dual,
}

impl FromStr for BusMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "in_process" => Ok(Self::InProcess),
            "durable" => Ok(Self::Durable),
            "dual" => Ok(Self::Dual),
            other => Err(ConfigError::Validation(format!(
                "unknown bus mode {other:?} (expected in_process, durable or dual)"
            ))),
        }
    }
}

/// Bus selection.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub mode: BusMode,
    /// Pattern of the subscription that logs every matching event.
    pub tap_pattern: String,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

impl Config {
    /// Load configuration from `courier.toml` (if present) then apply
    /// environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but is malformed, an
    /// override is invalid, or the result fails validation.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_file("courier.toml")?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(val) = var("COURIER_BUS_MODE") {
            self.bus.mode = val.parse()?;
        }
        if let Some(val) = var("COURIER_AMQP_URL") {
            self.amqp.url = val;
        }
        if let Some(val) = var("COURIER_TAP_PATTERN") {
            self.bus.tap_pattern = val;
        }
        if let Some(val) = var("COURIER_LOG") {
            self.logging.filter = val;
        }
        if let Some(val) = var("RUST_LOG") {
            self.logging.filter = val;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let durable = &self.durable;
        let reconnect = &durable.reconnect;
        if durable.prefetch == 0 {
            return Err(ConfigError::Validation(
                "durable.prefetch must be non-zero".to_string(),
            ));
        }
        if reconnect.multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "durable.reconnect.multiplier must be at least 1".to_string(),
            ));
        }
        if reconnect.initial_delay_ms > reconnect.max_delay_ms {
            return Err(ConfigError::Validation(
                "durable.reconnect.initial_delay_ms must not exceed max_delay_ms".to_string(),
            ));
        }
        if reconnect.buffer_capacity == 0 {
            return Err(ConfigError::Validation(
                "durable.reconnect.buffer_capacity must be non-zero".to_string(),
            ));
        }
        if self.bus.tap_pattern.is_empty() {
            return Err(ConfigError::Validation(
                "bus.tap_pattern must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mode: BusMode::default(),
            tap_pattern: "#".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "courierd=info,courier=info,lapin=warn".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}
