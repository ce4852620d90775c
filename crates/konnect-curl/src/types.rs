//! Strongly typed configuration applied to the engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "KONNECT_";

/// Errors raised while loading or validating [`BridgeConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Field contained an invalid value.
    #[error("invalid bridge configuration field")]
    InvalidField {
        /// Field that failed validation.
        field: &'static str,
        /// Offending value when available.
        value: Option<String>,
        /// Machine-readable reason for the failure.
        reason: &'static str,
    },
    /// Configuration document could not be parsed.
    #[error("bridge configuration parse failure")]
    Parse {
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },
}

/// Runtime parameters applied to the multi handle and every transfer it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Upper bound on simultaneously open connections across all hosts.
    pub max_total_connections: Option<usize>,
    /// Upper bound on simultaneously open connections to a single host.
    pub max_host_connections: Option<usize>,
    /// Whether HTTP/2 multiplexing is allowed on shared connections.
    pub multiplex: bool,
    /// Connection establishment timeout in milliseconds.
    pub connect_timeout_ms: Option<u64>,
    /// Overall per-transfer timeout in milliseconds.
    pub transfer_timeout_ms: Option<u64>,
    /// Whether redirects are followed by default.
    pub follow_redirects: bool,
    /// Redirect limit when redirects are followed.
    pub max_redirects: Option<u32>,
    /// `User-Agent` sent when the request does not carry one.
    pub user_agent: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_total_connections: None,
            max_host_connections: None,
            multiplex: true,
            connect_timeout_ms: None,
            transfer_timeout_ms: None,
            follow_redirects: false,
            max_redirects: None,
            user_agent: Some(concat!("konnect/", env!("CARGO_PKG_VERSION")).to_string()),
        }
    }
}

impl BridgeConfig {
    /// Parse and validate a JSON configuration document.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid JSON for this shape or fails
    /// validation.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|source| ConfigError::Parse { source })?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from `KONNECT_*` environment variables over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or the result fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(raw) = var("MAX_TOTAL_CONNECTIONS") {
            config.max_total_connections = Some(parse_number("max_total_connections", &raw)?);
        }
        if let Some(raw) = var("MAX_HOST_CONNECTIONS") {
            config.max_host_connections = Some(parse_number("max_host_connections", &raw)?);
        }
        if let Some(raw) = var("MULTIPLEX") {
            config.multiplex = parse_flag("multiplex", &raw)?;
        }
        if let Some(raw) = var("CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = Some(parse_number("connect_timeout_ms", &raw)?);
        }
        if let Some(raw) = var("TRANSFER_TIMEOUT_MS") {
            config.transfer_timeout_ms = Some(parse_number("transfer_timeout_ms", &raw)?);
        }
        if let Some(raw) = var("FOLLOW_REDIRECTS") {
            config.follow_redirects = parse_flag("follow_redirects", &raw)?;
        }
        if let Some(raw) = var("MAX_REDIRECTS") {
            config.max_redirects = Some(parse_number("max_redirects", &raw)?);
        }
        if let Some(raw) = var("USER_AGENT") {
            config.user_agent = (!raw.trim().is_empty()).then_some(raw);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine would misinterpret.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] for zero connection limits or timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_total_connections == Some(0) {
            return Err(zero_field("max_total_connections"));
        }
        if self.max_host_connections == Some(0) {
            return Err(zero_field("max_host_connections"));
        }
        if self.connect_timeout_ms == Some(0) {
            return Err(zero_field("connect_timeout_ms"));
        }
        if self.transfer_timeout_ms == Some(0) {
            return Err(zero_field("transfer_timeout_ms"));
        }
        Ok(())
    }

    /// Connection establishment timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// Default overall transfer timeout.
    #[must_use]
    pub fn transfer_timeout(&self) -> Option<Duration> {
        self.transfer_timeout_ms.map(Duration::from_millis)
    }
}

fn zero_field(field: &'static str) -> ConfigError {
    ConfigError::InvalidField {
        field,
        value: Some("0".to_string()),
        reason: "must be greater than zero",
    }
}

fn parse_number<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidField {
        field,
        value: Some(raw.to_string()),
        reason: "expected an unsigned integer",
    })
}

fn parse_flag(field: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidField {
            field,
            value: Some(raw.to_string()),
            reason: "expected a boolean flag",
        }),
    }
}
