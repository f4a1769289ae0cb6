use std::{net::SocketAddr, time::Duration};
use serde::Deserialize;
use config::Config;
use crate::utils::error::RelayError;

/// Default listen port of the relay.
pub const DEFAULT_PORT: u16 = 8128;

/// Configuration settings for the relay.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// The address the listener binds to.
    pub host: String,
    /// The port on which the relay will listen.
    pub port: u16,
    /// Upper bound on the display name declared in a handshake, in bytes.
    pub max_name_len: u32,
    /// Upper bound on the payload declared in an inbound message frame, in bytes.
    pub max_message_len: u32,
    /// How long a new connection may take to complete its handshake. `0` waits forever.
    pub handshake_timeout_ms: u64,
    /// Connections accepted per second from a single peer IP.
    pub accept_rate_limit: u32,
    /// Port of the HTTP metrics endpoint. `0` disables it.
    pub metrics_port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_name_len: 256,
            max_message_len: 64 * 1024,
            handshake_timeout_ms: 5_000,
            accept_rate_limit: 50,
            metrics_port: 9080,
        }
    }
}

impl RelayConfig {
    /// Loads the relay configuration from environment variables.
    ///
    /// Environment variables should be prefixed with `RELAY_`, e.g. `RELAY_PORT=9000`.
    /// Unset keys fall back to [`RelayConfig::default`].
    ///
    /// # Errors
    /// Returns a `RelayError::ConfigurationError` if the configuration cannot be loaded.
    pub fn from_env() -> Result<Self, RelayError> {
        let defaults = Self::default();
        Config::builder()
            .set_default("host", defaults.host)?
            .set_default("port", defaults.port as i64)?
            .set_default("max_name_len", defaults.max_name_len as i64)?
            .set_default("max_message_len", defaults.max_message_len as i64)?
            .set_default("handshake_timeout_ms", defaults.handshake_timeout_ms as i64)?
            .set_default("accept_rate_limit", defaults.accept_rate_limit as i64)?
            .set_default("metrics_port", defaults.metrics_port as i64)?
            .add_source(config::Environment::with_prefix("RELAY"))
            .build()?
            .try_deserialize()
            .map_err(|e| RelayError::ConfigurationError(e.to_string()))
    }

    /// Validates the configuration settings.
    ///
    /// # Errors
    /// Returns a `RelayError::ConfigurationError` if a limit is zero or the
    /// listen address does not parse.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.max_name_len == 0 {
            return Err(RelayError::ConfigurationError(
                "max_name_len must be greater than 0".into()
            ));
        }

        if self.max_message_len == 0 {
            return Err(RelayError::ConfigurationError(
                "max_message_len must be greater than 0".into()
            ));
        }

        if self.accept_rate_limit == 0 {
            return Err(RelayError::ConfigurationError(
                "accept_rate_limit must be greater than 0".into()
            ));
        }

        self.listen_addr().map(|_| ())
    }

    /// The socket address the relay listens on.
    pub fn listen_addr(&self) -> Result<SocketAddr, RelayError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| RelayError::ConfigurationError(format!(
                "invalid listen address {}:{}: {}",
                self.host, self.port, e
            )))
    }

    /// The socket address of the metrics endpoint, if enabled.
    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>, RelayError> {
        if self.metrics_port == 0 {
            return Ok(None);
        }
        let mut addr = self.listen_addr()?;
        addr.set_port(self.metrics_port);
        Ok(Some(addr))
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout_ms > 0).then(|| Duration::from_millis(self.handshake_timeout_ms))
    }
}
