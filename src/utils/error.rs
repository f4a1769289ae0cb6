use thiserror::Error;

/// Represents the errors that can stop the relay or one of its sessions.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Represents an error in the relay configuration.
    ///
    /// This occurs when the environment holds an invalid or inconsistent setting.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Represents a failure of the listening socket or another relay-level I/O resource.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Represents a framing failure on a session stream.
    ///
    /// Handled locally by tearing the session down; never fatal for the relay.
    #[error("Protocol error: {0}")]
    ProtocolError(#[from] crate::server::message::ProtocolError),

    /// Represents an error related to session operations.
    #[error("Session error: {0}")]
    SessionError(#[from] crate::server::session::SessionError),

    /// Indicates that the metrics registry or its HTTP endpoint could not be set up.
    #[error("Metrics error: {0}")]
    MetricsError(String),
}

/// Implements conversion from `prometheus::Error` to `RelayError`.
impl From<prometheus::Error> for RelayError {
    fn from(err: prometheus::Error) -> Self {
        RelayError::MetricsError(err.to_string())
    }
}

/// Implements conversion from `config::ConfigError` to `RelayError`.
impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        RelayError::ConfigurationError(err.to_string())
    }
}
