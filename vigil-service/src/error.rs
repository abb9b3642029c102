//! Error types shared across the crate

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Configuration could not be loaded from its sources
    #[error("Configuration error: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// gRPC transport error
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The server's accept loop has already been started
    #[error("Server is already serving")]
    AlreadyServing,

    /// The serve task failed outside the transport (panicked or was lost)
    #[error("Serve task failed: {0}")]
    Serve(String),
}

// Manual From implementation for the boxed variant
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::ConfigLoad(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = Error::from(ConfigError::InvalidPortRange);
        assert_eq!(err.to_string(), "Configuration error: port must be in [1024, 65534)");
    }

    #[test]
    fn test_not_found_display() {
        let err = Error::NotFound("service \"db\" not found".to_string());
        assert_eq!(err.to_string(), "Not found: service \"db\" not found");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err = Error::from(io);
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_already_serving_display() {
        assert_eq!(Error::AlreadyServing.to_string(), "Server is already serving");
    }
}
