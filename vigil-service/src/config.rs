//! Server configuration, loading, and validation

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;

/// Configuration validation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Address is empty
    #[error("address length must be greater than 0")]
    InvalidAddressLength,

    /// Address contains a colon (looks like an unsplit "host:port")
    #[error("address must not contain a colon")]
    InvalidAddressColon,

    /// Address contains a space
    #[error("address must not contain a space")]
    InvalidAddressSpace,

    /// Address contains a path separator
    #[error("address must not contain a path")]
    InvalidAddressWithPath,

    /// Port is outside the allowed range (0 means unset/ephemeral)
    #[error("port must be in [1024, 65534)")]
    InvalidPortRange,

    /// Socket path is empty
    #[error("socket path cannot be empty")]
    EmptySocketPath,

    /// Socket path carries an extension other than `.sock`
    #[error("socket path must have no extension or a .sock extension")]
    InvalidSocketPath,

    /// Version is not of the form `major.minor.patch`
    #[error("version must be of the format x.y.z")]
    InvalidVersionFormat,

    /// Version components are not unsigned integers
    #[error("version must only contain unsigned integers")]
    InvalidVersionChars,
}

/// Server configuration
///
/// Loaded from defaults, an optional TOML file, and `VIGIL_`-prefixed
/// environment variables, in increasing priority. A Unix socket path takes
/// precedence over the TCP address and port when both are configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Service name surfaced by the liveness endpoint
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Hostname or IP address for the TCP listener, without a port
    #[serde(default = "default_address")]
    pub address: String,

    /// TCP port; 0 binds an ephemeral port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Unix domain socket path; overrides address/port when set
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Service version, `major.minor.patch`
    #[serde(default = "default_version")]
    pub version: String,

    /// Log level filter for tracing output
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_service_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_version() -> String {
    "0.0.1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            address: default_address(),
            port: default_port(),
            socket_path: None,
            version: default_version(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from `vigil.toml` and the environment
    pub fn load() -> Result<Self> {
        Self::load_from("vigil.toml")
    }

    /// Load configuration from a specific TOML file
    ///
    /// Environment variables (`VIGIL_` prefix) override file values; file
    /// values override defaults. The result is validated before it is
    /// returned.
    pub fn load_from(path: &str) -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("VIGIL_"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every configured field
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        validate_address(&self.address)?;
        validate_port(self.port)?;
        if let Some(path) = &self.socket_path {
            validate_socket_path(path)?;
        }
        validate_version(&self.version)?;
        Ok(())
    }
}

fn validate_address(address: &str) -> std::result::Result<(), ConfigError> {
    if address.is_empty() {
        return Err(ConfigError::InvalidAddressLength);
    }
    if address.contains(':') {
        return Err(ConfigError::InvalidAddressColon);
    }
    if address.contains(' ') {
        return Err(ConfigError::InvalidAddressSpace);
    }
    if address.contains('/') {
        return Err(ConfigError::InvalidAddressWithPath);
    }
    Ok(())
}

fn validate_port(port: u16) -> std::result::Result<(), ConfigError> {
    if (port > 0 && port < 1024) || port >= 65534 {
        return Err(ConfigError::InvalidPortRange);
    }
    Ok(())
}

fn validate_socket_path(path: &Path) -> std::result::Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::EmptySocketPath);
    }
    match path.extension() {
        None => Ok(()),
        Some(ext) if ext == "sock" => Ok(()),
        Some(_) => Err(ConfigError::InvalidSocketPath),
    }
}

fn validate_version(version: &str) -> std::result::Result<(), ConfigError> {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() != 3 {
        return Err(ConfigError::InvalidVersionFormat);
    }
    for part in parts {
        if part.parse::<u32>().is_err() {
            return Err(ConfigError::InvalidVersionChars);
        }
    }
    Ok(())
}
