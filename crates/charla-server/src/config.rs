//! Configuration for the chat server.
//!
//! Values are layered, later sources winning:
//!
//! 1. built-in defaults
//! 2. an optional TOML file (`--config <path>`)
//! 3. environment variables
//! 4. command-line flags (applied by `main`)
//!
//! Environment variables:
//!
//! - `CHARLA_BIND_ADDR`   (default: "0.0.0.0")
//! - `CHARLA_PORT`        (default: "9999")
//! - `CHARLA_MAX_CLIENTS` (default: "64")
//! - `CHARLA_MAX_USERS`   (default: "1024")

use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// IP address / interface to bind to (e.g. "0.0.0.0" or "127.0.0.1").
    pub bind_addr: String,

    /// TCP port to listen on.
    pub port: u16,

    /// Maximum number of simultaneously connected clients.
    pub max_clients: usize,

    /// Maximum number of distinct handles logged in at once.
    pub max_users: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "0.0.0.0".to_string(),
            port: 9999,
            max_clients: 64,
            max_users: 1024,
        }
    }
}

impl Config {
    /// Read a TOML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Config::from_toml_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply any `CHARLA_*` environment variables on top of `self`.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(addr) = env::var("CHARLA_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(port) = read_env("CHARLA_PORT")? {
            self.port = port;
        }
        if let Some(max_clients) = read_env("CHARLA_MAX_CLIENTS")? {
            self.max_clients = max_clients;
        }
        if let Some(max_users) = read_env("CHARLA_MAX_USERS")? {
            self.max_users = max_users;
        }
        Ok(self)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("port must be between 1 and 65535");
        }
        if self.max_clients == 0 {
            bail!("max_clients must be at least 1");
        }
        if self.max_users == 0 {
            bail!("max_users must be at least 1");
        }
        Ok(())
    }

    /// Convenience: `addr:port` socket string.
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn read_env<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(val) => {
            let parsed = val
                .parse::<T>()
                .with_context(|| format!("invalid value for {}: {:?}", key, val))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str("port = 4000\nmax_clients = 8\n").unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.max_clients, 8);
        assert_eq!(config.bind_addr, "0.0.0.0");
        assert_eq!(config.max_users, 1024);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_toml_str("prot = 4000\n").is_err());
    }

    #[test]
    fn validation_catches_unusable_values() {
        assert!(Config::default().validate().is_ok());

        let no_port = Config {
            port: 0,
            ..Config::default()
        };
        assert!(no_port.validate().is_err());

        let no_clients = Config {
            max_clients: 0,
            ..Config::default()
        };
        assert!(no_clients.validate().is_err());
    }

    #[test]
    fn socket_addr_joins_host_and_port() {
        let config = Config {
            bind_addr: "127.0.0.1".to_string(),
            port: 5555,
            ..Config::default()
        };
        assert_eq!(config.socket_addr_string(), "127.0.0.1:5555");
    }
}
