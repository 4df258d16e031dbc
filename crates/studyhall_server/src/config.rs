use std::env;
use std::path::PathBuf;

use studyhall_core::config::ProvisioningConfig;
use thiserror::Error;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3040)
    pub port: u16,
    /// SQLite store holding namespaces, accounts and the account-event log
    /// (default: ./studyhall.db)
    pub database_path: PathBuf,
    /// Platform administrator account (default: admin)
    pub admin_username: String,
    /// When set, the administrator account is created on startup if missing
    pub admin_password: Option<String>,
    /// Accounts provisioned at the same time (default: 4)
    pub provisioning_concurrency: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid PORT environment variable: {0}")]
    InvalidPort(String),

    #[error("Invalid PROVISIONING_CONCURRENCY environment variable: {0}")]
    InvalidConcurrency(String),

    #[error("ADMIN_USERNAME must not be empty")]
    EmptyAdmin,
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = match lookup("PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| ConfigError::InvalidPort(raw))?,
            None => 3040,
        };

        let database_path =
            PathBuf::from(lookup("DATABASE_PATH").unwrap_or_else(|| "./studyhall.db".to_string()));

        let admin_username = lookup("ADMIN_USERNAME").unwrap_or_else(|| "admin".to_string());
        if admin_username.trim().is_empty() {
            return Err(ConfigError::EmptyAdmin);
        }

        let admin_password = lookup("ADMIN_PASSWORD").filter(|p| !p.is_empty());

        let provisioning_concurrency = match lookup("PROVISIONING_CONCURRENCY") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::InvalidConcurrency(raw)),
            },
            None => ProvisioningConfig::default().max_concurrency,
        };

        Ok(Config {
            host,
            port,
            database_path,
            admin_username,
            admin_password,
            provisioning_concurrency,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Controller settings derived from this configuration.
    pub fn provisioning(&self) -> ProvisioningConfig {
        ProvisioningConfig {
            max_concurrency: self.provisioning_concurrency,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.server_addr(), "0.0.0.0:3040");
        assert_eq!(config.database_path, PathBuf::from("./studyhall.db"));
        assert_eq!(config.admin_username, "admin");
        assert_eq!(config.admin_password, None);
        assert_eq!(config.provisioning().max_concurrency, 4);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "8080"),
            ("DATABASE_PATH", "/var/lib/studyhall/store.db"),
            ("ADMIN_USERNAME", "root"),
            ("ADMIN_PASSWORD", "hunter2"),
            ("PROVISIONING_CONCURRENCY", "16"),
        ])
        .unwrap();
        assert_eq!(config.server_addr(), "127.0.0.1:8080");
        assert_eq!(config.database_path, PathBuf::from("/var/lib/studyhall/store.db"));
        assert_eq!(config.admin_username, "root");
        assert_eq!(config.admin_password.as_deref(), Some("hunter2"));
        assert_eq!(config.provisioning().max_concurrency, 16);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            config_from(&[("PORT", "http")]),
            Err(ConfigError::InvalidPort(_))
        ));
        assert!(matches!(
            config_from(&[("PROVISIONING_CONCURRENCY", "0")]),
            Err(ConfigError::InvalidConcurrency(_))
        ));
        assert!(matches!(
            config_from(&[("ADMIN_USERNAME", " ")]),
            Err(ConfigError::EmptyAdmin)
        ));
    }
}
