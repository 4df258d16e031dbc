//! Configuration types for Studyhall.
//!
//! [`StudyhallConfig`] is the file-level configuration, persisted as TOML with
//! one section per component:
//!
//! ```toml
//! admin_username = "admin"
//!
//! [backend]
//! kind = "live"
//! [backend.connection]
//! endpoint = "http://localhost:5984"
//! username = "admin"
//! password = "secret"
//!
//! [scheduler]
//! review_ratio = 0.8
//! expected_seconds_per_item = 30
//!
//! [provisioning]
//! max_concurrency = 4
//! ```
//!
//! The data layer itself only needs a [`DataLayerConfig`], which can also be
//! built in code with [`DataLayerConfig::live`] or [`DataLayerConfig::snapshot`].
//!
//! # Async-first Design
//!
//! Use `StudyhallConfig::load_from()` with an `AsyncFileSystem` to load config.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StudyError};
use crate::fs::AsyncFileSystem;

fn default_admin_username() -> String {
    "admin".to_string()
}

/// How to reach the live document database.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Base address of the store (e.g. `"http://localhost:5984"`).
    pub endpoint: String,
    /// Account used to authenticate, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password of `username`. Redacted from `Debug` output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Which backend the data layer runs against. Chosen once at initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Read/write access to the replicated document store.
    Live {
        /// Where the store lives and how to log in.
        connection: ConnectionConfig,
    },
    /// Read-only access to a packed course bundle.
    Snapshot {
        /// Path or `http(s)://` URL of the bundle's `manifest.json`.
        manifest_location: String,
    },
}

/// Everything the data layer provider needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLayerConfig {
    /// Which backend to open.
    pub backend: BackendConfig,
    /// Identity treated as the platform administrator.
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
}

impl DataLayerConfig {
    /// Anonymous connection to the live store at `endpoint`.
    pub fn live(endpoint: impl Into<String>) -> Self {
        Self {
            backend: BackendConfig::Live {
                connection: ConnectionConfig {
                    endpoint: endpoint.into(),
                    username: None,
                    password: None,
                },
            },
            admin_username: default_admin_username(),
        }
    }

    /// Read-only access to the bundle whose manifest is at `manifest_location`,
    /// a local path or an http(s) URL.
    pub fn snapshot(manifest_location: impl Into<String>) -> Self {
        Self {
            backend: BackendConfig::Snapshot {
                manifest_location: manifest_location.into(),
            },
            admin_username: default_admin_username(),
        }
    }

    /// Set the credentials used to open the live connection (builder pattern).
    ///
    /// Has no effect on a snapshot configuration.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        if let BackendConfig::Live { connection } = &mut self.backend {
            connection.username = Some(username.into());
            connection.password = Some(password.into());
        }
        self
    }

    /// Treat `admin_username` as the platform administrator.
    pub fn with_admin(mut self, admin_username: impl Into<String>) -> Self {
        self.admin_username = admin_username.into();
        self
    }

    /// Whether this configuration selects the read-only snapshot backend.
    pub fn is_snapshot(&self) -> bool {
        matches!(self.backend, BackendConfig::Snapshot { .. })
    }

    /// Check required fields without touching the network.
    pub fn validate(&self) -> Result<()> {
        if self.admin_username.trim().is_empty() {
            return Err(StudyError::Configuration("admin_username must not be empty".into()));
        }
        match &self.backend {
            BackendConfig::Live { connection } => {
                let endpoint = connection.endpoint.trim();
                if endpoint.is_empty() {
                    return Err(StudyError::Configuration("live backend requires an endpoint".into()));
                }
                if endpoint.chars().any(char::is_whitespace) {
                    return Err(StudyError::Configuration(format!(
                        "invalid endpoint '{}'",
                        connection.endpoint
                    )));
                }
                if connection.password.is_some() && connection.username.is_none() {
                    return Err(StudyError::Configuration(
                        "a password was given without a username".into(),
                    ));
                }
            }
            BackendConfig::Snapshot { manifest_location } => {
                if manifest_location.trim().is_empty() {
                    return Err(StudyError::Configuration(
                        "snapshot backend requires a manifest location".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Tie-breaking among new cards at equal ELO distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TieBreak {
    /// Keep the order in which candidates were enumerated.
    #[default]
    InsertionOrder,
    /// Reproducible shuffle within each ELO band.
    Shuffle {
        /// Same seed, same order.
        seed: u64,
    },
}

/// Study session scheduler tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Share of a session reserved for due reviews, in `[0, 1]`.
    pub review_ratio: f64,
    /// Time a learner is expected to spend on one item.
    pub expected_seconds_per_item: u32,
    /// Width of the ELO bands inside which candidates count as equally close.
    pub elo_band_width: f64,
    /// Cards fetched per page when enumerating a whole course.
    pub page_size: usize,
    /// How cards within one band are ordered.
    pub tie_break: TieBreak,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            review_ratio: 0.8,
            expected_seconds_per_item: 30,
            elo_band_width: 100.0,
            page_size: 200,
            tie_break: TieBreak::InsertionOrder,
        }
    }
}

impl SchedulerConfig {
    /// Reject settings the component cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.expected_seconds_per_item == 0 {
            return Err(StudyError::Configuration(
                "expected_seconds_per_item must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.review_ratio) {
            return Err(StudyError::Configuration(format!(
                "review_ratio must be within [0, 1], got {}",
                self.review_ratio
            )));
        }
        if self.elo_band_width.is_nan() || self.elo_band_width <= 0.0 {
            return Err(StudyError::Configuration("elo_band_width must be positive".into()));
        }
        if self.page_size == 0 {
            return Err(StudyError::Configuration("page_size must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Per-user provisioning controller settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Accounts processed at the same time.
    pub max_concurrency: usize,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
        }
    }
}

impl ProvisioningConfig {
    /// Reject settings the component cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(StudyError::Configuration("max_concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

/// File-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyhallConfig {
    /// Identity treated as the platform administrator.
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    /// Which backend to open.
    pub backend: BackendConfig,
    /// Study session settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Per-user namespace provisioning settings.
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
}

impl StudyhallConfig {
    /// Defaults for everything but the backend.
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            admin_username: default_admin_username(),
            backend,
            scheduler: SchedulerConfig::default(),
            provisioning: ProvisioningConfig::default(),
        }
    }

    /// The data layer part of this configuration.
    pub fn data_layer(&self) -> DataLayerConfig {
        DataLayerConfig {
            backend: self.backend.clone(),
            admin_username: self.admin_username.clone(),
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.data_layer().validate()?;
        self.scheduler.validate()?;
        self.provisioning.validate()
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: StudyhallConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a specific path using an AsyncFileSystem.
    pub async fn load_from<FS: AsyncFileSystem + ?Sized>(fs: &FS, path: &Path) -> Result<Self> {
        let contents = fs.read_to_string(path).await.map_err(|e| {
            StudyError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    /// Save config to a specific path using an AsyncFileSystem.
    pub async fn save_to<FS: AsyncFileSystem + ?Sized>(&self, fs: &FS, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs.create_dir_all(parent).await?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs.write(path, contents.as_bytes()).await?;
        Ok(())
    }
}
