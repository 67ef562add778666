//! # Configuration
//!
//! `AppConfig` is read from an optional TOML file and then patched from the
//! environment.
//!
//! ```toml
//! [storage]
//! records_path = "data/records.sqlite3"
//! graph_path = "data/graph.redb"
//! ledger_root = "data/ledger"
//! snapshot_root = "data/snapshots"
//! evidence_root = "data/evidence"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! rate_limit = 100
//! cors_origins = "http://localhost:3000"
//!
//! [upsert]
//! record_noop_decisions = false
//!
//! [[drift.allow]]
//! type_code = "R09"
//! change_kinds = ["added"]
//! ```
//!
//! ## Environment Overrides
//!
//! - `TRACEGRAPH_API_KEY`: bearer key for the HTTP API (never read from the file)
//! - `TRACEGRAPH_RATE_LIMIT`: requests per second, 0 disables limiting
//! - `TRACEGRAPH_CORS_ORIGINS`: comma-separated origins, or `*`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracegraph_core::{AllowRule, CoreError, UpsertOptions};

/// File picked up when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "tracegraph.toml";

pub const ENV_API_KEY: &str = "TRACEGRAPH_API_KEY";
pub const ENV_RATE_LIMIT: &str = "TRACEGRAPH_RATE_LIMIT";
pub const ENV_CORS_ORIGINS: &str = "TRACEGRAPH_CORS_ORIGINS";

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub records_path: PathBuf,
    pub graph_path: PathBuf,
    /// Ledger files and drift signal streams live here.
    pub ledger_root: PathBuf,
    pub snapshot_root: PathBuf,
    pub evidence_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data = PathBuf::from("data");
        Self {
            records_path: data.join("records.sqlite3"),
            graph_path: data.join("graph.redb"),
            ledger_root: data.join("ledger"),
            snapshot_root: data.join("snapshots"),
            evidence_root: data.join("evidence"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Requests per second; 0 disables the limiter.
    pub rate_limit: u32,
    pub cors_origins: Option<String>,
    /// Per-request budget for traversals.
    pub traversal_timeout_secs: u64,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            rate_limit: 100,
            cors_origins: None,
            traversal_timeout_secs: 30,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub allow: Vec<AllowRule>,
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub server: ServerConfig,
    pub upsert: UpsertOptions,
    pub drift: DriftConfig,
}

// =============================================================================
// LOADING
// =============================================================================

impl AppConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, CoreError> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| CoreError::Validation(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or from `tracegraph.toml` when it exists, or use
    /// defaults. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.is_file()),
        };
        let mut config = match &file {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| CoreError::Io(format!("{}: {}", p.display(), e)))?;
                tracing::info!(path = %p.display(), "configuration loaded");
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Patch values from a key lookup (the process environment in `load`).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(ENV_API_KEY).filter(|k| !k.is_empty()) {
            self.server.api_key = Some(key);
        }
        if let Some(raw) = lookup(ENV_RATE_LIMIT) {
            match raw.trim().parse() {
                Ok(rps) => self.server.rate_limit = rps,
                Err(_) => tracing::warn!(value = %raw, "ignoring unparseable {}", ENV_RATE_LIMIT),
            }
        }
        if let Some(origins) = lookup(ENV_CORS_ORIGINS).filter(|o| !o.trim().is_empty()) {
            self.server.cors_origins = Some(origins);
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.server.traversal_timeout_secs == 0 {
            return Err(CoreError::Validation(
                "server.traversal_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
