//! Engine configuration
//!
//! Read from TOML; every section is optional and falls back to defaults.
//!
//! ```toml
//! [[auto_spawn]]
//! primary_pipeline = "Dealer"
//! follow_on_pipeline = "Integration"
//!
//! [catalog]
//! cache_capacity = 256
//! cache_ttl_secs = 300
//!
//! [ledger]
//! checksum_key = "<64 hex chars>"
//!
//! [analytics]
//! burst_threshold = 50
//! burst_window_secs = 300
//! business_hours_start = 8
//! business_hours_end = 18
//! ```

use dealflow_catalog::CatalogConfig;
use dealflow_ledger::{AnalyticsConfig, ChecksumError, ChecksumKey, Checksummer};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration failure
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },

    /// Not valid TOML for this schema
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Checksum key is not 32 hex-encoded bytes
    #[error("invalid ledger checksum key: {0}")]
    ChecksumKey(#[from] ChecksumError),

    /// Semantically invalid value
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Closing a deal in `primary_pipeline` enrolls it in `follow_on_pipeline`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoSpawnRule {
    /// Pipeline name whose closing stage triggers the rule
    pub primary_pipeline: String,
    /// Pipeline name the deal is enrolled in
    pub follow_on_pipeline: String,
}

impl AutoSpawnRule {
    /// Rule from two pipeline names
    #[must_use]
    pub fn new(primary: impl Into<String>, follow_on: impl Into<String>) -> Self {
        Self {
            primary_pipeline: primary.into(),
            follow_on_pipeline: follow_on.into(),
        }
    }

    /// Whether the rule fires for a pipeline name (ASCII case-insensitive)
    #[must_use]
    pub fn applies_to(&self, pipeline_name: &str) -> bool {
        self.primary_pipeline.eq_ignore_ascii_case(pipeline_name.trim())
    }
}

/// Ledger settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    /// Hex-encoded 32-byte key; when set, checksums are keyed Blake3
    pub checksum_key: Option<String>,
}

impl LedgerConfig {
    /// Checksummer for these settings
    ///
    /// # Errors
    /// Returns [`ConfigError::ChecksumKey`] if the key is malformed
    pub fn checksummer(&self) -> Result<Checksummer, ConfigError> {
        match &self.checksum_key {
            Some(hex) => Ok(Checksummer::keyed(ChecksumKey::from_hex(hex.trim())?)),
            None => Ok(Checksummer::unkeyed()),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DealflowConfig {
    /// Auto-enrollment rules
    pub auto_spawn: Vec<AutoSpawnRule>,
    /// Catalog cache
    pub catalog: CatalogConfig,
    /// Ledger checksums
    pub ledger: LedgerConfig,
    /// Suspicious-activity heuristics
    pub analytics: AnalyticsConfig,
}

impl Default for DealflowConfig {
    fn default() -> Self {
        Self {
            auto_spawn: vec![AutoSpawnRule::new("Dealer", "Integration")],
            catalog: CatalogConfig::default(),
            ledger: LedgerConfig::default(),
            analytics: AnalyticsConfig::default(),
        }
    }
}

impl DealflowConfig {
    /// Parse TOML text
    ///
    /// # Errors
    /// Returns error on malformed TOML, unknown keys or invalid values
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Self::from_toml_str(&text)
    }

    /// Replace the auto-spawn rules
    #[must_use]
    pub fn with_auto_spawn(mut self, rules: Vec<AutoSpawnRule>) -> Self {
        self.auto_spawn = rules;
        self
    }

    /// Use keyed checksums
    #[must_use]
    pub fn with_checksum_key(mut self, hex: impl Into<String>) -> Self {
        self.ledger.checksum_key = Some(hex.into());
        self
    }

    /// Replace catalog cache settings
    #[must_use]
    pub fn with_catalog(mut self, catalog: CatalogConfig) -> Self {
        self.catalog = catalog;
        self
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] or [`ConfigError::ChecksumKey`]
    pub fn validate(&self) -> Result<(), ConfigError> {
        for rule in &self.auto_spawn {
            if rule.primary_pipeline.trim().is_empty() || rule.follow_on_pipeline.trim().is_empty() {
                return Err(ConfigError::Invalid("auto_spawn pipeline names must not be empty".into()));
            }
            if rule.applies_to(&rule.follow_on_pipeline) {
                return Err(ConfigError::Invalid(format!(
                    "auto_spawn rule for '{}' points at itself",
                    rule.primary_pipeline
                )));
            }
        }
        let hours = &self.analytics;
        if hours.business_hours_start >= hours.business_hours_end || hours.business_hours_end > 24 {
            return Err(ConfigError::Invalid(format!(
                "business hours {}..{} are not a valid range",
                hours.business_hours_start, hours.business_hours_end
            )));
        }
        if hours.burst_window_secs <= 0 {
            return Err(ConfigError::Invalid("burst_window_secs must be positive".into()));
        }
        self.ledger.checksummer()?;
        Ok(())
    }
}
