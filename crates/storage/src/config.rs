//! Store configuration.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::StorageError;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// Database file. `None` opens an in-memory store.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_journal_mode")]
    pub journal_mode: String,

    #[serde(default = "default_true")]
    pub foreign_keys: bool,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_journal_mode() -> String {
    "WAL".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
            journal_mode: default_journal_mode(),
            foreign_keys: true,
        }
    }
}

const JOURNAL_MODES: &[&str] = &["DELETE", "TRUNCATE", "PERSIST", "MEMORY", "WAL", "OFF"];

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, StorageError> {
        let config: Self = toml::from_str(s).map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        let mode = self.journal_mode.to_ascii_uppercase();
        if !JOURNAL_MODES.contains(&mode.as_str()) {
            return Err(StorageError::Config(format!(
                "unknown journal_mode {:?}",
                self.journal_mode
            )));
        }
        Ok(())
    }

    /// PRAGMA preamble applied on every connection open.
    pub(crate) fn pragmas(&self) -> String {
        format!(
            "PRAGMA journal_mode = {};
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = {};
             PRAGMA busy_timeout = {};",
            self.journal_mode.to_ascii_uppercase(),
            if self.foreign_keys { "ON" } else { "OFF" },
            self.busy_timeout_ms,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let config = StoreConfig::from_toml_str("").unwrap();
        assert_eq!(config, StoreConfig::default());
    }

    #[test]
    fn toml_overrides() {
        let config = StoreConfig::from_toml_str(
            r#"
            path = "/var/lib/studyplan/plans.db"
            busy_timeout_ms = 250
            journal_mode = "delete"
            "#,
        )
        .unwrap();
        assert_eq!(config.path, Some(PathBuf::from("/var/lib/studyplan/plans.db")));
        assert_eq!(config.busy_timeout_ms, 250);
        assert!(config.foreign_keys);
        assert!(config.pragmas().contains("journal_mode = DELETE"));
    }

    #[test]
    fn unknown_journal_mode_is_rejected() {
        let err = StoreConfig::from_toml_str(r#"journal_mode = "fast""#).unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
