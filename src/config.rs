//! Settings file: the debug switch plus one connection block per alias.
//!
//! ```toml
//! debug = true
//!
//! [databases.default]
//! host = "db.internal"
//! name = "legacy"
//! user = "reporting"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::db::DatabaseConfig;
use crate::error::{QuerySetError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Verbose mode: unknown output shapes are logged loudly.
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseConfig>,
}

impl Settings {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("legacyset")
            .join("databases.toml")
    }

    /// Load from the default location; a missing file yields empty settings.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| QuerySetError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| QuerySetError::Config(e.to_string()))
    }

    /// Fill missing passwords from `LEGACYSET_<ALIAS>_PASSWORD`, then `PGPASSWORD`.
    pub fn resolve_passwords(&mut self) {
        self.resolve_passwords_with(|name| std::env::var(name).ok());
    }

    pub fn resolve_passwords_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (alias, config) in self.databases.iter_mut() {
            if !config.password.is_empty() {
                continue;
            }
            if let Some(password) = lookup(&password_env_var(alias)).or_else(|| lookup("PGPASSWORD"))
            {
                config.password = password;
            }
        }
    }

    /// Aliases that still have no password after resolution.
    pub fn missing_passwords(&self) -> Vec<String> {
        self.databases
            .iter()
            .filter(|(_, c)| c.password.is_empty())
            .map(|(alias, _)| alias.clone())
            .collect()
    }

    #[cfg(test)]
    pub fn for_aliases(aliases: &[&str]) -> Self {
        Self {
            debug: false,
            databases: aliases
                .iter()
                .map(|alias| (alias.to_string(), DatabaseConfig::default()))
                .collect(),
        }
    }
}

/// `reporting-replica` → `LEGACYSET_REPORTING_REPLICA_PASSWORD`.
pub fn password_env_var(alias: &str) -> String {
    let alias: String = alias
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("LEGACYSET_{}_PASSWORD", alias)
}
