//! Process-wide connection table keyed by logical database alias.
//!
//! Built once at startup from [`Settings`]; the only implicit re-creation
//! is [`Connections::reconnect`], which the execution engine calls at most
//! once per failed execution.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use super::connection::DatabaseConfig;
use super::driver::{Driver, DriverConnection, DriverCursor, DriverError};
use crate::config::Settings;
use crate::error::{QuerySetError, Result};

static GLOBAL: OnceLock<Arc<Connections>> = OnceLock::new();

pub struct Connections {
    driver: Arc<dyn Driver>,
    configs: BTreeMap<String, DatabaseConfig>,
    live: Mutex<HashMap<String, Box<dyn DriverConnection>>>,
    debug: bool,
}

impl std::fmt::Debug for Connections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connections")
            .field("driver", &self.driver.name())
            .field("aliases", &self.configs.keys().collect::<Vec<_>>())
            .field("debug", &self.debug)
            .finish()
    }
}

impl Connections {
    /// Open one connection per configured alias.
    pub fn connect_all(driver: Arc<dyn Driver>, settings: &Settings) -> Result<Self> {
        let mut live = HashMap::new();
        for (alias, config) in &settings.databases {
            tracing::info!(
                alias = %alias,
                target = %config.display_string(),
                driver = driver.name(),
                "opening database connection"
            );
            live.insert(alias.clone(), driver.connect(config)?);
        }
        Ok(Self {
            driver,
            configs: settings.databases.clone(),
            live: Mutex::new(live),
            debug: settings.debug,
        })
    }

    /// Verbose mode: configuration errors are surfaced loudly.
    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }

    pub fn config(&self, alias: &str) -> Result<&DatabaseConfig> {
        self.configs
            .get(alias)
            .ok_or_else(|| QuerySetError::UnknownDatabase(alias.to_string()))
    }

    /// Open a cursor on the connection registered for `alias`.
    pub fn cursor(&self, alias: &str) -> Result<Box<dyn DriverCursor>> {
        let mut live = self.lock()?;
        let connection = live
            .get_mut(alias)
            .ok_or_else(|| QuerySetError::UnknownDatabase(alias.to_string()))?;
        Ok(connection.cursor()?)
    }

    /// Replace the connection for `alias` with a freshly established one and
    /// return a cursor on it.
    pub fn reconnect(&self, alias: &str) -> Result<Box<dyn DriverCursor>> {
        let config = self.config(alias)?;
        tracing::warn!(alias = %alias, target = %config.display_string(), "reconnecting");
        let mut connection = self.driver.connect(config)?;
        let cursor = connection.cursor()?;
        self.lock()?.insert(alias.to_string(), connection);
        Ok(cursor)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Box<dyn DriverConnection>>>> {
        self.live.lock().map_err(|_| {
            QuerySetError::Driver(DriverError::connection("connection table lock poisoned"))
        })
    }
}

/// Install the process-wide table. Fails if one is already installed.
pub fn install(connections: Connections) -> Result<Arc<Connections>> {
    let connections = Arc::new(connections);
    GLOBAL
        .set(Arc::clone(&connections))
        .map_err(|_| QuerySetError::Config("connection table already installed".into()))?;
    Ok(connections)
}

/// The installed process-wide table, if any.
pub fn global() -> Option<Arc<Connections>> {
    GLOBAL.get().cloned()
}
