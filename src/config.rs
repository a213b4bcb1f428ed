//! Database configuration
//!
//! Connection coordinates, lock acquisition bounds and cache/scripting
//! switches. Everything derives serde so a config can be loaded from JSON.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Coordinates of one logical store connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub db: u32,
    /// Any other connection option (unix socket path, password, ...)
    pub extra: BTreeMap<String, String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            extra: BTreeMap::new(),
        }
    }
}

impl ConnectionSettings {
    pub fn new(host: &str, port: u16, db: u32) -> Self {
        ConnectionSettings {
            host: host.to_string(),
            port,
            db,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, name: &str, value: &str) -> Self {
        self.extra.insert(name.to_string(), value.to_string());
        self
    }

    /// Registry key: every setting value, ordered by setting name, joined by `:`
    ///
    /// Structurally identical settings always produce the same key.
    pub fn normalized_key(&self) -> String {
        let mut all: BTreeMap<&str, String> = BTreeMap::new();
        all.insert("db", self.db.to_string());
        all.insert("host", self.host.clone());
        all.insert("port", self.port.to_string());
        for (name, value) in &self.extra {
            all.insert(name.as_str(), value.clone());
        }
        all.into_values().collect::<Vec<_>>().join(":")
    }
}

/// Bounds of the per-field lock retry loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Maximum number of acquisition attempts
    pub max_attempts: u32,
    /// First backoff sleep (doubled after each failed attempt)
    pub initial_backoff_ms: u64,
    /// Backoff ceiling
    pub max_backoff_ms: u64,
    /// Total time budget for acquisition
    pub max_wait_ms: u64,
    /// Expiration of the marker key, so a crashed holder can't block forever
    pub ttl_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            max_attempts: 200,
            initial_backoff_ms: 1,
            max_backoff_ms: 50,
            max_wait_ms: 10_000,
            ttl_ms: 30_000,
        }
    }
}

impl LockConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Configuration(
                "lock max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(Error::Configuration(
                "lock initial_backoff_ms cannot be greater than max_backoff_ms".to_string(),
            ));
        }
        if self.ttl_ms == 0 {
            return Err(Error::Configuration(
                "lock ttl_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Whether the index engine may use server-side scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptingMode {
    /// Use scripts when the store reports the capability
    Auto,
    /// Always use the lock-based protocol
    Disabled,
}

impl Default for ScriptingMode {
    fn default() -> Self {
        ScriptingMode::Auto
    }
}

/// Configuration of a `Database`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub connection: ConnectionSettings,
    /// Globally bypass the per-field result cache
    pub discard_cache: bool,
    pub scripting: ScriptingMode,
    pub lock: LockConfig,
}

impl DatabaseConfig {
    pub fn new(connection: ConnectionSettings) -> Self {
        DatabaseConfig {
            connection,
            ..Default::default()
        }
    }

    /// Parse and validate a JSON document; missing sections take defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: DatabaseConfig = serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("Invalid database config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.lock.validate()
    }
}
