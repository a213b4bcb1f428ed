//! Store Connection Facade
//!
//! Connections are memoized process-wide, keyed by connector scheme plus the
//! normalized settings, so structurally identical settings share one handle.

use crate::command::{Command, CommandName};
use crate::config::ConnectionSettings;
use crate::error::Result;
use crate::store::{Connector, Store};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Oldest server version with scripting
pub const MIN_SCRIPTING_VERSION: (u32, u32) = (2, 5);

static CONNECTIONS: Lazy<Mutex<HashMap<String, Arc<dyn Store>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn registry_key(connector: &dyn Connector, settings: &ConnectionSettings) -> String {
    format!("{}://{}", connector.scheme(), settings.normalized_key())
}

/// Get the shared connection for `settings`, opening it on first use
pub fn connect(connector: &dyn Connector, settings: &ConnectionSettings) -> Result<Arc<dyn Store>> {
    let key = registry_key(connector, settings);
    // Held across `open` so two first callers can't both create one
    let mut connections = CONNECTIONS.lock();
    if let Some(store) = connections.get(&key) {
        return Ok(Arc::clone(store));
    }

    debug!(connection = %key, "opening connection");
    let store = connector.open(settings)?;
    connections.insert(key, Arc::clone(&store));
    Ok(store)
}

/// Forget a registered connection; the next `connect` opens a fresh one
pub fn disconnect(connector: &dyn Connector, settings: &ConnectionSettings) -> bool {
    CONNECTIONS
        .lock()
        .remove(&registry_key(connector, settings))
        .is_some()
}

pub fn connection_count() -> usize {
    CONNECTIONS.lock().len()
}

/// `(major, minor)` from an `INFO` reply
pub fn parse_version(info: &str) -> Option<(u32, u32)> {
    let line = info
        .lines()
        .find_map(|line| line.trim().strip_prefix("redis_version:"))?;
    let mut parts = line.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn scripting_available(store: &dyn Store) -> Result<bool> {
    let info = store.execute(&Command::new(CommandName::Info, Vec::new()))?;
    let version = info.as_str().and_then(parse_version);
    Ok(matches!(version, Some(v) if v >= MIN_SCRIPTING_VERSION) && store.supports_scripting())
}

/// Whether the server and the client both support scripts; never fails
pub fn probe_scripting(store: &dyn Store) -> bool {
    match scripting_available(store) {
        Ok(available) => available,
        Err(e) => {
            warn!(error = %e, "scripting probe failed, falling back to locks");
            false
        }
    }
}
