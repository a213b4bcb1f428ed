//! Key-value store contract
//!
//! The store is an external collaborator: atomic single-key operations, set
//! operations, expirations, a version probe and optional server-side scripts.
//! `MemoryStore` is the in-process implementation.

use crate::command::Command;
use crate::config::ConnectionSettings;
use crate::error::Result;
use crate::types::Value;
use std::sync::Arc;

/// A live connection to a store
pub trait Store: Send + Sync {
    /// Run one named operation atomically
    fn execute(&self, command: &Command) -> Result<Value>;

    /// Whether this client can load and run scripts
    fn supports_scripting(&self) -> bool {
        false
    }
}

/// Opens connections for a given set of settings
pub trait Connector: Send + Sync {
    /// Distinguishes connectors sharing the process-wide registry
    fn scheme(&self) -> &str;

    fn open(&self, settings: &ConnectionSettings) -> Result<Arc<dyn Store>>;
}
