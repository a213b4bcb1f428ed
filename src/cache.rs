//! Per-Field Result Cache
//!
//! Getter results of one bound field, keyed by a digest of the full call
//! (command name, positional and keyword arguments). Any modifier on the
//! field clears the whole cache.

use crate::command::Command;
use crate::types::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Digest of one call; argument order and kwargs both count
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// `None` when the call cannot be serialized
    pub fn for_command(command: &Command) -> Option<CacheKey> {
        let encoded = bincode::serialize(command).ok()?;
        let digest = Sha256::digest(&encoded);
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Some(CacheKey(key))
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FieldCache {
    entries: HashMap<CacheKey, Value>,
    hits: u64,
}

impl FieldCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, key: &CacheKey) -> Option<Value> {
        let value = self.entries.get(key).cloned();
        if value.is_some() {
            self.hits += 1;
            debug!(key = ?key, "cache hit");
        }
        value
    }

    pub fn insert(&mut self, key: CacheKey, value: Value) {
        self.entries.insert(key, value);
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            debug!(entries = self.entries.len(), "cache cleared");
        }
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }
}
