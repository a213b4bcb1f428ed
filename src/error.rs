//! Error types for kvindex

use std::time::Duration;
use thiserror::Error;

/// Result type for every kvindex operation
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of field operations and collection queries
#[derive(Debug, Error)]
pub enum Error {
    /// Misuse of the API detected before touching the store: duplicate model
    /// registration, middleware rebinding, filtering on a non-indexable field,
    /// incompatible field options.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A unique field value is already owned by another instance
    #[error("Uniqueness violation on {key}: value already owned by {owner}")]
    Uniqueness { key: String, owner: String },

    /// The per-field lock could not be acquired within its bounds
    #[error("Could not acquire lock {key} after {attempts} attempts ({waited:?})")]
    LockTimeout {
        key: String,
        attempts: u32,
        waited: Duration,
    },

    /// Error reported by the underlying store (propagated as-is)
    #[error("Store error: {0}")]
    Store(String),

    /// No instance matches a pk or a filter
    #[error("Does not exist: {0}")]
    DoesNotExist(String),

    /// Bad argument passed to an operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The command is not part of the field kind's vocabulary
    #[error("Command {command} is not available for field {field}")]
    UnsupportedCommand { command: String, field: String },
}

impl Error {
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }

    pub fn is_uniqueness(&self) -> bool {
        matches!(self, Error::Uniqueness { .. })
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Error::LockTimeout { .. })
    }

    pub fn is_does_not_exist(&self) -> bool {
        matches!(self, Error::DoesNotExist(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Uniqueness {
            key: "bike:name:rosalie".to_string(),
            owner: "1".to_string(),
        };
        assert!(err.is_uniqueness());
        assert_eq!(
            err.to_string(),
            "Uniqueness violation on bike:name:rosalie: value already owned by 1"
        );

        let err = Error::LockTimeout {
            key: "bike:lock-for-update:name".to_string(),
            attempts: 3,
            waited: Duration::from_millis(10),
        };
        assert!(err.is_lock_timeout());
        assert!(err.to_string().contains("3 attempts"));
    }
}
