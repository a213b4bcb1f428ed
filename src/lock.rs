//! Per-field mutual exclusion
//!
//! A lock is a marker key set with `SET key token NX PX ttl`. Acquisition
//! retries with exponential backoff until `LockConfig` bounds are exhausted;
//! the guard releases on drop, only if the marker still carries its token.
//! The compare-and-delete is one `release-lock` script call when the store
//! supports scripting.
//! Lock traffic goes straight to the connection, not through middlewares.

use crate::command::{Command, CommandName};
use crate::config::LockConfig;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::types::Value;
use rand::Rng;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Script id of the server-side compare-and-delete
pub const RELEASE_LOCK_SCRIPT: &str = "kvindex:release-lock";

/// Held lock on a `lock-for-update` key
pub struct FieldLock<'a> {
    database: &'a Database,
    key: String,
    token: String,
    released: bool,
}

impl<'a> FieldLock<'a> {
    /// Block until the lock is ours or the retry bounds are exceeded
    pub fn acquire(database: &'a Database, key: String, config: &LockConfig) -> Result<Self> {
        let token = new_token();
        let start = Instant::now();
        let mut backoff = config.initial_backoff();
        let mut attempts = 0;

        loop {
            attempts += 1;
            if try_set(database, &key, &token, config.ttl_ms)? {
                debug!(lock = %key, attempts, "lock acquired");
                return Ok(FieldLock {
                    database,
                    key,
                    token,
                    released: false,
                });
            }

            let waited = start.elapsed();
            if attempts >= config.max_attempts || waited >= config.max_wait() {
                warn!(lock = %key, attempts, ?waited, "lock acquisition timed out");
                return Err(Error::LockTimeout {
                    key,
                    attempts,
                    waited,
                });
            }

            // Jitter keeps contending writers from retrying in lockstep
            let jitter = rand::thread_rng().gen_range(0..=backoff.as_micros() as u64);
            thread::sleep(backoff + Duration::from_micros(jitter / 2));
            backoff = (backoff * 2).min(config.max_backoff());
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release now, reporting store errors instead of logging them
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        release_marker(self.database, &self.key, &self.token)
    }
}

impl Drop for FieldLock<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = release_marker(self.database, &self.key, &self.token) {
            warn!(lock = %self.key, error = %e, "failed to release lock");
        }
    }
}

fn new_token() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn try_set(database: &Database, key: &str, token: &str, ttl_ms: u64) -> Result<bool> {
    let command = Command::new(CommandName::Set, vec![Value::from(key), Value::from(token)])
        .with_kwarg("nx", 1)
        .with_kwarg("px", ttl_ms);
    Ok(!database.connection()?.execute(&command)?.is_nil())
}

/// `EVALSHA` deleting `key` only while it still holds `token`
pub fn release_script_command(key: &str, token: &str) -> Command {
    Command::new(
        CommandName::EvalSha,
        vec![
            Value::from(RELEASE_LOCK_SCRIPT),
            Value::Int(1),
            Value::from(key),
            Value::from(token),
        ],
    )
}

/// A marker we no longer own (expired, then taken) is left alone
///
/// Without scripting the compare and the delete are two commands; the
/// marker TTL must outlast the critical section for that to be safe.
fn release_marker(database: &Database, key: &str, token: &str) -> Result<()> {
    let connection = database.connection()?;
    let released = if database.has_scripting() {
        connection.execute(&release_script_command(key, token))?.is_truthy()
    } else {
        let current = connection.execute(&Command::new(CommandName::Get, vec![Value::from(key)]))?;
        current.as_str() == Some(token)
            && connection
                .execute(&Command::new(CommandName::Del, vec![Value::from(key)]))?
                .is_truthy()
    };
    if released {
        debug!(lock = %key, "lock released");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionSettings, DatabaseConfig};
    use crate::memory_store::MemoryConnector;
    use std::sync::Arc;

    fn database(db: u32) -> Arc<Database> {
        Database::open(DatabaseConfig::new(ConnectionSettings::new("lock-tests", 0, db))).unwrap()
    }

    #[test]
    fn test_lock_excludes_second_holder() {
        let db = database(1);
        let config = LockConfig {
            max_attempts: 3,
            ..Default::default()
        };

        let held = FieldLock::acquire(&db, "m:lock-for-update:f".to_string(), &config).unwrap();
        let err = match FieldLock::acquire(&db, "m:lock-for-update:f".to_string(), &config) {
            Err(e) => e,
            Ok(_) => panic!("lock acquired twice"),
        };
        assert!(err.is_lock_timeout());

        held.release().unwrap();
        assert!(FieldLock::acquire(&db, "m:lock-for-update:f".to_string(), &config).is_ok());
    }

    #[test]
    fn test_drop_releases_marker() {
        let db = database(2);
        let config = LockConfig::default();
        {
            let _lock = FieldLock::acquire(&db, "m:lock-for-update:g".to_string(), &config).unwrap();
            assert!(db.run_command(Command::new(CommandName::Exists, vec!["m:lock-for-update:g".into()]))
                .unwrap()
                .is_truthy());
        }
        let exists = db
            .run_command(Command::new(CommandName::Exists, vec!["m:lock-for-update:g".into()]))
            .unwrap();
        assert_eq!(exists, Value::Int(0));
    }

    #[test]
    fn test_foreign_marker_not_deleted() {
        let db = database(3);
        let config = LockConfig::default();
        let lock = FieldLock::acquire(&db, "m:lock-for-update:h".to_string(), &config).unwrap();
        db.run_command(Command::new(
            CommandName::Set,
            vec!["m:lock-for-update:h".into(), "someone-else".into()],
        ))
        .unwrap();
        lock.release().unwrap();

        let value = db
            .run_command(Command::new(CommandName::Get, vec!["m:lock-for-update:h".into()]))
            .unwrap();
        assert_eq!(value.as_str(), Some("someone-else"));
    }

    #[test]
    fn test_foreign_marker_not_deleted_without_scripting() {
        let db = Database::builder(DatabaseConfig::new(ConnectionSettings::new("lock-tests", 0, 4)))
            .connector(Arc::new(MemoryConnector::new().version("2.4.0")))
            .build()
            .unwrap();
        assert!(!db.has_scripting());
        let config = LockConfig::default();

        let lock = FieldLock::acquire(&db, "m:lock-for-update:i".to_string(), &config).unwrap();
        db.run_command(Command::new(
            CommandName::Set,
            vec!["m:lock-for-update:i".into(), "someone-else".into()],
        ))
        .unwrap();
        lock.release().unwrap();
        let value = db
            .run_command(Command::new(CommandName::Get, vec!["m:lock-for-update:i".into()]))
            .unwrap();
        assert_eq!(value.as_str(), Some("someone-else"));

        let lock = FieldLock::acquire(&db, "m:lock-for-update:i2".to_string(), &config).unwrap();
        lock.release().unwrap();
        let exists = db
            .run_command(Command::new(CommandName::Exists, vec!["m:lock-for-update:i2".into()]))
            .unwrap();
        assert_eq!(exists, Value::Int(0));
    }
}
