//! kvindex - object mapping over a key-value store
//!
//! Application models keep their fields in a Redis-like store while kvindex
//! maintains secondary indexes, enforces unique fields and caches reads.
//!
//! # Architecture
//!
//! - Connection Layer: process-wide connection registry, scripting probe
//! - Command Pipeline: every store call flows through the middleware chain
//! - Field Layer: per-instance field proxies dispatching on static op tables
//! - Index Layer: deindex/reindex under a per-field lock, or as one store script
//! - Query Layer: collections as intersections of index sets
//! - Cache Layer: per-field getter cache cleared by any write

pub mod error;
pub mod types;
pub mod config;
pub mod logging;

// Command pipeline
pub mod command;
pub mod middleware;
pub mod metrics;

// Store and connections
pub mod store;
pub mod memory_store;
pub mod connection;
pub mod database;

// Models and indexes
pub mod schema;
pub mod lock;
pub mod index;
pub mod cache;
pub mod field;
pub mod model;
pub mod collection;

pub use error::{Error, Result};
pub use types::{make_key, Value};
pub use config::{ConnectionSettings, DatabaseConfig, LockConfig, ScriptingMode};
pub use logging::init_logging;

// Pipeline exports
pub use command::{Command, CommandContext, CommandName, CommandResult};
pub use middleware::{HookSet, LoggingMiddleware, Middleware, MiddlewareBinding, PreparedMiddlewares};
pub use metrics::MetricsMiddleware;

// Store exports
pub use store::{Connector, Store};
pub use memory_store::{MemoryConnector, MemoryStore};
pub use database::{Database, DatabaseBuilder};

// Model exports
pub use schema::{FieldDef, FieldKind, ModelSchema, OpClass, PkKind, SetterKind, PK_FIELD};
pub use lock::FieldLock;
pub use index::{IndexEngine, IndexedMutation, MutationOutcome};
pub use cache::{CacheKey, FieldCache};
pub use field::FieldProxy;
pub use model::{Instance, Model};
pub use collection::Collection;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
