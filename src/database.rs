//! Database
//!
//! One logical store connection plus its middleware chain and the registry of
//! models bound to it. Every store call made by fields, indexes and
//! collections goes through `run_command`.

use crate::command::{Command, CommandContext};
use crate::config::{ConnectionSettings, DatabaseConfig, LockConfig, ScriptingMode};
use crate::connection;
use crate::error::{Error, Result};
use crate::memory_store::MemoryConnector;
use crate::middleware::{Middleware, PreparedMiddlewares};
use crate::model::Model;
use crate::schema::ModelSchema;
use crate::store::{Connector, Store};
use crate::types::Value;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

static NEXT_DATABASE_ID: AtomicU64 = AtomicU64::new(1);

/// Builds a `Database` with a custom connector or middlewares
pub struct DatabaseBuilder {
    config: DatabaseConfig,
    connector: Arc<dyn Connector>,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl DatabaseBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Append a middleware; registration order is hook order
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn build(self) -> Result<Arc<Database>> {
        self.config.validate()?;
        let id = NEXT_DATABASE_ID.fetch_add(1, Ordering::Relaxed);
        let middlewares = PreparedMiddlewares::prepare(id, &self.middlewares)?;

        info!(
            database = id,
            connection = %self.config.connection.normalized_key(),
            middlewares = self.middlewares.len(),
            "database ready"
        );

        Ok(Arc::new(Database {
            id,
            connector: self.connector,
            settings: RwLock::new(self.config.connection),
            connection: RwLock::new(None),
            scripting: Mutex::new(None),
            scripting_mode: self.config.scripting,
            lock: self.config.lock,
            middlewares,
            models: DashMap::new(),
            discard_cache: AtomicBool::new(self.config.discard_cache),
        }))
    }
}

pub struct Database {
    id: u64,
    connector: Arc<dyn Connector>,
    settings: RwLock<ConnectionSettings>,
    connection: RwLock<Option<Arc<dyn Store>>>,
    /// Probe result, computed on first use
    scripting: Mutex<Option<bool>>,
    scripting_mode: ScriptingMode,
    lock: LockConfig,
    middlewares: PreparedMiddlewares,
    models: DashMap<String, Arc<ModelSchema>>,
    discard_cache: AtomicBool,
}

impl Database {
    pub fn builder(config: DatabaseConfig) -> DatabaseBuilder {
        DatabaseBuilder {
            config,
            connector: Arc::new(MemoryConnector::new()),
            middlewares: Vec::new(),
        }
    }

    /// In-process database without middlewares
    pub fn open(config: DatabaseConfig) -> Result<Arc<Database>> {
        Self::builder(config).build()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn settings(&self) -> ConnectionSettings {
        self.settings.read().clone()
    }

    pub fn lock_config(&self) -> &LockConfig {
        &self.lock
    }

    /// Point at new settings; the next command reconnects. Models stay registered.
    pub fn reset(&self, settings: ConnectionSettings) {
        debug!(database = self.id, connection = %settings.normalized_key(), "reset");
        *self.settings.write() = settings;
        *self.connection.write() = None;
        *self.scripting.lock() = None;
    }

    /// Shared connection for the current settings
    pub fn connection(&self) -> Result<Arc<dyn Store>> {
        if let Some(store) = self.connection.read().as_ref() {
            return Ok(Arc::clone(store));
        }
        let mut slot = self.connection.write();
        if let Some(store) = slot.as_ref() {
            return Ok(Arc::clone(store));
        }
        let store = connection::connect(self.connector.as_ref(), &self.settings.read())?;
        *slot = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Cached scripting capability of the store; never fails
    pub fn has_scripting(&self) -> bool {
        let mut cached = self.scripting.lock();
        if let Some(available) = *cached {
            return available;
        }
        let available = match self.connection() {
            Ok(store) => connection::probe_scripting(store.as_ref()),
            Err(_) => false,
        };
        debug!(database = self.id, available, "scripting probe");
        *cached = Some(available);
        available
    }

    /// Whether indexed mutations run as store scripts
    ///
    /// Bound middlewares must see every step of an indexed write as its own
    /// command, so only a database without middlewares uses scripts.
    pub fn uses_scripts(&self) -> bool {
        self.scripting_mode == ScriptingMode::Auto
            && self.middlewares.is_empty()
            && self.has_scripting()
    }

    pub fn run_command(&self, command: Command) -> Result<Value> {
        self.run_command_with_context(command, &mut CommandContext::new())
    }

    /// Run through the middleware chain with a caller-supplied context
    pub fn run_command_with_context(
        &self,
        command: Command,
        context: &mut CommandContext,
    ) -> Result<Value> {
        if self.middlewares.is_empty() {
            return self.connection()?.execute(&command);
        }
        self.middlewares
            .run(command, context, |command| self.connection()?.execute(command))
    }

    /// Register `schema`, returning the model bound to this database
    pub fn register(self: &Arc<Self>, schema: ModelSchema) -> Result<Model> {
        let schema = Arc::new(schema);
        self.add_model(Arc::clone(&schema))?;
        Ok(Model::bind(Arc::clone(self), schema))
    }

    pub(crate) fn add_model(&self, schema: Arc<ModelSchema>) -> Result<()> {
        schema.validate()?;
        if schema.is_abstract {
            return Err(Error::Configuration(format!(
                "Abstract model {} cannot be registered",
                schema.name
            )));
        }
        match self.models.entry(schema.full_name()) {
            Entry::Occupied(_) => Err(Error::Configuration(format!(
                "A model with namespace \"{}\" and name \"{}\" is already defined on this database",
                schema.namespace, schema.name
            ))),
            Entry::Vacant(entry) => {
                debug!(database = self.id, model = %schema.full_name(), "model registered");
                entry.insert(schema);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, full_name: &str) -> Option<Arc<ModelSchema>> {
        self.models.remove(full_name).map(|(_, schema)| schema)
    }

    /// Registered model by `namespace:name` (or `name`)
    pub fn model(self: &Arc<Self>, full_name: &str) -> Option<Model> {
        let schema = self.models.get(full_name).map(|s| Arc::clone(s.value()))?;
        Some(Model::bind(Arc::clone(self), schema))
    }

    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.iter().map(|m| m.key().clone()).collect();
        names.sort();
        names
    }

    pub fn discard_cache(&self) -> bool {
        self.discard_cache.load(Ordering::Relaxed)
    }

    pub fn set_discard_cache(&self, discard: bool) {
        self.discard_cache.store(discard, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id)
            .field("settings", &*self.settings.read())
            .field("models", &self.model_names())
            .finish()
    }
}
