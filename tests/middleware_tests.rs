//! Middleware Chain Tests
//!
//! Middlewares installed on a `Database` see every command its models send.

use kvindex::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

static NEXT_DB: AtomicU32 = AtomicU32::new(1);

fn config() -> DatabaseConfig {
    let db = NEXT_DB.fetch_add(1, Ordering::Relaxed);
    DatabaseConfig::new(ConnectionSettings::new("middleware-tests", 6379, db))
}

/// Replaces the value of every `hset`
struct ForceSetterMiddleware {
    binding: MiddlewareBinding,
    value: &'static str,
}

impl Middleware for ForceSetterMiddleware {
    fn binding(&self) -> &MiddlewareBinding {
        &self.binding
    }

    fn hooks(&self) -> HookSet {
        HookSet::PRE
    }

    fn pre_command(
        &self,
        command: &mut Command,
        _context: &mut CommandContext,
    ) -> Result<Option<CommandResult>> {
        if command.name == CommandName::HSet && command.args.len() >= 3 {
            command.args[2] = Value::from(self.value);
            command.kwargs.clear();
        }
        Ok(None)
    }
}

/// Replaces the result of every `hget`
struct ForceGetterMiddleware {
    binding: MiddlewareBinding,
    value: &'static str,
}

impl Middleware for ForceGetterMiddleware {
    fn binding(&self) -> &MiddlewareBinding {
        &self.binding
    }

    fn hooks(&self) -> HookSet {
        HookSet::POST
    }

    fn post_command(
        &self,
        command: &Command,
        mut result: CommandResult,
        _context: &mut CommandContext,
    ) -> Result<CommandResult> {
        if command.name == CommandName::HGet {
            result.value = Value::from(self.value);
        }
        Ok(result)
    }
}

/// Journals hook calls as "<name> pre <command>" / "<name> post <command>"
struct Recorder {
    binding: MiddlewareBinding,
    name: &'static str,
    journal: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn new(name: &'static str, journal: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Recorder {
            binding: MiddlewareBinding::new(),
            name,
            journal: Arc::clone(journal),
        })
    }
}

impl Middleware for Recorder {
    fn binding(&self) -> &MiddlewareBinding {
        &self.binding
    }

    fn hooks(&self) -> HookSet {
        HookSet::BOTH
    }

    fn pre_command(
        &self,
        command: &mut Command,
        _context: &mut CommandContext,
    ) -> Result<Option<CommandResult>> {
        self.journal
            .lock()
            .push(format!("{} pre {}", self.name, command.name));
        Ok(None)
    }

    fn post_command(
        &self,
        command: &Command,
        result: CommandResult,
        _context: &mut CommandContext,
    ) -> Result<CommandResult> {
        self.journal
            .lock()
            .push(format!("{} post {}", self.name, command.name));
        Ok(result)
    }
}

/// Answers every `get` itself
struct Shortcut {
    binding: MiddlewareBinding,
}

impl Middleware for Shortcut {
    fn binding(&self) -> &MiddlewareBinding {
        &self.binding
    }

    fn hooks(&self) -> HookSet {
        HookSet::PRE
    }

    fn pre_command(
        &self,
        command: &mut Command,
        _context: &mut CommandContext,
    ) -> Result<Option<CommandResult>> {
        if command.name == CommandName::Get {
            return Ok(Some(CommandResult::new(Value::from("short"))));
        }
        Ok(None)
    }
}

fn foo_model(database: &Arc<Database>) -> Model {
    database
        .register(
            ModelSchema::new("thing")
                .namespace("middlewares")
                .cacheable(false)
                .field(FieldDef::instance_hash("foo")),
        )
        .unwrap()
}

#[test]
fn test_setter_and_getter_overrides() {
    let database = Database::builder(config())
        .middleware(Arc::new(ForceSetterMiddleware {
            binding: MiddlewareBinding::new(),
            value: "SETTER",
        }))
        .middleware(Arc::new(ForceGetterMiddleware {
            binding: MiddlewareBinding::new(),
            value: "GETTER",
        }))
        .build()
        .unwrap();
    let model = foo_model(&database);

    let thing = model.create(&[("foo", "bar".into())]).unwrap();

    // hget is rewritten on the way back
    assert_eq!(thing.field("foo").unwrap().get().unwrap(), Value::from("GETTER"));
    // hmget shows what the setter really wrote
    assert_eq!(thing.hmget(&["foo"]).unwrap(), vec![Value::from("SETTER")]);
}

#[test]
fn test_getter_only() {
    let database = Database::builder(config())
        .middleware(Arc::new(ForceGetterMiddleware {
            binding: MiddlewareBinding::new(),
            value: "GETTER",
        }))
        .build()
        .unwrap();
    let model = foo_model(&database);

    let thing = model.create(&[("foo", "bar".into())]).unwrap();
    assert_eq!(thing.field("foo").unwrap().get().unwrap(), Value::from("GETTER"));
    assert_eq!(thing.hmget(&["foo"]).unwrap(), vec![Value::from("bar")]);
}

fn indexed_foo_model(database: &Arc<Database>) -> Model {
    database
        .register(
            ModelSchema::new("indexed_thing")
                .namespace("middlewares")
                .cacheable(false)
                .field(FieldDef::instance_hash("foo").indexable()),
        )
        .unwrap()
}

fn setter_middleware() -> Arc<ForceSetterMiddleware> {
    Arc::new(ForceSetterMiddleware {
        binding: MiddlewareBinding::new(),
        value: "SETTER",
    })
}

fn indexed_setter_and_getter_overrides(scripting: ScriptingMode) {
    let mut config = config();
    config.scripting = scripting;
    let database = Database::builder(config)
        .middleware(setter_middleware())
        .middleware(Arc::new(ForceGetterMiddleware {
            binding: MiddlewareBinding::new(),
            value: "GETTER",
        }))
        .build()
        .unwrap();
    let model = indexed_foo_model(&database);

    let thing = model.create(&[("foo", "bar".into())]).unwrap();
    thing.field("foo").unwrap().set("baz").unwrap();

    assert_eq!(thing.field("foo").unwrap().get().unwrap(), Value::from("GETTER"));
    assert_eq!(thing.hmget(&["foo"]).unwrap(), vec![Value::from("SETTER")]);
}

#[test]
fn test_indexed_setter_and_getter_overrides() {
    indexed_setter_and_getter_overrides(ScriptingMode::Auto);
    indexed_setter_and_getter_overrides(ScriptingMode::Disabled);
}

fn indexed_setter_override(scripting: ScriptingMode) {
    let mut config = config();
    config.scripting = scripting;
    let database = Database::builder(config)
        .middleware(setter_middleware())
        .build()
        .unwrap();
    let model = indexed_foo_model(&database);

    let thing = model.create(&[("foo", "bar".into())]).unwrap();
    thing.field("foo").unwrap().set("baz").unwrap();

    assert_eq!(thing.field("foo").unwrap().get().unwrap(), Value::from("SETTER"));
    // the index follows the value really written
    let owners = model.collection().filter("foo", "SETTER").unwrap().pks().unwrap();
    assert_eq!(owners, vec![thing.pk()]);
    assert!(model.collection().filter("foo", "baz").unwrap().pks().unwrap().is_empty());
    assert!(model.collection().filter("foo", "bar").unwrap().pks().unwrap().is_empty());
}

#[test]
fn test_indexed_setter_override() {
    indexed_setter_override(ScriptingMode::Auto);
    indexed_setter_override(ScriptingMode::Disabled);
}

#[test]
fn test_pre_hooks_in_order_post_hooks_reversed() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let database = Database::builder(config())
        .middleware(Recorder::new("a", &journal))
        .middleware(Recorder::new("b", &journal))
        .build()
        .unwrap();

    database
        .run_command(Command::new(CommandName::Set, vec!["k".into(), "v".into()]))
        .unwrap();

    assert_eq!(
        *journal.lock(),
        vec!["a pre set", "b pre set", "b post set", "a post set"]
    );
}

#[test]
fn test_short_circuit_skips_store_and_later_pre_hooks() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let database = Database::builder(config())
        .middleware(Arc::new(Shortcut {
            binding: MiddlewareBinding::new(),
        }))
        .middleware(Recorder::new("after", &journal))
        .build()
        .unwrap();

    let reply = database
        .run_command(Command::new(CommandName::Get, vec!["k".into()]))
        .unwrap();
    assert_eq!(reply, Value::from("short"));
    // post hooks still see the short-circuited result
    assert_eq!(*journal.lock(), vec!["after post get"]);

    database
        .run_command(Command::new(CommandName::Set, vec!["k".into(), "v".into()]))
        .unwrap();
    assert_eq!(
        database.connection().unwrap().execute(&Command::new(CommandName::Get, vec!["k".into()])).unwrap(),
        Value::from("v")
    );
}

#[test]
fn test_middleware_cannot_change_database() {
    let logger = Arc::new(LoggingMiddleware::new(false));
    Database::builder(config())
        .middleware(logger.clone())
        .build()
        .unwrap();

    let err = Database::builder(config())
        .middleware(logger.clone())
        .build()
        .unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_logging_middleware_numbers_commands() {
    let logger = Arc::new(LoggingMiddleware::new(true));
    let database = Database::builder(config())
        .middleware(logger.clone())
        .build()
        .unwrap();
    let model = foo_model(&database);

    let thing = model.create(&[("foo", "bar".into())]).unwrap();
    let before = logger.command_count();
    assert!(before > 0);

    thing.field("foo").unwrap().set("baz").unwrap();
    thing.field("foo").unwrap().get().unwrap();
    assert_eq!(logger.command_count(), before + 2);
}

#[test]
fn test_metrics_middleware() {
    let metrics = Arc::new(MetricsMiddleware::new().unwrap());
    let database = Database::builder(config())
        .middleware(metrics.clone())
        .build()
        .unwrap();
    let model = foo_model(&database);

    let thing = model.create(&[("foo", "bar".into())]).unwrap();
    thing.field("foo").unwrap().get().unwrap();
    thing.field("foo").unwrap().get().unwrap();

    assert_eq!(metrics.command_total("hset"), 1.0);
    assert_eq!(metrics.command_total("hget"), 2.0);
    let text = metrics.gather().unwrap();
    assert!(text.contains("kvindex_commands_total"));
    assert!(text.contains("kvindex_command_duration_seconds"));
}

fn indexed_setter_journal(scripting: ScriptingMode) -> Vec<String> {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut config = config();
    config.scripting = scripting;
    let database = Database::builder(config)
        .middleware(Recorder::new("r", &journal))
        .build()
        .unwrap();
    let model = database
        .register(ModelSchema::new("journaled").field(FieldDef::string("name").indexable()))
        .unwrap();
    let item = model.create(&[]).unwrap();

    journal.lock().clear();
    item.field("name").unwrap().set("x").unwrap();
    let lines = journal.lock().clone();
    lines
}

#[test]
fn test_indexed_setter_steps_visible_in_both_modes() {
    let expected = vec![
        "r pre get",
        "r post get",
        "r pre set",
        "r post set",
        "r pre get",
        "r post get",
        "r pre sadd",
        "r post sadd",
    ];
    // the lock marker bypasses the chain
    assert_eq!(indexed_setter_journal(ScriptingMode::Disabled), expected);
    assert_eq!(indexed_setter_journal(ScriptingMode::Auto), expected);
}
