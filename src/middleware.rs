//! Command Pipeline & Middleware Chain
//!
//! Middlewares intercept every command a `Database` runs:
//!
//! - pre-command hooks run in registration order; the first one returning
//!   `Some(result)` short-circuits the store call
//! - post-command hooks run in reverse registration order, each replacing the
//!   result
//!
//! Which hooks a middleware provides is declared through `hooks()` and
//! resolved once, when the database prepares its chain.

use crate::command::{Command, CommandContext, CommandResult};
use crate::error::{Error, Result};
use crate::types::Value;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Hooks a middleware implements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookSet {
    pub pre_command: bool,
    pub post_command: bool,
}

impl HookSet {
    pub const BOTH: HookSet = HookSet {
        pre_command: true,
        post_command: true,
    };
    pub const PRE: HookSet = HookSet {
        pre_command: true,
        post_command: false,
    };
    pub const POST: HookSet = HookSet {
        pre_command: false,
        post_command: true,
    };
}

/// The database a middleware is bound to, fixed on first bind
#[derive(Debug, Default)]
pub struct MiddlewareBinding {
    database: OnceCell<u64>,
}

impl MiddlewareBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to `database_id`; rebinding to another database is refused
    pub fn bind(&self, database_id: u64) -> Result<()> {
        let bound = *self.database.get_or_init(|| database_id);
        if bound != database_id {
            return Err(Error::Configuration(format!(
                "Cannot change the database of a middleware (bound to database #{}, not #{})",
                bound, database_id
            )));
        }
        Ok(())
    }

    pub fn database_id(&self) -> Option<u64> {
        self.database.get().copied()
    }
}

/// Interceptor of outgoing commands and their results
pub trait Middleware: Send + Sync {
    fn binding(&self) -> &MiddlewareBinding;

    fn hooks(&self) -> HookSet;

    /// May rewrite `command`; `Some(result)` skips the store call
    fn pre_command(
        &self,
        _command: &mut Command,
        _context: &mut CommandContext,
    ) -> Result<Option<CommandResult>> {
        Ok(None)
    }

    fn post_command(
        &self,
        _command: &Command,
        result: CommandResult,
        _context: &mut CommandContext,
    ) -> Result<CommandResult> {
        Ok(result)
    }
}

/// Hook lists of one database, resolved once
#[derive(Default)]
pub struct PreparedMiddlewares {
    pre_command: Vec<Arc<dyn Middleware>>,
    post_command: Vec<Arc<dyn Middleware>>,
}

impl PreparedMiddlewares {
    /// Bind every middleware to `database_id` and sort out its hooks
    pub fn prepare(database_id: u64, middlewares: &[Arc<dyn Middleware>]) -> Result<Self> {
        let mut prepared = PreparedMiddlewares::default();
        for middleware in middlewares {
            middleware.binding().bind(database_id)?;
            let hooks = middleware.hooks();
            if hooks.pre_command {
                prepared.pre_command.push(Arc::clone(middleware));
            }
            if hooks.post_command {
                prepared.post_command.push(Arc::clone(middleware));
            }
        }
        prepared.post_command.reverse();
        Ok(prepared)
    }

    pub fn is_empty(&self) -> bool {
        self.pre_command.is_empty() && self.post_command.is_empty()
    }

    /// Run `command` through the chain, `execute` being the real store call
    pub fn run<F>(&self, mut command: Command, context: &mut CommandContext, execute: F) -> Result<Value>
    where
        F: FnOnce(&Command) -> Result<Value>,
    {
        let mut short_circuit = None;
        for middleware in &self.pre_command {
            if let Some(result) = middleware.pre_command(&mut command, context)? {
                short_circuit = Some(result);
                break;
            }
        }

        let mut result = match short_circuit {
            Some(result) => result,
            None => CommandResult::from(execute(&command)?),
        };

        for middleware in &self.post_command {
            result = middleware.post_command(&command, result, context)?;
        }

        Ok(result.value)
    }
}

const COMMAND_NUMBER: &str = "_command_number";
const START_TIME: &str = "_start_time";

/// Logs each command, and optionally its result and duration
pub struct LoggingMiddleware {
    binding: MiddlewareBinding,
    counter: AtomicU64,
    log_results: bool,
}

impl LoggingMiddleware {
    pub fn new(log_results: bool) -> Self {
        LoggingMiddleware {
            binding: MiddlewareBinding::new(),
            counter: AtomicU64::new(0),
            log_results,
        }
    }

    /// Commands seen so far
    pub fn command_count(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Middleware for LoggingMiddleware {
    fn binding(&self) -> &MiddlewareBinding {
        &self.binding
    }

    fn hooks(&self) -> HookSet {
        HookSet {
            pre_command: true,
            post_command: self.log_results,
        }
    }

    fn pre_command(
        &self,
        command: &mut Command,
        context: &mut CommandContext,
    ) -> Result<Option<CommandResult>> {
        let number = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        context.insert(COMMAND_NUMBER, number);
        context.insert(START_TIME, Instant::now());
        info!("[#{}] {}", number, command);
        Ok(None)
    }

    fn post_command(
        &self,
        _command: &Command,
        result: CommandResult,
        context: &mut CommandContext,
    ) -> Result<CommandResult> {
        let number = context.get::<u64>(COMMAND_NUMBER).copied().unwrap_or_default();
        let elapsed = context
            .get::<Instant>(START_TIME)
            .map(|start| start.elapsed().as_micros())
            .unwrap_or_default();
        info!("[#{}, in {}µs] {}", number, elapsed, result);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandName;
    use parking_lot::Mutex;

    struct Recorder {
        binding: MiddlewareBinding,
        name: &'static str,
        journal: Arc<Mutex<Vec<String>>>,
        answer: Option<Value>,
    }

    impl Recorder {
        fn new(name: &'static str, journal: &Arc<Mutex<Vec<String>>>) -> Self {
            Recorder {
                binding: MiddlewareBinding::new(),
                name,
                journal: Arc::clone(journal),
                answer: None,
            }
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
            _command: &mut Command,
            _context: &mut CommandContext,
        ) -> Result<Option<CommandResult>> {
            self.journal.lock().push(format!("pre {}", self.name));
            Ok(self.answer.clone().map(CommandResult::new))
        }

        fn post_command(
            &self,
            _command: &Command,
            result: CommandResult,
            _context: &mut CommandContext,
        ) -> Result<CommandResult> {
            self.journal.lock().push(format!("post {}", self.name));
            Ok(result)
        }
    }

    fn get() -> Command {
        Command::new(CommandName::Get, vec!["k".into()])
    }

    #[test]
    fn test_hook_order() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recorder::new("a", &journal)),
            Arc::new(Recorder::new("b", &journal)),
        ];
        let prepared = PreparedMiddlewares::prepare(1, &chain).unwrap();

        let value = prepared
            .run(get(), &mut CommandContext::new(), |_| Ok(Value::from("stored")))
            .unwrap();

        assert_eq!(value, Value::from("stored"));
        assert_eq!(*journal.lock(), vec!["pre a", "pre b", "post b", "post a"]);
    }

    #[test]
    fn test_short_circuit_skips_store_and_later_pre_hooks() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut first = Recorder::new("a", &journal);
        first.answer = Some(Value::from("cached"));
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(first), Arc::new(Recorder::new("b", &journal))];
        let prepared = PreparedMiddlewares::prepare(1, &chain).unwrap();

        let value = prepared
            .run(get(), &mut CommandContext::new(), |_| panic!("store must not be called"))
            .unwrap();

        assert_eq!(value, Value::from("cached"));
        assert_eq!(*journal.lock(), vec!["pre a", "post b", "post a"]);
    }

    #[test]
    fn test_rebinding_refused() {
        let middleware: Arc<dyn Middleware> = Arc::new(LoggingMiddleware::new(true));
        let chain = vec![Arc::clone(&middleware)];

        assert!(PreparedMiddlewares::prepare(1, &chain).is_ok());
        assert!(PreparedMiddlewares::prepare(1, &chain).is_ok());
        let err = PreparedMiddlewares::prepare(2, &chain).err().unwrap();
        assert!(err.is_configuration());
        assert_eq!(middleware.binding().database_id(), Some(1));
    }

    #[test]
    fn test_logging_middleware_numbers_commands() {
        let logging = Arc::new(LoggingMiddleware::new(false));
        let chain: Vec<Arc<dyn Middleware>> = vec![logging.clone()];
        let prepared = PreparedMiddlewares::prepare(9, &chain).unwrap();

        for _ in 0..3 {
            prepared
                .run(get(), &mut CommandContext::new(), |_| Ok(Value::Nil))
                .unwrap();
        }
        assert_eq!(logging.command_count(), 3);
        assert!(!logging.hooks().post_command);
    }
}
