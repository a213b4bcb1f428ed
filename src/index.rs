//! Index Maintenance Engine
//!
//! Keeps `pk ∈ index(model, field, value)` in step with the live value of
//! every indexable field. One mutation runs the steps:
//!
//! 1. lock `(model, field[, pk])`
//! 2. read the old value
//! 3. deindex it
//! 4. run the store mutation
//! 5. re-read the new value
//! 6. check the uniqueness ledger (unique fields)
//! 7. reindex
//! 8. release the lock
//!
//! Steps 2–7 live in `execute_mutation`, written against `CommandRunner` so the
//! very same sequence runs either client-side through the middleware chain
//! (under the lock) or inside the store as the `indexed-mutation` script.

use crate::command::{Command, CommandName};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::lock::FieldLock;
use crate::schema::{FieldDef, FieldKind, ModelSchema, SetterKind};
use crate::types::{make_key, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Script id of the server-side indexed mutation
pub const INDEXED_MUTATION_SCRIPT: &str = "kvindex:indexed-mutation";

const STATUS_APPLIED: i64 = 0;
const STATUS_NOT_APPLIED: i64 = 1;
const STATUS_CONFLICT: i64 = 2;

/// Executes single commands on behalf of `execute_mutation`
pub trait CommandRunner {
    fn run(&mut self, command: Command) -> Result<Value>;
}

/// Everything needed to run one indexed mutation
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedMutation {
    pub storage_key: String,
    /// Entry name inside the instance hash for `InstanceHash` fields
    pub hash_field: Option<String>,
    pub index_prefix: String,
    pub pk: String,
    pub unique: bool,
    pub kind: SetterKind,
    pub operation: CommandName,
    /// Arguments after the key (and hash entry name)
    pub op_args: Vec<Value>,
    pub op_kwargs: BTreeMap<String, Value>,
}

/// Result of an indexed mutation
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Applied {
        old: Option<String>,
        new: Option<String>,
        result: Value,
    },
    /// Conditional operation whose condition did not hold; nothing changed
    NotApplied { result: Value },
    /// Another pk owns the new value of a unique field
    Conflict { index_key: String, owner: String },
}

impl IndexedMutation {
    pub fn for_field(
        schema: &ModelSchema,
        field: &FieldDef,
        pk: &str,
        kind: SetterKind,
        operation: CommandName,
        op_args: Vec<Value>,
        op_kwargs: BTreeMap<String, Value>,
    ) -> Self {
        IndexedMutation {
            storage_key: schema.field_key(field, pk),
            hash_field: match field.kind {
                FieldKind::InstanceHash => Some(field.name.clone()),
                _ => None,
            },
            index_prefix: schema.index_prefix(field),
            pk: pk.to_string(),
            unique: field.unique,
            kind,
            operation,
            op_args,
            op_kwargs,
        }
    }

    pub fn index_key(&self, value: &str) -> String {
        make_key([self.index_prefix.as_str(), value])
    }

    fn key_args(&self) -> Vec<Value> {
        let mut args = vec![Value::Str(self.storage_key.clone())];
        if let Some(entry) = &self.hash_field {
            args.push(Value::Str(entry.clone()));
        }
        args
    }

    pub fn operation_command(&self) -> Command {
        let mut args = self.key_args();
        args.extend(self.op_args.iter().cloned());
        Command {
            name: self.operation,
            args,
            kwargs: self.op_kwargs.clone(),
        }
    }

    fn read_command(&self) -> Command {
        let name = if self.hash_field.is_some() {
            CommandName::HGet
        } else {
            CommandName::Get
        };
        Command::new(name, self.key_args())
    }

    fn restore_command(&self, old: Option<&str>) -> Command {
        let mut args = self.key_args();
        match (old, self.hash_field.is_some()) {
            (Some(value), true) => {
                args.push(Value::from(value));
                Command::new(CommandName::HSet, args)
            }
            (Some(value), false) => {
                args.push(Value::from(value));
                Command::new(CommandName::Set, args)
            }
            (None, true) => Command::new(CommandName::HDel, args),
            (None, false) => Command::new(CommandName::Del, args),
        }
    }

    /// Encode as an `EVALSHA` command
    pub fn to_script_command(&self) -> Command {
        let mut args = vec![
            Value::from(INDEXED_MUTATION_SCRIPT),
            Value::Int(1),
            Value::Str(self.storage_key.clone()),
            Value::Str(self.hash_field.clone().unwrap_or_default()),
            Value::Str(self.index_prefix.clone()),
            Value::Str(self.pk.clone()),
            Value::Int(self.unique as i64),
            Value::from(self.kind.as_str()),
            Value::from(self.operation.as_str()),
            Value::Int(self.op_args.len() as i64),
        ];
        args.extend(self.op_args.iter().cloned());
        for (name, value) in &self.op_kwargs {
            args.push(Value::Str(name.clone()));
            args.push(value.clone());
        }
        Command::new(CommandName::EvalSha, args)
    }

    /// Decode the arguments of an `EVALSHA` command built by `to_script_command`
    pub fn from_script_args(args: &[Value]) -> Result<Self> {
        let text = |i: usize| -> Result<String> {
            args.get(i)
                .and_then(Value::to_store_string)
                .ok_or_else(|| Error::Store(format!("ERR missing script argument {}", i)))
        };
        if text(0)? != INDEXED_MUTATION_SCRIPT {
            return Err(Error::Store("NOSCRIPT No matching script".to_string()));
        }
        let hash_field = text(3)?;
        let kind = SetterKind::parse(&text(7)?)
            .ok_or_else(|| Error::Store("ERR unknown setter kind".to_string()))?;
        let operation = CommandName::parse(&text(8)?)
            .ok_or_else(|| Error::Store("ERR unknown script operation".to_string()))?;
        let count = args
            .get(9)
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Store("ERR missing argument count".to_string()))?
            as usize;
        let rest = args.get(10..).unwrap_or(&[]);
        if rest.len() < count {
            return Err(Error::Store("ERR wrong number of script arguments".to_string()));
        }
        let (op_args, kwargs) = rest.split_at(count);
        let mut op_kwargs = BTreeMap::new();
        for pair in kwargs.chunks(2) {
            if let [name, value] = pair {
                if let Some(name) = name.to_store_string() {
                    op_kwargs.insert(name, value.clone());
                }
            }
        }

        Ok(IndexedMutation {
            storage_key: text(2)?,
            hash_field: if hash_field.is_empty() { None } else { Some(hash_field) },
            index_prefix: text(4)?,
            pk: text(5)?,
            unique: args.get(6).map(Value::is_truthy).unwrap_or(false),
            kind,
            operation,
            op_args: op_args.to_vec(),
            op_kwargs,
        })
    }
}

impl MutationOutcome {
    /// Script reply form
    pub fn to_reply(&self) -> Value {
        let opt = |v: &Option<String>| v.clone().map(Value::Str).unwrap_or(Value::Nil);
        match self {
            MutationOutcome::Applied { old, new, result } => Value::Array(vec![
                Value::Int(STATUS_APPLIED),
                opt(old),
                opt(new),
                result.clone(),
            ]),
            MutationOutcome::NotApplied { result } => Value::Array(vec![
                Value::Int(STATUS_NOT_APPLIED),
                Value::Nil,
                Value::Nil,
                result.clone(),
            ]),
            MutationOutcome::Conflict { index_key, owner } => Value::Array(vec![
                Value::Int(STATUS_CONFLICT),
                Value::Str(index_key.clone()),
                Value::Str(owner.clone()),
                Value::Nil,
            ]),
        }
    }

    pub fn from_reply(reply: Value) -> Result<Self> {
        let mut items = reply.into_array().into_iter();
        let status = items.next().and_then(|v| v.as_i64());
        let a = items.next().and_then(|v| v.to_store_string());
        let b = items.next().and_then(|v| v.to_store_string());
        let result = items.next().unwrap_or(Value::Nil);
        match status {
            Some(STATUS_APPLIED) => Ok(MutationOutcome::Applied { old: a, new: b, result }),
            Some(STATUS_NOT_APPLIED) => Ok(MutationOutcome::NotApplied { result }),
            Some(STATUS_CONFLICT) => Ok(MutationOutcome::Conflict {
                index_key: a.unwrap_or_default(),
                owner: b.unwrap_or_default(),
            }),
            _ => Err(Error::Store("ERR malformed indexed-mutation reply".to_string())),
        }
    }

    pub fn into_result(self) -> Result<Value> {
        match self {
            MutationOutcome::Applied { result, .. } | MutationOutcome::NotApplied { result } => {
                Ok(result)
            }
            MutationOutcome::Conflict { index_key, owner } => Err(Error::Uniqueness {
                key: index_key,
                owner,
            }),
        }
    }
}

/// Empty and missing values are never indexed
fn read_value(runner: &mut dyn CommandRunner, plan: &IndexedMutation) -> Result<Option<String>> {
    let value = runner.run(plan.read_command())?;
    Ok(value.to_store_string().filter(|v| !v.is_empty()))
}

fn add_to_index(runner: &mut dyn CommandRunner, plan: &IndexedMutation, value: &str) -> Result<()> {
    let key = plan.index_key(value);
    debug!(index = %key, pk = %plan.pk, "indexing");
    runner.run(Command::new(
        CommandName::SAdd,
        vec![Value::Str(key), Value::Str(plan.pk.clone())],
    ))?;
    Ok(())
}

fn remove_from_index(runner: &mut dyn CommandRunner, plan: &IndexedMutation, value: &str) -> Result<()> {
    let key = plan.index_key(value);
    debug!(index = %key, pk = %plan.pk, "deindexing");
    runner.run(Command::new(
        CommandName::SRem,
        vec![Value::Str(key), Value::Str(plan.pk.clone())],
    ))?;
    Ok(())
}

/// First pk other than ours holding `value` in the ledger
fn foreign_owner(
    runner: &mut dyn CommandRunner,
    plan: &IndexedMutation,
    value: &str,
) -> Result<Option<String>> {
    let members = runner
        .run(Command::new(
            CommandName::SMembers,
            vec![Value::Str(plan.index_key(value))],
        ))?
        .into_strings();
    Ok(members.into_iter().find(|member| *member != plan.pk))
}

fn conflict(plan: &IndexedMutation, value: &str, owner: String) -> MutationOutcome {
    MutationOutcome::Conflict {
        index_key: plan.index_key(value),
        owner,
    }
}

/// Conflict for the value carried by the command, if another pk owns it
fn candidate_owner(
    runner: &mut dyn CommandRunner,
    plan: &IndexedMutation,
) -> Result<Option<MutationOutcome>> {
    let candidate = match plan.op_args.first().and_then(Value::to_store_string) {
        Some(candidate) => candidate,
        None => return Ok(None),
    };
    Ok(foreign_owner(runner, plan, &candidate)?.map(|owner| conflict(plan, &candidate, owner)))
}

/// Steps 2–7 of the indexed mutation protocol
pub fn execute_mutation(
    runner: &mut dyn CommandRunner,
    plan: &IndexedMutation,
) -> Result<MutationOutcome> {
    if plan.kind == SetterKind::Conditional {
        return execute_conditional(runner, plan);
    }

    // The new value is known up front: refuse before touching anything
    if plan.unique && plan.kind == SetterKind::Assign {
        if let Some(owner) = candidate_owner(runner, plan)? {
            return Ok(owner);
        }
    }

    // getset hands back the prior value itself
    let prior_in_reply = plan.operation == CommandName::GetSet;

    let mut old = None;
    if !prior_in_reply {
        old = read_value(runner, plan)?;
        if let Some(value) = &old {
            remove_from_index(runner, plan, value)?;
        }
    }

    let result = match runner.run(plan.operation_command()) {
        Ok(result) => result,
        Err(err) => {
            if let Some(value) = &old {
                add_to_index(runner, plan, value)?;
            }
            return Err(err);
        }
    };

    if prior_in_reply {
        old = result.to_store_string().filter(|v| !v.is_empty());
        if let Some(value) = &old {
            remove_from_index(runner, plan, value)?;
        }
    }

    let new = read_value(runner, plan)?;

    if plan.unique {
        if let Some(value) = &new {
            if let Some(owner) = foreign_owner(runner, plan, value)? {
                if plan.kind != SetterKind::Increment {
                    runner.run(plan.restore_command(old.as_deref()))?;
                    if let Some(previous) = &old {
                        add_to_index(runner, plan, previous)?;
                    }
                }
                return Ok(conflict(plan, value, owner));
            }
        }
    }

    if let Some(value) = &new {
        add_to_index(runner, plan, value)?;
    }

    Ok(MutationOutcome::Applied { old, new, result })
}

/// setnx-style: no index work at all unless the store reports the write
///
/// `set ... xx` overwrites an existing value, so the old value is read first
/// and only deindexed once the write happened. The ledger is checked up front
/// only for a field without a value; otherwise `setnx` is a no-op, and a
/// conflicting `xx` write is caught after the fact and rolled back.
fn execute_conditional(
    runner: &mut dyn CommandRunner,
    plan: &IndexedMutation,
) -> Result<MutationOutcome> {
    let old = read_value(runner, plan)?;
    let only_if_present = plan.op_kwargs.get("xx").map(Value::is_truthy).unwrap_or(false);
    if plan.unique && old.is_none() && !only_if_present {
        if let Some(owner) = candidate_owner(runner, plan)? {
            return Ok(owner);
        }
    }
    let result = runner.run(plan.operation_command())?;
    if !result.is_truthy() {
        return Ok(MutationOutcome::NotApplied { result });
    }

    if let Some(value) = &old {
        remove_from_index(runner, plan, value)?;
    }

    let new = read_value(runner, plan)?;
    if let Some(value) = &new {
        if plan.unique {
            if let Some(owner) = foreign_owner(runner, plan, value)? {
                runner.run(plan.restore_command(old.as_deref()))?;
                if let Some(previous) = &old {
                    add_to_index(runner, plan, previous)?;
                }
                return Ok(conflict(plan, value, owner));
            }
        }
        add_to_index(runner, plan, value)?;
    }

    Ok(MutationOutcome::Applied { old, new, result })
}

/// Runs commands through the database middleware chain
struct PipelineRunner<'a> {
    database: &'a Database,
}

impl CommandRunner for PipelineRunner<'_> {
    fn run(&mut self, command: Command) -> Result<Value> {
        self.database.run_command(command)
    }
}

/// Index maintenance for the fields of one model
pub struct IndexEngine<'a> {
    database: &'a Database,
    schema: &'a ModelSchema,
}

impl<'a> IndexEngine<'a> {
    pub fn new(database: &'a Database, schema: &'a ModelSchema) -> Self {
        IndexEngine { database, schema }
    }

    /// Run an indexed setter and keep the field's index consistent
    pub fn mutate(&self, field: &FieldDef, pk: &str, plan: IndexedMutation) -> Result<Value> {
        let outcome = if self.database.uses_scripts() {
            debug!(field = %field.name, pk, "indexed mutation via script");
            let reply = self.database.run_command(plan.to_script_command())?;
            MutationOutcome::from_reply(reply)?
        } else {
            let _lock = self.lock(field, pk)?;
            execute_mutation(&mut PipelineRunner { database: self.database }, &plan)?
        };
        outcome.into_result()
    }

    /// Deindex the current value and delete the field storage
    ///
    /// Runs as an indexed mutation so it excludes concurrent writers the same
    /// way they exclude each other.
    pub fn clear(&self, field: &FieldDef, pk: &str) -> Result<()> {
        let operation = match field.kind {
            FieldKind::InstanceHash => CommandName::HDel,
            _ => CommandName::Del,
        };
        let plan = IndexedMutation::for_field(
            self.schema,
            field,
            pk,
            SetterKind::Assign,
            operation,
            Vec::new(),
            BTreeMap::new(),
        );
        self.mutate(field, pk, plan).map(|_| ())
    }

    /// pks currently holding `value` for `field`
    pub fn lookup(&self, field: &FieldDef, value: &str) -> Result<Vec<String>> {
        let key = self.schema.index_key(field, value);
        Ok(self
            .database
            .run_command(Command::new(CommandName::SMembers, vec![Value::Str(key)]))?
            .into_strings())
    }

    fn lock(&self, field: &FieldDef, pk: &str) -> Result<Option<FieldLock<'a>>> {
        if !self.schema.lockable {
            return Ok(None);
        }
        let key = self.schema.lock_key(field, pk);
        FieldLock::acquire(self.database, key, self.database.lock_config()).map(Some)
    }
}
