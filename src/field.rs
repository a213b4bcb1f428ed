//! Field Proxy Layer
//!
//! A `FieldProxy` is one field bound to one instance. Every call is looked up
//! in the field kind's operation table:
//!
//! - getters may be answered from the per-field cache
//! - modifiers clear the cache and run directly
//! - setters on indexable fields go through the `IndexEngine`
//! - expiring operations are refused on indexable fields

use crate::cache::CacheKey;
use crate::command::{Command, CommandName};
use crate::error::{Error, Result};
use crate::index::{IndexEngine, IndexedMutation};
use crate::model::Instance;
use crate::schema::{FieldDef, FieldKind, OpClass, SetterKind};
use crate::types::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Keyword options of `set` that attach an expiration
const EXPIRING_OPTIONS: &[&str] = &["ex", "px", "exat", "pxat"];

pub struct FieldProxy<'a> {
    instance: &'a Instance,
    def: &'a FieldDef,
}

impl<'a> FieldProxy<'a> {
    pub(crate) fn new(instance: &'a Instance, def: &'a FieldDef) -> Self {
        FieldProxy { instance, def }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &FieldDef {
        self.def
    }

    /// Storage key (the instance hash for `InstanceHash` fields)
    pub fn key(&self) -> String {
        self.instance
            .model()
            .schema()
            .field_key(self.def, self.instance.pk())
    }

    fn key_args(&self) -> Vec<Value> {
        let mut args = vec![Value::Str(self.key())];
        if self.def.kind == FieldKind::InstanceHash {
            args.push(Value::Str(self.def.name.clone()));
        }
        args
    }

    fn command(&self, name: CommandName, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Command {
        let mut full = self.key_args();
        full.extend(args);
        Command {
            name,
            args: full,
            kwargs,
        }
    }

    fn cacheable(&self) -> bool {
        let model = self.instance.model();
        self.def.cacheable && model.schema().cacheable && !model.database().discard_cache()
    }

    pub fn call(&self, name: CommandName, args: Vec<Value>) -> Result<Value> {
        self.call_with(name, args, BTreeMap::new())
    }

    /// Run any operation of this field's vocabulary
    pub fn call_with(
        &self,
        name: CommandName,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value> {
        let class = self
            .def
            .kind
            .classify(name)
            .ok_or_else(|| Error::UnsupportedCommand {
                command: name.to_string(),
                field: self.def.name.clone(),
            })?;

        match class {
            OpClass::Getter => self.run_getter(self.command(name, args, kwargs)),
            OpClass::Modifier => {
                self.clear_cache();
                self.run(self.command(name, args, kwargs))
            }
            OpClass::Expiring => {
                if self.def.indexable {
                    return Err(self.expiring_refused(name));
                }
                self.clear_cache();
                self.run(self.command(name, args, kwargs))
            }
            OpClass::Setter(kind) => self.run_setter(name, kind, args, kwargs),
        }
    }

    fn expiring_refused(&self, name: CommandName) -> Error {
        Error::Configuration(format!(
            "{} cannot be used on indexable field {}: expiration is incompatible with indexing",
            name, self.def.name
        ))
    }

    fn run(&self, command: Command) -> Result<Value> {
        self.instance.model().database().run_command(command)
    }

    fn run_getter(&self, command: Command) -> Result<Value> {
        if !self.cacheable() {
            return self.run(command);
        }
        let key = match CacheKey::for_command(&command) {
            Some(key) => key,
            None => return self.run(command),
        };
        if let Some(value) = self.instance.with_cache(&self.def.name, |cache| cache.get(&key)) {
            return Ok(value);
        }
        let value = self.run(command)?;
        let stored = value.clone();
        self.instance
            .with_cache(&self.def.name, |cache| cache.insert(key, stored));
        Ok(value)
    }

    fn run_setter(
        &self,
        name: CommandName,
        kind: SetterKind,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value> {
        let expiring = EXPIRING_OPTIONS.iter().any(|opt| kwargs.contains_key(*opt));
        if self.def.indexable && expiring {
            return Err(self.expiring_refused(name));
        }

        let result = if self.def.indexable {
            // set with nx/xx only writes when its condition holds
            let conditional = ["nx", "xx"]
                .iter()
                .any(|opt| kwargs.get(*opt).map(Value::is_truthy).unwrap_or(false));
            let kind = if conditional { SetterKind::Conditional } else { kind };

            let model = self.instance.model();
            let plan = IndexedMutation::for_field(
                model.schema(),
                self.def,
                self.instance.pk(),
                kind,
                name,
                args,
                kwargs,
            );
            debug!(field = %self.def.name, pk = %self.instance.pk(), command = %name, "indexed setter");
            IndexEngine::new(model.database(), model.schema()).mutate(self.def, self.instance.pk(), plan)
        } else {
            self.run(self.command(name, args, kwargs))
        };

        self.clear_cache();
        result
    }

    pub fn clear_cache(&self) {
        self.instance.with_cache(&self.def.name, |cache| cache.clear());
    }

    /// Entries currently cached for this field
    pub fn cached_entries(&self) -> usize {
        self.instance.with_cache(&self.def.name, |cache| cache.len())
    }

    fn scalar(&self, string_op: CommandName, hash_op: Option<CommandName>) -> Result<CommandName> {
        match (self.def.kind, hash_op) {
            (FieldKind::String, _) => Ok(string_op),
            (FieldKind::InstanceHash, Some(op)) => Ok(op),
            _ => Err(Error::UnsupportedCommand {
                command: string_op.to_string(),
                field: self.def.name.clone(),
            }),
        }
    }

    /// Whole value: a string, or an array for multi-value kinds
    pub fn get(&self) -> Result<Value> {
        match self.def.kind {
            FieldKind::List | FieldKind::SortedSet => {
                self.call(self.def.kind.getter(), vec![Value::Int(0), Value::Int(-1)])
            }
            kind => self.call(kind.getter(), Vec::new()),
        }
    }

    pub fn set(&self, value: impl Into<Value>) -> Result<Value> {
        let op = self.scalar(CommandName::Set, Some(CommandName::HSet))?;
        self.call(op, vec![value.into()])
    }

    pub fn setnx(&self, value: impl Into<Value>) -> Result<bool> {
        let op = self.scalar(CommandName::SetNx, Some(CommandName::HSetNx))?;
        Ok(self.call(op, vec![value.into()])?.is_truthy())
    }

    pub fn getset(&self, value: impl Into<Value>) -> Result<Value> {
        let op = self.scalar(CommandName::GetSet, None)?;
        self.call(op, vec![value.into()])
    }

    pub fn append(&self, value: impl Into<Value>) -> Result<i64> {
        let op = self.scalar(CommandName::Append, None)?;
        integer(self.call(op, vec![value.into()])?)
    }

    pub fn incr(&self) -> Result<i64> {
        self.incr_by(1)
    }

    pub fn decr(&self) -> Result<i64> {
        self.incr_by(-1)
    }

    pub fn incr_by(&self, amount: i64) -> Result<i64> {
        let op = self.scalar(CommandName::IncrBy, Some(CommandName::HIncrBy))?;
        integer(self.call(op, vec![Value::Int(amount)])?)
    }

    pub fn decr_by(&self, amount: i64) -> Result<i64> {
        let op = self.scalar(CommandName::DecrBy, None)?;
        integer(self.call(op, vec![Value::Int(amount)])?)
    }

    pub fn incr_by_float(&self, amount: f64) -> Result<f64> {
        let op = self.scalar(CommandName::IncrByFloat, Some(CommandName::HIncrByFloat))?;
        let reply = self.call(op, vec![Value::Float(amount)])?;
        reply
            .as_f64()
            .ok_or_else(|| Error::Store(format!("unexpected float reply {:?}", reply)))
    }

    pub fn setrange(&self, offset: usize, value: impl Into<Value>) -> Result<i64> {
        let op = self.scalar(CommandName::SetRange, None)?;
        integer(self.call(op, vec![Value::Int(offset as i64), value.into()])?)
    }

    pub fn getrange(&self, start: i64, end: i64) -> Result<Value> {
        let op = self.scalar(CommandName::GetRange, None)?;
        self.call(op, vec![Value::Int(start), Value::Int(end)])
    }

    pub fn setbit(&self, offset: usize, bit: bool) -> Result<i64> {
        let op = self.scalar(CommandName::SetBit, None)?;
        integer(self.call(op, vec![Value::Int(offset as i64), Value::Int(bit as i64)])?)
    }

    pub fn getbit(&self, offset: usize) -> Result<i64> {
        let op = self.scalar(CommandName::GetBit, None)?;
        integer(self.call(op, vec![Value::Int(offset as i64)])?)
    }

    pub fn strlen(&self) -> Result<i64> {
        let op = self.scalar(CommandName::StrLen, None)?;
        integer(self.call(op, Vec::new())?)
    }

    pub fn expire(&self, seconds: i64) -> Result<bool> {
        Ok(self.call(CommandName::Expire, vec![Value::Int(seconds)])?.is_truthy())
    }

    pub fn ttl(&self) -> Result<i64> {
        integer(self.call(CommandName::Ttl, Vec::new())?)
    }

    pub fn sadd<V: Into<Value>>(&self, members: Vec<V>) -> Result<i64> {
        integer(self.call(CommandName::SAdd, members.into_iter().map(Into::into).collect())?)
    }

    pub fn srem<V: Into<Value>>(&self, members: Vec<V>) -> Result<i64> {
        integer(self.call(CommandName::SRem, members.into_iter().map(Into::into).collect())?)
    }

    pub fn smembers(&self) -> Result<Vec<String>> {
        Ok(self.call(CommandName::SMembers, Vec::new())?.into_strings())
    }

    pub fn rpush<V: Into<Value>>(&self, values: Vec<V>) -> Result<i64> {
        integer(self.call(CommandName::RPush, values.into_iter().map(Into::into).collect())?)
    }

    pub fn lpush<V: Into<Value>>(&self, values: Vec<V>) -> Result<i64> {
        integer(self.call(CommandName::LPush, values.into_iter().map(Into::into).collect())?)
    }

    pub fn lrange(&self, start: i64, stop: i64) -> Result<Vec<String>> {
        Ok(self
            .call(CommandName::LRange, vec![Value::Int(start), Value::Int(stop)])?
            .into_strings())
    }

    pub fn zadd(&self, scored: &[(f64, &str)]) -> Result<i64> {
        let args = scored
            .iter()
            .flat_map(|(score, member)| [Value::Float(*score), Value::from(*member)])
            .collect();
        integer(self.call(CommandName::ZAdd, args)?)
    }

    pub fn zrange(&self, start: i64, stop: i64) -> Result<Vec<String>> {
        Ok(self
            .call(CommandName::ZRange, vec![Value::Int(start), Value::Int(stop)])?
            .into_strings())
    }

    /// Write a value given at creation (or a default)
    pub(crate) fn assign(&self, value: Value) -> Result<()> {
        let op = self.def.kind.setter();
        let args = match (self.def.kind, value) {
            (FieldKind::String | FieldKind::InstanceHash, value) => vec![value],
            (_, Value::Array(items)) => items,
            (_, value) => vec![value],
        };
        if args.is_empty() {
            return Ok(());
        }
        self.call(op, args)?;
        Ok(())
    }

    /// Deindex and remove the stored value
    pub fn delete(&self) -> Result<()> {
        let model = self.instance.model();
        let result = if self.def.indexable {
            IndexEngine::new(model.database(), model.schema()).clear(self.def, self.instance.pk())
        } else {
            let name = if self.def.kind == FieldKind::InstanceHash {
                CommandName::HDel
            } else {
                CommandName::Del
            };
            self.run(Command::new(name, self.key_args())).map(|_| ())
        };
        self.clear_cache();
        result
    }
}

fn integer(reply: Value) -> Result<i64> {
    reply
        .as_i64()
        .ok_or_else(|| Error::Store(format!("unexpected integer reply {:?}", reply)))
}
