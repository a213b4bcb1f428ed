//! Model schemas
//!
//! A `ModelSchema` is a named, namespaced list of `FieldDef`s plus a primary
//! key policy. Each field kind resolves its store commands through a static
//! table into an `OpClass`, so dispatch never matches on command strings.

use crate::command::CommandName;
use crate::error::{Error, Result};
use crate::types::{make_key, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Name under which the primary key is addressed in filters and values
pub const PK_FIELD: &str = "pk";

/// How an indexed setter produces the new value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetterKind {
    /// New value is the command argument (set, getset, hset)
    Assign,
    /// Applied only if the value is absent (setnx, hsetnx)
    Conditional,
    /// New value is computed by the store from the old one (append, setrange, setbit)
    Derived,
    /// Atomic numeric change (incr, decrby, hincrbyfloat, ...)
    Increment,
}

impl SetterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetterKind::Assign => "assign",
            SetterKind::Conditional => "conditional",
            SetterKind::Derived => "derived",
            SetterKind::Increment => "increment",
        }
    }

    pub fn parse(s: &str) -> Option<SetterKind> {
        match s {
            "assign" => Some(SetterKind::Assign),
            "conditional" => Some(SetterKind::Conditional),
            "derived" => Some(SetterKind::Derived),
            "increment" => Some(SetterKind::Increment),
            _ => None,
        }
    }
}

/// Classification of a field operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// Read only, cacheable
    Getter,
    /// Mutates without affecting any index
    Modifier,
    /// Mutates the (possibly indexed) value
    Setter(SetterKind),
    /// Sets an expiration; incompatible with indexing
    Expiring,
}

type OpTable = &'static [(CommandName, OpClass)];

const STRING_OPS: OpTable = &[
    (CommandName::Get, OpClass::Getter),
    (CommandName::GetBit, OpClass::Getter),
    (CommandName::GetRange, OpClass::Getter),
    (CommandName::StrLen, OpClass::Getter),
    (CommandName::Ttl, OpClass::Getter),
    (CommandName::PTtl, OpClass::Getter),
    (CommandName::Set, OpClass::Setter(SetterKind::Assign)),
    (CommandName::GetSet, OpClass::Setter(SetterKind::Assign)),
    (CommandName::SetNx, OpClass::Setter(SetterKind::Conditional)),
    (CommandName::Append, OpClass::Setter(SetterKind::Derived)),
    (CommandName::SetRange, OpClass::Setter(SetterKind::Derived)),
    (CommandName::SetBit, OpClass::Setter(SetterKind::Derived)),
    (CommandName::Incr, OpClass::Setter(SetterKind::Increment)),
    (CommandName::IncrBy, OpClass::Setter(SetterKind::Increment)),
    (CommandName::IncrByFloat, OpClass::Setter(SetterKind::Increment)),
    (CommandName::Decr, OpClass::Setter(SetterKind::Increment)),
    (CommandName::DecrBy, OpClass::Setter(SetterKind::Increment)),
    (CommandName::Persist, OpClass::Modifier),
    (CommandName::SetEx, OpClass::Expiring),
    (CommandName::PSetEx, OpClass::Expiring),
    (CommandName::Expire, OpClass::Expiring),
    (CommandName::PExpire, OpClass::Expiring),
    (CommandName::ExpireAt, OpClass::Expiring),
    (CommandName::PExpireAt, OpClass::Expiring),
];

const INSTANCE_HASH_OPS: OpTable = &[
    (CommandName::HGet, OpClass::Getter),
    (CommandName::HExists, OpClass::Getter),
    (CommandName::HSet, OpClass::Setter(SetterKind::Assign)),
    (CommandName::HSetNx, OpClass::Setter(SetterKind::Conditional)),
    (CommandName::HIncrBy, OpClass::Setter(SetterKind::Increment)),
    (CommandName::HIncrByFloat, OpClass::Setter(SetterKind::Increment)),
];

const SET_OPS: OpTable = &[
    (CommandName::SCard, OpClass::Getter),
    (CommandName::SIsMember, OpClass::Getter),
    (CommandName::SMembers, OpClass::Getter),
    (CommandName::SRandMember, OpClass::Getter),
    (CommandName::Ttl, OpClass::Getter),
    (CommandName::SAdd, OpClass::Modifier),
    (CommandName::SRem, OpClass::Modifier),
    (CommandName::SPop, OpClass::Modifier),
    (CommandName::Expire, OpClass::Expiring),
    (CommandName::PExpire, OpClass::Expiring),
];

const LIST_OPS: OpTable = &[
    (CommandName::LIndex, OpClass::Getter),
    (CommandName::LLen, OpClass::Getter),
    (CommandName::LRange, OpClass::Getter),
    (CommandName::Ttl, OpClass::Getter),
    (CommandName::LInsert, OpClass::Modifier),
    (CommandName::LPop, OpClass::Modifier),
    (CommandName::LPush, OpClass::Modifier),
    (CommandName::LPushX, OpClass::Modifier),
    (CommandName::LRem, OpClass::Modifier),
    (CommandName::LSet, OpClass::Modifier),
    (CommandName::LTrim, OpClass::Modifier),
    (CommandName::RPop, OpClass::Modifier),
    (CommandName::RPush, OpClass::Modifier),
    (CommandName::RPushX, OpClass::Modifier),
    (CommandName::Expire, OpClass::Expiring),
    (CommandName::PExpire, OpClass::Expiring),
];

const SORTED_SET_OPS: OpTable = &[
    (CommandName::ZCard, OpClass::Getter),
    (CommandName::ZCount, OpClass::Getter),
    (CommandName::ZRange, OpClass::Getter),
    (CommandName::ZRank, OpClass::Getter),
    (CommandName::ZScore, OpClass::Getter),
    (CommandName::Ttl, OpClass::Getter),
    (CommandName::ZAdd, OpClass::Modifier),
    (CommandName::ZIncrBy, OpClass::Modifier),
    (CommandName::ZRem, OpClass::Modifier),
    (CommandName::Expire, OpClass::Expiring),
    (CommandName::PExpire, OpClass::Expiring),
];

/// Storage type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// A string stored under its own key
    String,
    /// A string stored as one entry of the instance hash
    InstanceHash,
    Set,
    List,
    SortedSet,
}

impl FieldKind {
    fn table(&self) -> OpTable {
        match self {
            FieldKind::String => STRING_OPS,
            FieldKind::InstanceHash => INSTANCE_HASH_OPS,
            FieldKind::Set => SET_OPS,
            FieldKind::List => LIST_OPS,
            FieldKind::SortedSet => SORTED_SET_OPS,
        }
    }

    /// Classify a command for this field kind; `None` if unavailable
    pub fn classify(&self, command: CommandName) -> Option<OpClass> {
        self.table()
            .iter()
            .find(|(name, _)| *name == command)
            .map(|(_, class)| *class)
    }

    pub fn available_commands(&self) -> Vec<CommandName> {
        self.table().iter().map(|(name, _)| *name).collect()
    }

    /// Only single-valued kinds can be indexed
    pub fn is_indexable_kind(&self) -> bool {
        matches!(self, FieldKind::String | FieldKind::InstanceHash)
    }

    /// Command reading the whole value
    pub fn getter(&self) -> CommandName {
        match self {
            FieldKind::String => CommandName::Get,
            FieldKind::InstanceHash => CommandName::HGet,
            FieldKind::Set => CommandName::SMembers,
            FieldKind::List => CommandName::LRange,
            FieldKind::SortedSet => CommandName::ZRange,
        }
    }

    /// Command used when a value is given at creation
    pub fn setter(&self) -> CommandName {
        match self {
            FieldKind::String => CommandName::Set,
            FieldKind::InstanceHash => CommandName::HSet,
            FieldKind::Set => CommandName::SAdd,
            FieldKind::List => CommandName::RPush,
            FieldKind::SortedSet => CommandName::ZAdd,
        }
    }
}

/// Field declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub indexable: bool,
    pub unique: bool,
    pub cacheable: bool,
    pub default: Option<Value>,
}

impl FieldDef {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        FieldDef {
            name: name.to_string(),
            kind,
            indexable: false,
            unique: false,
            cacheable: true,
            default: None,
        }
    }

    pub fn string(name: &str) -> Self {
        Self::new(name, FieldKind::String)
    }

    pub fn instance_hash(name: &str) -> Self {
        Self::new(name, FieldKind::InstanceHash)
    }

    pub fn set(name: &str) -> Self {
        Self::new(name, FieldKind::Set)
    }

    pub fn list(name: &str) -> Self {
        Self::new(name, FieldKind::List)
    }

    pub fn sorted_set(name: &str) -> Self {
        Self::new(name, FieldKind::SortedSet)
    }

    pub fn indexable(mut self) -> Self {
        self.indexable = true;
        self
    }

    /// Unique implies indexable
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self.indexable = true;
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(':') {
            return Err(Error::Configuration(format!(
                "Invalid field name {:?}",
                self.name
            )));
        }
        if self.name == PK_FIELD {
            return Err(Error::Configuration(format!(
                "Field name {:?} is reserved for the primary key",
                PK_FIELD
            )));
        }
        if self.indexable && !self.kind.is_indexable_kind() {
            return Err(Error::Configuration(format!(
                "Field {} of kind {:?} cannot be indexable",
                self.name, self.kind
            )));
        }
        if self.unique && self.default.is_some() {
            return Err(Error::Configuration(format!(
                "Cannot set \"default\" and \"unique\" together on field {}",
                self.name
            )));
        }
        Ok(())
    }
}

/// Primary key policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PkKind {
    /// Allocated by incrementing a per-model counter
    Auto,
    /// Supplied by the caller at creation
    Explicit,
}

/// Schema of a model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSchema {
    pub name: String,
    pub namespace: String,
    pub fields: Vec<FieldDef>,
    pub pk: PkKind,
    /// Serialize indexed mutations with the per-field lock
    pub lockable: bool,
    pub cacheable: bool,
    pub is_abstract: bool,
}

impl ModelSchema {
    pub fn new(name: &str) -> Self {
        ModelSchema {
            name: name.to_string(),
            namespace: String::new(),
            fields: Vec::new(),
            pk: PkKind::Auto,
            lockable: true,
            cacheable: true,
            is_abstract: false,
        }
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn pk(mut self, pk: PkKind) -> Self {
        self.pk = pk;
        self
    }

    pub fn lockable(mut self, lockable: bool) -> Self {
        self.lockable = lockable;
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn abstract_model(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Concrete schema named `name` inheriting every field and flag
    pub fn extend(&self, name: &str) -> ModelSchema {
        ModelSchema {
            name: name.to_string(),
            is_abstract: false,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(':') {
            return Err(Error::Configuration(format!(
                "Invalid model name {:?}",
                self.name
            )));
        }
        if self.namespace.contains(':') {
            return Err(Error::Configuration(format!(
                "Invalid namespace {:?}",
                self.namespace
            )));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            field.validate()?;
            if !seen.insert(field.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "Field {} declared twice on model {}",
                    field.name, self.name
                )));
            }
        }
        Ok(())
    }

    /// Registry name: `namespace:name`, or `name` without namespace
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            make_key([self.namespace.as_str(), self.name.as_str()])
        }
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn require_field(&self, name: &str) -> Result<&FieldDef> {
        self.get_field(name).ok_or_else(|| {
            Error::Configuration(format!(
                "{} is not a field of model {}",
                name,
                self.full_name()
            ))
        })
    }

    pub fn indexable_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.indexable)
    }

    /// Set of every existing pk
    pub fn collection_key(&self) -> String {
        make_key([self.full_name().as_str(), "collection"])
    }

    /// Counter backing auto primary keys
    pub fn max_pk_key(&self) -> String {
        make_key([self.full_name().as_str(), "max_pk"])
    }

    /// Instance hash holding every `InstanceHash` field
    pub fn hash_key(&self, pk: &str) -> String {
        make_key([self.full_name().as_str(), pk, "hash"])
    }

    /// Storage key of one field; `InstanceHash` fields live in the hash key
    pub fn field_key(&self, field: &FieldDef, pk: &str) -> String {
        match field.kind {
            FieldKind::InstanceHash => self.hash_key(pk),
            _ => make_key([self.full_name().as_str(), pk, field.name.as_str()]),
        }
    }

    /// Index set keys of `field` share this prefix
    pub fn index_prefix(&self, field: &FieldDef) -> String {
        make_key([self.full_name().as_str(), field.name.as_str()])
    }

    pub fn index_key(&self, field: &FieldDef, value: &str) -> String {
        make_key([self.index_prefix(field).as_str(), value])
    }

    /// Unique fields lock the whole ledger, other fields one instance
    pub fn lock_key(&self, field: &FieldDef, pk: &str) -> String {
        let base = make_key([self.full_name().as_str(), "lock-for-update", field.name.as_str()]);
        if field.unique {
            base
        } else {
            make_key([base.as_str(), pk])
        }
    }
}
