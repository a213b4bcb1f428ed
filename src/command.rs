//! Commands flowing through the middleware chain
//!
//! A `Command` is one outgoing store operation; a `CommandResult` wraps its
//! outcome. Neither is persisted: they exist so middlewares can inspect and
//! rewrite traffic.

use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

macro_rules! command_names {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// Store primitive vocabulary
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum CommandName {
            $($variant),*
        }

        impl CommandName {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(CommandName::$variant => $name),*
                }
            }

            pub fn parse(name: &str) -> Option<CommandName> {
                match name.to_ascii_lowercase().as_str() {
                    $($name => Some(CommandName::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

command_names! {
    // keys
    Del => "del",
    Exists => "exists",
    Expire => "expire",
    PExpire => "pexpire",
    ExpireAt => "expireat",
    PExpireAt => "pexpireat",
    Persist => "persist",
    Ttl => "ttl",
    PTtl => "pttl",
    Info => "info",
    // strings
    Get => "get",
    Set => "set",
    SetNx => "setnx",
    SetEx => "setex",
    PSetEx => "psetex",
    GetSet => "getset",
    Append => "append",
    SetRange => "setrange",
    GetRange => "getrange",
    SetBit => "setbit",
    GetBit => "getbit",
    StrLen => "strlen",
    Incr => "incr",
    IncrBy => "incrby",
    IncrByFloat => "incrbyfloat",
    Decr => "decr",
    DecrBy => "decrby",
    // hashes
    HGet => "hget",
    HSet => "hset",
    HSetNx => "hsetnx",
    HIncrBy => "hincrby",
    HIncrByFloat => "hincrbyfloat",
    HDel => "hdel",
    HExists => "hexists",
    HMGet => "hmget",
    HMSet => "hmset",
    HGetAll => "hgetall",
    HLen => "hlen",
    // sets
    SAdd => "sadd",
    SRem => "srem",
    SMembers => "smembers",
    SIsMember => "sismember",
    SCard => "scard",
    SInter => "sinter",
    SPop => "spop",
    SRandMember => "srandmember",
    // lists
    LPush => "lpush",
    RPush => "rpush",
    LPushX => "lpushx",
    RPushX => "rpushx",
    LPop => "lpop",
    RPop => "rpop",
    LIndex => "lindex",
    LLen => "llen",
    LRange => "lrange",
    LSet => "lset",
    LRem => "lrem",
    LTrim => "ltrim",
    LInsert => "linsert",
    // sorted sets
    ZAdd => "zadd",
    ZRem => "zrem",
    ZIncrBy => "zincrby",
    ZCard => "zcard",
    ZScore => "zscore",
    ZRange => "zrange",
    ZRank => "zrank",
    ZCount => "zcount",
    // scripting
    EvalSha => "evalsha",
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outgoing store operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: CommandName,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl Command {
    pub fn new(name: CommandName, args: Vec<Value>) -> Self {
        Command {
            name,
            args,
            kwargs: BTreeMap::new(),
        }
    }

    pub fn with_kwarg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.to_string(), value.into());
        self
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// First argument as a key name
    pub fn key(&self) -> Option<&str> {
        self.args.first().and_then(|v| v.as_str())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Command(name='{}', args={:?}, kwargs={:?})",
            self.name, self.args, self.kwargs
        )
    }
}

/// Outcome of one command, replaceable by post-command hooks
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub value: Value,
}

impl CommandResult {
    pub fn new(value: Value) -> Self {
        CommandResult { value }
    }
}

impl From<Value> for CommandResult {
    fn from(value: Value) -> Self {
        CommandResult { value }
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Result(value={:?})", self.value)
    }
}

/// Per-call scratch space shared by the pre and post hooks of one command
#[derive(Default)]
pub struct CommandContext {
    entries: HashMap<String, Box<dyn Any + Send>>,
}

impl CommandContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send>(&mut self, name: &str, value: T) {
        self.entries.insert(name.to_string(), Box::new(value));
    }

    pub fn get<T: Any + Send>(&self, name: &str) -> Option<&T> {
        self.entries.get(name).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn remove<T: Any + Send>(&mut self, name: &str) -> Option<T> {
        let boxed = self.entries.remove(name)?;
        boxed.downcast::<T>().ok().map(|b| *b)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

impl fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("keys", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}
