//! In-process store
//!
//! A single-keyspace, Redis-flavoured store: strings, hashes, sets, lists and
//! sorted sets with lazy expiration. Every command runs under one mutex, so
//! each command (and each script) is atomic. Empty containers disappear.

use crate::command::{Command, CommandName};
use crate::config::ConnectionSettings;
use crate::error::{Error, Result};
use crate::index::{execute_mutation, CommandRunner, IndexedMutation};
use crate::lock::RELEASE_LOCK_SCRIPT;
use crate::store::{Connector, Store};
use crate::types::{format_float, Value};
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

/// Version reported by `INFO`
pub const DEFAULT_VERSION: &str = "7.2.0";

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
const NOT_INTEGER: &str = "ERR value is not an integer or out of range";
const NOT_FLOAT: &str = "ERR value is not a valid float";

#[derive(Debug, Clone)]
enum Entry {
    Str(Vec<u8>),
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
    List(VecDeque<String>),
    ZSet(BTreeMap<String, f64>),
}

impl Entry {
    fn is_empty(&self) -> bool {
        match self {
            Entry::Str(_) => false,
            Entry::Hash(h) => h.is_empty(),
            Entry::Set(s) => s.is_empty(),
            Entry::List(l) => l.is_empty(),
            Entry::ZSet(z) => z.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    entry: Entry,
    /// Absolute expiration, unix milliseconds
    expires_at: Option<i64>,
}

impl Slot {
    fn new(entry: Entry) -> Self {
        Slot {
            entry,
            expires_at: None,
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn store_err(message: &str) -> Error {
    Error::Store(message.to_string())
}

fn bytes_value(bytes: &[u8]) -> Value {
    Value::Str(String::from_utf8_lossy(bytes).into_owned())
}

/// Positional access to command arguments
struct Args<'a> {
    command: &'a Command,
}

impl<'a> Args<'a> {
    fn arity_error(&self) -> Error {
        Error::Store(format!(
            "ERR wrong number of arguments for '{}' command",
            self.command.name
        ))
    }

    fn len(&self) -> usize {
        self.command.args.len()
    }

    fn str(&self, i: usize) -> Result<String> {
        self.command
            .args
            .get(i)
            .and_then(Value::to_store_string)
            .ok_or_else(|| self.arity_error())
    }

    fn int(&self, i: usize) -> Result<i64> {
        self.str(i)?.parse().map_err(|_| store_err(NOT_INTEGER))
    }

    fn float(&self, i: usize) -> Result<f64> {
        let parsed: f64 = self.str(i)?.parse().map_err(|_| store_err(NOT_FLOAT))?;
        if parsed.is_nan() {
            return Err(store_err(NOT_FLOAT));
        }
        Ok(parsed)
    }

    /// Every argument from `from` on; at least one required
    fn rest(&self, from: usize) -> Result<Vec<String>> {
        if self.len() <= from {
            return Err(self.arity_error());
        }
        (from..self.len()).map(|i| self.str(i)).collect()
    }

    fn flag(&self, name: &str) -> bool {
        self.command.kwarg(name).map(Value::is_truthy).unwrap_or(false)
    }
}

/// Clamp a Redis-style inclusive range to `len`
fn range_bounds(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

fn parse_score_bound(raw: &str) -> Result<(f64, bool)> {
    let (text, exclusive) = match raw.strip_prefix('(') {
        Some(rest) => (rest, true),
        None => (raw, false),
    };
    let value = match text {
        "-inf" => f64::NEG_INFINITY,
        "+inf" | "inf" => f64::INFINITY,
        other => other
            .parse()
            .map_err(|_| store_err("ERR min or max is not a float"))?,
    };
    Ok((value, exclusive))
}

fn sorted_members(zset: &BTreeMap<String, f64>) -> Vec<(&String, f64)> {
    let mut members: Vec<_> = zset.iter().map(|(m, s)| (m, *s)).collect();
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    members
}

macro_rules! typed_access {
    ($read:ident, $write:ident, $variant:ident, $ty:ty, $init:expr) => {
        fn $read(&mut self, key: &str) -> Result<Option<&mut $ty>> {
            match self.slot(key) {
                None => Ok(None),
                Some(Slot { entry: Entry::$variant(inner), .. }) => Ok(Some(inner)),
                Some(_) => Err(store_err(WRONG_TYPE)),
            }
        }

        fn $write(&mut self, key: &str) -> Result<&mut $ty> {
            self.purge(key);
            let slot = self
                .slots
                .entry(key.to_string())
                .or_insert_with(|| Slot::new(Entry::$variant($init)));
            match &mut slot.entry {
                Entry::$variant(inner) => Ok(inner),
                _ => Err(store_err(WRONG_TYPE)),
            }
        }
    };
}

/// The data of one store
#[derive(Debug, Default)]
pub(crate) struct Keyspace {
    slots: HashMap<String, Slot>,
}

impl Keyspace {
    fn purge(&mut self, key: &str) {
        let expired = self
            .slots
            .get(key)
            .and_then(|slot| slot.expires_at)
            .map(|at| at <= now_ms())
            .unwrap_or(false);
        if expired {
            self.slots.remove(key);
        }
    }

    fn slot(&mut self, key: &str) -> Option<&mut Slot> {
        self.purge(key);
        self.slots.get_mut(key)
    }

    fn exists(&mut self, key: &str) -> bool {
        self.slot(key).is_some()
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.slots.get(key).map(|s| s.entry.is_empty()).unwrap_or(false) {
            self.slots.remove(key);
        }
    }

    typed_access!(string, string_mut, Str, Vec<u8>, Vec::new());
    typed_access!(hash, hash_mut, Hash, BTreeMap<String, String>, BTreeMap::new());
    typed_access!(set, set_mut, Set, BTreeSet<String>, BTreeSet::new());
    typed_access!(list, list_mut, List, VecDeque<String>, VecDeque::new());
    typed_access!(zset, zset_mut, ZSet, BTreeMap<String, f64>, BTreeMap::new());

    fn put_string(&mut self, key: &str, value: Vec<u8>, keep_ttl: bool) {
        let expires_at = if keep_ttl {
            self.slot(key).and_then(|s| s.expires_at)
        } else {
            None
        };
        self.slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::Str(value),
                expires_at,
            },
        );
    }

    fn expire_at(&mut self, key: &str, at_ms: i64) -> Value {
        match self.slot(key) {
            Some(slot) => {
                slot.expires_at = Some(at_ms);
                self.purge(key);
                Value::Int(1)
            }
            None => Value::Int(0),
        }
    }

    fn remaining_ms(&mut self, key: &str) -> i64 {
        match self.slot(key) {
            None => -2,
            Some(Slot { expires_at: None, .. }) => -1,
            Some(Slot { expires_at: Some(at), .. }) => (*at - now_ms()).max(0),
        }
    }

    fn incr_by(&mut self, key: &str, delta: i64) -> Result<Value> {
        let current = match self.string(key)? {
            Some(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| store_err(NOT_INTEGER))?,
            None => 0,
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| store_err("ERR increment or decrement would overflow"))?;
        self.put_string(key, next.to_string().into_bytes(), true);
        Ok(Value::Int(next))
    }

    fn incr_by_float(&mut self, key: &str, delta: f64) -> Result<Value> {
        let current = match self.string(key)? {
            Some(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or_else(|| store_err(NOT_FLOAT))?,
            None => 0.0,
        };
        let next = current + delta;
        if !next.is_finite() {
            return Err(store_err("ERR increment would produce NaN or Infinity"));
        }
        let text = format_float(next);
        self.put_string(key, text.clone().into_bytes(), true);
        Ok(Value::Str(text))
    }

    fn hincr(&mut self, key: &str, field: &str, delta: i64) -> Result<Value> {
        let hash = self.hash_mut(key)?;
        let current = match hash.get(field) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| store_err("ERR hash value is not an integer"))?,
            None => 0,
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| store_err("ERR increment or decrement would overflow"))?;
        hash.insert(field.to_string(), next.to_string());
        Ok(Value::Int(next))
    }

    fn hincr_float(&mut self, key: &str, field: &str, delta: f64) -> Result<Value> {
        let hash = self.hash_mut(key)?;
        let current = match hash.get(field) {
            Some(raw) => raw
                .parse::<f64>()
                .map_err(|_| store_err("ERR hash value is not a float"))?,
            None => 0.0,
        };
        let next = current + delta;
        if !next.is_finite() {
            return Err(store_err("ERR increment would produce NaN or Infinity"));
        }
        let text = format_float(next);
        hash.insert(field.to_string(), text.clone());
        Ok(Value::Str(text))
    }

    fn push(&mut self, key: &str, values: Vec<String>, front: bool, only_existing: bool) -> Result<Value> {
        if only_existing && self.list(key)?.is_none() {
            return Ok(Value::Int(0));
        }
        let list = self.list_mut(key)?;
        for value in values {
            if front {
                list.push_front(value);
            } else {
                list.push_back(value);
            }
        }
        Ok(Value::Int(list.len() as i64))
    }

    fn pop(&mut self, key: &str, front: bool) -> Result<Value> {
        let popped = match self.list(key)? {
            Some(list) if front => list.pop_front(),
            Some(list) => list.pop_back(),
            None => None,
        };
        self.drop_if_empty(key);
        Ok(popped.map(Value::Str).unwrap_or(Value::Nil))
    }

    /// Apply one command
    pub(crate) fn apply(&mut self, command: &Command) -> Result<Value> {
        let args = Args { command };
        trace!(command = %command.name, "memory store");

        match command.name {
            // keys
            CommandName::Del => {
                let mut removed = 0;
                for key in args.rest(0)? {
                    if self.exists(&key) {
                        self.slots.remove(&key);
                        removed += 1;
                    }
                }
                Ok(Value::Int(removed))
            }
            CommandName::Exists => {
                let mut found = 0;
                for key in args.rest(0)? {
                    if self.exists(&key) {
                        found += 1;
                    }
                }
                Ok(Value::Int(found))
            }
            CommandName::Expire => {
                let at = now_ms() + args.int(1)? * 1000;
                Ok(self.expire_at(&args.str(0)?, at))
            }
            CommandName::PExpire => {
                let at = now_ms() + args.int(1)?;
                Ok(self.expire_at(&args.str(0)?, at))
            }
            CommandName::ExpireAt => Ok(self.expire_at(&args.str(0)?, args.int(1)? * 1000)),
            CommandName::PExpireAt => Ok(self.expire_at(&args.str(0)?, args.int(1)?)),
            CommandName::Persist => match self.slot(&args.str(0)?) {
                Some(slot) if slot.expires_at.is_some() => {
                    slot.expires_at = None;
                    Ok(Value::Int(1))
                }
                _ => Ok(Value::Int(0)),
            },
            CommandName::Ttl => {
                let ms = self.remaining_ms(&args.str(0)?);
                Ok(Value::Int(if ms < 0 { ms } else { (ms + 500) / 1000 }))
            }
            CommandName::PTtl => Ok(Value::Int(self.remaining_ms(&args.str(0)?))),
            CommandName::Info => Err(store_err("ERR INFO is answered by the store itself")),

            // strings
            CommandName::Get => Ok(self
                .string(&args.str(0)?)?
                .map(|b| bytes_value(b))
                .unwrap_or(Value::Nil)),
            CommandName::Set => {
                let key = args.str(0)?;
                let value = args.str(1)?;
                let present = self.exists(&key);
                if (args.flag("nx") && present) || (args.flag("xx") && !present) {
                    return Ok(Value::Nil);
                }
                self.put_string(&key, value.into_bytes(), args.flag("keepttl"));
                let ttl = match (command.kwarg("ex"), command.kwarg("px")) {
                    (Some(ex), _) => ex.as_i64().map(|s| s * 1000),
                    (None, Some(px)) => px.as_i64(),
                    (None, None) => None,
                };
                if let Some(ms) = ttl {
                    if ms <= 0 {
                        return Err(store_err("ERR invalid expire time in 'set' command"));
                    }
                    self.expire_at(&key, now_ms() + ms);
                }
                Ok(Value::ok())
            }
            CommandName::SetNx => {
                let key = args.str(0)?;
                if self.exists(&key) {
                    return Ok(Value::Int(0));
                }
                self.put_string(&key, args.str(1)?.into_bytes(), false);
                Ok(Value::Int(1))
            }
            CommandName::SetEx | CommandName::PSetEx => {
                let key = args.str(0)?;
                let amount = args.int(1)?;
                if amount <= 0 {
                    return Err(store_err("ERR invalid expire time"));
                }
                let ms = if command.name == CommandName::SetEx { amount * 1000 } else { amount };
                self.put_string(&key, args.str(2)?.into_bytes(), false);
                self.expire_at(&key, now_ms() + ms);
                Ok(Value::ok())
            }
            CommandName::GetSet => {
                let key = args.str(0)?;
                let old = self.string(&key)?.map(|b| bytes_value(b)).unwrap_or(Value::Nil);
                self.put_string(&key, args.str(1)?.into_bytes(), false);
                Ok(old)
            }
            CommandName::Append => {
                let suffix = args.str(1)?;
                let bytes = self.string_mut(&args.str(0)?)?;
                bytes.extend_from_slice(suffix.as_bytes());
                Ok(Value::Int(bytes.len() as i64))
            }
            CommandName::SetRange => {
                let offset = usize::try_from(args.int(1)?)
                    .map_err(|_| store_err("ERR offset is out of range"))?;
                let patch = args.str(2)?;
                let key = args.str(0)?;
                if patch.is_empty() {
                    let len = self.string(&key)?.map(|b| b.len()).unwrap_or(0);
                    return Ok(Value::Int(len as i64));
                }
                let bytes = self.string_mut(&key)?;
                let end = offset + patch.len();
                if bytes.len() < end {
                    bytes.resize(end, 0);
                }
                bytes[offset..end].copy_from_slice(patch.as_bytes());
                Ok(Value::Int(bytes.len() as i64))
            }
            CommandName::GetRange => {
                let (start, stop) = (args.int(1)?, args.int(2)?);
                let bytes = match self.string(&args.str(0)?)? {
                    Some(bytes) => bytes.clone(),
                    None => return Ok(Value::Str(String::new())),
                };
                Ok(match range_bounds(start, stop, bytes.len()) {
                    Some((s, e)) => bytes_value(&bytes[s..=e]),
                    None => Value::Str(String::new()),
                })
            }
            CommandName::SetBit => {
                let offset = usize::try_from(args.int(1)?)
                    .map_err(|_| store_err("ERR bit offset is not an integer or out of range"))?;
                let bit = match args.int(2)? {
                    0 => false,
                    1 => true,
                    _ => return Err(store_err("ERR bit is not an integer or out of range")),
                };
                let bytes = self.string_mut(&args.str(0)?)?;
                let byte = offset / 8;
                let mask = 1u8 << (7 - offset % 8);
                if bytes.len() <= byte {
                    bytes.resize(byte + 1, 0);
                }
                let old = (bytes[byte] & mask != 0) as i64;
                if bit {
                    bytes[byte] |= mask;
                } else {
                    bytes[byte] &= !mask;
                }
                Ok(Value::Int(old))
            }
            CommandName::GetBit => {
                let offset = usize::try_from(args.int(1)?)
                    .map_err(|_| store_err("ERR bit offset is not an integer or out of range"))?;
                let bit = self
                    .string(&args.str(0)?)?
                    .and_then(|bytes| bytes.get(offset / 8).copied())
                    .map(|b| (b & (1u8 << (7 - offset % 8)) != 0) as i64)
                    .unwrap_or(0);
                Ok(Value::Int(bit))
            }
            CommandName::StrLen => Ok(Value::Int(
                self.string(&args.str(0)?)?.map(|b| b.len()).unwrap_or(0) as i64,
            )),
            CommandName::Incr => self.incr_by(&args.str(0)?, 1),
            CommandName::Decr => self.incr_by(&args.str(0)?, -1),
            CommandName::IncrBy => self.incr_by(&args.str(0)?, args.int(1)?),
            CommandName::DecrBy => {
                let delta = args.int(1)?.checked_neg().ok_or_else(|| store_err(NOT_INTEGER))?;
                self.incr_by(&args.str(0)?, delta)
            }
            CommandName::IncrByFloat => self.incr_by_float(&args.str(0)?, args.float(1)?),

            // hashes
            CommandName::HGet => {
                let field = args.str(1)?;
                Ok(self
                    .hash(&args.str(0)?)?
                    .and_then(|h| h.get(&field).cloned())
                    .map(Value::Str)
                    .unwrap_or(Value::Nil))
            }
            CommandName::HSet | CommandName::HMSet => {
                let pairs = args.rest(1)?;
                if pairs.len() % 2 != 0 {
                    return Err(args.arity_error());
                }
                let hash = self.hash_mut(&args.str(0)?)?;
                let mut added = 0;
                for pair in pairs.chunks(2) {
                    if hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
                        added += 1;
                    }
                }
                Ok(if command.name == CommandName::HMSet {
                    Value::ok()
                } else {
                    Value::Int(added)
                })
            }
            CommandName::HSetNx => {
                let (field, value) = (args.str(1)?, args.str(2)?);
                let hash = self.hash_mut(&args.str(0)?)?;
                if hash.contains_key(&field) {
                    return Ok(Value::Int(0));
                }
                hash.insert(field, value);
                Ok(Value::Int(1))
            }
            CommandName::HIncrBy => self.hincr(&args.str(0)?, &args.str(1)?, args.int(2)?),
            CommandName::HIncrByFloat => self.hincr_float(&args.str(0)?, &args.str(1)?, args.float(2)?),
            CommandName::HDel => {
                let key = args.str(0)?;
                let fields = args.rest(1)?;
                let removed = match self.hash(&key)? {
                    Some(hash) => fields.iter().filter(|f| hash.remove(*f).is_some()).count(),
                    None => 0,
                };
                self.drop_if_empty(&key);
                Ok(Value::Int(removed as i64))
            }
            CommandName::HExists => {
                let field = args.str(1)?;
                Ok(Value::Int(
                    self.hash(&args.str(0)?)?.map(|h| h.contains_key(&field)).unwrap_or(false) as i64,
                ))
            }
            CommandName::HMGet => {
                let fields = args.rest(1)?;
                let hash = self.hash(&args.str(0)?)?;
                Ok(Value::Array(
                    fields
                        .iter()
                        .map(|f| {
                            hash.as_ref()
                                .and_then(|h| h.get(f).cloned())
                                .map(Value::Str)
                                .unwrap_or(Value::Nil)
                        })
                        .collect(),
                ))
            }
            CommandName::HGetAll => Ok(Value::Array(
                self.hash(&args.str(0)?)?
                    .map(|h| {
                        h.iter()
                            .flat_map(|(k, v)| [Value::Str(k.clone()), Value::Str(v.clone())])
                            .collect()
                    })
                    .unwrap_or_default(),
            )),
            CommandName::HLen => Ok(Value::Int(
                self.hash(&args.str(0)?)?.map(|h| h.len()).unwrap_or(0) as i64,
            )),

            // sets
            CommandName::SAdd => {
                let members = args.rest(1)?;
                let set = self.set_mut(&args.str(0)?)?;
                Ok(Value::Int(members.into_iter().filter(|m| set.insert(m.clone())).count() as i64))
            }
            CommandName::SRem => {
                let key = args.str(0)?;
                let members = args.rest(1)?;
                let removed = match self.set(&key)? {
                    Some(set) => members.iter().filter(|m| set.remove(*m)).count(),
                    None => 0,
                };
                self.drop_if_empty(&key);
                Ok(Value::Int(removed as i64))
            }
            CommandName::SMembers => Ok(Value::Array(
                self.set(&args.str(0)?)?
                    .map(|s| s.iter().cloned().map(Value::Str).collect())
                    .unwrap_or_default(),
            )),
            CommandName::SIsMember => {
                let member = args.str(1)?;
                Ok(Value::Int(
                    self.set(&args.str(0)?)?.map(|s| s.contains(&member)).unwrap_or(false) as i64,
                ))
            }
            CommandName::SCard => Ok(Value::Int(
                self.set(&args.str(0)?)?.map(|s| s.len()).unwrap_or(0) as i64,
            )),
            CommandName::SInter => {
                let mut result: Option<BTreeSet<String>> = None;
                for key in args.rest(0)? {
                    let members = self.set(&key)?.map(|s| s.clone()).unwrap_or_default();
                    result = Some(match result {
                        None => members,
                        Some(acc) => acc.intersection(&members).cloned().collect(),
                    });
                }
                Ok(Value::Array(
                    result.unwrap_or_default().into_iter().map(Value::Str).collect(),
                ))
            }
            CommandName::SPop => {
                let key = args.str(0)?;
                let popped = match self.set(&key)? {
                    Some(set) => {
                        let pick = set.iter().choose(&mut rand::thread_rng()).cloned();
                        if let Some(member) = &pick {
                            set.remove(member);
                        }
                        pick
                    }
                    None => None,
                };
                self.drop_if_empty(&key);
                Ok(popped.map(Value::Str).unwrap_or(Value::Nil))
            }
            CommandName::SRandMember => Ok(self
                .set(&args.str(0)?)?
                .and_then(|s| s.iter().choose(&mut rand::thread_rng()).cloned())
                .map(Value::Str)
                .unwrap_or(Value::Nil)),

            // lists
            CommandName::LPush => self.push(&args.str(0)?, args.rest(1)?, true, false),
            CommandName::RPush => self.push(&args.str(0)?, args.rest(1)?, false, false),
            CommandName::LPushX => self.push(&args.str(0)?, args.rest(1)?, true, true),
            CommandName::RPushX => self.push(&args.str(0)?, args.rest(1)?, false, true),
            CommandName::LPop => self.pop(&args.str(0)?, true),
            CommandName::RPop => self.pop(&args.str(0)?, false),
            CommandName::LIndex => {
                let index = args.int(1)?;
                let list = match self.list(&args.str(0)?)? {
                    Some(list) => list,
                    None => return Ok(Value::Nil),
                };
                let position = if index < 0 { list.len() as i64 + index } else { index };
                Ok(usize::try_from(position)
                    .ok()
                    .and_then(|p| list.get(p).cloned())
                    .map(Value::Str)
                    .unwrap_or(Value::Nil))
            }
            CommandName::LLen => Ok(Value::Int(
                self.list(&args.str(0)?)?.map(|l| l.len()).unwrap_or(0) as i64,
            )),
            CommandName::LRange => {
                let (start, stop) = (args.int(1)?, args.int(2)?);
                let list = match self.list(&args.str(0)?)? {
                    Some(list) => list,
                    None => return Ok(Value::Array(Vec::new())),
                };
                Ok(Value::Array(match range_bounds(start, stop, list.len()) {
                    Some((s, e)) => list.range(s..=e).cloned().map(Value::Str).collect(),
                    None => Vec::new(),
                }))
            }
            CommandName::LSet => {
                let index = args.int(1)?;
                let value = args.str(2)?;
                let list = self
                    .list(&args.str(0)?)?
                    .ok_or_else(|| store_err("ERR no such key"))?;
                let len = list.len() as i64;
                let position = if index < 0 { len + index } else { index };
                if position < 0 || position >= len {
                    return Err(store_err("ERR index out of range"));
                }
                list[position as usize] = value;
                Ok(Value::ok())
            }
            CommandName::LRem => {
                let key = args.str(0)?;
                let count = args.int(1)?;
                let value = args.str(2)?;
                let removed = match self.list(&key)? {
                    Some(list) => {
                        let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() as usize };
                        let mut positions: Vec<usize> =
                            list.iter().enumerate().filter(|(_, v)| **v == value).map(|(i, _)| i).collect();
                        if count < 0 {
                            positions.reverse();
                        }
                        positions.truncate(limit);
                        positions.sort_unstable_by(|a, b| b.cmp(a));
                        for position in &positions {
                            list.remove(*position);
                        }
                        positions.len()
                    }
                    None => 0,
                };
                self.drop_if_empty(&key);
                Ok(Value::Int(removed as i64))
            }
            CommandName::LTrim => {
                let key = args.str(0)?;
                let (start, stop) = (args.int(1)?, args.int(2)?);
                if let Some(list) = self.list(&key)? {
                    match range_bounds(start, stop, list.len()) {
                        Some((s, e)) => {
                            list.truncate(e + 1);
                            list.drain(..s);
                        }
                        None => list.clear(),
                    }
                }
                self.drop_if_empty(&key);
                Ok(Value::ok())
            }
            CommandName::LInsert => {
                let where_ = args.str(1)?.to_ascii_lowercase();
                let (pivot, value) = (args.str(2)?, args.str(3)?);
                let after = match where_.as_str() {
                    "before" => false,
                    "after" => true,
                    _ => return Err(store_err("ERR syntax error")),
                };
                let list = match self.list(&args.str(0)?)? {
                    Some(list) => list,
                    None => return Ok(Value::Int(0)),
                };
                match list.iter().position(|v| *v == pivot) {
                    Some(i) => {
                        list.insert(if after { i + 1 } else { i }, value);
                        Ok(Value::Int(list.len() as i64))
                    }
                    None => Ok(Value::Int(-1)),
                }
            }

            // sorted sets
            CommandName::ZAdd => {
                let pairs = args.rest(1)?;
                if pairs.len() % 2 != 0 {
                    return Err(args.arity_error());
                }
                let mut scored = Vec::with_capacity(pairs.len() / 2);
                for pair in pairs.chunks(2) {
                    let score: f64 = pair[0].parse().map_err(|_| store_err(NOT_FLOAT))?;
                    scored.push((pair[1].clone(), score));
                }
                let zset = self.zset_mut(&args.str(0)?)?;
                let added = scored
                    .into_iter()
                    .filter(|(member, score)| zset.insert(member.clone(), *score).is_none())
                    .count();
                Ok(Value::Int(added as i64))
            }
            CommandName::ZRem => {
                let key = args.str(0)?;
                let members = args.rest(1)?;
                let removed = match self.zset(&key)? {
                    Some(zset) => members.iter().filter(|m| zset.remove(*m).is_some()).count(),
                    None => 0,
                };
                self.drop_if_empty(&key);
                Ok(Value::Int(removed as i64))
            }
            CommandName::ZIncrBy => {
                let delta = args.float(1)?;
                let member = args.str(2)?;
                let zset = self.zset_mut(&args.str(0)?)?;
                let score = zset.entry(member).or_insert(0.0);
                *score += delta;
                Ok(Value::Str(format_float(*score)))
            }
            CommandName::ZCard => Ok(Value::Int(
                self.zset(&args.str(0)?)?.map(|z| z.len()).unwrap_or(0) as i64,
            )),
            CommandName::ZScore => {
                let member = args.str(1)?;
                Ok(self
                    .zset(&args.str(0)?)?
                    .and_then(|z| z.get(&member).copied())
                    .map(|s| Value::Str(format_float(s)))
                    .unwrap_or(Value::Nil))
            }
            CommandName::ZRange => {
                let (start, stop) = (args.int(1)?, args.int(2)?);
                let with_scores = args.flag("withscores");
                let zset = match self.zset(&args.str(0)?)? {
                    Some(zset) => zset,
                    None => return Ok(Value::Array(Vec::new())),
                };
                let members = sorted_members(zset);
                let mut out = Vec::new();
                if let Some((s, e)) = range_bounds(start, stop, members.len()) {
                    for (member, score) in &members[s..=e] {
                        out.push(Value::Str((*member).clone()));
                        if with_scores {
                            out.push(Value::Str(format_float(*score)));
                        }
                    }
                }
                Ok(Value::Array(out))
            }
            CommandName::ZRank => {
                let member = args.str(1)?;
                Ok(self
                    .zset(&args.str(0)?)?
                    .and_then(|z| sorted_members(z).iter().position(|(m, _)| **m == member))
                    .map(|p| Value::Int(p as i64))
                    .unwrap_or(Value::Nil))
            }
            CommandName::ZCount => {
                let (min, min_excl) = parse_score_bound(&args.str(1)?)?;
                let (max, max_excl) = parse_score_bound(&args.str(2)?)?;
                let count = self
                    .zset(&args.str(0)?)?
                    .map(|z| {
                        z.values()
                            .filter(|s| {
                                let above = if min_excl { **s > min } else { **s >= min };
                                let below = if max_excl { **s < max } else { **s <= max };
                                above && below
                            })
                            .count()
                    })
                    .unwrap_or(0);
                Ok(Value::Int(count as i64))
            }

            CommandName::EvalSha => Err(store_err("NOSCRIPT No matching script")),
        }
    }
}

/// Runs script steps directly on the keyspace, inside the store lock
struct KeyspaceRunner<'a> {
    keyspace: &'a mut Keyspace,
}

impl CommandRunner for KeyspaceRunner<'_> {
    fn run(&mut self, command: Command) -> Result<Value> {
        self.keyspace.apply(&command)
    }
}

/// Thread-safe in-process store
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    version: String,
    scripting: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            keyspace: Mutex::new(Keyspace::default()),
            version: DEFAULT_VERSION.to_string(),
            scripting: true,
        }
    }

    /// Report another server version in `INFO`
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_scripting(mut self, scripting: bool) -> Self {
        self.scripting = scripting;
        self
    }

    /// Number of live keys
    pub fn key_count(&self) -> usize {
        let mut keyspace = self.keyspace.lock();
        let keys: Vec<String> = keyspace.slots.keys().cloned().collect();
        keys.iter().filter(|k| keyspace.exists(k)).count()
    }

    /// Every live key, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keyspace = self.keyspace.lock();
        let mut keys: Vec<String> = keyspace.slots.keys().cloned().collect();
        keys.retain(|k| keyspace.exists(k));
        keys.sort();
        keys
    }

    pub fn flush(&self) {
        self.keyspace.lock().slots.clear();
    }

    /// `release-lock` script: delete the marker if it still holds the token
    fn release_lock(&self, args: &[Value]) -> Result<Value> {
        let (key, token) = match args {
            [_, _, key, token, ..] => (key.clone(), token.as_str()),
            _ => return Err(store_err("ERR wrong number of script arguments")),
        };
        let mut keyspace = self.keyspace.lock();
        let current = keyspace.apply(&Command::new(CommandName::Get, vec![key.clone()]))?;
        if token.is_none() || current.as_str() != token {
            return Ok(Value::Int(0));
        }
        keyspace.apply(&Command::new(CommandName::Del, vec![key]))
    }
}

impl Store for MemoryStore {
    fn execute(&self, command: &Command) -> Result<Value> {
        match command.name {
            CommandName::Info => Ok(Value::Str(format!(
                "# Server\r\nredis_version:{}\r\n",
                self.version
            ))),
            CommandName::EvalSha => {
                if !self.scripting {
                    return Err(store_err("NOSCRIPT No matching script"));
                }
                if command.args.first().and_then(Value::as_str) == Some(RELEASE_LOCK_SCRIPT) {
                    return self.release_lock(&command.args);
                }
                let plan = IndexedMutation::from_script_args(&command.args)?;
                let mut keyspace = self.keyspace.lock();
                let outcome = execute_mutation(&mut KeyspaceRunner { keyspace: &mut keyspace }, &plan)?;
                Ok(outcome.to_reply())
            }
            _ => self.keyspace.lock().apply(command),
        }
    }

    fn supports_scripting(&self) -> bool {
        self.scripting
    }
}

/// Opens `MemoryStore`s
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    scheme: String,
    version: String,
    scripting: bool,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        MemoryConnector {
            scheme: "memory".to_string(),
            version: DEFAULT_VERSION.to_string(),
            scripting: true,
        }
    }

    /// Stores opened by this connector report `version`
    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self.refresh_scheme();
        self
    }

    pub fn scripting(mut self, scripting: bool) -> Self {
        self.scripting = scripting;
        self.refresh_scheme();
        self
    }

    // Differently configured stores must not share registry entries
    fn refresh_scheme(&mut self) {
        let mut scheme = "memory".to_string();
        if self.version != DEFAULT_VERSION {
            scheme.push_str(&format!("+v{}", self.version));
        }
        if !self.scripting {
            scheme.push_str("+noscript");
        }
        self.scheme = scheme;
    }
}

impl Connector for MemoryConnector {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn open(&self, settings: &ConnectionSettings) -> Result<Arc<dyn Store>> {
        trace!(settings = %settings.normalized_key(), "opening memory store");
        Ok(Arc::new(
            MemoryStore::new()
                .with_version(&self.version)
                .with_scripting(self.scripting),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::release_script_command;

    fn run(store: &MemoryStore, name: CommandName, args: &[&str]) -> Result<Value> {
        store.execute(&Command::new(name, args.iter().map(|a| Value::from(*a)).collect()))
    }

    #[test]
    fn test_strings() {
        let store = MemoryStore::new();
        assert_eq!(run(&store, CommandName::Set, &["k", "foo"]).unwrap(), Value::ok());
        assert_eq!(run(&store, CommandName::Append, &["k", "bar"]).unwrap(), Value::Int(6));
        assert_eq!(run(&store, CommandName::GetRange, &["k", "1", "-2"]).unwrap(), Value::from("ooba"));
        assert_eq!(run(&store, CommandName::SetRange, &["k", "3", "BAR"]).unwrap(), Value::Int(6));
        assert_eq!(run(&store, CommandName::Get, &["k"]).unwrap(), Value::from("fooBAR"));
        assert_eq!(run(&store, CommandName::SetNx, &["k", "x"]).unwrap(), Value::Int(0));
        assert_eq!(run(&store, CommandName::GetSet, &["k", "new"]).unwrap(), Value::from("fooBAR"));
        assert!(run(&store, CommandName::Incr, &["k"]).is_err());
    }

    #[test]
    fn test_counters() {
        let store = MemoryStore::new();
        assert_eq!(run(&store, CommandName::Incr, &["n"]).unwrap(), Value::Int(1));
        assert_eq!(run(&store, CommandName::IncrBy, &["n", "9"]).unwrap(), Value::Int(10));
        assert_eq!(run(&store, CommandName::DecrBy, &["n", "3"]).unwrap(), Value::Int(7));
        assert_eq!(run(&store, CommandName::IncrByFloat, &["n", "0.5"]).unwrap(), Value::from("7.5"));
        assert_eq!(run(&store, CommandName::HIncrBy, &["h", "f", "2"]).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_setbit() {
        let store = MemoryStore::new();
        assert_eq!(run(&store, CommandName::SetBit, &["b", "7", "1"]).unwrap(), Value::Int(0));
        assert_eq!(run(&store, CommandName::GetBit, &["b", "7"]).unwrap(), Value::Int(1));
        assert_eq!(run(&store, CommandName::StrLen, &["b"]).unwrap(), Value::Int(1));
        assert_eq!(run(&store, CommandName::Get, &["b"]).unwrap(), Value::from("\u{1}"));
    }

    #[test]
    fn test_wrong_type() {
        let store = MemoryStore::new();
        run(&store, CommandName::SAdd, &["s", "a"]).unwrap();
        let err = run(&store, CommandName::Get, &["s"]).unwrap_err();
        assert!(err.to_string().contains("WRONGTYPE"));
    }

    #[test]
    fn test_empty_containers_vanish() {
        let store = MemoryStore::new();
        run(&store, CommandName::SAdd, &["s", "a"]).unwrap();
        run(&store, CommandName::SRem, &["s", "a"]).unwrap();
        assert_eq!(run(&store, CommandName::Exists, &["s"]).unwrap(), Value::Int(0));
        run(&store, CommandName::HSet, &["h", "f", "v"]).unwrap();
        run(&store, CommandName::HDel, &["h", "f"]).unwrap();
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn test_expiration() {
        let store = MemoryStore::new();
        run(&store, CommandName::Set, &["k", "v"]).unwrap();
        assert_eq!(run(&store, CommandName::Ttl, &["k"]).unwrap(), Value::Int(-1));
        assert_eq!(run(&store, CommandName::Expire, &["k", "100"]).unwrap(), Value::Int(1));
        assert_eq!(run(&store, CommandName::Ttl, &["k"]).unwrap(), Value::Int(100));
        assert_eq!(run(&store, CommandName::Persist, &["k"]).unwrap(), Value::Int(1));
        run(&store, CommandName::PExpireAt, &["k", "1"]).unwrap();
        assert_eq!(run(&store, CommandName::Get, &["k"]).unwrap(), Value::Nil);
        assert_eq!(run(&store, CommandName::Ttl, &["k"]).unwrap(), Value::Int(-2));
    }

    #[test]
    fn test_set_options() {
        let store = MemoryStore::new();
        let set_nx = Command::new(CommandName::Set, vec!["k".into(), "a".into()]).with_kwarg("nx", 1);
        assert_eq!(store.execute(&set_nx).unwrap(), Value::ok());
        assert_eq!(store.execute(&set_nx).unwrap(), Value::Nil);

        let set_px = Command::new(CommandName::Set, vec!["t".into(), "a".into()]).with_kwarg("px", 5000);
        store.execute(&set_px).unwrap();
        let pttl = run(&store, CommandName::PTtl, &["t"]).unwrap().as_i64().unwrap();
        assert!(pttl > 0 && pttl <= 5000);
    }

    #[test]
    fn test_sets_and_lists() {
        let store = MemoryStore::new();
        run(&store, CommandName::SAdd, &["a", "1", "2", "3"]).unwrap();
        run(&store, CommandName::SAdd, &["b", "2", "3", "4"]).unwrap();
        assert_eq!(
            run(&store, CommandName::SInter, &["a", "b"]).unwrap().into_strings(),
            vec!["2", "3"]
        );
        assert!(run(&store, CommandName::SInter, &["a", "missing"]).unwrap().into_strings().is_empty());

        run(&store, CommandName::RPush, &["l", "x", "y", "z", "y"]).unwrap();
        assert_eq!(run(&store, CommandName::LRem, &["l", "0", "y"]).unwrap(), Value::Int(2));
        assert_eq!(run(&store, CommandName::LInsert, &["l", "BEFORE", "z", "w"]).unwrap(), Value::Int(3));
        assert_eq!(
            run(&store, CommandName::LRange, &["l", "0", "-1"]).unwrap().into_strings(),
            vec!["x", "w", "z"]
        );
        run(&store, CommandName::LTrim, &["l", "1", "1"]).unwrap();
        assert_eq!(run(&store, CommandName::LIndex, &["l", "0"]).unwrap(), Value::from("w"));
    }

    #[test]
    fn test_sorted_sets() {
        let store = MemoryStore::new();
        run(&store, CommandName::ZAdd, &["z", "2", "b", "1", "a", "3", "c"]).unwrap();
        assert_eq!(
            run(&store, CommandName::ZRange, &["z", "0", "-1"]).unwrap().into_strings(),
            vec!["a", "b", "c"]
        );
        assert_eq!(run(&store, CommandName::ZRank, &["z", "c"]).unwrap(), Value::Int(2));
        assert_eq!(run(&store, CommandName::ZCount, &["z", "(1", "+inf"]).unwrap(), Value::Int(2));
        assert_eq!(run(&store, CommandName::ZIncrBy, &["z", "1.5", "a"]).unwrap(), Value::from("2.5"));
    }

    #[test]
    fn test_release_lock_script() {
        let store = MemoryStore::new();
        run(&store, CommandName::Set, &["marker", "mine"]).unwrap();

        let reply = store.execute(&release_script_command("marker", "theirs")).unwrap();
        assert_eq!(reply, Value::Int(0));
        assert_eq!(run(&store, CommandName::Get, &["marker"]).unwrap(), Value::from("mine"));

        let reply = store.execute(&release_script_command("marker", "mine")).unwrap();
        assert_eq!(reply, Value::Int(1));
        assert_eq!(run(&store, CommandName::Get, &["marker"]).unwrap(), Value::Nil);
    }

    #[test]
    fn test_info_and_scripting() {
        let store = MemoryStore::new().with_version("2.4.0").with_scripting(false);
        let info = run(&store, CommandName::Info, &[]).unwrap();
        assert!(info.as_str().unwrap().contains("redis_version:2.4.0"));
        let err = run(&store, CommandName::EvalSha, &["kvindex:indexed-mutation"]).unwrap_err();
        assert!(err.to_string().contains("NOSCRIPT"));
    }
}
