//! Core type definitions for kvindex

use serde::{Deserialize, Serialize};

/// Key component separator
pub const KEY_SEPARATOR: &str = ":";

/// Store argument / reply value
///
/// Strings are the store's native scalar; numbers are accepted as arguments
/// and returned by counters, but are stored in their string form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Nil,
    Int(i64),
    Float(f64),
    Str(String),
    Status(String),
    Array(Vec<Value>),
}

impl Value {
    pub fn ok() -> Self {
        Value::Status("OK".to_string())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Status(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Integer replies of 1 (SETNX, HSETNX, SADD...) are "true"
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Status(_) => true,
            Value::Array(items) => !items.is_empty(),
        }
    }

    /// String form as the store keeps it, `None` for nil and arrays
    pub fn to_store_string(&self) -> Option<String> {
        match self {
            Value::Nil | Value::Array(_) => None,
            Value::Int(v) => Some(v.to_string()),
            Value::Float(v) => Some(format_float(*v)),
            Value::Str(s) | Value::Status(s) => Some(s.clone()),
        }
    }

    pub fn into_array(self) -> Vec<Value> {
        match self {
            Value::Array(items) => items,
            Value::Nil => Vec::new(),
            other => vec![other],
        }
    }

    /// Collect an array reply of strings (set members, list ranges)
    pub fn into_strings(self) -> Vec<String> {
        self.into_array()
            .into_iter()
            .filter_map(|v| v.to_store_string())
            .collect()
    }
}

/// Format a float the way the store does for INCRBYFLOAT replies
pub fn format_float(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e17 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::Str(s.clone())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Nil)
    }
}

/// Join key components with `:`
pub fn make_key<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut key = String::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            key.push_str(KEY_SEPARATOR);
        }
        key.push_str(part.as_ref());
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_key() {
        assert_eq!(make_key(["bike", "1", "name"]), "bike:1:name");
        assert_eq!(make_key(vec!["single".to_string()]), "single");
    }

    #[test]
    fn test_store_string_forms() {
        assert_eq!(Value::Int(42).to_store_string().as_deref(), Some("42"));
        assert_eq!(Value::Float(3.0).to_store_string().as_deref(), Some("3"));
        assert_eq!(Value::Float(10.5).to_store_string().as_deref(), Some("10.5"));
        assert_eq!(Value::Nil.to_store_string(), None);
    }

    #[test]
    fn test_numeric_parsing() {
        assert_eq!(Value::from("12").as_i64(), Some(12));
        assert_eq!(Value::from("1.5").as_f64(), Some(1.5));
        assert_eq!(Value::from("abc").as_i64(), None);
        assert!(Value::Int(1).is_truthy());
        assert!(!Value::Int(0).is_truthy());
    }
}
