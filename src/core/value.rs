// SPDX-License-Identifier: MIT

//! Runtime values flowing through Storm expressions
//!
//! [`Value`] is the type-erased value model of the query core. Scalars and
//! containers mirror JSON, while `Node`, `Func` and `Gen` carry runtime
//! objects that never leave the process.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::error::{Result, StormError};
use super::node::{Node, NodeStream};

/// Something that can be invoked from a Storm expression
#[async_trait]
pub trait Callable: Send + Sync + fmt::Debug {
    /// Name used in error messages
    fn name(&self) -> &str;

    /// Invoke with positional and keyword arguments
    async fn call(&self, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value>;
}

/// A deferred producer of nodes, iterated by `for` loops
pub trait NodeSource: Send + Sync + fmt::Debug {
    fn nodes(&self) -> NodeStream;
}

/// Member lookup on a runtime value (`$valu.name`)
pub trait Derefable {
    fn deref(&self, name: &str) -> Result<Value>;
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    Node(Node),
    Func(Arc<dyn Callable>),
    Gen(Arc<dyn NodeSource>),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short type name for messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Node(_) => "node",
            Self::Func(_) => "function",
            Self::Gen(_) => "generator",
        }
    }

    /// Truthiness
    pub fn tobool(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Str(s) => !s.is_empty(),
            Self::List(l) => !l.is_empty(),
            Self::Dict(d) => !d.is_empty(),
            Self::Node(_) | Self::Func(_) | Self::Gen(_) => true,
        }
    }

    /// Integer coercion used by arithmetic
    pub fn toint(&self) -> Result<i64> {
        match self {
            Self::Int(i) => Ok(*i),
            Self::Bool(b) => Ok(i64::from(*b)),
            Self::Str(s) => {
                let text = s.trim();
                let parsed = match text.strip_prefix("0x") {
                    Some(hex) => i64::from_str_radix(hex, 16).ok(),
                    None => text.parse::<i64>().ok(),
                };
                parsed.ok_or_else(|| self.bad_cast("int"))
            }
            Self::Node(node) => node.valu().toint(),
            _ => Err(self.bad_cast("int")),
        }
    }

    /// String coercion
    pub fn tostr(&self) -> Result<String> {
        match self {
            Self::Str(s) => Ok(s.clone()),
            Self::Int(i) => Ok(i.to_string()),
            Self::Bool(b) => Ok(b.to_string()),
            Self::Node(node) => node.valu().tostr(),
            _ => Err(self.bad_cast("str")),
        }
    }

    /// Primitive projection used for equality and storage
    pub fn toprim(&self) -> Value {
        match self {
            Self::Node(node) => node.valu().clone(),
            Self::List(items) => Self::List(items.iter().map(Value::toprim).collect()),
            Self::Dict(map) => Self::Dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.toprim()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Self::Node(node) => Some(node),
            _ => None,
        }
    }

    /// Render as JSON; runtime objects become descriptive primitives
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Str(s) => Json::String(s.clone()),
            Self::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Self::Dict(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Self::Node(node) => node.ndef().to_value().to_json(),
            Self::Func(func) => Json::String(format!("<function {}>", func.name())),
            Self::Gen(_) => Json::String("<generator>".to_string()),
        }
    }

    fn bad_cast(&self, target: &str) -> StormError {
        StormError::BadCast {
            valu: self.to_string(),
            target: target.to_string(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Dict(a), Self::Dict(b)) => a == b,
            (Self::Node(a), Self::Node(b)) => a == b,
            (Self::Func(a), Self::Func(b)) => Arc::ptr_eq(a, b),
            (Self::Gen(a), Self::Gen(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{}", s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .unwrap_or_else(|| Self::Str(n.to_string())),
            Json::String(s) => Self::Str(s),
            Json::Array(items) => Self::List(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => Self::Dict(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

impl Derefable for Value {
    fn deref(&self, name: &str) -> Result<Value> {
        match self {
            Self::Node(node) => node.deref(name),
            Self::Dict(map) => map.deref(name),
            Self::List(items) => items.deref(name),
            Self::Str(s) => s.deref(name),
            other => Err(StormError::NoSuchName {
                name: name.to_string(),
                valu: other.type_name().to_string(),
            }),
        }
    }
}

impl Derefable for BTreeMap<String, Value> {
    fn deref(&self, name: &str) -> Result<Value> {
        Ok(self.get(name).cloned().unwrap_or_default())
    }
}

impl Derefable for Vec<Value> {
    fn deref(&self, name: &str) -> Result<Value> {
        if name == "size" {
            return Ok(Value::Int(self.len() as i64));
        }
        name.parse::<usize>()
            .ok()
            .and_then(|indx| self.get(indx).cloned())
            .ok_or_else(|| StormError::NoSuchName {
                name: name.to_string(),
                valu: "list".to_string(),
            })
    }
}

impl Derefable for String {
    fn deref(&self, name: &str) -> Result<Value> {
        match name {
            "size" => Ok(Value::Int(self.chars().count() as i64)),
            "lower" => Ok(Value::Str(self.to_lowercase())),
            "upper" => Ok(Value::Str(self.to_uppercase())),
            _ => Err(StormError::NoSuchName {
                name: name.to_string(),
                valu: "str".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json() {
        let valu = Value::from(json!({"a": [1, "two", null, true]}));
        let expected = Value::Dict(BTreeMap::from([(
            "a".to_string(),
            Value::List(vec![
                Value::Int(1),
                Value::str("two"),
                Value::Null,
                Value::Bool(true),
            ]),
        )]));
        assert_eq!(valu, expected);
        assert_eq!(valu.to_json(), json!({"a": [1, "two", null, true]}));
    }

    #[test]
    fn test_coercions() {
        assert_eq!(Value::str(" 42 ").toint().unwrap(), 42);
        assert_eq!(Value::str("0x10").toint().unwrap(), 16);
        assert_eq!(Value::Bool(true).toint().unwrap(), 1);
        assert!(Value::List(vec![]).toint().is_err());
        assert_eq!(Value::Int(3).tostr().unwrap(), "3");
        assert!(!Value::Null.tobool());
        assert!(!Value::str("").tobool());
        assert!(Value::Int(-1).tobool());
    }

    #[test]
    fn test_deref_containers() {
        let list = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(list.deref("size").unwrap(), Value::Int(2));
        assert_eq!(list.deref("1").unwrap(), Value::Int(2));
        assert!(list.deref("9").is_err());

        let dict = Value::from(json!({"k": "v"}));
        assert_eq!(dict.deref("k").unwrap(), Value::str("v"));
        assert_eq!(dict.deref("missing").unwrap(), Value::Null);

        assert_eq!(Value::str("AbC").deref("lower").unwrap(), Value::str("abc"));
        assert!(Value::Int(1).deref("size").is_err());
    }
}
