// SPDX-License-Identifier: MIT

//! Graph nodes
//!
//! A [`Node`] is a cheap shared handle. Identity is the [`Buid`], a sha256 of
//! the node definition; mutable state (props, tags, tag props) sits behind a
//! lock owned by the storage layer.

use futures::stream::BoxStream;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::error::{Result, StormError};
use super::value::{Derefable, Value};

/// A stream of nodes produced by storage lookups
pub type NodeStream = BoxStream<'static, Result<Node>>;

/// A time interval in epoch millis, `(min, max)`
pub type Ival = (i64, i64);

/// Binary unique identifier of a node
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Buid([u8; 32]);

impl Buid {
    pub fn from_ndef(form: &str, valu: &Value) -> Self {
        let ndef = serde_json::json!([form, valu.to_json()]);
        let digest = Sha256::digest(ndef.to_string().as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(text: &str) -> Option<Self> {
        if text.len() != 64 || !text.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for Buid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl fmt::Debug for Buid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buid({})", self.hex())
    }
}

/// A node definition: `(form, normalized value)`
#[derive(Debug, Clone, PartialEq)]
pub struct Ndef {
    pub form: String,
    pub valu: Value,
}

impl Ndef {
    pub fn new(form: impl Into<String>, valu: Value) -> Self {
        Self {
            form: form.into(),
            valu,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::List(vec![Value::Str(self.form.clone()), self.valu.clone()])
    }

    /// Parse a `[form, valu]` pair
    pub fn from_value(valu: &Value) -> Option<Self> {
        match valu {
            Value::List(items) if items.len() == 2 => {
                let form = items[0].as_str()?;
                Some(Self::new(form, items[1].clone()))
            }
            Value::Node(node) => Some(node.ndef().clone()),
            _ => None,
        }
    }

    pub fn buid(&self) -> Buid {
        Buid::from_ndef(&self.form, &self.valu)
    }
}

/// Mutable node state, guarded by the node lock
#[derive(Debug, Clone, Default)]
pub struct NodeState {
    pub props: BTreeMap<String, Value>,
    pub tags: BTreeMap<String, Option<Ival>>,
    pub tagprops: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Debug)]
struct NodeInner {
    buid: Buid,
    ndef: Ndef,
    state: RwLock<NodeState>,
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(ndef: Ndef) -> Self {
        let buid = ndef.buid();
        Self {
            inner: Arc::new(NodeInner {
                buid,
                ndef,
                state: RwLock::new(NodeState::default()),
            }),
        }
    }

    pub fn buid(&self) -> Buid {
        self.inner.buid
    }

    pub fn iden(&self) -> String {
        self.inner.buid.hex()
    }

    pub fn ndef(&self) -> &Ndef {
        &self.inner.ndef
    }

    pub fn form(&self) -> &str {
        &self.inner.ndef.form
    }

    pub fn valu(&self) -> &Value {
        &self.inner.ndef.valu
    }

    /// Property value, `None` when unset
    pub fn get(&self, prop: &str) -> Option<Value> {
        self.inner.state.read().props.get(prop).cloned()
    }

    pub fn has(&self, prop: &str) -> bool {
        self.inner.state.read().props.contains_key(prop)
    }

    pub fn props(&self) -> BTreeMap<String, Value> {
        self.inner.state.read().props.clone()
    }

    /// Outer `None` when the tag is absent, inner `None` when it has no interval
    pub fn tag(&self, tag: &str) -> Option<Option<Ival>> {
        self.inner.state.read().tags.get(tag).copied()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.inner.state.read().tags.contains_key(tag)
    }

    pub fn tags(&self) -> BTreeMap<String, Option<Ival>> {
        self.inner.state.read().tags.clone()
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.inner.state.read().tags.keys().cloned().collect()
    }

    /// Tags with no child tag also present on the node
    pub fn leaf_tags(&self) -> Vec<String> {
        let state = self.inner.state.read();
        state
            .tags
            .keys()
            .filter(|tag| {
                let prefix = format!("{}.", tag);
                !state.tags.keys().any(|other| other.starts_with(&prefix))
            })
            .cloned()
            .collect()
    }

    pub fn tagprop(&self, tag: &str, prop: &str) -> Option<Value> {
        self.inner
            .state
            .read()
            .tagprops
            .get(tag)
            .and_then(|props| props.get(prop))
            .cloned()
    }

    pub fn has_tagprop(&self, tag: &str, prop: &str) -> bool {
        self.inner
            .state
            .read()
            .tagprops
            .get(tag)
            .is_some_and(|props| props.contains_key(prop))
    }

    /// Run a closure with write access to node state
    pub fn with_state<R>(&self, func: impl FnOnce(&mut NodeState) -> R) -> R {
        let mut state = self.inner.state.write();
        func(&mut state)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.inner.buid == other.inner.buid
    }
}

impl Eq for Node {}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({}={})", self.form(), self.valu())
    }
}

impl Derefable for Node {
    fn deref(&self, name: &str) -> Result<Value> {
        match name {
            "form" => Ok(Value::str(self.form())),
            "value" => Ok(self.valu().clone()),
            "iden" => Ok(Value::Str(self.iden())),
            "ndef" => Ok(self.ndef().to_value()),
            "props" => Ok(Value::Dict(self.props())),
            "tags" => Ok(Value::Dict(
                self.tags()
                    .into_iter()
                    .map(|(tag, ival)| (tag, ival_to_value(ival)))
                    .collect(),
            )),
            _ => Err(StormError::NoSuchName {
                name: name.to_string(),
                valu: "node".to_string(),
            }),
        }
    }
}

pub fn ival_to_value(ival: Option<Ival>) -> Value {
    match ival {
        Some((min, max)) => Value::List(vec![Value::Int(min), Value::Int(max)]),
        None => Value::Null,
    }
}

/// Normalize a tag name: strip `#`, lowercase, trim every segment
pub fn norm_tag(raw: &str) -> Result<String> {
    let text = raw.trim().trim_start_matches('#').to_lowercase();
    let parts: Vec<&str> = text.split('.').map(str::trim).collect();
    if parts
        .iter()
        .any(|part| part.is_empty() || part.chars().any(char::is_whitespace))
    {
        return Err(StormError::bad_valu("syn:tag", format!("invalid tag {:?}", raw)));
    }
    Ok(parts.join("."))
}

/// Every prefix of a tag, shortest first (`a`, `a.b`, `a.b.c`)
pub fn tag_prefixes(tag: &str) -> Vec<String> {
    let parts: Vec<&str> = tag.split('.').collect();
    (1..=parts.len()).map(|i| parts[..i].join(".")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buid_is_stable() {
        let a = Ndef::new("inet:fqdn", Value::str("vertex.link"));
        let b = Ndef::new("inet:fqdn", Value::str("vertex.link"));
        let c = Ndef::new("inet:fqdn", Value::str("woot.com"));
        assert_eq!(a.buid(), b.buid());
        assert_ne!(a.buid(), c.buid());
        assert_eq!(Buid::from_hex(&a.buid().hex()), Some(a.buid()));
        assert_eq!(Buid::from_hex("zz"), None);
    }

    #[test]
    fn test_leaf_tags() {
        let node = Node::new(Ndef::new("test:str", Value::str("x")));
        node.with_state(|state| {
            state.tags.insert("foo".to_string(), None);
            state.tags.insert("foo.bar".to_string(), Some((1, 2)));
            state.tags.insert("baz".to_string(), None);
        });
        assert_eq!(node.leaf_tags(), vec!["baz".to_string(), "foo.bar".to_string()]);
        assert_eq!(node.tag("foo.bar"), Some(Some((1, 2))));
        assert_eq!(node.tag("nope"), None);
    }

    #[test]
    fn test_norm_tag() {
        assert_eq!(norm_tag("#Foo.Bar").unwrap(), "foo.bar");
        assert!(norm_tag("foo..bar").is_err());
        assert_eq!(tag_prefixes("a.b.c"), vec!["a", "a.b", "a.b.c"]);
    }
}
