// SPDX-License-Identifier: MIT

//! Per-branch traversal context
//!
//! A [`Path`] holds the variables bound on one branch of a query, the
//! lineage of nodes that led there and render metadata. Clones share the
//! branch; [`Path::fork`] starts an independent one.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::core::node::Node;
use crate::core::value::Value;

#[derive(Debug, Default)]
struct PathState {
    vars: RwLock<HashMap<String, Value>>,
    meta: RwLock<BTreeMap<String, Value>>,
    nodes: Vec<Node>,
}

#[derive(Debug, Clone, Default)]
pub struct Path {
    state: Arc<PathState>,
}

impl Path {
    /// A fresh path whose lineage is just `node`
    pub fn new(node: &Node) -> Self {
        Self::with_vars(vec![node.clone()], HashMap::new())
    }

    /// A path with no node, used by value-only evaluation
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_vars(nodes: Vec<Node>, vars: HashMap<String, Value>) -> Self {
        Self {
            state: Arc::new(PathState {
                vars: RwLock::new(vars),
                meta: RwLock::new(BTreeMap::new()),
                nodes,
            }),
        }
    }

    /// Copy the variables and extend the lineage by `node`; metadata starts empty
    pub fn fork(&self, node: &Node) -> Self {
        let mut nodes = self.state.nodes.clone();
        nodes.push(node.clone());
        Self::with_vars(nodes, self.vars())
    }

    /// The node this branch currently sits on
    pub fn node(&self) -> Option<&Node> {
        self.state.nodes.last()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.state.nodes
    }

    pub fn get_var(&self, name: &str) -> Option<Value> {
        self.state.vars.read().get(name).cloned()
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.state.vars.read().contains_key(name)
    }

    pub fn set_var(&self, name: impl Into<String>, valu: Value) {
        self.state.vars.write().insert(name.into(), valu);
    }

    pub fn pop_var(&self, name: &str) -> Option<Value> {
        self.state.vars.write().remove(name)
    }

    pub fn vars(&self) -> HashMap<String, Value> {
        self.state.vars.read().clone()
    }

    pub fn meta(&self, key: impl Into<String>, valu: Value) {
        self.state.meta.write().insert(key.into(), valu);
    }

    pub fn get_meta(&self, key: &str) -> Option<Value> {
        self.state.meta.read().get(key).cloned()
    }

    pub fn metas(&self) -> BTreeMap<String, Value> {
        self.state.meta.read().clone()
    }

    /// True when both handles refer to the same branch
    pub fn same_branch(&self, other: &Path) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::Ndef;

    fn node(valu: &str) -> Node {
        Node::new(Ndef::new("test:str", Value::str(valu)))
    }

    #[test]
    fn test_fork_isolation() {
        let a = node("a");
        let path = Path::new(&a);
        path.set_var("x", Value::Int(1));
        path.meta("edges", Value::List(vec![]));

        let left = path.fork(&node("b"));
        let right = path.fork(&node("c"));
        left.set_var("x", Value::Int(2));
        right.set_var("y", Value::Int(3));

        assert_eq!(path.get_var("x"), Some(Value::Int(1)));
        assert_eq!(left.get_var("x"), Some(Value::Int(2)));
        assert_eq!(right.get_var("x"), Some(Value::Int(1)));
        assert!(!left.has_var("y"));
        assert!(!path.has_var("y"));
        assert_eq!(left.get_meta("edges"), None);
        assert_eq!(left.nodes().len(), 2);
        assert_eq!(left.node().map(|n| n.valu().clone()), Some(Value::str("b")));
    }

    #[test]
    fn test_clone_shares_branch() {
        let path = Path::new(&node("a"));
        let other = path.clone();
        other.set_var("x", Value::Int(5));
        assert_eq!(path.get_var("x"), Some(Value::Int(5)));
        assert!(path.same_branch(&other));
        assert!(!path.same_branch(&path.fork(&node("b"))));
        assert_eq!(Path::empty().node(), None);
    }
}
