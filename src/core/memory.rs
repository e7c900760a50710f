// SPDX-License-Identifier: MIT

//! In-memory snapshot
//!
//! Insertion-ordered node store implementing [`Snapshot`]. Lookups scan and
//! collect eagerly, then hand back a stream over the result so no lock is
//! held across an await point.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use super::error::{Result, StormError};
use super::model::{DataModel, Prop};
use super::node::{norm_tag, tag_prefixes, Buid, Ival, Ndef, Node, NodeStream};
use super::snapshot::{EdgeRef, Snapshot};
use super::types::{norm_ival, Cmpr, NormInfo};
use super::value::Value;

#[derive(Default)]
struct Store {
    order: Vec<Buid>,
    nodes: HashMap<Buid, Node>,
    edges: Vec<(Buid, String, Buid)>,
}

pub struct MemorySnapshot {
    model: Arc<DataModel>,
    store: RwLock<Store>,
}

fn node_stream(nodes: Vec<Node>) -> NodeStream {
    stream::iter(nodes.into_iter().map(Ok)).boxed()
}

impl MemorySnapshot {
    pub fn new(model: Arc<DataModel>) -> Self {
        Self {
            model,
            store: RwLock::new(Store::default()),
        }
    }

    /// All nodes, in insertion order
    pub fn nodes(&self) -> Vec<Node> {
        let store = self.store.read();
        store
            .order
            .iter()
            .filter_map(|buid| store.nodes.get(buid).cloned())
            .collect()
    }

    fn scan(&self, filter: impl Fn(&Node) -> bool) -> Vec<Node> {
        let store = self.store.read();
        store
            .order
            .iter()
            .filter_map(|buid| store.nodes.get(buid))
            .filter(|node| filter(node))
            .cloned()
            .collect()
    }

    fn req_prop(&self, full: &str) -> Result<&Arc<Prop>> {
        self.model.prop(full).ok_or_else(|| StormError::no_such_prop(full, None))
    }

    fn req_cmpr(&self, prop: &Prop, cmpr: &str, valu: &Value) -> Result<Cmpr> {
        let styp = &prop.styp;
        let ctor = styp.get_cmpr_ctor(cmpr).ok_or_else(|| StormError::NoSuchCmpr {
            cmpr: cmpr.to_string(),
            name: styp.name().to_string(),
        })?;
        ctor(valu)
    }

    fn tag_cmpr(&self, cmpr: &str, valu: &Value) -> Result<Cmpr> {
        let ival = self
            .model
            .univ(".seen")
            .map(|prop| Arc::clone(&prop.styp))
            .ok_or_else(|| StormError::runtime("model has no interval type"))?;
        let ctor = ival.get_cmpr_ctor(cmpr).ok_or_else(|| StormError::NoSuchCmpr {
            cmpr: cmpr.to_string(),
            name: ival.name().to_string(),
        })?;
        ctor(valu)
    }

    /// Load nodes and edges from a fixture document
    pub async fn load_fixture(&self, fixture: &GraphFixture) -> Result<()> {
        for nfix in &fixture.nodes {
            let node = self.add_node(&nfix.form, &nfix.valu).await?;
            for (prop, valu) in &nfix.props {
                self.set_prop_deep(&node, prop, valu).await?;
            }
            for (tag, valu) in &nfix.tags {
                let tag = norm_tag(tag)?;
                let ival = match valu {
                    Some(valu) => Some(norm_ival(valu).map_err(|mesg| StormError::bad_valu("ival", mesg))?),
                    None => None,
                };
                self.add_tag(&node, &tag, ival).await?;
            }
            for (tag, props) in &nfix.tagprops {
                let tag = norm_tag(tag)?;
                for (prop, valu) in props {
                    self.set_tag_prop(&node, &tag, prop, valu).await?;
                }
            }
        }
        for efix in &fixture.edges {
            let n1 = self.fixture_node(&efix.n1).await?;
            let n2 = self.fixture_node(&efix.n2).await?;
            self.add_edge(&n1, &efix.verb, &n2.buid()).await?;
        }
        log::debug!(
            "Loaded fixture with {} nodes and {} edges",
            fixture.nodes.len(),
            fixture.edges.len()
        );
        Ok(())
    }

    async fn fixture_node(&self, ndef: &Value) -> Result<Node> {
        let ndef = Ndef::from_value(ndef).ok_or_else(|| StormError::bad_valu("ndef", format!("invalid ndef {}", ndef)))?;
        self.add_node(&ndef.form, &ndef.valu).await
    }
}

#[async_trait]
impl Snapshot for MemorySnapshot {
    fn model(&self) -> &Arc<DataModel> {
        &self.model
    }

    async fn get_node_by_ndef(&self, form: &str, valu: &Value) -> Result<Option<Node>> {
        let form = self.model.req_form(form)?;
        let (norm, _) = form.styp.norm(valu)?;
        let buid = Buid::from_ndef(&form.name, &norm);
        Ok(self.store.read().nodes.get(&buid).cloned())
    }

    async fn get_node_by_buid(&self, buid: &Buid) -> Result<Option<Node>> {
        Ok(self.store.read().nodes.get(buid).cloned())
    }

    async fn nodes_by_prop(&self, full: &str) -> Result<NodeStream> {
        if let Some(form) = self.model.form(full) {
            let name = form.name.clone();
            return Ok(node_stream(self.scan(|node| node.form() == name)));
        }
        let prop = self.req_prop(full)?;
        let name = prop.name.clone();
        let form = prop.form.clone();
        Ok(node_stream(self.scan(|node| {
            form.as_deref().map_or(true, |form| node.form() == form) && node.has(&name)
        })))
    }

    async fn nodes_by_prop_valu(&self, full: &str, cmpr: &str, valu: &Value) -> Result<NodeStream> {
        if let Some(form) = self.model.form(full) {
            let ctor = form.styp.get_cmpr_ctor(cmpr).ok_or_else(|| StormError::NoSuchCmpr {
                cmpr: cmpr.to_string(),
                name: form.name.clone(),
            })?;
            let test = ctor(valu)?;
            let name = form.name.clone();
            return Ok(node_stream(self.scan(|node| node.form() == name && test(node.valu()))));
        }
        let prop = Arc::clone(self.req_prop(full)?);
        let ctor = prop.styp.get_cmpr_ctor(cmpr).ok_or_else(|| StormError::NoSuchCmpr {
            cmpr: cmpr.to_string(),
            name: prop.styp.name().to_string(),
        })?;
        let test = ctor(valu)?;
        Ok(node_stream(self.scan(|node| {
            prop.form.as_deref().map_or(true, |form| node.form() == form)
                && node.get(&prop.name).is_some_and(|pval| test(&pval))
        })))
    }

    async fn nodes_by_prop_array(&self, full: &str, cmpr: &str, valu: &Value) -> Result<NodeStream> {
        let prop = Arc::clone(self.req_prop(full)?);
        let elem = prop.styp.elem().cloned().ok_or_else(|| StormError::BadCmprType {
            cmpr: cmpr.to_string(),
            mesg: format!("{} is not an array property", full),
        })?;
        let ctor = elem.get_cmpr_ctor(cmpr).ok_or_else(|| StormError::NoSuchCmpr {
            cmpr: cmpr.to_string(),
            name: elem.name().to_string(),
        })?;
        let test = ctor(valu)?;
        Ok(node_stream(self.scan(|node| {
            prop.form.as_deref().map_or(true, |form| node.form() == form)
                && node
                    .get(&prop.name)
                    .is_some_and(|pval| pval.as_list().is_some_and(|items| items.iter().any(|item| test(item))))
        })))
    }

    async fn nodes_by_tag(&self, tag: &str, form: Option<&str>) -> Result<NodeStream> {
        if let Some(form) = form {
            self.model.req_form(form)?;
        }
        Ok(node_stream(self.scan(|node| {
            form.map_or(true, |form| node.form() == form) && node.has_tag(tag)
        })))
    }

    async fn nodes_by_tag_valu(
        &self,
        tag: &str,
        cmpr: &str,
        valu: &Value,
        form: Option<&str>,
    ) -> Result<NodeStream> {
        let test = self.tag_cmpr(cmpr, valu)?;
        Ok(node_stream(self.scan(|node| {
            form.map_or(true, |form| node.form() == form)
                && matches!(node.tag(tag), Some(Some((min, max))) if test(&Value::List(vec![Value::Int(min), Value::Int(max)])))
        })))
    }

    async fn nodes_by_tag_prop(
        &self,
        form: Option<&str>,
        tag: &str,
        prop: &str,
        cmpr: Option<(&str, &Value)>,
    ) -> Result<NodeStream> {
        let tprop = self.model.tagprop(prop).ok_or_else(|| StormError::NoSuchTagProp {
            name: prop.to_string(),
        })?;
        let test = match cmpr {
            Some((cmpr, valu)) => Some(self.req_cmpr(tprop, cmpr, valu)?),
            None => None,
        };
        Ok(node_stream(self.scan(|node| {
            if !form.map_or(true, |form| node.form() == form) {
                return false;
            }
            match (node.tagprop(tag, prop), &test) {
                (Some(valu), Some(test)) => test(&valu),
                (Some(_), None) => true,
                (None, _) => false,
            }
        })))
    }

    async fn add_node(&self, form: &str, valu: &Value) -> Result<Node> {
        let fobj = Arc::clone(self.model.req_form(form)?);
        let (norm, mut info) = fobj.styp.norm(valu)?;
        let buid = Buid::from_ndef(&fobj.name, &norm);
        if let Some(node) = self.store.read().nodes.get(&buid) {
            return Ok(node.clone());
        }

        if fobj.name == "syn:tag" {
            let tag = norm.tostr()?;
            let parts: Vec<&str> = tag.split('.').collect();
            info.subs.insert("base".to_string(), Value::str(parts[parts.len() - 1]));
            info.subs.insert("depth".to_string(), Value::Int(parts.len() as i64 - 1));
            if parts.len() > 1 {
                let up = parts[..parts.len() - 1].join(".");
                info.subs.insert("up".to_string(), Value::Str(up.clone()));
                info.adds.push(Ndef::new("syn:tag", Value::Str(up)));
            }
        }

        let node = Node::new(Ndef::new(fobj.name.clone(), norm));
        node.with_state(|state| {
            state
                .props
                .insert(".created".to_string(), Value::Int(chrono::Utc::now().timestamp_millis()));
            for (sub, subv) in &info.subs {
                if fobj.prop(sub).is_some() {
                    state.props.insert(sub.clone(), subv.clone());
                }
            }
        });

        {
            let mut store = self.store.write();
            if let Some(node) = store.nodes.get(&buid) {
                return Ok(node.clone());
            }
            store.order.push(buid);
            store.nodes.insert(buid, node.clone());
        }
        log::debug!("Added node {}={}", fobj.name, node.valu());

        for ndef in &info.adds {
            if self.model.form(&ndef.form).is_some() {
                self.add_node(&ndef.form, &ndef.valu).await?;
            }
        }
        Ok(node)
    }

    async fn set_prop(&self, node: &Node, prop: &str, valu: &Value) -> Result<(bool, NormInfo)> {
        let form = self.model.req_form(node.form())?;
        let pobj = form
            .prop(prop)
            .ok_or_else(|| StormError::no_such_prop(prop, Some(node.form())))?;
        let (norm, info) = pobj.styp.norm(valu)?;
        let curv = node.get(prop);
        if curv.as_ref() == Some(&norm) {
            return Ok((false, info));
        }
        if pobj.ro && curv.is_some() {
            return Err(StormError::ReadOnlyProp {
                name: pobj.full.clone(),
            });
        }
        node.with_state(|state| state.props.insert(prop.to_string(), norm));
        Ok((true, info))
    }

    async fn pop_prop(&self, node: &Node, prop: &str) -> Result<Option<Value>> {
        let form = self.model.req_form(node.form())?;
        let pobj = form
            .prop(prop)
            .ok_or_else(|| StormError::no_such_prop(prop, Some(node.form())))?;
        if pobj.ro {
            return Err(StormError::ReadOnlyProp {
                name: pobj.full.clone(),
            });
        }
        Ok(node.with_state(|state| state.props.remove(prop)))
    }

    async fn add_tag(&self, node: &Node, tag: &str, ival: Option<Ival>) -> Result<()> {
        self.add_node("syn:tag", &Value::str(tag)).await?;
        node.with_state(|state| {
            for prefix in tag_prefixes(tag) {
                if prefix == tag {
                    state.tags.insert(prefix, ival);
                } else {
                    state.tags.entry(prefix).or_insert(None);
                }
            }
        });
        Ok(())
    }

    async fn del_tag(&self, node: &Node, tag: &str) -> Result<()> {
        let below = format!("{}.", tag);
        node.with_state(|state| {
            state.tags.retain(|name, _| name != tag && !name.starts_with(&below));
            state.tagprops.retain(|name, _| name != tag && !name.starts_with(&below));
        });
        Ok(())
    }

    async fn set_tag_prop(&self, node: &Node, tag: &str, prop: &str, valu: &Value) -> Result<()> {
        let tprop = self.model.tagprop(prop).ok_or_else(|| StormError::NoSuchTagProp {
            name: prop.to_string(),
        })?;
        let (norm, _) = tprop.styp.norm(valu)?;
        if !node.has_tag(tag) {
            self.add_tag(node, tag, None).await?;
        }
        node.with_state(|state| {
            state
                .tagprops
                .entry(tag.to_string())
                .or_default()
                .insert(prop.to_string(), norm)
        });
        Ok(())
    }

    async fn del_tag_prop(&self, node: &Node, tag: &str, prop: &str) -> Result<()> {
        if self.model.tagprop(prop).is_none() {
            return Err(StormError::NoSuchTagProp {
                name: prop.to_string(),
            });
        }
        node.with_state(|state| {
            if let Some(props) = state.tagprops.get_mut(tag) {
                props.remove(prop);
                if props.is_empty() {
                    state.tagprops.remove(tag);
                }
            }
        });
        Ok(())
    }

    async fn add_edge(&self, n1: &Node, verb: &str, n2: &Buid) -> Result<()> {
        let mut store = self.store.write();
        if !store.nodes.contains_key(n2) {
            return Err(StormError::runtime(format!("edge destination {} does not exist", n2)));
        }
        let edge = (n1.buid(), verb.to_string(), *n2);
        if !store.edges.contains(&edge) {
            store.edges.push(edge);
        }
        Ok(())
    }

    async fn del_edge(&self, n1: &Node, verb: &str, n2: &Buid) -> Result<()> {
        let n1 = n1.buid();
        self.store
            .write()
            .edges
            .retain(|(src, everb, dst)| !(*src == n1 && everb == verb && dst == n2));
        Ok(())
    }

    async fn iter_edges_n1(&self, node: &Node, verb: Option<&str>) -> Result<Vec<EdgeRef>> {
        let buid = node.buid();
        Ok(self
            .store
            .read()
            .edges
            .iter()
            .filter(|(src, everb, _)| *src == buid && verb.map_or(true, |verb| verb == everb))
            .map(|(_, everb, dst)| (everb.clone(), *dst))
            .collect())
    }

    async fn iter_edges_n2(&self, node: &Node, verb: Option<&str>) -> Result<Vec<EdgeRef>> {
        let buid = node.buid();
        Ok(self
            .store
            .read()
            .edges
            .iter()
            .filter(|(_, everb, dst)| *dst == buid && verb.map_or(true, |verb| verb == everb))
            .map(|(src, everb, _)| (everb.clone(), *src))
            .collect())
    }
}

/// Nodes and edges to preload into a [`MemorySnapshot`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphFixture {
    #[serde(default)]
    pub nodes: Vec<NodeFixture>,
    #[serde(default)]
    pub edges: Vec<EdgeFixture>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeFixture {
    pub form: String,
    pub valu: Value,
    #[serde(default)]
    pub props: BTreeMap<String, Value>,
    /// Tag name to an optional interval
    #[serde(default)]
    pub tags: BTreeMap<String, Option<Value>>,
    #[serde(default)]
    pub tagprops: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EdgeFixture {
    /// `[form, valu]`
    pub n1: Value,
    pub verb: String,
    pub n2: Value,
}

impl GraphFixture {
    pub fn parse_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse_yaml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    const MODEL: &str = r#"
types:
  - name: inet:fqdn
    kind: str
    lower: true
  - name: inet:ipv4
    kind: int
  - name: fqdns
    kind: array
    elem: inet:fqdn
forms:
  - name: inet:fqdn
  - name: inet:ipv4
    props:
      - name: asn
        type: int
  - name: inet:dns:a
    type: str
    props:
      - name: fqdn
        type: inet:fqdn
  - name: test:arry
    type: str
    props:
      - name: names
        type: fqdns
tagprops:
  - name: score
    type: int
"#;

    fn snapshot() -> MemorySnapshot {
        MemorySnapshot::new(Arc::new(DataModel::from_yaml(MODEL).unwrap()))
    }

    #[tokio::test]
    async fn test_add_node_is_idempotent() {
        let snap = snapshot();
        let a = snap.add_node("inet:fqdn", &Value::str("VERTEX.link")).await.unwrap();
        let b = snap.add_node("inet:fqdn", &Value::str("vertex.link")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(snap.nodes().len(), 1);
        assert!(snap.add_node("nope:form", &Value::Int(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_set_prop_deep_adds_nodes() {
        let snap = snapshot();
        let node = snap.add_node("inet:dns:a", &Value::str("x")).await.unwrap();
        snap.set_prop_deep(&node, "fqdn", &Value::str("woot.com")).await.unwrap();
        assert!(snap
            .get_node_by_ndef("inet:fqdn", &Value::str("woot.com"))
            .await
            .unwrap()
            .is_some());

        let arry = snap.add_node("test:arry", &Value::str("y")).await.unwrap();
        let names = Value::List(vec![Value::str("a.com"), Value::str("b.com")]);
        snap.set_prop_deep(&arry, "names", &names).await.unwrap();
        let found: Vec<Node> = snap
            .nodes_by_prop_array("test:arry:names", "=", &Value::str("B.com"))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(found, vec![arry]);
    }

    #[tokio::test]
    async fn test_read_only_prop() {
        let snap = snapshot();
        let node = snap.add_node("inet:ipv4", &Value::Int(1)).await.unwrap();
        let err = snap.set_prop(&node, ".created", &Value::Int(10)).await.unwrap_err();
        assert!(matches!(err, StormError::ReadOnlyProp { .. }));
        let err = snap.set_prop(&node, "newp", &Value::Int(10)).await.unwrap_err();
        assert!(matches!(err, StormError::NoSuchProp { .. }));
    }

    #[tokio::test]
    async fn test_tags() {
        let snap = snapshot();
        let node = snap.add_node("inet:ipv4", &Value::Int(1)).await.unwrap();
        snap.add_tag(&node, "foo.bar.baz", Some((1, 2))).await.unwrap();
        assert_eq!(node.tag("foo"), Some(None));
        assert_eq!(node.tag("foo.bar.baz"), Some(Some((1, 2))));
        let tagnode = snap
            .get_node_by_ndef("syn:tag", &Value::str("foo.bar"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tagnode.get("up"), Some(Value::str("foo")));
        assert_eq!(tagnode.get("depth"), Some(Value::Int(1)));

        snap.set_tag_prop(&node, "foo.bar", "score", &Value::str("10")).await.unwrap();
        assert_eq!(node.tagprop("foo.bar", "score"), Some(Value::Int(10)));

        snap.del_tag(&node, "foo.bar").await.unwrap();
        assert!(node.has_tag("foo"));
        assert!(!node.has_tag("foo.bar.baz"));
        assert_eq!(node.tagprop("foo.bar", "score"), None);
    }

    #[tokio::test]
    async fn test_load_fixture_edges() {
        let snap = snapshot();
        let fixture = GraphFixture::parse_yaml(
            r#"
nodes:
  - form: inet:ipv4
    valu: 1
    props:
      asn: 10
    tags:
      hehe: null
      haha: [2020, 2021]
edges:
  - n1: ["inet:ipv4", 1]
    verb: refs
    n2: ["inet:fqdn", "woot.com"]
"#,
        )
        .unwrap();
        snap.load_fixture(&fixture).await.unwrap();
        let node = snap.get_node_by_ndef("inet:ipv4", &Value::Int(1)).await.unwrap().unwrap();
        assert_eq!(node.get("asn"), Some(Value::Int(10)));
        assert!(node.tag("haha").unwrap().is_some());
        let edges = snap.iter_edges_n1(&node, Some("refs")).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert!(snap.iter_edges_n1(&node, Some("seen")).await.unwrap().is_empty());
    }
}
