// SPDX-License-Identifier: MIT

//! Pivot and walk operators
//!
//! Every pivot maps one inbound node to a stream of related nodes, each on
//! a fork of the inbound path. Join variants re-emit the inbound item
//! before its destinations.

use async_stream::try_stream;
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::ast::{AstId, AstKind};
use super::expr::compute;
use super::path::Path;
use super::runtime::Runtime;
use super::signal::{genr, node_genr, Genr, Signal};
use crate::core::error::{Result, StormError};
use crate::core::model::{Form, PropRef};
use crate::core::node::{Ndef, Node, NodeStream};
use crate::core::snapshot::Snapshot;
use crate::core::value::Value;

fn node_list(nodes: Vec<Node>) -> NodeStream {
    stream::iter(nodes.into_iter().map(Ok)).boxed()
}

fn isjoin(kind: &AstKind) -> bool {
    match kind {
        AstKind::FormPivot { isjoin, .. }
        | AstKind::PivotOut { isjoin }
        | AstKind::PivotIn { isjoin }
        | AstKind::PivotInFrom { isjoin, .. }
        | AstKind::PropPivotOut { isjoin, .. }
        | AstKind::PropPivot { isjoin, .. }
        | AstKind::PivotToTags { isjoin, .. }
        | AstKind::N1Walk { isjoin }
        | AstKind::N2Walk { isjoin }
        | AstKind::N1WalkNPivo { isjoin }
        | AstKind::N2WalkNPivo { isjoin } => *isjoin,
        _ => false,
    }
}

/// A value naming one or more things, with `*` meaning all of them
fn names_of(valu: Value) -> Result<Option<Vec<String>>> {
    let names = match valu.toprim() {
        Value::List(items) => items.iter().map(Value::tostr).collect::<Result<Vec<_>>>()?,
        other => vec![other.tostr()?],
    };
    if names.iter().any(|name| name == "*") {
        return Ok(None);
    }
    Ok(Some(names))
}

pub fn pivot(runt: Arc<Runtime>, id: AstId, upstream: Genr) -> Genr {
    genr(try_stream! {
        let pivoter = Pivoter::new(Arc::clone(&runt), id);
        let isjoin = isjoin(runt.ast().kind(id));
        for await item in upstream {
            match item? {
                Signal::Item((node, path)) => {
                    if isjoin {
                        yield Signal::Item((node.clone(), path.clone()));
                    }
                    let mut pivos = pivoter.pivot(&node, &path).await?;
                    while let Some(pivo) = pivos.next().await {
                        let pivo = pivo?;
                        let fork = path.fork(&pivo);
                        yield Signal::Item((pivo, fork));
                    }
                }
                other => {
                    yield other;
                    return;
                }
            }
        }
    })
}

/// Per operator state: warnings already raised and destination form checks
struct Pivoter {
    runt: Arc<Runtime>,
    id: AstId,
    warned: Mutex<HashSet<String>>,
    destmemo: Mutex<HashMap<(String, Vec<String>), bool>>,
}

impl Pivoter {
    fn new(runt: Arc<Runtime>, id: AstId) -> Self {
        Self {
            runt,
            id,
            warned: Mutex::new(HashSet::new()),
            destmemo: Mutex::new(HashMap::new()),
        }
    }

    fn snap(&self) -> Arc<dyn Snapshot> {
        Arc::clone(self.runt.snap())
    }

    fn warn_once(&self, mesg: String) {
        if self.warned.lock().insert(mesg.clone()) {
            self.runt.warn(mesg);
        }
    }

    async fn pivot(&self, node: &Node, path: &Path) -> Result<NodeStream> {
        let ast = Arc::clone(self.runt.ast());
        match ast.kind(self.id) {
            AstKind::FormPivot { form, .. } => self.form_pivot(node, form).await,
            AstKind::PivotOut { .. } => Ok(self.pivot_out(node)),
            AstKind::PivotIn { .. } => Ok(self.pivot_in(node)),
            AstKind::PivotInFrom { form, .. } => self.pivot_in_from(node, form).await,
            AstKind::PropPivotOut { prop, .. } => self.prop_pivot_out(node, prop).await,
            AstKind::PropPivot { prop, dest, .. } => self.prop_pivot(node, prop, dest).await,
            AstKind::PivotToTags { pattern, .. } => Ok(self.pivot_to_tags(node, pattern)),
            AstKind::N1Walk { .. } => self.walk(node, path, true).await,
            AstKind::N2Walk { .. } => self.walk(node, path, false).await,
            AstKind::N1WalkNPivo { .. } => Ok(self.pivot_out(node).chain(self.edges(node, true)).boxed()),
            AstKind::N2WalkNPivo { .. } => Ok(self.pivot_in(node).chain(self.edges(node, false)).boxed()),
            other => Err(StormError::runtime(format!("{} is not a pivot", other.name()))),
        }
    }

    /// `-> form`
    async fn form_pivot(&self, node: &Node, dest: &str) -> Result<NodeStream> {
        let snap = self.snap();
        let model = Arc::clone(snap.model());
        let dform = Arc::clone(model.req_form(dest)?);
        let sform = Arc::clone(model.req_form(node.form())?);

        if sform.name == "syn:tag" {
            let tag = node.valu().tostr()?;
            return snap.nodes_by_tag(&tag, Some(&dform.name)).await;
        }

        if sform.is_edge() {
            let n2 = node.get("n2").as_ref().and_then(Ndef::from_value);
            let Some(n2) = n2.filter(|n2| n2.form == dform.name) else {
                return Ok(node_list(Vec::new()));
            };
            let pivo = snap.get_node_by_ndef(&n2.form, &n2.valu).await?;
            return Ok(node_list(pivo.into_iter().collect()));
        }

        if dform.is_edge() {
            let full = format!("{}:n1", dform.name);
            return snap.nodes_by_prop_valu(&full, "=", &node.ndef().to_value()).await;
        }

        let forward = sform.refs().iter().any(|pref| match pref {
            PropRef::Form { form, .. } | PropRef::Array { form, .. } => *form == dform.name,
            PropRef::Ndef { .. } => true,
        });
        let reverse = dform.refs().iter().any(|pref| match pref {
            PropRef::Form { form, .. } | PropRef::Array { form, .. } => form == node.form(),
            PropRef::Ndef { .. } => true,
        });
        if !forward && !reverse {
            return Err(StormError::NoSuchPivot {
                n1: sform.name.clone(),
                n2: dform.name.clone(),
            });
        }
        Ok(form_refs(snap, node.clone(), sform, dform))
    }

    /// `-> *`
    fn pivot_out(&self, node: &Node) -> NodeStream {
        refs_out(self.snap(), node.clone())
    }

    /// `<- *`
    fn pivot_in(&self, node: &Node) -> NodeStream {
        refs_in(self.snap(), node.clone())
    }

    /// `<- form`
    async fn pivot_in_from(&self, node: &Node, form: &str) -> Result<NodeStream> {
        let snap = self.snap();
        let model = Arc::clone(snap.model());
        let dform = model.req_form(form)?;
        if dform.is_edge() {
            let full = format!("{}:n2", dform.name);
            return snap.nodes_by_prop_valu(&full, "=", &node.ndef().to_value()).await;
        }
        if !model.req_form(node.form())?.is_edge() {
            return Err(StormError::runtime(format!(
                "Pivot in from a specific form cannot be used with nodes of type {}",
                node.form()
            )));
        }
        if node.get("n1:form").as_ref().and_then(Value::as_str) != Some(form) {
            return Ok(node_list(Vec::new()));
        }
        let Some(n1) = node.get("n1").as_ref().and_then(Ndef::from_value) else {
            return Ok(node_list(Vec::new()));
        };
        let pivo = snap.get_node_by_ndef(&n1.form, &n1.valu).await?;
        Ok(node_list(pivo.into_iter().collect()))
    }

    /// `:prop -> *`
    async fn prop_pivot_out(&self, node: &Node, name: &str) -> Result<NodeStream> {
        let snap = self.snap();
        let model = Arc::clone(snap.model());
        let Some(prop) = model.req_form(node.form())?.prop(name).cloned() else {
            tokio::task::yield_now().await;
            return Ok(node_list(Vec::new()));
        };
        let Some(valu) = node.get(name) else {
            return Ok(node_list(Vec::new()));
        };

        if prop.styp.is_array() {
            let Some(elem) = prop.styp.elem().filter(|elem| elem.is_form()).cloned() else {
                let elem = prop.styp.elem().map(|elem| elem.name().to_string()).unwrap_or_default();
                self.warn_once(format!(
                    "The source property \"{}\" array type \"{}\" is not a form. Cannot pivot.",
                    name, elem
                ));
                return Ok(node_list(Vec::new()));
            };
            let mut pivos = Vec::new();
            for item in valu.as_list().unwrap_or_default() {
                if let Some(pivo) = snap.get_node_by_ndef(elem.name(), item).await? {
                    pivos.push(pivo);
                }
            }
            return Ok(node_list(pivos));
        }

        if prop.styp.is_ndef() {
            let ndef = Ndef::from_value(&valu);
            let pivo = match ndef {
                Some(ndef) => snap.get_node_by_ndef(&ndef.form, &ndef.valu).await?,
                None => None,
            };
            if pivo.is_none() {
                log::warn!("Missing node corresponding to ndef {} on node {}", valu, node.iden());
            }
            return Ok(node_list(pivo.into_iter().collect()));
        }

        if !prop.styp.is_form() {
            self.warn_once(format!(
                "The source property \"{}\" type \"{}\" is not a form. Cannot pivot.",
                name,
                prop.styp.name()
            ));
            return Ok(node_list(Vec::new()));
        }
        let pivo = snap.get_node_by_ndef(prop.styp.name(), &valu).await?;
        Ok(node_list(pivo.into_iter().collect()))
    }

    /// `:prop -> form` or `:prop -> form:prop`
    async fn prop_pivot(&self, node: &Node, name: &str, dest: &str) -> Result<NodeStream> {
        let snap = self.snap();
        let model = Arc::clone(snap.model());
        let Some(srcprop) = model.req_form(node.form())?.prop(name).cloned() else {
            return Ok(node_list(Vec::new()));
        };
        let Some(valu) = node.get(name) else {
            return Ok(node_list(Vec::new()));
        };
        let dform = model.form(dest).cloned();
        let dprop = match &dform {
            Some(_) => None,
            None => Some(
                model
                    .prop(dest)
                    .cloned()
                    .ok_or_else(|| StormError::no_such_prop(dest, None))?,
            ),
        };
        let dest_array = dprop.as_ref().is_some_and(|dprop| dprop.styp.is_array());

        let valus = match (srcprop.styp.is_array() && !dest_array, valu) {
            (true, Value::List(items)) => items,
            (_, valu) => vec![valu],
        };

        let mut pivos = Vec::new();
        for valu in valus {
            let found = match (&dform, &dprop) {
                (Some(dform), _) => to_form(&snap, dform, srcprop.styp.is_ndef(), &valu).await,
                (None, Some(dprop)) => {
                    let full = dprop.full.clone();
                    let lookup = if dprop.styp.is_array() && !srcprop.styp.is_array() {
                        snap.nodes_by_prop_array(&full, "=", &valu).await
                    } else {
                        snap.nodes_by_prop_valu(&full, "=", &valu).await
                    };
                    match lookup {
                        Ok(nodes) => nodes.try_collect::<Vec<_>>().await,
                        Err(err) => Err(err),
                    }
                }
                (None, None) => Ok(Vec::new()),
            };
            match found {
                Ok(found) => pivos.extend(found),
                Err(err @ (StormError::BadTypeValu { .. } | StormError::BadCast { .. })) => {
                    self.warn_once(format!("Caught error during pivot: {}", err));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(node_list(pivos))
    }

    /// `-> #`, `-> #*`, `-> #glob`, `-> #name`
    fn pivot_to_tags(&self, node: &Node, pattern: &str) -> NodeStream {
        let snap = self.snap();
        let names: Vec<String> = match pattern {
            "" => node.tag_names(),
            "*" => node.leaf_tags(),
            glob if glob.contains('*') => node
                .tag_names()
                .into_iter()
                .filter(|name| self.runt.glob_match(glob, name))
                .collect(),
            exact => node.tag_names().into_iter().filter(|name| name == exact).collect(),
        };
        node_genr(try_stream! {
            for name in names {
                if let Some(pivo) = snap.get_node_by_ndef("syn:tag", &Value::Str(name)).await? {
                    yield pivo;
                }
            }
        })
    }

    /// `-(verb)> forms` and `<(verb)- forms`
    async fn walk(&self, node: &Node, path: &Path, n1: bool) -> Result<NodeStream> {
        let ast = Arc::clone(self.runt.ast());
        let verbs = names_of(compute(&self.runt, ast.kid(self.id, 0)?, path).await?)?;
        let dests = match ast.opt_kid(self.id, 1) {
            Some(kid) => names_of(compute(&self.runt, kid, path).await?)?,
            None => None,
        };
        if let Some(dests) = &dests {
            let model = Arc::clone(self.runt.snap().model());
            for dest in dests {
                model.req_form(dest)?;
            }
        }

        let snap = self.snap();
        let mut edges = Vec::new();
        match &verbs {
            Some(verbs) => {
                for verb in verbs {
                    edges.extend(iter_edges(&snap, node, Some(verb), n1).await?);
                }
            }
            None => edges.extend(iter_edges(&snap, node, None, n1).await?),
        }

        let mut pivos = Vec::new();
        for (_, buid) in edges {
            let Some(pivo) = snap.get_node_by_buid(&buid).await? else {
                continue;
            };
            if let Some(dests) = &dests {
                if !self.dest_ok(pivo.form(), dests) {
                    continue;
                }
            }
            pivos.push(pivo);
        }
        Ok(node_list(pivos))
    }

    fn dest_ok(&self, form: &str, dests: &[String]) -> bool {
        let key = (form.to_string(), dests.to_vec());
        *self
            .destmemo
            .lock()
            .entry(key)
            .or_insert_with(|| dests.iter().any(|dest| dest == form))
    }

    /// Every stored verb edge in one direction
    fn edges(&self, node: &Node, n1: bool) -> NodeStream {
        let snap = self.snap();
        let node = node.clone();
        node_genr(try_stream! {
            for (_, buid) in iter_edges(&snap, &node, None, n1).await? {
                if let Some(pivo) = snap.get_node_by_buid(&buid).await? {
                    yield pivo;
                }
            }
        })
    }
}

/// Nodes referenced by `node`: its property targets, a tag's tagged nodes or an edge's `n2`
pub(super) fn refs_out(snap: Arc<dyn Snapshot>, node: Node) -> NodeStream {
    node_genr(try_stream! {
        if node.form() == "syn:tag" {
            let tag = node.valu().tostr()?;
            let mut pivos = snap.nodes_by_tag(&tag, None).await?;
            while let Some(pivo) = pivos.next().await {
                yield pivo?;
            }
            return;
        }
        let form = Arc::clone(snap.model().req_form(node.form())?);
        if form.is_edge() {
            if let Some(n2) = node.get("n2").as_ref().and_then(Ndef::from_value) {
                if let Some(pivo) = snap.get_node_by_ndef(&n2.form, &n2.valu).await? {
                    yield pivo;
                }
            }
            return;
        }
        for prop in form.props() {
            let Some(valu) = node.get(&prop.name) else {
                continue;
            };
            if prop.styp.is_ndef() {
                if let Some(ndef) = Ndef::from_value(&valu) {
                    if let Some(pivo) = snap.get_node_by_ndef(&ndef.form, &ndef.valu).await? {
                        yield pivo;
                    }
                }
                continue;
            }
            if let Some(elem) = prop.styp.elem().filter(|elem| elem.is_form()) {
                for item in valu.as_list().unwrap_or_default() {
                    if let Some(pivo) = snap.get_node_by_ndef(elem.name(), item).await? {
                        yield pivo;
                    }
                }
                continue;
            }
            if !prop.styp.is_form() {
                continue;
            }
            if let Some(pivo) = snap.get_node_by_ndef(prop.styp.name(), &valu).await? {
                if pivo.buid() != node.buid() {
                    yield pivo;
                }
            }
        }
    })
}

/// Nodes referencing `node` through a property, or an edge's `n1`
pub(super) fn refs_in(snap: Arc<dyn Snapshot>, node: Node) -> NodeStream {
    node_genr(try_stream! {
        let model = Arc::clone(snap.model());
        if model.req_form(node.form())?.is_edge() {
            if let Some(n1) = node.get("n1").as_ref().and_then(Ndef::from_value) {
                if let Some(pivo) = snap.get_node_by_ndef(&n1.form, &n1.valu).await? {
                    yield pivo;
                }
            }
            return;
        }
        for (form, pref) in model.forms_referencing(node.form()) {
            let full = format!("{}:{}", form.name, pref.prop());
            let mut pivos = match pref {
                PropRef::Array { .. } => snap.nodes_by_prop_array(&full, "=", node.valu()).await?,
                _ => snap.nodes_by_prop_valu(&full, "=", node.valu()).await?,
            };
            while let Some(pivo) = pivos.next().await {
                yield pivo?;
            }
        }
        let ndef = node.ndef().to_value();
        for form in model.forms() {
            for pref in form.refs() {
                if let PropRef::Ndef { prop } = pref {
                    let full = format!("{}:{}", form.name, prop);
                    let mut pivos = snap.nodes_by_prop_valu(&full, "=", &ndef).await?;
                    while let Some(pivo) = pivos.next().await {
                        yield pivo?;
                    }
                }
            }
        }
    })
}

async fn iter_edges(
    snap: &Arc<dyn Snapshot>,
    node: &Node,
    verb: Option<&str>,
    n1: bool,
) -> Result<Vec<(String, crate::core::node::Buid)>> {
    if n1 {
        snap.iter_edges_n1(node, verb).await
    } else {
        snap.iter_edges_n2(node, verb).await
    }
}

/// Nodes of `dform` named by a property value
async fn to_form(snap: &Arc<dyn Snapshot>, dform: &Form, ndef: bool, valu: &Value) -> Result<Vec<Node>> {
    if ndef {
        let Some(ndef) = Ndef::from_value(valu).filter(|ndef| ndef.form == dform.name) else {
            return Ok(Vec::new());
        };
        return Ok(snap.get_node_by_ndef(&ndef.form, &ndef.valu).await?.into_iter().collect());
    }
    Ok(snap.get_node_by_ndef(&dform.name, valu).await?.into_iter().collect())
}

/// Forward then reverse declared references between two forms
fn form_refs(snap: Arc<dyn Snapshot>, node: Node, sform: Arc<Form>, dform: Arc<Form>) -> NodeStream {
    node_genr(try_stream! {
        for pref in sform.refs() {
            match pref {
                PropRef::Form { prop, form } if *form == dform.name => {
                    if let Some(valu) = node.get(prop) {
                        if let Some(pivo) = snap.get_node_by_ndef(form, &valu).await? {
                            yield pivo;
                        }
                    }
                }
                PropRef::Array { prop, form } if *form == dform.name => {
                    let items = node.get(prop).and_then(|valu| valu.as_list().map(<[Value]>::to_vec));
                    for item in items.unwrap_or_default() {
                        if let Some(pivo) = snap.get_node_by_ndef(form, &item).await? {
                            yield pivo;
                        }
                    }
                }
                PropRef::Ndef { prop } => {
                    let ndef = node.get(prop).as_ref().and_then(Ndef::from_value);
                    if let Some(ndef) = ndef.filter(|ndef| ndef.form == dform.name) {
                        if let Some(pivo) = snap.get_node_by_ndef(&ndef.form, &ndef.valu).await? {
                            yield pivo;
                        }
                    }
                }
                _ => {}
            }
        }

        for pref in dform.refs() {
            let full = format!("{}:{}", dform.name, pref.prop());
            let mut pivos = match pref {
                PropRef::Form { form, .. } if form == node.form() => {
                    snap.nodes_by_prop_valu(&full, "=", node.valu()).await?
                }
                PropRef::Array { form, .. } if form == node.form() => {
                    snap.nodes_by_prop_array(&full, "=", node.valu()).await?
                }
                PropRef::Ndef { .. } => {
                    snap.nodes_by_prop_valu(&full, "=", &node.ndef().to_value()).await?
                }
                _ => continue,
            };
            while let Some(pivo) = pivos.next().await {
                yield pivo?;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::perms::AllowAll;
    use crate::storm::opts::QueryOptions;
    use crate::storm::pipeline::execute;
    use crate::storm::runtime::Message;
    use crate::storm::testutil::{fixture_snapshot, names, runtime, storm};

    const GRAPH: &str = r#"
nodes:
  - form: inet:dns:a
    valu: a1
    props: {fqdn: vertex.link, ipv4: 16909060}
  - form: inet:dns:a
    valu: a2
    props: {fqdn: woot.com}
  - form: test:arry
    valu: x
    props: {names: [vertex.link, woot.com]}
  - form: test:str
    valu: s
    props: {hehe: haha, ref: [inet:fqdn, vertex.link]}
    tags: {foo.bar: null, foo.baz: null, qux: null}
  - form: test:edge
    valu: [[test:str, s], [inet:fqdn, woot.com]]
  - form: test:int
    valu: 1
edges:
  - {n1: [test:str, s], verb: refs, n2: [inet:fqdn, vertex.link]}
  - {n1: [test:str, s], verb: seen, n2: [test:int, 1]}
"#;

    fn lift(form: &str, valu: &str) -> String {
        format!("{{type: lift_prop_by, prop: \"{}\", cmpr: \"=\", kids: [{{type: const, valu: \"{}\"}}]}}", form, valu)
    }

    fn query(opers: &[String]) -> String {
        format!("{{type: query, kids: [{}]}}", opers.join(", "))
    }

    #[tokio::test]
    async fn test_form_pivot_forward_and_reverse() {
        let snap = fixture_snapshot(GRAPH).await;
        let q = query(&[lift("inet:dns:a", "a1"), "{type: form_pivot, form: 'inet:fqdn'}".to_string()]);
        let items = storm(&snap, &q).await.unwrap();
        assert_eq!(names(&items), vec!["inet:fqdn=vertex.link"]);
        assert_eq!(items[0].1.nodes().len(), 2);

        let q = query(&[lift("inet:fqdn", "vertex.link"), "{type: form_pivot, form: 'inet:dns:a'}".to_string()]);
        let items = storm(&snap, &q).await.unwrap();
        assert_eq!(names(&items), vec!["inet:dns:a=a1"]);

        let q = query(&[
            lift("inet:fqdn", "vertex.link"),
            "{type: form_pivot, form: 'inet:dns:a', isjoin: true}".to_string(),
        ]);
        let items = storm(&snap, &q).await.unwrap();
        assert_eq!(names(&items), vec!["inet:fqdn=vertex.link", "inet:dns:a=a1"]);
    }

    #[tokio::test]
    async fn test_form_pivot_without_refs() {
        let snap = fixture_snapshot(GRAPH).await;
        let q = query(&[lift("test:int", "1"), "{type: form_pivot, form: 'inet:ipv4'}".to_string()]);
        let err = storm(&snap, &q).await.unwrap_err();
        assert!(matches!(err, StormError::NoSuchPivot { .. }));
    }

    #[tokio::test]
    async fn test_pivot_out_and_in() {
        let snap = fixture_snapshot(GRAPH).await;
        let q = query(&[lift("inet:dns:a", "a1"), "{type: pivot_out}".to_string()]);
        let items = storm(&snap, &q).await.unwrap();
        assert_eq!(names(&items), vec!["inet:fqdn=vertex.link", "inet:ipv4=16909060"]);

        let q = query(&[lift("inet:fqdn", "woot.com"), "{type: pivot_in}".to_string()]);
        let items = storm(&snap, &q).await.unwrap();
        assert_eq!(names(&items), vec!["inet:dns:a=a2", "test:arry=x"]);

        let q = query(&[lift("inet:fqdn", "vertex.link"), "{type: pivot_in}".to_string()]);
        let items = storm(&snap, &q).await.unwrap();
        assert_eq!(names(&items), vec!["inet:dns:a=a1", "test:arry=x", "test:str=s"]);
    }

    #[tokio::test]
    async fn test_edge_form_pivots() {
        let snap = fixture_snapshot(GRAPH).await;
        let q = query(&[lift("inet:fqdn", "woot.com"), "{type: pivot_in_from, form: 'test:edge'}".to_string()]);
        let items = storm(&snap, &q).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0.form(), "test:edge");

        let q = query(&[
            lift("inet:fqdn", "woot.com"),
            "{type: pivot_in_from, form: 'test:edge'}".to_string(),
            "{type: pivot_in_from, form: 'test:str'}".to_string(),
        ]);
        let items = storm(&snap, &q).await.unwrap();
        assert_eq!(names(&items), vec!["test:str=s"]);

        let q = query(&[
            lift("test:str", "s"),
            "{type: form_pivot, form: 'test:edge'}".to_string(),
            "{type: form_pivot, form: 'inet:fqdn'}".to_string(),
        ]);
        let items = storm(&snap, &q).await.unwrap();
        assert_eq!(names(&items), vec!["inet:fqdn=woot.com"]);

        let q = query(&[lift("test:str", "s"), "{type: pivot_in_from, form: 'inet:dns:a'}".to_string()]);
        assert!(matches!(storm(&snap, &q).await, Err(StormError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_prop_pivots() {
        let snap = fixture_snapshot(GRAPH).await;
        let q = query(&[lift("inet:dns:a", "a1"), "{type: prop_pivot_out, prop: fqdn}".to_string()]);
        assert_eq!(names(&storm(&snap, &q).await.unwrap()), vec!["inet:fqdn=vertex.link"]);

        let q = query(&[lift("test:arry", "x"), "{type: prop_pivot_out, prop: names}".to_string()]);
        assert_eq!(
            names(&storm(&snap, &q).await.unwrap()),
            vec!["inet:fqdn=vertex.link", "inet:fqdn=woot.com"]
        );

        let q = query(&[lift("test:str", "s"), "{type: prop_pivot_out, prop: ref}".to_string()]);
        assert_eq!(names(&storm(&snap, &q).await.unwrap()), vec!["inet:fqdn=vertex.link"]);

        let q = query(&[
            lift("test:arry", "x"),
            "{type: prop_pivot, prop: names, dest: 'inet:dns:a:fqdn'}".to_string(),
        ]);
        assert_eq!(
            names(&storm(&snap, &q).await.unwrap()),
            vec!["inet:dns:a=a1", "inet:dns:a=a2"]
        );

        let q = query(&[
            lift("inet:dns:a", "a2"),
            "{type: prop_pivot, prop: fqdn, dest: 'test:arry:names'}".to_string(),
        ]);
        assert_eq!(names(&storm(&snap, &q).await.unwrap()), vec!["test:arry=x"]);
    }

    #[tokio::test]
    async fn test_prop_pivot_out_warns_once() {
        let snap = fixture_snapshot(GRAPH).await;
        let q = query(&[
            "{type: lift_prop, prop: 'test:str'}".to_string(),
            "{type: prop_pivot_out, prop: hehe}".to_string(),
        ]);
        let runt = runtime(&snap, &q, QueryOptions::default(), Arc::new(AllowAll)).unwrap();
        let items: Vec<_> = execute(Arc::clone(&runt)).try_collect().await.unwrap();
        assert!(items.is_empty());
        assert_eq!(
            runt.messages(),
            vec![Message::Warn(
                "The source property \"hehe\" type \"str\" is not a form. Cannot pivot.".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_pivot_to_tags() {
        let snap = fixture_snapshot(GRAPH).await;
        let run = |pattern: &'static str| {
            let snap = Arc::clone(&snap);
            async move {
                let q = query(&[
                    lift("test:str", "s"),
                    format!("{{type: pivot_to_tags, pattern: '{}'}}", pattern),
                ]);
                names(&storm(&snap, &q).await.unwrap())
            }
        };
        assert_eq!(
            run("").await,
            vec!["syn:tag=foo", "syn:tag=foo.bar", "syn:tag=foo.baz", "syn:tag=qux"]
        );
        assert_eq!(run("*").await, vec!["syn:tag=foo.bar", "syn:tag=foo.baz", "syn:tag=qux"]);
        assert_eq!(run("foo.*").await, vec!["syn:tag=foo.bar", "syn:tag=foo.baz"]);
        assert_eq!(run("qux").await, vec!["syn:tag=qux"]);
    }

    #[tokio::test]
    async fn test_tag_node_pivots() {
        let snap = fixture_snapshot(GRAPH).await;
        let q = query(&[lift("syn:tag", "qux"), "{type: pivot_out}".to_string()]);
        assert_eq!(names(&storm(&snap, &q).await.unwrap()), vec!["test:str=s"]);

        let q = query(&[lift("syn:tag", "foo"), "{type: form_pivot, form: 'inet:fqdn'}".to_string()]);
        assert!(storm(&snap, &q).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_walks() {
        let snap = fixture_snapshot(GRAPH).await;
        let walk = |kind: &str, verbs: &str, dests: Option<&str>| {
            let mut kids = vec![format!("{{type: const, valu: {}}}", verbs)];
            if let Some(dests) = dests {
                kids.push(format!("{{type: const, valu: {}}}", dests));
            }
            format!("{{type: {}, kids: [{}]}}", kind, kids.join(", "))
        };

        let q = query(&[lift("test:str", "s"), walk("n1_walk", "refs", None)]);
        assert_eq!(names(&storm(&snap, &q).await.unwrap()), vec!["inet:fqdn=vertex.link"]);

        let q = query(&[lift("test:str", "s"), walk("n1_walk", "'*'", None)]);
        assert_eq!(
            names(&storm(&snap, &q).await.unwrap()),
            vec!["inet:fqdn=vertex.link", "test:int=1"]
        );

        let q = query(&[lift("test:str", "s"), walk("n1_walk", "[refs, seen]", Some("'test:int'"))]);
        assert_eq!(names(&storm(&snap, &q).await.unwrap()), vec!["test:int=1"]);

        let q = query(&[lift("test:int", "1"), walk("n2_walk", "seen", None)]);
        assert_eq!(names(&storm(&snap, &q).await.unwrap()), vec!["test:str=s"]);

        let q = query(&[lift("test:str", "s"), walk("n1_walk", "refs", Some("'newp:form'"))]);
        assert!(matches!(storm(&snap, &q).await, Err(StormError::NoSuchForm { .. })));
    }

    #[tokio::test]
    async fn test_walk_npivo() {
        let snap = fixture_snapshot(GRAPH).await;
        let q = query(&[lift("test:str", "s"), "{type: n1_walk_n_pivo}".to_string()]);
        assert_eq!(
            names(&storm(&snap, &q).await.unwrap()),
            vec!["inet:fqdn=vertex.link", "inet:fqdn=vertex.link", "test:int=1"]
        );

        let q = query(&[lift("test:int", "1"), "{type: n2_walk_n_pivo, isjoin: true}".to_string()]);
        assert_eq!(names(&storm(&snap, &q).await.unwrap()), vec!["test:int=1", "test:str=s"]);
    }
}
