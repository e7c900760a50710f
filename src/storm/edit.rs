// SPDX-License-Identifier: MIT

//! Edit operators
//!
//! Edits mutate the snapshot and then pass their inbound item along. Each
//! distinct permission is confirmed once per operator, before the first
//! mutation it guards. Quiet variants (`?=`, `?+=`, `?-=` and `[?#tag]`)
//! swallow bad value errors and leave the node untouched.

use async_stream::try_stream;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::ast::{AstId, AstKind};
use super::expr::{compute, runtval, tag_name};
use super::path::Path;
use super::pipeline::run_query;
use super::runtime::Runtime;
use super::signal::{self, genr, Genr, Signal};
use crate::core::error::{Result, StormError};
use crate::core::model::Prop;
use crate::core::node::{norm_tag, Node};
use crate::core::snapshot::Snapshot;
use crate::core::types::{ival_merge, norm_ival};
use crate::core::value::Value;

/// Permissions already granted to one operator
#[derive(Default)]
struct Confirmed(HashSet<Vec<String>>);

impl Confirmed {
    fn confirm(&mut self, runt: &Runtime, perm: &[&str]) -> Result<()> {
        let perm: Vec<String> = perm.iter().map(|part| part.to_string()).collect();
        if !self.0.contains(&perm) {
            runt.confirm(&perm)?;
            self.0.insert(perm);
        }
        Ok(())
    }
}

/// Runtsafe operand values, computed on the first item and reused after
#[derive(Default)]
struct Operands(HashMap<AstId, Value>);

impl Operands {
    async fn value(&mut self, runt: &Arc<Runtime>, id: AstId, path: &Path) -> Result<Value> {
        if !runt.is_runtsafe(id) {
            return compute(runt, id, path).await;
        }
        if let Some(valu) = self.0.get(&id) {
            return Ok(valu.clone());
        }
        let valu = runtval(runt, id).await?;
        self.0.insert(id, valu.clone());
        Ok(valu)
    }

    async fn tag(&mut self, runt: &Arc<Runtime>, id: AstId, path: &Path) -> Result<String> {
        if !runt.is_runtsafe(id) {
            return tag_name(runt, id, Some(path)).await;
        }
        if let Some(Value::Str(tag)) = self.0.get(&id) {
            return Ok(tag.clone());
        }
        let tag = tag_name(runt, id, None).await?;
        self.0.insert(id, Value::Str(tag.clone()));
        Ok(tag)
    }
}

/// Per operator state kept across items
#[derive(Default)]
struct EditState {
    perms: Confirmed,
    operands: Operands,
}

fn tag_perm<'a>(action: &'a str, tag: &'a str) -> Vec<&'a str> {
    let mut perm = vec!["node", "tag", action];
    perm.extend(tag.split('.'));
    perm
}

/// Swallow bad value errors when the operator is quiet
fn quietly(quiet: bool, result: Result<()>) -> Result<()> {
    match result {
        Err(err) if quiet && err.is_bad_valu() => {
            log::debug!("Ignoring {} in quiet edit", err);
            Ok(())
        }
        other => other,
    }
}

pub fn edit(runt: Arc<Runtime>, id: AstId, upstream: Genr) -> Genr {
    let ast = Arc::clone(runt.ast());
    if let AstKind::EditNodeAdd { form, oper } = ast.kind(id) {
        return node_add(runt, id, form.clone(), oper.starts_with('?'), upstream);
    }
    genr(try_stream! {
        let mut state = EditState::default();
        for await item in upstream {
            match item? {
                Signal::Item((node, path)) => {
                    apply(&runt, id, &node, &path, &mut state).await?;
                    yield Signal::Item((node, path));
                    tokio::task::yield_now().await;
                }
                other => {
                    yield other;
                    return;
                }
            }
        }
    })
}

async fn add_node(runt: &Runtime, form: &str, valu: &Value, quiet: bool) -> Result<Option<Node>> {
    match runt.snap().add_node(form, valu).await {
        Ok(node) => Ok(Some(node)),
        Err(err) if quiet && err.is_bad_valu() => Ok(None),
        Err(err) => Err(err),
    }
}

/// `[form=valu]`
fn node_add(runt: Arc<Runtime>, id: AstId, form: String, quiet: bool, upstream: Genr) -> Genr {
    genr(try_stream! {
        let kid = runt.ast().kid(id, 0)?;
        let perm = ["node".to_string(), "add".to_string(), form.clone()];
        if runt.is_runtsafe(kid) {
            runt.confirm(&perm)?;
            for await item in upstream {
                let item = item?;
                let stop = !matches!(item, Signal::Item(_));
                yield item;
                if stop {
                    return;
                }
            }
            let valu = runtval(&runt, kid).await?;
            if let Some(node) = add_node(&runt, &form, &valu, quiet).await? {
                let path = runt.init_path(&node);
                yield Signal::Item((node, path));
            }
        } else {
            let mut first = true;
            for await item in upstream {
                match item? {
                    Signal::Item((node, path)) => {
                        if first {
                            runt.confirm(&perm)?;
                            first = false;
                        }
                        let valu = compute(&runt, kid, &path).await?;
                        let newn = add_node(&runt, &form, &valu, quiet).await?;
                        let fork = newn.as_ref().map(|newn| path.fork(newn));
                        yield Signal::Item((node, path));
                        if let (Some(newn), Some(fork)) = (newn, fork) {
                            yield Signal::Item((newn, fork));
                        }
                        tokio::task::yield_now().await;
                    }
                    other => {
                        yield other;
                        return;
                    }
                }
            }
        }
    })
}

async fn apply(
    runt: &Arc<Runtime>,
    id: AstId,
    node: &Node,
    path: &Path,
    state: &mut EditState,
) -> Result<()> {
    let ast = Arc::clone(runt.ast());
    let snap = Arc::clone(runt.snap());
    match ast.kind(id) {
        AstKind::EditPropSet { prop, oper } => {
            let prop = form_prop(&snap, node, prop)?;
            state.perms.confirm(runt, &["node", "prop", "set", prop.full.as_str()])?;
            let valu = state.operands.value(runt, ast.kid(id, 0)?, path).await?.toprim();
            quietly(oper.starts_with('?'), set_prop(&snap, node, &prop, oper, valu).await)
        }
        AstKind::EditPropDel { prop } => {
            let prop = form_prop(&snap, node, prop)?;
            state.perms.confirm(runt, &["node", "prop", "del", prop.full.as_str()])?;
            snap.pop_prop(node, &prop.name).await?;
            Ok(())
        }
        AstKind::EditTagAdd { tryset } => {
            let tags = match tag_list(runt, ast.kid(id, 0)?, path, &mut state.operands).await {
                Ok(tags) => tags,
                Err(err) if *tryset && err.is_bad_valu() => return Ok(()),
                Err(err) => return Err(err),
            };
            for tag in tags {
                state.perms.confirm(runt, &tag_perm("add", &tag))?;
                quietly(*tryset, add_tag(runt, &snap, id, node, path, &tag, &mut state.operands).await)?;
            }
            Ok(())
        }
        AstKind::EditTagDel => {
            for tag in tag_list(runt, ast.kid(id, 0)?, path, &mut state.operands).await? {
                state.perms.confirm(runt, &tag_perm("del", &tag))?;
                snap.del_tag(node, &tag).await?;
            }
            Ok(())
        }
        AstKind::EditTagPropSet { prop, oper } => {
            let tag = state.operands.tag(runt, ast.kid(id, 0)?, path).await?;
            state.perms.confirm(runt, &tag_perm("add", &tag))?;
            let valu = state.operands.value(runt, ast.kid(id, 1)?, path).await?;
            quietly(
                oper.starts_with('?'),
                snap.set_tag_prop(node, &tag, prop, &valu).await,
            )
        }
        AstKind::EditTagPropDel { prop } => {
            let tag = state.operands.tag(runt, ast.kid(id, 0)?, path).await?;
            state.perms.confirm(runt, &tag_perm("del", &tag))?;
            snap.del_tag_prop(node, &tag, prop).await
        }
        AstKind::EditEdgeAdd { n2 } => edit_edges(runt, id, node, path, *n2, true, state).await,
        AstKind::EditEdgeDel { n2 } => edit_edges(runt, id, node, path, *n2, false, state).await,
        other => Err(StormError::runtime(format!("{} is not an edit", other.name()))),
    }
}

fn form_prop(snap: &Arc<dyn Snapshot>, node: &Node, name: &str) -> Result<Arc<Prop>> {
    snap.model()
        .req_form(node.form())?
        .prop(name)
        .cloned()
        .ok_or_else(|| StormError::no_such_prop(name, Some(node.form())))
}

/// Set a property, reading and rewriting the whole array for `+=` and `-=`
async fn set_prop(snap: &Arc<dyn Snapshot>, node: &Node, prop: &Prop, oper: &str, valu: Value) -> Result<()> {
    let valu = match oper.trim_start_matches('?') {
        "+=" | "-=" => {
            let elem = prop.styp.elem().ok_or_else(|| {
                StormError::runtime(format!("Property set using ({}) is only valid on arrays.", oper))
            })?;
            let mut arry = node
                .get(&prop.name)
                .and_then(|curv| curv.as_list().map(<[Value]>::to_vec))
                .unwrap_or_default();
            if oper.ends_with("+=") {
                arry.push(valu);
            } else {
                let (norm, _) = elem.norm(&valu)?;
                if let Some(index) = arry.iter().position(|item| *item == norm) {
                    arry.remove(index);
                }
            }
            Value::List(arry)
        }
        _ => valu,
    };
    snap.set_prop_deep(node, &prop.name, &valu).await?;
    Ok(())
}

/// One tag name or a list of them, normalized
async fn tag_list(runt: &Arc<Runtime>, id: AstId, path: &Path, operands: &mut Operands) -> Result<Vec<String>> {
    match operands.value(runt, id, path).await?.toprim() {
        Value::List(items) => items.iter().map(|item| norm_tag(&item.tostr()?)).collect(),
        Value::Null => Ok(Vec::new()),
        other => Ok(vec![norm_tag(&other.tostr()?)?]),
    }
}

/// Add a tag, merging a given interval with the one already present
async fn add_tag(
    runt: &Arc<Runtime>,
    snap: &Arc<dyn Snapshot>,
    id: AstId,
    node: &Node,
    path: &Path,
    tag: &str,
    operands: &mut Operands,
) -> Result<()> {
    let ival = match runt.ast().opt_kid(id, 1) {
        Some(kid) => match operands.value(runt, kid, path).await? {
            Value::Null => None,
            valu => Some(norm_ival(&valu).map_err(|mesg| StormError::bad_valu("ival", mesg))?),
        },
        None => None,
    };
    let ival = match (node.tag(tag).flatten(), ival) {
        (Some(curv), Some(ival)) => Some(ival_merge(curv, ival)),
        (curv, ival) => ival.or(curv),
    };
    snap.add_tag(node, tag, ival).await
}

/// `+(verb)> { query }` and friends; the subquery names the other ends
async fn edit_edges(
    runt: &Arc<Runtime>,
    id: AstId,
    node: &Node,
    path: &Path,
    n2: bool,
    add: bool,
    state: &mut EditState,
) -> Result<()> {
    let ast = Arc::clone(runt.ast());
    let verb = state.operands.value(runt, ast.kid(id, 0)?, path).await?.tostr()?;
    state.perms.confirm(runt, &["node", "edge", if add { "add" } else { "del" }, verb.as_str()])?;

    let query = ast.kid(id, 1)?;
    let subr = runt.sub_runtime(query, path.vars());
    let snap = Arc::clone(runt.snap());
    let mut results = run_query(subr, query, signal::empty());
    while let Some(sig) = results.next().await {
        let Signal::Item((other, _)) = sig? else {
            break;
        };
        let (n1, n2) = if n2 { (&other, node) } else { (node, &other) };
        if add {
            snap.add_edge(n1, &verb, &n2.buid()).await?;
        } else {
            snap.del_edge(n1, &verb, &n2.buid()).await?;
        }
    }
    Ok(())
}
