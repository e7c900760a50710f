// SPDX-License-Identifier: MIT

//! Query pipeline
//!
//! A query is a left fold of its operators over an input stream: each
//! operator consumes the stream built so far and returns a new one. Nothing
//! runs until the outermost stream is polled.

use async_stream::try_stream;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::sync::Arc;

use super::ast::{AstId, AstKind};
use super::cond::filt_oper;
use super::control;
use super::edit::edit;
use super::expr::{compute, runtval};
use super::lift::lift;
use super::pivot::pivot;
use super::runtime::Runtime;
use super::signal::{self, genr, Genr, Item, Signal};
use super::subgraph::subgraph;
use crate::core::error::{Result, StormError};
use crate::core::node::{Buid, Ndef};
use crate::core::value::Value;

/// The stream a caller of [`execute`] consumes
pub type ItemStream = BoxStream<'static, Result<Item>>;

pub(super) fn item_stream<S>(stream: S) -> ItemStream
where
    S: Stream<Item = Result<Item>> + Send + 'static,
{
    stream.boxed()
}

/// Chain the operators of `query` over `genr`
pub fn run_query(runt: Arc<Runtime>, query: AstId, genr: Genr) -> Genr {
    let opers = runt.ast().kids(query).to_vec();
    opers
        .into_iter()
        .fold(genr, |genr, oper| run_oper(Arc::clone(&runt), oper, genr))
}

/// Wrap `genr` in the operator at `id`
pub fn run_oper(runt: Arc<Runtime>, id: AstId, genr: Genr) -> Genr {
    let ast = Arc::clone(runt.ast());
    match ast.kind(id) {
        AstKind::LiftProp { .. }
        | AstKind::LiftPropBy { .. }
        | AstKind::LiftPropArray { .. }
        | AstKind::LiftTag { .. }
        | AstKind::LiftFormTag { .. }
        | AstKind::LiftTagValu { .. }
        | AstKind::LiftTagProp { .. }
        | AstKind::LiftTagTag { .. } => lift(runt, id, genr),
        AstKind::FormPivot { .. }
        | AstKind::PivotOut { .. }
        | AstKind::PivotIn { .. }
        | AstKind::PivotInFrom { .. }
        | AstKind::PropPivotOut { .. }
        | AstKind::PropPivot { .. }
        | AstKind::PivotToTags { .. }
        | AstKind::N1Walk { .. }
        | AstKind::N2Walk { .. }
        | AstKind::N1WalkNPivo { .. }
        | AstKind::N2WalkNPivo { .. } => pivot(runt, id, genr),
        AstKind::EditNodeAdd { .. }
        | AstKind::EditPropSet { .. }
        | AstKind::EditPropDel { .. }
        | AstKind::EditTagAdd { .. }
        | AstKind::EditTagDel
        | AstKind::EditTagPropSet { .. }
        | AstKind::EditTagPropDel { .. }
        | AstKind::EditEdgeAdd { .. }
        | AstKind::EditEdgeDel { .. } => edit(runt, id, genr),
        AstKind::FiltOper { .. } => filt_oper(runt, id, genr),
        AstKind::SetVarOper { name } => set_var_oper(runt, id, name.clone(), genr),
        AstKind::VarListSetOper { names } => var_list_set_oper(runt, id, names.clone(), genr),
        AstKind::VarEvalOper => var_eval_oper(runt, id, genr),
        AstKind::SubQuery => sub_query_oper(runt, id, genr),
        AstKind::ForLoop { names } => control::for_loop(runt, id, names.clone(), genr),
        AstKind::WhileLoop => control::while_loop(runt, id, genr),
        AstKind::IfStmt => control::if_stmt(runt, id, genr),
        AstKind::SwitchCase => control::switch_case(runt, id, genr),
        AstKind::Function { .. } => control::function(runt, id, genr),
        AstKind::Return => control::return_oper(runt, id, genr),
        AstKind::BreakOper | AstKind::ContinueOper => control::loop_oper(runt, id, genr),
        other => {
            let mesg = format!("{} is not an operator", other.name());
            signal::error(StormError::BadSyntax(mesg))
        }
    }
}

/// Split a list across variable names, failing unless the lengths agree
pub fn unpack(names: &[String], valu: Value) -> Result<Vec<(String, Value)>> {
    let items = match valu {
        Value::List(items) => items,
        other => {
            return Err(StormError::runtime(format!(
                "cannot unpack a {} into {} variables",
                other.type_name(),
                names.len()
            )))
        }
    };
    if items.len() != names.len() {
        return Err(StormError::VarListArity {
            expected: names.len(),
            got: items.len(),
        });
    }
    Ok(names.iter().cloned().zip(items).collect())
}

/// Drain a node generator for its side effects
async fn drain(valu: Value) -> Result<()> {
    if let Value::Gen(gen) = valu {
        let mut nodes = gen.nodes();
        while let Some(node) = nodes.next().await {
            node?;
        }
    }
    Ok(())
}

/// `$name = valu`
fn set_var_oper(runt: Arc<Runtime>, id: AstId, name: String, upstream: Genr) -> Genr {
    genr(try_stream! {
        let kid = runt.ast().kid(id, 0)?;
        let runtsafe = runt.is_runtsafe(kid);
        let mut count = 0usize;
        for await item in upstream {
            match item? {
                Signal::Item((node, path)) => {
                    count += 1;
                    let valu = compute(&runt, kid, &path).await?;
                    if runtsafe {
                        runt.set_var(name.clone(), valu.clone());
                    }
                    path.set_var(name.clone(), valu);
                    yield Signal::Item((node, path));
                }
                other => {
                    yield other;
                    return;
                }
            }
        }
        if count == 0 && runtsafe {
            let valu = runtval(&runt, kid).await?;
            runt.set_var(name, valu);
        }
    })
}

/// `($a, $b) = valu`
fn var_list_set_oper(runt: Arc<Runtime>, id: AstId, names: Vec<String>, upstream: Genr) -> Genr {
    genr(try_stream! {
        let kid = runt.ast().kid(id, 0)?;
        let runtsafe = runt.is_runtsafe(kid);
        let mut count = 0usize;
        for await item in upstream {
            match item? {
                Signal::Item((node, path)) => {
                    count += 1;
                    let valu = compute(&runt, kid, &path).await?;
                    for (name, valu) in unpack(&names, valu)? {
                        if runtsafe {
                            runt.set_var(name.clone(), valu.clone());
                        }
                        path.set_var(name, valu);
                    }
                    yield Signal::Item((node, path));
                }
                other => {
                    yield other;
                    return;
                }
            }
        }
        if count == 0 && runtsafe {
            let valu = runtval(&runt, kid).await?;
            for (name, valu) in unpack(&names, valu)? {
                runt.set_var(name, valu);
            }
        }
    })
}

/// A bare expression evaluated for its side effects
fn var_eval_oper(runt: Arc<Runtime>, id: AstId, upstream: Genr) -> Genr {
    genr(try_stream! {
        let kid = runt.ast().kid(id, 0)?;
        let runtsafe = runt.is_runtsafe(kid);
        let mut count = 0usize;
        for await item in upstream {
            match item? {
                Signal::Item((node, path)) => {
                    count += 1;
                    drain(compute(&runt, kid, &path).await?).await?;
                    yield Signal::Item((node, path));
                }
                other => {
                    yield other;
                    return;
                }
            }
        }
        if count == 0 && runtsafe {
            drain(runtval(&runt, kid).await?).await?;
        }
    })
}

/// A nested query run per item for its side effects; the item itself continues
fn sub_query_oper(runt: Arc<Runtime>, id: AstId, upstream: Genr) -> Genr {
    genr(try_stream! {
        for await item in upstream {
            match item? {
                Signal::Item((node, path)) => {
                    let input = signal::items(vec![(node.clone(), path.clone())]);
                    let mut results = run_query(Arc::clone(&runt), id, input);
                    while let Some(sig) = results.next().await {
                        match sig? {
                            Signal::Item(_) => {}
                            other => {
                                yield other;
                                return;
                            }
                        }
                    }
                    yield Signal::Item((node, path));
                }
                other => {
                    yield other;
                    return;
                }
            }
        }
    })
}

/// Nodes named by the `ndefs` and `idens` options
fn seeds(runt: Arc<Runtime>) -> Genr {
    genr(try_stream! {
        let snap = Arc::clone(runt.snap());
        for ndef in &runt.opts().ndefs {
            let ndef = Ndef::from_value(ndef)
                .ok_or_else(|| StormError::bad_valu("ndef", format!("invalid ndef {}", ndef)))?;
            if let Some(node) = snap.get_node_by_ndef(&ndef.form, &ndef.valu).await? {
                let path = runt.init_path(&node);
                yield Signal::Item((node, path));
            }
        }
        for iden in &runt.opts().idens {
            let buid = Buid::from_hex(iden)
                .ok_or_else(|| StormError::bad_valu("iden", format!("invalid iden {}", iden)))?;
            if let Some(node) = snap.get_node_by_buid(&buid).await? {
                let path = runt.init_path(&node);
                yield Signal::Item((node, path));
            }
        }
    })
}

/// Items of a top level query; a control signal that escapes every frame ends it
fn top_items(genr: Genr) -> ItemStream {
    item_stream(try_stream! {
        for await sig in genr {
            match sig? {
                Signal::Item(item) => yield item,
                Signal::Break(item) | Signal::Continue(item) => {
                    if let Some(item) = item {
                        yield item;
                    }
                    return;
                }
                Signal::Return(_) => return,
            }
        }
    })
}

/// Run the runtime's query over its seed nodes
pub fn execute(runt: Arc<Runtime>) -> ItemStream {
    item_stream(try_stream! {
        log::info!("Executing query in runtime {}", runt.iden());
        let input = seeds(Arc::clone(&runt));
        let mut items = top_items(run_query(Arc::clone(&runt), runt.query(), input));
        if let Some(rules) = runt.opts().graph_rules() {
            log::debug!("Projecting subgraph with {} degrees", rules.degrees.map_or(-1, i64::from));
            items = subgraph(Arc::clone(&runt), rules, items);
        }
        let limit = runt.opts().limit;
        let mut count = 0usize;
        if limit != Some(0) {
            while let Some(item) = items.next().await {
                let item = item?;
                runt.tick()?;
                count += 1;
                yield item;
                // Stop before pulling another item through the upstream edits
                if limit.is_some_and(|limit| count >= limit) {
                    break;
                }
            }
        }
        log::info!("Runtime {} yielded {} nodes in {} ticks", runt.iden(), count, runt.ticks());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::perms::AllowAll;
    use crate::storm::opts::QueryOptions;
    use crate::storm::testutil::{fixture_snapshot, names, runtime, storm, storm_opts};
    use futures::TryStreamExt;

    const GRAPH: &str = r#"
nodes:
  - form: test:str
    valu: a
    props: {hehe: b}
  - form: test:str
    valu: b
    props: {hehe: c}
  - form: test:str
    valu: c
"#;

    #[tokio::test]
    async fn test_set_var_runtsafe() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = r#"
type: query
kids:
  - {type: set_var_oper, name: v, kids: [{type: const, valu: c}]}
  - {type: lift_prop_by, prop: "test:str", cmpr: "=", kids: [{type: var_value, name: v}]}
"#;
        let items = storm(&snap, query).await.unwrap();
        assert_eq!(names(&items), vec!["test:str=c"]);
    }

    #[tokio::test]
    async fn test_set_var_node_bound() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = r#"
type: query
kids:
  - {type: lift_prop, prop: "test:str:hehe"}
  - {type: set_var_oper, name: h, kids: [{type: rel_prop_value, prop: hehe}]}
  - {type: lift_prop_by, prop: "test:str", cmpr: "=", kids: [{type: var_value, name: h}]}
"#;
        let items = storm(&snap, query).await.unwrap();
        assert_eq!(
            names(&items),
            vec!["test:str=a", "test:str=b", "test:str=b", "test:str=c"]
        );
        assert_eq!(items[1].1.get_var("h"), Some(Value::str("b")));
        assert_eq!(items[1].1.nodes().len(), 2);
    }

    #[tokio::test]
    async fn test_var_list_set() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = r#"
type: query
kids:
  - type: var_list_set_oper
    names: [x, y]
    kids: [{type: list, kids: [{type: const, valu: a}, {type: const, valu: c}]}]
  - {type: lift_prop_by, prop: "test:str", cmpr: "=", kids: [{type: var_value, name: y}]}
"#;
        let items = storm(&snap, query).await.unwrap();
        assert_eq!(names(&items), vec!["test:str=c"]);

        let query = r#"
type: query
kids:
  - type: var_list_set_oper
    names: [x, y, z]
    kids: [{type: list, kids: [{type: const, valu: a}, {type: const, valu: c}]}]
"#;
        let err = storm(&snap, query).await.unwrap_err();
        assert!(matches!(err, StormError::VarListArity { expected: 3, got: 2 }));
    }

    #[test]
    fn test_unpack() {
        let names = vec!["a".to_string(), "b".to_string()];
        let pairs = unpack(&names, Value::List(vec![Value::Int(1), Value::Int(2)])).unwrap();
        assert_eq!(pairs[1], ("b".to_string(), Value::Int(2)));
        assert!(unpack(&names, Value::Int(1)).is_err());
    }

    #[tokio::test]
    async fn test_sub_query_stage_keeps_item() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = r#"
type: query
kids:
  - {type: lift_prop_by, prop: "test:str", cmpr: "=", kids: [{type: const, valu: a}]}
  - type: sub_query
    kids:
      - {type: lift_prop, prop: "test:str"}
"#;
        let items = storm(&snap, query).await.unwrap();
        assert_eq!(names(&items), vec!["test:str=a"]);
    }

    #[tokio::test]
    async fn test_seeds_and_limit() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = "{type: query, kids: []}";
        let b = crate::core::node::Buid::from_ndef("test:str", &Value::str("b"));
        let opts = QueryOptions {
            ndefs: vec![Value::List(vec![Value::str("test:str"), Value::str("c")])],
            idens: vec![b.hex()],
            ..QueryOptions::default()
        };
        let items = storm_opts(&snap, query, opts).await.unwrap();
        assert_eq!(names(&items), vec!["test:str=c", "test:str=b"]);

        let opts = QueryOptions {
            limit: Some(2),
            ..QueryOptions::default()
        };
        let items = storm_opts(&snap, "{type: query, kids: [{type: lift_prop, prop: 'test:str'}]}", opts)
            .await
            .unwrap();
        assert_eq!(items.len(), 2);

        let opts = QueryOptions {
            idens: vec!["newp".to_string()],
            ..QueryOptions::default()
        };
        let err = storm_opts(&snap, query, opts).await.unwrap_err();
        assert!(matches!(err, StormError::BadTypeValu { .. }));
    }

    #[tokio::test]
    async fn test_cancel() {
        let snap = fixture_snapshot(GRAPH).await;
        let runt = runtime(
            &snap,
            "{type: query, kids: [{type: lift_prop, prop: 'test:str'}]}",
            QueryOptions::default(),
            Arc::new(AllowAll),
        )
        .unwrap();
        runt.cancel_handle().cancel();
        let err = execute(runt).try_collect::<Vec<_>>().await.unwrap_err();
        assert!(matches!(err, StormError::Cancelled));
    }

    #[tokio::test]
    async fn test_stray_break_ends_query() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = r#"
type: query
kids:
  - {type: lift_prop, prop: "test:str"}
  - {type: break_oper}
  - {type: lift_prop, prop: "test:int"}
"#;
        let items = storm(&snap, query).await.unwrap();
        assert_eq!(names(&items), vec!["test:str=a"]);
    }
}
