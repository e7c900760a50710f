// SPDX-License-Identifier: MIT

//! Lift operators
//!
//! A runtime-safe lift forwards its inbound stream untouched and then
//! yields its own nodes on fresh paths. Otherwise it re-yields each
//! inbound item followed by the nodes lifted with that item's path.

use async_stream::try_stream;
use futures::StreamExt;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use super::ast::{AstId, AstKind};
use super::expr::{eval, tag_name};
use super::path::Path;
use super::runtime::Runtime;
use super::signal::{genr, node_genr, Genr, Signal};
use crate::core::error::{Result, StormError};
use crate::core::node::NodeStream;
use crate::core::value::Value;

pub fn lift(runt: Arc<Runtime>, id: AstId, upstream: Genr) -> Genr {
    genr(try_stream! {
        if runt.is_runtsafe(id) {
            for await item in upstream {
                let item = item?;
                let stop = !matches!(item, Signal::Item(_));
                yield item;
                if stop {
                    return;
                }
            }
            let mut nodes = lift_nodes(&runt, id, None).await?;
            while let Some(node) = nodes.next().await {
                let node = node?;
                let path = runt.init_path(&node);
                yield Signal::Item((node, path));
            }
        } else {
            for await item in upstream {
                match item? {
                    Signal::Item((node, path)) => {
                        yield Signal::Item((node, path.clone()));
                        let mut nodes = lift_nodes(&runt, id, Some(&path)).await?;
                        while let Some(lnode) = nodes.next().await {
                            let lnode = lnode?;
                            let lpath = path.fork(&lnode);
                            yield Signal::Item((lnode, lpath));
                        }
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

async fn lift_nodes(runt: &Arc<Runtime>, id: AstId, path: Option<&Path>) -> Result<NodeStream> {
    let ast = runt.ast();
    let snap = runt.snap();
    log::debug!("Lifting with {} in runtime {}", ast.kind(id).name(), runt.iden());
    match ast.kind(id) {
        AstKind::LiftProp { prop } => snap.nodes_by_prop(prop).await,
        AstKind::LiftPropBy { prop, cmpr } => {
            let valu = eval(runt, ast.kid(id, 0)?, path).await?;
            snap.nodes_by_prop_valu(prop, cmpr, &valu).await
        }
        AstKind::LiftPropArray { prop, cmpr } => {
            let valu = eval(runt, ast.kid(id, 0)?, path).await?;
            snap.nodes_by_prop_array(prop, cmpr, &valu).await
        }
        AstKind::LiftTag { form } => {
            let tag = tag_name(runt, ast.kid(id, 0)?, path).await?;
            snap.nodes_by_tag(&tag, form.as_deref()).await
        }
        AstKind::LiftFormTag { form } => {
            let tag = tag_name(runt, ast.kid(id, 0)?, path).await?;
            snap.nodes_by_tag(&tag, Some(form)).await
        }
        AstKind::LiftTagValu { form, cmpr } => {
            let tag = tag_name(runt, ast.kid(id, 0)?, path).await?;
            let valu = eval(runt, ast.kid(id, 1)?, path).await?;
            snap.nodes_by_tag_valu(&tag, cmpr, &valu, form.as_deref()).await
        }
        AstKind::LiftTagProp { form, prop, cmpr } => {
            let tag = tag_name(runt, ast.kid(id, 0)?, path).await?;
            match cmpr {
                Some(cmpr) => {
                    let valu = eval(runt, ast.kid(id, 1)?, path).await?;
                    snap.nodes_by_tag_prop(form.as_deref(), &tag, prop, Some((cmpr, &valu)))
                        .await
                }
                None => snap.nodes_by_tag_prop(form.as_deref(), &tag, prop, None).await,
            }
        }
        AstKind::LiftTagTag { form } => {
            let tag = tag_name(runt, ast.kid(id, 0)?, path).await?;
            Ok(lift_tag_tag(Arc::clone(runt), tag, form.clone()))
        }
        other => Err(StormError::runtime(format!("{} is not a lift", other.name()))),
    }
}

/// `##tag`: nodes carrying the tag, or any tag whose `syn:tag` node carries it, transitively
fn lift_tag_tag(runt: Arc<Runtime>, tag: String, form: Option<String>) -> NodeStream {
    node_genr(try_stream! {
        let snap = Arc::clone(runt.snap());
        if snap.get_node_by_ndef("syn:tag", &Value::str(&tag)).await?.is_none() {
            return;
        }
        let mut done = HashSet::from([tag.clone()]);
        let mut todo = VecDeque::from([tag]);
        while let Some(tag) = todo.pop_front() {
            let mut nodes = snap.nodes_by_tag(&tag, None).await?;
            while let Some(node) = nodes.next().await {
                let node = node?;
                if node.form() == "syn:tag" {
                    let name = node.valu().tostr()?;
                    if done.insert(name.clone()) {
                        todo.push_back(name);
                    }
                    continue;
                }
                if form.as_deref().map_or(true, |form| node.form() == form) {
                    yield node;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use crate::core::error::StormError;
    use crate::storm::testutil::{fixture_snapshot, names, storm};

    const GRAPH: &str = r#"
nodes:
  - form: test:str
    valu: a
    props: {hehe: b}
    tags: {t1: null}
    tagprops: {t1: {score: 20}}
  - form: test:str
    valu: b
    tags: {bad: ["2020", "2021"]}
  - form: syn:tag
    valu: t1
    tags: {bad: null}
  - form: test:int
    valu: 10
  - form: test:arry
    valu: x
    props: {names: [a.com, b.com]}
"#;

    #[tokio::test]
    async fn test_lift_prop() {
        let snap = fixture_snapshot(GRAPH).await;
        let items = storm(&snap, r#"{type: query, kids: [{type: lift_prop, prop: "test:str"}]}"#)
            .await
            .unwrap();
        assert_eq!(names(&items), vec!["test:str=a", "test:str=b"]);

        let items = storm(
            &snap,
            r#"{type: query, kids: [{type: lift_prop_by, prop: "test:str:hehe", cmpr: "=", kids: [{type: const, valu: b}]}]}"#,
        )
        .await
        .unwrap();
        assert_eq!(names(&items), vec!["test:str=a"]);

        let items = storm(
            &snap,
            r#"{type: query, kids: [{type: lift_prop_array, prop: "test:arry:names", cmpr: "=", kids: [{type: const, valu: b.com}]}]}"#,
        )
        .await
        .unwrap();
        assert_eq!(names(&items), vec!["test:arry=x"]);
    }

    #[tokio::test]
    async fn test_runtsafe_lift_passes_upstream_first() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = r#"
type: query
kids:
  - {type: lift_prop, prop: "test:int"}
  - {type: lift_prop_by, prop: "test:str", cmpr: "=", kids: [{type: const, valu: a}]}
"#;
        let items = storm(&snap, query).await.unwrap();
        assert_eq!(names(&items), vec!["test:int=10", "test:str=a"]);
        assert_eq!(items[1].1.nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_node_bound_lift_forks() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = r#"
type: query
kids:
  - {type: lift_prop_by, prop: "test:str", cmpr: "=", kids: [{type: const, valu: a}]}
  - type: lift_prop_by
    prop: "test:str"
    cmpr: "="
    kids: [{type: rel_prop_value, prop: hehe}]
"#;
        let items = storm(&snap, query).await.unwrap();
        assert_eq!(names(&items), vec!["test:str=a", "test:str=b"]);
        assert_eq!(items[1].1.nodes().len(), 2);
    }

    #[tokio::test]
    async fn test_lift_tags() {
        let snap = fixture_snapshot(GRAPH).await;
        let items = storm(
            &snap,
            r##"{type: query, kids: [{type: lift_tag, form: "test:str", kids: [{type: const, valu: "#T1"}]}]}"##,
        )
        .await
        .unwrap();
        assert_eq!(names(&items), vec!["test:str=a"]);

        let items = storm(
            &snap,
            r#"{type: query, kids: [{type: lift_tag_valu, cmpr: "@=", kids: [{type: const, valu: bad}, {type: const, valu: "2020-06-01"}]}]}"#,
        )
        .await
        .unwrap();
        assert_eq!(names(&items), vec!["test:str=b"]);

        let items = storm(
            &snap,
            r#"{type: query, kids: [{type: lift_tag_prop, prop: score, cmpr: ">=", kids: [{type: const, valu: t1}, {type: const, valu: 20}]}]}"#,
        )
        .await
        .unwrap();
        assert_eq!(names(&items), vec!["test:str=a"]);
    }

    #[tokio::test]
    async fn test_lift_tag_tag() {
        let snap = fixture_snapshot(GRAPH).await;
        let items = storm(
            &snap,
            r#"{type: query, kids: [{type: lift_tag_tag, kids: [{type: const, valu: bad}]}]}"#,
        )
        .await
        .unwrap();
        let mut found = names(&items);
        found.sort();
        assert_eq!(found, vec!["test:str=a", "test:str=b"]);

        let items = storm(
            &snap,
            r#"{type: query, kids: [{type: lift_tag_tag, kids: [{type: const, valu: newp}]}]}"#,
        )
        .await
        .unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_lift_bad_prop() {
        let snap = fixture_snapshot(GRAPH).await;
        let err = storm(&snap, r#"{type: query, kids: [{type: lift_prop, prop: "test:str:newp"}]}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, StormError::NoSuchProp { .. }));
    }
}
