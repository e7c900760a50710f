// SPDX-License-Identifier: MIT

//! Shared helpers for unit tests

use futures::TryStreamExt;
use std::sync::Arc;

use super::doc::QueryLoader;
use super::opts::QueryOptions;
use super::pipeline::execute;
use super::runtime::Runtime;
use super::signal::Item;
use crate::core::error::Result;
use crate::core::memory::{GraphFixture, MemorySnapshot};
use crate::core::model::DataModel;
use crate::core::perms::{AllowAll, PermGate};
use crate::core::snapshot::Snapshot;

pub const MODEL: &str = r#"
types:
  - name: inet:fqdn
    kind: str
    lower: true
  - name: inet:ipv4
    kind: int
  - name: fqdns
    kind: array
    elem: inet:fqdn
  - name: test:edge
    kind: edge
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
      - name: ipv4
        type: inet:ipv4
  - name: test:str
    type: str
    props:
      - name: hehe
        type: str
      - name: tick
        type: time
      - name: ref
        type: ndef
  - name: test:int
    type: int
  - name: test:arry
    type: str
    props:
      - name: names
        type: fqdns
  - name: test:edge
tagprops:
  - name: score
    type: int
"#;

pub fn model() -> Arc<DataModel> {
    Arc::new(DataModel::from_yaml(MODEL).unwrap())
}

pub async fn fixture_snapshot(graph: &str) -> Arc<MemorySnapshot> {
    let snap = Arc::new(MemorySnapshot::new(model()));
    snap.load_fixture(&GraphFixture::parse_yaml(graph).unwrap())
        .await
        .unwrap();
    snap
}

/// Compile a query document and build a runtime over `snap`
pub fn runtime(
    snap: &Arc<MemorySnapshot>,
    query: &str,
    opts: QueryOptions,
    perms: Arc<dyn PermGate>,
) -> Result<Arc<Runtime>> {
    let doc = QueryLoader::parse_yaml(query)?;
    let ast = QueryLoader::compile(&doc, snap.model())?;
    let snap: Arc<dyn Snapshot> = Arc::clone(snap) as Arc<dyn Snapshot>;
    Runtime::new(snap, perms, Arc::new(ast), opts)
}

pub async fn storm_opts(snap: &Arc<MemorySnapshot>, query: &str, opts: QueryOptions) -> Result<Vec<Item>> {
    let runt = runtime(snap, query, opts, Arc::new(AllowAll))?;
    execute(runt).try_collect().await
}

pub async fn storm(snap: &Arc<MemorySnapshot>, query: &str) -> Result<Vec<Item>> {
    storm_opts(snap, query, QueryOptions::default()).await
}

/// `form=valu` for every item
pub fn names(items: &[Item]) -> Vec<String> {
    items
        .iter()
        .map(|(node, _)| format!("{}={}", node.form(), node.valu()))
        .collect()
}
