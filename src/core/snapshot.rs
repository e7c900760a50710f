// SPDX-License-Identifier: MIT

//! Storage snapshot contract
//!
//! The query core only ever talks to storage through [`Snapshot`]. Lookups
//! return [`NodeStream`]s, mutations are fallible with typed errors.

use async_trait::async_trait;
use std::sync::Arc;

use super::error::Result;
use super::model::DataModel;
use super::node::{Buid, Ival, Node, NodeStream};
use super::types::NormInfo;
use super::value::Value;

/// A verb edge as seen from one of its ends: `(verb, other end)`
pub type EdgeRef = (String, Buid);

#[async_trait]
pub trait Snapshot: Send + Sync {
    fn model(&self) -> &Arc<DataModel>;

    /// Normalize `valu` through the form type and look the node up
    async fn get_node_by_ndef(&self, form: &str, valu: &Value) -> Result<Option<Node>>;

    async fn get_node_by_buid(&self, buid: &Buid) -> Result<Option<Node>>;

    /// Every node of a form, or every node carrying a property
    async fn nodes_by_prop(&self, full: &str) -> Result<NodeStream>;

    async fn nodes_by_prop_valu(&self, full: &str, cmpr: &str, valu: &Value) -> Result<NodeStream>;

    /// Nodes whose array property has an element matching the comparison
    async fn nodes_by_prop_array(&self, full: &str, cmpr: &str, valu: &Value) -> Result<NodeStream>;

    async fn nodes_by_tag(&self, tag: &str, form: Option<&str>) -> Result<NodeStream>;

    async fn nodes_by_tag_valu(
        &self,
        tag: &str,
        cmpr: &str,
        valu: &Value,
        form: Option<&str>,
    ) -> Result<NodeStream>;

    async fn nodes_by_tag_prop(
        &self,
        form: Option<&str>,
        tag: &str,
        prop: &str,
        cmpr: Option<(&str, &Value)>,
    ) -> Result<NodeStream>;

    /// Add a node, or return the existing one
    async fn add_node(&self, form: &str, valu: &Value) -> Result<Node>;

    /// Set a relative property; returns whether it changed plus norm side derivations
    async fn set_prop(&self, node: &Node, prop: &str, valu: &Value) -> Result<(bool, NormInfo)>;

    async fn pop_prop(&self, node: &Node, prop: &str) -> Result<Option<Value>>;

    /// Set a tag (and its parents) with an already merged interval
    async fn add_tag(&self, node: &Node, tag: &str, ival: Option<Ival>) -> Result<()>;

    /// Remove a tag and every tag below it
    async fn del_tag(&self, node: &Node, tag: &str) -> Result<()>;

    async fn set_tag_prop(&self, node: &Node, tag: &str, prop: &str, valu: &Value) -> Result<()>;

    async fn del_tag_prop(&self, node: &Node, tag: &str, prop: &str) -> Result<()>;

    async fn add_edge(&self, n1: &Node, verb: &str, n2: &Buid) -> Result<()>;

    async fn del_edge(&self, n1: &Node, verb: &str, n2: &Buid) -> Result<()>;

    /// Outbound verb edges, optionally restricted to one verb
    async fn iter_edges_n1(&self, node: &Node, verb: Option<&str>) -> Result<Vec<EdgeRef>>;

    /// Inbound verb edges, optionally restricted to one verb
    async fn iter_edges_n2(&self, node: &Node, verb: Option<&str>) -> Result<Vec<EdgeRef>>;

    /// Set a property and recursively apply its sub-properties and implied nodes
    async fn set_prop_deep(&self, node: &Node, prop: &str, valu: &Value) -> Result<bool> {
        let (changed, info) = self.set_prop(node, prop, valu).await?;
        let form = self.model().form(node.form()).cloned();
        let pobj = form.as_ref().and_then(|form| form.prop(prop)).cloned();
        if let Some(pobj) = pobj.filter(|pobj| pobj.styp.is_form()) {
            if let Some(norm) = node.get(prop) {
                self.add_node(pobj.styp.name(), &norm).await?;
            }
        }
        for (sub, subv) in &info.subs {
            let full = format!("{}:{}", prop, sub);
            if form.as_ref().is_some_and(|form| form.prop(&full).is_some()) {
                self.set_prop_deep(node, &full, subv).await?;
            }
        }
        for ndef in &info.adds {
            if self.model().form(&ndef.form).is_some() {
                self.add_node(&ndef.form, &ndef.valu).await?;
            }
        }
        Ok(changed)
    }
}
