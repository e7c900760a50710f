// SPDX-License-Identifier: MIT

//! Query options and subgraph rules

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::ast::AstDoc;
use crate::core::error::Result;
use crate::core::value::Value;

fn default_glob_cache_size() -> usize {
    1000
}

fn default_spill_threshold() -> usize {
    10_000
}

fn default_degrees() -> Option<u32> {
    Some(1)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryOptions {
    /// Initial runtime variables
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    /// Seed nodes as `[form, valu]` pairs
    #[serde(default)]
    pub ndefs: Vec<Value>,
    /// Seed nodes by hex iden
    #[serde(default)]
    pub idens: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// `true` for default rules, or a rule map
    #[serde(default)]
    pub graph: Option<GraphOpt>,
    #[serde(default = "default_glob_cache_size")]
    pub glob_cache_size: usize,
    /// Entries a subgraph set keeps in memory before spilling to disk
    #[serde(default = "default_spill_threshold")]
    pub spill_threshold: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            vars: BTreeMap::new(),
            ndefs: Vec::new(),
            idens: Vec::new(),
            limit: None,
            graph: None,
            glob_cache_size: default_glob_cache_size(),
            spill_threshold: default_spill_threshold(),
        }
    }
}

impl QueryOptions {
    pub fn parse_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse_yaml(&content)
    }

    /// Subgraph rules when graph mode is requested
    pub fn graph_rules(&self) -> Option<GraphRules> {
        match &self.graph {
            Some(GraphOpt::Flag(true)) => Some(GraphRules::default()),
            Some(GraphOpt::Rules(rules)) => Some(rules.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum GraphOpt {
    Flag(bool),
    Rules(GraphRules),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormRules {
    #[serde(default)]
    pub filters: Vec<AstDoc>,
    #[serde(default)]
    pub pivots: Vec<AstDoc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphRules {
    /// Maximum distance from a seed, `None` for unbounded
    #[serde(default = "default_degrees")]
    pub degrees: Option<u32>,
    /// Follow declared property references, outbound and inbound
    #[serde(default)]
    pub refs: bool,
    /// Record stored verb edges in edge metadata
    #[serde(default = "default_true")]
    pub edges: bool,
    /// Apply the filters to seed nodes too
    #[serde(default = "default_true")]
    pub filterinput: bool,
    /// Still yield nodes the filters omit
    #[serde(default)]
    pub yieldfiltered: bool,
    #[serde(default)]
    pub filters: Vec<AstDoc>,
    #[serde(default)]
    pub pivots: Vec<AstDoc>,
    /// Per form (or `*`) filters and pivots
    #[serde(default)]
    pub forms: BTreeMap<String, FormRules>,
}

impl Default for GraphRules {
    fn default() -> Self {
        Self {
            degrees: default_degrees(),
            refs: false,
            edges: true,
            filterinput: true,
            yieldfiltered: false,
            filters: Vec::new(),
            pivots: Vec::new(),
            forms: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options() {
        let opts = QueryOptions::parse_yaml(
            r#"
vars:
  x: 10
ndefs:
  - ["inet:fqdn", "vertex.link"]
limit: 5
graph:
  degrees: null
  refs: true
  forms:
    "*":
      filters:
        - {type: query, kids: []}
"#,
        )
        .unwrap();
        assert_eq!(opts.vars.get("x"), Some(&Value::Int(10)));
        assert_eq!(opts.limit, Some(5));
        assert_eq!(opts.glob_cache_size, 1000);
        let rules = opts.graph_rules().unwrap();
        assert_eq!(rules.degrees, None);
        assert!(rules.refs);
        assert!(rules.edges);
        assert_eq!(rules.forms["*"].filters.len(), 1);
    }

    #[test]
    fn test_graph_flag() {
        let opts = QueryOptions::parse_yaml("graph: true").unwrap();
        let rules = opts.graph_rules().unwrap();
        assert_eq!(rules.degrees, Some(1));
        assert!(rules.filterinput);
        assert!(QueryOptions::parse_yaml("graph: false").unwrap().graph_rules().is_none());
        assert!(QueryOptions::default().graph_rules().is_none());
    }
}
