// SPDX-License-Identifier: MIT

//! Subgraph projection
//!
//! Expands the items of a query breadth first into the neighborhood a
//! graph view renders. Each emitted path carries `graph:seed` for original
//! inputs and `edges`, a list of `[iden, info]` pairs naming the nodes it
//! links to.

use async_stream::try_stream;
use futures::StreamExt;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;

use super::ast::AstDoc;
use super::doc::QueryLoader;
use super::opts::GraphRules;
use super::path::Path;
use super::pipeline::{item_stream, run_query, ItemStream};
use super::pivot::{refs_in, refs_out};
use super::runtime::Runtime;
use super::signal::{self, Item, Signal};
use super::spill::SpillSet;
use crate::core::error::Result;
use crate::core::node::{Buid, Node};
use crate::core::value::Value;

/// Rule queries compiled into runtimes of their own
#[derive(Default)]
struct RuleSet {
    filters: Vec<Arc<Runtime>>,
    pivots: Vec<Arc<Runtime>>,
}

struct SubGraph {
    runt: Arc<Runtime>,
    rules: GraphRules,
    global: RuleSet,
    forms: HashMap<String, RuleSet>,
    omits: Mutex<LruCache<Buid, bool>>,
}

fn compile(runt: &Runtime, docs: &[AstDoc]) -> Result<Vec<Arc<Runtime>>> {
    docs.iter()
        .map(|doc| {
            let ast = QueryLoader::compile(doc, runt.snap().model())?;
            runt.tree_runtime(Arc::new(ast))
        })
        .collect()
}

/// Run a rule query over one node on a fresh path
fn run_rule(rule: &Arc<Runtime>, node: &Node) -> signal::Genr {
    let input = signal::items(vec![(node.clone(), rule.init_path(node))]);
    run_query(Arc::clone(rule), rule.query(), input)
}

impl SubGraph {
    fn new(runt: Arc<Runtime>, rules: GraphRules) -> Result<Self> {
        let global = RuleSet {
            filters: compile(&runt, &rules.filters)?,
            pivots: compile(&runt, &rules.pivots)?,
        };
        let mut forms = HashMap::new();
        for (form, frules) in &rules.forms {
            let ruleset = RuleSet {
                filters: compile(&runt, &frules.filters)?,
                pivots: compile(&runt, &frules.pivots)?,
            };
            forms.insert(form.clone(), ruleset);
        }
        let size = NonZeroUsize::new(runt.opts().spill_threshold).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            runt,
            rules,
            global,
            forms,
            omits: Mutex::new(LruCache::new(size)),
        })
    }

    fn form_rules(&self, form: &str) -> Option<&RuleSet> {
        self.forms.get(form).or_else(|| self.forms.get("*"))
    }

    /// A filter query drops the node when it yields nothing for it
    async fn filtered(&self, rule: &Arc<Runtime>, node: &Node) -> Result<bool> {
        let mut results = run_rule(rule, node);
        match results.next().await {
            Some(sig) => Ok(!matches!(sig?, Signal::Item(_))),
            None => Ok(true),
        }
    }

    /// Whether the global or per form filters drop `node`
    async fn omit(&self, node: &Node) -> Result<bool> {
        let buid = node.buid();
        if let Some(answ) = self.omits.lock().get(&buid).copied() {
            return Ok(answ);
        }
        let mut answ = false;
        let form_filters = self.form_rules(node.form()).map(|rules| rules.filters.as_slice());
        for rule in self.global.filters.iter().chain(form_filters.unwrap_or_default()) {
            if self.filtered(rule, node).await? {
                answ = true;
                break;
            }
        }
        self.omits.lock().put(buid, answ);
        Ok(answ)
    }

    /// Every neighbor the rules reach from `node`
    async fn pivots(&self, node: &Node, path: &Path) -> Result<Vec<Item>> {
        let mut found = Vec::new();
        if self.rules.refs {
            let snap = Arc::clone(self.runt.snap());
            let mut refs = refs_out(Arc::clone(&snap), node.clone()).chain(refs_in(snap, node.clone()));
            while let Some(pivo) = refs.next().await {
                let pivo = pivo?;
                let ppath = path.fork(&pivo);
                found.push((pivo, ppath));
            }
        }
        let form_pivots = self.form_rules(node.form()).map(|rules| rules.pivots.as_slice());
        for rule in self.global.pivots.iter().chain(form_pivots.unwrap_or_default()) {
            let mut results = run_rule(rule, node);
            while let Some(sig) = results.next().await {
                match sig? {
                    Signal::Item(item) => found.push(item),
                    _ => break,
                }
            }
        }
        Ok(found)
    }
}

fn edge(iden: String, info: BTreeMap<String, Value>) -> Value {
    Value::List(vec![Value::Str(iden), Value::Dict(info)])
}

/// Project `items` into a subgraph according to `rules`
pub fn subgraph(runt: Arc<Runtime>, rules: GraphRules, items: ItemStream) -> ItemStream {
    item_stream(try_stream! {
        let threshold = runt.opts().spill_threshold;
        let graph = SubGraph::new(Arc::clone(&runt), rules)?;
        let mut done = SpillSet::new(threshold);
        let mut intodo = SpillSet::new(threshold);
        let mut todo: VecDeque<(Node, Path, u32)> = VecDeque::new();
        let mut seeds = items;
        let mut seeding = true;

        loop {
            let next = if seeding {
                match seeds.next().await {
                    Some(item) => {
                        let (node, path) = item?;
                        path.meta("graph:seed", Value::Bool(true));
                        Some((node, path, 0))
                    }
                    None => {
                        seeding = false;
                        todo.pop_front()
                    }
                }
            } else {
                todo.pop_front()
            };
            let Some((node, path, dist)) = next else {
                break;
            };

            let buid = node.buid();
            if done.contains(&buid)? {
                continue;
            }
            done.add(&buid)?;
            intodo.discard(&buid)?;
            runt.tick()?;

            let omitted = if dist > 0 || graph.rules.filterinput {
                graph.omit(&node).await?
            } else {
                false
            };

            // Past the degree bound only links to nodes already in the graph are kept
            let leaf = graph.rules.degrees.is_some_and(|degrees| dist >= degrees);
            let mut edges = Vec::new();
            for (pivo, ppath) in graph.pivots(&node, &path).await? {
                let pbuid = pivo.buid();
                let seen = done.contains(&pbuid)? || intodo.contains(&pbuid)?;
                if leaf && !seen {
                    continue;
                }
                edges.push(edge(pivo.iden(), BTreeMap::new()));
                if !seen {
                    intodo.add(&pbuid)?;
                    todo.push_back((pivo, ppath, dist + 1));
                }
            }
            if graph.rules.edges {
                for (verb, n2) in runt.snap().iter_edges_n1(&node, None).await? {
                    edges.push(edge(n2.hex(), BTreeMap::from([("verb".to_string(), Value::Str(verb))])));
                }
            }
            tokio::task::yield_now().await;

            if omitted && !graph.rules.yieldfiltered {
                log::debug!("Subgraph omits {}={}", node.form(), node.valu());
                continue;
            }
            path.meta("edges", Value::List(edges));
            yield (node, path);
        }
        log::debug!("Subgraph visited {} nodes", done.len());
    })
}

#[cfg(test)]
mod tests {
    use crate::core::snapshot::Snapshot;
    use crate::core::value::Value;
    use crate::storm::opts::QueryOptions;
    use crate::storm::testutil::{fixture_snapshot, names, storm_opts};

    const GRAPH: &str = r#"
nodes:
  - form: inet:dns:a
    valu: a1
    props: {fqdn: vertex.link, ipv4: 1}
  - form: inet:ipv4
    valu: 1
    tags: {bad: null}
  - form: test:str
    valu: s
    props: {ref: ["inet:dns:a", a1]}
edges:
  - {n1: ["test:str", s], verb: refs, n2: ["inet:ipv4", 1]}
"#;

    const LIFT_S: &str = r#"{type: query, kids: [{type: lift_prop_by, prop: "test:str", cmpr: "=", kids: [{type: const, valu: s}]}]}"#;

    fn opts(graph: &str) -> QueryOptions {
        QueryOptions::parse_yaml(&format!("graph: {}", graph)).unwrap()
    }

    #[tokio::test]
    async fn test_degree_bound() {
        let snap = fixture_snapshot(GRAPH).await;
        let items = storm_opts(&snap, LIFT_S, opts("{refs: true, degrees: 1}")).await.unwrap();
        assert_eq!(names(&items), vec!["test:str=s", "inet:dns:a=a1"]);
        assert_eq!(items[0].1.get_meta("graph:seed"), Some(Value::Bool(true)));
        assert!(items[1].1.get_meta("graph:seed").is_none());

        let items = storm_opts(&snap, LIFT_S, opts("{refs: true, degrees: 2}")).await.unwrap();
        assert_eq!(
            names(&items),
            vec!["test:str=s", "inet:dns:a=a1", "inet:fqdn=vertex.link", "inet:ipv4=1"]
        );

        let items = storm_opts(&snap, LIFT_S, opts("{refs: true, degrees: null}")).await.unwrap();
        assert_eq!(items.len(), 4);
    }

    #[tokio::test]
    async fn test_edge_metadata() {
        let snap = fixture_snapshot(GRAPH).await;
        let items = storm_opts(&snap, LIFT_S, opts("{refs: true}")).await.unwrap();
        let Some(Value::List(edges)) = items[0].1.get_meta("edges") else {
            panic!("no edges on the seed");
        };
        assert_eq!(edges.len(), 2);
        let Value::List(verb) = &edges[1] else {
            panic!("bad edge {}", edges[1]);
        };
        let ipv4 = snap
            .get_node_by_ndef("inet:ipv4", &Value::Int(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(verb[0], Value::str(ipv4.iden()));
        let Value::Dict(info) = &verb[1] else {
            panic!("bad edge info");
        };
        assert_eq!(info.get("verb"), Some(&Value::str("refs")));
    }

    #[tokio::test]
    async fn test_filters_and_pivot_rules() {
        let snap = fixture_snapshot(GRAPH).await;
        let rules = r#"
  refs: true
  degrees: null
  filters:
    - type: query
      kids:
        - type: filt_oper
          include: false
          kids: [{type: tag_cond, kids: [{type: const, valu: bad}]}]
"#;
        let items = storm_opts(&snap, LIFT_S, opts(rules)).await.unwrap();
        assert_eq!(
            names(&items),
            vec!["test:str=s", "inet:dns:a=a1", "inet:fqdn=vertex.link"]
        );

        let rules = r#"
  degrees: 1
  forms:
    "test:str":
      pivots:
        - {type: query, kids: [{type: n1_walk, kids: [{type: const, valu: "*"}]}]}
"#;
        let items = storm_opts(&snap, LIFT_S, opts(rules)).await.unwrap();
        assert_eq!(names(&items), vec!["test:str=s", "inet:ipv4=1"]);
    }

    #[tokio::test]
    async fn test_seed_filtering() {
        let snap = fixture_snapshot(GRAPH).await;
        let lift = r#"{type: query, kids: [{type: lift_prop, prop: "inet:ipv4"}]}"#;
        let rules = r#"
  filters:
    - {type: query, kids: [{type: filt_oper, include: false, kids: [{type: tag_cond, kids: [{type: const, valu: bad}]}]}]}
"#;
        let items = storm_opts(&snap, lift, opts(rules)).await.unwrap();
        assert!(items.is_empty());

        let rules = format!("{}  filterinput: false\n", rules);
        let items = storm_opts(&snap, lift, opts(&rules)).await.unwrap();
        assert_eq!(names(&items), vec!["inet:ipv4=1"]);

        let rules = r#"
  yieldfiltered: true
  filters:
    - {type: query, kids: [{type: filt_oper, include: false, kids: [{type: tag_cond, kids: [{type: const, valu: bad}]}]}]}
"#;
        let items = storm_opts(&snap, lift, opts(rules)).await.unwrap();
        assert_eq!(items.len(), 1);
    }
}
