// SPDX-License-Identifier: MIT

//! Conditions and filter operators
//!
//! A condition AST node compiles into a [`CondEval`] once per operator.
//! Right hand sides that are runtime safe are computed on first use and
//! reused, along with the comparator built from them.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::ast::{AstId, AstKind};
use super::expr::{compute, runtval, tag_name};
use super::path::Path;
use super::pipeline::run_query;
use super::runtime::Runtime;
use super::signal::{self, genr, Genr, Signal};
use crate::core::error::{Result, StormError};
use crate::core::node::{norm_tag, Node};
use crate::core::types::{Cmpr, StormType};
use crate::core::value::Value;

/// Compile a tag glob: `*` matches one segment, `**` any number of them
pub fn glob_regex(glob: &str) -> Option<Regex> {
    let body = glob
        .split("**")
        .map(|part| part.split('*').map(regex::escape).collect::<Vec<_>>().join("[^.]+"))
        .collect::<Vec<_>>()
        .join(".+");
    Regex::new(&format!("^{}$", body)).ok()
}

/// Bounded caches of compiled globs and of their answers
pub struct GlobCache {
    regexes: LruCache<String, Option<Regex>>,
    answers: LruCache<(String, String), bool>,
}

impl GlobCache {
    pub fn new(size: usize) -> Self {
        let size = NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN);
        Self {
            regexes: LruCache::new(size),
            answers: LruCache::new(size),
        }
    }

    pub fn is_match(&mut self, glob: &str, name: &str) -> bool {
        let key = (glob.to_string(), name.to_string());
        if let Some(answ) = self.answers.get(&key) {
            return *answ;
        }
        if !self.regexes.contains(glob) {
            self.regexes.put(glob.to_string(), glob_regex(glob));
        }
        let answ = self
            .regexes
            .get(glob)
            .and_then(Option::as_ref)
            .is_some_and(|regex| regex.is_match(name));
        self.answers.put(key, answ);
        answ
    }
}

#[async_trait]
pub trait CondEval: Send + Sync {
    async fn eval(&self, node: &Node, path: &Path) -> Result<bool>;
}

/// A right hand side value, computed once when runtime safe
struct Rhs {
    runt: Arc<Runtime>,
    id: AstId,
    safe: bool,
    cache: OnceCell<Value>,
}

impl Rhs {
    fn new(runt: &Arc<Runtime>, id: AstId) -> Self {
        Self {
            runt: Arc::clone(runt),
            id,
            safe: runt.is_runtsafe(id),
            cache: OnceCell::new(),
        }
    }

    async fn get(&self, path: &Path) -> Result<Value> {
        if self.safe {
            let valu = self.cache.get_or_try_init(|| runtval(&self.runt, self.id)).await?;
            return Ok(valu.clone());
        }
        compute(&self.runt, self.id, path).await
    }
}

/// A comparison against a right hand side, with comparators cached per key when runtime safe
struct Compare {
    cmpr: String,
    rhs: Rhs,
    cache: Mutex<HashMap<String, Cmpr>>,
}

impl Compare {
    fn new(runt: &Arc<Runtime>, cmpr: &str, id: AstId) -> Self {
        Self {
            cmpr: cmpr.to_string(),
            rhs: Rhs::new(runt, id),
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn test(&self, styp: &Arc<StormType>, key: &str, lhs: &Value, path: &Path) -> Result<bool> {
        if self.rhs.safe {
            let cached = self.cache.lock().get(key).cloned();
            if let Some(test) = cached {
                return Ok(test(lhs));
            }
        }
        let ctor = styp.get_cmpr_ctor(&self.cmpr).ok_or_else(|| StormError::NoSuchCmpr {
            cmpr: self.cmpr.clone(),
            name: styp.name().to_string(),
        })?;
        let test = ctor(&self.rhs.get(path).await?)?;
        if self.rhs.safe {
            self.cache.lock().insert(key.to_string(), Arc::clone(&test));
        }
        Ok(test(lhs))
    }
}

struct AndEval(Arc<dyn CondEval>, Arc<dyn CondEval>);

#[async_trait]
impl CondEval for AndEval {
    async fn eval(&self, node: &Node, path: &Path) -> Result<bool> {
        Ok(self.0.eval(node, path).await? && self.1.eval(node, path).await?)
    }
}

struct OrEval(Arc<dyn CondEval>, Arc<dyn CondEval>);

#[async_trait]
impl CondEval for OrEval {
    async fn eval(&self, node: &Node, path: &Path) -> Result<bool> {
        Ok(self.0.eval(node, path).await? || self.1.eval(node, path).await?)
    }
}

struct NotEval(Arc<dyn CondEval>);

#[async_trait]
impl CondEval for NotEval {
    async fn eval(&self, node: &Node, path: &Path) -> Result<bool> {
        Ok(!self.0.eval(node, path).await?)
    }
}

struct TagEval {
    runt: Arc<Runtime>,
    name: Rhs,
}

#[async_trait]
impl CondEval for TagEval {
    async fn eval(&self, node: &Node, path: &Path) -> Result<bool> {
        let name = self.name.get(path).await?.tostr()?;
        if name.contains('*') {
            let glob = name.trim_start_matches('#').to_lowercase();
            return Ok(node
                .tag_names()
                .iter()
                .any(|tag| self.runt.glob_match(&glob, tag)));
        }
        Ok(node.has_tag(&norm_tag(&name)?))
    }
}

struct HasRelPropEval {
    prop: String,
}

#[async_trait]
impl CondEval for HasRelPropEval {
    async fn eval(&self, node: &Node, _path: &Path) -> Result<bool> {
        Ok(node.has(&self.prop))
    }
}

struct HasAbsPropEval {
    runt: Arc<Runtime>,
    prop: String,
}

#[async_trait]
impl CondEval for HasAbsPropEval {
    async fn eval(&self, node: &Node, _path: &Path) -> Result<bool> {
        let model = self.runt.snap().model();
        if model.form(&self.prop).is_some() {
            return Ok(node.form() == self.prop);
        }
        let pobj = model
            .prop(&self.prop)
            .ok_or_else(|| StormError::no_such_prop(self.prop.clone(), None))?;
        if pobj.form.as_deref().is_some_and(|form| form != node.form()) {
            return Ok(false);
        }
        Ok(node.has(&pobj.name))
    }
}

struct RelPropEval {
    runt: Arc<Runtime>,
    prop: String,
    cmp: Compare,
}

#[async_trait]
impl CondEval for RelPropEval {
    async fn eval(&self, node: &Node, path: &Path) -> Result<bool> {
        let Some(form) = self.runt.snap().model().form(node.form()).cloned() else {
            return Ok(false);
        };
        let Some(pobj) = form.prop(&self.prop) else {
            return Ok(false);
        };
        let Some(lhs) = node.get(&self.prop) else {
            return Ok(false);
        };
        self.cmp.test(&pobj.styp, &form.name, &lhs, path).await
    }
}

struct AbsPropEval {
    runt: Arc<Runtime>,
    prop: String,
    cmp: Compare,
}

#[async_trait]
impl CondEval for AbsPropEval {
    async fn eval(&self, node: &Node, path: &Path) -> Result<bool> {
        let model = Arc::clone(self.runt.snap().model());
        if let Some(form) = model.form(&self.prop) {
            if node.form() != form.name {
                return Ok(false);
            }
            return self.cmp.test(&form.styp, &form.name, node.valu(), path).await;
        }
        let pobj = model
            .prop(&self.prop)
            .ok_or_else(|| StormError::no_such_prop(self.prop.clone(), None))?;
        if pobj.form.as_deref().is_some_and(|form| form != node.form()) {
            return Ok(false);
        }
        let Some(lhs) = node.get(&pobj.name) else {
            return Ok(false);
        };
        self.cmp.test(&pobj.styp, &pobj.full, &lhs, path).await
    }
}

struct TagValuEval {
    runt: Arc<Runtime>,
    tag: AstId,
    cmp: Compare,
}

#[async_trait]
impl CondEval for TagValuEval {
    async fn eval(&self, node: &Node, path: &Path) -> Result<bool> {
        let tag = tag_name(&self.runt, self.tag, Some(path)).await?;
        let Some(Some((min, max))) = node.tag(&tag) else {
            return Ok(false);
        };
        let ival = self
            .runt
            .snap()
            .model()
            .univ(".seen")
            .map(|prop| Arc::clone(&prop.styp))
            .ok_or_else(|| StormError::runtime("model has no interval type"))?;
        let lhs = Value::List(vec![Value::Int(min), Value::Int(max)]);
        self.cmp.test(&ival, "ival", &lhs, path).await
    }
}

struct TagPropEval {
    runt: Arc<Runtime>,
    tag: AstId,
    prop: String,
    cmp: Compare,
}

#[async_trait]
impl CondEval for TagPropEval {
    async fn eval(&self, node: &Node, path: &Path) -> Result<bool> {
        let tprop = self
            .runt
            .snap()
            .model()
            .tagprop(&self.prop)
            .cloned()
            .ok_or_else(|| StormError::NoSuchTagProp {
                name: self.prop.clone(),
            })?;
        let tag = tag_name(&self.runt, self.tag, Some(path)).await?;
        let Some(lhs) = node.tagprop(&tag, &self.prop) else {
            return Ok(false);
        };
        self.cmp.test(&tprop.styp, &self.prop, &lhs, path).await
    }
}

struct ArrayEval {
    runt: Arc<Runtime>,
    prop: String,
    cmp: Compare,
}

#[async_trait]
impl CondEval for ArrayEval {
    async fn eval(&self, node: &Node, path: &Path) -> Result<bool> {
        let Some(form) = self.runt.snap().model().form(node.form()).cloned() else {
            return Ok(false);
        };
        let Some(pobj) = form.prop(&self.prop) else {
            return Ok(false);
        };
        let elem = pobj.styp.elem().cloned().ok_or_else(|| StormError::BadCmprType {
            cmpr: self.cmp.cmpr.clone(),
            mesg: format!("array filter syntax is invalid for non-array prop {}", pobj.full),
        })?;
        let Some(Value::List(items)) = node.get(&self.prop) else {
            return Ok(false);
        };
        for item in &items {
            if self.cmp.test(&elem, &pobj.full, item, path).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Counts subquery results, stopping as soon as the answer is known
struct SubqEval {
    runt: Arc<Runtime>,
    query: AstId,
    cmpr: Option<(String, Rhs)>,
}

impl SubqEval {
    /// The answer once `size` results have been seen, if it can no longer change
    fn early(cmpr: &str, size: i64, valu: i64) -> Option<bool> {
        match cmpr {
            "=" | "<=" if size > valu => Some(false),
            ">" | "!=" if size > valu => Some(true),
            "<" if size >= valu => Some(false),
            ">=" if size >= valu => Some(true),
            _ => None,
        }
    }

    fn last(cmpr: &str, size: i64, valu: i64) -> Result<bool> {
        Ok(match cmpr {
            "=" => size == valu,
            "!=" => size != valu,
            ">" => size > valu,
            "<" => size < valu,
            ">=" => size >= valu,
            "<=" => size <= valu,
            other => {
                return Err(StormError::NoSuchCmpr {
                    cmpr: other.to_string(),
                    name: "subquery count".to_string(),
                })
            }
        })
    }
}

#[async_trait]
impl CondEval for SubqEval {
    async fn eval(&self, node: &Node, path: &Path) -> Result<bool> {
        let input = signal::items(vec![(node.clone(), path.clone())]);
        let mut results = run_query(Arc::clone(&self.runt), self.query, input);
        let Some((cmpr, rhs)) = &self.cmpr else {
            while let Some(sig) = results.next().await {
                if matches!(sig?, Signal::Item(_)) {
                    return Ok(true);
                }
            }
            return Ok(false);
        };
        let valu = rhs.get(path).await?.toint()?;
        let mut size = 0;
        while let Some(sig) = results.next().await {
            if !matches!(sig?, Signal::Item(_)) {
                continue;
            }
            size += 1;
            if let Some(answ) = Self::early(cmpr, size, valu) {
                return Ok(answ);
            }
        }
        Self::last(cmpr, size, valu)
    }
}

struct DollarEval {
    runt: Arc<Runtime>,
    valu: AstId,
}

#[async_trait]
impl CondEval for DollarEval {
    async fn eval(&self, _node: &Node, path: &Path) -> Result<bool> {
        Ok(compute(&self.runt, self.valu, path).await?.tobool())
    }
}

/// Build the evaluator for a condition node
pub fn get_cond_eval(runt: &Arc<Runtime>, id: AstId) -> Result<Arc<dyn CondEval>> {
    let ast = Arc::clone(runt.ast());
    let cond: Arc<dyn CondEval> = match ast.kind(id) {
        AstKind::AndCond => Arc::new(AndEval(
            get_cond_eval(runt, ast.kid(id, 0)?)?,
            get_cond_eval(runt, ast.kid(id, 1)?)?,
        )),
        AstKind::OrCond => Arc::new(OrEval(
            get_cond_eval(runt, ast.kid(id, 0)?)?,
            get_cond_eval(runt, ast.kid(id, 1)?)?,
        )),
        AstKind::NotCond => Arc::new(NotEval(get_cond_eval(runt, ast.kid(id, 0)?)?)),
        AstKind::TagCond => Arc::new(TagEval {
            runt: Arc::clone(runt),
            name: Rhs::new(runt, ast.kid(id, 0)?),
        }),
        AstKind::HasRelPropCond { prop } => Arc::new(HasRelPropEval { prop: prop.clone() }),
        AstKind::HasAbsPropCond { prop } => Arc::new(HasAbsPropEval {
            runt: Arc::clone(runt),
            prop: prop.clone(),
        }),
        AstKind::RelPropCond { prop, cmpr } => Arc::new(RelPropEval {
            runt: Arc::clone(runt),
            prop: prop.clone(),
            cmp: Compare::new(runt, cmpr, ast.kid(id, 0)?),
        }),
        AstKind::AbsPropCond { prop, cmpr } => Arc::new(AbsPropEval {
            runt: Arc::clone(runt),
            prop: prop.clone(),
            cmp: Compare::new(runt, cmpr, ast.kid(id, 0)?),
        }),
        AstKind::TagValuCond { cmpr } => Arc::new(TagValuEval {
            runt: Arc::clone(runt),
            tag: ast.kid(id, 0)?,
            cmp: Compare::new(runt, cmpr, ast.kid(id, 1)?),
        }),
        AstKind::TagPropCond { prop, cmpr } => Arc::new(TagPropEval {
            runt: Arc::clone(runt),
            tag: ast.kid(id, 0)?,
            prop: prop.clone(),
            cmp: Compare::new(runt, cmpr, ast.kid(id, 1)?),
        }),
        AstKind::ArrayCond { prop, cmpr } => Arc::new(ArrayEval {
            runt: Arc::clone(runt),
            prop: prop.clone(),
            cmp: Compare::new(runt, cmpr, ast.kid(id, 0)?),
        }),
        AstKind::SubqCond { cmpr } => {
            let query = ast.kid(id, 0)?;
            let cmpr = match cmpr {
                Some(cmpr) => {
                    SubqEval::last(cmpr, 0, 0)?;
                    Some((cmpr.clone(), Rhs::new(runt, ast.kid(id, 1)?)))
                }
                None => None,
            };
            Arc::new(SubqEval {
                runt: Arc::clone(runt),
                query,
                cmpr,
            })
        }
        AstKind::DollarCond => Arc::new(DollarEval {
            runt: Arc::clone(runt),
            valu: ast.kid(id, 0)?,
        }),
        // any other value is tested for truthiness
        _ => Arc::new(DollarEval {
            runt: Arc::clone(runt),
            valu: id,
        }),
    };
    Ok(cond)
}

/// `+cond` / `-cond`: keep the items whose answer matches the polarity
pub fn filt_oper(runt: Arc<Runtime>, id: AstId, upstream: Genr) -> Genr {
    genr(try_stream! {
        let include = matches!(runt.ast().kind(id), AstKind::FiltOper { include: true });
        let cond = get_cond_eval(&runt, runt.ast().kid(id, 0)?)?;
        for await item in upstream {
            match item? {
                Signal::Item((node, path)) => {
                    let answ = cond.eval(&node, &path).await?;
                    if include == answ {
                        yield Signal::Item((node, path));
                    } else {
                        tokio::task::yield_now().await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storm::testutil::{fixture_snapshot, names, storm};

    const GRAPH: &str = r#"
nodes:
  - form: test:str
    valu: a
    props: {hehe: haha, tick: 2020}
    tags: {foo.bar: ["2019", "2021"], baz: null}
    tagprops: {foo.bar: {score: 10}}
  - form: test:str
    valu: b
    props: {hehe: hoho}
    tags: {foo.qux: null}
  - form: test:str
    valu: c
  - form: test:arry
    valu: x
    props: {names: [a.com, b.com]}
"#;

    #[test]
    fn test_glob_regex() {
        let regex = glob_regex("foo.*").unwrap();
        assert!(regex.is_match("foo.bar"));
        assert!(!regex.is_match("foo.bar.baz"));
        assert!(!regex.is_match("foo"));
        let regex = glob_regex("foo.**").unwrap();
        assert!(regex.is_match("foo.bar.baz"));
        let regex = glob_regex("*.bar").unwrap();
        assert!(regex.is_match("foo.bar"));
        assert!(!regex.is_match("fooxbar"));

        let mut cache = GlobCache::new(2);
        assert!(cache.is_match("a.*", "a.b"));
        assert!(cache.is_match("a.*", "a.b"));
        assert!(!cache.is_match("a.*", "b.c"));
    }

    #[tokio::test]
    async fn test_filter_polarity() {
        let snap = fixture_snapshot(GRAPH).await;
        let lift = r#"{type: lift_prop, prop: "test:str"}"#;
        let cond = r#"{type: tag_cond, kids: [{type: const, valu: foo.bar}]}"#;
        let include = format!("{{type: query, kids: [{lift}, {{type: filt_oper, include: true, kids: [{cond}]}}]}}");
        let exclude = format!("{{type: query, kids: [{lift}, {{type: filt_oper, include: false, kids: [{cond}]}}]}}");
        let all = storm(&snap, &format!("{{type: query, kids: [{lift}]}}")).await.unwrap();
        let inc = storm(&snap, &include).await.unwrap();
        let exc = storm(&snap, &exclude).await.unwrap();
        assert_eq!(names(&inc), vec!["test:str=a"]);
        assert_eq!(names(&exc), vec!["test:str=b", "test:str=c"]);
        assert_eq!(inc.len() + exc.len(), all.len());
    }

    #[tokio::test]
    async fn test_conditions() {
        let snap = fixture_snapshot(GRAPH).await;
        let cases = [
            (r#"{type: tag_cond, kids: [{type: const, valu: "foo.*"}]}"#, vec!["test:str=a", "test:str=b"]),
            (r#"{type: has_rel_prop_cond, prop: hehe}"#, vec!["test:str=a", "test:str=b"]),
            (r#"{type: has_abs_prop_cond, prop: "test:str:tick"}"#, vec!["test:str=a"]),
            (
                r#"{type: rel_prop_cond, prop: hehe, cmpr: "^=", kids: [{type: const, valu: "ho"}]}"#,
                vec!["test:str=b"],
            ),
            (
                r#"{type: abs_prop_cond, prop: "test:str", cmpr: "in=", kids: [{type: const, valu: [a, c]}]}"#,
                vec!["test:str=a", "test:str=c"],
            ),
            (
                r#"{type: tag_valu_cond, cmpr: "@=", kids: [{type: const, valu: foo.bar}, {type: const, valu: "2020"}]}"#,
                vec!["test:str=a"],
            ),
            (
                r#"{type: tag_prop_cond, prop: score, cmpr: ">", kids: [{type: const, valu: foo.bar}, {type: const, valu: 5}]}"#,
                vec!["test:str=a"],
            ),
            (
                r#"{type: not_cond, kids: [{type: has_rel_prop_cond, prop: hehe}]}"#,
                vec!["test:str=c"],
            ),
            (
                r#"{type: or_cond, kids: [{type: tag_cond, kids: [{type: const, valu: baz}]}, {type: tag_cond, kids: [{type: const, valu: foo.qux}]}]}"#,
                vec!["test:str=a", "test:str=b"],
            ),
        ];
        for (cond, expected) in cases {
            let query = format!(
                r#"{{type: query, kids: [{{type: lift_prop, prop: "test:str"}}, {{type: filt_oper, include: true, kids: [{cond}]}}]}}"#
            );
            let items = storm(&snap, &query).await.unwrap();
            assert_eq!(names(&items), expected, "{}", cond);
        }
    }

    #[tokio::test]
    async fn test_array_and_bad_cmpr() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = r#"
type: query
kids:
  - {type: lift_prop, prop: "test:arry"}
  - type: filt_oper
    include: true
    kids:
      - {type: array_cond, prop: names, cmpr: "=", kids: [{type: const, valu: B.COM}]}
"#;
        assert_eq!(names(&storm(&snap, query).await.unwrap()), vec!["test:arry=x"]);

        let query = r#"
type: query
kids:
  - {type: lift_prop, prop: "test:str"}
  - type: filt_oper
    include: true
    kids:
      - {type: rel_prop_cond, prop: hehe, cmpr: "@=", kids: [{type: const, valu: x}]}
"#;
        assert!(matches!(storm(&snap, query).await, Err(StormError::NoSuchCmpr { .. })));
    }

    #[test]
    fn test_subquery_early_exit() {
        assert_eq!(SubqEval::early("=", 3, 2), Some(false));
        assert_eq!(SubqEval::early("=", 2, 2), None);
        assert_eq!(SubqEval::early(">", 3, 2), Some(true));
        assert_eq!(SubqEval::early("<", 2, 2), Some(false));
        assert_eq!(SubqEval::early(">=", 2, 2), Some(true));
        assert_eq!(SubqEval::early("<=", 3, 2), Some(false));
        assert_eq!(SubqEval::early("!=", 3, 2), Some(true));
        assert!(SubqEval::last("=", 2, 2).unwrap());
        assert!(SubqEval::last("<", 1, 2).unwrap());
        assert!(!SubqEval::last("!=", 2, 2).unwrap());
        assert!(SubqEval::last("~=", 0, 0).is_err());
    }

    #[tokio::test]
    async fn test_subquery_cond() {
        let snap = fixture_snapshot(GRAPH).await;
        // nodes with at least one tag
        let query = r#"
type: query
kids:
  - {type: lift_prop, prop: "test:str"}
  - type: filt_oper
    include: true
    kids:
      - type: subq_cond
        cmpr: ">="
        kids:
          - {type: sub_query, kids: [{type: pivot_to_tags, pattern: "*"}]}
          - {type: const, valu: 2}
"#;
        assert_eq!(names(&storm(&snap, query).await.unwrap()), vec!["test:str=a"]);

        let query = r#"
type: query
kids:
  - {type: lift_prop, prop: "test:str"}
  - type: filt_oper
    include: false
    kids:
      - type: subq_cond
        kids:
          - {type: sub_query, kids: [{type: pivot_to_tags}]}
"#;
        assert_eq!(names(&storm(&snap, query).await.unwrap()), vec!["test:str=c"]);
    }
}
