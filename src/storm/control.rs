// SPDX-License-Identifier: MIT

//! Control flow operators
//!
//! Loops, conditionals and functions run their bodies as nested operator
//! chains over the current item. `break`, `continue` and `return` travel
//! back up those chains as [`Signal`]s until a loop or function frame
//! catches them.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use super::ast::{AstId, AstKind};
use super::expr::{compute, eval, runtval};
use super::path::Path;
use super::pipeline::{run_query, unpack};
use super::runtime::Runtime;
use super::signal::{self, genr, node_genr, Genr, Item, Signal};
use crate::core::error::{Result, StormError};
use crate::core::node::NodeStream;
use crate::core::value::{Callable, NodeSource, Value};

/// Run `pass` for every inbound item, or once with no item when nothing arrives and `runtsafe`
fn each_item<F>(upstream: Genr, runtsafe: bool, pass: F) -> Genr
where
    F: Fn(Option<Item>) -> Genr + Send + Sync + 'static,
{
    genr(try_stream! {
        let mut count = 0usize;
        for await item in upstream {
            match item? {
                Signal::Item(item) => {
                    count += 1;
                    let mut results = pass(Some(item));
                    while let Some(sig) = results.next().await {
                        let sig = sig?;
                        let stop = !matches!(sig, Signal::Item(_));
                        yield sig;
                        if stop {
                            return;
                        }
                    }
                }
                other => {
                    yield other;
                    return;
                }
            }
        }
        if count == 0 && runtsafe {
            let mut results = pass(None);
            while let Some(sig) = results.next().await {
                let sig = sig?;
                let stop = !matches!(sig, Signal::Item(_));
                yield sig;
                if stop {
                    return;
                }
            }
        }
    })
}

fn path_of(item: &Option<Item>) -> Option<&Path> {
    item.as_ref().map(|(_, path)| path)
}

/// The body's input: the current item, or nothing
fn body_input(item: &Option<Item>) -> Genr {
    match item {
        Some(item) => signal::items(vec![item.clone()]),
        None => signal::empty(),
    }
}

/// One pass over a loop body; `break` re-emits its payload then surfaces as `Break(None)`
fn loop_body(runt: &Arc<Runtime>, body: AstId, item: &Option<Item>) -> Genr {
    let results = run_query(Arc::clone(runt), body, body_input(item));
    genr(try_stream! {
        for await sig in results {
            match sig? {
                Signal::Item(item) => yield Signal::Item(item),
                Signal::Continue(item) => {
                    if let Some(item) = item {
                        yield Signal::Item(item);
                    }
                    return;
                }
                Signal::Break(item) => {
                    if let Some(item) = item {
                        yield Signal::Item(item);
                    }
                    yield Signal::Break(None);
                    return;
                }
                ret => {
                    yield ret;
                    return;
                }
            }
        }
    })
}

/// Values a `for` loop walks over
fn iterate(valu: Value) -> Result<BoxStream<'static, Result<Value>>> {
    match valu {
        Value::List(items) => Ok(stream::iter(items.into_iter().map(Ok)).boxed()),
        Value::Dict(map) => Ok(stream::iter(
            map.into_iter()
                .map(|(key, valu)| Ok(Value::List(vec![Value::Str(key), valu]))),
        )
        .boxed()),
        Value::Gen(gen) => Ok(gen.nodes().map(|node| node.map(Value::Node)).boxed()),
        Value::Null => Ok(stream::empty().boxed()),
        other => Err(StormError::BadCast {
            valu: other.to_string(),
            target: "iterable".to_string(),
        }),
    }
}

/// `for $x in valu { ... }`
pub fn for_loop(runt: Arc<Runtime>, id: AstId, names: Vec<String>, upstream: Genr) -> Genr {
    let ast = Arc::clone(runt.ast());
    let (iterable, body) = match (ast.kid(id, 0), ast.kid(id, 1)) {
        (Ok(iterable), Ok(body)) => (iterable, body),
        (Err(err), _) | (_, Err(err)) => return signal::error(err),
    };
    let runtsafe = runt.is_runtsafe(iterable);
    each_item(upstream, runtsafe, move |item| {
        for_pass(Arc::clone(&runt), iterable, body, names.clone(), item)
    })
}

fn for_pass(runt: Arc<Runtime>, iterable: AstId, body: AstId, names: Vec<String>, item: Option<Item>) -> Genr {
    genr(try_stream! {
        let runtsafe = runt.is_runtsafe(iterable);
        let valu = eval(&runt, iterable, path_of(&item)).await?;
        let mut values = iterate(valu)?;
        while let Some(valu) = values.next().await {
            let valu = valu?;
            let binds = match names.as_slice() {
                [name] => vec![(name.clone(), valu)],
                _ => unpack(&names, valu.toprim())?,
            };
            for (name, valu) in binds {
                if runtsafe {
                    runt.set_var(name.clone(), valu.clone());
                }
                if let Some(path) = path_of(&item) {
                    path.set_var(name, valu);
                }
            }
            runt.tick()?;

            let mut stop = false;
            let mut results = loop_body(&runt, body, &item);
            while let Some(sig) = results.next().await {
                match sig? {
                    Signal::Item(item) => yield Signal::Item(item),
                    Signal::Break(_) => stop = true,
                    other => {
                        yield other;
                        return;
                    }
                }
            }
            tokio::task::yield_now().await;
            if stop {
                break;
            }
        }
    })
}

/// `while (cond) { ... }`
pub fn while_loop(runt: Arc<Runtime>, id: AstId, upstream: Genr) -> Genr {
    let ast = Arc::clone(runt.ast());
    let (cond, body) = match (ast.kid(id, 0), ast.kid(id, 1)) {
        (Ok(cond), Ok(body)) => (cond, body),
        (Err(err), _) | (_, Err(err)) => return signal::error(err),
    };
    let runtsafe = runt.is_runtsafe(cond);
    each_item(upstream, runtsafe, move |item| while_pass(Arc::clone(&runt), cond, body, item))
}

fn while_pass(runt: Arc<Runtime>, cond: AstId, body: AstId, item: Option<Item>) -> Genr {
    genr(try_stream! {
        loop {
            if !eval(&runt, cond, path_of(&item)).await?.tobool() {
                break;
            }
            runt.tick()?;

            let mut stop = false;
            let mut results = loop_body(&runt, body, &item);
            while let Some(sig) = results.next().await {
                match sig? {
                    Signal::Item(item) => yield Signal::Item(item),
                    Signal::Break(_) => stop = true,
                    other => {
                        yield other;
                        return;
                    }
                }
            }
            tokio::task::yield_now().await;
            if stop {
                break;
            }
        }
    })
}

/// A branch chosen once for every item, filled in on first use
type Choice = Arc<Mutex<Option<Option<AstId>>>>;

/// Run the chosen branch inline over the item; with no branch the item passes through
fn branch_pass(runt: Arc<Runtime>, branch: Option<AstId>, item: Option<Item>) -> Genr {
    match branch {
        Some(body) => run_query(runt, body, body_input(&item)),
        None => match item {
            Some(item) => signal::items(vec![item]),
            None => signal::empty(),
        },
    }
}

/// Resolve a branch, consulting and filling the shared choice when every condition is runtsafe
fn choose_pass<C, Fut>(runt: Arc<Runtime>, choice: Option<Choice>, item: Option<Item>, choose: C) -> Genr
where
    C: FnOnce(Arc<Runtime>, Option<Path>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<Option<AstId>>> + Send + 'static,
{
    genr(try_stream! {
        let cached = choice.as_ref().and_then(|choice| *choice.lock());
        let branch = match cached {
            Some(branch) => branch,
            None => {
                let path = if choice.is_some() { None } else { path_of(&item).cloned() };
                let branch = choose(Arc::clone(&runt), path).await?;
                if let Some(choice) = &choice {
                    *choice.lock() = Some(branch);
                }
                branch
            }
        };
        for await sig in branch_pass(runt, branch, item) {
            yield sig?;
        }
    })
}

/// `if (cond) { ... } elif (cond) { ... } else { ... }`
pub fn if_stmt(runt: Arc<Runtime>, id: AstId, upstream: Genr) -> Genr {
    let ast = Arc::clone(runt.ast());
    let mut clauses: Vec<(AstId, AstId)> = Vec::new();
    let mut default = None;
    for &kid in ast.kids(id) {
        match (ast.kind(kid), ast.kids(kid)) {
            (AstKind::IfClause, [cond, body, ..]) => clauses.push((*cond, *body)),
            _ => default = Some(kid),
        }
    }
    let runtsafe = clauses.iter().all(|(cond, _)| runt.is_runtsafe(*cond));
    let choice: Option<Choice> = runtsafe.then(Choice::default);
    let clauses = Arc::new(clauses);
    log::debug!("If statement with {} clauses, runtsafe: {}", clauses.len(), runtsafe);

    each_item(upstream, runtsafe, move |item| {
        let clauses = Arc::clone(&clauses);
        choose_pass(Arc::clone(&runt), choice.clone(), item, move |runt, path| async move {
            for (cond, body) in clauses.iter() {
                if eval(&runt, *cond, path.as_ref()).await?.tobool() {
                    return Ok(Some(*body));
                }
            }
            Ok(default)
        })
    })
}

/// `switch $valu { "a": { ... } *: { ... } }`
pub fn switch_case(runt: Arc<Runtime>, id: AstId, upstream: Genr) -> Genr {
    let ast = Arc::clone(runt.ast());
    let valu = match ast.kid(id, 0) {
        Ok(valu) => valu,
        Err(err) => return signal::error(err),
    };
    let mut cases: Vec<(String, AstId)> = Vec::new();
    let mut default = None;
    for &entry in ast.kids(id).iter().skip(1) {
        let (AstKind::CaseEntry { value }, Some(&body)) = (ast.kind(entry), ast.kids(entry).last()) else {
            continue;
        };
        match value {
            Some(value) => cases.push((value.clone(), body)),
            None => default = Some(body),
        }
    }
    let runtsafe = runt.is_runtsafe(valu);
    let choice: Option<Choice> = runtsafe.then(Choice::default);
    let cases = Arc::new(cases);

    each_item(upstream, runtsafe, move |item| {
        let cases = Arc::clone(&cases);
        choose_pass(Arc::clone(&runt), choice.clone(), item, move |runt, path| async move {
            let key = match eval(&runt, valu, path.as_ref()).await?.toprim() {
                Value::Null => None,
                other => Some(other.tostr()?),
            };
            let branch = key.and_then(|key| {
                cases
                    .iter()
                    .find(|(value, _)| *value == key)
                    .map(|(_, body)| *body)
            });
            Ok(branch.or(default))
        })
    })
}

/// A Storm function bound to the runtime that defined it
struct StormFunc {
    name: String,
    params: Vec<String>,
    body: AstId,
    has_return: bool,
    runt: Weak<Runtime>,
}

impl fmt::Debug for StormFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function {}({})", self.name, self.params.join(", "))
    }
}

impl StormFunc {
    fn runtime(&self) -> Result<Arc<Runtime>> {
        self.runt
            .upgrade()
            .ok_or_else(|| StormError::runtime(format!("function {} outlived its query", self.name)))
    }

    /// Bind positional arguments then keyword arguments to parameter names
    fn bind_args(&self, args: Vec<Value>, mut kwargs: BTreeMap<String, Value>) -> Result<HashMap<String, Value>> {
        let bad = |mesg: String| StormError::BadArgs {
            name: self.name.clone(),
            mesg,
        };
        if args.len() > self.params.len() {
            return Err(bad(format!(
                "takes {} arguments, {} given",
                self.params.len(),
                args.len()
            )));
        }
        let mut args = args.into_iter();
        let mut vars = HashMap::new();
        for param in &self.params {
            let valu = match args.next() {
                Some(valu) => valu,
                None => kwargs
                    .remove(param)
                    .ok_or_else(|| bad(format!("missing argument {}", param)))?,
            };
            vars.insert(param.clone(), valu);
        }
        if let Some(name) = kwargs.keys().next() {
            return Err(bad(format!("unexpected keyword argument {}", name)));
        }
        Ok(vars)
    }
}

#[async_trait]
impl Callable for StormFunc {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value> {
        let vars = self.bind_args(args, kwargs)?;
        let runt = self.runtime()?;
        log::debug!("Calling function {} in runtime {}", self.name, runt.iden());
        if !self.has_return {
            return Ok(Value::Gen(Arc::new(FuncGen {
                name: self.name.clone(),
                params: self.params.clone(),
                body: self.body,
                vars,
                runt: self.runt.clone(),
            })));
        }

        let subr = runt.sub_runtime(self.body, vars);
        let mut results = run_query(subr, self.body, signal::empty());
        while let Some(sig) = results.next().await {
            if let Signal::Return(valu) = sig? {
                return Ok(valu);
            }
            tokio::task::yield_now().await;
        }
        Ok(Value::Null)
    }
}

/// The nodes a generator function produces; each iteration runs the body afresh
struct FuncGen {
    name: String,
    params: Vec<String>,
    body: AstId,
    vars: HashMap<String, Value>,
    runt: Weak<Runtime>,
}

impl fmt::Debug for FuncGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "generator {}", self.name)
    }
}

impl NodeSource for FuncGen {
    fn nodes(&self) -> NodeStream {
        let runt = self.runt.clone();
        let name = self.name.clone();
        let params = self.params.clone();
        let body = self.body;
        let vars = self.vars.clone();
        node_genr(try_stream! {
            let runt = runt
                .upgrade()
                .ok_or_else(|| StormError::runtime(format!("function {} outlived its query", name)))?;
            let subr = runt.sub_runtime(body, vars);
            let results = run_query(Arc::clone(&subr), body, signal::empty());
            for await sig in results {
                match sig? {
                    Signal::Item((node, _)) => {
                        for (name, valu) in subr.vars() {
                            if !params.contains(&name) && runt.get_var(&name, None).is_ok() {
                                runt.set_var(name, valu);
                            }
                        }
                        yield node;
                    }
                    _ => return,
                }
            }
        })
    }
}

/// `function name(params) { ... }`; bound before the query runs, then on every item's path
pub fn function(runt: Arc<Runtime>, id: AstId, upstream: Genr) -> Genr {
    let ast = Arc::clone(runt.ast());
    let (name, params, has_return) = match ast.kind(id) {
        AstKind::Function {
            name,
            params,
            has_return,
        } => (name.clone(), params.clone(), *has_return),
        other => {
            return signal::error(StormError::runtime(format!("{} is not a function", other.name())));
        }
    };
    let body = match ast.kid(id, 0) {
        Ok(body) => body,
        Err(err) => return signal::error(err),
    };
    let func = Value::Func(Arc::new(StormFunc {
        name: name.clone(),
        params,
        body,
        has_return,
        runt: runt.weak(),
    }));
    runt.set_var(name.clone(), func.clone());

    genr(try_stream! {
        for await item in upstream {
            match item? {
                Signal::Item((node, path)) => {
                    path.set_var(name.clone(), func.clone());
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

/// `return(valu)`
pub fn return_oper(runt: Arc<Runtime>, id: AstId, upstream: Genr) -> Genr {
    genr(try_stream! {
        let kid = runt.ast().opt_kid(id, 0);
        for await item in upstream {
            match item? {
                Signal::Item((_, path)) => {
                    let valu = match kid {
                        Some(kid) => compute(&runt, kid, &path).await?,
                        None => Value::Null,
                    };
                    yield Signal::Return(valu);
                    return;
                }
                other => {
                    yield other;
                    return;
                }
            }
        }
        if kid.map_or(true, |kid| runt.is_runtsafe(kid)) {
            let valu = match kid {
                Some(kid) => runtval(&runt, kid).await?,
                None => Value::Null,
            };
            yield Signal::Return(valu);
        }
    })
}

/// `break` and `continue`
pub fn loop_oper(runt: Arc<Runtime>, id: AstId, upstream: Genr) -> Genr {
    let brk = matches!(runt.ast().kind(id), AstKind::BreakOper);
    let raise = move |item: Option<Item>| if brk { Signal::Break(item) } else { Signal::Continue(item) };
    genr(try_stream! {
        for await item in upstream {
            match item? {
                Signal::Item(item) => {
                    let sig = raise(Some(item));
                    yield sig;
                    return;
                }
                other => {
                    yield other;
                    return;
                }
            }
        }
        let sig = raise(None);
        yield sig;
    })
}

#[cfg(test)]
mod tests {
    use crate::core::error::StormError;
    use crate::core::value::Value;
    use crate::storm::testutil::{fixture_snapshot, names, storm};

    const GRAPH: &str = r#"
nodes:
  - form: test:str
    valu: a
    props: {hehe: haha}
  - form: test:str
    valu: b
"#;

    const LIFT_STR: &str = "{type: lift_prop, prop: 'test:str'}";

    #[tokio::test]
    async fn test_for_loop_runtsafe() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = r#"
type: query
kids:
  - type: for_loop
    names: [x]
    kids:
      - {type: list, kids: [{type: const, valu: x}, {type: const, valu: y}]}
      - type: sub_query
        kids:
          - {type: edit_node_add, form: "test:str", kids: [{type: var_value, name: x}]}
"#;
        let items = storm(&snap, query).await.unwrap();
        assert_eq!(names(&items), vec!["test:str=x", "test:str=y"]);
    }

    #[tokio::test]
    async fn test_for_loop_arity() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = r#"
type: query
kids:
  - type: for_loop
    names: [a, b]
    kids:
      - {type: const, valu: [[1, 2], [3]]}
      - type: sub_query
        kids:
          - {type: edit_node_add, form: "test:int", kids: [{type: var_value, name: b}]}
"#;
        let err = storm(&snap, query).await.unwrap_err();
        assert!(matches!(err, StormError::VarListArity { expected: 2, got: 1 }));
        let nodes = snap.nodes();
        assert!(nodes.iter().any(|node| node.form() == "test:int" && *node.valu() == Value::Int(2)));
    }

    fn break_query(oper: &str) -> String {
        format!(
            r#"
type: query
kids:
  - {{type: lift_prop_by, prop: "test:str", cmpr: "=", kids: [{{type: const, valu: a}}]}}
  - type: for_loop
    names: [x]
    kids:
      - {{type: list, kids: [{{type: const, valu: 1}}, {{type: const, valu: 2}}, {{type: const, valu: 3}}]}}
      - type: sub_query
        kids:
          - type: if_stmt
            kids:
              - type: if_clause
                kids:
                  - {{type: expr_node, oper: "=", kids: [{{type: var_value, name: x}}, {{type: const, valu: 2}}]}}
                  - {{type: sub_query, kids: [{{type: {}}}]}}
"#,
            oper
        )
    }

    #[tokio::test]
    async fn test_break_and_continue() {
        let snap = fixture_snapshot(GRAPH).await;
        let items = storm(&snap, &break_query("break_oper")).await.unwrap();
        assert_eq!(names(&items), vec!["test:str=a", "test:str=a"]);

        let items = storm(&snap, &break_query("continue_oper")).await.unwrap();
        assert_eq!(names(&items), vec!["test:str=a", "test:str=a", "test:str=a"]);
    }

    #[tokio::test]
    async fn test_while_loop() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = r#"
type: query
kids:
  - {type: set_var_oper, name: i, kids: [{type: const, valu: 0}]}
  - type: while_loop
    kids:
      - {type: expr_node, oper: "<", kids: [{type: var_value, name: i}, {type: const, valu: 3}]}
      - type: sub_query
        kids:
          - type: set_var_oper
            name: i
            kids: [{type: expr_node, oper: "+", kids: [{type: var_value, name: i}, {type: const, valu: 1}]}]
          - {type: edit_node_add, form: "test:int", kids: [{type: var_value, name: i}]}
"#;
        let items = storm(&snap, query).await.unwrap();
        assert_eq!(names(&items), vec!["test:int=1", "test:int=2", "test:int=3"]);
    }

    #[tokio::test]
    async fn test_if_else_per_node() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = format!(
            r#"
type: query
kids:
  - {}
  - type: if_stmt
    kids:
      - type: if_clause
        kids:
          - {{type: expr_node, oper: "=", kids: [{{type: rel_prop_value, prop: hehe}}, {{type: const, valu: haha}}]}}
          - {{type: sub_query, kids: [{{type: edit_tag_add, kids: [{{type: const, valu: yes}}]}}]}}
      - {{type: sub_query, kids: [{{type: edit_tag_add, kids: [{{type: const, valu: no}}]}}]}}
"#,
            LIFT_STR
        );
        let items = storm(&snap, &query).await.unwrap();
        assert_eq!(names(&items), vec!["test:str=a", "test:str=b"]);
        assert!(items[0].0.has_tag("yes"));
        assert!(items[1].0.has_tag("no"));
        assert!(!items[1].0.has_tag("yes"));
    }

    #[tokio::test]
    async fn test_if_without_match_passes_node() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = format!(
            r#"
type: query
kids:
  - {}
  - type: if_stmt
    kids:
      - type: if_clause
        kids:
          - {{type: const, valu: 0}}
          - {{type: sub_query, kids: [{{type: edit_tag_add, kids: [{{type: const, valu: newp}}]}}]}}
"#,
            LIFT_STR
        );
        let items = storm(&snap, &query).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|(node, _)| !node.has_tag("newp")));
    }

    #[tokio::test]
    async fn test_switch_case() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = format!(
            r#"
type: query
kids:
  - {}
  - type: switch_case
    kids:
      - {{type: rel_prop_value, prop: hehe}}
      - type: case_entry
        value: haha
        kids: [{{type: sub_query, kids: [{{type: edit_tag_add, kids: [{{type: const, valu: funny}}]}}]}}]
      - type: case_entry
        kids: [{{type: sub_query, kids: [{{type: edit_tag_add, kids: [{{type: const, valu: other}}]}}]}}]
"#,
            LIFT_STR
        );
        let items = storm(&snap, &query).await.unwrap();
        assert!(items[0].0.has_tag("funny"));
        assert!(items[1].0.has_tag("other"));
    }

    const ADD_FUNC: &str = r#"
  - type: function
    name: add
    params: [a, b]
    kids:
      - type: sub_query
        kids:
          - type: return
            kids: [{type: expr_node, oper: "+", kids: [{type: var_value, name: a}, {type: var_value, name: b}]}]
"#;

    #[tokio::test]
    async fn test_function_return() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = format!(
            r#"
type: query
kids:
{}
  - type: set_var_oper
    name: x
    kids:
      - type: func_call
        kids:
          - {{type: var_value, name: add}}
          - {{type: call_args, kids: [{{type: const, valu: 1}}]}}
          - {{type: call_kwargs, kids: [{{type: call_kwarg, name: b, kids: [{{type: const, valu: 2}}]}}]}}
  - {{type: edit_node_add, form: "test:int", kids: [{{type: var_value, name: x}}]}}
"#,
            ADD_FUNC
        );
        let items = storm(&snap, &query).await.unwrap();
        assert_eq!(names(&items), vec!["test:int=3"]);
    }

    #[tokio::test]
    async fn test_function_bad_args() {
        let snap = fixture_snapshot(GRAPH).await;
        for args in [
            "{type: call_args, kids: [{type: const, valu: 1}, {type: const, valu: 2}, {type: const, valu: 3}]}",
            "{type: call_kwargs, kids: [{type: call_kwarg, name: c, kids: [{type: const, valu: 2}]}]}",
        ] {
            let query = format!(
                r#"
type: query
kids:
{}
  - type: var_eval_oper
    kids:
      - type: func_call
        kids:
          - {{type: var_value, name: add}}
          - {}
"#,
                ADD_FUNC, args
            );
            let err = storm(&snap, &query).await.unwrap_err();
            assert!(matches!(err, StormError::BadArgs { .. }), "{}", err);
        }
    }

    #[tokio::test]
    async fn test_generator_function() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = r#"
type: query
kids:
  - {type: set_var_oper, name: total, kids: [{type: const, valu: 0}]}
  - type: function
    name: gen
    kids:
      - type: sub_query
        kids:
          - {type: lift_prop, prop: "test:str"}
          - {type: edit_tag_add, kids: [{type: const, valu: gen}]}
          - type: set_var_oper
            name: total
            kids: [{type: expr_node, oper: "+", kids: [{type: var_value, name: total}, {type: const, valu: 1}]}]
  - type: for_loop
    names: [n]
    kids:
      - {type: func_call, kids: [{type: var_value, name: gen}]}
      - {type: sub_query}
  - {type: edit_node_add, form: "test:int", kids: [{type: var_value, name: total}]}
"#;
        let items = storm(&snap, query).await.unwrap();
        assert_eq!(names(&items), vec!["test:int=2"]);
        let tagged = snap.nodes().into_iter().filter(|node| node.has_tag("gen")).count();
        assert_eq!(tagged, 2);
    }

    #[tokio::test]
    async fn test_stray_return_ends_query() {
        let snap = fixture_snapshot(GRAPH).await;
        let query = format!(
            "{{type: query, kids: [{}, {{type: return}}, {{type: edit_tag_add, kids: [{{type: const, valu: newp}}]}}]}}",
            LIFT_STR
        );
        let items = storm(&snap, &query).await.unwrap();
        assert!(items.is_empty());
        assert!(snap.nodes().iter().all(|node| !node.has_tag("newp")));
    }
}
