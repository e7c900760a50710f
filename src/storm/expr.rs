// SPDX-License-Identifier: MIT

//! Value evaluation
//!
//! Every value-producing AST node evaluates through [`compute`] (with the
//! current path) or [`runtval`] (runtime scope only). Both share one
//! recursive evaluator; node-bound values fail when there is no node.

use futures::future::{BoxFuture, FutureExt};
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::ast::{AstId, AstKind};
use super::path::Path;
use super::runtime::Runtime;
use crate::core::error::{Result, StormError};
use crate::core::node::{norm_tag, Node};
use crate::core::value::{Derefable, Value};

pub type ExprFunc = fn(&Value, &Value) -> Result<Value>;
pub type UnaryFunc = fn(&Value) -> Result<Value>;

static BINARY_FUNCS: Lazy<HashMap<&'static str, ExprFunc>> = Lazy::new(|| {
    let mut funcs: HashMap<&'static str, ExprFunc> = HashMap::new();
    funcs.insert("+", |a, b| Ok(Value::Int(a.toint()?.wrapping_add(b.toint()?))));
    funcs.insert("-", |a, b| Ok(Value::Int(a.toint()?.wrapping_sub(b.toint()?))));
    funcs.insert("*", |a, b| Ok(Value::Int(a.toint()?.wrapping_mul(b.toint()?))));
    funcs.insert("/", |a, b| {
        let (a, b) = (a.toint()?, b.toint()?);
        a.checked_div(b)
            .map(Value::Int)
            .ok_or_else(|| StormError::runtime(format!("cannot divide {} by {}", a, b)))
    });
    funcs.insert("=", |a, b| Ok(Value::Bool(a.toprim() == b.toprim())));
    funcs.insert("!=", |a, b| Ok(Value::Bool(a.toprim() != b.toprim())));
    funcs.insert(">", |a, b| Ok(Value::Bool(a.toint()? > b.toint()?)));
    funcs.insert("<", |a, b| Ok(Value::Bool(a.toint()? < b.toint()?)));
    funcs.insert(">=", |a, b| Ok(Value::Bool(a.toint()? >= b.toint()?)));
    funcs.insert("<=", |a, b| Ok(Value::Bool(a.toint()? <= b.toint()?)));
    funcs.insert("and", |a, b| Ok(Value::Bool(a.tobool() && b.tobool())));
    funcs.insert("or", |a, b| Ok(Value::Bool(a.tobool() || b.tobool())));
    funcs
});

/// The function behind a binary operator
pub fn binary_func(oper: &str) -> Option<ExprFunc> {
    BINARY_FUNCS.get(oper).copied()
}

fn not(valu: &Value) -> Result<Value> {
    Ok(Value::Bool(!valu.tobool()))
}

fn neg(valu: &Value) -> Result<Value> {
    Ok(Value::Int(valu.toint()?.wrapping_neg()))
}

/// The function behind a unary operator
pub fn unary_func(oper: &str) -> Option<UnaryFunc> {
    match oper {
        "not" => Some(not as UnaryFunc),
        "-" => Some(neg as UnaryFunc),
        _ => None,
    }
}

/// Evaluate a value node against a path
pub fn compute<'a>(runt: &'a Arc<Runtime>, id: AstId, path: &'a Path) -> BoxFuture<'a, Result<Value>> {
    eval(runt, id, Some(path))
}

/// Evaluate a value node in runtime scope only
pub fn runtval(runt: &Arc<Runtime>, id: AstId) -> BoxFuture<'_, Result<Value>> {
    eval(runt, id, None)
}

/// Evaluate with a path when there is one
pub fn eval<'a>(runt: &'a Arc<Runtime>, id: AstId, path: Option<&'a Path>) -> BoxFuture<'a, Result<Value>> {
    async move {
        let ast = runt.ast();
        match ast.kind(id) {
            AstKind::Const { valu } => Ok(valu.clone()),
            AstKind::VarValue { name } => runt.get_var(name, path),
            AstKind::VarDeref { name } => {
                let base = eval(runt, ast.kid(id, 0)?, path).await?;
                base.deref(name)
            }
            AstKind::List => {
                let mut items = Vec::with_capacity(ast.kids(id).len());
                for kid in ast.kids(id) {
                    items.push(eval(runt, *kid, path).await?);
                }
                Ok(Value::List(items))
            }
            AstKind::ExprNode { oper, func } => {
                let func = func.or_else(|| binary_func(oper)).ok_or_else(|| {
                    StormError::BadSyntax(format!("unknown expression operator {}", oper))
                })?;
                let lhs = eval(runt, ast.kid(id, 0)?, path).await?;
                let rhs = eval(runt, ast.kid(id, 1)?, path).await?;
                func(&lhs, &rhs)
            }
            AstKind::UnaryExprNode { oper, func } => {
                let func = func.or_else(|| unary_func(oper)).ok_or_else(|| {
                    StormError::BadSyntax(format!("unknown unary operator {}", oper))
                })?;
                func(&eval(runt, ast.kid(id, 0)?, path).await?)
            }
            AstKind::FuncCall => call(runt, id, path).await,
            AstKind::RelPropValue { prop } | AstKind::UnivPropValue { prop } => {
                let node = current(path, id, runt)?;
                Ok(node.get(prop).unwrap_or_default())
            }
            AstKind::TagValue => {
                let node = current(path, id, runt)?;
                let tag = tag_name(runt, ast.kid(id, 0)?, path).await?;
                Ok(match node.tag(&tag) {
                    Some(Some((min, max))) => Value::List(vec![Value::Int(min), Value::Int(max)]),
                    Some(None) => Value::List(vec![Value::Null, Value::Null]),
                    None => Value::Null,
                })
            }
            AstKind::TagPropValue { prop } => {
                let node = current(path, id, runt)?;
                let tag = tag_name(runt, ast.kid(id, 0)?, path).await?;
                Ok(node.tagprop(&tag, prop).unwrap_or_default())
            }
            other => Err(StormError::runtime(format!("{} does not produce a value", other.name()))),
        }
    }
    .boxed()
}

fn current<'a>(path: Option<&'a Path>, id: AstId, runt: &Runtime) -> Result<&'a Node> {
    path.and_then(Path::node).ok_or_else(|| {
        StormError::runtime(format!("{} requires a node", runt.ast().kind(id).name()))
    })
}

/// Evaluate a tag name and normalize it
pub async fn tag_name(runt: &Arc<Runtime>, id: AstId, path: Option<&Path>) -> Result<String> {
    let valu = eval(runt, id, path).await?;
    norm_tag(&valu.tostr()?)
}

async fn call(runt: &Arc<Runtime>, id: AstId, path: Option<&Path>) -> Result<Value> {
    let ast = runt.ast();
    let callee = eval(runt, ast.kid(id, 0)?, path).await?;
    let mut args = Vec::new();
    let mut kwargs = BTreeMap::new();
    for kid in ast.kids(id).iter().skip(1) {
        match ast.kind(*kid) {
            AstKind::CallArgs => {
                for arg in ast.kids(*kid) {
                    args.push(eval(runt, *arg, path).await?);
                }
            }
            AstKind::CallKwargs => {
                for kwarg in ast.kids(*kid) {
                    if let AstKind::CallKwarg { name } = ast.kind(*kwarg) {
                        kwargs.insert(name.clone(), eval(runt, ast.kid(*kwarg, 0)?, path).await?);
                    }
                }
            }
            other => {
                return Err(StormError::BadSyntax(format!("unexpected {} in call", other.name())));
            }
        }
    }
    match callee {
        Value::Func(func) => func.call(args, kwargs).await,
        other => Err(StormError::runtime(format!("{} is not callable", other.type_name()))),
    }
}
