// SPDX-License-Identifier: MIT

//! Query runtime
//!
//! A [`Runtime`] owns everything one query execution shares: the tree, the
//! storage snapshot, the permission gate, runtime-scoped variables and the
//! set of names that are safe to evaluate without a node. Sub-runtimes run
//! function bodies and edge subqueries with their own variables while
//! sharing cancellation, messages and caches with the root.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use uuid::Uuid;

use super::ast::{Ast, AstId, AstKind, VarScope};
use super::cond::GlobCache;
use super::opts::QueryOptions;
use super::path::Path;
use crate::core::error::{Result, StormError};
use crate::core::node::Node;
use crate::core::perms::PermGate;
use crate::core::snapshot::Snapshot;
use crate::core::value::Value;

/// Out-of-band output of a query
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Warn(String),
}

/// Stops a running query at its next tick
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Names bound by the query's operators, split by whether any binding depends on a node
#[derive(Debug, Default)]
pub struct RuntVars {
    safe: HashSet<String>,
    tainted: HashSet<String>,
}

impl RuntVars {
    fn bind(&mut self, name: &str, runtsafe: bool) {
        if runtsafe {
            self.safe.insert(name.to_string());
        } else {
            self.tainted.insert(name.to_string());
        }
    }

    /// Walk the operators of `query` in order, descending into control flow bodies
    fn collect(&mut self, ast: &Ast, query: AstId) {
        for &oper in ast.kids(query) {
            match ast.kind(oper) {
                AstKind::SetVarOper { name } => {
                    let safe = ast.kids(oper).iter().all(|kid| ast.is_runtsafe(*kid, &*self));
                    self.bind(name, safe);
                }
                AstKind::VarListSetOper { names } | AstKind::ForLoop { names } => {
                    let safe = ast.opt_kid(oper, 0).map_or(true, |kid| ast.is_runtsafe(kid, &*self));
                    for name in names {
                        self.bind(name, safe);
                    }
                    if let Some(body) = ast.opt_kid(oper, 1) {
                        self.collect(ast, body);
                    }
                }
                AstKind::WhileLoop => {
                    if let Some(body) = ast.opt_kid(oper, 1) {
                        self.collect(ast, body);
                    }
                }
                AstKind::IfStmt => {
                    for &clause in ast.kids(oper) {
                        match ast.kind(clause) {
                            AstKind::IfClause => {
                                if let Some(body) = ast.opt_kid(clause, 1) {
                                    self.collect(ast, body);
                                }
                            }
                            _ => self.collect(ast, clause),
                        }
                    }
                }
                AstKind::SwitchCase => {
                    for &entry in ast.kids(oper).iter().skip(1) {
                        if let Some(body) = ast.kids(entry).last() {
                            self.collect(ast, *body);
                        }
                    }
                }
                AstKind::SubQuery => self.collect(ast, oper),
                AstKind::Function { name, .. } => self.bind(name, true),
                _ => {}
            }
        }
    }
}

impl VarScope for RuntVars {
    fn is_runt_var(&self, name: &str) -> bool {
        self.safe.contains(name) && !self.tainted.contains(name)
    }
}

/// State shared by a root runtime and all of its sub-runtimes
struct Shared {
    ticks: AtomicU64,
    cancel: watch::Receiver<bool>,
    canceller: Arc<watch::Sender<bool>>,
    messages: Mutex<Vec<Message>>,
    globs: Mutex<GlobCache>,
}

pub struct Runtime {
    iden: String,
    ast: Arc<Ast>,
    query: AstId,
    snap: Arc<dyn Snapshot>,
    perms: Arc<dyn PermGate>,
    opts: Arc<QueryOptions>,
    vars: RwLock<HashMap<String, Value>>,
    runtvars: RuntVars,
    parent: Option<Arc<Runtime>>,
    shared: Arc<Shared>,
    this: Weak<Runtime>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("iden", &self.iden)
            .field("query", &self.query)
            .finish()
    }
}

impl Runtime {
    /// Create a root runtime for the tree's root query
    pub fn new(
        snap: Arc<dyn Snapshot>,
        perms: Arc<dyn PermGate>,
        ast: Arc<Ast>,
        opts: QueryOptions,
    ) -> Result<Arc<Self>> {
        let query = ast
            .root()
            .ok_or_else(|| StormError::BadSyntax("query has no root".to_string()))?;
        let (tx, rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            ticks: AtomicU64::new(0),
            cancel: rx,
            canceller: Arc::new(tx),
            messages: Mutex::new(Vec::new()),
            globs: Mutex::new(GlobCache::new(opts.glob_cache_size)),
        });
        let vars: HashMap<String, Value> = opts.vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let mut runtvars = RuntVars::default();
        for name in vars.keys() {
            runtvars.bind(name, true);
        }
        runtvars.collect(&ast, query);

        let runt = Arc::new_cyclic(|this| Self {
            iden: Uuid::new_v4().to_string(),
            ast,
            query,
            snap,
            perms,
            opts: Arc::new(opts),
            vars: RwLock::new(vars),
            runtvars,
            parent: None,
            shared,
            this: this.clone(),
        });
        log::debug!("Created runtime {}", runt.iden);
        Ok(runt)
    }

    /// A runtime for `query` whose own scope starts as `vars`; unknown names fall back to this runtime
    pub fn sub_runtime(&self, query: AstId, vars: HashMap<String, Value>) -> Arc<Self> {
        let mut runtvars = RuntVars::default();
        for name in self.safe_names() {
            runtvars.bind(&name, true);
        }
        for name in vars.keys() {
            runtvars.bind(name, true);
        }
        runtvars.collect(&self.ast, query);

        Arc::new_cyclic(|this| Self {
            iden: Uuid::new_v4().to_string(),
            ast: Arc::clone(&self.ast),
            query,
            snap: Arc::clone(&self.snap),
            perms: Arc::clone(&self.perms),
            opts: Arc::clone(&self.opts),
            vars: RwLock::new(vars),
            runtvars,
            parent: self.this.upgrade(),
            shared: Arc::clone(&self.shared),
            this: this.clone(),
        })
    }

    /// A runtime for a separately compiled tree that sees this runtime's variables
    pub fn tree_runtime(&self, ast: Arc<Ast>) -> Result<Arc<Self>> {
        let query = ast
            .root()
            .ok_or_else(|| StormError::BadSyntax("query has no root".to_string()))?;
        let mut runtvars = RuntVars::default();
        for name in self.safe_names() {
            runtvars.bind(&name, true);
        }
        runtvars.collect(&ast, query);

        Ok(Arc::new_cyclic(|this| Self {
            iden: Uuid::new_v4().to_string(),
            ast,
            query,
            snap: Arc::clone(&self.snap),
            perms: Arc::clone(&self.perms),
            opts: Arc::clone(&self.opts),
            vars: RwLock::new(HashMap::new()),
            runtvars,
            parent: self.this.upgrade(),
            shared: Arc::clone(&self.shared),
            this: this.clone(),
        }))
    }

    fn safe_names(&self) -> HashSet<String> {
        let mut names = self
            .parent
            .as_ref()
            .map(|parent| parent.safe_names())
            .unwrap_or_default();
        names.retain(|name| !self.runtvars.tainted.contains(name));
        names.extend(
            self.runtvars
                .safe
                .iter()
                .filter(|name| !self.runtvars.tainted.contains(*name))
                .cloned(),
        );
        names
    }

    pub fn iden(&self) -> &str {
        &self.iden
    }

    pub fn ast(&self) -> &Arc<Ast> {
        &self.ast
    }

    /// The query this runtime executes
    pub fn query(&self) -> AstId {
        self.query
    }

    pub fn snap(&self) -> &Arc<dyn Snapshot> {
        &self.snap
    }

    pub fn opts(&self) -> &QueryOptions {
        &self.opts
    }

    /// A strong handle to this runtime
    pub fn handle(&self) -> Result<Arc<Self>> {
        self.this
            .upgrade()
            .ok_or_else(|| StormError::runtime("runtime has been dropped"))
    }

    pub fn weak(&self) -> Weak<Self> {
        self.this.clone()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_runtsafe(&self, id: AstId) -> bool {
        self.ast.is_runtsafe(id, self)
    }

    /// Look a variable up in the path, then this runtime, then its parents
    pub fn get_var(&self, name: &str, path: Option<&Path>) -> Result<Value> {
        if let Some(valu) = path.and_then(|path| path.get_var(name)) {
            return Ok(valu);
        }
        self.lookup(name).ok_or_else(|| StormError::NoSuchVar {
            name: name.to_string(),
        })
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(valu) = self.vars.read().get(name) {
            return Some(valu.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.lookup(name))
    }

    pub fn set_var(&self, name: impl Into<String>, valu: Value) {
        self.vars.write().insert(name.into(), valu);
    }

    pub fn has_own_var(&self, name: &str) -> bool {
        self.vars.read().contains_key(name)
    }

    /// Variables bound directly in this runtime
    pub fn vars(&self) -> HashMap<String, Value> {
        self.vars.read().clone()
    }

    /// Check a permission, failing with the dotted permission name
    pub fn confirm(&self, perm: &[String]) -> Result<()> {
        if self.perms.allowed(perm) {
            return Ok(());
        }
        let perm = perm.join(".");
        log::warn!("Permission denied: {}", perm);
        Err(StormError::AuthDeny { perm })
    }

    /// Count one unit of work and observe cancellation
    pub fn tick(&self) -> Result<()> {
        self.shared.ticks.fetch_add(1, Ordering::Relaxed);
        if *self.shared.cancel.borrow() {
            return Err(StormError::Cancelled);
        }
        Ok(())
    }

    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::Relaxed)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.shared.canceller),
        }
    }

    pub fn warn(&self, mesg: impl Into<String>) {
        let mesg = mesg.into();
        log::warn!("{}", mesg);
        self.shared.messages.lock().push(Message::Warn(mesg));
    }

    pub fn messages(&self) -> Vec<Message> {
        self.shared.messages.lock().clone()
    }

    /// Match a tag name against a glob, caching the compiled pattern
    pub fn glob_match(&self, glob: &str, name: &str) -> bool {
        self.shared.globs.lock().is_match(glob, name)
    }

    /// A fresh path for a lifted node
    pub fn init_path(&self, node: &Node) -> Path {
        Path::new(node)
    }
}

impl VarScope for Runtime {
    fn is_runt_var(&self, name: &str) -> bool {
        if self.runtvars.tainted.contains(name) {
            return false;
        }
        self.runtvars.safe.contains(name)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.is_runt_var(name))
    }
}
