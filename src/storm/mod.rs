// SPDX-License-Identifier: MIT

//! The Storm query engine: a pipeline of operators over `(node, path)` items

pub mod ast;
pub mod cond;
pub mod control;
pub mod doc;
pub mod edit;
pub mod expr;
pub mod lift;
pub mod opts;
pub mod path;
pub mod pipeline;
pub mod pivot;
pub mod runtime;
pub mod signal;
pub mod spill;
pub mod subgraph;

#[cfg(test)]
mod testutil;

pub use ast::{Ast, AstDoc, AstId, AstKind};
pub use doc::QueryLoader;
pub use opts::{GraphRules, QueryOptions};
pub use path::Path;
pub use pipeline::{execute, ItemStream};
pub use runtime::{CancelHandle, Message, Runtime};
pub use signal::{Item, Signal};
