// SPDX-License-Identifier: MIT

//! Items and control signals flowing between operators
//!
//! Operators exchange [`Signal`]s. `Item` carries a (node, path) pair; the
//! others are non-local control flow raised by `break`, `continue` and
//! `return` and caught by the nearest loop or function frame. An operator
//! that receives a control signal from upstream forwards it and stops.

use futures::stream::{self, BoxStream, Stream, StreamExt};

use super::path::Path;
use crate::core::error::{Result, StormError};
use crate::core::node::{Node, NodeStream};
use crate::core::value::Value;

pub type Item = (Node, Path);

#[derive(Debug, Clone)]
pub enum Signal {
    Item(Item),
    /// Stop the enclosing loop, re-emitting the payload first
    Break(Option<Item>),
    /// Skip to the next loop iteration, re-emitting the payload first
    Continue(Option<Item>),
    /// Leave the enclosing function with a value
    Return(Value),
}

/// The stream every operator consumes and produces
pub type Genr = BoxStream<'static, Result<Signal>>;

/// Box a signal stream
pub fn genr<S>(stream: S) -> Genr
where
    S: Stream<Item = Result<Signal>> + Send + 'static,
{
    stream.boxed()
}

/// Box a node stream
pub fn node_genr<S>(stream: S) -> NodeStream
where
    S: Stream<Item = Result<Node>> + Send + 'static,
{
    stream.boxed()
}

pub fn empty() -> Genr {
    stream::empty().boxed()
}

/// A stream over fixed items
pub fn items(items: Vec<Item>) -> Genr {
    stream::iter(items.into_iter().map(|item| Ok(Signal::Item(item)))).boxed()
}

/// A stream that fails with `err` when first polled
pub fn error(err: StormError) -> Genr {
    stream::once(async move { Err(err) }).boxed()
}
