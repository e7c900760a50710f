// SPDX-License-Identifier: MIT

//! Collaborators consumed by the query core: values, nodes, types, the data
//! model, storage snapshots and the permission gate.

pub mod error;
pub mod memory;
pub mod model;
pub mod node;
pub mod perms;
pub mod snapshot;
pub mod types;
pub mod value;

pub use error::{ErrorKind, Result, StormError};
pub use memory::{GraphFixture, MemorySnapshot};
pub use model::{DataModel, Form, ModelDef, Prop, PropRef};
pub use node::{Buid, Ival, Ndef, Node, NodeStream};
pub use perms::{AllowAll, PermGate, PermRules};
pub use snapshot::Snapshot;
pub use types::{Cmpr, CmprCtor, NormInfo, StormType, TypeKind};
pub use value::{Callable, Derefable, NodeSource, Value};
