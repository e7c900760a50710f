// SPDX-License-Identifier: MIT

//! Typed error handling for storm-rs
//!
//! Every failure the query core can surface is a variant of [`StormError`].
//! Variants are grouped into coarse [`ErrorKind`]s so callers can decide
//! what is recoverable without matching every variant.

use thiserror::Error;

/// Coarse classification of a [`StormError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown property, form, tag property, comparator, pivot or variable
    Lookup,
    /// A value could not be normalized or compared
    Type,
    /// Variable list or function argument count mismatch
    Arity,
    /// A permission check denied a mutation
    Auth,
    /// Runtime misuse of a construct
    Runtime,
    /// Failures outside the query language itself
    Internal,
}

/// Top-level error type for storm-rs
#[derive(Debug, Error)]
pub enum StormError {
    #[error("No such property: {name}")]
    NoSuchProp { name: String, form: Option<String> },

    #[error("No such form: {name}")]
    NoSuchForm { name: String },

    #[error("No such tag property: {name}")]
    NoSuchTagProp { name: String },

    #[error("No comparator {cmpr} for type {name}")]
    NoSuchCmpr { cmpr: String, name: String },

    #[error("No pivot found for {n1} -> {n2}")]
    NoSuchPivot { n1: String, n2: String },

    #[error("Missing variable: {name}")]
    NoSuchVar { name: String },

    #[error("No member {name} on {valu}")]
    NoSuchName { name: String, valu: String },

    #[error("Bad value for type {name}: {mesg}")]
    BadTypeValu { name: String, mesg: String },

    #[error("Cannot convert {valu} to {target}")]
    BadCast { valu: String, target: String },

    #[error("Comparator {cmpr} is not valid here: {mesg}")]
    BadCmprType { cmpr: String, mesg: String },

    #[error("Variable list of {expected} names cannot unpack {got} values")]
    VarListArity { expected: usize, got: usize },

    #[error("Bad arguments to {name}: {mesg}")]
    BadArgs { name: String, mesg: String },

    #[error("Property {name} is read only")]
    ReadOnlyProp { name: String },

    #[error("Permission denied: {perm}")]
    AuthDeny { perm: String },

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Bad query syntax: {0}")]
    BadSyntax(String),

    #[error("Query was cancelled")]
    Cancelled,

    #[error("Spill set error: {0}")]
    Spill(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl StormError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoSuchProp { .. }
            | Self::NoSuchForm { .. }
            | Self::NoSuchTagProp { .. }
            | Self::NoSuchCmpr { .. }
            | Self::NoSuchPivot { .. }
            | Self::NoSuchVar { .. }
            | Self::NoSuchName { .. } => ErrorKind::Lookup,
            Self::BadTypeValu { .. } | Self::BadCast { .. } | Self::BadCmprType { .. } => {
                ErrorKind::Type
            }
            Self::VarListArity { .. } | Self::BadArgs { .. } => ErrorKind::Arity,
            Self::AuthDeny { .. } => ErrorKind::Auth,
            Self::ReadOnlyProp { .. } | Self::Runtime(_) | Self::BadSyntax(_) => ErrorKind::Runtime,
            Self::Cancelled | Self::Spill(_) | Self::Io(_) | Self::Json(_) | Self::Yaml(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Create a runtime error
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    /// Create a no-such-property error
    pub fn no_such_prop(name: impl Into<String>, form: Option<&str>) -> Self {
        Self::NoSuchProp {
            name: name.into(),
            form: form.map(str::to_string),
        }
    }

    /// Create a bad type value error
    pub fn bad_valu(name: impl Into<String>, mesg: impl Into<String>) -> Self {
        Self::BadTypeValu {
            name: name.into(),
            mesg: mesg.into(),
        }
    }

    /// True for the errors the quiet (`?=`) edit variants may discard
    pub fn is_bad_valu(&self) -> bool {
        matches!(self, Self::BadTypeValu { .. })
    }
}

impl From<rusqlite::Error> for StormError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Spill(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StormError>;
