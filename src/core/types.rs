// SPDX-License-Identifier: MIT

//! Type normalization and comparators
//!
//! Every property and form has a [`StormType`]. A type normalizes raw values
//! into their canonical form and constructs comparators by operator name.
//! `norm` also reports side derivations ([`NormInfo`]): sub-properties to set
//! and additional nodes to create.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::error::{Result, StormError};
use super::node::{Ival, Ndef};
use super::value::Value;

/// A predicate over a left hand side value
pub type Cmpr = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Builds a [`Cmpr`] from a right hand side value
pub type CmprCtor = Arc<dyn Fn(&Value) -> Result<Cmpr> + Send + Sync>;

/// Side derivations produced by normalization
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormInfo {
    /// Sub-property name to normalized value
    pub subs: BTreeMap<String, Value>,
    /// Additional nodes implied by the value
    pub adds: Vec<Ndef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompField {
    pub name: String,
    #[serde(rename = "type")]
    pub typename: String,
}

/// The base kind of a type, as declared in a model document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeKind {
    Str {
        #[serde(default)]
        lower: bool,
    },
    Int {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    Bool,
    Time,
    Ival,
    Ndef {
        #[serde(default)]
        forms: Option<Vec<String>>,
    },
    Array {
        elem: String,
        #[serde(default)]
        uniq: bool,
    },
    Comp {
        fields: Vec<CompField>,
    },
    Edge,
}

#[derive(Debug)]
pub struct StormType {
    name: String,
    kind: TypeKind,
    is_form: bool,
    elem: Option<Arc<StormType>>,
    fields: Vec<(String, Arc<StormType>)>,
}

impl StormType {
    /// A type with no element or field types
    pub fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            is_form: false,
            elem: None,
            fields: Vec::new(),
        }
    }

    pub(crate) fn with_parts(
        name: impl Into<String>,
        kind: TypeKind,
        is_form: bool,
        elem: Option<Arc<StormType>>,
        fields: Vec<(String, Arc<StormType>)>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            is_form,
            elem,
            fields,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    /// True when a form of the same name exists
    pub fn is_form(&self) -> bool {
        self.is_form
    }

    pub fn elem(&self) -> Option<&Arc<StormType>> {
        self.elem.as_ref()
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, TypeKind::Array { .. })
    }

    pub fn is_ndef(&self) -> bool {
        matches!(self.kind, TypeKind::Ndef { .. })
    }

    pub fn is_edge(&self) -> bool {
        matches!(self.kind, TypeKind::Edge)
    }

    fn bad(&self, mesg: impl Into<String>) -> StormError {
        StormError::bad_valu(self.name.clone(), mesg)
    }

    /// Normalize a raw value
    pub fn norm(&self, raw: &Value) -> Result<(Value, NormInfo)> {
        let mut info = NormInfo::default();
        let valu = match &self.kind {
            TypeKind::Str { lower } => {
                let text = match raw.toprim() {
                    Value::Str(s) => s,
                    Value::Int(i) => i.to_string(),
                    other => return Err(self.bad(format!("expected a string, got {}", other.type_name()))),
                };
                Value::Str(if *lower { text.to_lowercase() } else { text })
            }
            TypeKind::Int { min, max } => {
                let valu = raw.toprim().toint().map_err(|e| self.bad(e.to_string()))?;
                if min.is_some_and(|min| valu < min) || max.is_some_and(|max| valu > max) {
                    return Err(self.bad(format!("{} is out of range", valu)));
                }
                Value::Int(valu)
            }
            TypeKind::Bool => match raw.toprim() {
                Value::Bool(b) => Value::Bool(b),
                Value::Int(i) => Value::Bool(i != 0),
                Value::Str(s) => match s.to_lowercase().as_str() {
                    "true" | "1" => Value::Bool(true),
                    "false" | "0" => Value::Bool(false),
                    _ => return Err(self.bad(format!("invalid bool {:?}", s))),
                },
                other => return Err(self.bad(format!("invalid bool {}", other))),
            },
            TypeKind::Time => Value::Int(norm_time(raw).map_err(|mesg| self.bad(mesg))?),
            TypeKind::Ival => {
                let (min, max) = norm_ival(raw).map_err(|mesg| self.bad(mesg))?;
                Value::List(vec![Value::Int(min), Value::Int(max)])
            }
            TypeKind::Ndef { forms } => {
                let ndef = Ndef::from_value(raw).ok_or_else(|| self.bad("expected a [form, valu] pair"))?;
                if let Some(forms) = forms {
                    if !forms.contains(&ndef.form) {
                        return Err(self.bad(format!("form {} is not allowed", ndef.form)));
                    }
                }
                let valu = Value::List(vec![Value::Str(ndef.form.clone()), ndef.valu.toprim()]);
                info.adds.push(Ndef::new(ndef.form, ndef.valu.toprim()));
                valu
            }
            TypeKind::Array { uniq, .. } => {
                let elem = self.elem.as_ref().ok_or_else(|| self.bad("array has no element type"))?;
                let items = match raw.toprim() {
                    Value::List(items) => items,
                    other => return Err(self.bad(format!("expected a list, got {}", other.type_name()))),
                };
                let mut normed: Vec<Value> = Vec::with_capacity(items.len());
                for item in &items {
                    let (valu, _) = elem.norm(item)?;
                    if *uniq && normed.contains(&valu) {
                        continue;
                    }
                    if elem.is_form() {
                        info.adds.push(Ndef::new(elem.name(), valu.clone()));
                    }
                    normed.push(valu);
                }
                Value::List(normed)
            }
            TypeKind::Comp { .. } => {
                let items = match raw.toprim() {
                    Value::List(items) => items,
                    Value::Dict(map) => self
                        .fields
                        .iter()
                        .map(|(name, _)| map.get(name).cloned().unwrap_or_default())
                        .collect(),
                    other => return Err(self.bad(format!("expected a list, got {}", other.type_name()))),
                };
                if items.len() != self.fields.len() {
                    return Err(self.bad(format!(
                        "expected {} fields, got {}",
                        self.fields.len(),
                        items.len()
                    )));
                }
                let mut normed = Vec::with_capacity(items.len());
                for ((name, styp), item) in self.fields.iter().zip(items.iter()) {
                    let (valu, _) = styp.norm(item)?;
                    if styp.is_form() {
                        info.adds.push(Ndef::new(styp.name(), valu.clone()));
                    }
                    info.subs.insert(name.clone(), valu.clone());
                    normed.push(valu);
                }
                Value::List(normed)
            }
            TypeKind::Edge => {
                let pair = match raw.toprim() {
                    Value::List(items) if items.len() == 2 => items,
                    _ => return Err(self.bad("expected a pair of ndefs")),
                };
                let n1 = Ndef::from_value(&pair[0]).ok_or_else(|| self.bad("n1 is not an ndef"))?;
                let n2 = Ndef::from_value(&pair[1]).ok_or_else(|| self.bad("n2 is not an ndef"))?;
                info.subs.insert("n1".to_string(), n1.to_value());
                info.subs.insert("n1:form".to_string(), Value::Str(n1.form.clone()));
                info.subs.insert("n2".to_string(), n2.to_value());
                info.subs.insert("n2:form".to_string(), Value::Str(n2.form.clone()));
                let valu = Value::List(vec![n1.to_value(), n2.to_value()]);
                info.adds.push(n1);
                info.adds.push(n2);
                valu
            }
        };
        Ok((valu, info))
    }

    fn is_ordered(&self) -> bool {
        matches!(self.kind, TypeKind::Int { .. } | TypeKind::Time)
    }

    /// Comparator constructor for an operator, `None` when unsupported
    pub fn get_cmpr_ctor(self: &Arc<Self>, cmpr: &str) -> Option<CmprCtor> {
        let styp = Arc::clone(self);
        let ctor: CmprCtor = match cmpr {
            "=" => Arc::new(move |rhs: &Value| {
                let (norm, _) = styp.norm(rhs)?;
                let test: Cmpr = Arc::new(move |lhs: &Value| *lhs == norm);
                Ok(test)
            }),
            "!=" => {
                let eq = self.get_cmpr_ctor("=")?;
                Arc::new(move |rhs: &Value| {
                    let inner = eq(rhs)?;
                    let test: Cmpr = Arc::new(move |lhs: &Value| !inner(lhs));
                    Ok(test)
                })
            }
            "<" | ">" | "<=" | ">=" if self.is_ordered() => {
                let oper: fn(i64, i64) -> bool = match cmpr {
                    "<" => |a, b| a < b,
                    ">" => |a, b| a > b,
                    "<=" => |a, b| a <= b,
                    _ => |a, b| a >= b,
                };
                Arc::new(move |rhs: &Value| {
                    let (norm, _) = styp.norm(rhs)?;
                    let rval = norm.toint()?;
                    let test: Cmpr =
                        Arc::new(move |lhs: &Value| lhs.toint().is_ok_and(|lval| oper(lval, rval)));
                    Ok(test)
                })
            }
            "^=" if matches!(self.kind, TypeKind::Str { .. }) => Arc::new(move |rhs: &Value| {
                let (norm, _) = styp.norm(rhs)?;
                let prefix = norm.tostr()?;
                let test: Cmpr =
                    Arc::new(move |lhs: &Value| lhs.as_str().is_some_and(|s| s.starts_with(&prefix)));
                Ok(test)
            }),
            "~=" if matches!(self.kind, TypeKind::Str { .. }) => Arc::new(|rhs: &Value| {
                let pattern = rhs.tostr()?;
                let regex = Regex::new(&pattern).map_err(|e| StormError::BadCmprType {
                    cmpr: "~=".to_string(),
                    mesg: e.to_string(),
                })?;
                let test: Cmpr = Arc::new(move |lhs: &Value| lhs.as_str().is_some_and(|s| regex.is_match(s)));
                Ok(test)
            }),
            "@=" if matches!(self.kind, TypeKind::Time) => Arc::new(|rhs: &Value| {
                let (min, max) = norm_ival(rhs).map_err(|mesg| StormError::BadCmprType {
                    cmpr: "@=".to_string(),
                    mesg,
                })?;
                let test: Cmpr = Arc::new(move |lhs: &Value| lhs.toint().is_ok_and(|t| t >= min && t < max));
                Ok(test)
            }),
            "@=" if matches!(self.kind, TypeKind::Ival) => Arc::new(|rhs: &Value| {
                let (rmin, rmax) = norm_ival(rhs).map_err(|mesg| StormError::BadCmprType {
                    cmpr: "@=".to_string(),
                    mesg,
                })?;
                let test: Cmpr = Arc::new(move |lhs: &Value| match norm_ival(lhs) {
                    Ok((lmin, lmax)) => lmin < rmax && lmax > rmin,
                    Err(_) => false,
                });
                Ok(test)
            }),
            "in=" => Arc::new(move |rhs: &Value| {
                let items = rhs.as_list().ok_or_else(|| StormError::BadCmprType {
                    cmpr: "in=".to_string(),
                    mesg: format!("expected a list, got {}", rhs.type_name()),
                })?;
                let mut normed = Vec::with_capacity(items.len());
                for item in items {
                    normed.push(styp.norm(item)?.0);
                }
                let test: Cmpr = Arc::new(move |lhs: &Value| normed.contains(lhs));
                Ok(test)
            }),
            _ => return None,
        };
        Some(ctor)
    }
}

/// Merge two intervals into one covering both
pub fn ival_merge(a: Ival, b: Ival) -> Ival {
    (a.0.min(b.0), a.1.max(b.1))
}

/// Parse a time value into epoch millis
pub fn norm_time(raw: &Value) -> std::result::Result<i64, String> {
    match raw.toprim() {
        Value::Int(i) => Ok(i),
        Value::Str(text) => parse_time(text.trim()),
        other => Err(format!("invalid time {}", other)),
    }
}

fn parse_time(text: &str) -> std::result::Result<i64, String> {
    if text.eq_ignore_ascii_case("now") {
        return Ok(Utc::now().timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Ok(dt.and_utc().timestamp_millis());
        }
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
            return date_millis(date, text);
        }
    }
    if text.len() == 4 {
        if let Some(date) = text.parse::<i32>().ok().and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1)) {
            return date_millis(date, text);
        }
    }
    Err(format!("unknown time format {:?}", text))
}

fn date_millis(date: NaiveDate, text: &str) -> std::result::Result<i64, String> {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .ok_or_else(|| format!("invalid date {:?}", text))
}

/// Parse an interval: a single time or a `[min, max]` pair (`"?"` is open ended)
pub fn norm_ival(raw: &Value) -> std::result::Result<Ival, String> {
    match raw.toprim() {
        Value::List(items) => match items.as_slice() {
            [single] => norm_ival(single),
            [min, max] => {
                let min = norm_time(min)?;
                let max = match max {
                    Value::Str(s) if s == "?" => i64::MAX,
                    other => norm_time(other)?,
                };
                Ok((min.min(max), min.max(max)))
            }
            _ => Err(format!("an interval has one or two values, got {}", items.len())),
        },
        Value::Null => Err("an interval requires a value".to_string()),
        other => {
            let time = norm_time(&other)?;
            Ok((time, time.saturating_add(1)))
        }
    }
}
