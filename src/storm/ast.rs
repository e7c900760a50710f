// SPDX-License-Identifier: MIT

//! Storm abstract syntax tree
//!
//! The tree lives in an arena ([`Ast`]) and is navigated by index. Every
//! node records its parent and its position among its siblings, so sibling
//! lookahead and subtree searches never need owning back pointers.
//!
//! A tree goes through two analysis passes before it runs:
//!
//! * [`Ast::init`] resolves expression operators, validates structure and
//!   model references, and marks functions that contain a `return`.
//! * [`Ast::optimize`] folds constant expressions and rewrites form lifts
//!   into form+tag lifts when an adjacent filter carries a tag hint.
//!
//! The tree is not structurally modified after optimization.

use serde::Deserialize;

use super::expr::{binary_func, unary_func, ExprFunc, UnaryFunc};
use crate::core::error::{Result, StormError};
use crate::core::model::DataModel;
use crate::core::value::Value;

pub type AstId = usize;

/// Every kind of AST node, with its static attributes
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AstKind {
    /// A whole query; kids are its operators
    Query,
    /// A nested query; kids are its operators
    SubQuery,

    Const {
        valu: Value,
    },
    VarValue {
        name: String,
    },
    /// `base.name`; kid 0 is the base value
    VarDeref {
        name: String,
    },
    RelPropValue {
        prop: String,
    },
    UnivPropValue {
        prop: String,
    },
    /// Interval of a tag; kid 0 is the tag name
    TagValue,
    /// kid 0 is the tag name
    TagPropValue {
        prop: String,
    },
    List,
    ExprNode {
        oper: String,
        #[serde(skip)]
        func: Option<ExprFunc>,
    },
    UnaryExprNode {
        oper: String,
        #[serde(skip)]
        func: Option<UnaryFunc>,
    },
    /// kid 0 is the callee, then optional `CallArgs` and `CallKwargs`
    FuncCall,
    CallArgs,
    CallKwargs,
    CallKwarg {
        name: String,
    },

    AndCond,
    OrCond,
    NotCond,
    /// kid 0 is a tag name or glob
    TagCond,
    HasRelPropCond {
        prop: String,
    },
    HasAbsPropCond {
        prop: String,
    },
    RelPropCond {
        prop: String,
        cmpr: String,
    },
    AbsPropCond {
        prop: String,
        cmpr: String,
    },
    /// kids are the tag name and the value
    TagValuCond {
        cmpr: String,
    },
    TagPropCond {
        prop: String,
        cmpr: String,
    },
    ArrayCond {
        prop: String,
        cmpr: String,
    },
    /// kid 0 is a `SubQuery`, kid 1 the count when a comparator is present
    SubqCond {
        #[serde(default)]
        cmpr: Option<String>,
    },
    DollarCond,

    LiftProp {
        prop: String,
    },
    LiftPropBy {
        prop: String,
        cmpr: String,
    },
    LiftPropArray {
        prop: String,
        cmpr: String,
    },
    LiftTag {
        #[serde(default)]
        form: Option<String>,
    },
    LiftFormTag {
        form: String,
    },
    LiftTagValu {
        #[serde(default)]
        form: Option<String>,
        cmpr: String,
    },
    LiftTagProp {
        #[serde(default)]
        form: Option<String>,
        prop: String,
        #[serde(default)]
        cmpr: Option<String>,
    },
    /// `##tag`: nodes tagged with any tag that is itself tagged
    LiftTagTag {
        #[serde(default)]
        form: Option<String>,
    },

    FormPivot {
        form: String,
        #[serde(default)]
        isjoin: bool,
    },
    PivotOut {
        #[serde(default)]
        isjoin: bool,
    },
    PivotIn {
        #[serde(default)]
        isjoin: bool,
    },
    PivotInFrom {
        form: String,
        #[serde(default)]
        isjoin: bool,
    },
    PropPivotOut {
        prop: String,
        #[serde(default)]
        isjoin: bool,
    },
    PropPivot {
        prop: String,
        dest: String,
        #[serde(default)]
        isjoin: bool,
    },
    /// `-> #`, `-> #*`, `-> #glob`, `-> #exact`
    PivotToTags {
        #[serde(default)]
        pattern: String,
        #[serde(default)]
        isjoin: bool,
    },
    /// kid 0 is the verb (or list of verbs, or `*`), kid 1 the destination forms
    N1Walk {
        #[serde(default)]
        isjoin: bool,
    },
    N2Walk {
        #[serde(default)]
        isjoin: bool,
    },
    /// `--> *`
    N1WalkNPivo {
        #[serde(default)]
        isjoin: bool,
    },
    /// `<-- *`
    N2WalkNPivo {
        #[serde(default)]
        isjoin: bool,
    },

    FiltOper {
        include: bool,
    },
    SetVarOper {
        name: String,
    },
    VarListSetOper {
        names: Vec<String>,
    },
    VarEvalOper,

    /// kid 0 is the iterable, kid 1 the body
    ForLoop {
        names: Vec<String>,
    },
    WhileLoop,
    /// `IfClause` kids, then an optional else `SubQuery`
    IfStmt,
    IfClause,
    /// kid 0 is the switch value, then `CaseEntry` kids
    SwitchCase,
    CaseEntry {
        #[serde(default)]
        value: Option<String>,
    },
    Function {
        name: String,
        #[serde(default)]
        params: Vec<String>,
        #[serde(skip)]
        has_return: bool,
    },
    Return,
    BreakOper,
    ContinueOper,

    EditNodeAdd {
        form: String,
        #[serde(default = "default_set")]
        oper: String,
    },
    EditPropSet {
        prop: String,
        #[serde(default = "default_set")]
        oper: String,
    },
    EditPropDel {
        prop: String,
    },
    EditTagAdd {
        #[serde(default)]
        tryset: bool,
    },
    EditTagDel,
    EditTagPropSet {
        prop: String,
        #[serde(default = "default_set")]
        oper: String,
    },
    EditTagPropDel {
        prop: String,
    },
    /// kid 0 is the verb, kid 1 a `SubQuery` producing the other ends
    EditEdgeAdd {
        #[serde(default)]
        n2: bool,
    },
    EditEdgeDel {
        #[serde(default)]
        n2: bool,
    },
}

fn default_set() -> String {
    "=".to_string()
}

impl AstKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Query => "Query",
            Self::SubQuery => "SubQuery",
            Self::Const { .. } => "Const",
            Self::VarValue { .. } => "VarValue",
            Self::VarDeref { .. } => "VarDeref",
            Self::RelPropValue { .. } => "RelPropValue",
            Self::UnivPropValue { .. } => "UnivPropValue",
            Self::TagValue => "TagValue",
            Self::TagPropValue { .. } => "TagPropValue",
            Self::List => "List",
            Self::ExprNode { .. } => "ExprNode",
            Self::UnaryExprNode { .. } => "UnaryExprNode",
            Self::FuncCall => "FuncCall",
            Self::CallArgs => "CallArgs",
            Self::CallKwargs => "CallKwargs",
            Self::CallKwarg { .. } => "CallKwarg",
            Self::AndCond => "AndCond",
            Self::OrCond => "OrCond",
            Self::NotCond => "NotCond",
            Self::TagCond => "TagCond",
            Self::HasRelPropCond { .. } => "HasRelPropCond",
            Self::HasAbsPropCond { .. } => "HasAbsPropCond",
            Self::RelPropCond { .. } => "RelPropCond",
            Self::AbsPropCond { .. } => "AbsPropCond",
            Self::TagValuCond { .. } => "TagValuCond",
            Self::TagPropCond { .. } => "TagPropCond",
            Self::ArrayCond { .. } => "ArrayCond",
            Self::SubqCond { .. } => "SubqCond",
            Self::DollarCond => "DollarCond",
            Self::LiftProp { .. } => "LiftProp",
            Self::LiftPropBy { .. } => "LiftPropBy",
            Self::LiftPropArray { .. } => "LiftPropArray",
            Self::LiftTag { .. } => "LiftTag",
            Self::LiftFormTag { .. } => "LiftFormTag",
            Self::LiftTagValu { .. } => "LiftTagValu",
            Self::LiftTagProp { .. } => "LiftTagProp",
            Self::LiftTagTag { .. } => "LiftTagTag",
            Self::FormPivot { .. } => "FormPivot",
            Self::PivotOut { .. } => "PivotOut",
            Self::PivotIn { .. } => "PivotIn",
            Self::PivotInFrom { .. } => "PivotInFrom",
            Self::PropPivotOut { .. } => "PropPivotOut",
            Self::PropPivot { .. } => "PropPivot",
            Self::PivotToTags { .. } => "PivotToTags",
            Self::N1Walk { .. } => "N1Walk",
            Self::N2Walk { .. } => "N2Walk",
            Self::N1WalkNPivo { .. } => "N1WalkNPivo",
            Self::N2WalkNPivo { .. } => "N2WalkNPivo",
            Self::FiltOper { .. } => "FiltOper",
            Self::SetVarOper { .. } => "SetVarOper",
            Self::VarListSetOper { .. } => "VarListSetOper",
            Self::VarEvalOper => "VarEvalOper",
            Self::ForLoop { .. } => "ForLoop",
            Self::WhileLoop => "WhileLoop",
            Self::IfStmt => "IfStmt",
            Self::IfClause => "IfClause",
            Self::SwitchCase => "SwitchCase",
            Self::CaseEntry { .. } => "CaseEntry",
            Self::Function { .. } => "Function",
            Self::Return => "Return",
            Self::BreakOper => "BreakOper",
            Self::ContinueOper => "ContinueOper",
            Self::EditNodeAdd { .. } => "EditNodeAdd",
            Self::EditPropSet { .. } => "EditPropSet",
            Self::EditPropDel { .. } => "EditPropDel",
            Self::EditTagAdd { .. } => "EditTagAdd",
            Self::EditTagDel => "EditTagDel",
            Self::EditTagPropSet { .. } => "EditTagPropSet",
            Self::EditTagPropDel { .. } => "EditTagPropDel",
            Self::EditEdgeAdd { .. } => "EditEdgeAdd",
            Self::EditEdgeDel { .. } => "EditEdgeDel",
        }
    }

    /// Leaf values that read the current node
    fn is_node_bound(&self) -> bool {
        matches!(
            self,
            Self::RelPropValue { .. } | Self::UnivPropValue { .. } | Self::TagValue | Self::TagPropValue { .. }
        )
    }

    fn min_kids(&self) -> usize {
        match self {
            Self::VarDeref { .. }
            | Self::UnaryExprNode { .. }
            | Self::FuncCall
            | Self::CallKwarg { .. }
            | Self::TagValue
            | Self::TagPropValue { .. }
            | Self::NotCond
            | Self::TagCond
            | Self::RelPropCond { .. }
            | Self::AbsPropCond { .. }
            | Self::ArrayCond { .. }
            | Self::SubqCond { cmpr: None }
            | Self::DollarCond
            | Self::LiftPropBy { .. }
            | Self::LiftPropArray { .. }
            | Self::LiftTag { .. }
            | Self::LiftFormTag { .. }
            | Self::LiftTagProp { cmpr: None, .. }
            | Self::LiftTagTag { .. }
            | Self::N1Walk { .. }
            | Self::N2Walk { .. }
            | Self::FiltOper { .. }
            | Self::SetVarOper { .. }
            | Self::VarListSetOper { .. }
            | Self::VarEvalOper
            | Self::CaseEntry { .. }
            | Self::SwitchCase
            | Self::IfStmt
            | Self::Function { .. }
            | Self::EditNodeAdd { .. }
            | Self::EditPropSet { .. }
            | Self::EditTagAdd { .. }
            | Self::EditTagDel
            | Self::EditTagPropDel { .. } => 1,
            Self::ExprNode { .. }
            | Self::AndCond
            | Self::OrCond
            | Self::TagValuCond { .. }
            | Self::TagPropCond { .. }
            | Self::SubqCond { cmpr: Some(_) }
            | Self::LiftTagValu { .. }
            | Self::LiftTagProp { cmpr: Some(_), .. }
            | Self::ForLoop { .. }
            | Self::WhileLoop
            | Self::IfClause
            | Self::EditTagPropSet { .. }
            | Self::EditEdgeAdd { .. }
            | Self::EditEdgeDel { .. } => 2,
            _ => 0,
        }
    }
}

/// Query document form of a tree: `{type: <kind>, ...attributes, kids: [...]}`
#[derive(Debug, Clone, Deserialize)]
pub struct AstDoc {
    #[serde(flatten)]
    pub kind: AstKind,
    #[serde(default)]
    pub kids: Vec<AstDoc>,
}

#[derive(Debug, Clone)]
pub struct AstNode {
    pub kind: AstKind,
    pub kids: Vec<AstId>,
    pub parent: Option<AstId>,
    /// Index among the parent's kids
    pub pindex: usize,
}

/// Answers whether a variable name is bound only by runtime-safe values
pub trait VarScope {
    fn is_runt_var(&self, name: &str) -> bool;
}

/// A hint a condition gives to a preceding lift
#[derive(Debug, Clone, PartialEq)]
pub enum LiftHint {
    Tag(String),
}

#[derive(Debug, Clone, Default)]
pub struct Ast {
    nodes: Vec<AstNode>,
    root: Option<AstId>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the arena from a query document; the document root becomes the root
    pub fn from_doc(doc: &AstDoc) -> Self {
        let mut ast = Self::new();
        let root = ast.push_doc(doc);
        ast.root = Some(root);
        ast
    }

    fn push_doc(&mut self, doc: &AstDoc) -> AstId {
        let kids: Vec<AstId> = doc.kids.iter().map(|kid| self.push_doc(kid)).collect();
        let id = self.add(doc.kind.clone());
        for kid in kids {
            self.add_kid(id, kid);
        }
        id
    }

    /// Allocate a detached node
    pub fn add(&mut self, kind: AstKind) -> AstId {
        self.nodes.push(AstNode {
            kind,
            kids: Vec::new(),
            parent: None,
            pindex: 0,
        });
        self.nodes.len() - 1
    }

    /// Append `kid` to `parent`, stamping its parent and index
    pub fn add_kid(&mut self, parent: AstId, kid: AstId) {
        let pindex = self.nodes[parent].kids.len();
        self.nodes[parent].kids.push(kid);
        let node = &mut self.nodes[kid];
        node.parent = Some(parent);
        node.pindex = pindex;
    }

    pub fn root(&self) -> Option<AstId> {
        self.root
    }

    pub fn set_root(&mut self, root: AstId) {
        self.root = Some(root);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: AstId) -> &AstNode {
        &self.nodes[id]
    }

    pub fn kind(&self, id: AstId) -> &AstKind {
        &self.nodes[id].kind
    }

    pub fn kids(&self, id: AstId) -> &[AstId] {
        &self.nodes[id].kids
    }

    /// The `index`th kid, a syntax error when missing
    pub fn kid(&self, id: AstId, index: usize) -> Result<AstId> {
        self.nodes[id].kids.get(index).copied().ok_or_else(|| {
            StormError::BadSyntax(format!("{} is missing child {}", self.kind(id).name(), index))
        })
    }

    pub fn opt_kid(&self, id: AstId, index: usize) -> Option<AstId> {
        self.nodes[id].kids.get(index).copied()
    }

    pub fn parent(&self, id: AstId) -> Option<AstId> {
        self.nodes[id].parent
    }

    /// The sibling `offset` positions away, `None` at the bounds
    pub fn sibling(&self, id: AstId, offset: isize) -> Option<AstId> {
        let parent = self.nodes[id].parent?;
        let index = self.nodes[id].pindex.checked_add_signed(offset)?;
        self.nodes[parent].kids.get(index).copied()
    }

    /// Siblings to the right, nearest first
    pub fn iter_right(&self, id: AstId) -> impl Iterator<Item = AstId> + '_ {
        let start = self.nodes[id].pindex + 1;
        self.nodes[id]
            .parent
            .map(|parent| &self.nodes[parent].kids[start..])
            .unwrap_or(&[])
            .iter()
            .copied()
    }

    /// Depth first search of the subtree below `id`
    pub fn has_ast_class(&self, id: AstId, pred: impl Fn(&AstKind) -> bool) -> bool {
        let mut todo: Vec<AstId> = self.nodes[id].kids.clone();
        while let Some(next) = todo.pop() {
            if pred(&self.nodes[next].kind) {
                return true;
            }
            todo.extend(self.nodes[next].kids.iter().rev());
        }
        false
    }

    /// True when the value of `id` does not depend on node-bound variables
    pub fn is_runtsafe(&self, id: AstId, scope: &dyn VarScope) -> bool {
        match &self.nodes[id].kind {
            AstKind::VarValue { name } => scope.is_runt_var(name),
            kind if kind.is_node_bound() => false,
            _ => self.nodes[id].kids.iter().all(|kid| self.is_runtsafe(*kid, scope)),
        }
    }

    /// Lift hints a condition (or include filter) can give
    pub fn lift_hints(&self, id: AstId) -> Vec<LiftHint> {
        match &self.nodes[id].kind {
            AstKind::FiltOper { include: true } | AstKind::AndCond => {
                self.nodes[id].kids.iter().flat_map(|kid| self.lift_hints(*kid)).collect()
            }
            AstKind::TagCond => {
                let tag = self.nodes[id].kids.first().map(|kid| &self.nodes[*kid].kind);
                match tag {
                    Some(AstKind::Const { valu: Value::Str(tag) }) if !tag.contains('*') => {
                        vec![LiftHint::Tag(tag.clone())]
                    }
                    _ => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    /// Resolve operators, check structure and model references
    pub fn init(&mut self, model: &DataModel) -> Result<()> {
        for id in 0..self.nodes.len() {
            let need = self.nodes[id].kind.min_kids();
            if self.nodes[id].kids.len() < need {
                return Err(StormError::BadSyntax(format!(
                    "{} needs {} children, has {}",
                    self.nodes[id].kind.name(),
                    need,
                    self.nodes[id].kids.len()
                )));
            }
            let has_return = match &self.nodes[id].kind {
                AstKind::Function { .. } => {
                    Some(self.has_ast_class(id, |kind| matches!(kind, AstKind::Return)))
                }
                _ => None,
            };
            self.check_refs(id, model)?;
            match &mut self.nodes[id].kind {
                AstKind::ExprNode { oper, func } => {
                    *func = Some(binary_func(oper).ok_or_else(|| {
                        StormError::BadSyntax(format!("unknown expression operator {}", oper))
                    })?);
                }
                AstKind::UnaryExprNode { oper, func } => {
                    *func = Some(unary_func(oper).ok_or_else(|| {
                        StormError::BadSyntax(format!("unknown unary operator {}", oper))
                    })?);
                }
                AstKind::Function { has_return: slot, .. } => {
                    *slot = has_return.unwrap_or(false);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_refs(&self, id: AstId, model: &DataModel) -> Result<()> {
        match &self.nodes[id].kind {
            AstKind::LiftProp { prop }
            | AstKind::LiftPropBy { prop, .. }
            | AstKind::LiftPropArray { prop, .. }
            | AstKind::HasAbsPropCond { prop }
            | AstKind::AbsPropCond { prop, .. } => {
                if model.form(prop).is_none() && model.prop(prop).is_none() {
                    return Err(StormError::no_such_prop(prop.clone(), None));
                }
            }
            AstKind::FormPivot { form, .. }
            | AstKind::PivotInFrom { form, .. }
            | AstKind::LiftFormTag { form }
            | AstKind::EditNodeAdd { form, .. } => {
                model.req_form(form)?;
            }
            _ => {}
        }
        match &self.nodes[id].kind {
            AstKind::LiftTag { form: Some(form) }
            | AstKind::LiftTagValu { form: Some(form), .. }
            | AstKind::LiftTagProp { form: Some(form), .. }
            | AstKind::LiftTagTag { form: Some(form) } => {
                model.req_form(form)?;
            }
            _ => {}
        }
        match &self.nodes[id].kind {
            AstKind::TagPropCond { prop, .. }
            | AstKind::TagPropValue { prop }
            | AstKind::LiftTagProp { prop, .. }
            | AstKind::EditTagPropSet { prop, .. }
            | AstKind::EditTagPropDel { prop } => {
                if model.tagprop(prop).is_none() {
                    return Err(StormError::NoSuchTagProp { name: prop.clone() });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Local rewrites: constant folding and lift hints
    pub fn optimize(&mut self, model: &DataModel) {
        if let Some(root) = self.root {
            self.fold(root);
        }
        for id in 0..self.nodes.len() {
            let form = match &self.nodes[id].kind {
                AstKind::LiftProp { prop } if model.form(prop).is_some() => prop.clone(),
                _ => continue,
            };
            let hint = self
                .iter_right(id)
                .take_while(|oper| matches!(self.kind(*oper), AstKind::FiltOper { include: true }))
                .flat_map(|oper| self.lift_hints(oper))
                .next();
            if let Some(LiftHint::Tag(tag)) = hint {
                log::debug!("Rewriting lift of {} to a lift by #{}", form, tag);
                self.nodes[id].kind = AstKind::LiftFormTag { form };
                let kid = self.add(AstKind::Const { valu: Value::Str(tag) });
                self.add_kid(id, kid);
            }
        }
    }

    fn fold(&mut self, id: AstId) {
        for kid in self.nodes[id].kids.clone() {
            self.fold(kid);
        }
        let consts: Option<Vec<Value>> = self.nodes[id]
            .kids
            .iter()
            .map(|kid| match &self.nodes[*kid].kind {
                AstKind::Const { valu } => Some(valu.clone()),
                _ => None,
            })
            .collect();
        let Some(consts) = consts else {
            return;
        };
        let folded = match (&self.nodes[id].kind, consts.as_slice()) {
            (AstKind::ExprNode { func: Some(func), .. }, [lhs, rhs]) => func(lhs, rhs).ok(),
            (AstKind::UnaryExprNode { func: Some(func), .. }, [valu]) => func(valu).ok(),
            _ => None,
        };
        if let Some(valu) = folded {
            let node = &mut self.nodes[id];
            node.kind = AstKind::Const { valu };
            node.kids.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct Names(HashSet<String>);

    impl VarScope for Names {
        fn is_runt_var(&self, name: &str) -> bool {
            self.0.contains(name)
        }
    }

    fn parse(yaml: &str) -> Ast {
        let doc: AstDoc = serde_yaml::from_str(yaml).unwrap();
        Ast::from_doc(&doc)
    }

    fn model() -> DataModel {
        DataModel::from_yaml(
            r#"
types:
  - name: test:str
    kind: str
forms:
  - name: test:str
    props:
      - name: hehe
        type: str
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parent_and_siblings() {
        let ast = parse(
            r#"
type: query
kids:
  - {type: lift_prop, prop: "test:str"}
  - {type: pivot_out}
  - {type: pivot_in}
"#,
        );
        let root = ast.root().unwrap();
        let kids = ast.kids(root).to_vec();
        for (i, kid) in kids.iter().enumerate() {
            assert_eq!(ast.parent(*kid), Some(root));
            assert_eq!(ast.node(*kid).pindex, i);
            assert_eq!(ast.kids(root)[ast.node(*kid).pindex], *kid);
        }
        assert_eq!(ast.sibling(kids[1], -1), Some(kids[0]));
        assert_eq!(ast.sibling(kids[1], 1), Some(kids[2]));
        assert_eq!(ast.sibling(kids[0], -1), None);
        assert_eq!(ast.sibling(kids[2], 1), None);
        assert_eq!(ast.iter_right(kids[0]).collect::<Vec<_>>(), vec![kids[1], kids[2]]);
        assert_eq!(ast.iter_right(kids[2]).count(), 0);
    }

    #[test]
    fn test_runtsafe() {
        let ast = parse(
            r#"
type: expr_node
oper: "+"
kids:
  - {type: var_value, name: x}
  - type: expr_node
    oper: "*"
    kids:
      - {type: const, valu: 2}
      - {type: rel_prop_value, prop: hehe}
"#,
        );
        let root = ast.root().unwrap();
        let scope = Names(HashSet::from(["x".to_string()]));
        assert!(!ast.is_runtsafe(root, &scope));
        assert!(ast.is_runtsafe(ast.kids(root)[0], &scope));
        assert!(!ast.is_runtsafe(ast.kids(root)[0], &Names(HashSet::new())));
    }

    #[test]
    fn test_init_and_fold() {
        let mut ast = parse(
            r#"
type: query
kids:
  - type: set_var_oper
    name: x
    kids:
      - type: expr_node
        oper: "+"
        kids:
          - {type: const, valu: 2}
          - type: expr_node
            oper: "*"
            kids:
              - {type: const, valu: 3}
              - {type: const, valu: "4"}
"#,
        );
        let model = model();
        ast.init(&model).unwrap();
        ast.optimize(&model);
        let setvar = ast.kids(ast.root().unwrap())[0];
        let valu = ast.kids(setvar)[0];
        assert!(matches!(ast.kind(valu), AstKind::Const { valu: Value::Int(14) }));
        assert!(ast.kids(valu).is_empty());
    }

    #[test]
    fn test_init_errors() {
        let model = model();
        let mut ast = parse("{type: query, kids: [{type: lift_prop, prop: 'test:newp'}]}");
        assert!(matches!(ast.init(&model), Err(StormError::NoSuchProp { .. })));

        let mut ast = parse("{type: query, kids: [{type: filt_oper, include: true}]}");
        assert!(matches!(ast.init(&model), Err(StormError::BadSyntax(_))));

        let mut ast = parse(
            "{type: expr_node, oper: '**', kids: [{type: const, valu: 1}, {type: const, valu: 2}]}",
        );
        assert!(matches!(ast.init(&model), Err(StormError::BadSyntax(_))));
    }

    #[test]
    fn test_function_has_return() {
        let model = model();
        let mut ast = parse(
            r#"
type: query
kids:
  - type: function
    name: f
    kids:
      - type: sub_query
        kids:
          - type: if_stmt
            kids:
              - type: if_clause
                kids:
                  - {type: const, valu: true}
                  - type: sub_query
                    kids:
                      - {type: return, kids: [{type: const, valu: 1}]}
"#,
        );
        ast.init(&model).unwrap();
        let func = ast.kids(ast.root().unwrap())[0];
        assert!(matches!(ast.kind(func), AstKind::Function { has_return: true, .. }));
    }

    #[test]
    fn test_lift_hint_rewrite() {
        let model = model();
        let mut ast = parse(
            r#"
type: query
kids:
  - {type: lift_prop, prop: "test:str"}
  - type: filt_oper
    include: true
    kids:
      - type: and_cond
        kids:
          - {type: has_rel_prop_cond, prop: hehe}
          - {type: tag_cond, kids: [{type: const, valu: foo.bar}]}
"#,
        );
        ast.init(&model).unwrap();
        ast.optimize(&model);
        let kids = ast.kids(ast.root().unwrap()).to_vec();
        assert!(matches!(ast.kind(kids[0]), AstKind::LiftFormTag { form } if form == "test:str"));
        let tag = ast.kid(kids[0], 0).unwrap();
        assert!(matches!(ast.kind(tag), AstKind::Const { valu: Value::Str(t) } if t == "foo.bar"));
        assert!(matches!(ast.kind(kids[1]), AstKind::FiltOper { include: true }));

        let mut ast = parse(
            r#"
type: query
kids:
  - {type: lift_prop, prop: "test:str"}
  - type: filt_oper
    include: true
    kids:
      - type: or_cond
        kids:
          - {type: tag_cond, kids: [{type: const, valu: foo}]}
          - {type: tag_cond, kids: [{type: const, valu: bar}]}
"#,
        );
        ast.init(&model).unwrap();
        ast.optimize(&model);
        let first = ast.kids(ast.root().unwrap())[0];
        assert!(matches!(ast.kind(first), AstKind::LiftProp { .. }));
    }
}
