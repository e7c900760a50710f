// SPDX-License-Identifier: MIT

//! Query document loader
//!
//! Queries arrive as serde documents (YAML or JSON) describing the tree
//! directly. The loader parses them and prepares a runnable [`Ast`].

use std::fs;
use std::path::Path;

use super::ast::{Ast, AstDoc};
use crate::core::error::Result;
use crate::core::model::DataModel;

/// Loads query documents from YAML or JSON
pub struct QueryLoader;

impl QueryLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load a query document; `.json` files are read as JSON, everything else as YAML
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<AstDoc> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&content),
            _ => Self::parse_yaml(&content),
        }
    }

    /// Parse a query document from a YAML string
    pub fn parse_yaml(content: &str) -> Result<AstDoc> {
        let doc: AstDoc = serde_yaml::from_str(content)?;
        Ok(doc)
    }

    /// Parse a query document from a JSON string
    pub fn parse_json(content: &str) -> Result<AstDoc> {
        let doc: AstDoc = serde_json::from_str(content)?;
        Ok(doc)
    }

    /// Build the tree, then run the init and optimize passes against `model`
    pub fn compile(doc: &AstDoc, model: &DataModel) -> Result<Ast> {
        let mut ast = Ast::from_doc(doc);
        ast.init(model)?;
        ast.optimize(model);
        log::debug!("Compiled query with {} nodes", ast.len());
        Ok(ast)
    }
}

impl Default for QueryLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::StormError;
    use crate::storm::ast::AstKind;

    #[test]
    fn test_parse_yaml_query() {
        let yaml = r#"
type: query
kids:
  - {type: lift_prop, prop: "syn:tag"}
  - type: filt_oper
    include: true
    kids:
      - {type: rel_prop_cond, prop: depth, cmpr: ">", kids: [{type: const, valu: 0}]}
"#;
        let doc = QueryLoader::parse_yaml(yaml).unwrap();
        assert!(matches!(doc.kind, AstKind::Query));
        assert_eq!(doc.kids.len(), 2);
        let model = DataModel::builtin().unwrap();
        let ast = QueryLoader::compile(&doc, &model).unwrap();
        assert_eq!(ast.len(), 5);
    }

    #[test]
    fn test_parse_json_query() {
        let json = r#"{"type": "query", "kids": [{"type": "pivot_out", "isjoin": true}]}"#;
        let doc = QueryLoader::parse_json(json).unwrap();
        assert!(matches!(doc.kids[0].kind, AstKind::PivotOut { isjoin: true }));
    }

    #[test]
    fn test_compile_checks_model() {
        let doc = QueryLoader::parse_yaml("{type: query, kids: [{type: form_pivot, form: 'newp:form'}]}").unwrap();
        let model = DataModel::builtin().unwrap();
        assert!(matches!(
            QueryLoader::compile(&doc, &model),
            Err(StormError::NoSuchForm { .. })
        ));
        assert!(QueryLoader::parse_yaml("{type: not_a_kind}").is_err());
    }
}
