// SPDX-License-Identifier: MIT

//! Permission gate consulted before every mutation
//!
//! Permissions are dotted paths such as `node.tag.add.foo.bar`. [`PermRules`]
//! matches rules by path prefix, first match wins.

use serde::Deserialize;
use std::fs;
use std::path::Path;

use super::error::Result;

pub trait PermGate: Send + Sync {
    fn allowed(&self, perm: &[String]) -> bool;
}

/// Grants everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermGate for AllowAll {
    fn allowed(&self, _perm: &[String]) -> bool {
        true
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermRule {
    pub allow: bool,
    /// Dotted permission prefix
    pub perm: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PermRules {
    #[serde(default)]
    pub rules: Vec<PermRule>,
    /// Outcome when no rule matches
    #[serde(default)]
    pub default: bool,
}

impl PermRules {
    pub fn parse_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse_yaml(&content)
    }
}

impl PermGate for PermRules {
    fn allowed(&self, perm: &[String]) -> bool {
        for rule in &self.rules {
            let parts: Vec<&str> = rule.perm.split('.').filter(|p| !p.is_empty()).collect();
            if parts.len() <= perm.len() && parts.iter().zip(perm).all(|(rule, have)| *rule == have) {
                return rule.allow;
            }
        }
        self.default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perm(text: &str) -> Vec<String> {
        text.split('.').map(str::to_string).collect()
    }

    #[test]
    fn test_rules_first_match_wins() {
        let rules = PermRules::parse_yaml(
            r#"
default: false
rules:
  - allow: false
    perm: node.tag.add.secret
  - allow: true
    perm: node
"#,
        )
        .unwrap();
        assert!(rules.allowed(&perm("node.tag.add.foo")));
        assert!(!rules.allowed(&perm("node.tag.add.secret.x")));
        assert!(rules.allowed(&perm("node.add.inet:fqdn")));
        assert!(!rules.allowed(&perm("view.add")));
        assert!(AllowAll.allowed(&perm("anything")));
    }
}
