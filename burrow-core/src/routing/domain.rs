//! Reverse-labelled domain rule trie.

use std::collections::HashMap;

use super::Rule;
use crate::error::{Error, Result};

/// A trie node. `rule` fires only on an exact whole-name match; `wild`
/// fires for any name strictly below this node (authored as `*.suffix`).
#[derive(Debug, Default)]
pub(crate) struct DomainNode {
    rule: Rule,
    wild: Rule,
    children: HashMap<String, DomainNode>,
}

impl DomainNode {
    /// Inserts `pattern` with `rule`. A single `*` is allowed only as the
    /// whole leftmost label.
    pub(crate) fn insert(&mut self, pattern: &str, rule: Rule) -> Result<()> {
        let parts: Vec<&str> = pattern.split('.').collect();
        if pattern.matches('*').count() > 1 || (pattern.contains('*') && parts[0] != "*") {
            return Err(Error::rules(format!(
                "domain {:?} contains illegal wildcards",
                pattern
            )));
        }

        let mut node = self;
        for part in parts[1..].iter().rev() {
            node = node.children.entry(part.to_string()).or_default();
        }

        if parts[0] == "*" {
            node.wild = rule;
        } else {
            let leaf = node.children.entry(parts[0].to_string()).or_default();
            leaf.rule = rule;
        }
        Ok(())
    }

    /// Walks `host`'s labels right to left, tentatively recording a node's
    /// wildcard rule while labels remain and its exact rule once the whole
    /// name is consumed. The deepest recorded rule wins.
    pub(crate) fn lookup(&self, host: &str) -> Rule {
        let parts: Vec<&str> = host.split('.').collect();
        let mut rule = Rule::None;
        let mut node = self;
        for (i, part) in parts.iter().enumerate().rev() {
            match node.children.get(*part) {
                Some(child) => {
                    node = child;
                    if i > 0 {
                        if node.wild != Rule::None {
                            rule = node.wild;
                        }
                    } else if node.rule != Rule::None {
                        rule = node.rule;
                    }
                }
                None => break,
            }
        }
        rule
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_domains_match_exactly() {
        let mut tree = DomainNode::default();
        tree.insert("b.c.d", Rule::Direct).unwrap();
        assert_eq!(tree.lookup("b.c.d"), Rule::Direct);
        assert_eq!(tree.lookup("x.b.c.d"), Rule::None);
        assert_eq!(tree.lookup("c.d"), Rule::None);
    }

    #[test]
    fn wildcards_cover_the_subtree_not_the_apex() {
        let mut tree = DomainNode::default();
        tree.insert("*.tech", Rule::Direct).unwrap();
        assert_eq!(tree.lookup("luyuhuang.tech"), Rule::Direct);
        assert_eq!(tree.lookup("admin.luyuhuang.tech"), Rule::Direct);
        assert_eq!(tree.lookup("tech"), Rule::None);
    }

    #[test]
    fn wildcard_and_exact_rules_coexist_on_one_suffix() {
        let mut tree = DomainNode::default();
        tree.insert("*.a.b", Rule::Proxy).unwrap();
        tree.insert("a.b", Rule::Direct).unwrap();
        assert_eq!(tree.lookup("x.a.b"), Rule::Proxy);
        assert_eq!(tree.lookup("a.b"), Rule::Direct);
    }

    #[test]
    fn misplaced_wildcards_are_rejected() {
        let mut tree = DomainNode::default();
        assert!(tree.insert("a.*.com", Rule::Proxy).is_err());
        assert!(tree.insert("*x.com", Rule::Proxy).is_err());
        assert!(tree.insert("*.*.com", Rule::Proxy).is_err());
    }
}
