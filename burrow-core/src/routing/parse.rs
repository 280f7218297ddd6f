//! Rule grammar.
//!
//! One `<pattern> <action>` per line. Blank lines and `#` comments are
//! ignored. A line without an action inherits the most recent explicit one;
//! the first rule must therefore carry an action. A lone `*` sets the
//! fallback rule.

use std::collections::HashMap;
use std::path::Path;

use super::{Rule, RuleSet};
use crate::error::{Error, Result};

pub(crate) fn action(token: &str) -> Option<Rule> {
    match token {
        "proxy" | "P" => Some(Rule::Proxy),
        "direct" | "D" => Some(Rule::Direct),
        "auto" | "A" => Some(Rule::Auto),
        _ => None,
    }
}

pub(crate) fn from_map(rules: &HashMap<String, String>) -> Result<RuleSet> {
    let mut set = RuleSet::default();
    for (pattern, token) in rules {
        let rule = action(token).ok_or_else(|| {
            Error::rules(format!(
                "rule for {:?} got {:?}, want proxy|direct|auto|P|D|A",
                pattern, token
            ))
        })?;
        set.insert(pattern, rule)?;
    }
    Ok(set)
}

pub(crate) fn from_file(path: &Path) -> Result<RuleSet> {
    let text = std::fs::read_to_string(path)?;
    parse_lines(&text)
}

pub(crate) fn parse_lines(text: &str) -> Result<RuleSet> {
    let mut set = RuleSet::default();
    let mut current = Rule::None;
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let pattern = match line.split_once([' ', '\t']) {
            None => {
                if current == Rule::None {
                    return Err(Error::rules(format!("illegal rule in line {}", idx + 1)));
                }
                line
            }
            Some((pattern, rest)) => {
                let token = rest.trim();
                current = action(token).ok_or_else(|| {
                    Error::rules(format!(
                        "rule in line {} got {:?}, want proxy|direct|auto|P|D|A",
                        idx + 1,
                        token
                    ))
                })?;
                pattern
            }
        };
        set.insert(pattern, current)?;
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sticky_action_within_a_block() {
        let set = parse_lines(
            "# proxied sites\n\
             mail.google.com proxy\n\
             drive.google.com\n\
             \n\
             intranet.corp direct\n\
             10.0.0.0/8\n",
        )
        .unwrap();
        assert_eq!(set.query("mail.google.com"), Rule::Proxy);
        assert_eq!(set.query("drive.google.com"), Rule::Proxy);
        assert_eq!(set.query("intranet.corp"), Rule::Direct);
        assert_eq!(set.query("10.20.30.40"), Rule::Direct);
    }

    #[test]
    fn first_rule_without_action_is_illegal() {
        let err = parse_lines("# comment\n\nexample.com\n").unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(parse_lines("example.com maybe\n").is_err());
    }

    #[test]
    fn lone_star_sets_the_fallback() {
        let set = parse_lines("* direct\n").unwrap();
        assert_eq!(set.query("anything.example"), Rule::Direct);
        assert_eq!(set.query("203.0.113.9"), Rule::Direct);
    }

    #[test]
    fn fallback_defaults_to_auto() {
        let set = parse_lines("example.com proxy\n").unwrap();
        assert_eq!(set.query("unmatched.example"), Rule::Auto);
    }
}
