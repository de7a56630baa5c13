//! Basic/advanced classification
//!
//! BFE evaluates the literal host/path table first and only falls back to
//! condition expressions when the matched cluster is `ADVANCED_MODE`. A basic
//! rule therefore has to defer whenever an advanced rule on an equal or more
//! specific host shares part of its path space, otherwise the advanced rule
//! would never run.
//!
//! Classification runs in two passes over an immutable rule set: collect the
//! (host, path pattern) of every advanced rule, then test each basic rule
//! against that snapshot.

use crate::compiler::condition::is_wildcard;
use crate::compiler::model::PathMode;
use crate::compiler::rule_index::MatchRule;
use std::collections::{BTreeMap, BTreeSet};

/// Cluster of a basic rule whose traffic is dispatched by the advanced table
pub const ADVANCED_MODE: &str = "ADVANCED_MODE";

/// Advanced (host, path pattern) pairs of one build
#[derive(Debug, Default)]
pub struct AdvancedPatterns {
    by_host: BTreeMap<String, BTreeSet<String>>,
}

impl AdvancedPatterns {
    pub fn collect<'a>(rules: impl IntoIterator<Item = &'a MatchRule>) -> Self {
        let mut by_host: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for rule in rules.into_iter().filter(|r| !r.is_basic()) {
            by_host
                .entry(rule.host.clone())
                .or_default()
                .insert(rule.path_pattern());
        }
        Self { by_host }
    }

    pub fn covers(&self, basic: &MatchRule) -> bool {
        self.by_host
            .iter()
            .filter(|(host, _)| host_covered(&basic.host, host))
            .flat_map(|(_, patterns)| patterns.iter())
            .any(|pattern| path_covered(&basic.path, basic.path_mode, pattern))
    }
}

/// Advanced host at least as specific as the basic one
fn host_covered(basic: &str, advanced: &str) -> bool {
    if basic.is_empty() {
        return true;
    }
    if is_wildcard(basic) {
        // "*.example.com" -> ".example.com"
        return advanced.ends_with(&basic[1..]);
    }
    basic == advanced
}

/// Basic and advanced paths can match the same request
///
/// For a prefix basic path either side may be the shorter prefix. An exact
/// basic path only overlaps the same exact pattern.
fn path_covered(basic: &str, mode: PathMode, advanced_pattern: &str) -> bool {
    match mode {
        PathMode::Exact => advanced_pattern == basic,
        PathMode::Prefix => {
            let stem = basic.trim_end_matches('/');
            match advanced_pattern.strip_suffix("/*") {
                Some(advanced) => under(advanced, stem) || under(stem, advanced),
                None => under(advanced_pattern, stem),
            }
        }
    }
}

/// `path` equals `stem` or lies below it; "" is the root
fn under(path: &str, stem: &str) -> bool {
    path == stem
        || path
            .strip_prefix(stem)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Output of one classification pass
#[derive(Debug, Default)]
pub struct Classified<'a> {
    /// Basic rules with their covered flag, in input order
    pub basic: Vec<(&'a MatchRule, bool)>,
    /// Advanced rules and covered basic rules, in input order
    pub advanced: Vec<&'a MatchRule>,
}

impl Classified<'_> {
    pub fn covered(&self) -> impl Iterator<Item = &MatchRule> + '_ {
        self.basic.iter().filter(|(_, c)| *c).map(|(r, _)| *r)
    }
}

/// Split sorted active rules into the basic and advanced tables
pub fn classify<'a>(rules: &[&'a MatchRule]) -> Classified<'a> {
    let patterns = AdvancedPatterns::collect(rules.iter().copied());

    let mut classified = Classified::default();
    for rule in rules.iter().copied() {
        if !rule.is_basic() {
            classified.advanced.push(rule);
            continue;
        }
        let covered = patterns.covers(rule);
        classified.basic.push((rule, covered));
        if covered {
            classified.advanced.push(rule);
        }
    }
    classified
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::compiler::annotations::Predicate;
    use crate::compiler::model::ResourceKey;
    use crate::compiler::rule_index::RulePayload;
    use chrono::Utc;

    fn rule(host: &str, path: &str, mode: PathMode, advanced: bool) -> MatchRule {
        let predicates = if advanced {
            vec![Predicate::Cookie {
                key: "k".to_string(),
                value: "v".to_string(),
            }]
        } else {
            Vec::new()
        };
        MatchRule::new(
            ResourceKey::new("ns", "r"),
            Utc::now(),
            host,
            path,
            mode,
            predicates,
            format!("{}{}", host, path),
            RulePayload::Route,
        )
    }

    fn is_covered(basic: &MatchRule, advanced: &[MatchRule]) -> bool {
        AdvancedPatterns::collect(advanced.iter()).covers(basic)
    }

    #[test]
    fn test_same_host_same_path_covered() {
        let basic = rule("x", "/", PathMode::Prefix, false);
        assert!(is_covered(&basic, &[rule("x", "/", PathMode::Prefix, true)]));
    }

    #[test]
    fn test_other_host_not_covered() {
        let basic = rule("x", "/", PathMode::Prefix, false);
        assert!(!is_covered(&basic, &[rule("y", "/", PathMode::Prefix, true)]));
    }

    #[test]
    fn test_prefix_basic_covered_by_deeper_advanced() {
        let basic = rule("x", "/api", PathMode::Prefix, false);
        assert!(is_covered(&basic, &[rule("x", "/api/v1", PathMode::Prefix, true)]));
        assert!(is_covered(&basic, &[rule("x", "/api", PathMode::Exact, true)]));
        assert!(!is_covered(&basic, &[rule("x", "/apis", PathMode::Prefix, true)]));
        assert!(!is_covered(&basic, &[rule("x", "/", PathMode::Exact, true)]));
    }

    #[test]
    fn test_prefix_basic_covered_by_shallower_advanced() {
        let basic = rule("x", "/api", PathMode::Prefix, false);
        assert!(is_covered(&basic, &[rule("x", "/", PathMode::Prefix, true)]));
        assert!(is_covered(&basic, &[rule("x", "/api/", PathMode::Prefix, true)]));
        assert!(!is_covered(&basic, &[rule("x", "/ap", PathMode::Prefix, true)]));
    }

    #[test]
    fn test_exact_basic_only_covered_by_same_exact_path() {
        let basic = rule("x", "/api", PathMode::Exact, false);
        assert!(is_covered(&basic, &[rule("x", "/api", PathMode::Exact, true)]));
        assert!(!is_covered(&basic, &[rule("x", "/api", PathMode::Prefix, true)]));
        assert!(!is_covered(&basic, &[rule("x", "/", PathMode::Prefix, true)]));
    }

    #[test]
    fn test_wildcard_basic_covered_by_exact_host_at_root() {
        let basic = rule("*.example.com", "/api", PathMode::Prefix, false);
        assert!(is_covered(&basic, &[rule("a.example.com", "/", PathMode::Prefix, true)]));
        assert!(!is_covered(&basic, &[rule("a.example.com", "/web", PathMode::Prefix, true)]));
    }

    #[test]
    fn test_wildcard_basic_covered_by_suffix_hosts() {
        let basic = rule("*.example.com", "/", PathMode::Prefix, false);
        assert!(is_covered(&basic, &[rule("a.example.com", "/", PathMode::Prefix, true)]));
        assert!(is_covered(&basic, &[rule("*.example.com", "/", PathMode::Prefix, true)]));
        assert!(!is_covered(&basic, &[rule("example.org", "/", PathMode::Prefix, true)]));
    }

    #[test]
    fn test_exact_basic_not_covered_by_wildcard_advanced() {
        let basic = rule("a.example.com", "/", PathMode::Prefix, false);
        assert!(!is_covered(&basic, &[rule("*.example.com", "/", PathMode::Prefix, true)]));
    }

    #[test]
    fn test_classify_moves_covered_rules_to_advanced() {
        let rules = [
            rule("x", "/", PathMode::Prefix, true),
            rule("x", "/", PathMode::Prefix, false),
            rule("y", "/", PathMode::Prefix, false),
        ];
        let refs: Vec<&MatchRule> = rules.iter().collect();
        let classified = classify(&refs);

        assert_eq!(classified.basic.len(), 2);
        assert!(classified.basic[0].1, "x/ is covered");
        assert!(!classified.basic[1].1, "y/ is not covered");
        assert_eq!(classified.advanced.len(), 2);
        assert_eq!(classified.advanced[1].cluster, "x/");
    }

    #[test]
    fn test_classification_is_idempotent() {
        let rules = [
            rule("*.a.com", "/", PathMode::Prefix, false),
            rule("b.a.com", "/x", PathMode::Prefix, true),
            rule("c.com", "/x", PathMode::Exact, false),
        ];
        let refs: Vec<&MatchRule> = rules.iter().collect();
        let first: Vec<bool> = classify(&refs).basic.iter().map(|(_, c)| *c).collect();
        let second: Vec<bool> = classify(&refs).basic.iter().map(|(_, c)| *c).collect();
        assert_eq!(first, second);
        assert_eq!(first, vec![true, false]);
    }
}
