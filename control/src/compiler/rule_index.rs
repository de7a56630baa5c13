//! Rule index - priority ordering and conflict resolution
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           RuleIndex                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  rules:        RuleId → MatchRule          (arena)               │
//! │  by_owner:     ns/name → {RuleId}          (O(rules) deletion)   │
//! │  by_condition: condition → [RuleId]        (oldest first)        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rules sharing a condition are kept ordered by (creation time, owner). The
//! first one is active; later ones stay shadowed and are promoted when the
//! active rule's owner is deleted, so the outcome only depends on creation
//! timestamps, never on submission order.

use crate::compiler::annotations::redirect::RedirectAction;
use crate::compiler::annotations::rewrite::{check_host, check_path, RewriteStep};
use crate::compiler::annotations::Predicate;
use crate::compiler::condition::{self, SpecificityClass};
use crate::compiler::model::{PathMode, ResourceKey};
use crate::error::{CompilerError, Result};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

// =============================================================================
// MatchRule
// =============================================================================

/// What a rule produces once matched
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RulePayload {
    Route,
    Redirect(RedirectAction),
    Rewrite(Vec<RewriteStep>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(u64);

/// One (host, path) pair of a resource with everything needed to order it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRule {
    pub owner: ResourceKey,
    pub created: DateTime<Utc>,
    pub host: String,
    pub path: String,
    pub path_mode: PathMode,
    pub predicates: Vec<Predicate>,
    pub cluster: String,
    pub payload: RulePayload,
    specificity: SpecificityClass,
    condition: String,
}

impl MatchRule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        owner: ResourceKey,
        created: DateTime<Utc>,
        host: &str,
        path: &str,
        path_mode: PathMode,
        predicates: Vec<Predicate>,
        cluster: String,
        payload: RulePayload,
    ) -> Self {
        let condition = condition::compile(host, path, path_mode, &predicates);
        let specificity = SpecificityClass::of(host, path, path_mode);
        Self {
            owner,
            created,
            host: host.to_string(),
            path: path.to_string(),
            path_mode,
            predicates,
            cluster,
            payload,
            specificity,
            condition,
        }
    }

    pub fn condition(&self) -> &str {
        &self.condition
    }

    pub fn specificity(&self) -> SpecificityClass {
        self.specificity
    }

    /// Basic rules carry no predicates and fit the literal host/path table
    pub fn is_basic(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn path_pattern(&self) -> String {
        condition::path_pattern(&self.path, self.path_mode)
    }

    /// Same predicates, target and payload
    pub fn same_content(&self, other: &MatchRule) -> bool {
        self.same_match(other) && self.cluster == other.cluster
    }

    /// Same predicates and payload
    ///
    /// Clusters are named after their owning resource, so rules of two
    /// resources are compared without them. Redirect and rewrite actions come
    /// from annotations of their own and take part in the comparison.
    pub fn same_match(&self, other: &MatchRule) -> bool {
        self.predicates == other.predicates && self.payload == other.payload
    }

    /// Total order, most specific first
    pub fn priority_cmp(&self, other: &MatchRule) -> Ordering {
        self.specificity
            .cmp(&other.specificity)
            .then_with(|| other.host.len().cmp(&self.host.len()))
            .then_with(|| other.path.len().cmp(&self.path.len()))
            .then_with(|| other.predicates.len().cmp(&self.predicates.len()))
            .then_with(|| {
                self.predicates
                    .iter()
                    .map(Predicate::rank)
                    .cmp(other.predicates.iter().map(Predicate::rank))
            })
            .then_with(|| other.condition.len().cmp(&self.condition.len()))
            .then_with(|| self.condition.cmp(&other.condition))
            .then_with(|| self.cluster.cmp(&other.cluster))
    }

    fn age_cmp(&self, other: &MatchRule) -> Ordering {
        self.created
            .cmp(&other.created)
            .then_with(|| self.owner.cmp(&other.owner))
    }

    fn describe(&self) -> String {
        format!("rule [host: {}, path: {}]", self.host, self.path)
    }
}

/// Host and path syntax accepted in Ingress rules
pub fn validate_rule(host: &str, path: &str) -> std::result::Result<(), String> {
    if !host.is_empty() {
        check_host(host)?;
    }
    if !path.is_empty() {
        check_path(path)?;
    }
    Ok(())
}

// =============================================================================
// RuleIndex
// =============================================================================

#[derive(Debug, Default)]
pub struct RuleIndex {
    next_id: u64,
    rules: HashMap<RuleId, MatchRule>,
    by_owner: HashMap<ResourceKey, BTreeSet<RuleId>>,
    by_condition: HashMap<String, Vec<RuleId>>,
}

impl RuleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn contains_owner(&self, owner: &ResourceKey) -> bool {
        self.by_owner.contains_key(owner)
    }

    /// Insert all rules of one resource, or none of them
    pub fn submit(&mut self, rules: Vec<MatchRule>) -> Result<()> {
        let mut inserted = Vec::with_capacity(rules.len());
        for rule in rules {
            match self.insert(rule) {
                Ok(Some(id)) => inserted.push(id),
                Ok(None) => {}
                Err(e) => {
                    for id in inserted {
                        self.remove(id);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Returns `None` when an identical rule of the same owner already exists
    fn insert(&mut self, rule: MatchRule) -> Result<Option<RuleId>> {
        if let Some(ids) = self.by_condition.get(rule.condition()) {
            for existing in ids.iter().filter_map(|id| self.rules.get(id)) {
                if existing.owner == rule.owner {
                    if existing.same_content(&rule) {
                        return Ok(None);
                    }
                    return Err(CompilerError::conflict(
                        &rule.owner,
                        &existing.owner,
                        format!("{} is defined twice with different targets", rule.describe()),
                    ));
                }
                if existing.created == rule.created && !existing.same_match(&rule) {
                    return Err(CompilerError::conflict(
                        &rule.owner,
                        &existing.owner,
                        rule.describe(),
                    ));
                }
            }
        }

        let id = RuleId(self.next_id);
        self.next_id += 1;

        let condition = rule.condition().to_string();
        let owner = rule.owner.clone();
        self.rules.insert(id, rule);
        self.by_owner.entry(owner).or_default().insert(id);

        let ids = self.by_condition.entry(condition).or_default();
        ids.push(id);
        let rules = &self.rules;
        ids.sort_by(|a, b| match (rules.get(a), rules.get(b)) {
            (Some(a), Some(b)) => a.age_cmp(b),
            _ => Ordering::Equal,
        });

        if ids.len() > 1 {
            if let (Some(active), Some(new)) = (rules.get(&ids[0]), rules.get(&id)) {
                if ids[0] != id && !active.same_match(new) {
                    warn!(
                        "{} of {} is shadowed by older ingress {}",
                        new.describe(),
                        new.owner,
                        active.owner
                    );
                } else if ids[0] == id {
                    warn!(
                        "{} of {} takes precedence over newer ingresses",
                        new.describe(),
                        new.owner
                    );
                }
            }
        }

        Ok(Some(id))
    }

    fn remove(&mut self, id: RuleId) -> Option<MatchRule> {
        let rule = self.rules.remove(&id)?;

        if let Some(ids) = self.by_owner.get_mut(&rule.owner) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_owner.remove(&rule.owner);
            }
        }
        if let Some(ids) = self.by_condition.get_mut(rule.condition()) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_condition.remove(rule.condition());
            }
        }
        Some(rule)
    }

    /// Remove every rule of `owner`, promoting shadowed rules where needed
    pub fn remove_owner(&mut self, owner: &ResourceKey) -> Vec<MatchRule> {
        let Some(ids) = self.by_owner.get(owner).cloned() else {
            return Vec::new();
        };
        let removed: Vec<MatchRule> = ids.into_iter().filter_map(|id| self.remove(id)).collect();
        debug!("Removed {} rules of {}", removed.len(), owner);
        removed
    }

    /// Rules that take effect, one per condition, sorted most specific first
    pub fn active_rules(&self) -> Vec<&MatchRule> {
        let mut active: Vec<&MatchRule> = self
            .by_condition
            .values()
            .filter_map(|ids| ids.first())
            .filter_map(|id| self.rules.get(id))
            .collect();
        active.sort_by(|a, b| a.priority_cmp(b));
        active
    }

    /// Active rules grouped by host then path
    pub fn by_host(&self) -> BTreeMap<&str, BTreeMap<&str, Vec<&MatchRule>>> {
        let mut view: BTreeMap<&str, BTreeMap<&str, Vec<&MatchRule>>> = BTreeMap::new();
        for rule in self.active_rules() {
            view.entry(rule.host.as_str())
                .or_default()
                .entry(rule.path.as_str())
                .or_default()
                .push(rule);
        }
        view
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let owned: usize = self.by_owner.values().map(BTreeSet::len).sum();
        let conditioned: usize = self.by_condition.values().map(Vec::len).sum();
        assert_eq!(owned, self.rules.len(), "owner index out of sync");
        assert_eq!(conditioned, self.rules.len(), "condition index out of sync");
        for (owner, ids) in &self.by_owner {
            for id in ids {
                let rule = self.rules.get(id).expect("owner index points at missing rule");
                assert_eq!(&rule.owner, owner);
                assert!(self.by_condition[rule.condition()].contains(id));
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::compiler::annotations::redirect::RedirectCommand;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn route(owner: &str, created: i64, host: &str, path: &str, cluster: &str) -> MatchRule {
        MatchRule::new(
            ResourceKey::parse(owner).unwrap(),
            at(created),
            host,
            path,
            PathMode::Prefix,
            Vec::new(),
            cluster.to_string(),
            RulePayload::Route,
        )
    }

    fn with_cookie(rule: MatchRule) -> MatchRule {
        MatchRule::new(
            rule.owner,
            rule.created,
            &rule.host,
            &rule.path,
            rule.path_mode,
            vec![Predicate::Cookie {
                key: "k".to_string(),
                value: "v".to_string(),
            }],
            rule.cluster,
            rule.payload,
        )
    }

    fn clusters(index: &RuleIndex) -> Vec<String> {
        index
            .active_rules()
            .iter()
            .map(|r| r.cluster.clone())
            .collect()
    }

    #[test]
    fn test_older_rule_wins_regardless_of_submission_order() {
        let mut forward = RuleIndex::new();
        forward.submit(vec![route("ns/a", 1, "x", "/", "a")]).unwrap();
        forward.submit(vec![route("ns/b", 2, "x", "/", "b")]).unwrap();

        let mut backward = RuleIndex::new();
        backward.submit(vec![route("ns/b", 2, "x", "/", "b")]).unwrap();
        backward.submit(vec![route("ns/a", 1, "x", "/", "a")]).unwrap();

        assert_eq!(clusters(&forward), vec!["a"]);
        assert_eq!(clusters(&backward), vec!["a"]);
        forward.assert_consistent();
        backward.assert_consistent();
    }

    #[test]
    fn test_deleting_winner_promotes_shadowed_rule() {
        let mut index = RuleIndex::new();
        index.submit(vec![route("ns/a", 1, "x", "/", "a")]).unwrap();
        index.submit(vec![route("ns/b", 2, "x", "/", "b")]).unwrap();

        let removed = index.remove_owner(&ResourceKey::new("ns", "a"));
        assert_eq!(removed.len(), 1);
        assert_eq!(clusters(&index), vec!["b"]);
        index.assert_consistent();
    }

    #[test]
    fn test_equal_time_same_match_deduplicates() {
        // Clusters differ because they carry the owner name
        let mut index = RuleIndex::new();
        index.submit(vec![route("ns/a", 1, "x", "/", "ns/a_web_80")]).unwrap();
        index.submit(vec![route("ns/b", 1, "x", "/", "ns/b_web_80")]).unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(clusters(&index), vec!["ns/a_web_80"], "identical rules emit once");

        index.remove_owner(&ResourceKey::new("ns", "a"));
        assert_eq!(clusters(&index), vec!["ns/b_web_80"]);
        index.assert_consistent();
    }

    #[test]
    fn test_equal_time_different_redirect_conflicts() {
        let redirect = |owner: &str, target: &str| {
            let rule = route(owner, 1, "x", "/", "c");
            MatchRule::new(
                rule.owner,
                rule.created,
                &rule.host,
                &rule.path,
                rule.path_mode,
                rule.predicates,
                rule.cluster,
                RulePayload::Redirect(RedirectAction {
                    command: RedirectCommand::UrlSet,
                    param: target.to_string(),
                    status: 302,
                }),
            )
        };

        let mut index = RuleIndex::new();
        index.submit(vec![redirect("ns/a", "https://a.com/")]).unwrap();
        let err = index
            .submit(vec![redirect("ns/b", "https://b.com/")])
            .unwrap_err();

        assert!(matches!(err, CompilerError::Conflict { .. }));
        assert!(err.to_string().contains("ns/b"));
        assert!(err.to_string().contains("ns/a"));
        assert_eq!(index.len(), 1);

        // Same action from another resource is a duplicate
        index.submit(vec![redirect("ns/c", "https://a.com/")]).unwrap();
        assert_eq!(index.active_rules().len(), 1);
        index.assert_consistent();
    }

    #[test]
    fn test_failed_submit_rolls_back_inserted_rules() {
        let mut index = RuleIndex::new();
        index.submit(vec![route("ns/a", 1, "x", "/a", "a")]).unwrap();

        let result = index.submit(vec![
            route("ns/b", 1, "y", "/", "b"),
            route("ns/b", 1, "x", "/a", "b"),
            route("ns/b", 1, "x", "/a", "other"),
        ]);

        assert!(result.is_err());
        assert!(!index.contains_owner(&ResourceKey::new("ns", "b")));
        assert_eq!(index.len(), 1);
        index.assert_consistent();
    }

    #[test]
    fn test_same_owner_duplicate() {
        let mut index = RuleIndex::new();
        index
            .submit(vec![route("ns/a", 1, "x", "/", "a"), route("ns/a", 1, "x", "/", "a")])
            .unwrap();
        assert_eq!(index.len(), 1);

        let err = index
            .submit(vec![route("ns/c", 1, "z", "/", "c1"), route("ns/c", 1, "z", "/", "c2")])
            .unwrap_err();
        assert!(matches!(err, CompilerError::Conflict { .. }));
        index.assert_consistent();
    }

    #[test]
    fn test_priority_order() {
        let mut index = RuleIndex::new();
        index
            .submit(vec![
                route("ns/a", 1, "", "/", "catch-all"),
                route("ns/a", 1, "*.example.com", "/", "wildcard"),
                route("ns/a", 1, "www.example.com", "/", "host-only"),
                route("ns/a", 1, "www.example.com", "/api", "host-path"),
                route("ns/a", 1, "www.example.com", "/api/v1", "host-longer-path"),
                route("ns/a", 1, "", "/static", "path-only"),
            ])
            .unwrap();
        index
            .submit(vec![with_cookie(route("ns/b", 1, "www.example.com", "/api", "canary"))])
            .unwrap();

        assert_eq!(
            clusters(&index),
            vec![
                "host-longer-path",
                "canary",
                "host-path",
                "host-only",
                "wildcard",
                "path-only",
                "catch-all"
            ]
        );
    }

    #[test]
    fn test_cookie_ranks_before_header() {
        let header = MatchRule::new(
            ResourceKey::new("ns", "h"),
            at(1),
            "x",
            "/",
            PathMode::Prefix,
            vec![Predicate::Header {
                key: "a".to_string(),
                value: "b".to_string(),
            }],
            "h".to_string(),
            RulePayload::Route,
        );
        let cookie = with_cookie(route("ns/c", 1, "x", "/", "c"));
        assert_eq!(cookie.priority_cmp(&header), Ordering::Less);
    }

    #[test]
    fn test_by_host_view() {
        let mut index = RuleIndex::new();
        index
            .submit(vec![route("ns/a", 1, "x", "/a", "a"), route("ns/a", 1, "x", "/b", "b")])
            .unwrap();
        let view = index.by_host();
        assert_eq!(view["x"].len(), 2);
        assert_eq!(view["x"]["/a"][0].cluster, "a");
    }

    #[test]
    fn test_validate_rule() {
        assert!(validate_rule("", "").is_ok());
        assert!(validate_rule("*.example.com", "/a").is_ok());
        assert!(validate_rule("a.*.com", "/a").is_err());
        assert!(validate_rule("x", "/a*").is_err());
    }
}
