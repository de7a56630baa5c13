//! BFE documents built from the rule indexes
//!
//! Every document is serialized without its version field; the store adds it
//! when the file is rendered.

use crate::compiler::condition::ALWAYS_MATCH;
use crate::compiler::coverage::{classify, ADVANCED_MODE};
use crate::compiler::rule_index::{RuleIndex, RulePayload};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// All traffic belongs to a single product
pub const DEFAULT_PRODUCT: &str = "default";

/// `ClientIdOnly` in BFE's hash strategy enum
pub const HASH_STRATEGY_CLIENT_ID_ONLY: u8 = 0;
pub const HASH_HEADER: &str = "bfe-non-existence";

// =============================================================================
// server_data_conf
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostTableConf {
    pub default_product: String,
    pub hosts: BTreeMap<String, Vec<String>>,
    pub host_tags: BTreeMap<String, Vec<String>>,
}

impl Default for HostTableConf {
    fn default() -> Self {
        let product = || BTreeMap::from([(DEFAULT_PRODUCT.to_string(), vec![DEFAULT_PRODUCT.to_string()])]);
        Self {
            default_product: DEFAULT_PRODUCT.to_string(),
            hosts: product(),
            host_tags: product(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BasicRouteRule {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hostname: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    pub cluster_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AdvancedRouteRule {
    pub cond: String,
    pub cluster_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RouteTableConf {
    pub basic_rule: BTreeMap<String, Vec<BasicRouteRule>>,
    pub product_rule: BTreeMap<String, Vec<AdvancedRouteRule>>,
}

impl RouteTableConf {
    pub fn basic(&self) -> &[BasicRouteRule] {
        self.basic_rule
            .get(DEFAULT_PRODUCT)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn advanced(&self) -> &[AdvancedRouteRule] {
        self.product_rule
            .get(DEFAULT_PRODUCT)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Clusters BFE must know about, `ADVANCED_MODE` excluded
    pub fn clusters(&self) -> Vec<&str> {
        let mut clusters: Vec<&str> = self
            .basic()
            .iter()
            .map(|r| r.cluster_name.as_str())
            .chain(self.advanced().iter().map(|r| r.cluster_name.as_str()))
            .filter(|c| *c != ADVANCED_MODE)
            .collect();
        clusters.sort_unstable();
        clusters.dedup();
        clusters
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendCheck {
    #[serde(rename = "Schem")]
    pub schem: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HashConf {
    pub hash_strategy: u8,
    pub hash_header: String,
    pub session_sticky: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GslbBasic {
    pub hash_conf: HashConf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterConf {
    pub check_conf: BackendCheck,
    pub gslb_basic: GslbBasic,
}

impl Default for ClusterConf {
    fn default() -> Self {
        Self {
            check_conf: BackendCheck {
                schem: "tcp".to_string(),
            },
            gslb_basic: GslbBasic {
                hash_conf: HashConf {
                    hash_strategy: HASH_STRATEGY_CLIENT_ID_ONLY,
                    hash_header: HASH_HEADER.to_string(),
                    session_sticky: false,
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BfeClusterConf {
    pub config: BTreeMap<String, ClusterConf>,
}

/// Route table with basic rules demoted where advanced rules cover them
///
/// Each advanced (host, path) also gets an `ADVANCED_MODE` basic entry.
/// `default_cluster` appends a catch-all rule whenever any rule exists.
pub fn route_table(index: &RuleIndex, default_cluster: Option<&str>) -> RouteTableConf {
    let active = index.active_rules();
    let classified = classify(&active);

    let mut basic: Vec<BasicRouteRule> = classified
        .basic
        .iter()
        .map(|(rule, covered)| BasicRouteRule {
            hostname: hostname(&rule.host),
            path: vec![rule.path_pattern()],
            cluster_name: if *covered {
                ADVANCED_MODE.to_string()
            } else {
                rule.cluster.clone()
            },
        })
        .collect();

    // Every advanced (host, path) needs a host table entry to be reached
    let mut seen: BTreeSet<(Vec<String>, Vec<String>)> = basic
        .iter()
        .map(|r| (r.hostname.clone(), r.path.clone()))
        .collect();
    for rule in classified.advanced.iter().filter(|r| !r.is_basic()) {
        let key = (hostname(&rule.host), vec![rule.path_pattern()]);
        if seen.insert(key.clone()) {
            basic.push(BasicRouteRule {
                hostname: key.0,
                path: key.1,
                cluster_name: ADVANCED_MODE.to_string(),
            });
        }
    }

    let mut advanced: Vec<AdvancedRouteRule> = classified
        .advanced
        .iter()
        .map(|rule| AdvancedRouteRule {
            cond: rule.condition().to_string(),
            cluster_name: rule.cluster.clone(),
        })
        .collect();

    if let (Some(cluster), false) = (default_cluster, active.is_empty()) {
        advanced.push(AdvancedRouteRule {
            cond: ALWAYS_MATCH.to_string(),
            cluster_name: cluster.to_string(),
        });
    }

    debug!(
        "Route table: {} basic ({} covered), {} advanced",
        basic.len(),
        classified.covered().count(),
        advanced.len()
    );

    RouteTableConf {
        basic_rule: BTreeMap::from([(DEFAULT_PRODUCT.to_string(), basic)]),
        product_rule: BTreeMap::from([(DEFAULT_PRODUCT.to_string(), advanced)]),
    }
}

/// Host table key; an empty or bare wildcard host matches every host
fn hostname(host: &str) -> Vec<String> {
    if host.is_empty() || host == "*" {
        Vec::new()
    } else {
        vec![host.to_string()]
    }
}

pub fn cluster_conf(route_table: &RouteTableConf) -> BfeClusterConf {
    BfeClusterConf {
        config: route_table
            .clusters()
            .into_iter()
            .map(|c| (c.to_string(), ClusterConf::default()))
            .collect(),
    }
}

// =============================================================================
// Modules
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModuleAction {
    pub cmd: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RedirectRule {
    pub cond: String,
    pub actions: Vec<ModuleAction>,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RewriteRule {
    pub cond: String,
    pub actions: Vec<ModuleAction>,
    pub last: bool,
}

/// `mod_redirect/redirect.data` and `mod_rewrite/rewrite.data` share this layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModuleConf<R> {
    pub config: BTreeMap<String, Vec<R>>,
}

pub fn redirect_conf(index: &RuleIndex) -> ModuleConf<RedirectRule> {
    let rules = index
        .active_rules()
        .into_iter()
        .filter_map(|rule| match &rule.payload {
            RulePayload::Redirect(action) => Some(RedirectRule {
                cond: rule.condition().to_string(),
                actions: vec![ModuleAction {
                    cmd: action.command.as_str().to_string(),
                    params: vec![action.param.clone()],
                }],
                status: action.status,
            }),
            _ => None,
        })
        .collect();

    ModuleConf {
        config: BTreeMap::from([(DEFAULT_PRODUCT.to_string(), rules)]),
    }
}

pub fn rewrite_conf(index: &RuleIndex) -> ModuleConf<RewriteRule> {
    let rules = index
        .active_rules()
        .into_iter()
        .filter_map(|rule| match &rule.payload {
            RulePayload::Rewrite(steps) => Some(RewriteRule {
                cond: rule.condition().to_string(),
                actions: steps
                    .iter()
                    .map(|step| ModuleAction {
                        cmd: step.command.as_str().to_string(),
                        params: step.params.clone(),
                    })
                    .collect(),
                last: true,
            }),
            _ => None,
        })
        .collect();

    ModuleConf {
        config: BTreeMap::from([(DEFAULT_PRODUCT.to_string(), rules)]),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::compiler::annotations::Predicate;
    use crate::compiler::model::{PathMode, ResourceKey};
    use crate::compiler::rule_index::MatchRule;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn rule(owner: &str, host: &str, path: &str, cookie: bool, cluster: &str) -> MatchRule {
        let predicates = if cookie {
            vec![Predicate::Cookie {
                key: "k".to_string(),
                value: "v".to_string(),
            }]
        } else {
            Vec::new()
        };
        MatchRule::new(
            ResourceKey::parse(owner).unwrap(),
            Utc.timestamp_opt(1, 0).unwrap(),
            host,
            path,
            PathMode::Prefix,
            predicates,
            cluster.to_string(),
            RulePayload::Route,
        )
    }

    #[test]
    fn test_host_table_layout() {
        let value = serde_json::to_value(HostTableConf::default()).unwrap();
        assert_eq!(
            value,
            json!({
                "DefaultProduct": "default",
                "Hosts": {"default": ["default"]},
                "HostTags": {"default": ["default"]}
            })
        );
    }

    #[test]
    fn test_covered_basic_rule_defers_to_advanced() {
        let mut index = RuleIndex::new();
        index.submit(vec![rule("ns/a", "x", "/", false, "a")]).unwrap();
        index.submit(vec![rule("ns/b", "x", "/", true, "b")]).unwrap();

        let table = route_table(&index, None);
        assert_eq!(table.basic().len(), 1);
        assert_eq!(table.basic()[0].cluster_name, ADVANCED_MODE);
        assert_eq!(table.basic()[0].path, vec!["/*".to_string()]);

        let advanced: Vec<&str> = table.advanced().iter().map(|r| r.cluster_name.as_str()).collect();
        assert_eq!(advanced, vec!["b", "a"], "predicate rule first, covered rule after");
        assert_eq!(table.clusters(), vec!["a", "b"]);
    }

    #[test]
    fn test_advanced_only_path_gets_host_table_entry() {
        let mut index = RuleIndex::new();
        index.submit(vec![rule("ns/a", "x", "/", false, "a")]).unwrap();
        index.submit(vec![rule("ns/b", "y", "/api", true, "b")]).unwrap();

        let table = route_table(&index, None);
        let basic = table.basic();
        assert_eq!(basic.len(), 2);
        assert_eq!(basic[0].cluster_name, "a");
        assert_eq!(basic[1].hostname, vec!["y".to_string()]);
        assert_eq!(basic[1].cluster_name, ADVANCED_MODE);
        assert_eq!(basic[1].path, vec!["/api/*".to_string()]);
        assert_eq!(table.clusters(), vec!["a", "b"]);
    }

    #[test]
    fn test_default_backend_rule_only_with_rules() {
        let index = RuleIndex::new();
        assert!(route_table(&index, Some("__defaultCluster__infra/fb_0")).advanced().is_empty());

        let mut index = RuleIndex::new();
        index.submit(vec![rule("ns/a", "x", "/", false, "a")]).unwrap();
        let table = route_table(&index, Some("__defaultCluster__infra/fb_0"));
        let last = table.advanced().last().unwrap();
        assert_eq!(last.cond, ALWAYS_MATCH);
        assert_eq!(last.cluster_name, "__defaultCluster__infra/fb_0");
        assert!(cluster_conf(&table).config.contains_key("__defaultCluster__infra/fb_0"));
    }

    #[test]
    fn test_empty_host_omitted() {
        let mut index = RuleIndex::new();
        index.submit(vec![rule("ns/a", "", "/api", false, "a")]).unwrap();

        let value = serde_json::to_value(route_table(&index, None)).unwrap();
        assert_eq!(
            value["BasicRule"]["default"][0],
            json!({"Path": ["/api/*"], "ClusterName": "a"})
        );
    }

    #[test]
    fn test_cluster_conf_layout() {
        let value = serde_json::to_value(ClusterConf::default()).unwrap();
        assert_eq!(
            value,
            json!({
                "CheckConf": {"Schem": "tcp"},
                "GslbBasic": {"HashConf": {
                    "HashStrategy": 0,
                    "HashHeader": "bfe-non-existence",
                    "SessionSticky": false
                }}
            })
        );
    }
}
