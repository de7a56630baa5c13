//! URL rewrite annotations
//!
//! Each `rewrite-url.*` annotation holds a JSON array of actions:
//!
//! ```text
//! bfe.ingress.kubernetes.io/rewrite-url.path-prefix-add: '[{"params": "/v2", "order": 1}]'
//! bfe.ingress.kubernetes.io/rewrite-url.query-add: '[{"params": {"lang": "en"}}]'
//! ```
//!
//! A bare string value is accepted as shorthand for a single action with
//! default `when` and `order`. Actions run at the `AfterLocation` callback
//! point in ascending `order`.

use super::Annotations;
use crate::compiler::model::PathMode;
use crate::error::{CompilerError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

pub const HOST: &str = "rewrite-url.host";
pub const HOST_FROM_PATH_PREFIX: &str = "rewrite-url.host-from-path-prefix";
pub const PATH: &str = "rewrite-url.path";
pub const PATH_PREFIX_ADD: &str = "rewrite-url.path-prefix-add";
pub const PATH_PREFIX_TRIM: &str = "rewrite-url.path-prefix-trim";
pub const PATH_PREFIX_STRIP: &str = "rewrite-url.path-prefix-strip";
pub const QUERY_ADD: &str = "rewrite-url.query-add";
pub const QUERY_RENAME: &str = "rewrite-url.query-rename";
pub const QUERY_DELETE: &str = "rewrite-url.query-delete";
pub const QUERY_DELETE_ALL_EXCEPT: &str = "rewrite-url.query-delete-all-except";

pub const AFTER_LOCATION: &str = "AfterLocation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RewriteCommand {
    HostSet,
    HostSetFromPathPrefix,
    PathSet,
    PathPrefixAdd,
    PathPrefixTrim,
    /// Resolved per rule into `PathPrefixTrim`
    PathStrip,
    QueryAdd,
    QueryRename,
    QueryDel,
    QueryDelAllExcept,
}

impl RewriteCommand {
    const ALL: [(RewriteCommand, &'static str); 10] = [
        (RewriteCommand::HostSet, HOST),
        (RewriteCommand::HostSetFromPathPrefix, HOST_FROM_PATH_PREFIX),
        (RewriteCommand::PathSet, PATH),
        (RewriteCommand::PathPrefixAdd, PATH_PREFIX_ADD),
        (RewriteCommand::PathPrefixTrim, PATH_PREFIX_TRIM),
        (RewriteCommand::PathStrip, PATH_PREFIX_STRIP),
        (RewriteCommand::QueryAdd, QUERY_ADD),
        (RewriteCommand::QueryRename, QUERY_RENAME),
        (RewriteCommand::QueryDel, QUERY_DELETE),
        (RewriteCommand::QueryDelAllExcept, QUERY_DELETE_ALL_EXCEPT),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RewriteCommand::HostSet => "HOST_SET",
            RewriteCommand::HostSetFromPathPrefix => "HOST_SET_FROM_PATH_PREFIX",
            RewriteCommand::PathSet => "PATH_SET",
            RewriteCommand::PathPrefixAdd => "PATH_PREFIX_ADD",
            RewriteCommand::PathPrefixTrim => "PATH_PREFIX_TRIM",
            RewriteCommand::PathStrip => "PATH_STRIP",
            RewriteCommand::QueryAdd => "QUERY_ADD",
            RewriteCommand::QueryRename => "QUERY_RENAME",
            RewriteCommand::QueryDel => "QUERY_DEL",
            RewriteCommand::QueryDelAllExcept => "QUERY_DEL_ALL_EXCEPT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RewriteStep {
    pub command: RewriteCommand,
    pub params: Vec<String>,
    pub order: i64,
}

/// Validated rewrite actions of one resource, sorted by `order`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RewriteActions {
    steps: Vec<RewriteStep>,
}

impl RewriteActions {
    pub fn steps(&self) -> &[RewriteStep] {
        &self.steps
    }

    /// Concrete actions for a rule on `path`, resolving path-prefix-strip
    /// into a trim of the leading segments of that path
    pub fn resolve(&self, path: &str, mode: PathMode) -> Result<Vec<RewriteStep>> {
        self.steps
            .iter()
            .map(|step| {
                if step.command != RewriteCommand::PathStrip {
                    return Ok(step.clone());
                }
                let segments: usize = step
                    .params
                    .first()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or_default();
                let prefix = leading_segments(path, segments).ok_or_else(|| {
                    CompilerError::validation(format!(
                        "{:?} path {} has fewer than {} segments to strip",
                        mode, path, segments
                    ))
                })?;
                Ok(RewriteStep {
                    command: RewriteCommand::PathPrefixTrim,
                    params: vec![prefix],
                    order: step.order,
                })
            })
            .collect()
    }
}

/// First `n` non-empty segments of `path`, e.g. ("/a/b/c", 2) -> "/a/b"
fn leading_segments(path: &str, n: usize) -> Option<String> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if n == 0 || segments.len() < n {
        return None;
    }
    Some(format!("/{}", segments[..n].join("/")))
}

#[derive(Debug, Deserialize)]
struct RawAction {
    params: serde_json::Value,
    #[serde(default)]
    when: Option<String>,
    #[serde(default)]
    order: Option<serde_json::Value>,
}

pub fn parse_rewrite(annotations: &Annotations<'_>) -> Result<Option<RewriteActions>> {
    let mut steps = Vec::new();

    for (command, suffix) in RewriteCommand::ALL {
        let Some(raw) = annotations.get(suffix) else {
            continue;
        };
        let key = annotations.key(suffix);

        let actions = parse_actions(raw, &key)?;
        if actions.len() > 1 {
            return Err(CompilerError::validation(format!(
                "annotation {} sets {} more than once at callback point {}",
                key,
                command.as_str(),
                AFTER_LOCATION
            )));
        }

        for action in actions {
            if let Some(when) = action.when.as_deref() {
                if when != AFTER_LOCATION {
                    return Err(CompilerError::validation(format!(
                        "annotation {}: unsupported callback point {}, only {} is allowed",
                        key, when, AFTER_LOCATION
                    )));
                }
            }
            let order = parse_order(action.order.as_ref(), &key)?;
            let param = param_string(&action.params);
            steps.extend(build_steps(command, &param, order, &key)?);
        }
    }

    if steps.is_empty() {
        return Ok(None);
    }
    check_combination(&steps)?;

    // stable: ties keep annotation-key order
    steps.sort_by_key(|s| s.order);
    Ok(Some(RewriteActions { steps }))
}

fn parse_actions(raw: &str, key: &str) -> Result<Vec<RawAction>> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('[') {
        return Ok(vec![RawAction {
            params: serde_json::Value::String(trimmed.to_string()),
            when: None,
            order: None,
        }]);
    }
    serde_json::from_str(trimmed).map_err(|e| {
        CompilerError::validation(format!("annotation {} is illegal, error: {}", key, e))
    })
}

fn parse_order(order: Option<&serde_json::Value>, key: &str) -> Result<i64> {
    let illegal = || CompilerError::validation(format!("annotation {}: order must be an integer", key));
    match order {
        None | Some(serde_json::Value::Null) => Ok(0),
        Some(serde_json::Value::Number(n)) => n.as_i64().ok_or_else(illegal),
        Some(serde_json::Value::String(s)) => s.trim().parse().map_err(|_| illegal()),
        Some(_) => Err(illegal()),
    }
}

/// JSON strings lose their quotes, anything else keeps its JSON text
fn param_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn build_steps(command: RewriteCommand, param: &str, order: i64, key: &str) -> Result<Vec<RewriteStep>> {
    let step = |params: Vec<String>| RewriteStep {
        command,
        params,
        order,
    };
    let invalid = |reason: String| CompilerError::validation(format!("annotation {}: {}", key, reason));

    match command {
        RewriteCommand::HostSet => {
            check_host(param).map_err(invalid)?;
            Ok(vec![step(vec![param.to_string()])])
        }
        RewriteCommand::HostSetFromPathPrefix => match param.to_ascii_lowercase().as_str() {
            "true" | "t" => Ok(vec![step(Vec::new())]),
            "false" | "f" => Ok(Vec::new()),
            _ => Err(invalid(format!("expected true or false, got {}", param))),
        },
        RewriteCommand::PathSet | RewriteCommand::PathPrefixTrim => {
            check_path(param).map_err(invalid)?;
            Ok(vec![step(vec![param.to_string()])])
        }
        RewriteCommand::PathPrefixAdd => {
            check_path(param).map_err(invalid)?;
            let prefix = if param.ends_with('/') {
                param.to_string()
            } else {
                format!("{}/", param)
            };
            Ok(vec![step(vec![prefix])])
        }
        RewriteCommand::PathStrip => match param.parse::<usize>() {
            Ok(n) if n > 0 => Ok(vec![step(vec![n.to_string()])]),
            _ => Err(invalid(format!("expected a positive integer, got {}", param))),
        },
        RewriteCommand::QueryAdd | RewriteCommand::QueryRename => {
            let pairs: BTreeMap<String, String> = serde_json::from_str(param)
                .map_err(|e| invalid(format!("expected a JSON object of strings: {}", e)))?;
            if pairs.is_empty() {
                return Err(invalid("JSON object must not be empty".to_string()));
            }
            Ok(pairs.into_iter().map(|(k, v)| step(vec![k, v])).collect())
        }
        RewriteCommand::QueryDel => {
            let keys: Vec<String> = serde_json::from_str(param)
                .map_err(|e| invalid(format!("expected a JSON array of strings: {}", e)))?;
            if keys.is_empty() {
                return Err(invalid("JSON array must not be empty".to_string()));
            }
            Ok(vec![step(keys)])
        }
        RewriteCommand::QueryDelAllExcept => {
            if param.is_empty() {
                return Err(invalid("query key must not be empty".to_string()));
            }
            Ok(vec![step(vec![param.to_string()])])
        }
    }
}

fn check_combination(steps: &[RewriteStep]) -> Result<()> {
    let has = |c: RewriteCommand| steps.iter().any(|s| s.command == c);

    if has(RewriteCommand::HostSet) && has(RewriteCommand::HostSetFromPathPrefix) {
        return Err(CompilerError::validation(
            "host and host-from-path-prefix rewrites can not be used together",
        ));
    }
    if has(RewriteCommand::PathSet)
        && (has(RewriteCommand::PathPrefixAdd)
            || has(RewriteCommand::PathPrefixTrim)
            || has(RewriteCommand::PathStrip))
    {
        return Err(CompilerError::validation(
            "path rewrite can not be used together with path prefix rewrites",
        ));
    }
    Ok(())
}

/// A host may carry one `*`, and only as a leading `*.` label
pub fn check_host(host: &str) -> std::result::Result<(), String> {
    if host.is_empty() {
        return Err("host must not be empty".to_string());
    }
    match host.matches('*').count() {
        0 => Ok(()),
        1 if host.starts_with("*.") && host.len() > 2 => Ok(()),
        _ => Err(format!(
            "host {} is illegal, wildcard is only allowed as a leading *. label",
            host
        )),
    }
}

pub fn check_path(path: &str) -> std::result::Result<(), String> {
    if path.is_empty() {
        return Err("path must not be empty".to_string());
    }
    if !path.starts_with('/') {
        return Err(format!("path {} must start with /", path));
    }
    if path.contains('*') {
        return Err(format!("path {} must not contain *", path));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::annotations::DEFAULT_ANNOTATION_PREFIX;

    fn rewrite(pairs: &[(&str, &str)]) -> Result<Option<RewriteActions>> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{}{}", DEFAULT_ANNOTATION_PREFIX, k), v.to_string()))
            .collect();
        parse_rewrite(&Annotations::new(&map, DEFAULT_ANNOTATION_PREFIX))
    }

    fn commands(actions: &RewriteActions) -> Vec<&'static str> {
        actions.steps().iter().map(|s| s.command.as_str()).collect()
    }

    #[test]
    fn test_no_rewrite() {
        assert_eq!(rewrite(&[]).unwrap(), None);
    }

    #[test]
    fn test_actions_sorted_by_order() {
        let actions = rewrite(&[
            (HOST, r#"[{"params": "backend.example.org", "order": 2}]"#),
            (PATH_PREFIX_ADD, r#"[{"params": "/v2", "when": "AfterLocation", "order": 1}]"#),
        ])
        .unwrap()
        .unwrap();

        assert_eq!(commands(&actions), vec!["PATH_PREFIX_ADD", "HOST_SET"]);
        assert_eq!(actions.steps()[0].params, vec!["/v2/".to_string()]);
    }

    #[test]
    fn test_bare_string_shorthand() {
        let actions = rewrite(&[(PATH, "/index.html")]).unwrap().unwrap();
        assert_eq!(commands(&actions), vec!["PATH_SET"]);
        assert_eq!(actions.steps()[0].params, vec!["/index.html".to_string()]);
    }

    #[test]
    fn test_query_add_flattens_pairs() {
        let actions = rewrite(&[(QUERY_ADD, r#"[{"params": {"b": "2", "a": "1"}}]"#)])
            .unwrap()
            .unwrap();
        let params: Vec<_> = actions.steps().iter().map(|s| s.params.clone()).collect();
        assert_eq!(
            params,
            vec![
                vec!["a".to_string(), "1".to_string()],
                vec!["b".to_string(), "2".to_string()]
            ]
        );
    }

    #[test]
    fn test_query_delete_requires_non_empty_array() {
        assert!(rewrite(&[(QUERY_DELETE, r#"[{"params": ["a", "b"]}]"#)]).is_ok());
        assert!(rewrite(&[(QUERY_DELETE, r#"[{"params": []}]"#)]).is_err());
        assert!(rewrite(&[(QUERY_ADD, r#"[{"params": {}}]"#)]).is_err());
    }

    #[test]
    fn test_duplicate_command_rejected() {
        let err = rewrite(&[(PATH, r#"[{"params": "/a"}, {"params": "/b"}]"#)]).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_unsupported_callback_point_rejected() {
        assert!(rewrite(&[(PATH, r#"[{"params": "/a", "when": "BeforeLocation"}]"#)]).is_err());
    }

    #[test]
    fn test_conflicting_combinations_rejected() {
        assert!(rewrite(&[(HOST, "a.example.org"), (HOST_FROM_PATH_PREFIX, "true")]).is_err());
        assert!(rewrite(&[(PATH, "/a"), (PATH_PREFIX_TRIM, "/b")]).is_err());
        assert!(rewrite(&[(PATH, "/a"), (PATH_PREFIX_ADD, "/b")]).is_err());
        assert!(rewrite(&[(PATH_PREFIX_ADD, "/a"), (PATH_PREFIX_TRIM, "/b")]).is_ok());
    }

    #[test]
    fn test_host_from_path_prefix_false_is_noop() {
        assert_eq!(rewrite(&[(HOST_FROM_PATH_PREFIX, "false")]).unwrap(), None);
        let actions = rewrite(&[(HOST_FROM_PATH_PREFIX, "t")]).unwrap().unwrap();
        assert_eq!(commands(&actions), vec!["HOST_SET_FROM_PATH_PREFIX"]);
    }

    #[test]
    fn test_path_strip_resolves_per_rule() {
        let actions = rewrite(&[(PATH_PREFIX_STRIP, r#"[{"params": "2"}]"#)])
            .unwrap()
            .unwrap();

        let resolved = actions.resolve("/api/v1/users", PathMode::Prefix).unwrap();
        assert_eq!(resolved[0].command, RewriteCommand::PathPrefixTrim);
        assert_eq!(resolved[0].params, vec!["/api/v1".to_string()]);

        assert!(
            actions.resolve("/api", PathMode::Prefix).is_err(),
            "stripping more segments than the path has must fail"
        );
    }

    #[test]
    fn test_path_strip_requires_positive_integer() {
        assert!(rewrite(&[(PATH_PREFIX_STRIP, "0")]).is_err());
        assert!(rewrite(&[(PATH_PREFIX_STRIP, "-1")]).is_err());
        assert!(rewrite(&[(PATH_PREFIX_STRIP, "abc")]).is_err());
    }

    #[test]
    fn test_check_host() {
        assert!(check_host("example.org").is_ok());
        assert!(check_host("*.example.org").is_ok());
        assert!(check_host("a.*.example.org").is_err());
        assert!(check_host("*.*.example.org").is_err());
        assert!(check_host("*").is_err());
        assert!(check_host("").is_err());
    }

    #[test]
    fn test_check_path() {
        assert!(check_path("/foo").is_ok());
        assert!(check_path("").is_err());
        assert!(check_path("foo").is_err());
        assert!(check_path("/foo/*").is_err());
    }
}
