//! Condition compiler
//!
//! Turns a (host, path, mode, predicates) tuple into a BFE condition
//! expression and a specificity class:
//!
//! ```text
//! ("example.com", "/foo", Prefix, [])
//!   -> req_host_in("example.com") && (req_path_in("/foo", false) || req_path_prefix_in("/foo/", false))
//!   -> ExactHostPrefixPath
//! ```

use crate::compiler::annotations::Predicate;
use crate::compiler::model::PathMode;

/// Expression matching every request
pub const ALWAYS_MATCH: &str = "default_t()";

/// Precedence class of a rule, lower variants win
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpecificityClass {
    ExactHostExactPath,
    ExactHostPrefixPath,
    ExactHostOnly,
    WildcardHostExactPath,
    WildcardHostPrefixPath,
    WildcardHostOnly,
    ExactPathOnly,
    PrefixPathOnly,
    NoRestriction,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum HostKind {
    Exact,
    Wildcard,
    Any,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PathKind {
    Exact,
    Prefix,
    Any,
}

impl SpecificityClass {
    pub fn of(host: &str, path: &str, mode: PathMode) -> Self {
        let host = if host.is_empty() {
            HostKind::Any
        } else if is_wildcard(host) {
            HostKind::Wildcard
        } else {
            HostKind::Exact
        };
        let path = match (mode, prefix_stem(path, mode)) {
            (_, None) => PathKind::Any,
            (PathMode::Exact, Some(_)) => PathKind::Exact,
            (PathMode::Prefix, Some(_)) => PathKind::Prefix,
        };

        match (host, path) {
            (HostKind::Exact, PathKind::Exact) => Self::ExactHostExactPath,
            (HostKind::Exact, PathKind::Prefix) => Self::ExactHostPrefixPath,
            (HostKind::Exact, PathKind::Any) => Self::ExactHostOnly,
            (HostKind::Wildcard, PathKind::Exact) => Self::WildcardHostExactPath,
            (HostKind::Wildcard, PathKind::Prefix) => Self::WildcardHostPrefixPath,
            (HostKind::Wildcard, PathKind::Any) => Self::WildcardHostOnly,
            (HostKind::Any, PathKind::Exact) => Self::ExactPathOnly,
            (HostKind::Any, PathKind::Prefix) => Self::PrefixPathOnly,
            (HostKind::Any, PathKind::Any) => Self::NoRestriction,
        }
    }
}

#[inline]
pub fn is_wildcard(host: &str) -> bool {
    host.starts_with("*.")
}

/// Path a clause is built from, `None` when the path does not restrict
fn prefix_stem(path: &str, mode: PathMode) -> Option<&str> {
    let stem = match mode {
        PathMode::Exact => path,
        PathMode::Prefix => path.trim_end_matches('/'),
    };
    (!stem.is_empty()).then_some(stem)
}

/// Double-quoted string literal for the condition language
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

pub fn host_clause(host: &str) -> Option<String> {
    if host.is_empty() {
        return None;
    }
    if is_wildcard(host) {
        // "*.example.com" matches by suffix ".example.com"
        return Some(format!("req_host_suffix_in({})", quote(&host[1..])));
    }
    Some(format!("req_host_in({})", quote(host)))
}

pub fn path_clause(path: &str, mode: PathMode) -> Option<String> {
    let stem = prefix_stem(path, mode)?;
    match mode {
        PathMode::Exact => Some(format!("req_path_in({}, false)", quote(stem))),
        PathMode::Prefix => Some(format!(
            "(req_path_in({}, false) || req_path_prefix_in({}, false))",
            quote(stem),
            quote(&format!("{}/", stem))
        )),
    }
}

/// Compile a full condition, predicates are expected in parser order
pub fn compile(host: &str, path: &str, mode: PathMode, predicates: &[Predicate]) -> String {
    let clauses: Vec<String> = host_clause(host)
        .into_iter()
        .chain(path_clause(path, mode))
        .chain(predicates.iter().map(Predicate::to_condition))
        .collect();

    if clauses.is_empty() {
        return ALWAYS_MATCH.to_string();
    }
    clauses.join(" && ")
}

/// Pattern used by the basic route table and coverage checks:
/// prefix paths end in `/*`, exact paths are kept verbatim
pub fn path_pattern(path: &str, mode: PathMode) -> String {
    match mode {
        PathMode::Exact => path.to_string(),
        PathMode::Prefix => format!("{}/*", path.trim_end_matches('/')),
    }
}
