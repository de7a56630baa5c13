//! Cookie and header routing predicates

use super::Annotations;
use crate::compiler::condition::quote;
use crate::error::{CompilerError, Result};

pub const COOKIE: &str = "router.cookie";
pub const HEADER: &str = "router.header";

/// Extra match predicate attached to every rule of a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Predicate {
    Cookie { key: String, value: String },
    Header { key: String, value: String },
}

impl Predicate {
    /// Evaluation rank, cookie predicates are checked before header predicates
    pub fn rank(&self) -> u8 {
        match self {
            Predicate::Cookie { .. } => 0,
            Predicate::Header { .. } => 1,
        }
    }

    pub fn to_condition(&self) -> String {
        match self {
            Predicate::Cookie { key, value } => format!(
                "req_cookie_value_in({}, {}, false)",
                quote(key),
                quote(value)
            ),
            Predicate::Header { key, value } => format!(
                "req_header_value_in({}, {}, false)",
                quote(key),
                quote(value)
            ),
        }
    }
}

/// Routing priority of a resource, derived from the predicates it carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityClass {
    Basic = 10,
    Header = 20,
    Cookie = 30,
    CookieHeader = 40,
}

impl PriorityClass {
    pub fn of(predicates: &[Predicate]) -> Self {
        let cookie = predicates
            .iter()
            .any(|p| matches!(p, Predicate::Cookie { .. }));
        let header = predicates
            .iter()
            .any(|p| matches!(p, Predicate::Header { .. }));
        match (cookie, header) {
            (true, true) => PriorityClass::CookieHeader,
            (true, false) => PriorityClass::Cookie,
            (false, true) => PriorityClass::Header,
            (false, false) => PriorityClass::Basic,
        }
    }
}

/// Parse the cookie and header annotations, cookie first
pub fn parse_predicates(annotations: &Annotations<'_>) -> Result<Vec<Predicate>> {
    let mut predicates = Vec::with_capacity(2);

    if let Some(raw) = annotations.get(COOKIE).filter(|v| !v.is_empty()) {
        let (key, value) = split_pair("cookie", raw)?;
        predicates.push(Predicate::Cookie { key, value });
    }

    if let Some(raw) = annotations.get(HEADER).filter(|v| !v.is_empty()) {
        let (key, value) = split_pair("header", raw)?;
        predicates.push(Predicate::Header { key, value });
    }

    Ok(predicates)
}

/// Split `key: value` on the first colon
fn split_pair(kind: &str, raw: &str) -> Result<(String, String)> {
    let illegal = || CompilerError::validation(format!("{} annotation[{}] is illegal", kind, raw));

    let (key, value) = raw.split_once(':').ok_or_else(illegal)?;
    let (key, value) = (key.trim(), value.trim());
    if key.is_empty() || value.is_empty() {
        return Err(illegal());
    }
    Ok((key.to_string(), value.to_string()))
}
