//! Annotation parsing
//!
//! Every annotation understood by the controller shares one prefix
//! (`bfe.ingress.kubernetes.io/` by default):
//!
//! ```text
//! <prefix>router.cookie                 "key: value"      -> cookie predicate
//! <prefix>router.header                 "key: value"      -> header predicate
//! <prefix>balance.weight                {"svc": {"a": 30, "b": 70}}
//! <prefix>redirect.<action>             one redirect action (+ response-status)
//! <prefix>rewrite-url.<action>          [{"params": ..., "when": ..., "order": n}]
//! <prefix>bfe-ingress-status            {"status": "...", "message": "..."} (written back)
//! ```
//!
//! Parsing is pure: a missing annotation yields its default, a malformed one
//! yields `CompilerError::Validation` and nothing else happens.

pub mod balance;
pub mod redirect;
pub mod rewrite;
pub mod router;
pub mod status;

use crate::error::Result;
use std::collections::BTreeMap;

pub use balance::Balance;
pub use redirect::RedirectAction;
pub use rewrite::RewriteActions;
pub use router::Predicate;

pub const DEFAULT_ANNOTATION_PREFIX: &str = "bfe.ingress.kubernetes.io/";

/// Prefixed read-only view over an annotation map
#[derive(Debug, Clone, Copy)]
pub struct Annotations<'a> {
    map: &'a BTreeMap<String, String>,
    prefix: &'a str,
}

impl<'a> Annotations<'a> {
    pub fn new(map: &'a BTreeMap<String, String>, prefix: &'a str) -> Self {
        Self { map, prefix }
    }

    /// Full annotation key for a suffix such as `router.cookie`
    pub fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    pub fn get(&self, suffix: &str) -> Option<&'a str> {
        self.map.get(&self.key(suffix)).map(String::as_str)
    }

    pub fn contains(&self, suffix: &str) -> bool {
        self.map.contains_key(&self.key(suffix))
    }
}

/// Everything the compiler reads from one resource's annotations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedAnnotations {
    /// Extra match predicates, cookie first
    pub predicates: Vec<Predicate>,
    pub balance: Balance,
    pub redirect: Option<RedirectAction>,
    pub rewrite: Option<RewriteActions>,
}

/// Parse every annotation family, failing on the first malformed one
pub fn parse(map: &BTreeMap<String, String>, prefix: &str) -> Result<ParsedAnnotations> {
    let annotations = Annotations::new(map, prefix);
    Ok(ParsedAnnotations {
        predicates: router::parse_predicates(&annotations)?,
        balance: balance::parse_balance(&annotations)?,
        redirect: redirect::parse_redirect(&annotations)?,
        rewrite: rewrite::parse_rewrite(&annotations)?,
    })
}
