//! Status annotation written back onto Ingress resources

use crate::error::CompilerError;
use serde::{Deserialize, Serialize};

/// Suffix of the status annotation, written under the controller prefix
pub const STATUS: &str = "bfe-ingress-status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: StatusKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl StatusRecord {
    pub fn success() -> Self {
        Self {
            status: StatusKind::Success,
            message: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: StatusKind::Error,
            message: message.into(),
        }
    }

    pub fn from_result(result: &Result<(), CompilerError>) -> Self {
        match result {
            Ok(()) => Self::success(),
            Err(e) => Self::error(e.to_string()),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    pub fn to_json(&self) -> String {
        // Two plain fields, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Whether writing `self` would change the annotation currently on the object
    pub fn differs_from(&self, current: Option<&str>) -> bool {
        match current.and_then(Self::parse) {
            Some(existing) => existing != *self,
            None => true,
        }
    }
}
