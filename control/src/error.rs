use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while compiling Ingress resources into BFE configuration
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CompilerError {
    /// Malformed annotation, host or path. The resource is rejected untouched.
    #[error("{0}")]
    Validation(String),

    /// Two resources collide on an identical condition or certificate
    #[error("ingress [{owner}] conflict with existing [{existing}], {detail}")]
    Conflict {
        owner: String,
        existing: String,
        detail: String,
    },

    /// A weighted sub-backend has no live endpoints
    #[error("{0}")]
    BackendUnavailable(String),

    #[error("dump {} error: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config json marshal error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("fail to reload {family}: {reason}")]
    ReloadSignal { family: String, reason: String },

    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),
}

impl CompilerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(
        owner: impl ToString,
        existing: impl ToString,
        detail: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            owner: owner.to_string(),
            existing: existing.to_string(),
            detail: detail.into(),
        }
    }

    pub fn backend_unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }

    pub fn reload_signal(family: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ReloadSignal {
            family: family.into(),
            reason: reason.into(),
        }
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict { .. } => "conflict",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::Persistence { .. } | Self::Serialize(_) => "persistence",
            Self::ReloadSignal { .. } => "reload_signal",
            Self::Kubernetes(_) => "kubernetes",
        }
    }
}

pub type Result<T, E = CompilerError> = std::result::Result<T, E>;
