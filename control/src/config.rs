//! Configuration for the BFE ingress controller
//!
//! Defaults match a BFE instance running next to the controller with its
//! configuration rooted at `/bfe/conf/`. Every field can be overridden with a
//! `BFE_INGRESS_*` environment variable.

use crate::compiler::annotations::DEFAULT_ANNOTATION_PREFIX;
use crate::compiler::model::ResourceKey;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Root directory BFE reads its configuration from
    #[serde(default = "default_config_root")]
    pub config_root: PathBuf,

    /// Reload endpoint prefix, the artifact family name is appended
    #[serde(default = "default_reload_url")]
    pub reload_url: String,

    /// Interval of the periodic reload loop in seconds (default: 3s)
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,

    /// Timeout of a single reload request in seconds (default: 5s)
    #[serde(default = "default_reload_timeout")]
    pub reload_timeout_secs: u64,

    /// Prefix shared by every controller annotation
    #[serde(default = "default_annotation_prefix")]
    pub annotation_prefix: String,

    /// Ingress class handled by this controller
    #[serde(default = "default_ingress_class")]
    pub ingress_class: String,

    /// Optional `namespace/name` of a Service receiving unmatched traffic
    #[serde(default)]
    pub default_backend: Option<String>,

    /// Namespaces to watch, empty means all
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Listen address of the Prometheus `/metrics` endpoint
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

fn default_config_root() -> PathBuf {
    PathBuf::from("/bfe/conf/")
}

fn default_reload_url() -> String {
    "http://localhost:8421/reload/".to_string()
}

fn default_reload_interval() -> u64 {
    3
}

fn default_reload_timeout() -> u64 {
    5
}

fn default_annotation_prefix() -> String {
    DEFAULT_ANNOTATION_PREFIX.to_string()
}

fn default_ingress_class() -> String {
    "bfe".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            config_root: default_config_root(),
            reload_url: default_reload_url(),
            reload_interval_secs: default_reload_interval(),
            reload_timeout_secs: default_reload_timeout(),
            annotation_prefix: default_annotation_prefix(),
            ingress_class: default_ingress_class(),
            default_backend: None,
            namespaces: Vec::new(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();

        if let Ok(val) = env::var("BFE_INGRESS_CONFIG_ROOT") {
            config.config_root = PathBuf::from(val);
        }

        if let Ok(val) = env::var("BFE_INGRESS_RELOAD_ADDR") {
            config.reload_url = format!("http://{}/reload/", val);
        }

        if let Ok(val) = env::var("BFE_INGRESS_RELOAD_URL") {
            config.reload_url = val;
        }

        if let Ok(val) = env::var("BFE_INGRESS_RELOAD_INTERVAL_SECS") {
            config.reload_interval_secs = val
                .parse()
                .map_err(|e| format!("Invalid BFE_INGRESS_RELOAD_INTERVAL_SECS {}: {}", val, e))?;
        }

        if let Ok(val) = env::var("BFE_INGRESS_RELOAD_TIMEOUT_SECS") {
            config.reload_timeout_secs = val
                .parse()
                .map_err(|e| format!("Invalid BFE_INGRESS_RELOAD_TIMEOUT_SECS {}: {}", val, e))?;
        }

        if let Ok(val) = env::var("BFE_INGRESS_ANNOTATION_PREFIX") {
            config.annotation_prefix = val;
        }

        if let Ok(val) = env::var("BFE_INGRESS_CLASS") {
            config.ingress_class = val;
        }

        if let Ok(val) = env::var("BFE_INGRESS_DEFAULT_BACKEND") {
            if !val.is_empty() {
                config.default_backend = Some(val);
            }
        }

        if let Ok(val) = env::var("BFE_INGRESS_NAMESPACES") {
            config.namespaces = val
                .split(',')
                .map(str::trim)
                .filter(|ns| !ns.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(val) = env::var("BFE_INGRESS_METRICS_ADDR") {
            config.metrics_addr = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), String> {
        if let Some(backend) = &self.default_backend {
            if ResourceKey::parse(backend).is_none() {
                return Err(format!(
                    "invalid default backend: {}, expected namespace/name",
                    backend
                ));
            }
        }

        if self.reload_interval_secs == 0 {
            return Err("reload interval must be greater than zero".to_string());
        }

        if !self.reload_url.starts_with("http://") {
            return Err(format!(
                "reload url {} must use the http scheme",
                self.reload_url
            ));
        }

        if self.metrics_addr.parse::<SocketAddr>().is_err() {
            return Err(format!("invalid metrics address: {}", self.metrics_addr));
        }

        Ok(())
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs)
    }

    pub fn default_backend_key(&self) -> Option<ResourceKey> {
        self.default_backend.as_deref().and_then(ResourceKey::parse)
    }
}
