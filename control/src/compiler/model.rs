//! Snapshots of cluster objects as seen by the compiler
//!
//! The watch layer converts Kubernetes objects into these plain types so the
//! compiler never touches the API server and can be driven directly in tests.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// ResourceKey
// =============================================================================

/// Namespace-qualified object name, displayed as `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    #[inline]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse `namespace/name`
    pub fn parse(s: &str) -> Option<Self> {
        let (namespace, name) = s.split_once('/')?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// =============================================================================
// Routing resources (Ingress)
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathMode {
    Exact,
    /// `Prefix` and `ImplementationSpecific` both land here
    #[default]
    Prefix,
}

/// Port of a Service referenced by an Ingress backend or a Service port's target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortRef {
    Number(i32),
    Name(String),
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRef::Number(n) => write!(f, "{}", n),
            PortRef::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendRef {
    pub service: String,
    pub port: PortRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    /// Empty host matches every request
    pub host: String,
    pub path: String,
    pub path_mode: PathMode,
    pub backend: BackendRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsEntry {
    pub hosts: Vec<String>,
    pub secret_name: String,
}

/// Immutable snapshot of one Ingress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingResource {
    pub key: ResourceKey,
    pub created: DateTime<Utc>,
    pub rules: Vec<IngressRule>,
    pub annotations: BTreeMap<String, String>,
    pub tls: Vec<TlsEntry>,
}

impl RoutingResource {
    pub fn new(key: ResourceKey, created: DateTime<Utc>) -> Self {
        Self {
            key,
            created,
            rules: Vec::new(),
            annotations: BTreeMap::new(),
            tls: Vec::new(),
        }
    }

    pub fn with_rule(
        mut self,
        host: &str,
        path: &str,
        path_mode: PathMode,
        service: &str,
        port: PortRef,
    ) -> Self {
        self.rules.push(IngressRule {
            host: host.to_string(),
            path: path.to_string(),
            path_mode,
            backend: BackendRef {
                service: service.to_string(),
                port,
            },
        });
        self
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_tls(mut self, hosts: &[&str], secret_name: &str) -> Self {
        self.tls.push(TlsEntry {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            secret_name: secret_name.to_string(),
        });
        self
    }
}

// =============================================================================
// Services, endpoints and secrets
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePortSpec {
    pub name: Option<String>,
    pub port: i32,
    pub target_port: Option<PortRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSnapshot {
    pub key: ResourceKey,
    pub ports: Vec<ServicePortSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPort {
    pub name: Option<String>,
    pub port: i32,
}

/// Ready addresses sharing one port list (one EndpointSlice)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSubset {
    pub addresses: Vec<String>,
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointsSnapshot {
    pub key: ResourceKey,
    pub subsets: Vec<EndpointSubset>,
}

impl EndpointsSnapshot {
    pub fn ready_addresses(&self) -> usize {
        self.subsets.iter().map(|s| s.addresses.len()).sum()
    }
}

/// TLS material of a `kubernetes.io/tls` Secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSnapshot {
    pub key: ResourceKey,
    pub cert: Option<Vec<u8>>,
    pub private_key: Option<Vec<u8>>,
}
