//! Ingress support (networking.k8s.io/v1)
//!
//! - Ingress: routing intent, compiled into BFE configuration
//! - Service / EndpointSlice: backend ports and instances
//! - Secret: TLS certificates

pub mod convert;
#[allow(clippy::module_inception)]
pub mod ingress;
pub mod secret_watcher;
pub mod service_watcher;

/// Whether objects in `namespace` are watched, an empty list means all
pub fn watches_namespace(namespaces: &[String], namespace: &str) -> bool {
    namespaces.is_empty() || namespaces.iter().any(|ns| ns == namespace)
}
