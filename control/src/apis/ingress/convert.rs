//! Kubernetes objects → compiler snapshots

use crate::compiler::model::{
    EndpointPort, EndpointSubset, EndpointsSnapshot, PathMode, PortRef, ResourceKey,
    RoutingResource, SecretSnapshot, ServicePortSpec, ServiceSnapshot,
};
use crate::compiler::tls::{SECRET_CERT, SECRET_KEY};
use crate::error::{CompilerError, Result};
use chrono::Utc;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::{Ingress, ServiceBackendPort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

/// Annotation selecting the controller of an Ingress without `ingressClassName`
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
/// Label tying an EndpointSlice to its Service
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

pub fn resource_key<K: ResourceExt>(obj: &K) -> ResourceKey {
    ResourceKey::new(
        obj.namespace().unwrap_or_else(|| "default".to_string()),
        obj.name_any(),
    )
}

/// Whether the Ingress belongs to `class`, by annotation or `spec.ingressClassName`
pub fn ingress_class_matches(ingress: &Ingress, class: &str) -> bool {
    if ingress.annotations().get(INGRESS_CLASS_ANNOTATION).map(String::as_str) == Some(class) {
        return true;
    }
    ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.ingress_class_name.as_deref())
        == Some(class)
}

fn backend_port(port: Option<&ServiceBackendPort>) -> Option<PortRef> {
    let port = port?;
    if let Some(number) = port.number {
        return Some(PortRef::Number(number));
    }
    port.name
        .as_ref()
        .filter(|n| !n.is_empty())
        .map(|n| PortRef::Name(n.clone()))
}

/// Snapshot of an Ingress, rejecting backends the compiler cannot route to
pub fn routing_resource(ingress: &Ingress) -> Result<RoutingResource> {
    let key = resource_key(ingress);
    let created = ingress
        .creation_timestamp()
        .map(|t| t.0)
        .unwrap_or_else(Utc::now);

    let mut resource = RoutingResource::new(key.clone(), created);
    resource.annotations = ingress.annotations().clone();

    let Some(spec) = ingress.spec.as_ref() else {
        return Ok(resource);
    };

    for rule in spec.rules.iter().flatten() {
        let host = rule.host.as_deref().unwrap_or_default();
        let Some(http) = rule.http.as_ref() else {
            continue;
        };
        for path in &http.paths {
            let service = path.backend.service.as_ref().ok_or_else(|| {
                CompilerError::validation(format!(
                    "ingress {}: only service backends are supported",
                    key
                ))
            })?;
            let port = backend_port(service.port.as_ref()).ok_or_else(|| {
                CompilerError::validation(format!(
                    "ingress {}: backend service {} has no port",
                    key, service.name
                ))
            })?;
            let mode = match path.path_type.as_str() {
                "Exact" => PathMode::Exact,
                _ => PathMode::Prefix,
            };
            resource = resource.with_rule(
                host,
                path.path.as_deref().unwrap_or_default(),
                mode,
                &service.name,
                port,
            );
        }
    }

    for tls in spec.tls.iter().flatten() {
        let Some(secret_name) = tls.secret_name.as_deref().filter(|s| !s.is_empty()) else {
            continue;
        };
        let hosts: Vec<&str> = tls.hosts.iter().flatten().map(String::as_str).collect();
        resource = resource.with_tls(&hosts, secret_name);
    }

    Ok(resource)
}

pub fn service_snapshot(service: &Service) -> ServiceSnapshot {
    let ports = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| ServicePortSpec {
                    name: p.name.clone(),
                    port: p.port,
                    target_port: p.target_port.as_ref().map(|t| match t {
                        IntOrString::Int(n) => PortRef::Number(*n),
                        IntOrString::String(s) => PortRef::Name(s.clone()),
                    }),
                })
                .collect()
        })
        .unwrap_or_default();

    ServiceSnapshot {
        key: resource_key(service),
        ports,
    }
}

/// Service an EndpointSlice belongs to
pub fn slice_service(slice: &EndpointSlice) -> Option<ResourceKey> {
    let service = slice.labels().get(SERVICE_NAME_LABEL)?;
    Some(ResourceKey::new(
        slice.namespace().unwrap_or_else(|| "default".to_string()),
        service.as_str(),
    ))
}

/// Ready addresses of every slice of one Service, one subset per slice
pub fn endpoints_snapshot<'a>(
    service: ResourceKey,
    slices: impl IntoIterator<Item = &'a EndpointSlice>,
) -> EndpointsSnapshot {
    let subsets = slices
        .into_iter()
        .map(|slice| {
            let addresses = slice
                .endpoints
                .iter()
                // Unknown readiness counts as ready
                .filter(|e| e.conditions.as_ref().and_then(|c| c.ready) != Some(false))
                .flat_map(|e| e.addresses.iter().cloned())
                .collect();
            let ports = slice
                .ports
                .iter()
                .flatten()
                .filter_map(|p| {
                    Some(EndpointPort {
                        name: p.name.clone().filter(|n| !n.is_empty()),
                        port: p.port?,
                    })
                })
                .collect();
            EndpointSubset { addresses, ports }
        })
        .collect();

    EndpointsSnapshot {
        key: service,
        subsets,
    }
}

/// TLS material of a `kubernetes.io/tls` Secret, `None` for other types
pub fn secret_snapshot(secret: &Secret) -> Option<SecretSnapshot> {
    if secret.type_.as_deref() != Some(TLS_SECRET_TYPE) {
        return None;
    }
    let field = |name: &str| {
        secret
            .data
            .as_ref()
            .and_then(|data| data.get(name))
            .map(|bytes| bytes.0.clone())
    };
    Some(SecretSnapshot {
        key: resource_key(secret),
        cert: field(SECRET_CERT),
        private_key: field(SECRET_KEY),
    })
}
