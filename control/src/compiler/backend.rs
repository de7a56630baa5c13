//! Backend groups - Ingress backends to weighted BFE clusters
//!
//! Every (Ingress, service, port) triple becomes one cluster:
//!
//! ```text
//! cluster "default/web_svc_80"
//!   ├── default/svc-v1  weight 80  → [10.0.0.1:8080, 10.0.0.2:8080]
//!   └── default/svc-v2  weight 20  → [10.0.1.1:8080]
//! ```
//!
//! Weights are normalized when a resource is submitted. Endpoints are resolved
//! at build time from the cached Service/Endpoints snapshots, so Service and
//! EndpointSlice churn only needs a rebuild, never a resubmission.

use crate::compiler::annotations::balance::{check_weights, Balance};
use crate::compiler::model::{
    BackendRef, EndpointsSnapshot, PortRef, ResourceKey, RoutingResource, ServiceSnapshot,
};
use crate::error::{CompilerError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Weight of a single-member group
pub const FULL_WEIGHT: u32 = 100;
/// Per-instance weight inside a sub-cluster
pub const INSTANCE_WEIGHT: u32 = 10;
pub const GSLB_HOSTNAME: &str = "bfe-ingress-controller";

/// `{ingress}_{service}_{port}`
pub fn cluster_name(owner: &ResourceKey, backend: &BackendRef) -> String {
    format!("{}_{}_{}", owner, backend.service, backend.port)
}

pub fn default_cluster_name(service: &ResourceKey) -> String {
    format!("__defaultCluster__{}_0", service)
}

/// Rescale raw weights to sum to exactly 100
///
/// Each entry gets `floor(w * 100 / sum)`; the points left over go to the
/// entries with the largest remainders, later names first on ties. Every
/// result is within 1 of `round(w / sum * 100)` and zero weights stay zero.
pub fn normalize_weights(raw: &BTreeMap<String, i64>) -> Result<BTreeMap<String, u32>> {
    if raw.values().any(|w| *w < 0) {
        return Err(CompilerError::validation(
            "weight of load balance service should >= 0",
        ));
    }
    let sum: i128 = raw.values().map(|w| *w as i128).sum();
    if sum == 0 {
        return Err(CompilerError::validation(
            "sum of all load balance service weight should > 0",
        ));
    }

    let mut shares: Vec<(&String, i128, i128)> = raw
        .iter()
        .map(|(name, w)| {
            let scaled = *w as i128 * FULL_WEIGHT as i128;
            (name, scaled / sum, scaled % sum)
        })
        .collect();

    let assigned: i128 = shares.iter().map(|(_, share, _)| share).sum();
    let leftover = (FULL_WEIGHT as i128 - assigned) as usize;

    let mut order: Vec<usize> = (0..shares.len()).collect();
    order.sort_by(|a, b| shares[*b].2.cmp(&shares[*a].2).then(b.cmp(a)));
    for i in order.into_iter().take(leftover) {
        shares[i].1 += 1;
    }

    Ok(shares
        .into_iter()
        .map(|(name, share, _)| (name.clone(), share as u32))
        .collect())
}

// =============================================================================
// Output documents
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackendInstance {
    pub name: String,
    pub addr: String,
    pub port: i32,
    pub weight: u32,
}

/// `cluster_conf/gslb.data` without its `Ts` stamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GslbConf {
    pub clusters: BTreeMap<String, BTreeMap<String, u32>>,
    pub hostname: String,
}

/// `cluster_conf/cluster_table.data` without its `Version`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterTableConf {
    pub config: BTreeMap<String, BTreeMap<String, Vec<BackendInstance>>>,
}

// =============================================================================
// BackendTable
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendGroup {
    pub namespace: String,
    pub port: PortRef,
    /// Sub-backend service name → normalized weight
    pub members: BTreeMap<String, u32>,
    refs: usize,
}

impl BackendGroup {
    fn references(&self, service: &ResourceKey) -> bool {
        self.namespace == service.namespace && self.members.contains_key(&service.name)
    }
}

/// Target port of a service port, as seen from the endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
enum TargetPort {
    /// Endpoint ports carry the service port's name
    Name(String),
    Number(i32),
    Unresolved,
}

#[derive(Debug, Default)]
pub struct BackendTable {
    groups: BTreeMap<String, BackendGroup>,
    owners: HashMap<ResourceKey, BTreeMap<String, usize>>,
    services: HashMap<ResourceKey, ServiceSnapshot>,
    endpoints: HashMap<ResourceKey, EndpointsSnapshot>,
    default_backend: Option<ResourceKey>,
}

impl BackendTable {
    pub fn new(default_backend: Option<ResourceKey>) -> Self {
        Self {
            default_backend,
            ..Default::default()
        }
    }

    pub fn group(&self, cluster: &str) -> Option<&BackendGroup> {
        self.groups.get(cluster)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn default_cluster(&self) -> Option<String> {
        self.default_backend.as_ref().map(default_cluster_name)
    }

    /// Create or reference the groups of every rule of `resource`
    ///
    /// Validates everything before touching the table, so a failure leaves it
    /// unchanged.
    pub fn submit(&mut self, resource: &RoutingResource, balance: &Balance) -> Result<()> {
        let namespace = &resource.key.namespace;
        let mut planned: Vec<(String, BackendGroup)> = Vec::with_capacity(resource.rules.len());

        for rule in &resource.rules {
            let backend = &rule.backend;
            let members = match balance.get(&backend.service) {
                None => {
                    let service = ResourceKey::new(namespace.as_str(), backend.service.as_str());
                    if self.ready_addresses(&service) == 0 {
                        warn!(
                            "Service {} of ingress {} has no ready endpoints yet",
                            service, resource.key
                        );
                    }
                    BTreeMap::from([(backend.service.clone(), FULL_WEIGHT)])
                }
                Some(weights) => {
                    check_weights(&backend.service, weights)?;
                    for sub in weights.keys() {
                        let service = ResourceKey::new(namespace.as_str(), sub.as_str());
                        if self.ready_addresses(&service) == 0 {
                            return Err(CompilerError::backend_unavailable(format!(
                                "load balance service {} of ingress {} has no available endpoints",
                                service, resource.key
                            )));
                        }
                    }
                    normalize_weights(weights)?
                }
            };

            planned.push((
                cluster_name(&resource.key, backend),
                BackendGroup {
                    namespace: namespace.clone(),
                    port: backend.port.clone(),
                    members,
                    refs: 0,
                },
            ));
        }

        let owned = self.owners.entry(resource.key.clone()).or_default();
        for (cluster, group) in planned {
            self.groups.entry(cluster.clone()).or_insert(group).refs += 1;
            *owned.entry(cluster).or_default() += 1;
        }
        debug!(
            "Ingress {} references {} clusters",
            resource.key,
            owned.len()
        );
        Ok(())
    }

    /// Drop every reference held by `owner`
    pub fn delete(&mut self, owner: &ResourceKey) {
        let Some(owned) = self.owners.remove(owner) else {
            return;
        };
        for (cluster, count) in owned {
            if let Some(group) = self.groups.get_mut(&cluster) {
                group.refs = group.refs.saturating_sub(count);
                if group.refs == 0 {
                    debug!("Removing cluster {}", cluster);
                    self.groups.remove(&cluster);
                }
            }
        }
    }

    /// Store a Service snapshot, returns whether a build output may change
    pub fn update_service(&mut self, service: ServiceSnapshot) -> bool {
        let key = service.key.clone();
        let changed = self.services.get(&key) != Some(&service);
        self.services.insert(key.clone(), service);
        changed && self.is_referenced(&key)
    }

    pub fn delete_service(&mut self, key: &ResourceKey) -> bool {
        self.services.remove(key).is_some() && self.is_referenced(key)
    }

    pub fn update_endpoints(&mut self, endpoints: EndpointsSnapshot) -> bool {
        let key = endpoints.key.clone();
        let changed = self.endpoints.get(&key) != Some(&endpoints);
        self.endpoints.insert(key.clone(), endpoints);
        changed && self.is_referenced(&key)
    }

    pub fn delete_endpoints(&mut self, key: &ResourceKey) -> bool {
        self.endpoints.remove(key).is_some() && self.is_referenced(key)
    }

    pub fn is_referenced(&self, service: &ResourceKey) -> bool {
        self.default_backend.as_ref() == Some(service)
            || self.groups.values().any(|g| g.references(service))
    }

    fn ready_addresses(&self, service: &ResourceKey) -> usize {
        self.endpoints
            .get(service)
            .map(EndpointsSnapshot::ready_addresses)
            .unwrap_or(0)
    }

    fn target_port(&self, service: &ResourceKey, port: &PortRef) -> TargetPort {
        let Some(snapshot) = self.services.get(service) else {
            debug!("Service {} not found while resolving target port", service);
            return TargetPort::Unresolved;
        };

        let matched = snapshot.ports.iter().find(|p| match port {
            PortRef::Number(n) => p.port == *n,
            PortRef::Name(name) => p.name.as_deref() == Some(name.as_str()),
        });
        let Some(service_port) = matched else {
            return TargetPort::Unresolved;
        };

        if let Some(name) = service_port.name.as_ref().filter(|n| !n.is_empty()) {
            return TargetPort::Name(name.clone());
        }
        match &service_port.target_port {
            Some(PortRef::Number(n)) if *n > 0 => TargetPort::Number(*n),
            _ => TargetPort::Unresolved,
        }
    }

    fn instances(&self, service: &ResourceKey, target: &TargetPort) -> Vec<BackendInstance> {
        let Some(endpoints) = self.endpoints.get(service) else {
            return Vec::new();
        };

        let mut instances = Vec::new();
        for subset in &endpoints.subsets {
            let port = match target {
                TargetPort::Name(name) => subset
                    .ports
                    .iter()
                    .find(|p| p.name.as_deref() == Some(name.as_str())),
                TargetPort::Number(n) => subset.ports.iter().find(|p| p.port == *n),
                TargetPort::Unresolved => subset.ports.first(),
            };
            let Some(port) = port else {
                continue;
            };
            instances.extend(subset.addresses.iter().map(|addr| BackendInstance {
                name: addr.clone(),
                addr: addr.clone(),
                port: port.port,
                weight: INSTANCE_WEIGHT,
            }));
        }
        instances
    }

    /// Groups plus the default backend group when `with_default` is set
    fn effective_groups(&self, with_default: bool) -> BTreeMap<String, BackendGroup> {
        let mut groups = self.groups.clone();
        if let (true, Some(service)) = (with_default, self.default_backend.as_ref()) {
            groups.insert(
                default_cluster_name(service),
                BackendGroup {
                    namespace: service.namespace.clone(),
                    port: PortRef::Number(0),
                    members: BTreeMap::from([(service.name.clone(), FULL_WEIGHT)]),
                    refs: 1,
                },
            );
        }
        groups
    }

    pub fn gslb_conf(&self, with_default: bool) -> GslbConf {
        let clusters = self
            .effective_groups(with_default)
            .into_iter()
            .map(|(cluster, group)| {
                let members = group
                    .members
                    .into_iter()
                    .map(|(name, weight)| (format!("{}/{}", group.namespace, name), weight))
                    .collect();
                (cluster, members)
            })
            .collect();

        GslbConf {
            clusters,
            hostname: GSLB_HOSTNAME.to_string(),
        }
    }

    pub fn cluster_table(&self, with_default: bool) -> ClusterTableConf {
        let config = self
            .effective_groups(with_default)
            .into_iter()
            .map(|(cluster, group)| {
                let subs = group
                    .members
                    .keys()
                    .map(|name| {
                        let service = ResourceKey::new(group.namespace.as_str(), name.as_str());
                        let target = match &group.port {
                            PortRef::Number(0) => TargetPort::Unresolved,
                            port => self.target_port(&service, port),
                        };
                        let instances = self.instances(&service, &target);
                        (service.to_string(), instances)
                    })
                    .collect();
                (cluster, subs)
            })
            .collect();

        ClusterTableConf { config }
    }
}
