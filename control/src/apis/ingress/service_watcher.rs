//! Service and EndpointSlice watchers
//!
//! Keeps the backend table in sync with the cluster so target ports and
//! instance lists follow Services as Pods scale up and down.
//!
//! Per K8s docs a Service may be backed by several EndpointSlices; the
//! watcher keeps every slice and hands the compiler the aggregate.

use crate::apis::ingress::{convert, watches_namespace};
use crate::compiler::model::ResourceKey;
use crate::compiler::{ConfigBuilder, ReloadSignal};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::watcher;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{api::Api, Client, ResourceExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Watch Services and feed their port specs to the compiler
pub async fn watch_services<R: ReloadSignal>(
    client: Client,
    builder: Arc<ConfigBuilder<R>>,
    namespaces: Vec<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let api: Api<Service> = Api::all(client);
    let watcher = watcher(api, WatcherConfig::default());

    futures::pin_mut!(watcher);

    info!("Starting Service watcher");

    while let Some(event) = watcher.next().await {
        match event {
            Ok(watcher::Event::Apply(service)) | Ok(watcher::Event::InitApply(service)) => {
                let snapshot = convert::service_snapshot(&service);
                if !watches_namespace(&namespaces, &snapshot.key.namespace) {
                    continue;
                }
                let key = snapshot.key.clone();
                if let Err(e) = builder.update_service(snapshot).await {
                    warn!("Failed to handle Service {}: {}", key, e);
                }
            }
            Ok(watcher::Event::Delete(service)) => {
                let key = convert::resource_key(&service);
                debug!("Service deleted: {}", key);
                if let Err(e) = builder.delete_service(&key).await {
                    warn!("Failed to handle Service deletion {}: {}", key, e);
                }
            }
            Ok(watcher::Event::Init) => {
                debug!("Service watcher initialized");
            }
            Ok(watcher::Event::InitDone) => {
                info!("Service watcher initial sync complete");
            }
            Err(e) => {
                warn!("Service watcher error: {}", e);
            }
        }
    }

    Ok(())
}

/// Watch EndpointSlices and feed the aggregated ready addresses to the compiler
pub async fn watch_endpointslices<R: ReloadSignal>(
    client: Client,
    builder: Arc<ConfigBuilder<R>>,
    namespaces: Vec<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let api: Api<EndpointSlice> = Api::all(client);
    let watcher = watcher(api, WatcherConfig::default());

    futures::pin_mut!(watcher);

    info!("Starting EndpointSlice watcher");

    // Service → slice name → slice, ordered so rebuilt instance lists are stable
    let mut service_slices: HashMap<ResourceKey, BTreeMap<String, EndpointSlice>> =
        HashMap::new();

    while let Some(event) = watcher.next().await {
        match event {
            Ok(watcher::Event::Apply(slice)) | Ok(watcher::Event::InitApply(slice)) => {
                let Some(service) = convert::slice_service(&slice) else {
                    debug!(
                        "EndpointSlice {} has no {} label, ignoring",
                        convert::resource_key(&slice),
                        convert::SERVICE_NAME_LABEL
                    );
                    continue;
                };
                if !watches_namespace(&namespaces, &service.namespace) {
                    continue;
                }

                let slices = service_slices.entry(service.clone()).or_default();
                slices.insert(slice.name_any(), slice);
                let snapshot = convert::endpoints_snapshot(service.clone(), slices.values());
                debug!(
                    "Service {} has {} ready addresses in {} slices",
                    service,
                    snapshot.ready_addresses(),
                    slices.len()
                );
                if let Err(e) = builder.update_endpoints(snapshot).await {
                    warn!("Failed to handle endpoints of {}: {}", service, e);
                }
            }
            Ok(watcher::Event::Delete(slice)) => {
                let Some(service) = convert::slice_service(&slice) else {
                    continue;
                };
                let Some(slices) = service_slices.get_mut(&service) else {
                    continue;
                };
                slices.remove(&slice.name_any());

                let result = if slices.is_empty() {
                    debug!("All EndpointSlices of {} deleted", service);
                    service_slices.remove(&service);
                    builder.delete_endpoints(&service).await
                } else {
                    let snapshot = convert::endpoints_snapshot(service.clone(), slices.values());
                    builder.update_endpoints(snapshot).await
                };
                if let Err(e) = result {
                    warn!("Failed to handle endpoints of {}: {}", service, e);
                }
            }
            Ok(watcher::Event::Init) => {
                debug!("EndpointSlice watcher initialized");
            }
            Ok(watcher::Event::InitDone) => {
                info!("EndpointSlice watcher initial sync complete");
            }
            Err(e) => {
                warn!("EndpointSlice watcher error: {}", e);
            }
        }
    }

    Ok(())
}
