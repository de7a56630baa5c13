//! Ingress reconciler
//!
//! Feeds Ingress resources of our class into the compiler and writes the
//! outcome back as a status annotation. Failed resources are requeued so a
//! Secret or endpoint that shows up later lets them through.

use crate::apis::ingress::{convert, watches_namespace};
use crate::apis::metrics::record_ingress_reconciliation;
use crate::compiler::annotations::status::{StatusRecord, STATUS};
use crate::compiler::{ConfigBuilder, ReloadSignal};
use crate::config::ControllerConfig;
use crate::error::Result as CompilerResult;
use futures::StreamExt;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Retry interval of a rejected Ingress
const REJECTED_REQUEUE: Duration = Duration::from_secs(30);

/// Ingress reconciler
pub struct IngressReconciler<R> {
    client: Client,
    builder: Arc<ConfigBuilder<R>>,
    ingress_class: String,
    status_key: String,
    namespaces: Vec<String>,
}

impl<R: ReloadSignal> IngressReconciler<R> {
    pub fn new(client: Client, builder: Arc<ConfigBuilder<R>>, config: &ControllerConfig) -> Self {
        Self {
            client,
            builder,
            ingress_class: config.ingress_class.clone(),
            status_key: format!("{}{}", config.annotation_prefix, STATUS),
            namespaces: config.namespaces.clone(),
        }
    }

    /// Ingresses this controller compiles
    fn should_reconcile(&self, ingress: &Ingress) -> bool {
        ingress.metadata.deletion_timestamp.is_none()
            && convert::ingress_class_matches(ingress, &self.ingress_class)
    }

    /// Patch the status annotation, skipped when the current one is equivalent
    async fn set_status(
        &self,
        ingress: &Ingress,
        result: &CompilerResult<()>,
    ) -> Result<(), kube::Error> {
        let record = StatusRecord::from_result(result);
        let current = ingress.annotations().get(&self.status_key).map(String::as_str);
        if !record.differs_from(current) {
            debug!(
                "Status of Ingress {} unchanged",
                convert::resource_key(ingress)
            );
            return Ok(());
        }

        let namespace = ingress.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);
        let mut annotations = serde_json::Map::new();
        annotations.insert(self.status_key.clone(), record.to_json().into());
        let patch = json!({ "metadata": { "annotations": annotations } });
        api.patch(&ingress.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn reconcile(ingress: Arc<Ingress>, ctx: Arc<Self>) -> Result<Action, kube::Error> {
        let start = Instant::now();
        let key = convert::resource_key(ingress.as_ref());

        if !watches_namespace(&ctx.namespaces, &key.namespace) {
            return Ok(Action::await_change());
        }

        if !ctx.should_reconcile(&ingress) {
            // Class changed or deletion started: stop serving it
            match ctx.builder.delete_ingress(&key).await {
                Ok(true) => info!("Ingress {} is no longer handled by this controller", key),
                Ok(false) => debug!("Ingress {} is not ours, ignoring", key),
                Err(e) => warn!("Failed to remove Ingress {}: {}", key, e),
            }
            return Ok(Action::await_change());
        }

        info!("Reconciling Ingress: {}", key);

        let result = match convert::routing_resource(&ingress) {
            Ok(resource) => ctx.builder.update_ingress(resource).await,
            Err(e) => Err(e),
        };

        ctx.set_status(&ingress, &result).await?;

        let outcome = match &result {
            Ok(()) => "success",
            Err(e) => e.kind(),
        };
        record_ingress_reconciliation(
            &key.name,
            &key.namespace,
            start.elapsed().as_secs_f64(),
            outcome,
        );

        match result {
            Ok(()) => Ok(Action::await_change()),
            Err(e) => {
                warn!("Ingress {} rejected, retrying in {:?}: {}", key, REJECTED_REQUEUE, e);
                Ok(Action::requeue(REJECTED_REQUEUE))
            }
        }
    }

    fn error_policy(_obj: Arc<Ingress>, error: &kube::Error, _ctx: Arc<Self>) -> Action {
        error!("Ingress reconciliation error: {:?}", error);
        // Retry after 1 minute on errors
        Action::requeue(Duration::from_secs(60))
    }

    /// Deleted objects never reach `reconcile`, so deletions get their own watch
    async fn watch_deletions(self: Arc<Self>) {
        let api: Api<Ingress> = Api::all(self.client.clone());
        let watcher = watcher(api, WatcherConfig::default());

        futures::pin_mut!(watcher);

        while let Some(event) = watcher.next().await {
            match event {
                Ok(watcher::Event::Delete(ingress)) => {
                    let key = convert::resource_key(&ingress);
                    match self.builder.delete_ingress(&key).await {
                        Ok(true) => info!("Ingress deleted: {}", key),
                        Ok(false) => {}
                        Err(e) => warn!("Failed to remove deleted Ingress {}: {}", key, e),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Ingress deletion watcher error: {}", e);
                }
            }
        }
    }

    /// Start the Ingress controller
    pub async fn run(self) -> Result<(), kube::Error> {
        let api: Api<Ingress> = Api::all(self.client.clone());
        let ctx = Arc::new(self);

        info!("Starting Ingress controller for class {}", ctx.ingress_class);

        let deletions = tokio::spawn(ctx.clone().watch_deletions());

        Controller::new(api, WatcherConfig::default())
            .run(Self::reconcile, Self::error_policy, ctx)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled Ingress: {:?}", o),
                    Err(e) => error!("Reconciliation error: {:?}", e),
                }
            })
            .await;

        deletions.abort();
        Ok(())
    }
}
