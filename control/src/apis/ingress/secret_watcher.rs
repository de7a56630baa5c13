//! Secret watcher for TLS certificate rotation
//!
//! Watches `kubernetes.io/tls` Secrets and hands their material to the
//! compiler. Hosts bound from a Secret pick up a renewed certificate on the
//! next build; other Secret types are ignored.
//!
//! ## Secret Format
//!
//! ```yaml
//! apiVersion: v1
//! kind: Secret
//! metadata:
//!   name: example-com-tls
//! type: kubernetes.io/tls
//! data:
//!   tls.crt: <base64-encoded-cert>
//!   tls.key: <base64-encoded-key>
//! ```

use crate::apis::ingress::{convert, watches_namespace};
use crate::compiler::{ConfigBuilder, ReloadSignal};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{api::Api, Client};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Only TLS Secrets reach the controller
fn tls_secrets() -> WatcherConfig {
    WatcherConfig::default().fields(&format!("type={}", convert::TLS_SECRET_TYPE))
}

/// Watch TLS Secrets and update certificate bindings on changes
///
/// Runs until the watch stream ends. Call it in a tokio::spawn() task.
pub async fn watch_tls_secrets<R: ReloadSignal>(
    client: Client,
    builder: Arc<ConfigBuilder<R>>,
    namespaces: Vec<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let api: Api<Secret> = Api::all(client);
    let watcher = watcher(api, tls_secrets());

    futures::pin_mut!(watcher);

    info!("Starting TLS Secret watcher");

    while let Some(event) = watcher.next().await {
        match event {
            Ok(watcher::Event::Apply(secret)) | Ok(watcher::Event::InitApply(secret)) => {
                let Some(snapshot) = convert::secret_snapshot(&secret) else {
                    continue;
                };
                if !watches_namespace(&namespaces, &snapshot.key.namespace) {
                    continue;
                }
                let key = snapshot.key.clone();
                if let Err(e) = builder.update_secret(snapshot).await {
                    warn!("Failed to handle Secret {}: {}", key, e);
                }
            }
            Ok(watcher::Event::Delete(secret)) => {
                let key = convert::resource_key(&secret);
                debug!("Secret deleted: {}", key);
                builder.delete_secret(&key).await;
            }
            Ok(watcher::Event::Init) => {
                debug!("Secret watcher initialized");
            }
            Ok(watcher::Event::InitDone) => {
                info!("Secret watcher initial sync complete");
            }
            Err(e) => {
                warn!("Secret watcher error: {}", e);
            }
        }
    }

    Ok(())
}
