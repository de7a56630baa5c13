use anyhow::Result;
use control::apis::ingress::ingress::IngressReconciler;
use control::apis::ingress::secret_watcher::watch_tls_secrets;
use control::apis::ingress::service_watcher::{watch_endpointslices, watch_services};
use control::apis::metrics::serve_metrics;
use control::compiler::{ConfigBuilder, HttpReloader};
use control::config::ControllerConfig;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// BFE Ingress Controller
///
/// Compiles Ingress resources into BFE configuration files and tells BFE to
/// reload them.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (needed for Kubernetes TLS client)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok(); // Ignore error if already installed

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ControllerConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;

    info!("BFE Ingress Controller");
    info!("   IngressClass: {}", config.ingress_class);
    info!("   Config root: {}", config.config_root.display());
    info!("   Reload URL: {}", config.reload_url);
    if config.namespaces.is_empty() {
        info!("   Namespaces: all");
    } else {
        info!("   Namespaces: {}", config.namespaces.join(","));
    }

    let reloader = HttpReloader::new(config.reload_url.clone(), config.reload_timeout());
    let builder = Arc::new(ConfigBuilder::new(&config, reloader));

    let client = kube::Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let token = CancellationToken::new();
    let mut handles = vec![];

    // Ingress controller
    let reconciler = IngressReconciler::new(client.clone(), builder.clone(), &config);
    handles.push(tokio::spawn(async move {
        if let Err(e) = reconciler.run().await {
            error!("Ingress controller error: {}", e);
        }
    }));

    // Service watcher
    let svc_client = client.clone();
    let svc_builder = builder.clone();
    let svc_namespaces = config.namespaces.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = watch_services(svc_client, svc_builder, svc_namespaces).await {
            error!("Service watcher error: {}", e);
        }
    }));

    // EndpointSlice watcher
    let eps_client = client.clone();
    let eps_builder = builder.clone();
    let eps_namespaces = config.namespaces.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = watch_endpointslices(eps_client, eps_builder, eps_namespaces).await {
            error!("EndpointSlice watcher error: {}", e);
        }
    }));

    // TLS Secret watcher
    let secret_builder = builder.clone();
    let secret_namespaces = config.namespaces.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = watch_tls_secrets(client, secret_builder, secret_namespaces).await {
            error!("Secret watcher error: {}", e);
        }
    }));

    // Metrics endpoint
    let metrics_addr = config.metrics_addr.clone();
    let metrics_token = token.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = serve_metrics(&metrics_addr, metrics_token).await {
            error!("Metrics endpoint error: {}", e);
        }
    }));

    let reload_loop = builder
        .clone()
        .spawn_periodic_reload(config.reload_interval(), token.clone());

    info!("✅ Controllers started, press Ctrl-C to exit.");

    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    token.cancel();
    if let Err(e) = reload_loop.await {
        error!("Reload loop ended abnormally: {}", e);
    }

    for handle in handles {
        handle.abort();
    }

    Ok(())
}
