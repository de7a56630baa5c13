//! Submit / build / dump / reload transaction
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            ConfigBuilder                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  State (tokio Mutex)                   │  AcceptedIndex (RwLock + atomics)│
//! │  ┌──────────────────────────────────┐  │  ┌────────────────────────────┐  │
//! │  │ resources   ns/name → snapshot   │  │  │ accepted ns/name set       │  │
//! │  │ routes / redirects / rewrites    │  │  │ read without the mutex     │  │
//! │  │ backends    BackendTable         │  │  └────────────────────────────┘  │
//! │  │ tls         TlsTable             │  │                                  │
//! │  │ store       ConfigStore          │  │                                  │
//! │  └──────────────────────────────────┘  │                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! An update withdraws the previous version of the resource, submits the new
//! one to every sub-builder and rebuilds the documents. When any sub-builder
//! refuses, everything the new version inserted is withdrawn again and the
//! previous version is resubmitted, so other resources never see a partial
//! state. Dump and reload run on the periodic loop.

use crate::apis::metrics::{record_dump, record_reload};
use crate::compiler::annotations::router::PriorityClass;
use crate::compiler::annotations::{self, Balance};
use crate::compiler::backend::{cluster_name, BackendTable};
use crate::compiler::model::{
    EndpointsSnapshot, ResourceKey, RoutingResource, SecretSnapshot, ServiceSnapshot,
};
use crate::compiler::reload::ReloadSignal;
use crate::compiler::rule_index::{validate_rule, MatchRule, RuleIndex, RulePayload};
use crate::compiler::store::{
    ArtifactFamily, ConfigStore, CLUSTER_CONF_DATA, CLUSTER_TABLE_DATA, GSLB_DATA,
    GSLB_VERSION_KEY, HOST_RULE_DATA, REDIRECT_DATA, REWRITE_DATA, ROUTE_RULE_DATA,
    SERVER_CERT_DATA, TLS_RULE_DATA, VERSION_KEY,
};
use crate::compiler::tables::{self, HostTableConf};
use crate::compiler::tls::TlsTable;
use crate::config::ControllerConfig;
use crate::error::{CompilerError, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// AcceptedIndex
// =============================================================================

/// Safe RwLock read helper that recovers from poisoning
#[inline]
fn safe_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("RwLock poisoned during read, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

/// Safe RwLock write helper that recovers from poisoning
#[inline]
fn safe_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("RwLock poisoned during write, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

/// Lock-free counters for AcceptedIndex operations
#[derive(Debug, Default)]
pub struct AcceptedIndexMetrics {
    lookups: AtomicU64,
    hits: AtomicU64,
    accepts: AtomicU64,
    removes: AtomicU64,
}

impl AcceptedIndexMetrics {
    #[inline(always)]
    fn record_lookup(&self, hit: bool) {
        // Relaxed ordering is fine for counters
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    fn record_accept(&self) {
        self.accepts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn accepts(&self) -> u64 {
        self.accepts.load(Ordering::Relaxed)
    }

    pub fn removes(&self) -> u64 {
        self.removes.load(Ordering::Relaxed)
    }
}

/// Resources whose current version is compiled into the config
///
/// Snapshot of the builder state that can be queried without waiting for
/// a build or reload in progress. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct AcceptedIndex {
    inner: Arc<RwLock<HashSet<ResourceKey>>>,
    metrics: Arc<AcceptedIndexMetrics>,
}

impl AcceptedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, key: &ResourceKey) -> bool {
        let mut inner = safe_write(&self.inner);
        let is_new = inner.insert(key.clone());
        self.metrics.record_accept();
        if is_new {
            debug!("AcceptedIndex: added {} (total: {})", key, inner.len());
        }
        is_new
    }

    fn remove(&self, key: &ResourceKey) -> bool {
        let mut inner = safe_write(&self.inner);
        let was_present = inner.remove(key);
        if was_present {
            self.metrics.record_remove();
            debug!("AcceptedIndex: removed {} (total: {})", key, inner.len());
        }
        was_present
    }

    #[inline]
    pub fn contains(&self, key: &ResourceKey) -> bool {
        let hit = safe_read(&self.inner).contains(key);
        self.metrics.record_lookup(hit);
        hit
    }

    pub fn len(&self) -> usize {
        safe_read(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted snapshot of the accepted keys
    pub fn keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = safe_read(&self.inner).iter().cloned().collect();
        keys.sort();
        keys
    }

    pub fn metrics(&self) -> &AcceptedIndexMetrics {
        &self.metrics
    }
}

impl fmt::Display for AcceptedIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self.keys();
        match keys.len() {
            0 => write!(f, "AcceptedIndex: empty"),
            n if n <= 3 => {
                let names: Vec<_> = keys.iter().map(ToString::to_string).collect();
                write!(f, "AcceptedIndex: {} ingress(es) [{}]", n, names.join(", "))
            }
            n => {
                let names: Vec<_> = keys.iter().take(3).map(ToString::to_string).collect();
                write!(f, "AcceptedIndex: {} ingress(es) [{}, ...]", n, names.join(", "))
            }
        }
    }
}

// =============================================================================
// Compilation of one resource
// =============================================================================

/// Everything a resource contributes, computed before any table is touched
#[derive(Debug)]
struct CompiledResource {
    balance: Balance,
    routes: Vec<MatchRule>,
    redirects: Vec<MatchRule>,
    rewrites: Vec<MatchRule>,
}

fn compile_resource(resource: &RoutingResource, prefix: &str) -> Result<CompiledResource> {
    let key = &resource.key;
    let parsed = annotations::parse(&resource.annotations, prefix)?;

    let mut compiled = CompiledResource {
        balance: parsed.balance,
        routes: Vec::with_capacity(resource.rules.len()),
        redirects: Vec::new(),
        rewrites: Vec::new(),
    };

    for rule in &resource.rules {
        validate_rule(&rule.host, &rule.path)
            .map_err(|e| CompilerError::validation(format!("ingress {}: {}", key, e)))?;

        let cluster = cluster_name(key, &rule.backend);
        let match_rule = |payload| {
            MatchRule::new(
                key.clone(),
                resource.created,
                &rule.host,
                &rule.path,
                rule.path_mode,
                parsed.predicates.clone(),
                cluster.clone(),
                payload,
            )
        };

        compiled.routes.push(match_rule(RulePayload::Route));
        if let Some(redirect) = &parsed.redirect {
            compiled
                .redirects
                .push(match_rule(RulePayload::Redirect(redirect.clone())));
        }
        if let Some(rewrite) = &parsed.rewrite {
            let steps = rewrite.resolve(&rule.path, rule.path_mode)?;
            compiled.rewrites.push(match_rule(RulePayload::Rewrite(steps)));
        }
    }

    debug!(
        "Ingress {} compiled: {} routes, {} redirects, {} rewrites, priority {:?}",
        key,
        compiled.routes.len(),
        compiled.redirects.len(),
        compiled.rewrites.len(),
        PriorityClass::of(&parsed.predicates)
    );
    Ok(compiled)
}

// =============================================================================
// CompilerState
// =============================================================================

#[derive(Debug)]
struct CompilerState {
    resources: HashMap<ResourceKey, RoutingResource>,
    routes: RuleIndex,
    redirects: RuleIndex,
    rewrites: RuleIndex,
    backends: BackendTable,
    tls: TlsTable,
    store: ConfigStore,
}

impl CompilerState {
    fn new(root: PathBuf, default_backend: Option<ResourceKey>) -> Self {
        Self {
            resources: HashMap::new(),
            routes: RuleIndex::new(),
            redirects: RuleIndex::new(),
            rewrites: RuleIndex::new(),
            backends: BackendTable::new(default_backend),
            tls: TlsTable::new(),
            store: ConfigStore::new(root),
        }
    }

    /// Submit to every sub-builder; a failing step leaves earlier ones filled
    fn try_apply(&mut self, resource: &RoutingResource, compiled: CompiledResource) -> Result<()> {
        self.routes.submit(compiled.routes)?;
        self.redirects.submit(compiled.redirects)?;
        self.rewrites.submit(compiled.rewrites)?;
        self.backends.submit(resource, &compiled.balance)?;
        self.tls.submit(resource)
    }

    fn apply(&mut self, resource: &RoutingResource, compiled: CompiledResource) -> Result<()> {
        let result = self.try_apply(resource, compiled);
        if result.is_err() {
            self.withdraw(&resource.key);
        }
        result
    }

    /// Drop everything `key` contributed to any sub-builder
    fn withdraw(&mut self, key: &ResourceKey) {
        self.routes.remove_owner(key);
        self.redirects.remove_owner(key);
        self.rewrites.remove_owner(key);
        self.backends.delete(key);
        self.tls.delete(key);
    }

    fn update(&mut self, resource: RoutingResource, prefix: &str) -> Result<()> {
        // Pure validation first, nothing to undo when it fails
        let compiled = compile_resource(&resource, prefix)?;

        let key = resource.key.clone();
        let previous = self.resources.remove(&key);
        if previous.is_some() {
            self.withdraw(&key);
        }

        match self.apply(&resource, compiled) {
            Ok(()) => {
                self.resources.insert(key.clone(), resource);
                self.build().inspect_err(|_| self.revert(&key, previous, prefix))
            }
            Err(e) => {
                if let Some(previous) = previous {
                    self.restore(previous, prefix);
                }
                Err(e)
            }
        }
    }

    /// Undo an applied update whose documents could not be built
    fn revert(&mut self, key: &ResourceKey, previous: Option<RoutingResource>, prefix: &str) {
        self.resources.remove(key);
        self.withdraw(key);
        if let Some(previous) = previous {
            self.restore(previous, prefix);
        }
        if let Err(e) = self.build() {
            error!("Failed to rebuild config after reverting {}: {}", key, e);
        }
    }

    /// Resubmit a version that was accepted before
    fn restore(&mut self, previous: RoutingResource, prefix: &str) {
        let restored = compile_resource(&previous, prefix)
            .and_then(|compiled| self.apply(&previous, compiled));
        match restored {
            Ok(()) => {
                debug!("Restored previous version of ingress {}", previous.key);
                self.resources.insert(previous.key.clone(), previous);
            }
            Err(e) => {
                // Only reachable when a Secret changed under the old version
                error!(
                    "Failed to restore previous version of ingress {}: {}",
                    previous.key, e
                );
                if let Err(e) = self.build() {
                    error!("Failed to rebuild config: {}", e);
                }
            }
        }
    }

    fn delete(&mut self, key: &ResourceKey) -> Result<bool> {
        if self.resources.remove(key).is_none() {
            return Ok(false);
        }
        self.withdraw(key);
        self.build()?;
        Ok(true)
    }

    /// Recompute every document from the current tables
    fn build(&mut self) -> Result<()> {
        let with_default = !self.routes.is_empty();
        let default_cluster = self.backends.default_cluster();

        let route_table = tables::route_table(&self.routes, default_cluster.as_deref());
        let cluster_conf = tables::cluster_conf(&route_table);

        let store = &mut self.store;
        use ArtifactFamily::*;
        let documents = [
            store.set_json(ServerDataConf, HOST_RULE_DATA, VERSION_KEY, &HostTableConf::default())?,
            store.set_json(ServerDataConf, ROUTE_RULE_DATA, VERSION_KEY, &route_table)?,
            store.set_json(ServerDataConf, CLUSTER_CONF_DATA, VERSION_KEY, &cluster_conf)?,
            store.set_json(
                GslbDataConf,
                GSLB_DATA,
                GSLB_VERSION_KEY,
                &self.backends.gslb_conf(with_default),
            )?,
            store.set_json(
                GslbDataConf,
                CLUSTER_TABLE_DATA,
                VERSION_KEY,
                &self.backends.cluster_table(with_default),
            )?,
            store.set_json(TlsConf, SERVER_CERT_DATA, VERSION_KEY, &self.tls.server_cert_conf())?,
            store.set_json(TlsConf, TLS_RULE_DATA, VERSION_KEY, &self.tls.tls_rule_conf())?,
            store.set_json(
                ModRedirect,
                REDIRECT_DATA,
                VERSION_KEY,
                &tables::redirect_conf(&self.redirects),
            )?,
            store.set_json(
                ModRewrite,
                REWRITE_DATA,
                VERSION_KEY,
                &tables::rewrite_conf(&self.rewrites),
            )?,
        ];
        let mut changed = documents.iter().filter(|c| **c).count();

        let certs = self.tls.cert_files();
        let keep: BTreeSet<String> = certs.keys().cloned().collect();
        for (path, bytes) in certs {
            if store.set_raw(TlsConf, &path, bytes) {
                changed += 1;
            }
        }
        if store.retain_raw(TlsConf, &keep) {
            changed += 1;
        }

        debug!(
            "Build done: {} ingresses, {} routes, {} clusters, {} changed artifacts",
            self.resources.len(),
            self.routes.len(),
            self.backends.group_count(),
            changed
        );
        Ok(())
    }
}

// =============================================================================
// ConfigBuilder
// =============================================================================

/// Compiles resources into BFE configuration and keeps BFE in sync with it
///
/// ## Example
///
/// ```ignore
/// let config = ControllerConfig::from_env()?;
/// let reloader = HttpReloader::new(config.reload_url.clone(), config.reload_timeout());
/// let builder = Arc::new(ConfigBuilder::new(&config, reloader));
///
/// builder.update_ingress(resource).await?;
/// builder.reload().await?;
/// ```
pub struct ConfigBuilder<R> {
    state: Mutex<CompilerState>,
    accepted: AcceptedIndex,
    reloader: R,
    annotation_prefix: String,
}

impl<R: ReloadSignal> ConfigBuilder<R> {
    pub fn new(config: &ControllerConfig, reloader: R) -> Self {
        Self {
            state: Mutex::new(CompilerState::new(
                config.config_root.clone(),
                config.default_backend_key(),
            )),
            accepted: AcceptedIndex::new(),
            reloader,
            annotation_prefix: config.annotation_prefix.clone(),
        }
    }

    /// Shared handle to the accepted-resource snapshot
    pub fn accepted(&self) -> AcceptedIndex {
        self.accepted.clone()
    }

    pub fn is_accepted(&self, key: &ResourceKey) -> bool {
        self.accepted.contains(key)
    }

    /// Submit a new or changed Ingress
    ///
    /// On error the resource's previously accepted version, if any, stays in
    /// effect and no other resource's output changes.
    pub async fn update_ingress(&self, resource: RoutingResource) -> Result<()> {
        let key = resource.key.clone();
        let mut state = self.state.lock().await;

        match state.update(resource, &self.annotation_prefix) {
            Ok(()) => {
                self.accepted.insert(&key);
                info!("Ingress {} accepted", key);
                Ok(())
            }
            Err(e) => {
                if !state.resources.contains_key(&key) {
                    self.accepted.remove(&key);
                }
                warn!(error_kind = e.kind(), "Ingress {} rejected: {}", key, e);
                Err(e)
            }
        }
    }

    /// Returns whether the Ingress was known
    pub async fn delete_ingress(&self, key: &ResourceKey) -> Result<bool> {
        let mut state = self.state.lock().await;
        let deleted = state.delete(key)?;
        self.accepted.remove(key);
        if deleted {
            info!("Ingress {} deleted", key);
        }
        Ok(deleted)
    }

    pub async fn update_service(&self, service: ServiceSnapshot) -> Result<()> {
        let key = service.key.clone();
        let mut state = self.state.lock().await;
        if state.backends.update_service(service) {
            debug!("Service {} changed, rebuilding", key);
            state.build()?;
        }
        Ok(())
    }

    pub async fn delete_service(&self, key: &ResourceKey) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.backends.delete_service(key) {
            debug!("Service {} deleted, rebuilding", key);
            state.build()?;
        }
        Ok(())
    }

    pub async fn update_endpoints(&self, endpoints: EndpointsSnapshot) -> Result<()> {
        let key = endpoints.key.clone();
        let mut state = self.state.lock().await;
        if state.backends.update_endpoints(endpoints) {
            debug!("Endpoints of {} changed, rebuilding", key);
            state.build()?;
        }
        Ok(())
    }

    pub async fn delete_endpoints(&self, key: &ResourceKey) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.backends.delete_endpoints(key) {
            debug!("Endpoints of {} deleted, rebuilding", key);
            state.build()?;
        }
        Ok(())
    }

    pub async fn update_secret(&self, secret: SecretSnapshot) -> Result<()> {
        let key = secret.key.clone();
        let mut state = self.state.lock().await;
        if state.tls.update_secret(secret)? {
            debug!("Secret {} changed, rebuilding", key);
            state.build()?;
        }
        Ok(())
    }

    pub async fn delete_secret(&self, key: &ResourceKey) {
        self.state.lock().await.tls.delete_secret(key);
    }

    /// Families with changes BFE has not loaded yet
    pub async fn pending(&self) -> BTreeSet<ArtifactFamily> {
        self.state.lock().await.store.pending()
    }

    /// Bytes a dump writes for `path`, relative to the config root
    pub async fn render(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.state.lock().await.store.render(path)
    }

    /// Dump changed artifacts and signal BFE once per changed family
    ///
    /// A family is marked applied only after its reload succeeded; failed
    /// families stay pending for the next cycle. Returns the reloaded
    /// families, or the first failure once every family was tried.
    pub async fn reload(&self) -> Result<Vec<ArtifactFamily>> {
        let mut state = self.state.lock().await;

        let pending = match state.store.dump().await {
            Ok(pending) => {
                record_dump("success");
                pending
            }
            Err(e) => {
                record_dump("error");
                error!("Failed to dump config to {}: {}", state.store.root().display(), e);
                return Err(e);
            }
        };

        let mut reloaded = Vec::with_capacity(pending.len());
        let mut first_error = None;
        for family in pending {
            match self.reloader.reload(family.reload_name()).await {
                Ok(()) => {
                    state.store.mark_applied(family);
                    record_reload(family.reload_name(), "success");
                    info!(family = %family, "BFE reloaded");
                    reloaded.push(family);
                }
                Err(e) => {
                    record_reload(family.reload_name(), "error");
                    warn!(family = %family, "Reload failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(reloaded),
        }
    }

    /// Run `reload()` every `interval` until `token` is cancelled
    pub fn spawn_periodic_reload(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Starting periodic reload every {:?}", interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Periodic reload stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.reload().await {
                            debug!("Reload cycle incomplete, retrying next tick: {}", e);
                        }
                    }
                }
            }
        })
    }
}
