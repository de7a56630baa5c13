//! Versioned config store
//!
//! Holds the latest built content of every file BFE reads, keyed by its path
//! relative to the config root. A file gets a fresh version stamp only when
//! its content changes, so rebuilding an unchanged state is free and leaves
//! the on-disk artifacts bit-identical.
//!
//! ```text
//! set_json / set_raw ──▶ version      (content changed)
//! dump()             ──▶ dumped      (written to disk)
//! mark_applied()     ──▶ applied     (BFE reloaded the family)
//! ```
//!
//! A family is pending while any of its files has `version != applied` or has
//! a removed file the engine was not told about yet.

use crate::error::{CompilerError, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Configuration families BFE reloads independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactFamily {
    ServerDataConf,
    GslbDataConf,
    TlsConf,
    ModRedirect,
    ModRewrite,
}

impl ArtifactFamily {
    pub const ALL: [ArtifactFamily; 5] = [
        ArtifactFamily::ServerDataConf,
        ArtifactFamily::GslbDataConf,
        ArtifactFamily::TlsConf,
        ArtifactFamily::ModRedirect,
        ArtifactFamily::ModRewrite,
    ];

    /// Name appended to the reload URL
    pub fn reload_name(&self) -> &'static str {
        match self {
            ArtifactFamily::ServerDataConf => "server_data_conf",
            ArtifactFamily::GslbDataConf => "gslb_data_conf",
            ArtifactFamily::TlsConf => "tls_conf",
            ArtifactFamily::ModRedirect => "mod_redirect",
            ArtifactFamily::ModRewrite => "mod_rewrite",
        }
    }
}

impl fmt::Display for ArtifactFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reload_name())
    }
}

pub const HOST_RULE_DATA: &str = "server_data_conf/host_rule.data";
pub const ROUTE_RULE_DATA: &str = "server_data_conf/route_rule.data";
pub const CLUSTER_CONF_DATA: &str = "server_data_conf/cluster_conf.data";
pub const GSLB_DATA: &str = "cluster_conf/gslb.data";
pub const CLUSTER_TABLE_DATA: &str = "cluster_conf/cluster_table.data";
pub const SERVER_CERT_DATA: &str = "tls_conf/server_cert_conf.data";
pub const TLS_RULE_DATA: &str = "tls_conf/tls_rule_conf.data";
pub const REDIRECT_DATA: &str = "mod_redirect/redirect.data";
pub const REWRITE_DATA: &str = "mod_rewrite/rewrite.data";

/// Key holding the version stamp of a JSON document
pub const VERSION_KEY: &str = "Version";
/// `gslb.data` carries its stamp as `Ts`
pub const GSLB_VERSION_KEY: &str = "Ts";

#[derive(Debug, Clone, PartialEq)]
enum Body {
    Json {
        content: serde_json::Value,
        version_key: &'static str,
    },
    Raw(Vec<u8>),
}

#[derive(Debug, Clone)]
struct StoredFile {
    family: ArtifactFamily,
    body: Body,
    version: String,
    dumped: Option<(String, Body)>,
    applied: Option<String>,
}

#[derive(Debug)]
pub struct ConfigStore {
    root: PathBuf,
    files: BTreeMap<String, StoredFile>,
    /// Removed files not yet deleted from disk / not yet reloaded
    removed: BTreeMap<String, (ArtifactFamily, bool)>,
    sequence: u64,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: BTreeMap::new(),
            removed: BTreeMap::new(),
            sequence: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn next_version(&mut self) -> String {
        self.sequence += 1;
        format!("{}_{}", Utc::now().format("%Y%m%d%H%M%S"), self.sequence)
    }

    fn put(&mut self, family: ArtifactFamily, path: &str, body: Body) -> bool {
        if let Some(file) = self.files.get(path) {
            if file.body == body {
                return false;
            }
        }

        // Content that is back to what is on disk keeps the on-disk version
        let restored = self
            .files
            .get(path)
            .and_then(|f| f.dumped.as_ref())
            .filter(|(_, dumped)| *dumped == body)
            .map(|(version, _)| version.clone());
        let version = match restored {
            Some(version) => version,
            None => self.next_version(),
        };
        debug!("Artifact {} changed, version {}", path, version);
        self.removed.remove(path);
        let file = self.files.entry(path.to_string()).or_insert_with(|| StoredFile {
            family,
            body: Body::Raw(Vec::new()),
            version: String::new(),
            dumped: None,
            applied: None,
        });
        file.family = family;
        file.body = body;
        file.version = version;
        true
    }

    /// Store a JSON document, returns whether its content changed
    pub fn set_json<T: Serialize>(
        &mut self,
        family: ArtifactFamily,
        path: &str,
        version_key: &'static str,
        content: &T,
    ) -> Result<bool> {
        let content = serde_json::to_value(content)?;
        Ok(self.put(
            family,
            path,
            Body::Json {
                content,
                version_key,
            },
        ))
    }

    /// Store raw file bytes (certificates, keys)
    pub fn set_raw(&mut self, family: ArtifactFamily, path: &str, bytes: Vec<u8>) -> bool {
        self.put(family, path, Body::Raw(bytes))
    }

    /// Drop raw files of `family` whose path is not in `keep`
    pub fn retain_raw(&mut self, family: ArtifactFamily, keep: &BTreeSet<String>) -> bool {
        let stale: Vec<String> = self
            .files
            .iter()
            .filter(|(path, f)| {
                f.family == family && matches!(f.body, Body::Raw(_)) && !keep.contains(*path)
            })
            .map(|(path, _)| path.clone())
            .collect();

        for path in &stale {
            debug!("Artifact {} removed", path);
            self.files.remove(path);
            self.removed.insert(path.clone(), (family, false));
        }
        !stale.is_empty()
    }

    pub fn version(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(|f| f.version.as_str())
    }

    /// Exact bytes `dump()` writes for `path`
    pub fn render(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let Some(file) = self.files.get(path) else {
            return Ok(None);
        };
        render_file(file).map(Some)
    }

    /// Families with changes BFE has not reloaded yet
    pub fn pending(&self) -> BTreeSet<ArtifactFamily> {
        self.files
            .values()
            .filter(|f| f.applied.as_deref() != Some(f.version.as_str()))
            .map(|f| f.family)
            .chain(self.removed.values().map(|(family, _)| *family))
            .collect()
    }

    /// Write every file changed since the last dump, delete removed ones
    ///
    /// Returns the families that still need a reload.
    pub async fn dump(&mut self) -> Result<BTreeSet<ArtifactFamily>> {
        let mut written = 0usize;
        for (path, file) in self.files.iter_mut() {
            if file.dumped.as_ref().map(|(v, _)| v) == Some(&file.version) {
                continue;
            }
            let bytes = render_file(file)?;
            write_file(&self.root.join(path), &bytes).await?;
            file.dumped = Some((file.version.clone(), file.body.clone()));
            written += 1;
        }

        for (path, (_, deleted)) in self.removed.iter_mut() {
            if *deleted {
                continue;
            }
            let full = self.root.join(path);
            match tokio::fs::remove_file(&full).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CompilerError::persistence(full, e)),
            }
            *deleted = true;
        }

        if written > 0 {
            info!("Dumped {} artifacts to {}", written, self.root.display());
        }
        Ok(self.pending())
    }

    /// Record a successful reload of `family`
    pub fn mark_applied(&mut self, family: ArtifactFamily) {
        for file in self.files.values_mut().filter(|f| f.family == family) {
            // Only what reached the disk can have been loaded
            if let Some((dumped, _)) = &file.dumped {
                file.applied = Some(dumped.clone());
            }
        }
        self.removed
            .retain(|_, (removed_family, deleted)| *removed_family != family || !*deleted);
    }
}

fn render_file(file: &StoredFile) -> Result<Vec<u8>> {
    match &file.body {
        Body::Raw(bytes) => Ok(bytes.clone()),
        Body::Json {
            content,
            version_key,
        } => {
            let mut document = content.clone();
            if let serde_json::Value::Object(map) = &mut document {
                map.insert(
                    version_key.to_string(),
                    serde_json::Value::String(file.version.clone()),
                );
            }
            Ok(serde_json::to_vec_pretty(&document)?)
        }
    }
}

/// Write through a temporary sibling so BFE never reads a partial file
async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CompilerError::persistence(parent, e))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| CompilerError::persistence(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| CompilerError::persistence(path, e))
}
