//! VmGroup manifests.
//!
//! A manifest directory holds one VmGroup per `*.toml` file:
//!
//! ```toml
//! name = "web"
//! namespace = "default"   # optional
//!
//! [spec]
//! cpu = 2
//! memory = 4
//! template = "ubuntu-22.04"
//! replicas = 3
//! ```
//!
//! [`ManifestSync`] mirrors the directory into the store: new and changed
//! files are applied, and a group whose file disappeared gets a deletion
//! request. Files that fail to parse or validate are logged and skipped;
//! a file that turns invalid keeps its group alive.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::resource::{GroupKey, VmGroupSpec};
use crate::store::{MemoryStore, StoreError};

fn default_namespace() -> String {
    "default".to_string()
}

/// One VmGroup declaration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    pub spec: VmGroupSpec,
}

impl Manifest {
    pub fn key(&self) -> GroupKey {
        GroupKey::new(&self.namespace, &self.name)
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("manifest {} has an empty name", path.display())]
    EmptyName { path: PathBuf },
}

/// Parse a manifest from TOML text.
pub fn parse(path: &Path, contents: &str) -> Result<Manifest, ManifestError> {
    let manifest: Manifest = toml::from_str(contents).map_err(|source| ManifestError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if manifest.name.trim().is_empty() || manifest.namespace.trim().is_empty() {
        return Err(ManifestError::EmptyName {
            path: path.to_path_buf(),
        });
    }
    Ok(manifest)
}

/// Read and parse a manifest file.
pub fn load(path: &Path) -> Result<Manifest, ManifestError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(path, &contents)
}

/// `*.toml` files of a directory, sorted by path.
fn manifest_paths(dir: &Path) -> Result<Vec<PathBuf>, ManifestError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ManifestError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();
    Ok(paths)
}

/// Outcome of one directory sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Manifests submitted to the store.
    pub applied: usize,

    /// Groups whose manifest disappeared.
    pub deleted: usize,

    /// Files that could not be parsed or were rejected by the store.
    pub skipped: usize,
}

/// Mirrors a manifest directory into a [`MemoryStore`].
pub struct ManifestSync {
    dir: PathBuf,
    /// Group declared by each file seen so far.
    declared: BTreeMap<PathBuf, GroupKey>,
}

impl ManifestSync {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            declared: BTreeMap::new(),
        }
    }

    /// Apply the directory contents to the store.
    ///
    /// Fails only when the directory itself cannot be read.
    pub async fn sync(&mut self, store: &MemoryStore) -> Result<SyncReport, ManifestError> {
        let paths = manifest_paths(&self.dir)?;
        let mut report = SyncReport::default();
        let mut declared = BTreeMap::new();

        for path in paths {
            let manifest = match load(&path) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(error = %e, "Skipping manifest");
                    report.skipped += 1;
                    if let Some(key) = self.declared.get(&path) {
                        declared.insert(path, key.clone());
                    }
                    continue;
                }
            };

            let key = manifest.key();
            match store
                .apply(&manifest.namespace, &manifest.name, manifest.spec)
                .await
            {
                Ok(_) => {
                    debug!(group = %key, path = %path.display(), "Manifest applied");
                    report.applied += 1;
                }
                Err(e) => {
                    warn!(group = %key, error = %e, "Manifest rejected");
                    report.skipped += 1;
                }
            }
            declared.insert(path, key);
        }

        for (path, key) in &self.declared {
            if declared.contains_key(path) || declared.values().any(|k| k == key) {
                continue;
            }
            match store.request_delete(key).await {
                Ok(_) => {
                    info!(group = %key, path = %path.display(), "Manifest removed, deleting group");
                    report.deleted += 1;
                }
                Err(StoreError::NotFound(_)) => {}
                Err(e) => warn!(group = %key, error = %e, "Deletion request failed"),
            }
        }

        self.declared = declared;
        Ok(report)
    }
}
