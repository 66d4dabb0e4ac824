//! Configuration for the controller.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use vmop_reconcile::{DEFAULT_CONCURRENCY, DEFAULT_REQUEUE_AFTER, DEFAULT_RESYNC_INTERVAL};

use crate::inventory::RestInventoryConfig;
use crate::reconciler::ControllerConfig;

/// Timeout applied to every inventory request.
const INVENTORY_TIMEOUT: Duration = Duration::from_secs(30);

/// Inventory endpoint and credentials.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Inventory service host or URL.
    pub host: String,

    pub username: String,

    pub password: String,

    /// Accept untrusted TLS certificates.
    pub insecure: bool,
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Remote inventory. `None` runs against the in-memory backend.
    pub backend: Option<BackendConfig>,

    /// Templates known to the in-memory backend.
    pub templates: Vec<String>,

    /// Directory of VmGroup manifests.
    pub manifest_dir: Option<PathBuf>,

    /// Requeue delay after a transient failure, in seconds.
    pub requeue_secs: u64,

    /// Full resync interval in seconds.
    pub resync_secs: u64,

    /// Simultaneous backend operations per pass.
    pub concurrency: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let backend = match var("VC_HOST").filter(|h| !h.is_empty()) {
            Some(host) => {
                let Some(username) = var("VC_USER") else {
                    bail!("VC_USER must be set when VC_HOST is set");
                };
                let Some(password) = var("VC_PASS") else {
                    bail!("VC_PASS must be set when VC_HOST is set");
                };
                let insecure = var("VC_INSECURE")
                    .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                    .unwrap_or(false);
                Some(BackendConfig {
                    host,
                    username,
                    password,
                    insecure,
                })
            }
            None => None,
        };

        let templates = var("VMOP_TEMPLATES")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let manifest_dir = var("VMOP_MANIFEST_DIR")
            .filter(|d| !d.is_empty())
            .map(PathBuf::from);

        let requeue_secs = var("VMOP_REQUEUE_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_REQUEUE_AFTER.as_secs());

        let resync_secs = var("VMOP_RESYNC_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RESYNC_INTERVAL.as_secs());

        let concurrency = var("VMOP_CONCURRENCY")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_CONCURRENCY)
            .max(1);

        let log_level = var("VMOP_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            backend,
            templates,
            manifest_dir,
            requeue_secs,
            resync_secs,
            concurrency,
            log_level,
        })
    }

    /// Tuning handed to the reconciler and the work queue.
    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            requeue_after: Duration::from_secs(self.requeue_secs),
            resync_interval: Duration::from_secs(self.resync_secs.max(1)),
            concurrency: self.concurrency,
        }
    }
}

impl BackendConfig {
    /// Client settings for the REST inventory. A bare host gets `https://`.
    pub fn rest(&self) -> RestInventoryConfig {
        let base_url = if self.host.contains("://") {
            self.host.clone()
        } else {
            format!("https://{}", self.host)
        };
        RestInventoryConfig {
            base_url,
            username: self.username.clone(),
            password: self.password.clone(),
            insecure: self.insecure,
            timeout: INVENTORY_TIMEOUT,
        }
    }
}
