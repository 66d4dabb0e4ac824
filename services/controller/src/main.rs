//! vmgroup-controller
//!
//! Watches VmGroup manifests and keeps the declared replica groups running in
//! the inventory. Without `VC_HOST` it runs against an in-memory backend.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmop_controller::config::Config;
use vmop_controller::inventory::{Inventory, MemoryInventory, RestInventory};
use vmop_controller::manifest::ManifestSync;
use vmop_controller::{Controller, MemoryStore, Reconciler};
use vmop_reconcile::RandomNames;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vmgroup controller");

    let inventory: Arc<dyn Inventory> = match &config.backend {
        Some(backend) => {
            info!(host = %backend.host, insecure = backend.insecure, "Using REST inventory");
            Arc::new(RestInventory::new(backend.rest()).context("failed to build inventory client")?)
        }
        None => {
            info!(templates = ?config.templates, "VC_HOST not set, using in-memory inventory");
            Arc::new(MemoryInventory::new(config.templates.clone()))
        }
    };

    let store = Arc::new(MemoryStore::new());
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        inventory,
        Arc::new(RandomNames::default()),
        config.controller(),
    ));

    let mut controller = Controller::new(Arc::clone(&store), reconciler);
    if let Some(dir) = &config.manifest_dir {
        info!(dir = %dir.display(), "Watching manifests");
        controller = controller.with_manifests(ManifestSync::new(dir));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller_handle = tokio::spawn(controller.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    controller_handle.await.context("controller task panicked")?;

    info!("Controller shutdown complete");
    Ok(())
}
