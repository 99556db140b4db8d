//! Observer registration and lifecycle handle for the periodic sync loops

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::geo::{GeoDirectory, GeoNamespace};
use crate::organizations::OrganizationDirectory;

/// Receives a fresh organization directory snapshot after each successful
/// periodic reload.
pub trait OrganizationsObserver: Send + Sync {
    fn organizations_updated(&self, directory: Arc<OrganizationDirectory>);
}

/// Receives a fresh geo directory snapshot per namespace after each
/// successful periodic reload. Observers ignore namespaces they do not use.
pub trait GeoObserver: Send + Sync {
    fn geo_updated(&self, namespace: GeoNamespace, directory: Arc<GeoDirectory>);
}

/// Handle to a running periodic sync loop.
pub struct SyncHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub(crate) fn new(stop_tx: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self { stop_tx, task }
    }

    /// Stop the loop. The watch send never blocks; the abort covers a loop
    /// that is mid-reload and not currently listening.
    pub fn stop(self) {
        info!("Stopping periodic sync");
        self.stop_tx.send(true).ok();
        self.task.abort();
    }
}
