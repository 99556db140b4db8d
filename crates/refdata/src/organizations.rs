//! Organization directory: email domain -> organization name and IP ranges
//!
//! The upstream document nests each record under a per-record index key and
//! may map one domain to several organizations. Domains contributed by more
//! than one record land in `duplicate_domains`; those need the per-address
//! IP-range test at enrichment time.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{error, info, warn};

use pulsefeed_config::OrganizationDirectoryConfig;

use crate::alert::Alerter;
use crate::error::DirectoryError;
use crate::fetch::Fetcher;
use crate::sync::{OrganizationsObserver, SyncHandle};

/// One set of CIDR ranges tied to an organization name. A domain carries one
/// group per contributing source record, in load order.
#[derive(Debug, Clone)]
pub struct IpRangeGroup {
    pub ip_ranges: HashSet<String>,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct Organization {
    /// Some records carry no IP ranges at all; the name still has to live
    /// somewhere, so it is kept here as well as in the range groups.
    pub display_name: String,
    pub ip_range_groups: Vec<IpRangeGroup>,
}

/// Immutable snapshot, rebuilt wholesale on every load.
#[derive(Debug, Clone, Default)]
pub struct OrganizationDirectory {
    pub organizations: HashMap<String, Organization>,
    pub duplicate_domains: HashSet<String>,
}

#[derive(Debug, Deserialize)]
struct OrganizationsDocument {
    details: Vec<HashMap<String, OrganizationRecord>>,
}

#[derive(Debug, Deserialize)]
struct OrganizationRecord {
    #[serde(default)]
    domains: Vec<String>,
    #[serde(default)]
    org_name: String,
    #[serde(default)]
    ip_ranges: Vec<String>,
}

impl OrganizationDirectory {
    fn from_document(document: OrganizationsDocument) -> Self {
        let mut directory = OrganizationDirectory::default();

        // Each `details` element is a one-entry map keyed by an upstream
        // record id; only the values matter here.
        for record in document.details.into_iter().flat_map(HashMap::into_values) {
            let ip_ranges: HashSet<String> = record.ip_ranges.iter().cloned().collect();
            for domain in &record.domains {
                let group = IpRangeGroup {
                    ip_ranges: ip_ranges.clone(),
                    display_name: record.org_name.clone(),
                };
                match directory.organizations.get_mut(domain) {
                    None => {
                        directory.organizations.insert(
                            domain.clone(),
                            Organization {
                                display_name: record.org_name.clone(),
                                ip_range_groups: vec![group],
                            },
                        );
                    }
                    Some(existing) => {
                        existing.ip_range_groups.push(group);
                        directory.duplicate_domains.insert(domain.clone());
                    }
                }
            }
        }

        directory
    }
}

pub struct OrganizationDirectoryController {
    config: OrganizationDirectoryConfig,
    fetcher: Fetcher,
    alerter: Arc<dyn Alerter>,
}

impl OrganizationDirectoryController {
    pub fn new(config: OrganizationDirectoryConfig, alerter: Arc<dyn Alerter>) -> Self {
        Self {
            config,
            fetcher: Fetcher::new(),
            alerter,
        }
    }

    /// Fetch and rebuild the directory from the configured source.
    pub async fn load(&self) -> Result<OrganizationDirectory, DirectoryError> {
        let bytes = self
            .fetcher
            .fetch(&self.config.source_url, &HashMap::new())
            .await?;
        let document: OrganizationsDocument =
            serde_json::from_slice(&bytes).map_err(|e| DirectoryError::Parse {
                source_url: self.config.source_url.clone(),
                detail: e.to_string(),
            })?;
        let directory = OrganizationDirectory::from_document(document);
        info!(
            domains = directory.organizations.len(),
            duplicates = directory.duplicate_domains.len(),
            "Loaded organization directory"
        );
        Ok(directory)
    }

    /// Start the refresh loop. Each tick loads one fresh snapshot and pushes
    /// it to every observer; a failed load keeps the previous snapshot in
    /// use. A non-positive sync period disables the loop entirely.
    pub fn start_periodic_sync(
        self: &Arc<Self>,
        observers: Vec<Arc<dyn OrganizationsObserver>>,
    ) -> Option<SyncHandle> {
        if self.config.periodic_sync_days <= 0 {
            warn!("Periodic organization directory sync disabled");
            return None;
        }
        let period =
            Duration::from_secs(self.config.periodic_sync_days as u64 * 24 * 60 * 60);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let controller = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // An interval fires immediately; the first refresh is due one
            // full period after startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        info!("Syncing organization directory ...");
                        match controller.load().await {
                            Ok(directory) => {
                                let snapshot = Arc::new(directory);
                                for observer in &observers {
                                    observer.organizations_updated(Arc::clone(&snapshot));
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "Organization directory sync failed, keeping stale data");
                                controller
                                    .alerter
                                    .alert_error("Organization directory sync failed", &e.to_string());
                            }
                        }
                    }
                }
            }
        });

        Some(SyncHandle::new(stop_tx, task))
    }
}
