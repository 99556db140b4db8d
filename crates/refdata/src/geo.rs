//! Geo directory: identifier -> map coordinate
//!
//! Two identifier namespaces share the record shape: `organizations` keys by
//! email domain, `validators` by lowercased address hash. Lookups that miss
//! yield a zero coordinate, never an error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{error, info, warn};

use pulsefeed_config::GeoDirectoryConfig;

use crate::alert::Alerter;
use crate::error::DirectoryError;
use crate::fetch::Fetcher;
use crate::sync::{GeoObserver, SyncHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeoNamespace {
    Organizations,
    Validators,
}

impl GeoNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeoNamespace::Organizations => "organizations",
            GeoNamespace::Validators => "validators",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Coordinate {
    pub lat: f64,
    pub long: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub coordinate: Coordinate,
    pub country_id: String,
    pub state_id: String,
}

/// Immutable snapshot, rebuilt wholesale on every load.
#[derive(Debug, Clone, Default)]
pub struct GeoDirectory {
    pub locations: HashMap<String, Location>,
}

impl GeoDirectory {
    /// Missing identifiers resolve to the zero coordinate.
    pub fn locate(&self, id: &str) -> Location {
        self.locations.get(id).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeoRecord {
    id: String,
    coordinate: Coordinate,
    #[serde(default)]
    country_id: String,
    #[serde(default)]
    state_id: String,
}

pub struct GeoDirectoryController {
    config: GeoDirectoryConfig,
    fetcher: Fetcher,
    alerter: Arc<dyn Alerter>,
}

impl GeoDirectoryController {
    pub fn new(config: GeoDirectoryConfig, alerter: Arc<dyn Alerter>) -> Self {
        Self {
            config,
            fetcher: Fetcher::new(),
            alerter,
        }
    }

    /// Fetch and rebuild one namespace of the directory.
    pub async fn load(&self, namespace: GeoNamespace) -> Result<GeoDirectory, DirectoryError> {
        let source_url = match namespace {
            GeoNamespace::Organizations => &self.config.organizations_source_url,
            GeoNamespace::Validators => &self.config.validators_source_url,
        };
        let mut headers = HashMap::new();
        if !self.config.api_password.is_empty() {
            headers.insert("gis-api-password".to_string(), self.config.api_password.clone());
        }

        let bytes = self.fetcher.fetch(source_url, &headers).await?;
        let records: Vec<GeoRecord> =
            serde_json::from_slice(&bytes).map_err(|e| DirectoryError::Parse {
                source_url: source_url.clone(),
                detail: e.to_string(),
            })?;

        let mut locations = HashMap::with_capacity(records.len());
        for record in records {
            locations.insert(
                record.id.to_lowercase(),
                Location {
                    coordinate: record.coordinate,
                    country_id: record.country_id,
                    state_id: record.state_id,
                },
            );
        }
        info!(
            namespace = namespace.as_str(),
            locations = locations.len(),
            "Loaded geo directory"
        );
        Ok(GeoDirectory { locations })
    }

    /// Start the refresh loop: each tick reloads both namespaces once and
    /// pushes each fresh snapshot to every observer. Same disable/error
    /// policy as the organization directory.
    pub fn start_periodic_sync(
        self: &Arc<Self>,
        observers: Vec<Arc<dyn GeoObserver>>,
    ) -> Option<SyncHandle> {
        if self.config.periodic_sync_days <= 0 {
            warn!("Periodic geo directory sync disabled");
            return None;
        }
        let period =
            Duration::from_secs(self.config.periodic_sync_days as u64 * 24 * 60 * 60);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let controller = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        info!("Syncing geo directories ...");
                        for namespace in [GeoNamespace::Organizations, GeoNamespace::Validators] {
                            match controller.load(namespace).await {
                                Ok(directory) => {
                                    let snapshot = Arc::new(directory);
                                    for observer in &observers {
                                        observer.geo_updated(namespace, Arc::clone(&snapshot));
                                    }
                                }
                                Err(e) => {
                                    error!(
                                        namespace = namespace.as_str(),
                                        error = %e,
                                        "Geo directory sync failed, keeping stale data"
                                    );
                                    controller
                                        .alerter
                                        .alert_error("Geo directory sync failed", &e.to_string());
                                }
                            }
                        }
                    }
                }
            }
        });

        Some(SyncHandle::new(stop_tx, task))
    }
}
