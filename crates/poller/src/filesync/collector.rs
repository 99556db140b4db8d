//! File-sync enrichment: guest resolution, organization names, coordinates

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use pulsefeed_refdata::{
    GeoDirectory, GeoNamespace, GeoObserver, Location, OrganizationDirectory,
    OrganizationsObserver,
};

use crate::enrich;
use crate::filesync::database::FileSyncQueries;
use crate::traits::{encode_payload, BackendConnection, Collector, Harvest};

/// The file-sync backend's clock runs two hours behind; the query window is
/// shifted to match.
const SERVER_CLOCK_SKEW_HOURS: i64 = 2;

/// The backend stores seconds; the dashboard works in milliseconds
/// throughout, so payload timestamps are scaled up.
const MS_PER_SECOND: i64 = 1000;

const WINDOW_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Default, Serialize)]
struct FileSyncPayload {
    #[serde(rename = "FileChanges")]
    file_changes: Vec<FileChangeEvent>,
    #[serde(rename = "LibraryCreations")]
    library_creations: Vec<LibraryCreationEvent>,
    #[serde(rename = "ActivatedUsers")]
    activated_users: Vec<ActivatedUserEvent>,
}

#[derive(Debug, Serialize)]
struct FileChangeEvent {
    #[serde(rename = "OperationSize")]
    operation_size: i64,
    #[serde(rename = "OperationType")]
    operation_type: String,
    #[serde(rename = "Timestamp")]
    timestamp: i64,
    #[serde(rename = "OrganizationName")]
    organization_name: String,
    #[serde(rename = "Location")]
    location: Location,
}

#[derive(Debug, Serialize)]
struct LibraryCreationEvent {
    #[serde(rename = "Timestamp")]
    timestamp: i64,
    #[serde(rename = "OrganizationName")]
    organization_name: String,
    #[serde(rename = "Location")]
    location: Location,
}

#[derive(Debug, Serialize)]
struct ActivatedUserEvent {
    #[serde(rename = "Timestamp")]
    timestamp: i64,
    #[serde(rename = "OrganizationName")]
    organization_name: String,
}

pub struct FileSyncCollector {
    database: Arc<dyn FileSyncQueries>,
    organizations: ArcSwap<OrganizationDirectory>,
    geo: ArcSwap<GeoDirectory>,
    query_interval_s: i64,
    guest_fallback_domain: String,
}

impl FileSyncCollector {
    pub fn new(
        database: Arc<dyn FileSyncQueries>,
        organizations: Arc<OrganizationDirectory>,
        geo: Arc<GeoDirectory>,
        query_interval_s: i64,
        guest_fallback_domain: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            database,
            organizations: ArcSwap::new(organizations),
            geo: ArcSwap::new(geo),
            query_interval_s,
            guest_fallback_domain,
        })
    }

    /// Resolve the lookup domain and display name for one record. Returns
    /// `(name, lookup_domain)`; the lookup domain also keys the geo lookup.
    fn organization_for(
        &self,
        organizations: &OrganizationDirectory,
        user_domain: &str,
        invited_from_domain: &str,
    ) -> (String, String) {
        let lookup = enrich::resolve_lookup_domain(
            organizations,
            user_domain,
            invited_from_domain,
            &self.guest_fallback_domain,
        );
        let name = if organizations.duplicate_domains.contains(&lookup) {
            // no per-address data from this backend, keep the bare domain
            lookup.clone()
        } else {
            enrich::display_name(organizations, &lookup).unwrap_or_else(|| lookup.clone())
        };
        (name, lookup)
    }
}

#[async_trait]
impl Collector for FileSyncCollector {
    fn service(&self) -> &'static str {
        "filesync"
    }

    fn backend(&self) -> Arc<dyn BackendConnection> {
        self.database.connection()
    }

    async fn collect(&self, now: DateTime<Utc>) -> Harvest {
        let to = now - Duration::hours(SERVER_CLOCK_SKEW_HOURS);
        let from = to - Duration::seconds(self.query_interval_s);
        let from_window = from.format(WINDOW_FORMAT).to_string();
        let to_window = to.format(WINDOW_FORMAT).to_string();
        let mut degraded = false;

        let file_changes = match self
            .database
            .load_file_changes(&from_window, &to_window)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Could not load file changes");
                degraded = true;
                Vec::new()
            }
        };
        let library_creations = match self
            .database
            .load_library_creations(&from_window, &to_window)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Could not load library creations");
                degraded = true;
                Vec::new()
            }
        };
        let activated_users = match self
            .database
            .load_activated_users(from.timestamp(), to.timestamp())
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Could not load activated users");
                degraded = true;
                Vec::new()
            }
        };

        let organizations = self.organizations.load_full();
        let geo = self.geo.load_full();
        let mut payload = FileSyncPayload::default();

        for change in file_changes {
            let (organization_name, lookup) = self.organization_for(
                &organizations,
                &change.user_domain,
                &change.invited_from_domain,
            );
            payload.file_changes.push(FileChangeEvent {
                operation_size: change.operation_size,
                operation_type: change.operation_type,
                timestamp: change.timestamp * MS_PER_SECOND,
                organization_name,
                location: geo.locate(&lookup),
            });
        }

        for creation in library_creations {
            let (organization_name, lookup) = self.organization_for(
                &organizations,
                &creation.user_domain,
                &creation.invited_from_domain,
            );
            payload.library_creations.push(LibraryCreationEvent {
                timestamp: creation.timestamp * MS_PER_SECOND,
                organization_name,
                location: geo.locate(&lookup),
            });
        }

        for user in activated_users {
            let (organization_name, _) = self.organization_for(
                &organizations,
                &user.user_domain,
                &user.invited_from_domain,
            );
            payload.activated_users.push(ActivatedUserEvent {
                timestamp: user.timestamp * MS_PER_SECOND,
                organization_name,
            });
        }

        Harvest {
            payload: encode_payload("filesync", &payload),
            from_timepoint_ms: from.timestamp_millis(),
            degraded,
        }
    }
}

impl OrganizationsObserver for FileSyncCollector {
    fn organizations_updated(&self, directory: Arc<OrganizationDirectory>) {
        info!(service = "filesync", "Swapping in fresh organization directory");
        self.organizations.store(directory);
    }
}

impl GeoObserver for FileSyncCollector {
    fn geo_updated(&self, namespace: GeoNamespace, directory: Arc<GeoDirectory>) {
        if namespace == GeoNamespace::Organizations {
            info!(service = "filesync", "Swapping in fresh geo directory");
            self.geo.store(directory);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::filesync::database::{
        ActivatedUserRecord, FileChangeRecord, LibraryCreationRecord,
    };
    use pulsefeed_refdata::Organization;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct NullBackend;

    #[async_trait]
    impl BackendConnection for NullBackend {
        async fn connect(&self) -> Result<(), BackendError> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn is_connecting(&self) -> bool {
            false
        }
        fn set_connecting(&self, _connecting: bool) {}
        async fn ping(&self) -> Result<(), BackendError> {
            Ok(())
        }
        async fn close(&self) {}
    }

    #[derive(Default)]
    struct MockFileSyncDb {
        file_changes: Vec<FileChangeRecord>,
        library_creations: Vec<LibraryCreationRecord>,
        activated_users: Vec<ActivatedUserRecord>,
        fail_library_creations: bool,
        windows: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl FileSyncQueries for MockFileSyncDb {
        fn connection(&self) -> Arc<dyn BackendConnection> {
            Arc::new(NullBackend)
        }
        async fn load_file_changes(
            &self,
            from: &str,
            to: &str,
        ) -> Result<Vec<FileChangeRecord>, BackendError> {
            self.windows
                .lock()
                .unwrap()
                .push((from.to_string(), to.to_string()));
            Ok(self.file_changes.clone())
        }
        async fn load_library_creations(
            &self,
            _from: &str,
            _to: &str,
        ) -> Result<Vec<LibraryCreationRecord>, BackendError> {
            if self.fail_library_creations {
                Err(BackendError::QueryFailed("boom".to_string()))
            } else {
                Ok(self.library_creations.clone())
            }
        }
        async fn load_activated_users(
            &self,
            _from_s: i64,
            _to_s: i64,
        ) -> Result<Vec<ActivatedUserRecord>, BackendError> {
            Ok(self.activated_users.clone())
        }
    }

    fn directory() -> Arc<OrganizationDirectory> {
        let mut organizations = HashMap::new();
        organizations.insert(
            "aaa.de".to_string(),
            Organization {
                display_name: "AAA Institute".to_string(),
                ip_range_groups: vec![],
            },
        );
        organizations.insert(
            "hq.example.org".to_string(),
            Organization {
                display_name: "Headquarters".to_string(),
                ip_range_groups: vec![],
            },
        );
        Arc::new(OrganizationDirectory {
            organizations,
            duplicate_domains: Default::default(),
        })
    }

    fn collector(database: Arc<MockFileSyncDb>) -> Arc<FileSyncCollector> {
        FileSyncCollector::new(
            database,
            directory(),
            Arc::new(GeoDirectory::default()),
            5,
            "hq.example.org".to_string(),
        )
    }

    fn decode(harvest: &Harvest) -> serde_json::Value {
        serde_json::from_str(&harvest.payload).unwrap()
    }

    #[tokio::test]
    async fn test_guest_without_inviter_falls_back_to_default_domain() {
        let database = Arc::new(MockFileSyncDb {
            activated_users: vec![ActivatedUserRecord {
                timestamp: 1700000000,
                invited_from_domain: String::new(),
                user_domain: "gmail.com".to_string(),
            }],
            ..Default::default()
        });
        let collector = collector(database);

        let harvest = collector.collect(Utc::now()).await;
        let payload = decode(&harvest);

        assert_eq!(
            payload["ActivatedUsers"][0]["OrganizationName"],
            "Headquarters"
        );
        // seconds scaled to milliseconds for the dashboard
        assert_eq!(
            payload["ActivatedUsers"][0]["Timestamp"],
            1_700_000_000_000_i64
        );
    }

    #[tokio::test]
    async fn test_guest_with_known_inviter_uses_inviter_organization() {
        let database = Arc::new(MockFileSyncDb {
            library_creations: vec![LibraryCreationRecord {
                timestamp: 1700000000,
                invited_from_domain: "aaa.de".to_string(),
                user_domain: "gmail.com".to_string(),
            }],
            ..Default::default()
        });
        let collector = collector(database);

        let harvest = collector.collect(Utc::now()).await;
        let payload = decode(&harvest);

        assert_eq!(
            payload["LibraryCreations"][0]["OrganizationName"],
            "AAA Institute"
        );
    }

    #[tokio::test]
    async fn test_partial_query_failure_keeps_other_results() {
        let database = Arc::new(MockFileSyncDb {
            file_changes: vec![FileChangeRecord {
                operation_size: 2048,
                operation_type: "edit".to_string(),
                timestamp: 1700000000,
                invited_from_domain: String::new(),
                user_domain: "aaa.de".to_string(),
            }],
            fail_library_creations: true,
            ..Default::default()
        });
        let collector = collector(database);

        let harvest = collector.collect(Utc::now()).await;
        let payload = decode(&harvest);

        assert!(harvest.degraded);
        assert_eq!(payload["FileChanges"].as_array().unwrap().len(), 1);
        assert_eq!(payload["FileChanges"][0]["OrganizationName"], "AAA Institute");
        assert!(payload["LibraryCreations"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_window_is_skewed_and_formatted() {
        let database = Arc::new(MockFileSyncDb::default());
        let collector = collector(database.clone());

        let now = DateTime::parse_from_rfc3339("2024-03-02T12:00:10Z")
            .unwrap()
            .with_timezone(&Utc);
        let harvest = collector.collect(now).await;

        let windows = database.windows.lock().unwrap();
        // two hours behind, five seconds wide
        assert_eq!(windows[0].0, "2024-03-02 10:00:05");
        assert_eq!(windows[0].1, "2024-03-02 10:00:10");
        assert_eq!(
            harvest.from_timepoint_ms,
            DateTime::parse_from_rfc3339("2024-03-02T10:00:05Z")
                .unwrap()
                .timestamp_millis()
        );
    }
}
