//! Top-level composition: config -> directories, hub, pollers
//!
//! One poller per configured service, all sharing the broadcast hub and the
//! reference-data snapshots. The adapter variant is fixed here at build
//! time; nothing downstream switches on the service kind again.

use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info};

use pulsefeed_broadcast::{BroadcastHub, EventSink};
use pulsefeed_config::{Environment, ServiceKind};
use pulsefeed_poller::chain::{ChainCollector, ChainDatabase};
use pulsefeed_poller::chat::{ChatCollector, ChatDatabase};
use pulsefeed_poller::filesync::{FileSyncCollector, FileSyncDatabase};
use pulsefeed_poller::Poller;
use pulsefeed_refdata::{
    Alerter, GeoDirectory, GeoDirectoryController, GeoNamespace, GeoObserver,
    OrganizationDirectory, OrganizationDirectoryController, OrganizationsObserver, SyncHandle,
};

pub struct Supervisor {
    pollers: Vec<Arc<Poller>>,
    organization_sync: Option<SyncHandle>,
    geo_sync: Option<SyncHandle>,
}

impl Supervisor {
    /// Build everything from the validated environment and start it.
    pub async fn start(environment: Environment, alerter: Arc<dyn Alerter>) -> Self {
        let hub = BroadcastHub::new(environment.websocket.clone());

        let guest_fallback_domain = environment
            .organization_directory
            .guest_fallback_domain
            .clone();
        let organization_controller = Arc::new(OrganizationDirectoryController::new(
            environment.organization_directory.clone(),
            Arc::clone(&alerter),
        ));
        let geo_controller = Arc::new(GeoDirectoryController::new(
            environment.geo_directory.clone(),
            Arc::clone(&alerter),
        ));

        info!("Loading organization directory ...");
        let organizations = match organization_controller.load().await {
            Ok(directory) => Arc::new(directory),
            Err(e) => {
                error!(error = %e, "Could not load organization directory, starting empty");
                alerter.alert_error("Could not load organization directory", &e.to_string());
                Arc::new(OrganizationDirectory::default())
            }
        };

        info!("Loading geo directories ...");
        let organizations_geo = Self::load_geo(&geo_controller, GeoNamespace::Organizations, &alerter).await;
        let validators_geo = Self::load_geo(&geo_controller, GeoNamespace::Validators, &alerter).await;

        let mut pollers = Vec::with_capacity(environment.services.len());
        let mut organization_observers: Vec<Arc<dyn OrganizationsObserver>> = Vec::new();
        let mut geo_observers: Vec<Arc<dyn GeoObserver>> = Vec::new();

        for service in &environment.services {
            let sink: Arc<dyn EventSink> = Arc::new(hub.clone());
            let reconnect_interval =
                Duration::from_secs(service.database.reconnect_interval_minutes * 60);

            let poller = match service.kind {
                ServiceKind::Chat => {
                    let database = ChatDatabase::new(service.database.clone());
                    let collector = ChatCollector::new(
                        database,
                        Arc::clone(&organizations),
                        service.query_interval,
                    );
                    organization_observers.push(collector.clone());
                    Poller::new(
                        collector,
                        sink,
                        Duration::from_millis(service.query_interval as u64),
                        reconnect_interval,
                    )
                }
                ServiceKind::Filesync => {
                    let database = FileSyncDatabase::new(service.database.clone());
                    let collector = FileSyncCollector::new(
                        database,
                        Arc::clone(&organizations),
                        Arc::clone(&organizations_geo),
                        service.query_interval,
                        guest_fallback_domain.clone(),
                    );
                    organization_observers.push(collector.clone());
                    geo_observers.push(collector.clone());
                    Poller::new(
                        collector,
                        sink,
                        Duration::from_secs(service.query_interval as u64),
                        reconnect_interval,
                    )
                }
                ServiceKind::Chain => {
                    let database = ChainDatabase::new(service.database.clone());
                    let collector = ChainCollector::new(
                        database,
                        Arc::clone(&validators_geo),
                        service.query_interval,
                    );
                    geo_observers.push(collector.clone());
                    Poller::new(
                        collector,
                        sink,
                        Duration::from_millis(service.query_interval as u64),
                        reconnect_interval,
                    )
                }
            };

            poller.init();
            pollers.push(poller);
        }

        info!("Starting pollers ...");
        for poller in &pollers {
            poller.start_service();
        }

        info!("Starting periodic reference data sync ...");
        let organization_sync =
            organization_controller.start_periodic_sync(organization_observers);
        let geo_sync = geo_controller.start_periodic_sync(geo_observers);

        Self {
            pollers,
            organization_sync,
            geo_sync,
        }
    }

    async fn load_geo(
        controller: &GeoDirectoryController,
        namespace: GeoNamespace,
        alerter: &Arc<dyn Alerter>,
    ) -> Arc<GeoDirectory> {
        match controller.load(namespace).await {
            Ok(directory) => Arc::new(directory),
            Err(e) => {
                error!(
                    namespace = namespace.as_str(),
                    error = %e,
                    "Could not load geo directory, starting empty"
                );
                alerter.alert_error("Could not load geo directory", &e.to_string());
                Arc::new(GeoDirectory::default())
            }
        }
    }

    /// Ordered shutdown: pollers first, then the refresh loops.
    pub fn stop(&mut self) {
        for poller in &self.pollers {
            info!(service = poller.service(), "Stopping service");
            poller.stop_service();
        }
        if let Some(sync) = self.organization_sync.take() {
            sync.stop();
        }
        if let Some(sync) = self.geo_sync.take() {
            sync.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulsefeed_config::{
        DatabaseConfig, GeoDirectoryConfig, OrganizationDirectoryConfig, ServiceConfig,
        WebsocketConfig,
    };
    use pulsefeed_refdata::NoopAlerter;

    fn environment() -> Environment {
        Environment {
            services: vec![ServiceConfig {
                kind: ServiceKind::Chat,
                query_interval: 5000,
                database: DatabaseConfig {
                    user: "reader".to_string(),
                    password: "secret".to_string(),
                    host: "127.0.0.1".to_string(),
                    port: 5432,
                    dbname: "chat".to_string(),
                    reconnect_interval_minutes: 20,
                },
            }],
            websocket: WebsocketConfig {
                endpoint_path: "/events".to_string(),
                max_connections: 10,
                bind_addr: "127.0.0.1:0".to_string(),
            },
            organization_directory: OrganizationDirectoryConfig {
                source_url: "/nonexistent/organizations.json".to_string(),
                periodic_sync_days: 0,
                guest_fallback_domain: "hq.example.org".to_string(),
            },
            geo_directory: GeoDirectoryConfig {
                organizations_source_url: "/nonexistent/geo-orgs.json".to_string(),
                validators_source_url: "/nonexistent/geo-validators.json".to_string(),
                periodic_sync_days: 0,
                api_password: String::new(),
            },
            alert_mail: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_supervisor_starts_and_stops_with_unreachable_sources() {
        // reference data being down must not prevent startup
        let mut supervisor = Supervisor::start(environment(), Arc::new(NoopAlerter)).await;
        assert_eq!(supervisor.pollers.len(), 1);
        assert!(supervisor.organization_sync.is_none());
        supervisor.stop();
        supervisor.stop();
    }
}
