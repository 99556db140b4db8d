//! Shared postgres connection management for the source adapters
//!
//! One client per poller, no pool: ticks are strictly sequential, so a
//! single connection is always enough. The client is dropped on close and
//! re-established by the reconnector.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_postgres::{Client, NoTls};
use tracing::{error, info, warn};

use pulsefeed_config::DatabaseConfig;

use crate::error::BackendError;
use crate::traits::BackendConnection;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Window queries slower than this are worth a warning.
pub const SLOW_QUERY_MS: u128 = 1000;

pub struct PgBackend {
    service: &'static str,
    config: DatabaseConfig,
    client: AsyncMutex<Option<Client>>,
    connection_task: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    connecting: AtomicBool,
}

impl PgBackend {
    pub fn new(service: &'static str, config: DatabaseConfig) -> Self {
        Self {
            service,
            config,
            client: AsyncMutex::new(None),
            connection_task: Mutex::new(None),
            connected: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
        }
    }

    /// Current client; `None` while disconnected. Query code holds the guard
    /// for the duration of one statement.
    pub async fn client(&self) -> MutexGuard<'_, Option<Client>> {
        self.client.lock().await
    }

    pub fn service(&self) -> &'static str {
        self.service
    }
}

#[async_trait]
impl BackendConnection for PgBackend {
    async fn connect(&self) -> Result<(), BackendError> {
        info!(service = self.service, "Connecting to backend database");
        self.connecting.store(true, Ordering::SeqCst);

        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .user(&self.config.user)
            .password(&self.config.password)
            .host(&self.config.host)
            .port(self.config.port)
            .dbname(&self.config.dbname)
            .connect_timeout(CONNECT_TIMEOUT);

        match pg_config.connect(NoTls).await {
            Ok((client, connection)) => {
                let service = self.service;
                let task = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!(service = service, error = %e, "Backend connection terminated");
                    }
                });
                *self.client.lock().await = Some(client);
                if let Some(previous) = self.connection_task.lock().unwrap().replace(task) {
                    previous.abort();
                }
                self.connected.store(true, Ordering::SeqCst);
                self.connecting.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                *self.client.lock().await = None;
                self.connected.store(false, Ordering::SeqCst);
                self.connecting.store(false, Ordering::SeqCst);
                error!(service = self.service, error = %e, "Can not connect to backend database");
                Err(BackendError::ConnectionFailed(e.to_string()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::SeqCst)
    }

    fn set_connecting(&self, connecting: bool) {
        self.connecting.store(connecting, Ordering::SeqCst);
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let guard = self.client.lock().await;
        let Some(client) = guard.as_ref() else {
            return Err(BackendError::NotConnected);
        };
        client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| BackendError::PingFailed(e.to_string()))
    }

    async fn close(&self) {
        warn!(service = self.service, "Closing backend database connection");
        *self.client.lock().await = None;
        if let Some(task) = self.connection_task.lock().unwrap().take() {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}
