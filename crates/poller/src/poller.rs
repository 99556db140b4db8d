//! Generic poller: the tick loop shared by every source
//!
//! Owns the tick schedule, the reconnector and the envelope assembly; the
//! collector contributes the source-specific querying and enrichment. Ticks
//! for one poller never overlap because the single loop task is the only
//! caller of `process_tick`.

use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info};

use pulsefeed_broadcast::{ConnectionHealth, EventData, EventSink};

use crate::reconnect::Reconnector;
use crate::traits::{BackendConnection, Collector};

pub struct Poller {
    service: &'static str,
    tick_interval: Duration,
    collector: Arc<dyn Collector>,
    backend: Arc<dyn BackendConnection>,
    reconnector: Arc<Reconnector>,
    sink: Arc<dyn EventSink>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    error_listener: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    pub fn new(
        collector: Arc<dyn Collector>,
        sink: Arc<dyn EventSink>,
        tick_interval: Duration,
        reconnect_interval: Duration,
    ) -> Arc<Self> {
        let service = collector.service();
        let backend = collector.backend();
        let reconnector = Reconnector::new(service, reconnect_interval, Arc::clone(&backend));
        Arc::new(Self {
            service,
            tick_interval,
            collector,
            backend,
            reconnector,
            sink,
            stop_tx: Mutex::new(None),
            tick_task: Mutex::new(None),
            error_listener: Mutex::new(None),
        })
    }

    /// Wire the error listener and open the outbound transport. The first
    /// tick happens asynchronously, so the backend starts out in the
    /// connecting state rather than flickering "disconnected" at clients.
    pub fn init(self: &Arc<Self>) {
        info!(service = self.service, "Init poller");
        self.backend.set_connecting(true);

        let mut errors = self.sink.subscribe_errors();
        let poller = Arc::clone(self);
        let listener = tokio::spawn(async move {
            if let Ok(e) = errors.recv().await {
                error!(
                    service = poller.service,
                    error = %e,
                    "Broadcast transport failed, stopping service"
                );
                poller.stop_service();
            }
        });
        *self.error_listener.lock().unwrap() = Some(listener);

        self.sink.start_once();
    }

    /// Begin the tick loop. A previous loop, if any, is replaced.
    pub fn start_service(self: &Arc<Self>) {
        info!(service = self.service, "Starting poller");
        self.halt_tick_loop();

        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.stop_tx.lock().unwrap() = Some(stop_tx);

        let poller = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.tick_interval);
            // an interval fires immediately; the first tick is due one full
            // interval in, matching the query window
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                    }
                    _ = ticker.tick() => poller.process_tick().await,
                }
            }
        });
        *self.tick_task.lock().unwrap() = Some(task);
    }

    /// Stop the tick loop, the outbound transport and the error listener.
    /// Safe to call repeatedly; every release happens at most once.
    pub fn stop_service(&self) {
        info!(service = self.service, "Stopping poller");
        self.halt_tick_loop();
        self.sink.shutdown();
        if let Some(listener) = self.error_listener.lock().unwrap().take() {
            listener.abort();
        }
    }

    fn halt_tick_loop(&self) {
        if let Some(stop_tx) = self.stop_tx.lock().unwrap().take() {
            stop_tx.send(true).ok();
        }
        if let Some(task) = self.tick_task.lock().unwrap().take() {
            task.abort();
        }
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub(crate) async fn process_tick(&self) {
        debug!(service = self.service, "Processing poller tick");

        // nobody listening: polling the backend would be wasted cost
        if self.sink.active_connections() == 0 {
            info!(
                service = self.service,
                "No active connections, skipping backend queries"
            );
            if self.backend.is_connected() {
                info!(service = self.service, "Closing idle backend connection");
                self.backend.close().await;
            } else {
                self.reconnector.stop();
            }
            // reconnect on demand once a client shows up
            self.backend.set_connecting(true);
            return;
        }

        if !self.backend.is_connected() {
            self.reconnector.start_repeating_reconnect_once();
        }

        let harvest = self.collector.collect(Utc::now()).await;

        if harvest.degraded {
            if let Err(e) = self.backend.ping().await {
                error!(service = self.service, error = %e, "Backend ping failed, reconnecting");
                self.backend.close().await;
                self.reconnector.start_repeating_reconnect_once();
            }
        }

        let health = ConnectionHealth {
            is_connected: self.backend.is_connected(),
            is_connecting: self.backend.is_connecting(),
            next_reconnect_ms: self.reconnector.next_attempt_ms(),
            reconnect_count: self.reconnector.attempts(),
        };
        let event = EventData::new(
            self.service,
            harvest.payload,
            harvest.from_timepoint_ms,
            self.sink.active_connections(),
            health,
        );
        self.sink.send_in_bulk(&event).await;
    }
}
