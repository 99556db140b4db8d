//! Websocket hub: connection registry and bulk fan-out
//!
//! One hub instance is shared by every poller. The registry lock and the
//! send-path lock are separate so a slow fan-out does not block new clients
//! from connecting. Inbound frames are drained and discarded (push-only
//! protocol); the read loop doubles as disconnect detection.

use async_trait::async_trait;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use pulsefeed_config::WebsocketConfig;

use crate::envelope::EventData;

/// Outbound frames buffered per connection before the client counts as broken.
const OUTBOUND_BUFFER: usize = 64;

/// Grace period between the close notification and tearing the listener down.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Push-delivery capability the pollers talk to. The hub implements it; tests
/// substitute mocks.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Start the transport. Idempotent; every call after the first succeeds
    /// without effect.
    fn start_once(&self);

    fn active_connections(&self) -> usize;

    /// Serialize once and deliver to every live connection, pruning dead ones.
    async fn send_in_bulk(&self, event: &EventData);

    /// Close all connections and stop the listener. Idempotent.
    fn shutdown(&self);

    /// Transport failures (bind/serve errors) are published here.
    fn subscribe_errors(&self) -> broadcast::Receiver<String>;
}

struct HubInner {
    config: WebsocketConfig,
    connections: Mutex<HashMap<String, mpsc::Sender<Message>>>,
    send_lock: tokio::sync::Mutex<()>,
    started: AtomicBool,
    shutting_down: AtomicBool,
    error_tx: broadcast::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
    server_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(config: WebsocketConfig) -> Self {
        let (error_tx, _) = broadcast::channel(8);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(HubInner {
                config,
                connections: Mutex::new(HashMap::new()),
                send_lock: tokio::sync::Mutex::new(()),
                started: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                error_tx,
                shutdown_tx,
                server_task: Mutex::new(None),
            }),
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route(&self.inner.config.endpoint_path, get(ws_endpoint))
            .with_state(self.clone())
    }

    async fn serve(&self) -> std::io::Result<()> {
        let app = self.router();
        let listener = TcpListener::bind(&self.inner.config.bind_addr).await?;
        info!(
            addr = %self.inner.config.bind_addr,
            path = %self.inner.config.endpoint_path,
            "Websocket hub listening"
        );
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_rx.changed().await.ok();
        })
        .await
    }

    fn try_register(&self, key: String, tx: mpsc::Sender<Message>) -> bool {
        let mut connections = self.inner.connections.lock().unwrap();
        if connections.len() >= self.inner.config.max_connections {
            return false;
        }
        info!(remote = %key, "Websocket connection registered");
        connections.insert(key, tx);
        true
    }

    fn remove_connection(&self, key: &str) {
        if self.inner.connections.lock().unwrap().remove(key).is_some() {
            info!(remote = %key, "Websocket connection removed");
        }
    }

    async fn handle_socket(self, socket: WebSocket, remote: String) {
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        if !self.try_register(remote.clone(), tx) {
            // a connection raced past the pre-upgrade gate
            warn!(remote = %remote, "Connection limit reached after upgrade, dropping");
            return;
        }

        let (mut sink, mut stream) = socket.split();
        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(frame) => {
                        let closing = matches!(frame, Message::Close(_));
                        if sink.send(frame).await.is_err() {
                            warn!(remote = %remote, "Could not write to websocket connection");
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    // sender dropped: this connection was pruned by a bulk send
                    None => break,
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(frame)) => {
                        debug!(remote = %remote, ?frame, "Discarding inbound websocket frame");
                    }
                    _ => break,
                },
            }
        }
        self.remove_connection(&remote);
    }
}

async fn ws_endpoint(
    State(hub): State<BroadcastHub>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    if hub.active_connections() >= hub.inner.config.max_connections {
        warn!(
            max = hub.inner.config.max_connections,
            "Max websocket connections reached, rejecting new connection"
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| hub.handle_socket(socket, addr.to_string()))
}

#[async_trait]
impl EventSink for BroadcastHub {
    fn start_once(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let hub = self.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = hub.serve().await {
                error!(error = %e, "Websocket hub failed");
                hub.inner.error_tx.send(e.to_string()).ok();
            }
        });
        *self.inner.server_task.lock().unwrap() = Some(task);
    }

    fn active_connections(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    async fn send_in_bulk(&self, event: &EventData) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Could not serialize event envelope");
                return;
            }
        };

        // one poller's payload in flight at a time
        let _send_guard = self.inner.send_lock.lock().await;

        let mut connections = self.inner.connections.lock().unwrap();
        if connections.is_empty() {
            warn!("There is no active websocket connection yet");
            return;
        }

        let mut broken = Vec::new();
        for (remote, tx) in connections.iter() {
            if tx.try_send(Message::Text(payload.clone())).is_err() {
                warn!(remote = %remote, "Could not deliver to websocket connection, dropping it");
                broken.push(remote.clone());
            }
        }
        for remote in broken {
            connections.remove(&remote);
        }
    }

    fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Websocket hub already shutting down");
            return;
        }
        info!("Closing open connections and stopping websocket hub");

        let connections = std::mem::take(&mut *self.inner.connections.lock().unwrap());
        for (remote, tx) in connections {
            if tx.try_send(Message::Close(None)).is_err() {
                warn!(remote = %remote, "Could not send close notification");
            }
        }

        self.inner.shutdown_tx.send(true).ok();
        if let Some(task) = self.inner.server_task.lock().unwrap().take() {
            tokio::spawn(async move {
                tokio::time::sleep(CLOSE_GRACE).await;
                task.abort();
            });
        }
    }

    fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.inner.error_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ConnectionHealth;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_hub(max_connections: usize) -> BroadcastHub {
        BroadcastHub::new(WebsocketConfig {
            endpoint_path: "/events".to_string(),
            max_connections,
            bind_addr: "127.0.0.1:0".to_string(),
        })
    }

    fn test_event() -> EventData {
        EventData::new(
            "chat",
            r#"{"Messages":[]}"#.to_string(),
            0,
            1,
            ConnectionHealth::default(),
        )
    }

    #[tokio::test]
    async fn test_bulk_send_delivers_and_prunes_dead_connections() {
        let hub = test_hub(10);
        let (alive_tx, mut alive_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (dead_tx, dead_rx) = mpsc::channel(OUTBOUND_BUFFER);
        assert!(hub.try_register("alive".to_string(), alive_tx));
        assert!(hub.try_register("dead".to_string(), dead_tx));
        drop(dead_rx);

        hub.send_in_bulk(&test_event()).await;

        assert_eq!(hub.active_connections(), 1);
        match alive_rx.try_recv().unwrap() {
            Message::Text(payload) => assert!(payload.contains(r#""Service":"chat""#)),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bulk_send_without_connections_is_noop() {
        let hub = test_hub(10);
        hub.send_in_bulk(&test_event()).await;
        assert_eq!(hub.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_registry_enforces_max_connections() {
        let hub = test_hub(1);
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        assert!(hub.try_register("first".to_string(), tx1));
        assert!(!hub.try_register("second".to_string(), tx2));
        assert_eq!(hub.active_connections(), 1);
    }

    #[tokio::test]
    async fn test_endpoint_rejects_when_full() {
        let hub = test_hub(1);
        let (tx, _rx) = mpsc::channel(1);
        assert!(hub.try_register("occupied".to_string(), tx));

        let app = hub
            .router()
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
        let request = Request::builder()
            .uri("/events")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_shutdown_sends_close_and_is_idempotent() {
        let hub = test_hub(10);
        let (tx, mut rx) = mpsc::channel(OUTBOUND_BUFFER);
        assert!(hub.try_register("client".to_string(), tx));

        hub.shutdown();
        hub.shutdown();

        assert_eq!(hub.active_connections(), 0);
        assert!(matches!(rx.try_recv().unwrap(), Message::Close(None)));
    }
}
