use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::error;

use crate::error::BackendError;

/// Lifecycle surface of one backend database connection. The connection is
/// absent when disconnected; `connecting` is a distinct transient state the
/// dashboard renders during reconnect attempts.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    async fn connect(&self) -> Result<(), BackendError>;

    fn is_connected(&self) -> bool;

    fn is_connecting(&self) -> bool;

    fn set_connecting(&self, connecting: bool);

    /// Lightweight liveness probe, used after a query error to decide
    /// whether the connection is actually gone.
    async fn ping(&self) -> Result<(), BackendError>;

    async fn close(&self);
}

/// What one tick produced.
pub struct Harvest {
    /// JSON-encoded source payload for the envelope `Data` field.
    pub payload: String,
    /// Query window start, unix milliseconds.
    pub from_timepoint_ms: i64,
    /// At least one window query failed; partial results are still in
    /// `payload`.
    pub degraded: bool,
}

/// Serialize a source payload for the envelope `Data` field. Serialization
/// of these plain structs does not realistically fail; should it anyway, the
/// tick still sends an envelope with an empty payload.
pub(crate) fn encode_payload<T: serde::Serialize>(service: &str, payload: &T) -> String {
    match serde_json::to_string(payload) {
        Ok(json) => json,
        Err(e) => {
            error!(service = service, error = %e, "Could not serialize payload");
            "{}".to_string()
        }
    }
}

/// Per-source query and enrichment step. The poller drives the lifecycle;
/// the collector knows its backend's window conventions and payload shape.
#[async_trait]
pub trait Collector: Send + Sync {
    fn service(&self) -> &'static str;

    fn backend(&self) -> Arc<dyn BackendConnection>;

    /// Run this tick's window queries and enrichment. Never fails outright:
    /// a broken query degrades the harvest instead of discarding the
    /// remaining sources' results. Per-tick caches are cleared before
    /// returning.
    async fn collect(&self, now: DateTime<Utc>) -> Harvest;
}
