//! Outbound wire format
//!
//! Field names are part of the client contract and must not change. The
//! source payload travels pre-serialized inside `Data` so this layer stays
//! source-agnostic.

use serde::{Deserialize, Serialize};

// Stamped by the release script; do not edit by hand.
pub const VERSION: &str = "20250612090000";

// Bumped manually when the dashboard frontend changes incompatibly, so
// long-running installations can prompt a reload.
pub const EXPECTED_FRONTEND_VERSION: i64 = 20250612090000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventData {
    #[serde(rename = "Data")]
    pub data: String,
    #[serde(rename = "EventInfo")]
    pub event_info: EventInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventInfo {
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "ExpectedFrontendVersion")]
    pub expected_frontend_version: i64,
    #[serde(rename = "ActiveConnections")]
    pub active_connections: usize,
    #[serde(rename = "FromTimepoint")]
    pub from_timepoint: i64,
    #[serde(rename = "DatabaseInfo")]
    pub database_info: DatabaseInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DatabaseInfo {
    #[serde(rename = "IsConnectionEstablished")]
    pub is_connection_established: bool,
    #[serde(rename = "IsConnecting")]
    pub is_connecting: bool,
    #[serde(rename = "NextReconnect")]
    pub next_reconnect: i64,
    #[serde(rename = "NumberOfDbReconnects")]
    pub number_of_db_reconnects: u32,
}

/// Backend connection snapshot taken at envelope-assembly time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionHealth {
    pub is_connected: bool,
    pub is_connecting: bool,
    pub next_reconnect_ms: i64,
    pub reconnect_count: u32,
}

impl EventData {
    pub fn new(service: &str, payload: String, from_timepoint: i64, active_connections: usize, health: ConnectionHealth) -> Self {
        Self {
            data: payload,
            event_info: EventInfo {
                service: service.to_string(),
                version: VERSION.to_string(),
                expected_frontend_version: EXPECTED_FRONTEND_VERSION,
                active_connections,
                from_timepoint,
                database_info: DatabaseInfo {
                    is_connection_established: health.is_connected,
                    is_connecting: health.is_connecting,
                    next_reconnect: health.next_reconnect_ms,
                    number_of_db_reconnects: health.reconnect_count,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names_are_stable() {
        let event = EventData::new(
            "chat",
            r#"{"Messages":[]}"#.to_string(),
            1700000000000,
            3,
            ConnectionHealth {
                is_connected: true,
                is_connecting: false,
                next_reconnect_ms: 1700000123000,
                reconnect_count: 2,
            },
        );

        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();

        assert_eq!(value["Data"], r#"{"Messages":[]}"#);
        let info = &value["EventInfo"];
        assert_eq!(info["Service"], "chat");
        assert_eq!(info["Version"], VERSION);
        assert_eq!(info["ExpectedFrontendVersion"], EXPECTED_FRONTEND_VERSION);
        assert_eq!(info["ActiveConnections"], 3);
        assert_eq!(info["FromTimepoint"], 1_700_000_000_000_i64);
        let db = &info["DatabaseInfo"];
        assert_eq!(db["IsConnectionEstablished"], true);
        assert_eq!(db["IsConnecting"], false);
        assert_eq!(db["NextReconnect"], 1_700_000_123_000_i64);
        assert_eq!(db["NumberOfDbReconnects"], 2);
    }

    #[test]
    fn test_payload_stays_opaque() {
        // The payload is carried as a string, not re-parsed JSON.
        let event = EventData::new("chain", "not json at all".to_string(), 0, 0, ConnectionHealth::default());
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(value["Data"], "not json at all");
    }
}
