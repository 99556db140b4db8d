use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Which backend a configured service polls. Selects the query adapter and
/// the tick-interval unit (milliseconds for chat/chain, seconds for filesync).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Chat,
    Filesync,
    Chain,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Chat => "chat",
            ServiceKind::Filesync => "filesync",
            ServiceKind::Chain => "chain",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub dbname: String,
    /// Flat retry interval of the reconnector, in minutes.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_minutes: u64,
}

fn default_reconnect_interval() -> u64 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    /// Query window / tick length. Milliseconds for chat and chain,
    /// seconds for filesync.
    pub query_interval: i64,
    pub database: DatabaseConfig,
}

/// Shared websocket surface. All pollers broadcast into one hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketConfig {
    pub endpoint_path: String,
    pub max_connections: usize,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationDirectoryConfig {
    /// HTTP resource or local file path.
    pub source_url: String,
    /// Refresh period in days; <= 0 disables periodic sync.
    #[serde(default)]
    pub periodic_sync_days: i64,
    /// Domain attributed to guests whose inviter is unknown.
    #[serde(default = "default_guest_domain")]
    pub guest_fallback_domain: String,
}

fn default_guest_domain() -> String {
    "hq.example.org".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoDirectoryConfig {
    /// HTTP resource or local file path, domain-keyed entries.
    pub organizations_source_url: String,
    /// HTTP resource or local file path, address-hash-keyed entries.
    pub validators_source_url: String,
    /// Refresh period in days; <= 0 disables periodic sync.
    #[serde(default)]
    pub periodic_sync_days: i64,
    #[serde(default)]
    pub api_password: String,
}

/// Outbound alert mail endpoint. Delivery itself is an external collaborator;
/// the supervisor only needs the addressing data.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlertMailConfig {
    #[serde(default)]
    pub smtp_server: String,
    #[serde(default)]
    pub smtp_port: u16,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub to_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub services: Vec<ServiceConfig>,
    pub websocket: WebsocketConfig,
    pub organization_directory: OrganizationDirectoryConfig,
    pub geo_directory: GeoDirectoryConfig,
    #[serde(default)]
    pub alert_mail: AlertMailConfig,
}

/// Shortest tick the millisecond-interval sources accept.
pub const MIN_QUERY_INTERVAL_MS: i64 = 1000;
/// Shortest tick the second-interval source accepts.
pub const MIN_QUERY_INTERVAL_S: i64 = 1;

impl Environment {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let env: Environment = serde_yaml::from_str(&content)?;
        Ok(env)
    }

    /// Clamp values that would break the pollers instead of rejecting the
    /// file. Returns the list of clamped fields for logging.
    pub fn validated(mut self) -> (Self, Vec<String>) {
        let mut clamped = Vec::new();
        for service in &mut self.services {
            let floor = match service.kind {
                ServiceKind::Chat | ServiceKind::Chain => MIN_QUERY_INTERVAL_MS,
                ServiceKind::Filesync => MIN_QUERY_INTERVAL_S,
            };
            if service.query_interval < floor {
                service.query_interval = floor;
                clamped.push(format!("{} query_interval", service.kind.as_str()));
            }
        }
        if self.websocket.max_connections == 0 {
            self.websocket.max_connections = 1;
            clamped.push("websocket max_connections".to_string());
        }
        (self, clamped)
    }
}
