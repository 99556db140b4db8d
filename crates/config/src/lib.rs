//! pulsefeed-config: Deployment configuration types
//!
//! One YAML file describes everything the supervisor needs: which source
//! services to poll, their database endpoints, the shared websocket surface,
//! and the reference-data sources.

pub mod environment;
pub mod error;

pub use environment::{
    AlertMailConfig, DatabaseConfig, Environment, GeoDirectoryConfig,
    OrganizationDirectoryConfig, ServiceConfig, ServiceKind, WebsocketConfig,
};
pub use error::ConfigError;
