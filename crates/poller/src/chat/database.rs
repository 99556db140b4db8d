//! Chat backend adapter: message and session-address queries
//!
//! Timestamps in this schema are unix milliseconds (bigint columns). Rows
//! with a null required column are dropped one by one, never the batch.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use pulsefeed_config::DatabaseConfig;

use crate::enrich::{self, clamp_non_negative_i64};
use crate::error::BackendError;
use crate::postgres::{PgBackend, SLOW_QUERY_MS};
use crate::traits::BackendConnection;

/// One validated chat message row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub user_id: String,
    pub length: i64,
    pub created_at: i64,
    pub channel_type: String,
    pub email_domain: String,
}

/// Raw row shape before validation. Nullable columns stay optional here.
#[derive(Debug)]
pub(crate) struct RawChatMessage {
    pub user_id: String,
    pub length: Option<i64>,
    pub created_at: Option<i64>,
    pub channel_type: Option<String>,
    pub email: Option<String>,
}

pub(crate) fn validate_messages(raw: Vec<RawChatMessage>) -> Vec<ChatMessage> {
    let mut valid = Vec::with_capacity(raw.len());
    for message in raw {
        let (Some(length), Some(created_at), Some(channel_type), Some(email)) = (
            message.length,
            message.created_at,
            message.channel_type,
            message.email,
        ) else {
            warn!("Message with null length, created_at, type or email will be ignored");
            continue;
        };
        let Some(email_domain) = enrich::email_domain(&email) else {
            continue;
        };
        valid.push(ChatMessage {
            user_id: message.user_id,
            length: clamp_non_negative_i64(length, "message_length"),
            created_at: clamp_non_negative_i64(created_at, "created_at"),
            channel_type,
            email_domain,
        });
    }
    valid
}

/// Query surface of the chat backend, mockable for tests.
#[async_trait]
pub trait ChatQueries: Send + Sync {
    fn connection(&self) -> Arc<dyn BackendConnection>;

    async fn load_messages(
        &self,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<ChatMessage>, BackendError>;

    /// Distinct session addresses the user was active from inside the
    /// window.
    async fn load_user_addresses(
        &self,
        user_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<String>, BackendError>;
}

pub struct ChatDatabase {
    backend: Arc<PgBackend>,
}

impl ChatDatabase {
    pub fn new(config: DatabaseConfig) -> Arc<Self> {
        Arc::new(Self {
            backend: Arc::new(PgBackend::new("chat", config)),
        })
    }
}

#[async_trait]
impl ChatQueries for ChatDatabase {
    fn connection(&self) -> Arc<dyn BackendConnection> {
        self.backend.clone()
    }

    async fn load_messages(
        &self,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<ChatMessage>, BackendError> {
        let guard = self.backend.client().await;
        let Some(client) = guard.as_ref() else {
            warn!("Chat backend not connected");
            return Ok(Vec::new());
        };

        let query = "SELECT c.id, LENGTH(a.message)::bigint AS msglen, a.createat, b.type, c.email \
                     FROM posts a, channels b, users c \
                     WHERE a.userid = c.id AND a.channelid = b.id \
                     AND a.createat BETWEEN $1 AND $2 \
                     ORDER BY a.createat ASC";

        let started = Instant::now();
        let rows = client
            .query(query, &[&from_ms, &to_ms])
            .await
            .map_err(|e| BackendError::QueryFailed(e.to_string()))?;
        let elapsed = started.elapsed().as_millis();
        if elapsed > SLOW_QUERY_MS {
            warn!(elapsed_ms = elapsed as u64, "Query for loading messages took unexpectedly long");
        }

        let mut raw = Vec::with_capacity(rows.len());
        for row in rows {
            raw.push(RawChatMessage {
                user_id: row
                    .try_get("id")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                length: row
                    .try_get("msglen")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                created_at: row
                    .try_get("createat")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                channel_type: row
                    .try_get("type")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                email: row
                    .try_get("email")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
            });
        }
        Ok(validate_messages(raw))
    }

    async fn load_user_addresses(
        &self,
        user_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<String>, BackendError> {
        let guard = self.backend.client().await;
        let Some(client) = guard.as_ref() else {
            warn!("Chat backend not connected");
            return Ok(Vec::new());
        };

        let query = "SELECT DISTINCT ipaddress FROM audits \
                     WHERE sessionid IN \
                     (SELECT id FROM sessions WHERE userid = $1 AND lastactivityat BETWEEN $2 AND $3)";

        let started = Instant::now();
        let rows = client
            .query(query, &[&user_id, &from_ms, &to_ms])
            .await
            .map_err(|e| BackendError::QueryFailed(e.to_string()))?;
        let elapsed = started.elapsed().as_millis();
        if elapsed > SLOW_QUERY_MS {
            warn!(elapsed_ms = elapsed as u64, "Query for loading user addresses took unexpectedly long");
        }

        let mut addresses = Vec::with_capacity(rows.len());
        for row in rows {
            let address: Option<String> = row
                .try_get("ipaddress")
                .map_err(|e| BackendError::QueryFailed(e.to_string()))?;
            match address {
                Some(address) => addresses.push(address),
                None => warn!("Null user address will be ignored"),
            }
        }
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(
        user_id: &str,
        length: Option<i64>,
        created_at: Option<i64>,
        channel_type: Option<&str>,
        email: Option<&str>,
    ) -> RawChatMessage {
        RawChatMessage {
            user_id: user_id.to_string(),
            length,
            created_at,
            channel_type: channel_type.map(ToString::to_string),
            email: email.map(ToString::to_string),
        }
    }

    #[test]
    fn test_validation_drops_rows_with_null_required_fields() {
        let valid = validate_messages(vec![
            raw("u1", Some(10), Some(100), Some("O"), Some("a@aaa.de")),
            raw("u2", None, Some(100), Some("O"), Some("a@aaa.de")),
            raw("u3", Some(10), None, Some("O"), Some("a@aaa.de")),
            raw("u4", Some(10), Some(100), None, Some("a@aaa.de")),
            raw("u5", Some(10), Some(100), Some("O"), None),
        ]);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].user_id, "u1");
        assert_eq!(valid[0].email_domain, "aaa.de");
    }

    #[test]
    fn test_validation_drops_malformed_email() {
        let valid = validate_messages(vec![
            raw("u1", Some(10), Some(100), Some("O"), Some("a@b@aaa.de")),
            raw("u2", Some(10), Some(100), Some("O"), Some("plain-string")),
        ]);
        assert!(valid.is_empty());
    }

    #[test]
    fn test_validation_maps_empty_domain_to_placeholder() {
        let valid = validate_messages(vec![raw("u1", Some(10), Some(100), Some("O"), Some("a@"))]);
        assert_eq!(valid[0].email_domain, enrich::UNKNOWN_DOMAIN);
    }

    #[test]
    fn test_validation_clamps_negative_values() {
        let valid = validate_messages(vec![raw(
            "u1",
            Some(-20),
            Some(-5),
            Some("P"),
            Some("a@aaa.de"),
        )]);
        assert_eq!(valid[0].length, 0);
        assert_eq!(valid[0].created_at, 0);
    }
}
