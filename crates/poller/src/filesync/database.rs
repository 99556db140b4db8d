//! File-sync backend adapter
//!
//! This backend stores timestamps as local datetime values with seconds
//! precision, so the activity windows arrive as "YYYY-MM-DD HH:MM:SS"
//! strings; only the activated-users query works on epoch seconds. The
//! inviter subqueries surface a null inviter domain for users activated
//! directly by an administrator.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use pulsefeed_config::DatabaseConfig;

use crate::enrich::clamp_non_negative_i64;
use crate::error::BackendError;
use crate::postgres::{PgBackend, SLOW_QUERY_MS};
use crate::traits::BackendConnection;

#[derive(Debug, Clone, PartialEq)]
pub struct FileChangeRecord {
    pub operation_size: i64,
    pub operation_type: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub invited_from_domain: String,
    pub user_domain: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LibraryCreationRecord {
    /// Unix seconds.
    pub timestamp: i64,
    pub invited_from_domain: String,
    pub user_domain: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivatedUserRecord {
    /// Unix seconds.
    pub timestamp: i64,
    pub invited_from_domain: String,
    pub user_domain: String,
}

#[derive(Debug)]
pub(crate) struct RawFileChange {
    pub size: Option<i64>,
    pub operation_type: String,
    pub timestamp: NaiveDateTime,
    pub invited_from_domain: Option<String>,
    pub user_domain: String,
}

#[derive(Debug)]
pub(crate) struct RawLibraryCreation {
    pub timestamp: NaiveDateTime,
    pub invited_from_domain: Option<String>,
    pub user_domain: String,
}

#[derive(Debug)]
pub(crate) struct RawActivatedUser {
    pub timestamp: i64,
    pub invited_from_domain: Option<String>,
    pub user_domain: String,
}

pub(crate) fn validate_file_changes(raw: Vec<RawFileChange>) -> Vec<FileChangeRecord> {
    raw.into_iter()
        .map(|change| FileChangeRecord {
            operation_size: clamp_non_negative_i64(
                change.size.unwrap_or(0),
                "operation_size",
            ),
            operation_type: change.operation_type,
            timestamp: change.timestamp.and_utc().timestamp(),
            invited_from_domain: change.invited_from_domain.unwrap_or_default(),
            user_domain: change.user_domain,
        })
        .collect()
}

pub(crate) fn validate_library_creations(
    raw: Vec<RawLibraryCreation>,
) -> Vec<LibraryCreationRecord> {
    raw.into_iter()
        .map(|creation| LibraryCreationRecord {
            timestamp: creation.timestamp.and_utc().timestamp(),
            invited_from_domain: creation.invited_from_domain.unwrap_or_default(),
            user_domain: creation.user_domain,
        })
        .collect()
}

pub(crate) fn validate_activated_users(raw: Vec<RawActivatedUser>) -> Vec<ActivatedUserRecord> {
    raw.into_iter()
        .map(|user| ActivatedUserRecord {
            timestamp: clamp_non_negative_i64(user.timestamp, "activation_timestamp"),
            invited_from_domain: user.invited_from_domain.unwrap_or_default(),
            user_domain: user.user_domain,
        })
        .collect()
}

/// Query surface of the file-sync backend, mockable for tests.
#[async_trait]
pub trait FileSyncQueries: Send + Sync {
    fn connection(&self) -> Arc<dyn BackendConnection>;

    async fn load_file_changes(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Vec<FileChangeRecord>, BackendError>;

    async fn load_library_creations(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Vec<LibraryCreationRecord>, BackendError>;

    async fn load_activated_users(
        &self,
        from_s: i64,
        to_s: i64,
    ) -> Result<Vec<ActivatedUserRecord>, BackendError>;
}

pub struct FileSyncDatabase {
    backend: Arc<PgBackend>,
}

impl FileSyncDatabase {
    pub fn new(config: DatabaseConfig) -> Arc<Self> {
        Arc::new(Self {
            backend: Arc::new(PgBackend::new("filesync", config)),
        })
    }
}

#[async_trait]
impl FileSyncQueries for FileSyncDatabase {
    fn connection(&self) -> Arc<dyn BackendConnection> {
        self.backend.clone()
    }

    async fn load_file_changes(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Vec<FileChangeRecord>, BackendError> {
        let guard = self.backend.client().await;
        let Some(client) = guard.as_ref() else {
            warn!("File-sync backend not connected");
            return Ok(Vec::new());
        };

        let query = "SELECT a.timestamp, \
                     (SELECT split_part(i.inviter, '@', 2) FROM invitations i \
                      WHERE i.accepter = a.op_user ORDER BY i.accept_time DESC LIMIT 1) AS invited_from_domain, \
                     split_part(a.op_user, '@', 2) AS domain, \
                     a.op_type, \
                     (a.detail ->> 'size')::bigint AS size \
                     FROM activity a \
                     WHERE a.op_type IN ('create', 'edit') AND a.obj_type = 'file' \
                     AND a.timestamp BETWEEN $1::timestamp AND $2::timestamp \
                     ORDER BY a.timestamp ASC";

        let started = Instant::now();
        let rows = client
            .query(query, &[&from, &to])
            .await
            .map_err(|e| BackendError::QueryFailed(e.to_string()))?;
        let elapsed = started.elapsed().as_millis();
        if elapsed > SLOW_QUERY_MS {
            warn!(elapsed_ms = elapsed as u64, "Query for loading file changes took unexpectedly long");
        }

        let mut raw = Vec::with_capacity(rows.len());
        for row in rows {
            raw.push(RawFileChange {
                timestamp: row
                    .try_get("timestamp")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                invited_from_domain: row
                    .try_get("invited_from_domain")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                user_domain: row
                    .try_get("domain")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                operation_type: row
                    .try_get("op_type")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                size: row
                    .try_get("size")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
            });
        }
        Ok(validate_file_changes(raw))
    }

    async fn load_library_creations(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Vec<LibraryCreationRecord>, BackendError> {
        let guard = self.backend.client().await;
        let Some(client) = guard.as_ref() else {
            warn!("File-sync backend not connected");
            return Ok(Vec::new());
        };

        let query = "SELECT a.timestamp, \
                     (SELECT split_part(i.inviter, '@', 2) FROM invitations i \
                      WHERE i.accepter = a.op_user ORDER BY i.accept_time DESC LIMIT 1) AS invited_from_domain, \
                     split_part(a.op_user, '@', 2) AS domain \
                     FROM activity a \
                     WHERE a.op_type = 'create' AND a.path = '/' \
                     AND a.timestamp BETWEEN $1::timestamp AND $2::timestamp \
                     ORDER BY a.timestamp ASC";

        let started = Instant::now();
        let rows = client
            .query(query, &[&from, &to])
            .await
            .map_err(|e| BackendError::QueryFailed(e.to_string()))?;
        let elapsed = started.elapsed().as_millis();
        if elapsed > SLOW_QUERY_MS {
            warn!(elapsed_ms = elapsed as u64, "Query for loading library creations took unexpectedly long");
        }

        let mut raw = Vec::with_capacity(rows.len());
        for row in rows {
            raw.push(RawLibraryCreation {
                timestamp: row
                    .try_get("timestamp")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                invited_from_domain: row
                    .try_get("invited_from_domain")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                user_domain: row
                    .try_get("domain")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
            });
        }
        Ok(validate_library_creations(raw))
    }

    async fn load_activated_users(
        &self,
        from_s: i64,
        to_s: i64,
    ) -> Result<Vec<ActivatedUserRecord>, BackendError> {
        let guard = self.backend.client().await;
        let Some(client) = guard.as_ref() else {
            warn!("File-sync backend not connected");
            return Ok(Vec::new());
        };

        // account creation time is stored in microseconds
        let query = "SELECT floor(u.ctime / 1000000)::bigint AS timestamp, \
                     (SELECT split_part(i.inviter, '@', 2) FROM invitations i \
                      WHERE i.accepter = u.email ORDER BY i.accept_time DESC LIMIT 1) AS invited_from_domain, \
                     split_part(u.email, '@', 2) AS domain \
                     FROM email_users u \
                     WHERE u.is_active AND floor(u.ctime / 1000000) BETWEEN $1 AND $2 \
                     ORDER BY u.ctime ASC";

        let started = Instant::now();
        let rows = client
            .query(query, &[&from_s, &to_s])
            .await
            .map_err(|e| BackendError::QueryFailed(e.to_string()))?;
        let elapsed = started.elapsed().as_millis();
        if elapsed > SLOW_QUERY_MS {
            warn!(elapsed_ms = elapsed as u64, "Query for loading activated users took unexpectedly long");
        }

        let mut raw = Vec::with_capacity(rows.len());
        for row in rows {
            raw.push(RawActivatedUser {
                timestamp: row
                    .try_get("timestamp")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                invited_from_domain: row
                    .try_get("invited_from_domain")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                user_domain: row
                    .try_get("domain")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
            });
        }
        Ok(validate_activated_users(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn naive(s: &str) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 2)
            .unwrap()
            .and_hms_opt(11, 0, 0)
            .unwrap()
            .checked_add_signed(chrono::Duration::seconds(
                s.parse::<i64>().unwrap_or_default(),
            ))
            .unwrap()
    }

    #[test]
    fn test_file_change_validation_clamps_negative_size() {
        let valid = validate_file_changes(vec![RawFileChange {
            size: Some(-100),
            operation_type: "edit".to_string(),
            timestamp: naive("0"),
            invited_from_domain: None,
            user_domain: "aaa.de".to_string(),
        }]);
        assert_eq!(valid[0].operation_size, 0);
        assert_eq!(valid[0].invited_from_domain, "");
        assert!(valid[0].timestamp > 0);
    }

    #[test]
    fn test_file_change_validation_defaults_missing_size() {
        let valid = validate_file_changes(vec![RawFileChange {
            size: None,
            operation_type: "create".to_string(),
            timestamp: naive("0"),
            invited_from_domain: Some("bbb.de".to_string()),
            user_domain: "aaa.de".to_string(),
        }]);
        assert_eq!(valid[0].operation_size, 0);
        assert_eq!(valid[0].invited_from_domain, "bbb.de");
    }

    #[test]
    fn test_activated_user_validation_clamps_negative_timestamp() {
        let valid = validate_activated_users(vec![RawActivatedUser {
            timestamp: -7,
            invited_from_domain: None,
            user_domain: "aaa.de".to_string(),
        }]);
        assert_eq!(valid[0].timestamp, 0);
    }

    #[test]
    fn test_library_creation_validation_keeps_inviter() {
        let valid = validate_library_creations(vec![RawLibraryCreation {
            timestamp: naive("30"),
            invited_from_domain: Some("ccc.de".to_string()),
            user_domain: "gmail.com".to_string(),
        }]);
        assert_eq!(valid[0].invited_from_domain, "ccc.de");
        assert_eq!(valid[0].user_domain, "gmail.com");
    }
}
