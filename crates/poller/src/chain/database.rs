//! Block-explorer backend adapter
//!
//! Miner hashes arrive as raw bytes and are hex-encoded for the dashboard;
//! the encoded form also keys the validator geo lookup. Gas figures can be
//! null or negative in the explorer schema and are clamped.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use pulsefeed_config::DatabaseConfig;

use crate::enrich::{clamp_non_negative_f64, clamp_non_negative_i32};
use crate::error::BackendError;
use crate::postgres::{PgBackend, SLOW_QUERY_MS};
use crate::traits::BackendConnection;

/// Wei per ether, for turning gas price x gas used into a fee.
const WEI_PER_ETHER: f64 = 1_000_000_000_000_000_000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct BlockRecord {
    pub byte_size: i32,
    /// Unix milliseconds.
    pub inserted_at: i64,
    pub miner: String,
    /// Lowercase hex of the miner address hash.
    pub miner_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub transaction_fee: f64,
    /// Unix milliseconds.
    pub updated_at: i64,
    pub block_miner: String,
    pub block_miner_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContributorRecord {
    /// Unix milliseconds.
    pub inserted_at: i64,
    pub name: String,
}

#[derive(Debug)]
pub(crate) struct RawBlock {
    pub byte_size: Option<i32>,
    pub inserted_at: NaiveDateTime,
    pub miner: Option<String>,
    pub miner_hash: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct RawTransaction {
    pub gas_price: Option<f64>,
    pub gas_used: Option<f64>,
    pub updated_at: NaiveDateTime,
    pub block_miner: Option<String>,
    pub block_miner_hash: Option<Vec<u8>>,
}

#[derive(Debug)]
pub(crate) struct RawContributor {
    pub inserted_at: NaiveDateTime,
    pub name: String,
}

pub(crate) fn validate_blocks(raw: Vec<RawBlock>) -> Vec<BlockRecord> {
    raw.into_iter()
        .map(|block| BlockRecord {
            byte_size: clamp_non_negative_i32(block.byte_size.unwrap_or(0), "byte_size"),
            inserted_at: block.inserted_at.and_utc().timestamp_millis(),
            miner: block.miner.unwrap_or_default(),
            miner_hash: hex::encode(block.miner_hash),
        })
        .collect()
}

pub(crate) fn validate_transactions(raw: Vec<RawTransaction>) -> Vec<TransactionRecord> {
    raw.into_iter()
        .map(|transaction| {
            let gas_price =
                clamp_non_negative_f64(transaction.gas_price.unwrap_or(0.0), "gas_price");
            let gas_used =
                clamp_non_negative_f64(transaction.gas_used.unwrap_or(0.0), "gas_used");
            TransactionRecord {
                transaction_fee: (gas_price / WEI_PER_ETHER) * gas_used,
                updated_at: transaction.updated_at.and_utc().timestamp_millis(),
                block_miner: transaction.block_miner.unwrap_or_default(),
                block_miner_hash: hex::encode(transaction.block_miner_hash.unwrap_or_default()),
            }
        })
        .collect()
}

pub(crate) fn validate_contributors(raw: Vec<RawContributor>) -> Vec<ContributorRecord> {
    raw.into_iter()
        .map(|contributor| ContributorRecord {
            inserted_at: contributor.inserted_at.and_utc().timestamp_millis(),
            name: contributor.name,
        })
        .collect()
}

/// Query surface of the block-explorer backend, mockable for tests.
#[async_trait]
pub trait ChainQueries: Send + Sync {
    fn connection(&self) -> Arc<dyn BackendConnection>;

    async fn load_blocks(&self, from: &str, to: &str) -> Result<Vec<BlockRecord>, BackendError>;

    async fn load_confirmed_transactions(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Vec<TransactionRecord>, BackendError>;

    async fn load_licensed_contributors(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Vec<ContributorRecord>, BackendError>;
}

pub struct ChainDatabase {
    backend: Arc<PgBackend>,
}

impl ChainDatabase {
    pub fn new(config: DatabaseConfig) -> Arc<Self> {
        Arc::new(Self {
            backend: Arc::new(PgBackend::new("chain", config)),
        })
    }
}

#[async_trait]
impl ChainQueries for ChainDatabase {
    fn connection(&self) -> Arc<dyn BackendConnection> {
        self.backend.clone()
    }

    async fn load_blocks(&self, from: &str, to: &str) -> Result<Vec<BlockRecord>, BackendError> {
        let guard = self.backend.client().await;
        let Some(client) = guard.as_ref() else {
            warn!("Chain backend not connected");
            return Ok(Vec::new());
        };

        let query = "SELECT b.size, b.inserted_at, b.miner_hash, \
                     (SELECT n.name FROM address_names n WHERE n.address_hash = b.miner_hash) AS name \
                     FROM blocks b \
                     WHERE b.inserted_at BETWEEN $1::timestamp AND $2::timestamp \
                     ORDER BY b.inserted_at ASC";

        let started = Instant::now();
        let rows = client
            .query(query, &[&from, &to])
            .await
            .map_err(|e| BackendError::QueryFailed(e.to_string()))?;
        let elapsed = started.elapsed().as_millis();
        if elapsed > SLOW_QUERY_MS {
            warn!(elapsed_ms = elapsed as u64, "Query for loading blocks took unexpectedly long");
        }

        let mut raw = Vec::with_capacity(rows.len());
        for row in rows {
            raw.push(RawBlock {
                byte_size: row
                    .try_get("size")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                inserted_at: row
                    .try_get("inserted_at")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                miner_hash: row
                    .try_get("miner_hash")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                miner: row
                    .try_get("name")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
            });
        }
        Ok(validate_blocks(raw))
    }

    async fn load_confirmed_transactions(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Vec<TransactionRecord>, BackendError> {
        let guard = self.backend.client().await;
        let Some(client) = guard.as_ref() else {
            warn!("Chain backend not connected");
            return Ok(Vec::new());
        };

        let query = "SELECT t.gas_price::float8 AS gas_price, t.gas_used::float8 AS gas_used, t.updated_at, \
                     (SELECT n.name FROM address_names n WHERE n.address_hash = b.miner_hash) AS name, \
                     b.miner_hash \
                     FROM transactions t JOIN blocks b ON t.block_hash = b.hash \
                     WHERE t.status = 1 AND t.updated_at BETWEEN $1::timestamp AND $2::timestamp \
                     ORDER BY t.updated_at ASC";

        let started = Instant::now();
        let rows = client
            .query(query, &[&from, &to])
            .await
            .map_err(|e| BackendError::QueryFailed(e.to_string()))?;
        let elapsed = started.elapsed().as_millis();
        if elapsed > SLOW_QUERY_MS {
            warn!(elapsed_ms = elapsed as u64, "Query for loading confirmed transactions took unexpectedly long");
        }

        let mut raw = Vec::with_capacity(rows.len());
        for row in rows {
            raw.push(RawTransaction {
                gas_price: row
                    .try_get("gas_price")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                gas_used: row
                    .try_get("gas_used")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                updated_at: row
                    .try_get("updated_at")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                block_miner: row
                    .try_get("name")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                block_miner_hash: row
                    .try_get("miner_hash")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
            });
        }
        Ok(validate_transactions(raw))
    }

    async fn load_licensed_contributors(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Vec<ContributorRecord>, BackendError> {
        let guard = self.backend.client().await;
        let Some(client) = guard.as_ref() else {
            warn!("Chain backend not connected");
            return Ok(Vec::new());
        };

        let query = "SELECT n.name, n.inserted_at FROM address_names n \
                     WHERE n.\"primary\" IS TRUE \
                     AND n.inserted_at BETWEEN $1::timestamp AND $2::timestamp \
                     ORDER BY n.inserted_at ASC";

        let started = Instant::now();
        let rows = client
            .query(query, &[&from, &to])
            .await
            .map_err(|e| BackendError::QueryFailed(e.to_string()))?;
        let elapsed = started.elapsed().as_millis();
        if elapsed > SLOW_QUERY_MS {
            warn!(elapsed_ms = elapsed as u64, "Query for loading licensed contributors took unexpectedly long");
        }

        let mut raw = Vec::with_capacity(rows.len());
        for row in rows {
            raw.push(RawContributor {
                name: row
                    .try_get("name")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
                inserted_at: row
                    .try_get("inserted_at")
                    .map_err(|e| BackendError::QueryFailed(e.to_string()))?,
            });
        }
        Ok(validate_contributors(raw))
    }
}
