//! Chain enrichment: validator coordinates keyed by miner address hash

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use pulsefeed_refdata::{GeoDirectory, GeoNamespace, GeoObserver, Location};

use crate::chain::database::ChainQueries;
use crate::traits::{encode_payload, BackendConnection, Collector, Harvest};

const WINDOW_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Default, Serialize)]
struct ChainPayload {
    #[serde(rename = "Blocks")]
    blocks: Vec<BlockEvent>,
    #[serde(rename = "ConfirmedTransactions")]
    confirmed_transactions: Vec<TransactionEvent>,
    #[serde(rename = "LicensedContributors")]
    licensed_contributors: Vec<ContributorEvent>,
}

#[derive(Debug, Serialize)]
struct BlockEvent {
    #[serde(rename = "ByteSize")]
    byte_size: i32,
    #[serde(rename = "InsertedAt")]
    inserted_at: i64,
    #[serde(rename = "Miner")]
    miner: String,
    #[serde(rename = "MinerHash")]
    miner_hash: String,
    #[serde(rename = "Location")]
    location: Location,
}

#[derive(Debug, Serialize)]
struct TransactionEvent {
    #[serde(rename = "TransactionFee")]
    transaction_fee: f64,
    #[serde(rename = "UpdatedAt")]
    updated_at: i64,
    #[serde(rename = "BlockMiner")]
    block_miner: String,
    #[serde(rename = "BlockMinerHash")]
    block_miner_hash: String,
    #[serde(rename = "Location")]
    location: Location,
}

#[derive(Debug, Serialize)]
struct ContributorEvent {
    #[serde(rename = "InsertedAt")]
    inserted_at: i64,
    #[serde(rename = "Name")]
    name: String,
}

pub struct ChainCollector {
    database: Arc<dyn ChainQueries>,
    geo: ArcSwap<GeoDirectory>,
    query_interval_ms: i64,
}

impl ChainCollector {
    pub fn new(
        database: Arc<dyn ChainQueries>,
        geo: Arc<GeoDirectory>,
        query_interval_ms: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            database,
            geo: ArcSwap::new(geo),
            query_interval_ms,
        })
    }
}

#[async_trait]
impl Collector for ChainCollector {
    fn service(&self) -> &'static str {
        "chain"
    }

    fn backend(&self) -> Arc<dyn BackendConnection> {
        self.database.connection()
    }

    async fn collect(&self, now: DateTime<Utc>) -> Harvest {
        let from = now - Duration::milliseconds(self.query_interval_ms);
        let from_window = from.format(WINDOW_FORMAT).to_string();
        let to_window = now.format(WINDOW_FORMAT).to_string();
        let mut degraded = false;

        let blocks = match self.database.load_blocks(&from_window, &to_window).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Could not load blocks");
                degraded = true;
                Vec::new()
            }
        };
        let transactions = match self
            .database
            .load_confirmed_transactions(&from_window, &to_window)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Could not load confirmed transactions");
                degraded = true;
                Vec::new()
            }
        };
        let contributors = match self
            .database
            .load_licensed_contributors(&from_window, &to_window)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Could not load licensed contributors");
                degraded = true;
                Vec::new()
            }
        };

        let geo = self.geo.load_full();
        let mut payload = ChainPayload::default();

        for block in blocks {
            payload.blocks.push(BlockEvent {
                byte_size: block.byte_size,
                inserted_at: block.inserted_at,
                miner: block.miner,
                location: geo.locate(&block.miner_hash),
                miner_hash: block.miner_hash,
            });
        }
        for transaction in transactions {
            payload.confirmed_transactions.push(TransactionEvent {
                transaction_fee: transaction.transaction_fee,
                updated_at: transaction.updated_at,
                block_miner: transaction.block_miner,
                location: geo.locate(&transaction.block_miner_hash),
                block_miner_hash: transaction.block_miner_hash,
            });
        }
        for contributor in contributors {
            payload.licensed_contributors.push(ContributorEvent {
                inserted_at: contributor.inserted_at,
                name: contributor.name,
            });
        }

        Harvest {
            payload: encode_payload("chain", &payload),
            from_timepoint_ms: from.timestamp_millis(),
            degraded,
        }
    }
}

impl GeoObserver for ChainCollector {
    fn geo_updated(&self, namespace: GeoNamespace, directory: Arc<GeoDirectory>) {
        if namespace == GeoNamespace::Validators {
            info!(service = "chain", "Swapping in fresh geo directory");
            self.geo.store(directory);
        }
    }
}
