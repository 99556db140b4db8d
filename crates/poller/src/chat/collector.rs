//! Chat enrichment: message rows -> organization-tagged dashboard events

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use pulsefeed_refdata::{OrganizationDirectory, OrganizationsObserver};

use crate::chat::database::ChatQueries;
use crate::enrich;
use crate::traits::{encode_payload, BackendConnection, Collector, Harvest};

#[derive(Debug, Default, Serialize)]
struct ChatPayload {
    #[serde(rename = "Messages")]
    messages: Vec<ChatEvent>,
}

#[derive(Debug, Serialize)]
struct ChatEvent {
    #[serde(rename = "OrganizationName")]
    organization_name: String,
    #[serde(rename = "CreatedAt")]
    created_at: i64,
    #[serde(rename = "MessageLength")]
    message_length: i64,
    #[serde(rename = "ChannelType")]
    channel_type: String,
}

pub struct ChatCollector {
    database: Arc<dyn ChatQueries>,
    organizations: ArcSwap<OrganizationDirectory>,
    query_interval_ms: i64,
    /// Address lookups cached per user for the duration of one tick only.
    address_cache: Mutex<HashMap<String, Vec<String>>>,
}

impl ChatCollector {
    pub fn new(
        database: Arc<dyn ChatQueries>,
        organizations: Arc<OrganizationDirectory>,
        query_interval_ms: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            database,
            organizations: ArcSwap::new(organizations),
            query_interval_ms,
            address_cache: Mutex::new(HashMap::new()),
        })
    }

    async fn addresses_for(
        &self,
        user_id: &str,
        from_ms: i64,
        to_ms: i64,
        degraded: &mut bool,
    ) -> Vec<String> {
        let mut cache = self.address_cache.lock().await;
        if let Some(addresses) = cache.get(user_id) {
            return addresses.clone();
        }
        let addresses = match self.database.load_user_addresses(user_id, from_ms, to_ms).await {
            Ok(addresses) => addresses,
            Err(e) => {
                error!(error = %e, "Could not load user addresses");
                *degraded = true;
                Vec::new()
            }
        };
        cache.insert(user_id.to_string(), addresses.clone());
        addresses
    }
}

#[async_trait]
impl Collector for ChatCollector {
    fn service(&self) -> &'static str {
        "chat"
    }

    fn backend(&self) -> Arc<dyn BackendConnection> {
        self.database.connection()
    }

    async fn collect(&self, now: DateTime<Utc>) -> Harvest {
        let to_ms = now.timestamp_millis();
        let from_ms = to_ms - self.query_interval_ms;
        let mut degraded = false;

        let messages = match self.database.load_messages(from_ms, to_ms).await {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, "Could not load chat messages");
                degraded = true;
                Vec::new()
            }
        };

        let organizations = self.organizations.load_full();
        let mut payload = ChatPayload::default();
        for message in messages {
            let organization_name = if organizations
                .duplicate_domains
                .contains(&message.email_domain)
            {
                // ambiguous domain: the session addresses decide
                let addresses = self
                    .addresses_for(&message.user_id, from_ms, to_ms, &mut degraded)
                    .await;
                enrich::resolve_duplicate_display_name(
                    &organizations,
                    &message.email_domain,
                    &addresses,
                )
            } else if let Some(name) = enrich::display_name(&organizations, &message.email_domain)
            {
                name
            } else {
                debug!(
                    domain = %message.email_domain,
                    "Domain does not exist in organization directory"
                );
                continue;
            };

            payload.messages.push(ChatEvent {
                organization_name,
                created_at: message.created_at,
                message_length: message.length,
                channel_type: message.channel_type,
            });
        }

        self.address_cache.lock().await.clear();

        Harvest {
            payload: encode_payload("chat", &payload),
            from_timepoint_ms: from_ms,
            degraded,
        }
    }
}

impl OrganizationsObserver for ChatCollector {
    fn organizations_updated(&self, directory: Arc<OrganizationDirectory>) {
        info!(service = "chat", "Swapping in fresh organization directory");
        self.organizations.store(directory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::database::ChatMessage;
    use crate::error::BackendError;
    use pulsefeed_refdata::{IpRangeGroup, Organization};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockChatDb {
        messages: Vec<ChatMessage>,
        addresses: Vec<String>,
        address_queries: AtomicUsize,
        backend: Arc<NullBackend>,
    }

    struct NullBackend;

    #[async_trait]
    impl BackendConnection for NullBackend {
        async fn connect(&self) -> Result<(), BackendError> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn is_connecting(&self) -> bool {
            false
        }
        fn set_connecting(&self, _connecting: bool) {}
        async fn ping(&self) -> Result<(), BackendError> {
            Ok(())
        }
        async fn close(&self) {}
    }

    #[async_trait]
    impl ChatQueries for MockChatDb {
        fn connection(&self) -> Arc<dyn BackendConnection> {
            self.backend.clone()
        }
        async fn load_messages(
            &self,
            _from_ms: i64,
            _to_ms: i64,
        ) -> Result<Vec<ChatMessage>, BackendError> {
            Ok(self.messages.clone())
        }
        async fn load_user_addresses(
            &self,
            _user_id: &str,
            _from_ms: i64,
            _to_ms: i64,
        ) -> Result<Vec<String>, BackendError> {
            self.address_queries.fetch_add(1, Ordering::SeqCst);
            Ok(self.addresses.clone())
        }
    }

    fn message(user_id: &str, domain: &str) -> ChatMessage {
        ChatMessage {
            user_id: user_id.to_string(),
            length: 70,
            created_at: 1700000000000,
            channel_type: "O".to_string(),
            email_domain: domain.to_string(),
        }
    }

    fn directory() -> Arc<OrganizationDirectory> {
        let mut organizations = HashMap::new();
        organizations.insert(
            "plain.de".to_string(),
            Organization {
                display_name: "Plain Org".to_string(),
                ip_range_groups: vec![],
            },
        );
        organizations.insert(
            "dup.de".to_string(),
            Organization {
                display_name: "unused".to_string(),
                ip_range_groups: vec![
                    IpRangeGroup {
                        ip_ranges: ["11.11.11.0/24".to_string()].into_iter().collect(),
                        display_name: "Range Org A".to_string(),
                    },
                    IpRangeGroup {
                        ip_ranges: ["22.22.22.0/24".to_string()].into_iter().collect(),
                        display_name: "Range Org B".to_string(),
                    },
                ],
            },
        );
        Arc::new(OrganizationDirectory {
            organizations,
            duplicate_domains: ["dup.de".to_string()].into_iter().collect(),
        })
    }

    fn decode(harvest: &Harvest) -> serde_json::Value {
        serde_json::from_str(&harvest.payload).unwrap()
    }

    #[tokio::test]
    async fn test_plain_domain_uses_directory_name() {
        let database = Arc::new(MockChatDb {
            messages: vec![message("u1", "plain.de")],
            addresses: vec![],
            address_queries: AtomicUsize::new(0),
            backend: Arc::new(NullBackend),
        });
        let collector = ChatCollector::new(database.clone(), directory(), 5000);

        let harvest = collector.collect(Utc::now()).await;
        let payload = decode(&harvest);

        assert_eq!(payload["Messages"][0]["OrganizationName"], "Plain Org");
        assert_eq!(database.address_queries.load(Ordering::SeqCst), 0);
        assert!(!harvest.degraded);
    }

    #[tokio::test]
    async fn test_duplicate_domain_resolved_by_address_range() {
        let database = Arc::new(MockChatDb {
            messages: vec![message("u1", "dup.de")],
            addresses: vec!["22.22.22.5".to_string()],
            address_queries: AtomicUsize::new(0),
            backend: Arc::new(NullBackend),
        });
        let collector = ChatCollector::new(database.clone(), directory(), 5000);

        let harvest = collector.collect(Utc::now()).await;
        let payload = decode(&harvest);

        assert_eq!(payload["Messages"][0]["OrganizationName"], "Range Org B");
        assert_eq!(database.address_queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_domain_is_dropped() {
        let database = Arc::new(MockChatDb {
            messages: vec![message("u1", "stranger.de"), message("u2", "plain.de")],
            addresses: vec![],
            address_queries: AtomicUsize::new(0),
            backend: Arc::new(NullBackend),
        });
        let collector = ChatCollector::new(database, directory(), 5000);

        let harvest = collector.collect(Utc::now()).await;
        let payload = decode(&harvest);

        assert_eq!(payload["Messages"].as_array().unwrap().len(), 1);
        assert_eq!(payload["Messages"][0]["OrganizationName"], "Plain Org");
    }

    #[tokio::test]
    async fn test_address_cache_spans_one_tick_only() {
        let database = Arc::new(MockChatDb {
            messages: vec![message("u1", "dup.de"), message("u1", "dup.de")],
            addresses: vec!["11.11.11.5".to_string()],
            address_queries: AtomicUsize::new(0),
            backend: Arc::new(NullBackend),
        });
        let collector = ChatCollector::new(database.clone(), directory(), 5000);

        // two messages from the same user: one lookup
        collector.collect(Utc::now()).await;
        assert_eq!(database.address_queries.load(Ordering::SeqCst), 1);
        assert!(collector.address_cache.lock().await.is_empty());

        // the next tick starts cold again
        collector.collect(Utc::now()).await;
        assert_eq!(database.address_queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_directory_swap_changes_resolution() {
        let database = Arc::new(MockChatDb {
            messages: vec![message("u1", "plain.de")],
            addresses: vec![],
            address_queries: AtomicUsize::new(0),
            backend: Arc::new(NullBackend),
        });
        let collector = ChatCollector::new(database, directory(), 5000);

        let mut organizations = HashMap::new();
        organizations.insert(
            "plain.de".to_string(),
            Organization {
                display_name: "Renamed Org".to_string(),
                ip_range_groups: vec![],
            },
        );
        collector.organizations_updated(Arc::new(OrganizationDirectory {
            organizations,
            duplicate_domains: Default::default(),
        }));

        let harvest = collector.collect(Utc::now()).await;
        let payload = decode(&harvest);
        assert_eq!(payload["Messages"][0]["OrganizationName"], "Renamed Org");
    }
}
