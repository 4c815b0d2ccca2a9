use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use message_bus::{DEFAULT_EVENT_TOPIC, Headers, MessagePublisher};
use tokio::sync::watch;

use crate::{OutboxRecord, OutboxStore, Result};

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub topic: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// How long published records are kept before purging.
    pub retention: Duration,
    pub purge_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_EVENT_TOPIC.to_string(),
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            retention: Duration::from_secs(72 * 60 * 60),
            purge_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub published: usize,
    pub failed: usize,
}

impl RelayReport {
    pub fn is_idle(&self) -> bool {
        self.published == 0 && self.failed == 0
    }
}

/// Drains pending outbox records onto the bus.
///
/// Each record is sent keyed by its aggregate id and settled once the broker
/// answered: acknowledged records become PUBLISHED, rejected ones FAILED.
/// Failed records are not retried by the relay.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn MessagePublisher>,
    config: RelayConfig,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn MessagePublisher>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Publishes one batch.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) -> Result<RelayReport> {
        let started = Instant::now();
        let batch = self.store.fetch_pending(self.config.batch_size).await?;
        let mut report = RelayReport::default();

        for record in batch {
            match self.send(&record).await {
                Ok(()) => {
                    if self.store.mark_published(record.event_id, Utc::now()).await? {
                        report.published += 1;
                        metrics::counter!("outbox_published_total", "event_type" => record.event_type.to_string())
                            .increment(1);
                    }
                }
                Err(reason) => {
                    tracing::error!(
                        event_id = %record.event_id,
                        event_type = %record.event_type,
                        aggregate_id = %record.aggregate_id,
                        reason = %reason,
                        "Outbox publish failed"
                    );
                    if self.store.mark_failed(record.event_id, &reason).await? {
                        report.failed += 1;
                        metrics::counter!("outbox_failed_total", "event_type" => record.event_type.to_string())
                            .increment(1);
                    }
                }
            }
        }

        metrics::histogram!("outbox_relay_tick_seconds").record(started.elapsed().as_secs_f64());
        if !report.is_idle() {
            tracing::debug!(
                published = report.published,
                failed = report.failed,
                "Outbox tick"
            );
        }
        Ok(report)
    }

    async fn send(&self, record: &OutboxRecord) -> std::result::Result<(), String> {
        let envelope = record.to_envelope();
        let bytes = envelope.to_bytes().map_err(|e| e.to_string())?;

        let mut headers = Headers::new();
        headers.insert("x-event-type".to_string(), record.event_type.to_string());
        if let Some(trace_id) = &record.trace_id {
            headers.insert("x-trace-id".to_string(), trace_id.clone());
        }

        self.publisher
            .publish(&self.config.topic, &record.aggregate_id, &bytes, &headers)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    /// Deletes published records past the retention window.
    pub async fn purge(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(3));
        let purged = self.store.purge_published(Utc::now() - retention).await?;
        if purged > 0 {
            tracing::info!(purged, "Purged published outbox records");
        }
        Ok(purged)
    }

    /// Ticks every poll interval and purges on the slower purge cadence
    /// until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            topic = %self.config.topic,
            batch_size = self.config.batch_size,
            "Outbox relay started"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_purge = Instant::now();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Outbox tick failed");
                    }
                    if last_purge.elapsed() >= self.config.purge_interval {
                        if let Err(e) = self.purge().await {
                            tracing::error!(error = %e, "Outbox purge failed");
                        }
                        last_purge = Instant::now();
                    }
                }
            }
        }
        tracing::info!("Outbox relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use common::payload::{OrderConfirmed, UserDeleted};
    use common::{EventEnvelope, EventPayload, OrderId, ServiceTag, UserId};
    use message_bus::InMemoryMessageBus;

    use super::*;
    use crate::{InMemoryOutboxStore, NewOutboxRecord, OutboxStatus};

    fn confirmed(order_id: OrderId) -> NewOutboxRecord {
        let payload = EventPayload::OrderConfirmed(OrderConfirmed {
            order_id,
            user_id: UserId::new(),
        });
        NewOutboxRecord::from_payload(ServiceTag::Order, &payload, Some("t-1".to_string()))
            .unwrap()
    }

    fn relay(store: &InMemoryOutboxStore, bus: &InMemoryMessageBus) -> OutboxRelay {
        OutboxRelay::new(
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            RelayConfig {
                batch_size: 2,
                ..RelayConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_tick_publishes_keyed_by_aggregate() {
        let store = InMemoryOutboxStore::new();
        let bus = InMemoryMessageBus::new(4);
        let order_id = OrderId::new();
        let record = confirmed(order_id);
        store.insert(record.clone()).await.unwrap();

        let report = relay(&store, &bus).tick().await.unwrap();
        assert_eq!(report, RelayReport { published: 1, failed: 0 });

        let sent = bus.messages(DEFAULT_EVENT_TOPIC).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key, order_id.to_string());
        assert_eq!(sent[0].headers["x-trace-id"], "t-1");
        let envelope = EventEnvelope::from_bytes(&sent[0].payload).unwrap();
        assert_eq!(envelope.event_id, record.event_id);

        let stored = store.get(record.event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Published);
        assert!(stored.published_at.is_some());
    }

    #[tokio::test]
    async fn test_tick_respects_batch_size_and_never_resends() {
        let store = InMemoryOutboxStore::new();
        let bus = InMemoryMessageBus::new(1);
        for _ in 0..3 {
            store.insert(confirmed(OrderId::new())).await.unwrap();
        }
        let relay = relay(&store, &bus);

        assert_eq!(relay.tick().await.unwrap().published, 2);
        assert_eq!(relay.tick().await.unwrap().published, 1);
        assert!(relay.tick().await.unwrap().is_idle());
        assert_eq!(bus.messages(DEFAULT_EVENT_TOPIC).await.len(), 3);
    }

    #[tokio::test]
    async fn test_send_failure_marks_failed_without_retry() {
        let store = InMemoryOutboxStore::new();
        let bus = InMemoryMessageBus::new(1);
        let record = confirmed(OrderId::new());
        store.insert(record.clone()).await.unwrap();
        bus.fail_next_publishes(1).await;
        let relay = relay(&store, &bus);

        assert_eq!(relay.tick().await.unwrap().failed, 1);
        assert!(relay.tick().await.unwrap().is_idle());

        let stored = store.get(record.event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert!(stored.failure_reason.unwrap().contains("injected"));
        assert!(bus.messages(DEFAULT_EVENT_TOPIC).await.is_empty());
    }

    #[tokio::test]
    async fn test_per_aggregate_order_is_preserved() {
        let store = InMemoryOutboxStore::new();
        let bus = InMemoryMessageBus::new(8);
        let order_id = OrderId::new();
        let first = confirmed(order_id);
        let user_event = NewOutboxRecord::from_payload(
            ServiceTag::Cart,
            &EventPayload::UserDeleted(UserDeleted {
                user_id: UserId::new(),
            }),
            None,
        )
        .unwrap();
        let second = confirmed(order_id);
        store
            .append(vec![first.clone(), user_event, second.clone()])
            .await;

        let relay = relay(&store, &bus);
        relay.tick().await.unwrap();
        relay.tick().await.unwrap();

        let partition = bus.partition_for(&order_id.to_string());
        let ids: Vec<_> = bus
            .messages(DEFAULT_EVENT_TOPIC)
            .await
            .into_iter()
            .filter(|m| m.partition == partition && m.key == order_id.to_string())
            .map(|m| EventEnvelope::from_bytes(&m.payload).unwrap().event_id)
            .collect();
        assert_eq!(ids, vec![first.event_id, second.event_id]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = InMemoryOutboxStore::new();
        let bus = InMemoryMessageBus::new(1);
        store.insert(confirmed(OrderId::new())).await.unwrap();
        let relay = Arc::new(OutboxRelay::new(
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            RelayConfig {
                poll_interval: Duration::from_millis(10),
                ..RelayConfig::default()
            },
        ));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn({
            let relay = relay.clone();
            async move { relay.run(rx).await }
        });

        for _ in 0..100 {
            if store.count_by_status(OutboxStatus::Pending).await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(bus.messages(DEFAULT_EVENT_TOPIC).await.len(), 1);
    }
}
