use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::bus::{Headers, Message, MessagePublisher, MessageSource, PublishReceipt};
use crate::{BusError, Result};

/// In-process partitioned bus with consumer-group offsets.
///
/// Mirrors the broker semantics the saga relies on: per-key ordering through
/// key hashing, committed offsets per consumer group, redelivery of anything
/// not committed. Publish failures can be injected for tests.
#[derive(Clone)]
pub struct InMemoryMessageBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    partitions: usize,
    state: Mutex<BusState>,
    published: Notify,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, Vec<Vec<Message>>>,
    cursors: HashMap<CursorKey, Cursor>,
    failing_publishes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    group: String,
    topic: String,
    partition: i32,
}

#[derive(Debug, Default, Clone, Copy)]
struct Cursor {
    committed: i64,
    position: i64,
}

impl InMemoryMessageBus {
    /// Creates a bus whose topics have `partitions` partitions each.
    pub fn new(partitions: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                partitions: partitions.max(1),
                state: Mutex::new(BusState::default()),
                published: Notify::new(),
            }),
        }
    }

    pub fn partitions(&self) -> usize {
        self.inner.partitions
    }

    /// Partition a key is routed to.
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.inner.partitions as u64) as i32
    }

    /// One source per partition of `topic`, reading as `group`.
    pub fn sources(&self, topic: &str, group: &str) -> Vec<InMemorySource> {
        (0..self.inner.partitions as i32)
            .map(|partition| self.source(topic, group, partition))
            .collect()
    }

    pub fn source(&self, topic: &str, group: &str, partition: i32) -> InMemorySource {
        InMemorySource {
            bus: self.clone(),
            cursor: CursorKey {
                group: group.to_string(),
                topic: topic.to_string(),
                partition,
            },
        }
    }

    /// Makes the next `count` publishes fail.
    pub async fn fail_next_publishes(&self, count: usize) {
        self.inner.state.lock().await.failing_publishes = count;
    }

    /// Every record on `topic`, partition by partition.
    pub async fn messages(&self, topic: &str) -> Vec<Message> {
        let state = self.inner.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Records on `topic` not yet committed by `group`.
    pub async fn lag(&self, topic: &str, group: &str) -> usize {
        let state = self.inner.state.lock().await;
        let Some(partitions) = state.topics.get(topic) else {
            return 0;
        };
        partitions
            .iter()
            .enumerate()
            .map(|(partition, records)| {
                let committed = state
                    .cursors
                    .get(&CursorKey {
                        group: group.to_string(),
                        topic: topic.to_string(),
                        partition: partition as i32,
                    })
                    .map(|c| c.committed)
                    .unwrap_or(0);
                records.len().saturating_sub(committed as usize)
            })
            .sum()
    }

    /// Moves `group` back to offset zero on every partition of `topic`, as if
    /// its commits were lost. Everything is delivered again.
    pub async fn replay(&self, topic: &str, group: &str) {
        let mut state = self.inner.state.lock().await;
        for (key, cursor) in state.cursors.iter_mut() {
            if key.topic == topic && key.group == group {
                *cursor = Cursor::default();
            }
        }
        drop(state);
        self.inner.published.notify_waiters();
    }
}

#[async_trait]
impl MessagePublisher for InMemoryMessageBus {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        headers: &Headers,
    ) -> Result<PublishReceipt> {
        let partition = self.partition_for(key);
        let mut state = self.inner.state.lock().await;
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(BusError::Publish {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let partitions = self.inner.partitions;
        let records = &mut state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions])[partition as usize];
        let offset = records.len() as i64;
        records.push(Message {
            topic: topic.to_string(),
            partition,
            offset,
            key: key.to_string(),
            payload: payload.to_vec(),
            headers: headers.clone(),
        });
        drop(state);

        self.inner.published.notify_waiters();
        Ok(PublishReceipt { partition, offset })
    }
}

/// Reads one partition of one topic on behalf of a consumer group.
pub struct InMemorySource {
    bus: InMemoryMessageBus,
    cursor: CursorKey,
}

impl InMemorySource {
    pub fn partition(&self) -> i32 {
        self.cursor.partition
    }

    async fn try_next(&self) -> Option<Message> {
        let mut state = self.bus.inner.state.lock().await;
        let position = state
            .cursors
            .get(&self.cursor)
            .copied()
            .unwrap_or_default()
            .position;
        let message = state
            .topics
            .get(&self.cursor.topic)?
            .get(self.cursor.partition as usize)?
            .get(position as usize)?
            .clone();
        state.cursors.entry(self.cursor.clone()).or_default().position = position + 1;
        Some(message)
    }
}

#[async_trait]
impl MessageSource for InMemorySource {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            let published = self.bus.inner.published.notified();
            tokio::pin!(published);
            published.as_mut().enable();

            if let Some(message) = self.try_next().await {
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, published).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, message: &Message) -> Result<()> {
        let mut state = self.bus.inner.state.lock().await;
        let cursor = state.cursors.entry(self.cursor.clone()).or_default();
        cursor.committed = cursor.committed.max(message.offset + 1);
        Ok(())
    }

    async fn nack(&mut self, message: &Message) -> Result<()> {
        let mut state = self.bus.inner.state.lock().await;
        let cursor = state.cursors.entry(self.cursor.clone()).or_default();
        cursor.position = message.offset;
        Ok(())
    }
}
