use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// Message headers. Values are UTF-8 strings.
pub type Headers = BTreeMap<String, String>;

/// A record read from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

/// Where the broker stored a published record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub partition: i32,
    pub offset: i64,
}

/// Sends records to the bus.
///
/// `publish` resolves only once the broker acknowledged the record.
/// Records with the same key land on the same partition, in send order.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        headers: &Headers,
    ) -> Result<PublishReceipt>;
}

/// An ordered stream of records with manual acknowledgment.
///
/// A record that is neither acked nor nacked blocks its partition. `nack`
/// rewinds so the record is delivered again.
#[async_trait]
pub trait MessageSource: Send {
    /// Waits up to `timeout` for the next record.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Message>>;

    /// Commits everything up to and including `message`.
    async fn ack(&mut self, message: &Message) -> Result<()>;

    /// Rewinds to `message` so it is redelivered.
    async fn nack(&mut self, message: &Message) -> Result<()>;
}
