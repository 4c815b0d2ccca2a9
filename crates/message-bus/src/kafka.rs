//! Kafka-compatible broker client (Kafka, Redpanda).
//!
//! Producer sends wait for the broker ack. Consumers disable auto-commit and
//! commit explicitly after a record was settled.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers as _, Message as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};

use crate::bus::{Headers, Message, MessagePublisher, MessageSource, PublishReceipt};
use crate::{BusError, Result};

/// Producer side.
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(brokers: &str, send_timeout: Duration) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", send_timeout.as_millis().to_string())
            .create()
            .map_err(|e| BusError::Publish {
                topic: "*".to_string(),
                reason: format!("failed to create producer: {e}"),
            })?;

        tracing::info!(brokers = %brokers, "Kafka producer created");
        Ok(Self {
            producer,
            send_timeout,
        })
    }
}

#[async_trait]
impl MessagePublisher for KafkaPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        headers: &Headers,
    ) -> Result<PublishReceipt> {
        let mut kafka_headers = OwnedHeaders::new();
        for (name, value) in headers {
            kafka_headers = kafka_headers.insert(Header {
                key: name.as_str(),
                value: Some(value.as_bytes()),
            });
        }

        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(kafka_headers);

        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok((partition, offset)) => Ok(PublishReceipt { partition, offset }),
            Err((e, _)) => Err(BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Consumer side. One instance reads every partition assigned to it, each
/// in order.
pub struct KafkaSource {
    consumer: StreamConsumer,
}

impl KafkaSource {
    pub fn subscribe(brokers: &str, group: &str, topic: &str) -> Result<Self> {
        let subscribe_err = |reason: String| BusError::Subscribe {
            topic: topic.to_string(),
            reason,
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| subscribe_err(format!("failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| subscribe_err(e.to_string()))?;

        tracing::info!(group = %group, topic = %topic, "Kafka consumer subscribed");
        Ok(Self { consumer })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Message>> {
        let received = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(received) => received.map_err(|e| BusError::Receive(e.to_string()))?,
        };

        let mut headers = Headers::new();
        if let Some(raw) = received.headers() {
            for header in raw.iter() {
                if let Some(value) = header.value {
                    headers.insert(
                        header.key.to_string(),
                        String::from_utf8_lossy(value).into_owned(),
                    );
                }
            }
        }

        Ok(Some(Message {
            topic: received.topic().to_string(),
            partition: received.partition(),
            offset: received.offset(),
            key: received
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned())
                .unwrap_or_default(),
            payload: received.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            headers,
        }))
    }

    async fn ack(&mut self, message: &Message) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset + 1),
            )
            .map_err(|e| BusError::Commit(e.to_string()))?;
        self.consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(|e| BusError::Commit(e.to_string()))
    }

    async fn nack(&mut self, message: &Message) -> Result<()> {
        self.consumer
            .seek(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset),
                Timeout::After(Duration::from_secs(5)),
            )
            .map_err(|e| BusError::Commit(e.to_string()))
    }
}
