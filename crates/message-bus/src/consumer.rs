//! Consumer runtime: turns bus records into handler calls.
//!
//! For every record: decode the envelope, drop self-echoes, look up the
//! handler registered for the event type, run it under the retry policy and
//! acknowledge. Records that cannot be handled go to the dead-letter topic
//! before they are acknowledged, so nothing is lost silently.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{EventEnvelope, EventType, ServiceTag};
use tokio::sync::watch;

use crate::bus::{Headers, Message, MessagePublisher, MessageSource};
use crate::{
    DEFAULT_DEAD_LETTER_TOPIC, DEFAULT_EVENT_TOPIC, HandlerError, Result, RetryPolicy,
};

pub const HEADER_ORIGINAL_TOPIC: &str = "x-original-topic";
pub const HEADER_ORIGINAL_PARTITION: &str = "x-original-partition";
pub const HEADER_ORIGINAL_OFFSET: &str = "x-original-offset";
pub const HEADER_EXCEPTION_MESSAGE: &str = "x-exception-message";
pub const HEADER_ATTEMPTS: &str = "x-attempts";

/// Reacts to one event type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> std::result::Result<(), HandlerError>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    async fn handle(&self, envelope: &EventEnvelope) -> std::result::Result<(), HandlerError> {
        (self.0)(envelope.clone()).await
    }
}

/// Handlers keyed by event type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `event_type`, replacing any previous one.
    pub fn on(mut self, event_type: EventType, handler: impl EventHandler + 'static) -> Self {
        self.handlers.insert(event_type, Arc::new(handler));
        self
    }

    pub fn on_shared(mut self, event_type: EventType, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(event_type, handler);
        self
    }

    pub fn get(&self, event_type: &EventType) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A handler ran successfully.
    Handled,
    /// Emitted by this service; skipped.
    SelfEcho,
    /// No handler for the event type; skipped.
    Unrouted,
    /// Published to the dead-letter topic.
    DeadLettered,
    /// Could not be dead-lettered; left unacknowledged for redelivery.
    Redeliver,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Handled => "handled",
            Outcome::SelfEcho => "self_echo",
            Outcome::Unrouted => "unrouted",
            Outcome::DeadLettered => "dead_lettered",
            Outcome::Redeliver => "redeliver",
        }
    }
}

/// Per-service consumer of the shared event topic.
pub struct EventConsumer {
    service: ServiceTag,
    topic: String,
    dead_letter_topic: String,
    registry: HandlerRegistry,
    dead_letters: Arc<dyn MessagePublisher>,
    retry: RetryPolicy,
    idle_poll: Duration,
}

impl EventConsumer {
    pub fn new(
        service: ServiceTag,
        registry: HandlerRegistry,
        dead_letters: Arc<dyn MessagePublisher>,
    ) -> Self {
        Self {
            service,
            topic: DEFAULT_EVENT_TOPIC.to_string(),
            dead_letter_topic: DEFAULT_DEAD_LETTER_TOPIC.to_string(),
            registry,
            dead_letters,
            retry: RetryPolicy::default(),
            idle_poll: Duration::from_millis(500),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = topic.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    pub fn service(&self) -> ServiceTag {
        self.service
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer group this consumer reads as.
    pub fn group(&self) -> String {
        self.service.consumer_group()
    }

    /// Runs the pipeline for one record without touching offsets.
    pub async fn process(&self, message: &Message) -> Outcome {
        let envelope = match EventEnvelope::from_bytes(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(
                    service = %self.service,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Undecodable record"
                );
                return self
                    .dead_letter(message, &format!("decode failed: {e}"), 0)
                    .await;
            }
        };

        if envelope.is_from(self.service) {
            tracing::debug!(event_id = %envelope.event_id, "Skipping self-emitted event");
            return Outcome::SelfEcho;
        }

        let Some(handler) = self.registry.get(&envelope.event_type) else {
            tracing::debug!(
                service = %self.service,
                event_type = %envelope.event_type,
                "No handler registered, skipping"
            );
            return Outcome::Unrouted;
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match handler.handle(&envelope).await {
                Ok(()) => return Outcome::Handled,
                Err(HandlerError::Transient(reason)) if self.retry.should_retry(attempt) => {
                    metrics::counter!(
                        "consumer_retries_total",
                        "service" => self.service.as_str(),
                        "event_type" => envelope.event_type.to_string()
                    )
                    .increment(1);
                    tracing::warn!(
                        service = %self.service,
                        event_id = %envelope.event_id,
                        event_type = %envelope.event_type,
                        attempt,
                        reason = %reason,
                        "Transient handler failure, retrying"
                    );
                    tokio::time::sleep(self.retry.delay_after(attempt)).await;
                }
                Err(err) => {
                    tracing::error!(
                        service = %self.service,
                        event_id = %envelope.event_id,
                        event_type = %envelope.event_type,
                        aggregate_id = %envelope.aggregate_id,
                        attempt,
                        error = %err,
                        "Handler failed, dead-lettering"
                    );
                    return self.dead_letter(message, &err.to_string(), attempt).await;
                }
            }
        }
    }

    /// Processes one record and settles its offset.
    pub async fn deliver(&self, source: &mut dyn MessageSource, message: &Message) -> Result<Outcome> {
        let outcome = self.process(message).await;
        metrics::counter!(
            "consumer_messages_total",
            "service" => self.service.as_str(),
            "outcome" => outcome.as_str()
        )
        .increment(1);

        match outcome {
            Outcome::Redeliver => source.nack(message).await?,
            _ => source.ack(message).await?,
        }
        Ok(outcome)
    }

    /// Drains whatever `source` has ready right now.
    ///
    /// Stops early when a record has to be redelivered, since retrying it in a
    /// tight loop cannot succeed. Returns the number of records processed.
    pub async fn process_available(&self, source: &mut dyn MessageSource) -> Result<usize> {
        let mut processed = 0;
        while let Some(message) = source.poll(Duration::ZERO).await? {
            processed += 1;
            if self.deliver(source, &message).await? == Outcome::Redeliver {
                break;
            }
        }
        Ok(processed)
    }

    /// Consumes `source` until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut source: Box<dyn MessageSource>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(service = %self.service, topic = %self.topic, "Consumer started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let polled = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                polled = source.poll(self.idle_poll) => polled,
            };

            match polled {
                Ok(Some(message)) => {
                    if let Err(e) = self.deliver(source.as_mut(), &message).await {
                        tracing::error!(service = %self.service, error = %e, "Offset settle failed");
                        tokio::time::sleep(self.idle_poll).await;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(service = %self.service, error = %e, "Poll failed");
                    tokio::time::sleep(self.idle_poll).await;
                }
            }
        }
        tracing::info!(service = %self.service, "Consumer stopped");
    }

    async fn dead_letter(&self, message: &Message, reason: &str, attempts: u32) -> Outcome {
        let mut headers: Headers = message.headers.clone();
        headers.insert(HEADER_ORIGINAL_TOPIC.to_string(), message.topic.clone());
        headers.insert(
            HEADER_ORIGINAL_PARTITION.to_string(),
            message.partition.to_string(),
        );
        headers.insert(HEADER_ORIGINAL_OFFSET.to_string(), message.offset.to_string());
        headers.insert(HEADER_EXCEPTION_MESSAGE.to_string(), reason.to_string());
        headers.insert(HEADER_ATTEMPTS.to_string(), attempts.to_string());

        match self
            .dead_letters
            .publish(&self.dead_letter_topic, &message.key, &message.payload, &headers)
            .await
        {
            Ok(_) => {
                metrics::counter!(
                    "consumer_dead_letters_total",
                    "service" => self.service.as_str()
                )
                .increment(1);
                Outcome::DeadLettered
            }
            Err(e) => {
                tracing::error!(
                    service = %self.service,
                    topic = %self.dead_letter_topic,
                    error = %e,
                    "Dead-letter publish failed, leaving record unacknowledged"
                );
                Outcome::Redeliver
            }
        }
    }
}
