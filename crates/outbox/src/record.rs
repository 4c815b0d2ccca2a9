use chrono::{DateTime, Utc};
use common::{
    AggregateType, EventEnvelope, EventId, EventPayload, EventType, SCHEMA_VERSION, ServiceTag,
};

use crate::Result;

/// Lifecycle of an outbox record.
///
/// `Pending` moves to `Published` or `Failed` exactly once; both are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OutboxStatus::Pending),
            "PUBLISHED" => Some(OutboxStatus::Published),
            "FAILED" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, OutboxStatus::Pending)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event waiting to be written together with the state change that
/// caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxRecord {
    pub event_id: EventId,
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    pub event_type: EventType,
    pub payload: String,
    pub producer: ServiceTag,
    pub trace_id: Option<String>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
}

impl NewOutboxRecord {
    /// Builds a record for `payload`, filed under the aggregate the payload
    /// names.
    pub fn from_payload(
        producer: ServiceTag,
        payload: &EventPayload,
        trace_id: Option<String>,
    ) -> Result<Self> {
        let (aggregate_type, aggregate_id) = payload.aggregate();
        Ok(Self {
            event_id: EventId::new(),
            aggregate_type,
            aggregate_id,
            event_type: payload.event_type(),
            payload: payload.encode()?,
            producer,
            trace_id,
            version: SCHEMA_VERSION,
            created_at: Utc::now(),
        })
    }

    pub(crate) fn into_pending(self) -> OutboxRecord {
        OutboxRecord {
            event_id: self.event_id,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            payload: self.payload,
            producer: self.producer,
            trace_id: self.trace_id,
            version: self.version,
            created_at: self.created_at,
            status: OutboxStatus::Pending,
            published_at: None,
            failure_reason: None,
        }
    }
}

/// A stored outbox record.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub event_id: EventId,
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    pub event_type: EventType,
    pub payload: String,
    pub producer: ServiceTag,
    pub trace_id: Option<String>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub status: OutboxStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl OutboxRecord {
    /// The envelope the relay sends for this record.
    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id.clone(),
            occurred_at: self.created_at,
            producer: self.producer.as_str().to_string(),
            trace_id: self.trace_id.clone(),
            version: self.version,
            payload: self.payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use common::payload::OrderConfirmed;
    use common::{OrderId, UserId};

    use super::*;

    #[test]
    fn test_record_inherits_aggregate_from_payload() {
        let order_id = OrderId::new();
        let payload = EventPayload::OrderConfirmed(OrderConfirmed {
            order_id,
            user_id: UserId::new(),
        });

        let record = NewOutboxRecord::from_payload(
            ServiceTag::Order,
            &payload,
            Some("trace-9".to_string()),
        )
        .unwrap()
        .into_pending();

        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.aggregate_type, AggregateType::Order);
        assert_eq!(record.aggregate_id, order_id.to_string());

        let envelope = record.to_envelope();
        assert_eq!(envelope.event_id, record.event_id);
        assert_eq!(envelope.event_type, EventType::OrderConfirmed);
        assert_eq!(envelope.producer, "order-service");
        assert_eq!(envelope.trace_id.as_deref(), Some("trace-9"));
        assert_eq!(envelope.occurred_at, record.created_at);
    }

    #[test]
    fn test_only_pending_is_not_final() {
        assert!(!OutboxStatus::Pending.is_final());
        assert!(OutboxStatus::Published.is_final());
        assert!(OutboxStatus::Failed.is_final());
        assert_eq!(OutboxStatus::parse("FAILED"), Some(OutboxStatus::Failed));
        assert_eq!(OutboxStatus::parse("IN_FLIGHT"), None);
    }
}
