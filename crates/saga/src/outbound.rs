//! Building outbox records and handler routes.

use std::future::Future;
use std::sync::Arc;

use common::{EventEnvelope, EventPayload, ServiceTag};
use message_bus::{EventHandler, FnHandler, HandlerError};
use outbox::NewOutboxRecord;
use uuid::Uuid;

use crate::Result;

/// A fresh trace id for a request that arrived without one.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Outbox records for `payloads`, all carrying `trace_id`.
pub(crate) fn records(
    producer: ServiceTag,
    payloads: &[EventPayload],
    trace_id: Option<&str>,
) -> Result<Vec<NewOutboxRecord>> {
    payloads
        .iter()
        .map(|payload| {
            NewOutboxRecord::from_payload(producer, payload, trace_id.map(str::to_string))
                .map_err(Into::into)
        })
        .collect()
}

/// Routes an envelope to a service method, classifying its error for the
/// consumer runtime.
pub(crate) fn route<S, F, Fut>(service: &Arc<S>, f: F) -> impl EventHandler + 'static
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>, EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let service = Arc::clone(service);
    FnHandler(move |envelope: EventEnvelope| {
        let call = f(Arc::clone(&service), envelope);
        async move { call.await.map_err(HandlerError::from) }
    })
}
