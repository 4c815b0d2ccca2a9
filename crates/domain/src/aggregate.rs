//! Core aggregate and domain event traits.

use common::{AggregateType, EventPayload};

/// Trait for domain events.
///
/// Domain events are the facts an aggregate records about itself. Some of
/// them are also announced to other services; those map to an integration
/// event that is written to the outbox with the state change.
pub trait DomainEvent: std::fmt::Debug + Clone + Send + Sync {
    /// Returns the event name, for logs.
    fn event_type(&self) -> &'static str;

    /// The event other services see, if this fact is announced at all.
    fn integration_event(&self) -> Option<EventPayload>;
}

/// Trait for state-stored aggregates.
///
/// Commands are methods that validate against the current state and return
/// the events they would produce, without mutating anything. `apply` folds
/// an event into the state. Repositories persist the resulting state with a
/// compare-and-swap on `version`.
pub trait Aggregate: Send + Sync + Sized {
    /// The type of events this aggregate produces and consumes.
    type Event: DomainEvent;

    /// The type of errors this aggregate's commands can produce.
    type Error: std::error::Error + Send + Sync;

    fn aggregate_type() -> AggregateType;

    /// Version the aggregate was loaded at. Bumped by the repository on save.
    fn version(&self) -> i64;

    fn set_version(&mut self, version: i64);

    /// Applies an event to the aggregate, updating its state.
    ///
    /// Must not fail: events record things that already happened.
    fn apply(&mut self, event: &Self::Event);

    /// Applies `events` in order and hands them back.
    fn commit(&mut self, events: Vec<Self::Event>) -> Vec<Self::Event> {
        for event in &events {
            self.apply(event);
        }
        events
    }
}

/// Integration events for `events`, in order.
pub fn integration_events<E: DomainEvent>(events: &[E]) -> Vec<EventPayload> {
    events.iter().filter_map(DomainEvent::integration_event).collect()
}
