use tandem_types::events::MomentEvent;

/// Port through which the coordinator announces successful transitions.
///
/// Implementations must be fire-and-forget: a slow or failing subscriber
/// never delays or rolls back the transition that produced the event.
pub trait TransitionPublisher: Send + Sync {
    fn publish(&self, event: MomentEvent);
}

/// Publisher that drops every event. Used where no fan-out is wired up.
pub struct NullPublisher;

impl TransitionPublisher for NullPublisher {
    fn publish(&self, _event: MomentEvent) {}
}
