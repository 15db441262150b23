//! Storefront events: bus abstraction, envelope and payload contracts

pub mod bus;
pub mod envelope;
pub mod payloads;

pub use bus::{BusError, BusMessage, BusResult, EventBus, InMemoryBus, NatsBus};
pub use envelope::EventEnvelope;

/// Subjects published by the storefront
pub mod subjects {
    /// Real-time notification channel (`created` / `deleted`)
    pub const NOTIFICATIONS_ALL: &str = "storefront.notifications.>";

    pub fn notification(kind: &str) -> String {
        format!("storefront.notifications.{}", kind)
    }

    /// Processed outbox events are re-published here
    pub fn outbox_event(event_type: &str) -> String {
        format!("storefront.events.{}", event_type)
    }
}
