//! Envelope wrapping every event the storefront publishes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SOURCE_MODULE: &str = "storefront";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    /// Unique event identifier (consumers dedupe on it)
    pub event_id: Uuid,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub source_module: String,
    pub source_version: String,
    /// Entity the event is about (order id, notification id)
    pub aggregate_id: String,
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    pub fn new(
        event_id: Uuid,
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        occurred_at: DateTime<Utc>,
        payload: T,
    ) -> Self {
        Self {
            event_id,
            event_type: event_type.into(),
            occurred_at,
            source_module: SOURCE_MODULE.to_string(),
            source_version: env!("CARGO_PKG_VERSION").to_string(),
            aggregate_id: aggregate_id.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_carries_source_metadata() {
        let envelope = EventEnvelope::new(
            Uuid::new_v4(),
            "order.status_changed",
            "order-1",
            Utc::now(),
            serde_json::json!({"to": "preparing"}),
        );
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["source_module"], "storefront");
        assert_eq!(json["event_type"], "order.status_changed");
        assert_eq!(json["payload"]["to"], "preparing");
    }
}
