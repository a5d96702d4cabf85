// SPDX-License-Identifier: MIT OR Apache-2.0

//! Event filtering for subscriptions and reads.

use crate::Event;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declarative filter over the event stream.
///
/// An empty filter matches everything. Each populated field narrows the
/// match; all populated fields must hold.
///
/// # Examples
///
/// ```
/// use ubl_core::filter::EventFilter;
///
/// let filter = EventFilter::default()
///     .for_aggregate_type("Agreement")
///     .for_event_type("AgreementActivated")
///     .after(10);
/// assert!(!filter.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EventFilter {
    /// Restrict to these aggregate types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_types: Option<Vec<String>>,

    /// Restrict to these event types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<String>>,

    /// Only events with a strictly greater sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_sequence: Option<u64>,
}

impl EventFilter {
    /// A filter that matches every event.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Restrict to a single aggregate type (additive).
    #[must_use]
    pub fn for_aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_types
            .get_or_insert_with(Vec::new)
            .push(aggregate_type.into());
        self
    }

    /// Restrict to a single event type (additive).
    #[must_use]
    pub fn for_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types
            .get_or_insert_with(Vec::new)
            .push(event_type.into());
        self
    }

    /// Only match events appended after the given sequence.
    #[must_use]
    pub fn after(mut self, sequence: u64) -> Self {
        self.after_sequence = Some(sequence);
        self
    }

    /// Whether no restrictions are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.aggregate_types.is_none()
            && self.event_types.is_none()
            && self.after_sequence.is_none()
    }

    /// Whether the event passes the filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(after) = self.after_sequence {
            if event.sequence <= after {
                return false;
            }
        }
        if let Some(types) = &self.aggregate_types {
            if !types.iter().any(|t| t == &event.aggregate_type) {
                return false;
            }
        }
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == &event.event_type) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event_hash, ActorRef, Event, GENESIS_HASH};
    use chrono::{TimeZone, Utc};

    fn event(seq: u64, aggregate_type: &str, event_type: &str) -> Event {
        let mut ev = Event {
            id: crate::new_event_id(),
            sequence: seq,
            timestamp: Utc.timestamp_millis_opt(seq as i64).unwrap(),
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: "a-1".into(),
            aggregate_version: 1,
            payload: serde_json::json!({}),
            causation: None,
            actor: ActorRef::system("test"),
            previous_hash: GENESIS_HASH.into(),
            hash: String::new(),
            schema_version: None,
            metadata: None,
        };
        ev.hash = event_hash(&ev).unwrap();
        ev
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = EventFilter::any();
        assert!(f.is_empty());
        assert!(f.matches(&event(1, "Realm", "RealmCreated")));
        assert!(f.matches(&event(99, "Asset", "AssetTransferred")));
    }

    #[test]
    fn aggregate_type_restriction() {
        let f = EventFilter::any().for_aggregate_type("Agreement");
        assert!(f.matches(&event(1, "Agreement", "AgreementProposed")));
        assert!(!f.matches(&event(1, "Asset", "AssetCreated")));
    }

    #[test]
    fn event_type_restriction_is_or_within_field() {
        let f = EventFilter::any()
            .for_event_type("RealmCreated")
            .for_event_type("EntityCreated");
        assert!(f.matches(&event(1, "Realm", "RealmCreated")));
        assert!(f.matches(&event(2, "Entity", "EntityCreated")));
        assert!(!f.matches(&event(3, "Asset", "AssetCreated")));
    }

    #[test]
    fn after_sequence_is_strict() {
        let f = EventFilter::any().after(5);
        assert!(!f.matches(&event(5, "Realm", "RealmCreated")));
        assert!(f.matches(&event(6, "Realm", "RealmCreated")));
    }

    #[test]
    fn fields_combine_with_and() {
        let f = EventFilter::any()
            .for_aggregate_type("Agreement")
            .for_event_type("AgreementActivated")
            .after(10);
        assert!(f.matches(&event(11, "Agreement", "AgreementActivated")));
        assert!(!f.matches(&event(11, "Agreement", "AgreementProposed")));
        assert!(!f.matches(&event(9, "Agreement", "AgreementActivated")));
    }
}
