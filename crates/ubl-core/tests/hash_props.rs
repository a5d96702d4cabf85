// SPDX-License-Identifier: MIT OR Apache-2.0

//! Properties of the canonical hashing format over arbitrary payloads.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use ubl_core::{canonical_event_json, event_hash, ActorRef, Event, GENESIS_HASH};

fn event_with(payload: serde_json::Value, party: &str) -> Event {
    Event {
        id: uuid::Uuid::nil(),
        sequence: 1,
        timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        event_type: "Probe".into(),
        aggregate_type: "Probe".into(),
        aggregate_id: "p-1".into(),
        aggregate_version: 1,
        payload,
        causation: None,
        actor: ActorRef::party(party),
        previous_hash: GENESIS_HASH.into(),
        hash: String::new(),
        schema_version: None,
        metadata: None,
    }
}

proptest! {
    #[test]
    fn hashing_is_deterministic(key in "[a-z]{1,12}", value in "[ -~]{0,48}", n in 0i64..1_000_000) {
        let payload = serde_json::json!({ key.clone(): value, "n": n });
        let ev = event_with(payload, "ent-prop");
        prop_assert_eq!(event_hash(&ev).unwrap(), event_hash(&ev).unwrap());
    }

    #[test]
    fn different_payloads_hash_differently(a in 0i64..1_000_000, b in 0i64..1_000_000) {
        prop_assume!(a != b);
        let ev_a = event_with(serde_json::json!({"n": a}), "ent-prop");
        let ev_b = event_with(serde_json::json!({"n": b}), "ent-prop");
        prop_assert_ne!(event_hash(&ev_a).unwrap(), event_hash(&ev_b).unwrap());
    }

    #[test]
    fn canonical_form_never_contains_the_hash_field(value in "[a-z]{0,32}") {
        let mut ev = event_with(serde_json::json!({"v": value}), "ent-prop");
        ev.hash = event_hash(&ev).unwrap();
        let canonical = canonical_event_json(&ev).unwrap();
        prop_assert!(!canonical.contains("\"hash\""));
        // The stored hash never influences a recomputation.
        let rehash = event_hash(&ev).unwrap();
        prop_assert_eq!(rehash, ev.hash);
    }

    #[test]
    fn stored_events_round_trip_the_wire(value in "[ -~]{0,64}") {
        let mut ev = event_with(serde_json::json!({"v": value}), "ent-prop");
        ev.hash = event_hash(&ev).unwrap();
        let wire = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&wire).unwrap();
        prop_assert_eq!(&back, &ev);
        prop_assert_eq!(event_hash(&back).unwrap(), ev.hash);
    }
}
