// SPDX-License-Identifier: MIT OR Apache-2.0

//! Asset aggregate.

use serde::{Deserialize, Serialize};

use ubl_aggregate::Rehydrator;
use ubl_core::Event;

use crate::payload::DomainEvent;

/// Folded state of an asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetState {
    /// Asset identifier (the aggregate id).
    pub id: String,
    /// Realm the asset currently belongs to.
    pub realm_id: String,
    /// Kind of asset.
    pub asset_type: String,
    /// Current status.
    pub status: String,
    /// Current owner, if any.
    pub owner_id: Option<String>,
    /// Agreement that authorized the most recent transfer.
    pub last_transfer_agreement_id: Option<String>,
}

/// Rehydrator for the asset aggregate.
#[derive(Debug, Default)]
pub struct AssetRehydrator;

impl Rehydrator for AssetRehydrator {
    type State = AssetState;

    fn aggregate_type(&self) -> &str {
        crate::aggregate_types::ASSET
    }

    fn version(&self) -> u32 {
        1
    }

    fn initial_state(&self) -> AssetState {
        AssetState::default()
    }

    fn apply(&self, mut state: AssetState, event: &Event) -> AssetState {
        match DomainEvent::parse(event) {
            Ok(DomainEvent::AssetCreated(p)) => {
                state.id = event.aggregate_id.clone();
                state.realm_id = p.realm_id;
                state.asset_type = p.asset_type;
                state.status = "available".into();
                state.owner_id = p.owner_id;
            }
            Ok(DomainEvent::AssetTransferred(p)) => {
                state.owner_id = Some(p.to_owner);
                if let Some(to_realm) = p.to_realm {
                    state.realm_id = to_realm;
                }
                state.last_transfer_agreement_id = p.transfer_agreement_id;
            }
            Ok(DomainEvent::AssetStatusChanged(p)) => {
                state.status = p.status;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    target: "ubl.domain",
                    event_id = %event.id,
                    error = %e,
                    "skipping malformed asset event"
                );
            }
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ubl_core::{event_hash, ActorRef, GENESIS_HASH};

    fn asset_event(version: u64, event_type: &str, payload: serde_json::Value) -> Event {
        let mut ev = Event {
            id: ubl_core::new_event_id(),
            sequence: version,
            timestamp: Utc.timestamp_millis_opt(1_000 * version as i64).unwrap(),
            event_type: event_type.into(),
            aggregate_type: crate::aggregate_types::ASSET.into(),
            aggregate_id: "asset-1".into(),
            aggregate_version: version,
            payload,
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
    fn fold_create_transfer_status() {
        let r = AssetRehydrator;
        let mut state = r.initial_state();

        state = r.apply(
            state,
            &asset_event(
                1,
                crate::event_types::ASSET_CREATED,
                serde_json::json!({
                    "realm_id": "realm-1",
                    "asset_type": "vehicle",
                    "owner_id": "ent-acme"
                }),
            ),
        );
        assert_eq!(state.status, "available");
        assert_eq!(state.owner_id.as_deref(), Some("ent-acme"));

        state = r.apply(
            state,
            &asset_event(
                2,
                crate::event_types::ASSET_TRANSFERRED,
                serde_json::json!({
                    "to_owner": "ent-john",
                    "from_realm": "realm-1",
                    "to_realm": "realm-2",
                    "transfer_agreement_id": "agr-sale"
                }),
            ),
        );
        assert_eq!(state.realm_id, "realm-2");
        assert_eq!(state.owner_id.as_deref(), Some("ent-john"));
        assert_eq!(state.last_transfer_agreement_id.as_deref(), Some("agr-sale"));

        state = r.apply(
            state,
            &asset_event(
                3,
                crate::event_types::ASSET_STATUS_CHANGED,
                serde_json::json!({"status": "in_service"}),
            ),
        );
        assert_eq!(state.status, "in_service");
    }

    #[test]
    fn same_realm_transfer_keeps_realm() {
        let r = AssetRehydrator;
        let mut state = r.apply(
            r.initial_state(),
            &asset_event(
                1,
                crate::event_types::ASSET_CREATED,
                serde_json::json!({"realm_id": "realm-1", "asset_type": "tool"}),
            ),
        );
        state = r.apply(
            state,
            &asset_event(
                2,
                crate::event_types::ASSET_TRANSFERRED,
                serde_json::json!({"to_owner": "ent-x"}),
            ),
        );
        assert_eq!(state.realm_id, "realm-1");
    }
}
