// SPDX-License-Identifier: MIT OR Apache-2.0

//! Entity aggregate: the actors and things inside a realm.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use ubl_aggregate::Rehydrator;
use ubl_core::Event;

use crate::payload::DomainEvent;

/// Kind of entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A natural person.
    Person,
    /// An organization.
    Organization,
    /// A machine actor.
    System,
    /// Anything else.
    #[serde(other)]
    Other,
}

/// An external identifier attached to an entity (tax id, registry number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EntityIdentifier {
    /// Identifier scheme (e.g. `"tax_id"`).
    pub scheme: String,
    /// Identifier value.
    pub value: String,
}

/// A contact channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Contact {
    /// Channel kind (e.g. `"email"`).
    pub kind: String,
    /// Channel address.
    pub value: String,
}

/// Who an entity is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EntityIdentity {
    /// Display name.
    pub name: String,
    /// External identifiers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifiers: Vec<EntityIdentifier>,
    /// Contact channels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contacts: Vec<Contact>,
}

/// Folded state of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    /// Entity identifier (the aggregate id).
    pub id: String,
    /// Realm the entity belongs to.
    pub realm_id: String,
    /// Kind of entity.
    pub entity_type: EntityType,
    /// Identity fields.
    pub identity: EntityIdentity,
    /// Number of events folded so far.
    pub version: u64,
    /// Logical deletion marker; the events remain.
    pub deleted: bool,
}

impl Default for EntityState {
    fn default() -> Self {
        Self {
            id: String::new(),
            realm_id: String::new(),
            entity_type: EntityType::Other,
            identity: EntityIdentity::default(),
            version: 0,
            deleted: false,
        }
    }
}

/// Rehydrator for the entity aggregate.
#[derive(Debug, Default)]
pub struct EntityRehydrator;

impl Rehydrator for EntityRehydrator {
    type State = EntityState;

    fn aggregate_type(&self) -> &str {
        crate::aggregate_types::ENTITY
    }

    fn version(&self) -> u32 {
        1
    }

    fn initial_state(&self) -> EntityState {
        EntityState::default()
    }

    fn apply(&self, mut state: EntityState, event: &Event) -> EntityState {
        match DomainEvent::parse(event) {
            Ok(DomainEvent::EntityCreated(p)) => {
                state.id = event.aggregate_id.clone();
                state.realm_id = p.realm_id;
                state.entity_type = p.entity_type;
                state.identity = p.identity;
            }
            Ok(DomainEvent::EntityUpdated(p)) => {
                if let Some(name) = p.name {
                    state.identity.name = name;
                }
            }
            Ok(DomainEvent::EntityDeleted) => {
                state.deleted = true;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    target: "ubl.domain",
                    event_id = %event.id,
                    error = %e,
                    "skipping malformed entity event"
                );
            }
        }
        state.version = event.aggregate_version;
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ubl_core::{event_hash, ActorRef, GENESIS_HASH};

    fn entity_event(version: u64, event_type: &str, payload: serde_json::Value) -> Event {
        let mut ev = Event {
            id: ubl_core::new_event_id(),
            sequence: version,
            timestamp: Utc.timestamp_millis_opt(1_000 * version as i64).unwrap(),
            event_type: event_type.into(),
            aggregate_type: crate::aggregate_types::ENTITY.into(),
            aggregate_id: "ent-1".into(),
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
    fn fold_create_update_delete() {
        let r = EntityRehydrator;
        let mut state = r.initial_state();

        state = r.apply(
            state,
            &entity_event(
                1,
                crate::event_types::ENTITY_CREATED,
                serde_json::json!({
                    "realm_id": "realm-1",
                    "entity_type": "person",
                    "name": "John",
                    "contacts": [{"kind": "email", "value": "john@acme.test"}]
                }),
            ),
        );
        assert_eq!(state.identity.name, "John");
        assert_eq!(state.entity_type, EntityType::Person);
        assert_eq!(state.version, 1);

        state = r.apply(
            state,
            &entity_event(
                2,
                crate::event_types::ENTITY_UPDATED,
                serde_json::json!({"name": "John Q."}),
            ),
        );
        assert_eq!(state.identity.name, "John Q.");
        // Update does not clobber untouched identity fields.
        assert_eq!(state.identity.contacts.len(), 1);

        state = r.apply(
            state,
            &entity_event(3, crate::event_types::ENTITY_DELETED, serde_json::json!({})),
        );
        assert!(state.deleted);
        assert_eq!(state.version, 3);
    }

    #[test]
    fn unknown_entity_type_maps_to_other() {
        let t: EntityType = serde_json::from_value(serde_json::json!("starship")).unwrap();
        assert_eq!(t, EntityType::Other);
    }
}
