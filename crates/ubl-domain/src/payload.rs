// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed event payloads.
//!
//! Payloads are heterogeneous across event types, so the wire carries an
//! opaque JSON value and [`DomainEvent::parse`] lifts it into a typed
//! variant keyed by the event's `type` field. Unknown types fall back to
//! [`DomainEvent::Opaque`] so old readers survive new writers.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use ubl_core::scope::Scope;
use ubl_core::{Event, LedgerError, LedgerResult, Validity};

use crate::agreement::{AgreementParty, AgreementTerms, ConsentMethod};
use crate::entity::{EntityIdentity, EntityType};
use crate::event_types as et;
use crate::realm::RealmConfig;
use crate::role::Permission;

/// Payload of a [`crate::event_types::REALM_CREATED`] event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RealmCreated {
    /// Display name of the realm.
    pub name: String,
    /// Isolation and cross-realm configuration.
    #[serde(default)]
    pub config: RealmConfig,
    /// Agreement that licenses the realm's existence.
    pub established_by: String,
    /// Parent realm for hierarchical isolation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_realm_id: Option<String>,
}

/// Payload of an [`crate::event_types::ENTITY_CREATED`] event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EntityCreated {
    /// Realm the entity belongs to.
    pub realm_id: String,
    /// Kind of entity.
    pub entity_type: EntityType,
    /// Name, identifiers, and contacts.
    #[serde(flatten)]
    pub identity: EntityIdentity,
}

/// Payload of an [`crate::event_types::ENTITY_UPDATED`] event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EntityUpdated {
    /// Replacement identity fields; absent fields are left unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Payload of an [`crate::event_types::ASSET_CREATED`] event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AssetCreated {
    /// Realm the asset belongs to.
    pub realm_id: String,
    /// Kind of asset (free-form, e.g. `"vehicle"`).
    pub asset_type: String,
    /// Initial owner, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

/// Payload of an [`crate::event_types::ASSET_TRANSFERRED`] event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AssetTransferred {
    /// New owner.
    pub to_owner: String,
    /// Realm the asset leaves. Present only on cross-realm transfers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_realm: Option<String>,
    /// Realm the asset enters. Present only on cross-realm transfers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_realm: Option<String>,
    /// Agreement authorizing the transfer, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_agreement_id: Option<String>,
}

impl AssetTransferred {
    /// Whether this transfer moves the asset between two distinct realms.
    #[must_use]
    pub fn is_cross_realm(&self) -> bool {
        match (&self.from_realm, &self.to_realm) {
            (Some(from), Some(to)) => from != to,
            _ => false,
        }
    }
}

/// Payload of an [`crate::event_types::ASSET_STATUS_CHANGED`] event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AssetStatusChanged {
    /// New status (free-form, e.g. `"in_service"`).
    pub status: String,
}

/// Payload of an [`crate::event_types::AGREEMENT_PROPOSED`] event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgreementProposed {
    /// Realm the agreement belongs to.
    pub realm_id: String,
    /// Kind of agreement (e.g. `"employment"`).
    pub agreement_type: String,
    /// The parties and their roles.
    pub parties: Vec<AgreementParty>,
    /// Assets governed by the agreement.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<String>,
    /// Terms, including role templates granted on activation.
    #[serde(default)]
    pub terms: AgreementTerms,
    /// When the agreement is effective.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity: Option<Validity>,
}

/// Payload of a [`crate::event_types::CONSENT_RECORDED`] event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConsentRecorded {
    /// Party giving consent.
    pub party_id: String,
    /// How consent was attested.
    pub method: ConsentMethod,
}

/// Payload of a [`crate::event_types::ROLE_GRANTED`] event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RoleGranted {
    /// Kind of role (e.g. `"employee"`).
    pub role_type: String,
    /// Entity holding the role.
    pub holder: String,
    /// Agreement that establishes the role. Must have been active.
    pub established_by: String,
    /// Permissions the role carries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<Permission>,
    /// Where the role applies.
    pub scope: Scope,
    /// When the role applies. Absent means "while the agreement lives".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity: Option<Validity>,
}

/// Payload of a [`crate::event_types::ROLE_REVOKED`] event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RoleRevoked {
    /// Why the role was revoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A typed view over an [`Event`]'s payload.
///
/// Status-only agreement events (activation, termination, …) carry empty
/// payloads and are represented by unit variants.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    /// See [`RealmCreated`].
    RealmCreated(RealmCreated),
    /// See [`EntityCreated`].
    EntityCreated(EntityCreated),
    /// See [`EntityUpdated`].
    EntityUpdated(EntityUpdated),
    /// Logical deletion of an entity.
    EntityDeleted,
    /// See [`AssetCreated`].
    AssetCreated(AssetCreated),
    /// See [`AssetTransferred`].
    AssetTransferred(AssetTransferred),
    /// See [`AssetStatusChanged`].
    AssetStatusChanged(AssetStatusChanged),
    /// See [`AgreementProposed`].
    AgreementProposed(AgreementProposed),
    /// See [`ConsentRecorded`].
    ConsentRecorded(ConsentRecorded),
    /// Agreement entered review.
    AgreementUnderReview,
    /// Agreement became active.
    AgreementActivated,
    /// Agreement was fulfilled.
    AgreementFulfilled,
    /// Agreement was breached.
    AgreementBreached,
    /// Agreement was terminated.
    AgreementTerminated,
    /// Agreement expired.
    AgreementExpired,
    /// See [`RoleGranted`].
    RoleGranted(RoleGranted),
    /// See [`RoleRevoked`].
    RoleRevoked(RoleRevoked),
    /// Forward-compatibility fallback: an event type this build does not
    /// know, carried as its raw payload.
    Opaque {
        /// The unrecognized event type.
        event_type: String,
        /// The raw payload.
        payload: BTreeMap<String, serde_json::Value>,
    },
}

impl DomainEvent {
    /// Lift an event's payload into its typed form.
    ///
    /// # Errors
    ///
    /// Returns [`ubl_core::ErrorKind::InvalidEvent`] when a known event
    /// type carries a payload that does not deserialize.
    pub fn parse(event: &Event) -> LedgerResult<Self> {
        fn typed<T: serde::de::DeserializeOwned>(event: &Event) -> LedgerResult<T> {
            serde_json::from_value(event.payload.clone()).map_err(|e| {
                LedgerError::invalid_event(format!(
                    "malformed {} payload: {e}",
                    event.event_type
                ))
            })
        }

        Ok(match event.event_type.as_str() {
            et::REALM_CREATED => Self::RealmCreated(typed(event)?),
            et::ENTITY_CREATED => Self::EntityCreated(typed(event)?),
            et::ENTITY_UPDATED => Self::EntityUpdated(typed(event)?),
            et::ENTITY_DELETED => Self::EntityDeleted,
            et::ASSET_CREATED => Self::AssetCreated(typed(event)?),
            et::ASSET_TRANSFERRED => Self::AssetTransferred(typed(event)?),
            et::ASSET_STATUS_CHANGED => Self::AssetStatusChanged(typed(event)?),
            et::AGREEMENT_PROPOSED => Self::AgreementProposed(typed(event)?),
            et::CONSENT_RECORDED => Self::ConsentRecorded(typed(event)?),
            et::AGREEMENT_UNDER_REVIEW => Self::AgreementUnderReview,
            et::AGREEMENT_ACTIVATED => Self::AgreementActivated,
            et::AGREEMENT_FULFILLED => Self::AgreementFulfilled,
            et::AGREEMENT_BREACHED => Self::AgreementBreached,
            et::AGREEMENT_TERMINATED => Self::AgreementTerminated,
            et::AGREEMENT_EXPIRED => Self::AgreementExpired,
            et::ROLE_GRANTED => Self::RoleGranted(typed(event)?),
            et::ROLE_REVOKED => Self::RoleRevoked(typed(event)?),
            other => Self::Opaque {
                event_type: other.to_string(),
                payload: serde_json::from_value(event.payload.clone()).unwrap_or_default(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ubl_core::{event_hash, ActorRef, GENESIS_HASH};

    fn event(event_type: &str, payload: serde_json::Value) -> Event {
        let mut ev = Event {
            id: ubl_core::new_event_id(),
            sequence: 1,
            timestamp: Utc.timestamp_millis_opt(1_000).unwrap(),
            event_type: event_type.into(),
            aggregate_type: "X".into(),
            aggregate_id: "x-1".into(),
            aggregate_version: 1,
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
    fn parses_realm_created() {
        let ev = event(
            et::REALM_CREATED,
            serde_json::json!({
                "name": "internal",
                "established_by": "agr-genesis"
            }),
        );
        let DomainEvent::RealmCreated(p) = DomainEvent::parse(&ev).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(p.name, "internal");
        assert!(p.parent_realm_id.is_none());
    }

    #[test]
    fn parses_status_only_agreement_events() {
        let ev = event(et::AGREEMENT_ACTIVATED, serde_json::json!({}));
        assert_eq!(
            DomainEvent::parse(&ev).unwrap(),
            DomainEvent::AgreementActivated
        );
    }

    #[test]
    fn cross_realm_detection() {
        let same = AssetTransferred {
            to_owner: "e-1".into(),
            from_realm: Some("r-1".into()),
            to_realm: Some("r-1".into()),
            transfer_agreement_id: None,
        };
        assert!(!same.is_cross_realm());

        let cross = AssetTransferred {
            from_realm: Some("r-1".into()),
            to_realm: Some("r-2".into()),
            ..same
        };
        assert!(cross.is_cross_realm());
    }

    #[test]
    fn malformed_known_payload_is_invalid() {
        let ev = event(et::ENTITY_CREATED, serde_json::json!({"nope": true}));
        let err = DomainEvent::parse(&ev).unwrap_err();
        assert_eq!(err.kind, ubl_core::ErrorKind::InvalidEvent);
    }

    #[test]
    fn unknown_type_falls_back_to_opaque() {
        let ev = event("SomethingNew", serde_json::json!({"k": 1}));
        let DomainEvent::Opaque { event_type, payload } = DomainEvent::parse(&ev).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(event_type, "SomethingNew");
        assert_eq!(payload["k"], 1);
    }
}
