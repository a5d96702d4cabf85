// SPDX-License-Identifier: MIT OR Apache-2.0

//! Realm membership projection.
//!
//! Tracks which realm every entity, agreement, and asset belongs to, so
//! synchronous consumers (scope containment during authorization) have a
//! lookup that does not re-read the ledger. Like every projection the maps
//! are derived; a rebuild discards and replays.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use ubl_core::scope::RealmLookup;
use ubl_core::{Event, LedgerResult};
use ubl_domain::{event_types, DomainEvent};
use ubl_projection::Projection;

/// Maps aggregate ids to their realm.
#[derive(Debug, Default)]
pub struct MembershipProjection {
    entities: RwLock<HashMap<String, String>>,
    agreements: RwLock<HashMap<String, String>>,
    assets: RwLock<HashMap<String, String>>,
}

impl MembershipProjection {
    /// Stable projection name.
    pub const NAME: &'static str = "realm_membership";

    /// Create an empty projection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Projection for MembershipProjection {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn subscribes_to(&self) -> Vec<String> {
        vec![
            event_types::ENTITY_CREATED.into(),
            event_types::AGREEMENT_PROPOSED.into(),
            event_types::ASSET_CREATED.into(),
            event_types::ASSET_TRANSFERRED.into(),
        ]
    }

    async fn handle(&self, event: &Event) -> LedgerResult<()> {
        match DomainEvent::parse(event)? {
            DomainEvent::EntityCreated(p) => {
                self.entities
                    .write()
                    .expect("membership poisoned")
                    .insert(event.aggregate_id.clone(), p.realm_id);
            }
            DomainEvent::AgreementProposed(p) => {
                self.agreements
                    .write()
                    .expect("membership poisoned")
                    .insert(event.aggregate_id.clone(), p.realm_id);
            }
            DomainEvent::AssetCreated(p) => {
                self.assets
                    .write()
                    .expect("membership poisoned")
                    .insert(event.aggregate_id.clone(), p.realm_id);
            }
            DomainEvent::AssetTransferred(p) => {
                if let Some(to_realm) = p.to_realm {
                    self.assets
                        .write()
                        .expect("membership poisoned")
                        .insert(event.aggregate_id.clone(), to_realm);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn reset(&self) -> LedgerResult<()> {
        self.entities.write().expect("membership poisoned").clear();
        self.agreements.write().expect("membership poisoned").clear();
        self.assets.write().expect("membership poisoned").clear();
        Ok(())
    }
}

impl RealmLookup for MembershipProjection {
    fn realm_of_entity(&self, entity_id: &str) -> Option<String> {
        self.entities
            .read()
            .expect("membership poisoned")
            .get(entity_id)
            .cloned()
    }

    fn realm_of_agreement(&self, agreement_id: &str) -> Option<String> {
        self.agreements
            .read()
            .expect("membership poisoned")
            .get(agreement_id)
            .cloned()
    }

    fn realm_of_asset(&self, asset_id: &str) -> Option<String> {
        self.assets
            .read()
            .expect("membership poisoned")
            .get(asset_id)
            .cloned()
    }
}
