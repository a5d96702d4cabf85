// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authorization scopes and containment rules.
//!
//! A scope is the containment boundary restricting where a role applies.
//! Containment is partial: `Realm(r)` contains an entity scope only when
//! the entity belongs to `r`, which requires a lookup the caller provides
//! via [`RealmLookup`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Where a role (or resource) lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scope {
    /// Contains every other scope.
    Global,
    /// A tenant boundary.
    Realm {
        /// Realm identifier.
        realm_id: String,
    },
    /// A single entity.
    Entity {
        /// Entity identifier.
        entity_id: String,
    },
    /// A single agreement.
    Agreement {
        /// Agreement identifier.
        agreement_id: String,
    },
    /// A single asset.
    Asset {
        /// Asset identifier.
        asset_id: String,
    },
}

/// Resolves which realm an aggregate belongs to.
///
/// Implemented over the aggregate repository in production; tests use a
/// fixed map.
pub trait RealmLookup {
    /// Realm of an entity, if known.
    fn realm_of_entity(&self, entity_id: &str) -> Option<String>;
    /// Realm of an agreement, if known.
    fn realm_of_agreement(&self, agreement_id: &str) -> Option<String>;
    /// Realm of an asset, if known.
    fn realm_of_asset(&self, asset_id: &str) -> Option<String>;
}

impl Scope {
    /// Shorthand for a realm scope.
    #[must_use]
    pub fn realm(realm_id: impl Into<String>) -> Self {
        Self::Realm {
            realm_id: realm_id.into(),
        }
    }

    /// Shorthand for an entity scope.
    #[must_use]
    pub fn entity(entity_id: impl Into<String>) -> Self {
        Self::Entity {
            entity_id: entity_id.into(),
        }
    }

    /// Whether this scope contains `other`.
    ///
    /// Rules: `Global` contains everything; `Realm(r)` contains itself and
    /// any entity/agreement/asset scope whose aggregate belongs to `r`;
    /// leaf scopes contain only themselves.
    #[must_use]
    pub fn contains(&self, other: &Scope, realms: &dyn RealmLookup) -> bool {
        match self {
            Self::Global => true,
            Self::Realm { realm_id } => match other {
                Self::Global => false,
                Self::Realm { realm_id: r } => r == realm_id,
                Self::Entity { entity_id } => {
                    realms.realm_of_entity(entity_id).as_deref() == Some(realm_id)
                }
                Self::Agreement { agreement_id } => {
                    realms.realm_of_agreement(agreement_id).as_deref() == Some(realm_id)
                }
                Self::Asset { asset_id } => {
                    realms.realm_of_asset(asset_id).as_deref() == Some(realm_id)
                }
            },
            leaf => leaf == other,
        }
    }
}
