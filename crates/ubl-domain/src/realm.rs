// SPDX-License-Identifier: MIT OR Apache-2.0

//! Realm aggregate.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use ubl_aggregate::Rehydrator;
use ubl_core::Event;

use crate::payload::DomainEvent;

/// How strictly a realm is isolated from its siblings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// No cross-realm relationships at all.
    #[default]
    Full,
    /// Cross-realm operations permitted along ancestor/descendant lines.
    Hierarchical,
}

/// Realm configuration, fixed at creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RealmConfig {
    /// Isolation mode.
    #[serde(default)]
    pub isolation: IsolationMode,
    /// Whether cross-realm operations may involve this realm at all.
    #[serde(default)]
    pub cross_realm_allowed: bool,
    /// Entity types this realm admits; absent means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_entity_types: Option<Vec<String>>,
    /// Agreement types this realm admits; absent means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_agreement_types: Option<Vec<String>>,
}

/// Folded state of a realm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RealmState {
    /// Realm identifier (the aggregate id).
    pub id: String,
    /// Display name.
    pub name: String,
    /// When the realm was created.
    pub created_at: Option<DateTime<Utc>>,
    /// Agreement that licenses the realm.
    pub established_by: String,
    /// Configuration.
    pub config: RealmConfig,
    /// Parent realm for hierarchical isolation.
    pub parent_realm_id: Option<String>,
}

impl RealmState {
    /// Whether the realm admits an entity of the given type.
    #[must_use]
    pub fn admits_entity_type(&self, entity_type: &str) -> bool {
        self.config
            .allowed_entity_types
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|t| t == entity_type))
    }

    /// Whether the realm admits an agreement of the given type.
    #[must_use]
    pub fn admits_agreement_type(&self, agreement_type: &str) -> bool {
        self.config
            .allowed_agreement_types
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|t| t == agreement_type))
    }
}

/// Rehydrator for the realm aggregate.
#[derive(Debug, Default)]
pub struct RealmRehydrator;

impl Rehydrator for RealmRehydrator {
    type State = RealmState;

    fn aggregate_type(&self) -> &str {
        crate::aggregate_types::REALM
    }

    fn version(&self) -> u32 {
        1
    }

    fn initial_state(&self) -> RealmState {
        RealmState::default()
    }

    fn apply(&self, mut state: RealmState, event: &Event) -> RealmState {
        match DomainEvent::parse(event) {
            Ok(DomainEvent::RealmCreated(p)) => {
                state.id = event.aggregate_id.clone();
                state.name = p.name;
                state.created_at = Some(event.timestamp);
                state.established_by = p.established_by;
                state.config = p.config;
                state.parent_realm_id = p.parent_realm_id;
            }
            Ok(_) => {}
            Err(e) => {
                // A malformed stored payload cannot stop a fold; it is
                // surfaced and skipped.
                tracing::warn!(
                    target: "ubl.domain",
                    event_id = %event.id,
                    error = %e,
                    "skipping malformed realm event"
                );
            }
        }
        state
    }
}
