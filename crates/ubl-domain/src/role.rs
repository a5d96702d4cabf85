// SPDX-License-Identifier: MIT OR Apache-2.0

//! Role aggregate and permissions.
//!
//! Roles are authorization-bearing artifacts derived from agreements: they
//! reference their establishing agreement by id only (the repository
//! resolves traversal on demand) and are active only while both their own
//! validity window and the agreement's standing allow.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use ubl_aggregate::Rehydrator;
use ubl_core::scope::Scope;
use ubl_core::{Event, Validity};

use crate::agreement::AgreementState;
use crate::payload::DomainEvent;

/// An `{action, resource}` permission pair.
///
/// Both fields are glob patterns (`*` matches any); matching is evaluated
/// by the authorization engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Permission {
    /// Action pattern (e.g. `"read"`, `"asset:*"`, `"*"`).
    pub action: String,
    /// Resource pattern (e.g. `"Realm:internal"`, `"Asset:*"`).
    pub resource: String,
}

impl Permission {
    /// Shorthand constructor.
    #[must_use]
    pub fn new(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            resource: resource.into(),
        }
    }
}

/// Folded state of a role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleState {
    /// Role identifier (the aggregate id).
    pub id: String,
    /// Kind of role.
    pub role_type: String,
    /// Where the role applies.
    pub scope: Option<Scope>,
    /// Entity holding the role.
    pub holder: String,
    /// Agreement that establishes the role.
    pub established_by: String,
    /// Permissions carried.
    pub permissions: Vec<Permission>,
    /// Role's own validity window.
    pub validity: Option<Validity>,
    /// When the role was revoked, if ever.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl RoleState {
    /// Whether the role is active at `at`, given its establishing
    /// agreement's state.
    ///
    /// Active means: not revoked by `at`, own validity (when declared)
    /// covers `at`, and the agreement has not entered a role-invalidating
    /// status at or before `at`. A role with no validity window of its own
    /// additionally requires the agreement to have been active by `at`.
    #[must_use]
    pub fn is_active(&self, at: DateTime<Utc>, agreement: Option<&AgreementState>) -> bool {
        if self.revoked_at.is_some_and(|t| t <= at) {
            return false;
        }
        match self.validity {
            Some(v) => {
                if !v.covers(at) {
                    return false;
                }
            }
            None => {
                // No window of its own: the role lives on the agreement's
                // standing alone.
                if !agreement.is_some_and(|a| a.was_active_by(at)) {
                    return false;
                }
            }
        }
        if let Some(agreement) = agreement {
            if agreement.invalidated_at().is_some_and(|t| t <= at) {
                return false;
            }
        }
        true
    }
}

/// Rehydrator for the role aggregate.
#[derive(Debug, Default)]
pub struct RoleRehydrator;

impl Rehydrator for RoleRehydrator {
    type State = RoleState;

    fn aggregate_type(&self) -> &str {
        crate::aggregate_types::ROLE
    }

    fn version(&self) -> u32 {
        1
    }

    fn initial_state(&self) -> RoleState {
        RoleState::default()
    }

    fn apply(&self, mut state: RoleState, event: &Event) -> RoleState {
        match DomainEvent::parse(event) {
            Ok(DomainEvent::RoleGranted(p)) => {
                state.id = event.aggregate_id.clone();
                state.role_type = p.role_type;
                state.scope = Some(p.scope);
                state.holder = p.holder;
                state.established_by = p.established_by;
                state.permissions = p.permissions;
                state.validity = p.validity;
            }
            Ok(DomainEvent::RoleRevoked(_)) => {
                state.revoked_at = Some(event.timestamp);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    target: "ubl.domain",
                    event_id = %event.id,
                    error = %e,
                    "skipping malformed role event"
                );
            }
        }
        state
    }
}
