// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! ubl-authz
//!
//! Attribute-based authorization over agreement-derived roles, combined
//! with a declarative policy engine. A decision resolves the actor's
//! *active* roles at the request timestamp, matches their permissions with
//! glob subset rules, then lets policies override (a `Deny` always wins).
//! Every decision produces an audit entry; the audit trail is the event
//! stream itself.

/// Audit entries for authorization decisions.
pub mod audit;
/// Declarative policy engine.
pub mod policy;
/// Resource references and glob permission matching.
pub mod resource;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use ubl_core::scope::{RealmLookup, Scope};
use ubl_core::{ActorRef, LedgerResult};
use ubl_domain::{AgreementState, Permission, RoleState};

pub use audit::AuditEntry;
pub use policy::{
    ActorCondition, Condition, ContextCondition, Effect, EvalContext, Policy, PolicyEngine,
    PolicyOutcome, ResourceCondition, RoleCondition, Rule, TemporalCondition,
};
pub use resource::{permission_matches, ResourceRef};

/// An authorization request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AccessRequest {
    /// Who is asking.
    pub actor: ActorRef,
    /// What they want to do.
    pub action: String,
    /// What they want to do it to (`"Realm:internal"`, `"Asset:a-1"`, …).
    pub resource: String,
    /// Evaluation context.
    pub context: AccessContext,
}

/// Context for an authorization request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AccessContext {
    /// Realm the request is scoped to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm_id: Option<String>,
    /// Evaluation instant; roles are resolved as of this time.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    #[schemars(with = "i64")]
    pub timestamp: DateTime<Utc>,
    /// Free-form attributes consulted by policies.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl AccessContext {
    /// Context at the given instant with no realm or attributes.
    #[must_use]
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            realm_id: None,
            timestamp,
            attributes: BTreeMap::new(),
        }
    }

    /// Scope the context to a realm.
    #[must_use]
    pub fn in_realm(mut self, realm_id: impl Into<String>) -> Self {
        self.realm_id = Some(realm_id.into());
        self
    }
}

/// One role-derived reason a request was (tentatively) allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RoleGrantRef {
    /// The granting role.
    pub role_id: String,
    /// Its type.
    pub role_type: String,
    /// The agreement that established it.
    pub agreement_id: String,
    /// The permission that matched.
    pub permission: Permission,
    /// The role's scope.
    pub scope: Scope,
}

/// The outcome of an authorization request, with its full reasoning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AccessDecision {
    /// Whether the request is allowed.
    pub allowed: bool,
    /// Role grants that (tentatively) allowed it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub granted_by: Vec<RoleGrantRef>,
    /// The policy whose `Deny` applied, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_by_policy: Option<String>,
    /// The policy whose `Allow` applied, when no role granted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_by_policy: Option<String>,
    /// Human-readable chain of reasoning.
    pub reasoning: Vec<String>,
}

/// Role and agreement lookups the engine needs. Implemented over the
/// aggregate repositories in production.
#[async_trait]
pub trait RoleSource: Send + Sync {
    /// All role states whose holder is the given entity.
    async fn roles_for(&self, holder: &str) -> LedgerResult<Vec<RoleState>>;

    /// Current state of an agreement.
    async fn agreement(&self, agreement_id: &str) -> LedgerResult<Option<AgreementState>>;
}

/// The authorization engine.
pub struct AuthorizationEngine {
    roles: Arc<dyn RoleSource>,
    realms: Arc<dyn RealmLookup + Send + Sync>,
    policies: Arc<PolicyEngine>,
}

impl std::fmt::Debug for AuthorizationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationEngine").finish_non_exhaustive()
    }
}

impl AuthorizationEngine {
    /// Wire an engine over its collaborators.
    pub fn new(
        roles: Arc<dyn RoleSource>,
        realms: Arc<dyn RealmLookup + Send + Sync>,
        policies: Arc<PolicyEngine>,
    ) -> Self {
        Self {
            roles,
            realms,
            policies,
        }
    }

    /// The policy engine, for registration.
    #[must_use]
    pub fn policies(&self) -> &PolicyEngine {
        &self.policies
    }

    /// Decide an access request.
    ///
    /// The decision is pure with respect to the ledger at the request
    /// timestamp: it depends only on the set of roles active then, not on
    /// the order their events were appended.
    ///
    /// # Errors
    ///
    /// Propagates role-source failures. A decision of "deny" is a normal
    /// result, not an error.
    pub async fn decide(&self, request: &AccessRequest) -> LedgerResult<AccessDecision> {
        let mut reasoning = Vec::new();
        let at = request.context.timestamp;
        let resource = ResourceRef::parse(&request.resource);
        let resource_scope = resource.to_scope(request.context.realm_id.as_deref());

        // 1. Resolve active roles for the actor at the request timestamp.
        let active_roles = match request.actor.party_id() {
            Some(holder) => {
                let mut active = Vec::new();
                for role in self.roles.roles_for(holder).await? {
                    let agreement = self.roles.agreement(&role.established_by).await?;
                    if !role.is_active(at, agreement.as_ref()) {
                        continue;
                    }
                    let in_scope = role
                        .scope
                        .as_ref()
                        .is_some_and(|s| s.contains(&resource_scope, self.realms.as_ref()));
                    if in_scope {
                        active.push(role);
                    }
                }
                active
            }
            None => Vec::new(),
        };
        reasoning.push(format!(
            "{} active role(s) in scope for {}",
            active_roles.len(),
            request.resource
        ));

        // 2–3. Permission matching over active roles.
        let mut granted_by = Vec::new();
        for role in &active_roles {
            for permission in &role.permissions {
                if permission_matches(permission, &request.action, &request.resource) {
                    reasoning.push(format!(
                        "role {} ({}) grants {} on {}",
                        role.id, role.role_type, permission.action, permission.resource
                    ));
                    granted_by.push(RoleGrantRef {
                        role_id: role.id.clone(),
                        role_type: role.role_type.clone(),
                        agreement_id: role.established_by.clone(),
                        permission: permission.clone(),
                        scope: role.scope.clone().unwrap_or(Scope::Global),
                    });
                }
            }
        }

        // 4. Policies may override.
        let ctx = EvalContext {
            request,
            resource: &resource,
            active_roles: &active_roles,
            resource_owner: request
                .context
                .attributes
                .get("resource_owner")
                .and_then(|v| v.as_str()),
            agreement_parties: &[],
        };
        let outcome = self.policies.evaluate(&ctx);

        let decision = match outcome {
            PolicyOutcome::Deny { policy_id } => {
                reasoning.push(format!("policy {policy_id} denies"));
                AccessDecision {
                    allowed: false,
                    granted_by,
                    denied_by_policy: Some(policy_id),
                    allowed_by_policy: None,
                    reasoning,
                }
            }
            PolicyOutcome::Allow { policy_id } => {
                reasoning.push(format!("policy {policy_id} allows"));
                AccessDecision {
                    allowed: true,
                    granted_by,
                    denied_by_policy: None,
                    allowed_by_policy: Some(policy_id),
                    reasoning,
                }
            }
            PolicyOutcome::Neutral => {
                let allowed = !granted_by.is_empty();
                reasoning.push(if allowed {
                    "granted by role permissions".to_string()
                } else {
                    "no role or policy grants this request".to_string()
                });
                AccessDecision {
                    allowed,
                    granted_by,
                    denied_by_policy: None,
                    allowed_by_policy: None,
                    reasoning,
                }
            }
        };

        tracing::debug!(
            target: "ubl.authz",
            action = %request.action,
            resource = %request.resource,
            allowed = decision.allowed,
            grants = decision.granted_by.len(),
            "access decision"
        );
        Ok(decision)
    }
}
