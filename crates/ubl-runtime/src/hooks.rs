// SPDX-License-Identifier: MIT OR Apache-2.0

//! Event hooks: subscribers that synthesize derived events.
//!
//! The agreement→role coupling is the canonical hook: rather than a
//! synchronous cross-aggregate write, activating an agreement causes the
//! hook to emit `RoleGranted` events whose `established_by` references the
//! agreement. Grant ids are deterministic per
//! `(agreement, template, party)`, so replays of the activation event
//! cannot create duplicates.

use std::sync::Arc;

use async_trait::async_trait;

use ubl_core::{ActorRef, Event, EventInput, EventInputBuilder, LedgerResult};
use ubl_domain::{aggregate_types, event_types, AgreementRehydrator};
use ubl_store::EventStore;

use ubl_aggregate::Repository;

/// A subscriber that reacts to events by proposing follow-up appends.
///
/// Hooks run inside the runtime's event pump; returned inputs go through
/// the same checked append path as every other write.
#[async_trait]
pub trait EventHook: Send + Sync {
    /// Hook name, for logging.
    fn name(&self) -> &str;

    /// React to one event. Must be idempotent under redelivery.
    async fn on_event(&self, event: &Event) -> LedgerResult<Vec<EventInput>>;
}

/// Grants the roles an agreement's templates declare when it activates.
pub struct AgreementRoleHook {
    store: Arc<dyn EventStore>,
    agreements: Arc<Repository<AgreementRehydrator>>,
}

impl AgreementRoleHook {
    /// Wire the hook.
    pub fn new(
        store: Arc<dyn EventStore>,
        agreements: Arc<Repository<AgreementRehydrator>>,
    ) -> Self {
        Self { store, agreements }
    }

    /// Deterministic role aggregate id for a grant. Identity is the
    /// idempotency mechanism: a replayed activation computes the same id
    /// and finds the role already granted.
    #[must_use]
    pub fn role_id(agreement_id: &str, template_id: &str, holder: &str) -> String {
        format!("role-{agreement_id}-{template_id}-{holder}")
    }
}

#[async_trait]
impl EventHook for AgreementRoleHook {
    fn name(&self) -> &str {
        "agreement_role_grants"
    }

    async fn on_event(&self, event: &Event) -> LedgerResult<Vec<EventInput>> {
        if event.event_type != event_types::AGREEMENT_ACTIVATED {
            return Ok(Vec::new());
        }
        let Some(agreement) = self.agreements.load(&event.aggregate_id).await? else {
            return Ok(Vec::new());
        };
        let agreement = agreement.state;

        let mut grants = Vec::new();
        for template in &agreement.terms.role_templates {
            for party in agreement
                .parties
                .iter()
                .filter(|p| p.role == template.party_role)
            {
                let role_id =
                    Self::role_id(&agreement.id, &template.template_id, &party.entity_id);
                // Already granted on a previous delivery of this
                // activation.
                if self
                    .store
                    .get_latest(aggregate_types::ROLE, &role_id)
                    .await?
                    .is_some()
                {
                    continue;
                }
                tracing::info!(
                    target: "ubl.runtime",
                    role = %role_id,
                    holder = %party.entity_id,
                    agreement = %agreement.id,
                    "granting role from activated agreement"
                );
                grants.push(
                    EventInputBuilder::new(
                        event_types::ROLE_GRANTED,
                        aggregate_types::ROLE,
                        &role_id,
                    )
                    .version(1)
                    .payload(serde_json::json!({
                        "role_type": template.role_type,
                        "holder": party.entity_id,
                        "established_by": agreement.id,
                        "permissions": template.permissions,
                        "scope": template.scope,
                        "validity": template.validity,
                    }))
                    .metadata("role_template_id", serde_json::json!(template.template_id))
                    .actor(ActorRef::system_component("ledger", "role-hook"))
                    .build(),
                );
            }
        }
        Ok(grants)
    }
}
