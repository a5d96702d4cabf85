// SPDX-License-Identifier: MIT OR Apache-2.0

//! Domain invariant gate and command validation.
//!
//! Two layers guard an append before it reaches the store:
//!
//! - [`CommandValidator`] checks the input in isolation (structural shape
//!   of the payload for its event type) and raises `INVALID_EVENT`.
//! - [`InvariantGate`] checks the input against current derived state
//!   (consent before activation, saga-only cross-realm transfers) and
//!   raises `INVARIANT_VIOLATION`.

use async_trait::async_trait;

use ubl_core::{EventInput, LedgerError, LedgerResult};

use crate::agreement::AgreementState;
use crate::payload::DomainEvent;
use crate::realm::RealmState;
use crate::{aggregate_types, event_types};

/// Metadata key carrying the saga context on cross-realm events.
pub const SAGA_ID_KEY: &str = "saga_id";

/// Structural validation of an [`EventInput`] in isolation.
#[derive(Debug, Default)]
pub struct CommandValidator;

impl CommandValidator {
    /// Create a validator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Validate the payload shape for the input's event type.
    ///
    /// # Errors
    ///
    /// Returns [`ubl_core::ErrorKind::InvalidEvent`] for malformed or
    /// incoherent payloads.
    pub fn validate(&self, input: &EventInput) -> LedgerResult<()> {
        // Parsing through the typed payload union is the structural check;
        // everything below adds semantic shape rules per type.
        let probe = probe_event(input);
        let parsed = DomainEvent::parse(&probe)?;

        match parsed {
            DomainEvent::RealmCreated(p) => {
                if p.name.trim().is_empty() {
                    return Err(LedgerError::invalid_event("realm name must not be empty"));
                }
                if p.established_by.trim().is_empty() {
                    return Err(LedgerError::invalid_event(
                        "realm must reference its establishing agreement",
                    ));
                }
            }
            DomainEvent::EntityCreated(p) => {
                if p.identity.name.trim().is_empty() {
                    return Err(LedgerError::invalid_event("entity name must not be empty"));
                }
                if p.realm_id.trim().is_empty() {
                    return Err(LedgerError::invalid_event("entity must belong to a realm"));
                }
            }
            DomainEvent::AgreementProposed(p) => {
                if p.parties.is_empty() {
                    return Err(LedgerError::invalid_event(
                        "an agreement needs at least one party",
                    ));
                }
                if p.parties.iter().all(|q| !q.is_principal()) {
                    return Err(LedgerError::invalid_event(
                        "an agreement needs at least one principal party",
                    ));
                }
                if let Some(v) = p.validity {
                    if v.effective_until.is_some_and(|until| until <= v.effective_from) {
                        return Err(LedgerError::invalid_event(
                            "agreement validity window is empty",
                        ));
                    }
                }
            }
            DomainEvent::ConsentRecorded(p) => {
                if p.party_id.trim().is_empty() {
                    return Err(LedgerError::invalid_event("consent needs a party id"));
                }
            }
            DomainEvent::RoleGranted(p) => {
                if p.holder.trim().is_empty() || p.established_by.trim().is_empty() {
                    return Err(LedgerError::invalid_event(
                        "a role needs a holder and an establishing agreement",
                    ));
                }
            }
            DomainEvent::AssetTransferred(p) => {
                if p.to_owner.trim().is_empty() {
                    return Err(LedgerError::invalid_event("transfer needs a new owner"));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Derived-state lookups the gate needs. Implemented over the aggregate
/// repositories by the runtime; tests use fixtures.
#[async_trait]
pub trait InvariantContext: Send + Sync {
    /// Current state of an agreement, if it exists.
    async fn agreement(&self, agreement_id: &str) -> LedgerResult<Option<AgreementState>>;

    /// Current state of a realm, if it exists. The default keeps
    /// realm-admission checks inert for contexts that cannot resolve
    /// realms (fixtures, partial installations).
    async fn realm(&self, _realm_id: &str) -> LedgerResult<Option<RealmState>> {
        Ok(None)
    }
}

/// Checks an input against current derived state before append.
#[derive(Debug, Default)]
pub struct InvariantGate {
    validator: CommandValidator,
}

impl InvariantGate {
    /// Create a gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run structural validation plus stateful invariant checks.
    ///
    /// # Errors
    ///
    /// `INVALID_EVENT` from structural checks, `INVARIANT_VIOLATION` from
    /// stateful ones.
    pub async fn check(
        &self,
        input: &EventInput,
        ctx: &dyn InvariantContext,
    ) -> LedgerResult<()> {
        self.validator.validate(input)?;

        // Agreements may only activate once every principal consented.
        if input.event_type == event_types::AGREEMENT_ACTIVATED
            && input.aggregate_type == aggregate_types::AGREEMENT
        {
            let state = ctx.agreement(&input.aggregate_id).await?.ok_or_else(|| {
                LedgerError::not_found(format!("agreement {} has no events", input.aggregate_id))
            })?;
            if !state.all_principals_consented() {
                let missing: Vec<String> = state
                    .missing_consents()
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                return Err(LedgerError::invariant_violation(
                    "agreement cannot activate before all principal parties consent",
                )
                .with_detail("missing_consents", serde_json::json!(missing)));
            }
            if state.status.is_terminal() {
                return Err(LedgerError::invariant_violation(format!(
                    "agreement is terminal ({:?}) and cannot activate",
                    state.status
                )));
            }
        }

        // Realms may restrict which entity and agreement types they admit.
        if input.event_type == event_types::ENTITY_CREATED {
            let probe = probe_event(input);
            if let DomainEvent::EntityCreated(p) = DomainEvent::parse(&probe)? {
                if let Some(realm) = ctx.realm(&p.realm_id).await? {
                    let entity_type = serde_json::to_value(p.entity_type)?;
                    let entity_type = entity_type.as_str().unwrap_or("other");
                    if !realm.admits_entity_type(entity_type) {
                        return Err(LedgerError::invariant_violation(format!(
                            "realm {} does not admit {entity_type} entities",
                            p.realm_id
                        )));
                    }
                }
            }
        }
        if input.event_type == event_types::AGREEMENT_PROPOSED {
            let probe = probe_event(input);
            if let DomainEvent::AgreementProposed(p) = DomainEvent::parse(&probe)? {
                if let Some(realm) = ctx.realm(&p.realm_id).await? {
                    if !realm.admits_agreement_type(&p.agreement_type) {
                        return Err(LedgerError::invariant_violation(format!(
                            "realm {} does not admit {} agreements",
                            p.realm_id, p.agreement_type
                        )));
                    }
                }
            }
        }

        // Cross-realm transfers are only permitted through a registered
        // saga, which stamps its id into the event metadata.
        if input.event_type == event_types::ASSET_TRANSFERRED {
            let probe = probe_event(input);
            if let DomainEvent::AssetTransferred(p) = DomainEvent::parse(&probe)? {
                if p.is_cross_realm() {
                    let has_saga = input
                        .metadata
                        .as_ref()
                        .and_then(|m| m.get(SAGA_ID_KEY))
                        .and_then(|v| v.as_str())
                        .is_some_and(|s| !s.is_empty());
                    if !has_saga {
                        return Err(LedgerError::invariant_violation(
                            "cross-realm transfers must run through a saga",
                        )
                        .with_detail("from_realm", serde_json::json!(p.from_realm))
                        .with_detail("to_realm", serde_json::json!(p.to_realm)));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Wrap an input in a throwaway event so the payload union can parse it.
/// Only payload-bearing fields matter to the parse.
fn probe_event(input: &EventInput) -> ubl_core::Event {
    ubl_core::Event {
        id: uuid::Uuid::nil(),
        sequence: 0,
        timestamp: input.timestamp.unwrap_or_else(chrono::Utc::now),
        event_type: input.event_type.clone(),
        aggregate_type: input.aggregate_type.clone(),
        aggregate_id: input.aggregate_id.clone(),
        aggregate_version: input.aggregate_version,
        payload: input.payload.clone(),
        causation: input.causation.clone(),
        actor: input.actor.clone(),
        previous_hash: String::new(),
        hash: String::new(),
        schema_version: input.schema_version,
        metadata: input.metadata.clone(),
    }
}
