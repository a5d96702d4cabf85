// SPDX-License-Identifier: MIT OR Apache-2.0

//! Agreement aggregate: parties, consent, status machine.
//!
//! Agreements are the source of truth for roles: activating one triggers
//! the agreement→role hook, and a role stays active only while its
//! establishing agreement has not been invalidated.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use ubl_aggregate::Rehydrator;
use ubl_core::scope::Scope;
use ubl_core::{Event, Validity};

use crate::payload::DomainEvent;
use crate::role::Permission;

/// Lifecycle status of an agreement.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum AgreementStatus {
    /// Being drafted; not yet visible to counterparties.
    #[default]
    Draft,
    /// Proposed to the parties.
    Proposed,
    /// Under review.
    UnderReview,
    /// In force.
    Active,
    /// All obligations met.
    Fulfilled,
    /// A party failed its obligations.
    Breached,
    /// Ended early by the parties.
    Terminated,
    /// Validity window elapsed.
    Expired,
}

impl AgreementStatus {
    /// Whether this status invalidates roles the agreement established.
    #[must_use]
    pub fn invalidates_roles(&self) -> bool {
        matches!(self, Self::Terminated | Self::Expired | Self::Breached)
    }

    /// Whether the agreement can still change status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Fulfilled | Self::Breached | Self::Terminated | Self::Expired
        )
    }
}

/// How a party attested consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConsentMethod {
    /// Click-through or API attestation.
    Digital,
    /// Wet or cryptographic signature.
    Signature,
    /// Implied by the agreement type's own declaration (opt-in only).
    Implicit,
    /// Spoken, witnessed.
    Verbal,
}

/// A timestamped, method-tagged attestation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Consent {
    /// When consent was given.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    #[schemars(with = "i64")]
    pub given_at: DateTime<Utc>,
    /// How consent was attested.
    pub method: ConsentMethod,
}

/// A party to an agreement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgreementParty {
    /// Entity acting as this party.
    pub entity_id: String,
    /// The party's role in the agreement (e.g. `"employer"`).
    pub role: String,
    /// Witnesses attest but are not bound.
    #[serde(default)]
    pub is_witness: bool,
    /// Supervisors oversee but are not bound.
    #[serde(default)]
    pub is_supervisor: bool,
    /// Consent, once given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consent: Option<Consent>,
    /// What the party must do.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub obligations: Vec<String>,
    /// What the party may do.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rights: Vec<String>,
}

impl AgreementParty {
    /// A principal is bound by the agreement: neither witness nor
    /// supervisor. Only principals must consent before activation.
    #[must_use]
    pub fn is_principal(&self) -> bool {
        !self.is_witness && !self.is_supervisor
    }
}

/// A role to be granted to a party when the agreement activates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RoleTemplate {
    /// Stable template identifier, used for grant idempotency.
    pub template_id: String,
    /// Role type to grant.
    pub role_type: String,
    /// Which party role receives the grant (matches
    /// [`AgreementParty::role`]).
    pub party_role: String,
    /// Permissions the granted role carries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<Permission>,
    /// Where the granted role applies.
    pub scope: Scope,
    /// Validity of the granted role; absent follows the agreement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity: Option<Validity>,
}

/// Agreement terms: role templates plus free-form clauses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgreementTerms {
    /// Roles granted on activation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub role_templates: Vec<RoleTemplate>,
    /// Whether the proposing owner party consents implicitly at proposal
    /// time. Opt-in per agreement type.
    #[serde(default)]
    pub auto_consent_owner: bool,
    /// Everything else the agreement says.
    #[serde(flatten)]
    pub clauses: std::collections::BTreeMap<String, serde_json::Value>,
}

/// One status change, with its event time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    /// The status entered.
    pub status: AgreementStatus,
    /// When it was entered.
    pub at: DateTime<Utc>,
}

/// Folded state of an agreement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgreementState {
    /// Agreement identifier (the aggregate id).
    pub id: String,
    /// Realm the agreement belongs to.
    pub realm_id: String,
    /// Kind of agreement.
    pub agreement_type: String,
    /// Current status.
    pub status: AgreementStatus,
    /// The parties.
    pub parties: Vec<AgreementParty>,
    /// Assets governed.
    pub assets: Vec<String>,
    /// Terms.
    pub terms: AgreementTerms,
    /// Effective window.
    pub validity: Option<Validity>,
    /// Every status entered, in order.
    pub status_changes: Vec<StatusChange>,
}

impl AgreementState {
    /// The parties bound by the agreement.
    pub fn principals(&self) -> impl Iterator<Item = &AgreementParty> {
        self.parties.iter().filter(|p| p.is_principal())
    }

    /// Whether every principal has consented — the precondition for
    /// activation.
    #[must_use]
    pub fn all_principals_consented(&self) -> bool {
        self.principals().all(|p| p.consent.is_some())
    }

    /// Principals that have not yet consented.
    #[must_use]
    pub fn missing_consents(&self) -> Vec<&str> {
        self.principals()
            .filter(|p| p.consent.is_none())
            .map(|p| p.entity_id.as_str())
            .collect()
    }

    /// Whether the agreement was ever `Active` at or before `at`.
    #[must_use]
    pub fn was_active_by(&self, at: DateTime<Utc>) -> bool {
        self.status_changes
            .iter()
            .any(|c| c.status == AgreementStatus::Active && c.at <= at)
    }

    /// The earliest time the agreement entered a role-invalidating status,
    /// if it ever did.
    #[must_use]
    pub fn invalidated_at(&self) -> Option<DateTime<Utc>> {
        self.status_changes
            .iter()
            .find(|c| c.status.invalidates_roles())
            .map(|c| c.at)
    }
}

/// Rehydrator for the agreement aggregate.
#[derive(Debug, Default)]
pub struct AgreementRehydrator;

impl AgreementRehydrator {
    fn set_status(state: &mut AgreementState, status: AgreementStatus, at: DateTime<Utc>) {
        state.status = status;
        state.status_changes.push(StatusChange { status, at });
    }
}

impl Rehydrator for AgreementRehydrator {
    type State = AgreementState;

    fn aggregate_type(&self) -> &str {
        crate::aggregate_types::AGREEMENT
    }

    fn version(&self) -> u32 {
        1
    }

    fn initial_state(&self) -> AgreementState {
        AgreementState::default()
    }

    fn apply(&self, mut state: AgreementState, event: &Event) -> AgreementState {
        match DomainEvent::parse(event) {
            Ok(DomainEvent::AgreementProposed(p)) => {
                state.id = event.aggregate_id.clone();
                state.realm_id = p.realm_id;
                state.agreement_type = p.agreement_type;
                state.parties = p.parties;
                state.assets = p.assets;
                state.terms = p.terms;
                state.validity = p.validity;
                Self::set_status(&mut state, AgreementStatus::Proposed, event.timestamp);

                // Implicit owner consent is opt-in per agreement type; the
                // proposing party is the first principal.
                if state.terms.auto_consent_owner {
                    if let Some(owner_id) = event.actor.party_id().map(str::to_string) {
                        if let Some(party) = state
                            .parties
                            .iter_mut()
                            .find(|p| p.entity_id == owner_id && p.is_principal())
                        {
                            party.consent = Some(Consent {
                                given_at: event.timestamp,
                                method: ConsentMethod::Implicit,
                            });
                        }
                    }
                }
            }
            Ok(DomainEvent::ConsentRecorded(p)) => {
                if let Some(party) = state.parties.iter_mut().find(|q| q.entity_id == p.party_id)
                {
                    party.consent = Some(Consent {
                        given_at: event.timestamp,
                        method: p.method,
                    });
                }
            }
            Ok(DomainEvent::AgreementUnderReview) => {
                Self::set_status(&mut state, AgreementStatus::UnderReview, event.timestamp);
            }
            Ok(DomainEvent::AgreementActivated) => {
                Self::set_status(&mut state, AgreementStatus::Active, event.timestamp);
            }
            Ok(DomainEvent::AgreementFulfilled) => {
                Self::set_status(&mut state, AgreementStatus::Fulfilled, event.timestamp);
            }
            Ok(DomainEvent::AgreementBreached) => {
                Self::set_status(&mut state, AgreementStatus::Breached, event.timestamp);
            }
            Ok(DomainEvent::AgreementTerminated) => {
                Self::set_status(&mut state, AgreementStatus::Terminated, event.timestamp);
            }
            Ok(DomainEvent::AgreementExpired) => {
                Self::set_status(&mut state, AgreementStatus::Expired, event.timestamp);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    target: "ubl.domain",
                    event_id = %event.id,
                    error = %e,
                    "skipping malformed agreement event"
                );
            }
        }
        state
    }
}
