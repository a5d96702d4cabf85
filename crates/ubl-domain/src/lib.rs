// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! ubl-domain
//!
//! The business domain carried by the ledger: realms (tenant boundaries),
//! entities (actors and things), assets, agreements (the source of truth
//! for roles and obligations), and roles. Each aggregate type has a pure
//! rehydrator folding its events into state, plus the invariant gate that
//! guards appends against domain rule violations.

/// Agreement aggregate: parties, consent, status machine.
pub mod agreement;
/// Asset aggregate.
pub mod asset;
/// Entity aggregate.
pub mod entity;
/// Domain invariant gate and command validation.
pub mod invariant;
/// Typed event payloads.
pub mod payload;
/// Realm aggregate.
pub mod realm;
/// Role aggregate and permissions.
pub mod role;

pub use agreement::{
    AgreementParty, AgreementRehydrator, AgreementState, AgreementStatus, AgreementTerms, Consent,
    ConsentMethod, RoleTemplate,
};
pub use asset::{AssetRehydrator, AssetState};
pub use entity::{EntityIdentity, EntityRehydrator, EntityState, EntityType};
pub use invariant::{CommandValidator, InvariantContext, InvariantGate};
pub use payload::DomainEvent;
pub use realm::{IsolationMode, RealmConfig, RealmRehydrator, RealmState};
pub use role::{Permission, RoleRehydrator, RoleState};

/// Aggregate type names used across the workspace.
pub mod aggregate_types {
    /// Tenant boundary aggregate.
    pub const REALM: &str = "Realm";
    /// Actor/thing aggregate.
    pub const ENTITY: &str = "Entity";
    /// Asset aggregate.
    pub const ASSET: &str = "Asset";
    /// Agreement aggregate.
    pub const AGREEMENT: &str = "Agreement";
    /// Role aggregate.
    pub const ROLE: &str = "Role";
    /// Workflow instance aggregate.
    pub const WORKFLOW: &str = "Workflow";
    /// Flow instance aggregate.
    pub const FLOW: &str = "Flow";
    /// Deadline aggregate.
    pub const DEADLINE: &str = "Deadline";
    /// Saga aggregate.
    pub const SAGA: &str = "Saga";
    /// Audit trail aggregate.
    pub const AUDIT: &str = "Audit";
}

/// Event type names used across the workspace.
pub mod event_types {
    /// A realm came into existence.
    pub const REALM_CREATED: &str = "RealmCreated";
    /// An entity came into existence.
    pub const ENTITY_CREATED: &str = "EntityCreated";
    /// An entity's identity changed.
    pub const ENTITY_UPDATED: &str = "EntityUpdated";
    /// An entity was logically deleted.
    pub const ENTITY_DELETED: &str = "EntityDeleted";
    /// An asset came into existence.
    pub const ASSET_CREATED: &str = "AssetCreated";
    /// An asset changed owner (possibly across realms, via saga only).
    pub const ASSET_TRANSFERRED: &str = "AssetTransferred";
    /// An asset's status changed.
    pub const ASSET_STATUS_CHANGED: &str = "AssetStatusChanged";
    /// An agreement was proposed among parties.
    pub const AGREEMENT_PROPOSED: &str = "AgreementProposed";
    /// A party recorded consent on an agreement.
    pub const CONSENT_RECORDED: &str = "ConsentRecorded";
    /// An agreement entered review.
    pub const AGREEMENT_UNDER_REVIEW: &str = "AgreementUnderReview";
    /// An agreement became active.
    pub const AGREEMENT_ACTIVATED: &str = "AgreementActivated";
    /// An agreement was fulfilled.
    pub const AGREEMENT_FULFILLED: &str = "AgreementFulfilled";
    /// An agreement was breached.
    pub const AGREEMENT_BREACHED: &str = "AgreementBreached";
    /// An agreement was terminated.
    pub const AGREEMENT_TERMINATED: &str = "AgreementTerminated";
    /// An agreement expired.
    pub const AGREEMENT_EXPIRED: &str = "AgreementExpired";
    /// A role was granted, established by an agreement.
    pub const ROLE_GRANTED: &str = "RoleGranted";
    /// A role was revoked.
    pub const ROLE_REVOKED: &str = "RoleRevoked";
    /// An authorization decision was recorded.
    pub const ACCESS_EVALUATED: &str = "AccessEvaluated";
    /// A workflow instance started.
    pub const WORKFLOW_STARTED: &str = "WorkflowStarted";
    /// A workflow instance transitioned between states.
    pub const WORKFLOW_TRANSITIONED: &str = "WorkflowTransitioned";
    /// A workflow instance reached a terminal state.
    pub const WORKFLOW_COMPLETED: &str = "WorkflowCompleted";
    /// A workflow state timeout escalated to a supervisor.
    pub const WORKFLOW_ESCALATED: &str = "WorkflowEscalated";
    /// A flow instance started.
    pub const FLOW_STARTED: &str = "FlowStarted";
    /// A flow step finished.
    pub const FLOW_STEP_COMPLETED: &str = "FlowStepCompleted";
    /// A flow suspended on a wait condition.
    pub const FLOW_WAITING: &str = "FlowWaiting";
    /// A flow finished successfully.
    pub const FLOW_COMPLETED: &str = "FlowCompleted";
    /// A flow failed.
    pub const FLOW_FAILED: &str = "FlowFailed";
    /// A deadline was scheduled.
    pub const DEADLINE_SCHEDULED: &str = "DeadlineScheduled";
    /// A deadline stage fired.
    pub const DEADLINE_TRIGGERED: &str = "DeadlineTriggered";
    /// A scheduled task fired.
    pub const TASK_TRIGGERED: &str = "TaskTriggered";
    /// A saga began executing.
    pub const SAGA_STARTED: &str = "SagaStarted";
    /// A saga step completed.
    pub const SAGA_STEP_COMPLETED: &str = "SagaStepCompleted";
    /// A saga finished successfully.
    pub const SAGA_COMPLETED: &str = "SagaCompleted";
    /// A saga step failed.
    pub const SAGA_FAILED: &str = "SagaFailed";
    /// A saga's completed steps were compensated.
    pub const SAGA_COMPENSATED: &str = "SagaCompensated";
}
