// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! ubl-workflow
//!
//! Per-aggregate state machines with guarded transitions, plus a flow
//! orchestrator that composes workflows with decision, parallel, wait, and
//! action steps. Workflow definitions are data — tagged unions of states,
//! transitions, guards, and actor constraints — and every side effect is
//! either an event append or a call through the [`WorkflowServices`]
//! interface.

/// Workflow definitions: states, transitions, guards, actor constraints.
pub mod definition;
/// The transition engine.
pub mod engine;
/// Flow orchestration over workflows.
pub mod flow;
/// Workflow instance state and its rehydrator.
pub mod instance;

use async_trait::async_trait;

use ubl_core::LedgerResult;

pub use definition::{
    ActionDef, ActorConstraint, Guard, GuardCondition, StateDef, TimeoutAction, TimeoutPolicy,
    TransitionDef, WorkflowDefinition,
};
pub use engine::WorkflowEngine;
pub use flow::{
    ErrorHandler, FlowDefinition, FlowInstance, FlowOrchestrator, FlowStatus, FlowStepDef,
    JoinMode, StepKind, WaitCondition,
};
pub use instance::{HistoryEntry, WorkflowInstance, WorkflowRehydrator};

/// Domain lookups and side-effect sinks the engine consumes.
///
/// The engine itself never reads domain aggregates or talks to adapters
/// directly; everything flows through this seam so guards and actions stay
/// testable.
#[async_trait]
pub trait WorkflowServices: Send + Sync {
    /// Current status string of an agreement (`"active"`, …), if it exists.
    async fn agreement_status(&self, agreement_id: &str) -> LedgerResult<Option<String>>;

    /// Current status string of an asset, if it exists.
    async fn asset_status(&self, asset_id: &str) -> LedgerResult<Option<String>>;

    /// Whether consent has been recorded on the agreement — by every
    /// principal (`from_all`) or by at least one.
    async fn consent_given(&self, agreement_id: &str, from_all: bool) -> LedgerResult<bool>;

    /// Whether the holder currently has an active role of the given type.
    async fn has_active_role(&self, holder: &str, role_type: &str) -> LedgerResult<bool>;

    /// Whether the entity is a party to the agreement, optionally in a
    /// specific party role.
    async fn is_agreement_party(
        &self,
        agreement_id: &str,
        entity_id: &str,
        role: Option<&str>,
    ) -> LedgerResult<bool>;

    /// Evaluate a custom guard validator by id.
    async fn custom_guard(
        &self,
        validator_id: &str,
        params: &serde_json::Value,
        instance: &instance::WorkflowInstance,
    ) -> LedgerResult<bool>;

    /// Deliver a notification (escalations, action side effects).
    async fn notify(&self, recipient: &str, message: &str) -> LedgerResult<()>;
}
