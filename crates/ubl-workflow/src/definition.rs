// SPDX-License-Identifier: MIT OR Apache-2.0

//! Workflow definitions: states, transitions, guards, actor constraints.
//!
//! A definition is a static document; nothing here executes. Tagged unions
//! model state/transition/guard variants so definitions can live in
//! configuration as plain JSON.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use ubl_core::{LedgerError, LedgerResult};

/// Who may fire a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActorConstraint {
    /// Any holder of an active role of this type.
    Role {
        /// Required role type.
        role_type: String,
    },
    /// A specific party.
    Party {
        /// The entity id.
        party_id: String,
    },
    /// The installation itself (timers, hooks).
    System,
    /// A party to the target agreement, optionally in a given party role.
    AgreementParty {
        /// Party role within the agreement (e.g. `"employer"`); absent
        /// means any party.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
    },
    /// The entity the workflow targets, acting on itself.
    SelfActor,
}

/// A declarative guard condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuardCondition {
    /// The acting party holds an active role of this type.
    HasRole {
        /// Required role type.
        role_type: String,
    },
    /// Consent recorded on the target agreement.
    HasConsent {
        /// All principals (`true`) or at least one (`false`).
        from_all: bool,
    },
    /// A minimum dwell time since a state was first entered.
    TimeElapsed {
        /// State whose entry time anchors the measurement.
        since_state: String,
        /// Required elapsed time in milliseconds.
        duration_ms: u64,
    },
    /// The referenced asset is in the given status.
    AssetInStatus {
        /// Asset id; absent means the workflow's target aggregate.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        asset_id: Option<String>,
        /// Required status.
        status: String,
    },
    /// The target agreement is in the given status.
    AgreementInStatus {
        /// Required status.
        status: String,
    },
    /// A validator registered on [`crate::WorkflowServices`].
    Custom {
        /// Validator id.
        validator_id: String,
        /// Validator parameters.
        #[serde(default)]
        params: serde_json::Value,
    },
}

/// A named guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Guard {
    /// Name reported on failure.
    pub name: String,
    /// The condition.
    pub condition: GuardCondition,
}

/// A side effect attached to a state or transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionDef {
    /// Append an event on the workflow's target aggregate.
    EmitEvent {
        /// Event type to append.
        event_type: String,
        /// Payload for the event.
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// Send a notification through the services seam.
    Notify {
        /// Recipient entity id.
        recipient: String,
        /// Message body.
        message: String,
    },
    /// Set a workflow variable (recorded in the transition event).
    SetVariable {
        /// Variable name.
        key: String,
        /// Variable value.
        value: serde_json::Value,
    },
}

/// What to do when a state's timeout elapses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Fire the named transition as the system actor.
    AutoTransition {
        /// Transition name.
        transition: String,
    },
    /// Notify a supervisor, once.
    Escalate {
        /// Recipient entity id.
        notify: String,
    },
    /// Complete the instance as expired.
    Expire,
}

/// Declarative state timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TimeoutPolicy {
    /// Dwell time after which the timeout fires.
    pub after_ms: u64,
    /// What firing does.
    pub action: TimeoutAction,
}

/// A state in the machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StateDef {
    /// State name, unique within the definition.
    pub name: String,
    /// Actions on entering the state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_enter: Vec<ActionDef>,
    /// Actions on leaving the state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_exit: Vec<ActionDef>,
    /// Optional dwell timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutPolicy>,
}

/// A guarded transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TransitionDef {
    /// Transition name, unique within the definition.
    pub name: String,
    /// States the transition may fire from.
    pub from: Vec<String>,
    /// State the transition lands in.
    pub to: String,
    /// Who may fire it. Empty allows anyone.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_actors: Vec<ActorConstraint>,
    /// Conditions that must all hold.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards: Vec<Guard>,
    /// Side effects of the transition itself.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionDef>,
    /// Event types appended to the target aggregate when the transition
    /// fires.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emits: Vec<String>,
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    /// Definition id (e.g. `"agreement-approval"`).
    pub id: String,
    /// States.
    pub states: Vec<StateDef>,
    /// Transitions.
    pub transitions: Vec<TransitionDef>,
    /// State every instance starts in.
    pub initial_state: String,
    /// States that complete the instance.
    pub terminal_states: Vec<String>,
}

impl WorkflowDefinition {
    /// Look up a state by name.
    #[must_use]
    pub fn state(&self, name: &str) -> Option<&StateDef> {
        self.states.iter().find(|s| s.name == name)
    }

    /// Find the transition with the given name firable from `from`.
    #[must_use]
    pub fn transition_from(&self, name: &str, from: &str) -> Option<&TransitionDef> {
        self.transitions
            .iter()
            .find(|t| t.name == name && t.from.iter().any(|f| f == from))
    }

    /// Whether a state completes the instance.
    #[must_use]
    pub fn is_terminal(&self, state: &str) -> bool {
        self.terminal_states.iter().any(|s| s == state)
    }

    /// Check internal consistency: the initial state exists, every
    /// transition endpoint exists, terminal states exist, and names are
    /// unique.
    ///
    /// # Errors
    ///
    /// Returns [`ubl_core::ErrorKind::InvalidEvent`] describing the first
    /// inconsistency.
    pub fn validate(&self) -> LedgerResult<()> {
        let state_names: Vec<&str> = self.states.iter().map(|s| s.name.as_str()).collect();
        let mut unique = state_names.clone();
        unique.sort_unstable();
        unique.dedup();
        if unique.len() != state_names.len() {
            return Err(LedgerError::invalid_event(format!(
                "workflow {}: duplicate state names",
                self.id
            )));
        }
        if !state_names.contains(&self.initial_state.as_str()) {
            return Err(LedgerError::invalid_event(format!(
                "workflow {}: unknown initial state {}",
                self.id, self.initial_state
            )));
        }
        for terminal in &self.terminal_states {
            if !state_names.contains(&terminal.as_str()) {
                return Err(LedgerError::invalid_event(format!(
                    "workflow {}: unknown terminal state {terminal}",
                    self.id
                )));
            }
        }
        for transition in &self.transitions {
            for from in &transition.from {
                if !state_names.contains(&from.as_str()) {
                    return Err(LedgerError::invalid_event(format!(
                        "workflow {}: transition {} from unknown state {from}",
                        self.id, transition.name
                    )));
                }
            }
            if !state_names.contains(&transition.to.as_str()) {
                return Err(LedgerError::invalid_event(format!(
                    "workflow {}: transition {} to unknown state {}",
                    self.id, transition.name, transition.to
                )));
            }
        }
        Ok(())
    }
}
