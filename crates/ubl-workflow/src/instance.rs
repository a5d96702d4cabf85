// SPDX-License-Identifier: MIT OR Apache-2.0

//! Workflow instance state and its rehydrator.
//!
//! An instance is an aggregate like any other: `WorkflowStarted`,
//! `WorkflowTransitioned`, `WorkflowEscalated`, and `WorkflowCompleted`
//! events fold into the state below.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ubl_aggregate::Rehydrator;
use ubl_core::{ActorRef, Event};
use ubl_domain::{aggregate_types, event_types};

/// One fired transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Transition name.
    pub transition: String,
    /// State left.
    pub from: String,
    /// State entered.
    pub to: String,
    /// Who fired it.
    pub actor: ActorRef,
    /// When it fired.
    pub at: DateTime<Utc>,
}

/// Folded state of a workflow instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Instance identifier (the aggregate id).
    pub id: String,
    /// Definition the instance runs.
    pub definition_id: String,
    /// Aggregate type the workflow operates on.
    pub target_type: String,
    /// Aggregate instance the workflow operates on.
    pub target_id: String,
    /// Current state name.
    pub current_state: String,
    /// Fired transitions, oldest first.
    pub history: Vec<HistoryEntry>,
    /// Whether a terminal state was reached.
    pub is_complete: bool,
    /// When the current state was entered.
    pub state_entered_at: Option<DateTime<Utc>>,
    /// First entry time per state, for dwell-time guards.
    pub entered_states: BTreeMap<String, DateTime<Utc>>,
    /// Variables set by actions.
    pub variables: BTreeMap<String, serde_json::Value>,
    /// States whose timeout already escalated.
    pub escalated_states: Vec<String>,
    /// Number of events folded.
    pub version: u64,
}

impl WorkflowInstance {
    /// When `state` was first entered, if ever.
    #[must_use]
    pub fn entered_at(&self, state: &str) -> Option<DateTime<Utc>> {
        self.entered_states.get(state).copied()
    }
}

/// Rehydrator for workflow instances.
#[derive(Debug, Default)]
pub struct WorkflowRehydrator;

impl Rehydrator for WorkflowRehydrator {
    type State = WorkflowInstance;

    fn aggregate_type(&self) -> &str {
        aggregate_types::WORKFLOW
    }

    fn version(&self) -> u32 {
        1
    }

    fn initial_state(&self) -> WorkflowInstance {
        WorkflowInstance::default()
    }

    fn apply(&self, mut state: WorkflowInstance, event: &Event) -> WorkflowInstance {
        match event.event_type.as_str() {
            event_types::WORKFLOW_STARTED => {
                state.id = event.aggregate_id.clone();
                state.definition_id = event.payload["definition_id"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                state.target_type = event.payload["target_type"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                state.target_id = event.payload["target_id"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                state.current_state = event.payload["initial_state"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                state.state_entered_at = Some(event.timestamp);
                state
                    .entered_states
                    .insert(state.current_state.clone(), event.timestamp);
            }
            event_types::WORKFLOW_TRANSITIONED => {
                let from = event.payload["from"].as_str().unwrap_or_default().to_string();
                let to = event.payload["to"].as_str().unwrap_or_default().to_string();
                state.history.push(HistoryEntry {
                    transition: event.payload["transition"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    from,
                    to: to.clone(),
                    actor: event.actor.clone(),
                    at: event.timestamp,
                });
                state.current_state = to.clone();
                state.state_entered_at = Some(event.timestamp);
                state.entered_states.entry(to).or_insert(event.timestamp);
                if let Some(vars) = event.payload["variables"].as_object() {
                    for (k, v) in vars {
                        state.variables.insert(k.clone(), v.clone());
                    }
                }
            }
            event_types::WORKFLOW_ESCALATED => {
                if let Some(s) = event.payload["state"].as_str() {
                    state.escalated_states.push(s.to_string());
                }
            }
            event_types::WORKFLOW_COMPLETED => {
                if let Some(final_state) = event.payload["final_state"].as_str() {
                    state.current_state = final_state.to_string();
                }
                state.is_complete = true;
            }
            _ => {}
        }
        state.version = event.aggregate_version;
        state
    }
}
