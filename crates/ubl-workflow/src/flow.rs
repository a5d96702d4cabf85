// SPDX-License-Identifier: MIT OR Apache-2.0

//! Flow orchestration over workflows.
//!
//! A flow composes workflows and imperative steps. Execution is
//! cooperative: a step either completes synchronously and the flow
//! proceeds, or the flow parks in `Waiting` with an explicit wake
//! condition (timer, event match, polled condition, or a join over child
//! workflows). Every pause point is woken by feeding events
//! ([`FlowOrchestrator::on_event`]) or ticks ([`FlowOrchestrator::tick`]),
//! which keeps suspension testable.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use ubl_core::{ActorRef, Event, EventInputBuilder, LedgerError, LedgerResult};
use ubl_domain::{aggregate_types, event_types};
use ubl_store::EventStore;

use crate::engine::WorkflowEngine;

/// How a parallel step's branches join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Wait for every branch.
    All,
    /// Wait for at least one branch.
    Any,
    /// Wait for the first branch; record which one won.
    First,
}

/// A workflow to spawn from a flow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowSpawn {
    /// Workflow definition to start.
    pub definition_id: String,
    /// Target aggregate type.
    pub target_type: String,
    /// Target aggregate id.
    pub target_id: String,
}

/// A decision branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Branch {
    /// Variable inspected.
    pub variable: String,
    /// Value that selects this branch.
    pub equals: serde_json::Value,
    /// Step id to jump to.
    pub goto: String,
}

/// What a flow waits on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitCondition {
    /// A fixed delay.
    Duration {
        /// Milliseconds to wait.
        ms: u64,
    },
    /// An event of this type (optionally on a specific aggregate).
    Event {
        /// Event type to wait for.
        event_type: String,
        /// Aggregate id filter.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aggregate_id: Option<String>,
    },
    /// A flow variable reaching a value, checked on each tick.
    Condition {
        /// Variable inspected.
        variable: String,
        /// Value that releases the wait.
        equals: serde_json::Value,
    },
}

/// An imperative flow action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowAction {
    /// Set a flow variable.
    SetVariable {
        /// Variable name.
        key: String,
        /// Variable value.
        value: serde_json::Value,
    },
    /// Append an event on an arbitrary aggregate.
    EmitEvent {
        /// Event type.
        event_type: String,
        /// Target aggregate type.
        aggregate_type: String,
        /// Target aggregate id.
        aggregate_id: String,
        /// Payload.
        #[serde(default)]
        payload: serde_json::Value,
    },
}

/// Step variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Start a workflow and wait for it to complete.
    Workflow {
        /// The workflow to run.
        #[serde(flatten)]
        spawn: WorkflowSpawn,
    },
    /// Jump to a branch based on flow variables.
    Decision {
        /// Branches, first match wins.
        branches: Vec<Branch>,
        /// Step id when no branch matches; absent proceeds in order.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    /// Start several workflows and join.
    Parallel {
        /// Workflows to run concurrently.
        workflows: Vec<WorkflowSpawn>,
        /// Join mode.
        join: JoinMode,
    },
    /// Suspend until a condition releases.
    Wait {
        /// The wait condition.
        condition: WaitCondition,
    },
    /// Run imperative actions.
    Action {
        /// Actions, in order.
        actions: Vec<FlowAction>,
    },
}

/// A step with its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowStepDef {
    /// Step id, unique within the flow.
    pub id: String,
    /// What the step does.
    #[serde(flatten)]
    pub kind: StepKind,
}

/// What to do when a step fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorHandler {
    /// Re-execute the step up to this many times.
    Retry {
        /// Maximum retries.
        max_retries: u32,
    },
    /// Run a named compensation step, then fail.
    Compensate {
        /// Step id to run as compensation.
        step: String,
    },
    /// Ignore the failure and proceed.
    Skip,
    /// Fail the flow.
    Fail,
}

/// A flow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowDefinition {
    /// Flow id.
    pub id: String,
    /// Steps, executed in order unless a decision jumps.
    pub steps: Vec<FlowStepDef>,
    /// Per-step error handlers; steps without one fail the flow.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub error_handlers: BTreeMap<String, ErrorHandler>,
}

impl FlowDefinition {
    fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }
}

/// Flow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Executing steps.
    Running,
    /// Parked on a wake condition.
    Waiting,
    /// Finished successfully.
    Completed,
    /// Failed (possibly after compensation).
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

/// A child workflow being tracked by a join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveWorkflow {
    /// Workflow instance id.
    pub workflow_id: String,
    /// Whether it has completed.
    pub complete: bool,
}

/// The wake condition a waiting flow parked on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WaitState {
    /// Wake when `tick(now)` passes this instant.
    Until(DateTime<Utc>),
    /// Wake on a matching event.
    Event {
        /// Event type to match.
        event_type: String,
        /// Optional aggregate filter.
        aggregate_id: Option<String>,
    },
    /// Wake when the variable reaches the value (polled).
    Condition {
        /// Variable inspected.
        variable: String,
        /// Releasing value.
        equals: serde_json::Value,
    },
    /// Wake when the join over [`FlowInstance::active_workflows`] is
    /// satisfied.
    Join {
        /// Join mode.
        mode: JoinMode,
    },
}

/// One executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowHistoryEntry {
    /// Step id.
    pub step_id: String,
    /// `"completed"`, `"skipped"`, `"failed"`, or `"compensated"`.
    pub outcome: String,
    /// When it was recorded.
    pub at: DateTime<Utc>,
}

/// A flow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInstance {
    /// Instance id.
    pub id: String,
    /// Definition the instance runs.
    pub definition_id: String,
    /// Lifecycle status.
    pub status: FlowStatus,
    /// Index of the step being executed or waited on.
    pub current_step: usize,
    /// Child workflows tracked by the current join.
    pub active_workflows: Vec<ActiveWorkflow>,
    /// Flow variables.
    pub variables: BTreeMap<String, serde_json::Value>,
    /// Executed steps.
    pub history: Vec<FlowHistoryEntry>,
    /// Wake condition while `Waiting`.
    pub wait: Option<WaitState>,
    /// Retries used per step id.
    pub retries: BTreeMap<String, u32>,
    /// Versions consumed on the flow's audit aggregate.
    event_version: u64,
}

/// Orchestrates flows over the workflow engine.
pub struct FlowOrchestrator {
    store: Arc<dyn EventStore>,
    engine: Arc<WorkflowEngine>,
    definitions: RwLock<HashMap<String, Arc<FlowDefinition>>>,
    instances: RwLock<HashMap<String, FlowInstance>>,
}

impl std::fmt::Debug for FlowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let instances = self.instances.read().expect("flow registry poisoned");
        f.debug_struct("FlowOrchestrator")
            .field("instances", &instances.len())
            .finish_non_exhaustive()
    }
}

enum Advance {
    Next,
    Goto(String),
    Park(WaitState),
}

impl FlowOrchestrator {
    /// Wire an orchestrator over the store and workflow engine.
    pub fn new(store: Arc<dyn EventStore>, engine: Arc<WorkflowEngine>) -> Self {
        Self {
            store,
            engine,
            definitions: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Register a flow definition.
    pub fn register(&self, definition: FlowDefinition) {
        self.definitions
            .write()
            .expect("flow definitions poisoned")
            .insert(definition.id.clone(), Arc::new(definition));
    }

    /// A snapshot of an instance.
    #[must_use]
    pub fn instance(&self, flow_id: &str) -> Option<FlowInstance> {
        self.instances
            .read()
            .expect("flow registry poisoned")
            .get(flow_id)
            .cloned()
    }

    /// Start a flow and run it until it parks or finishes.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` for unknown definitions; store errors otherwise.
    pub async fn start(
        &self,
        definition_id: &str,
        variables: BTreeMap<String, serde_json::Value>,
    ) -> LedgerResult<String> {
        let definition = self.definition(definition_id)?;
        let flow_id = format!("flow-{}", ubl_core::new_event_id());

        let instance = FlowInstance {
            id: flow_id.clone(),
            definition_id: definition.id.clone(),
            status: FlowStatus::Running,
            current_step: 0,
            active_workflows: Vec::new(),
            variables,
            history: Vec::new(),
            wait: None,
            retries: BTreeMap::new(),
            event_version: 0,
        };
        self.instances
            .write()
            .expect("flow registry poisoned")
            .insert(flow_id.clone(), instance);

        self.append_flow_event(
            &flow_id,
            event_types::FLOW_STARTED,
            serde_json::json!({"definition_id": definition.id}),
        )
        .await?;
        self.run(&flow_id).await?;
        Ok(flow_id)
    }

    /// Cancel a running or waiting flow.
    pub fn cancel(&self, flow_id: &str) {
        if let Some(instance) = self
            .instances
            .write()
            .expect("flow registry poisoned")
            .get_mut(flow_id)
        {
            if matches!(instance.status, FlowStatus::Running | FlowStatus::Waiting) {
                instance.status = FlowStatus::Cancelled;
                instance.wait = None;
            }
        }
    }

    /// Feed an event to waiting flows. Wakes event waits and join waits.
    ///
    /// # Errors
    ///
    /// Propagates store errors from resumed execution.
    pub async fn on_event(&self, event: &Event) -> LedgerResult<()> {
        let mut to_resume = Vec::new();
        {
            let mut instances = self.instances.write().expect("flow registry poisoned");
            for (id, instance) in instances.iter_mut() {
                if instance.status != FlowStatus::Waiting {
                    continue;
                }
                match instance.wait.clone() {
                    Some(WaitState::Event {
                        event_type,
                        aggregate_id,
                    }) => {
                        let type_match = event_type == event.event_type;
                        let agg_match = aggregate_id
                            .as_deref()
                            .is_none_or(|a| a == event.aggregate_id);
                        if type_match && agg_match {
                            to_resume.push(id.clone());
                        }
                    }
                    Some(WaitState::Join { mode }) => {
                        if event.event_type == event_types::WORKFLOW_COMPLETED {
                            let mut changed = false;
                            for active in &mut instance.active_workflows {
                                if active.workflow_id == event.aggregate_id {
                                    active.complete = true;
                                    changed = true;
                                }
                            }
                            if changed && join_satisfied(mode, &instance.active_workflows) {
                                to_resume.push(id.clone());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        for id in to_resume {
            self.wake(&id).await?;
        }
        Ok(())
    }

    /// Advance time: wake duration waits and poll condition waits.
    ///
    /// # Errors
    ///
    /// Propagates store errors from resumed execution.
    pub async fn tick(&self, now: DateTime<Utc>) -> LedgerResult<u32> {
        let mut to_resume = Vec::new();
        {
            let instances = self.instances.read().expect("flow registry poisoned");
            for (id, instance) in instances.iter() {
                if instance.status != FlowStatus::Waiting {
                    continue;
                }
                let wake = match &instance.wait {
                    Some(WaitState::Until(deadline)) => now >= *deadline,
                    Some(WaitState::Condition { variable, equals }) => {
                        instance.variables.get(variable) == Some(equals)
                    }
                    _ => false,
                };
                if wake {
                    to_resume.push(id.clone());
                }
            }
        }
        let woken = to_resume.len() as u32;
        for id in to_resume {
            self.wake(&id).await?;
        }
        Ok(woken)
    }

    fn definition(&self, id: &str) -> LedgerResult<Arc<FlowDefinition>> {
        self.definitions
            .read()
            .expect("flow definitions poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found(format!("flow definition {id}")))
    }

    async fn wake(&self, flow_id: &str) -> LedgerResult<()> {
        {
            let mut instances = self.instances.write().expect("flow registry poisoned");
            let Some(instance) = instances.get_mut(flow_id) else {
                return Ok(());
            };
            if instance.status != FlowStatus::Waiting {
                return Ok(());
            }
            let step_id = self
                .definition(&instance.definition_id)
                .ok()
                .and_then(|d| d.steps.get(instance.current_step).map(|s| s.id.clone()));
            instance.status = FlowStatus::Running;
            instance.wait = None;
            instance.active_workflows.clear();
            self.record_history(instance, step_id.as_deref(), "completed");
            instance.current_step += 1;
        }
        self.run(flow_id).await
    }

    /// The cooperative execution loop: execute steps until the flow parks,
    /// completes, or fails.
    async fn run(&self, flow_id: &str) -> LedgerResult<()> {
        loop {
            let (definition, step_index) = {
                let instances = self.instances.read().expect("flow registry poisoned");
                let Some(instance) = instances.get(flow_id) else {
                    return Ok(());
                };
                if instance.status != FlowStatus::Running {
                    return Ok(());
                }
                (self.definition(&instance.definition_id)?, instance.current_step)
            };

            if step_index >= definition.steps.len() {
                self.finish(flow_id, FlowStatus::Completed).await?;
                return Ok(());
            }
            let step = definition.steps[step_index].clone();

            match self.execute_step(flow_id, &step).await {
                Ok(Advance::Next) => {
                    let mut instances = self.instances.write().expect("flow registry poisoned");
                    if let Some(instance) = instances.get_mut(flow_id) {
                        self.record_history(instance, Some(&step.id), "completed");
                        instance.current_step += 1;
                    }
                }
                Ok(Advance::Goto(target)) => {
                    let Some(target_index) = definition.step_index(&target) else {
                        self.fail(flow_id, &step.id, "decision jumped to unknown step")
                            .await?;
                        return Ok(());
                    };
                    let mut instances = self.instances.write().expect("flow registry poisoned");
                    if let Some(instance) = instances.get_mut(flow_id) {
                        self.record_history(instance, Some(&step.id), "completed");
                        instance.current_step = target_index;
                    }
                }
                Ok(Advance::Park(wait)) => {
                    {
                        let mut instances =
                            self.instances.write().expect("flow registry poisoned");
                        if let Some(instance) = instances.get_mut(flow_id) {
                            instance.status = FlowStatus::Waiting;
                            instance.wait = Some(wait);
                        }
                    }
                    self.append_flow_event(
                        flow_id,
                        event_types::FLOW_WAITING,
                        serde_json::json!({"step_id": step.id}),
                    )
                    .await?;
                    return Ok(());
                }
                Err(error) => {
                    if !self.handle_step_error(flow_id, &definition, &step, &error).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns `true` when the flow should keep running.
    async fn handle_step_error(
        &self,
        flow_id: &str,
        definition: &FlowDefinition,
        step: &FlowStepDef,
        error: &LedgerError,
    ) -> LedgerResult<bool> {
        let handler = definition
            .error_handlers
            .get(&step.id)
            .cloned()
            .unwrap_or(ErrorHandler::Fail);
        tracing::warn!(
            target: "ubl.flow",
            flow = %flow_id,
            step = %step.id,
            error = %error,
            handler = ?handler,
            "flow step failed"
        );
        match handler {
            ErrorHandler::Retry { max_retries } => {
                let mut instances = self.instances.write().expect("flow registry poisoned");
                if let Some(instance) = instances.get_mut(flow_id) {
                    let used = instance.retries.entry(step.id.clone()).or_insert(0);
                    if *used < max_retries {
                        *used += 1;
                        return Ok(true);
                    }
                }
                drop(instances);
                self.fail(flow_id, &step.id, &error.to_string()).await?;
                Ok(false)
            }
            ErrorHandler::Skip => {
                let mut instances = self.instances.write().expect("flow registry poisoned");
                if let Some(instance) = instances.get_mut(flow_id) {
                    self.record_history(instance, Some(&step.id), "skipped");
                    instance.current_step += 1;
                }
                Ok(true)
            }
            ErrorHandler::Compensate { step: comp_id } => {
                if let Some(comp) = definition.steps.iter().find(|s| s.id == comp_id).cloned() {
                    // Best effort: a failing compensation still fails the
                    // flow, with the original error.
                    let _ = self.execute_step(flow_id, &comp).await;
                    let mut instances = self.instances.write().expect("flow registry poisoned");
                    if let Some(instance) = instances.get_mut(flow_id) {
                        self.record_history(instance, Some(&comp_id), "compensated");
                    }
                }
                self.fail(flow_id, &step.id, &error.to_string()).await?;
                Ok(false)
            }
            ErrorHandler::Fail => {
                self.fail(flow_id, &step.id, &error.to_string()).await?;
                Ok(false)
            }
        }
    }

    async fn execute_step(&self, flow_id: &str, step: &FlowStepDef) -> LedgerResult<Advance> {
        match &step.kind {
            StepKind::Action { actions } => {
                for action in actions {
                    match action {
                        FlowAction::SetVariable { key, value } => {
                            let mut instances =
                                self.instances.write().expect("flow registry poisoned");
                            if let Some(instance) = instances.get_mut(flow_id) {
                                instance.variables.insert(key.clone(), value.clone());
                            }
                        }
                        FlowAction::EmitEvent {
                            event_type,
                            aggregate_type,
                            aggregate_id,
                            payload,
                        } => {
                            let latest = self
                                .store
                                .get_latest(aggregate_type, aggregate_id)
                                .await?;
                            let version = latest.map_or(1, |e| e.aggregate_version + 1);
                            self.store
                                .append(
                                    EventInputBuilder::new(
                                        event_type,
                                        aggregate_type,
                                        aggregate_id,
                                    )
                                    .version(version)
                                    .payload(payload.clone())
                                    .actor(ActorRef::workflow(flow_id))
                                    .build(),
                                )
                                .await?;
                        }
                    }
                }
                Ok(Advance::Next)
            }
            StepKind::Decision { branches, default } => {
                let instances = self.instances.read().expect("flow registry poisoned");
                let instance = instances
                    .get(flow_id)
                    .ok_or_else(|| LedgerError::not_found("flow instance"))?;
                for branch in branches {
                    if instance.variables.get(&branch.variable) == Some(&branch.equals) {
                        return Ok(Advance::Goto(branch.goto.clone()));
                    }
                }
                match default {
                    Some(goto) => Ok(Advance::Goto(goto.clone())),
                    None => Ok(Advance::Next),
                }
            }
            StepKind::Wait { condition } => Ok(Advance::Park(match condition {
                WaitCondition::Duration { ms } => {
                    WaitState::Until(Utc::now() + chrono::Duration::milliseconds(*ms as i64))
                }
                WaitCondition::Event {
                    event_type,
                    aggregate_id,
                } => WaitState::Event {
                    event_type: event_type.clone(),
                    aggregate_id: aggregate_id.clone(),
                },
                WaitCondition::Condition { variable, equals } => WaitState::Condition {
                    variable: variable.clone(),
                    equals: equals.clone(),
                },
            })),
            StepKind::Workflow { spawn } => {
                let started = self
                    .engine
                    .start(
                        &spawn.definition_id,
                        &spawn.target_type,
                        &spawn.target_id,
                        ActorRef::workflow(flow_id),
                    )
                    .await?;
                let mut instances = self.instances.write().expect("flow registry poisoned");
                if let Some(instance) = instances.get_mut(flow_id) {
                    instance.active_workflows = vec![ActiveWorkflow {
                        workflow_id: started.id,
                        complete: false,
                    }];
                }
                Ok(Advance::Park(WaitState::Join { mode: JoinMode::All }))
            }
            StepKind::Parallel { workflows, join } => {
                let mut active = Vec::new();
                for spawn in workflows {
                    let started = self
                        .engine
                        .start(
                            &spawn.definition_id,
                            &spawn.target_type,
                            &spawn.target_id,
                            ActorRef::workflow(flow_id),
                        )
                        .await?;
                    active.push(ActiveWorkflow {
                        workflow_id: started.id,
                        complete: false,
                    });
                }
                let mut instances = self.instances.write().expect("flow registry poisoned");
                if let Some(instance) = instances.get_mut(flow_id) {
                    instance.active_workflows = active;
                }
                Ok(Advance::Park(WaitState::Join { mode: *join }))
            }
        }
    }

    fn record_history(&self, instance: &mut FlowInstance, step_id: Option<&str>, outcome: &str) {
        let Some(step_id) = step_id else { return };
        instance.history.push(FlowHistoryEntry {
            step_id: step_id.to_string(),
            outcome: outcome.to_string(),
            at: Utc::now(),
        });
    }

    async fn finish(&self, flow_id: &str, status: FlowStatus) -> LedgerResult<()> {
        {
            let mut instances = self.instances.write().expect("flow registry poisoned");
            if let Some(instance) = instances.get_mut(flow_id) {
                instance.status = status;
            }
        }
        self.append_flow_event(flow_id, event_types::FLOW_COMPLETED, serde_json::json!({}))
            .await
    }

    async fn fail(&self, flow_id: &str, step_id: &str, message: &str) -> LedgerResult<()> {
        {
            let mut instances = self.instances.write().expect("flow registry poisoned");
            if let Some(instance) = instances.get_mut(flow_id) {
                instance.status = FlowStatus::Failed;
                self.record_history(instance, Some(step_id), "failed");
            }
        }
        self.append_flow_event(
            flow_id,
            event_types::FLOW_FAILED,
            serde_json::json!({"step_id": step_id, "error": message}),
        )
        .await
    }

    async fn append_flow_event(
        &self,
        flow_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> LedgerResult<()> {
        let version = {
            let mut instances = self.instances.write().expect("flow registry poisoned");
            let Some(instance) = instances.get_mut(flow_id) else {
                return Ok(());
            };
            instance.event_version += 1;
            instance.event_version
        };
        self.store
            .append(
                EventInputBuilder::new(event_type, aggregate_types::FLOW, flow_id)
                    .version(version)
                    .payload(payload)
                    .actor(ActorRef::system_component("ledger", "flow"))
                    .build(),
            )
            .await?;
        Ok(())
    }
}

fn join_satisfied(mode: JoinMode, active: &[ActiveWorkflow]) -> bool {
    match mode {
        JoinMode::All => active.iter().all(|w| w.complete),
        JoinMode::Any | JoinMode::First => active.iter().any(|w| w.complete),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{StateDef, TransitionDef, WorkflowDefinition};
    use crate::WorkflowServices;
    use async_trait::async_trait;
    use ubl_core::filter::EventFilter;
    use ubl_store::MemoryEventStore;

    struct NullServices;

    #[async_trait]
    impl WorkflowServices for NullServices {
        async fn agreement_status(&self, _: &str) -> LedgerResult<Option<String>> {
            Ok(None)
        }
        async fn asset_status(&self, _: &str) -> LedgerResult<Option<String>> {
            Ok(None)
        }
        async fn consent_given(&self, _: &str, _: bool) -> LedgerResult<bool> {
            Ok(true)
        }
        async fn has_active_role(&self, _: &str, _: &str) -> LedgerResult<bool> {
            Ok(true)
        }
        async fn is_agreement_party(
            &self,
            _: &str,
            _: &str,
            _: Option<&str>,
        ) -> LedgerResult<bool> {
            Ok(true)
        }
        async fn custom_guard(
            &self,
            _: &str,
            _: &serde_json::Value,
            _: &crate::WorkflowInstance,
        ) -> LedgerResult<bool> {
            Ok(true)
        }
        async fn notify(&self, _: &str, _: &str) -> LedgerResult<()> {
            Ok(())
        }
    }

    fn one_shot_workflow(id: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            id: id.into(),
            states: vec![
                StateDef {
                    name: "open".into(),
                    on_enter: vec![],
                    on_exit: vec![],
                    timeout: None,
                },
                StateDef {
                    name: "done".into(),
                    on_enter: vec![],
                    on_exit: vec![],
                    timeout: None,
                },
            ],
            transitions: vec![TransitionDef {
                name: "finish".into(),
                from: vec!["open".into()],
                to: "done".into(),
                allowed_actors: vec![],
                guards: vec![],
                actions: vec![],
                emits: vec![],
            }],
            initial_state: "open".into(),
            terminal_states: vec!["done".into()],
        }
    }

    fn wiring() -> (Arc<MemoryEventStore>, Arc<WorkflowEngine>, FlowOrchestrator) {
        let store = Arc::new(MemoryEventStore::new());
        let engine = Arc::new(WorkflowEngine::new(
            store.clone() as Arc<dyn EventStore>,
            Arc::new(NullServices),
        ));
        engine.register(one_shot_workflow("child")).unwrap();
        let flows = FlowOrchestrator::new(store.clone() as Arc<dyn EventStore>, engine.clone());
        (store, engine, flows)
    }

    fn action_step(id: &str, key: &str, value: serde_json::Value) -> FlowStepDef {
        FlowStepDef {
            id: id.into(),
            kind: StepKind::Action {
                actions: vec![FlowAction::SetVariable {
                    key: key.into(),
                    value,
                }],
            },
        }
    }

    #[tokio::test]
    async fn action_only_flow_completes() {
        let (_store, _engine, flows) = wiring();
        flows.register(FlowDefinition {
            id: "simple".into(),
            steps: vec![
                action_step("set-a", "a", serde_json::json!(1)),
                action_step("set-b", "b", serde_json::json!(2)),
            ],
            error_handlers: BTreeMap::new(),
        });

        let flow_id = flows.start("simple", BTreeMap::new()).await.unwrap();
        let instance = flows.instance(&flow_id).unwrap();
        assert_eq!(instance.status, FlowStatus::Completed);
        assert_eq!(instance.variables["a"], 1);
        assert_eq!(instance.variables["b"], 2);
        assert_eq!(instance.history.len(), 2);
    }

    #[tokio::test]
    async fn decision_jumps_to_branch() {
        let (_store, _engine, flows) = wiring();
        flows.register(FlowDefinition {
            id: "branching".into(),
            steps: vec![
                action_step("seed", "route", serde_json::json!("b")),
                FlowStepDef {
                    id: "choose".into(),
                    kind: StepKind::Decision {
                        branches: vec![Branch {
                            variable: "route".into(),
                            equals: serde_json::json!("b"),
                            goto: "b-path".into(),
                        }],
                        default: None,
                    },
                },
                action_step("a-path", "took", serde_json::json!("a")),
                action_step("b-path", "took", serde_json::json!("b")),
            ],
            error_handlers: BTreeMap::new(),
        });

        let flow_id = flows.start("branching", BTreeMap::new()).await.unwrap();
        let instance = flows.instance(&flow_id).unwrap();
        assert_eq!(instance.status, FlowStatus::Completed);
        assert_eq!(instance.variables["took"], "b");
    }

    #[tokio::test]
    async fn workflow_step_waits_for_completion() {
        let (store, engine, flows) = wiring();
        flows.register(FlowDefinition {
            id: "with-child".into(),
            steps: vec![
                FlowStepDef {
                    id: "run-child".into(),
                    kind: StepKind::Workflow {
                        spawn: WorkflowSpawn {
                            definition_id: "child".into(),
                            target_type: "Asset".into(),
                            target_id: "asset-1".into(),
                        },
                    },
                },
                action_step("after", "after", serde_json::json!(true)),
            ],
            error_handlers: BTreeMap::new(),
        });

        let flow_id = flows.start("with-child", BTreeMap::new()).await.unwrap();
        let parked = flows.instance(&flow_id).unwrap();
        assert_eq!(parked.status, FlowStatus::Waiting);
        let child_id = parked.active_workflows[0].workflow_id.clone();

        // Completing the child workflow wakes the flow.
        engine
            .transition(&child_id, "finish", ActorRef::system("test"), None)
            .await
            .unwrap();
        let completion = engine.load(&child_id).await.unwrap();
        assert!(completion.is_complete);

        // Feed the completion event to the orchestrator, as the runtime
        // pump would.
        let events = store.get_by_sequence(1, None).await.unwrap();
        for event in events
            .iter()
            .filter(|e| e.event_type == event_types::WORKFLOW_COMPLETED)
        {
            flows.on_event(event).await.unwrap();
        }

        let finished = flows.instance(&flow_id).unwrap();
        assert_eq!(finished.status, FlowStatus::Completed);
        assert_eq!(finished.variables["after"], true);
    }

    #[tokio::test]
    async fn parallel_any_join_wakes_on_first_completion() {
        let (store, engine, flows) = wiring();
        flows.register(FlowDefinition {
            id: "parallel".into(),
            steps: vec![FlowStepDef {
                id: "fan-out".into(),
                kind: StepKind::Parallel {
                    workflows: vec![
                        WorkflowSpawn {
                            definition_id: "child".into(),
                            target_type: "Asset".into(),
                            target_id: "asset-1".into(),
                        },
                        WorkflowSpawn {
                            definition_id: "child".into(),
                            target_type: "Asset".into(),
                            target_id: "asset-2".into(),
                        },
                    ],
                    join: JoinMode::Any,
                },
            }],
            error_handlers: BTreeMap::new(),
        });

        let flow_id = flows.start("parallel", BTreeMap::new()).await.unwrap();
        let parked = flows.instance(&flow_id).unwrap();
        assert_eq!(parked.active_workflows.len(), 2);
        let first_child = parked.active_workflows[0].workflow_id.clone();

        engine
            .transition(&first_child, "finish", ActorRef::system("test"), None)
            .await
            .unwrap();
        let events = store.get_by_sequence(1, None).await.unwrap();
        for event in events
            .iter()
            .filter(|e| e.event_type == event_types::WORKFLOW_COMPLETED)
        {
            flows.on_event(event).await.unwrap();
        }

        assert_eq!(flows.instance(&flow_id).unwrap().status, FlowStatus::Completed);
    }

    #[tokio::test]
    async fn duration_wait_wakes_on_tick() {
        let (_store, _engine, flows) = wiring();
        flows.register(FlowDefinition {
            id: "sleepy".into(),
            steps: vec![
                FlowStepDef {
                    id: "nap".into(),
                    kind: StepKind::Wait {
                        condition: WaitCondition::Duration { ms: 60_000 },
                    },
                },
                action_step("after", "woke", serde_json::json!(true)),
            ],
            error_handlers: BTreeMap::new(),
        });

        let flow_id = flows.start("sleepy", BTreeMap::new()).await.unwrap();
        assert_eq!(flows.instance(&flow_id).unwrap().status, FlowStatus::Waiting);

        // A tick before the deadline does nothing.
        assert_eq!(flows.tick(Utc::now()).await.unwrap(), 0);
        // A tick past the deadline wakes the flow.
        let later = Utc::now() + chrono::Duration::milliseconds(120_000);
        assert_eq!(flows.tick(later).await.unwrap(), 1);
        assert_eq!(flows.instance(&flow_id).unwrap().status, FlowStatus::Completed);
    }

    #[tokio::test]
    async fn event_wait_wakes_on_matching_event() {
        let (store, _engine, flows) = wiring();
        flows.register(FlowDefinition {
            id: "listener".into(),
            steps: vec![FlowStepDef {
                id: "await-consent".into(),
                kind: StepKind::Wait {
                    condition: WaitCondition::Event {
                        event_type: "ConsentRecorded".into(),
                        aggregate_id: Some("agr-1".into()),
                    },
                },
            }],
            error_handlers: BTreeMap::new(),
        });

        let flow_id = flows.start("listener", BTreeMap::new()).await.unwrap();
        assert_eq!(flows.instance(&flow_id).unwrap().status, FlowStatus::Waiting);

        // Event on the wrong aggregate: still waiting.
        let other = store
            .append(
                EventInputBuilder::new("ConsentRecorded", "Agreement", "agr-other")
                    .version(1)
                    .actor(ActorRef::party("p"))
                    .build(),
            )
            .await
            .unwrap();
        flows.on_event(&other).await.unwrap();
        assert_eq!(flows.instance(&flow_id).unwrap().status, FlowStatus::Waiting);

        let matching = store
            .append(
                EventInputBuilder::new("ConsentRecorded", "Agreement", "agr-1")
                    .version(1)
                    .actor(ActorRef::party("p"))
                    .build(),
            )
            .await
            .unwrap();
        flows.on_event(&matching).await.unwrap();
        assert_eq!(flows.instance(&flow_id).unwrap().status, FlowStatus::Completed);
    }

    #[tokio::test]
    async fn failing_step_with_retry_then_fail() {
        let (_store, _engine, flows) = wiring();
        // A workflow step with an unknown definition fails every attempt.
        let bad_step = FlowStepDef {
            id: "bad".into(),
            kind: StepKind::Workflow {
                spawn: WorkflowSpawn {
                    definition_id: "ghost".into(),
                    target_type: "Asset".into(),
                    target_id: "asset-1".into(),
                },
            },
        };
        let mut handlers = BTreeMap::new();
        handlers.insert("bad".to_string(), ErrorHandler::Retry { max_retries: 2 });
        flows.register(FlowDefinition {
            id: "retrying".into(),
            steps: vec![bad_step],
            error_handlers: handlers,
        });

        let flow_id = flows.start("retrying", BTreeMap::new()).await.unwrap();
        let instance = flows.instance(&flow_id).unwrap();
        assert_eq!(instance.status, FlowStatus::Failed);
        assert_eq!(instance.retries["bad"], 2);
    }

    #[tokio::test]
    async fn failing_step_with_skip_proceeds() {
        let (_store, _engine, flows) = wiring();
        let bad_step = FlowStepDef {
            id: "bad".into(),
            kind: StepKind::Workflow {
                spawn: WorkflowSpawn {
                    definition_id: "ghost".into(),
                    target_type: "Asset".into(),
                    target_id: "asset-1".into(),
                },
            },
        };
        let mut handlers = BTreeMap::new();
        handlers.insert("bad".to_string(), ErrorHandler::Skip);
        flows.register(FlowDefinition {
            id: "skipping".into(),
            steps: vec![bad_step, action_step("after", "after", serde_json::json!(1))],
            error_handlers: handlers,
        });

        let flow_id = flows.start("skipping", BTreeMap::new()).await.unwrap();
        let instance = flows.instance(&flow_id).unwrap();
        assert_eq!(instance.status, FlowStatus::Completed);
        assert!(instance.history.iter().any(|h| h.outcome == "skipped"));
    }

    #[tokio::test]
    async fn cancelled_flow_ignores_wakes() {
        let (_store, _engine, flows) = wiring();
        flows.register(FlowDefinition {
            id: "cancellable".into(),
            steps: vec![FlowStepDef {
                id: "nap".into(),
                kind: StepKind::Wait {
                    condition: WaitCondition::Duration { ms: 60_000 },
                },
            }],
            error_handlers: BTreeMap::new(),
        });

        let flow_id = flows.start("cancellable", BTreeMap::new()).await.unwrap();
        flows.cancel(&flow_id);
        let later = Utc::now() + chrono::Duration::milliseconds(120_000);
        assert_eq!(flows.tick(later).await.unwrap(), 0);
        assert_eq!(flows.instance(&flow_id).unwrap().status, FlowStatus::Cancelled);
    }
}
