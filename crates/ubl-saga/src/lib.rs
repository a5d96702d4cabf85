// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! ubl-saga
//!
//! Multi-step distributed transactions with compensation. A saga runs its
//! steps in order, recording compensation data as it goes; on failure the
//! completed steps are compensated in reverse. Compensation runs under the
//! same event-store serialization guarantees as forward execution — there
//! is no fast path that bypasses appends.

/// The cross-realm asset transfer saga and its consistency validator.
pub mod transfer;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ubl_core::{ActorRef, ErrorKind, EventInputBuilder, LedgerError, LedgerResult};
use ubl_domain::{aggregate_types, event_types};
use ubl_store::EventStore;

pub use transfer::{ConsistencyReport, ConsistencyValidator, CrossRealmGate, CrossRealmTransferSaga};

/// Result of one step's forward execution.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step succeeded; `compensation_data` is handed back to
    /// [`SagaStep::compensate`] if the saga later unwinds.
    Success {
        /// Data the compensation needs (ids, prior values).
        compensation_data: Option<serde_json::Value>,
    },
    /// The step failed; the saga unwinds.
    Failure {
        /// What went wrong.
        error: String,
    },
}

/// Shared state threaded through a saga's steps.
pub struct SagaContext {
    /// The saga instance id, stamped into every event the saga appends.
    pub saga_id: String,
    /// The event store; the only write surface steps have.
    pub store: Arc<dyn EventStore>,
    /// Saga variables (inputs and values steps pass forward).
    pub variables: BTreeMap<String, serde_json::Value>,
}

impl SagaContext {
    /// Read a required string variable.
    ///
    /// # Errors
    ///
    /// `INVALID_EVENT` when the variable is missing or not a string.
    pub fn require_str(&self, key: &str) -> LedgerResult<String> {
        self.variables
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                LedgerError::invalid_event(format!("saga variable {key} missing or not a string"))
            })
    }
}

/// One step of a saga.
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Step name, used in events and reports.
    fn name(&self) -> &str;

    /// Forward execution.
    async fn execute(&self, ctx: &mut SagaContext) -> StepOutcome;

    /// Undo a completed execution. `data` is the step's own
    /// `compensation_data`.
    ///
    /// # Errors
    ///
    /// A compensation failure is handled per the saga's declared strategy.
    async fn compensate(
        &self,
        ctx: &mut SagaContext,
        data: serde_json::Value,
    ) -> LedgerResult<()>;
}

/// What to do when compensation itself fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationFailureStrategy {
    /// Stop and surface to an operator.
    #[default]
    Manual,
    /// Retry the failing compensation once before giving up.
    Retry,
    /// Record the failure and keep unwinding the remaining steps.
    Abandon,
}

/// A registered saga.
pub struct SagaDefinition {
    /// Saga name.
    pub name: String,
    /// Steps, executed in order.
    pub steps: Vec<Arc<dyn SagaStep>>,
    /// Overall wall-clock budget; elapsing triggers compensation.
    pub timeout_ms: u64,
    /// Strategy when a compensation fails.
    pub compensation_failure_strategy: CompensationFailureStrategy,
}

/// Saga lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Forward execution in progress.
    Running,
    /// All steps succeeded.
    Completed,
    /// A step failed; unwinding began.
    Failed,
    /// Compensation in progress.
    Compensating,
    /// Every completed step was compensated.
    Compensated,
    /// Compensation itself failed; operator attention required.
    CompensationFailed,
}

/// Outcome of a saga run.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaReport {
    /// The saga instance id.
    pub saga_id: String,
    /// Final status.
    pub status: SagaStatus,
    /// Steps that completed forward execution.
    pub completed_steps: Vec<String>,
    /// Steps that were compensated.
    pub compensated_steps: Vec<String>,
    /// The error that triggered unwinding, if any.
    pub error: Option<String>,
}

/// Runs registered sagas against the ledger.
pub struct SagaCoordinator {
    store: Arc<dyn EventStore>,
    definitions: RwLock<HashMap<String, Arc<SagaDefinition>>>,
}

impl std::fmt::Debug for SagaCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let definitions = self.definitions.read().expect("saga registry poisoned");
        f.debug_struct("SagaCoordinator")
            .field("definitions", &definitions.len())
            .finish_non_exhaustive()
    }
}

impl SagaCoordinator {
    /// Wire a coordinator over the store.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            definitions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a saga definition.
    pub fn register(&self, definition: SagaDefinition) {
        self.definitions
            .write()
            .expect("saga registry poisoned")
            .insert(definition.name.clone(), Arc::new(definition));
    }

    /// Whether a saga with this name is registered.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.definitions
            .read()
            .expect("saga registry poisoned")
            .contains_key(name)
    }

    /// Execute a saga to completion (or compensation).
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` for unregistered sagas and store errors from lifecycle
    /// appends. Step failures do not error the call; they are reported in
    /// the [`SagaReport`].
    pub async fn run(
        &self,
        name: &str,
        variables: BTreeMap<String, serde_json::Value>,
    ) -> LedgerResult<SagaReport> {
        let definition = self
            .definitions
            .read()
            .expect("saga registry poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| LedgerError::not_found(format!("saga {name} not registered")))?;

        let saga_id = format!("saga-{}", ubl_core::new_event_id());
        let mut ctx = SagaContext {
            saga_id: saga_id.clone(),
            store: Arc::clone(&self.store),
            variables,
        };
        let mut version = 1u64;
        self.append_saga_event(
            &saga_id,
            version,
            event_types::SAGA_STARTED,
            serde_json::json!({"name": definition.name}),
        )
        .await?;

        // Forward execution under the saga's wall-clock budget.
        let budget = Duration::from_millis(definition.timeout_ms);
        let mut completed: Vec<(String, Option<serde_json::Value>)> = Vec::new();
        let forward = tokio::time::timeout(
            budget,
            self.run_forward(&definition, &mut ctx, &mut completed, &saga_id, &mut version),
        )
        .await;

        let failure: Option<String> = match forward {
            Ok(Ok(())) => None,
            Ok(Err(step_error)) => Some(step_error),
            Err(_) => Some(format!(
                "saga exceeded its {}ms budget",
                definition.timeout_ms
            )),
        };

        let Some(error) = failure else {
            version += 1;
            self.append_saga_event(
                &saga_id,
                version,
                event_types::SAGA_COMPLETED,
                serde_json::json!({"steps": completed.iter().map(|(n, _)| n).collect::<Vec<_>>()}),
            )
            .await?;
            return Ok(SagaReport {
                saga_id,
                status: SagaStatus::Completed,
                completed_steps: completed.into_iter().map(|(n, _)| n).collect(),
                compensated_steps: Vec::new(),
                error: None,
            });
        };

        version += 1;
        self.append_saga_event(
            &saga_id,
            version,
            event_types::SAGA_FAILED,
            serde_json::json!({"error": error}),
        )
        .await?;

        // Unwind in reverse.
        let (status, compensated) = self
            .compensate_all(&definition, &mut ctx, &completed)
            .await;
        version += 1;
        self.append_saga_event(
            &saga_id,
            version,
            event_types::SAGA_COMPENSATED,
            serde_json::json!({
                "compensated": compensated,
                "complete": status == SagaStatus::Compensated,
            }),
        )
        .await?;

        Ok(SagaReport {
            saga_id,
            status,
            completed_steps: completed.into_iter().map(|(n, _)| n).collect(),
            compensated_steps: compensated,
            error: Some(error),
        })
    }

    /// Run steps forward. Returns the failing step's error, if any.
    async fn run_forward(
        &self,
        definition: &SagaDefinition,
        ctx: &mut SagaContext,
        completed: &mut Vec<(String, Option<serde_json::Value>)>,
        saga_id: &str,
        version: &mut u64,
    ) -> Result<(), String> {
        for step in &definition.steps {
            tracing::debug!(
                target: "ubl.saga",
                saga = %saga_id,
                step = %step.name(),
                "executing saga step"
            );
            match step.execute(ctx).await {
                StepOutcome::Success { compensation_data } => {
                    completed.push((step.name().to_string(), compensation_data));
                    *version += 1;
                    if let Err(e) = self
                        .append_saga_event(
                            saga_id,
                            *version,
                            event_types::SAGA_STEP_COMPLETED,
                            serde_json::json!({"step": step.name()}),
                        )
                        .await
                    {
                        return Err(e.to_string());
                    }
                }
                StepOutcome::Failure { error } => {
                    return Err(format!("step {} failed: {error}", step.name()));
                }
            }
        }
        Ok(())
    }

    async fn compensate_all(
        &self,
        definition: &SagaDefinition,
        ctx: &mut SagaContext,
        completed: &[(String, Option<serde_json::Value>)],
    ) -> (SagaStatus, Vec<String>) {
        let mut compensated = Vec::new();
        for (name, data) in completed.iter().rev() {
            let Some(step) = definition.steps.iter().find(|s| s.name() == name) else {
                continue;
            };
            let data = data.clone().unwrap_or(serde_json::Value::Null);
            let mut result = step.compensate(ctx, data.clone()).await;
            if result.is_err()
                && definition.compensation_failure_strategy == CompensationFailureStrategy::Retry
            {
                result = step.compensate(ctx, data).await;
            }
            match result {
                Ok(()) => compensated.push(name.clone()),
                Err(e) => {
                    tracing::error!(
                        target: "ubl.saga",
                        saga = %ctx.saga_id,
                        step = %name,
                        error = %e,
                        "compensation failed"
                    );
                    match definition.compensation_failure_strategy {
                        CompensationFailureStrategy::Abandon => continue,
                        _ => return (SagaStatus::CompensationFailed, compensated),
                    }
                }
            }
        }
        (SagaStatus::Compensated, compensated)
    }

    async fn append_saga_event(
        &self,
        saga_id: &str,
        version: u64,
        event_type: &str,
        payload: serde_json::Value,
    ) -> LedgerResult<()> {
        self.store
            .append(
                EventInputBuilder::new(event_type, aggregate_types::SAGA, saga_id)
                    .version(version)
                    .payload(payload)
                    .metadata(
                        ubl_domain::invariant::SAGA_ID_KEY,
                        serde_json::json!(saga_id),
                    )
                    .actor(ActorRef::system_component("ledger", "saga"))
                    .build(),
            )
            .await?;
        Ok(())
    }
}

/// Classify a saga failure as the timeout error kind when the budget
/// elapsed.
#[must_use]
pub fn error_kind_for(report: &SagaReport) -> Option<ErrorKind> {
    match (&report.status, &report.error) {
        (SagaStatus::Completed, _) => None,
        (SagaStatus::CompensationFailed, _) => Some(ErrorKind::CompensationFailed),
        (_, Some(e)) if e.contains("budget") => Some(ErrorKind::Timeout),
        _ => Some(ErrorKind::InvariantViolation),
    }
}
