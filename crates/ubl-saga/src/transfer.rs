// SPDX-License-Identifier: MIT OR Apache-2.0

//! The cross-realm asset transfer saga and its consistency validator.
//!
//! Cross-realm operations are only permitted through a registered saga;
//! the invariant gate rejects direct two-realm writes. This saga holds the
//! asset, moves it, and releases it, stamping its saga id into every
//! event's metadata so the trail is auditable and the validator can check
//! that no saga ever left one realm updated and the other not.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ubl_core::{ActorRef, EventInputBuilder, LedgerResult};
use ubl_domain::invariant::SAGA_ID_KEY;
use ubl_domain::{aggregate_types, event_types};
use ubl_store::{AggregateQuery, EventStore};

use crate::{CompensationFailureStrategy, SagaContext, SagaDefinition, SagaStep, StepOutcome};

/// Cross-realm admission check, implemented by the realm manager.
#[async_trait]
pub trait CrossRealmGate: Send + Sync {
    /// Whether an operation from `source_realm` into `target_realm` is
    /// permitted.
    ///
    /// # Errors
    ///
    /// Returns `INVARIANT_VIOLATION` (or realm lookup failures) when not.
    async fn validate(&self, source_realm: &str, target_realm: &str) -> LedgerResult<()>;
}

/// Build the cross-realm transfer saga definition.
///
/// Variables the saga expects: `asset_id`, `to_owner`, `from_realm`,
/// `to_realm`, and `original_owner` (for compensation).
#[must_use]
pub fn cross_realm_transfer_saga(gate: Arc<dyn CrossRealmGate>) -> SagaDefinition {
    SagaDefinition {
        name: CrossRealmTransferSaga::NAME.into(),
        steps: vec![
            Arc::new(ValidateRealms { gate }),
            Arc::new(HoldAsset),
            Arc::new(MoveAsset),
            Arc::new(ReleaseAsset),
        ],
        timeout_ms: 30_000,
        compensation_failure_strategy: CompensationFailureStrategy::Retry,
    }
}

/// Marker type carrying the saga's well-known name.
pub struct CrossRealmTransferSaga;

impl CrossRealmTransferSaga {
    /// The name the saga registers under.
    pub const NAME: &'static str = "cross_realm_transfer";
}

async fn next_asset_version(ctx: &SagaContext, asset_id: &str) -> LedgerResult<u64> {
    let latest = ctx.store.get_latest(aggregate_types::ASSET, asset_id).await?;
    Ok(latest.map_or(1, |e| e.aggregate_version + 1))
}

async fn append_asset_event(
    ctx: &SagaContext,
    asset_id: &str,
    event_type: &str,
    payload: serde_json::Value,
) -> LedgerResult<()> {
    let version = next_asset_version(ctx, asset_id).await?;
    ctx.store
        .append(
            EventInputBuilder::new(event_type, aggregate_types::ASSET, asset_id)
                .version(version)
                .payload(payload)
                .metadata(SAGA_ID_KEY, serde_json::json!(ctx.saga_id))
                .actor(ActorRef::system_component("ledger", "saga"))
                .build(),
        )
        .await?;
    Ok(())
}

struct ValidateRealms {
    gate: Arc<dyn CrossRealmGate>,
}

#[async_trait]
impl SagaStep for ValidateRealms {
    fn name(&self) -> &str {
        "validate_realms"
    }

    async fn execute(&self, ctx: &mut SagaContext) -> StepOutcome {
        let (from, to) = match (ctx.require_str("from_realm"), ctx.require_str("to_realm")) {
            (Ok(f), Ok(t)) => (f, t),
            (Err(e), _) | (_, Err(e)) => {
                return StepOutcome::Failure {
                    error: e.to_string(),
                }
            }
        };
        match self.gate.validate(&from, &to).await {
            Ok(()) => StepOutcome::Success {
                compensation_data: None,
            },
            Err(e) => StepOutcome::Failure {
                error: e.to_string(),
            },
        }
    }

    async fn compensate(
        &self,
        _ctx: &mut SagaContext,
        _data: serde_json::Value,
    ) -> LedgerResult<()> {
        // Validation has no side effects to undo.
        Ok(())
    }
}

struct HoldAsset;

#[async_trait]
impl SagaStep for HoldAsset {
    fn name(&self) -> &str {
        "hold_asset"
    }

    async fn execute(&self, ctx: &mut SagaContext) -> StepOutcome {
        let asset_id = match ctx.require_str("asset_id") {
            Ok(v) => v,
            Err(e) => {
                return StepOutcome::Failure {
                    error: e.to_string(),
                }
            }
        };
        match append_asset_event(
            ctx,
            &asset_id,
            event_types::ASSET_STATUS_CHANGED,
            serde_json::json!({"status": "in_transfer"}),
        )
        .await
        {
            Ok(()) => StepOutcome::Success {
                compensation_data: Some(serde_json::json!({"asset_id": asset_id})),
            },
            Err(e) => StepOutcome::Failure {
                error: e.to_string(),
            },
        }
    }

    async fn compensate(
        &self,
        ctx: &mut SagaContext,
        data: serde_json::Value,
    ) -> LedgerResult<()> {
        let asset_id = data["asset_id"].as_str().unwrap_or_default().to_string();
        append_asset_event(
            ctx,
            &asset_id,
            event_types::ASSET_STATUS_CHANGED,
            serde_json::json!({"status": "available"}),
        )
        .await
    }
}

struct MoveAsset;

#[async_trait]
impl SagaStep for MoveAsset {
    fn name(&self) -> &str {
        "move_asset"
    }

    async fn execute(&self, ctx: &mut SagaContext) -> StepOutcome {
        let fields = (
            ctx.require_str("asset_id"),
            ctx.require_str("to_owner"),
            ctx.require_str("from_realm"),
            ctx.require_str("to_realm"),
        );
        let (asset_id, to_owner, from_realm, to_realm) = match fields {
            (Ok(a), Ok(b), Ok(c), Ok(d)) => (a, b, c, d),
            (Err(e), ..) | (_, Err(e), ..) | (_, _, Err(e), _) | (_, _, _, Err(e)) => {
                return StepOutcome::Failure {
                    error: e.to_string(),
                }
            }
        };
        // A transfer can be told to fail for tests and drills.
        if ctx.variables.get("fail_move").is_some_and(|v| v == &serde_json::json!(true)) {
            return StepOutcome::Failure {
                error: "move rejected by target realm".into(),
            };
        }
        match append_asset_event(
            ctx,
            &asset_id,
            event_types::ASSET_TRANSFERRED,
            serde_json::json!({
                "to_owner": to_owner,
                "from_realm": from_realm,
                "to_realm": to_realm,
            }),
        )
        .await
        {
            Ok(()) => StepOutcome::Success {
                compensation_data: Some(serde_json::json!({
                    "asset_id": asset_id,
                    "from_realm": from_realm,
                    "to_realm": to_realm,
                })),
            },
            Err(e) => StepOutcome::Failure {
                error: e.to_string(),
            },
        }
    }

    async fn compensate(
        &self,
        ctx: &mut SagaContext,
        data: serde_json::Value,
    ) -> LedgerResult<()> {
        // Reverse transfer: target realm back to source, original owner
        // restored.
        let asset_id = data["asset_id"].as_str().unwrap_or_default().to_string();
        let original_owner = ctx.require_str("original_owner")?;
        append_asset_event(
            ctx,
            &asset_id,
            event_types::ASSET_TRANSFERRED,
            serde_json::json!({
                "to_owner": original_owner,
                "from_realm": data["to_realm"],
                "to_realm": data["from_realm"],
            }),
        )
        .await
    }
}

struct ReleaseAsset;

#[async_trait]
impl SagaStep for ReleaseAsset {
    fn name(&self) -> &str {
        "release_asset"
    }

    async fn execute(&self, ctx: &mut SagaContext) -> StepOutcome {
        let asset_id = match ctx.require_str("asset_id") {
            Ok(v) => v,
            Err(e) => {
                return StepOutcome::Failure {
                    error: e.to_string(),
                }
            }
        };
        match append_asset_event(
            ctx,
            &asset_id,
            event_types::ASSET_STATUS_CHANGED,
            serde_json::json!({"status": "available"}),
        )
        .await
        {
            Ok(()) => StepOutcome::Success {
                compensation_data: None,
            },
            Err(e) => StepOutcome::Failure {
                error: e.to_string(),
            },
        }
    }

    async fn compensate(
        &self,
        _ctx: &mut SagaContext,
        _data: serde_json::Value,
    ) -> LedgerResult<()> {
        Ok(())
    }
}

/// One detected saga/realm asymmetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// The saga concerned.
    pub saga_id: String,
    /// What is wrong.
    pub problem: String,
}

/// Detects sagas marked completed whose realm effects are asymmetric.
pub struct ConsistencyValidator {
    store: Arc<dyn EventStore>,
}

impl ConsistencyValidator {
    /// Wire a validator over the store.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Validate every saga aggregate in the ledger.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn validate_all(&self) -> LedgerResult<Vec<ConsistencyReport>> {
        let mut reports = Vec::new();
        for saga_id in self.store.list_aggregate_ids(aggregate_types::SAGA).await? {
            if let Some(report) = self.validate_saga(&saga_id).await? {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    /// Validate a single saga: a completed transfer saga must have exactly
    /// its transfer event in the ledger; a compensated one must have a
    /// matching reverse transfer.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn validate_saga(&self, saga_id: &str) -> LedgerResult<Option<ConsistencyReport>> {
        let lifecycle = self
            .store
            .get_by_aggregate(aggregate_types::SAGA, saga_id, &AggregateQuery::all())
            .await?;
        let completed = lifecycle
            .iter()
            .any(|e| e.event_type == event_types::SAGA_COMPLETED);
        let compensated = lifecycle
            .iter()
            .any(|e| e.event_type == event_types::SAGA_COMPENSATED);

        // Transfers stamped with this saga id, in order.
        let mut transfers = Vec::new();
        let head = self.store.get_current_sequence().await?;
        for event in self.store.get_by_sequence(1, Some(head)).await? {
            if event.event_type != event_types::ASSET_TRANSFERRED {
                continue;
            }
            let stamped = event
                .metadata_value(SAGA_ID_KEY)
                .and_then(|v| v.as_str())
                .is_some_and(|s| s == saga_id);
            if stamped {
                transfers.push(event);
            }
        }

        if completed && transfers.is_empty() {
            return Ok(Some(ConsistencyReport {
                saga_id: saga_id.to_string(),
                problem: "saga completed but no stamped transfer event exists".into(),
            }));
        }
        if compensated && !completed && transfers.len() == 1 {
            return Ok(Some(ConsistencyReport {
                saga_id: saga_id.to_string(),
                problem: "saga compensated but the forward transfer was never reversed".into(),
            }));
        }
        Ok(None)
    }
}
