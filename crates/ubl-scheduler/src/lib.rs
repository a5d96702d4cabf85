// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! ubl-scheduler
//!
//! Cluster-safe deadlines and scheduled tasks. Any number of scheduler
//! replicas may tick concurrently against the shared schedule table; a
//! named advisory lock serializes the tick, rows are claimed under it, and
//! an idempotency key derived from `(id, stage, fire_time)` is recorded in
//! the emitted event's metadata and checked against the idempotency index
//! before every emit. The result: exactly one `*Triggered` event per
//! `(deadline, stage)` no matter how many replicas run.

/// Five-field cron expressions.
pub mod cron;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use ubl_core::{ActorRef, EventInputBuilder, LedgerResult};
use ubl_domain::{aggregate_types, event_types};
use ubl_store::{EventStore, LockService};

pub use cron::CronExpr;

/// Name of the advisory lock serializing ticks.
pub const TICK_LOCK: &str = "scheduler_tick";

/// Metadata key carrying the idempotency key on emitted events.
pub const IDEMPOTENCY_KEY: &str = "idempotency_key";

/// When a task fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Once, at an instant.
    At {
        /// The instant.
        #[serde(with = "chrono::serde::ts_milliseconds")]
        at: DateTime<Utc>,
    },
    /// Repeatedly, anchored at an instant.
    Every {
        /// Period in milliseconds.
        period_ms: u64,
        /// Anchor the period grid hangs off.
        #[serde(with = "chrono::serde::ts_milliseconds")]
        anchor: DateTime<Utc>,
    },
    /// Per a cron expression.
    Cron {
        /// The expression.
        expr: String,
    },
}

impl Schedule {
    /// The first fire time strictly after `after`.
    ///
    /// # Errors
    ///
    /// Propagates cron parse errors.
    pub fn next_after(&self, after: DateTime<Utc>) -> LedgerResult<Option<DateTime<Utc>>> {
        Ok(match self {
            Self::At { at } => {
                if *at > after {
                    Some(*at)
                } else {
                    None
                }
            }
            Self::Every { period_ms, anchor } => {
                let period = Duration::milliseconds(*period_ms as i64);
                if period <= Duration::zero() {
                    return Ok(None);
                }
                if *anchor > after {
                    Some(*anchor)
                } else {
                    let elapsed = after.signed_duration_since(*anchor).num_milliseconds();
                    let periods = elapsed / *period_ms as i64 + 1;
                    Some(*anchor + Duration::milliseconds(periods * *period_ms as i64))
                }
            }
            Self::Cron { expr } => CronExpr::parse(expr)?.next_after(after),
        })
    }
}

/// What firing does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskAction {
    /// Append an event.
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
    /// Invoke a registered hook by name.
    InvokeHook {
        /// Hook name.
        name: String,
        /// Hook payload.
        #[serde(default)]
        payload: serde_json::Value,
    },
}

/// When a deadline stage fires relative to its due time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageTrigger {
    /// This long before the due time (reminders).
    Before {
        /// Lead time in milliseconds.
        ms: u64,
    },
    /// At the due time.
    AtDue,
    /// This long after the due time (follow-ups).
    After {
        /// Delay in milliseconds.
        ms: u64,
    },
}

impl StageTrigger {
    /// The stage's absolute fire time.
    #[must_use]
    pub fn fire_time(&self, due_at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Before { ms } => due_at - Duration::milliseconds(*ms as i64),
            Self::AtDue => due_at,
            Self::After { ms } => due_at + Duration::milliseconds(*ms as i64),
        }
    }
}

/// One stage of a deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadlineStage {
    /// When the stage fires.
    pub trigger: StageTrigger,
    /// What it does.
    pub action: TaskAction,
    /// Human-readable label (`"reminder"`, `"final"`).
    pub label: String,
}

/// A deadline on a subject aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deadline {
    /// Deadline id.
    pub id: String,
    /// The aggregate the deadline concerns.
    pub subject: (String, String),
    /// The due instant.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub due_at: DateTime<Utc>,
    /// Stages, fired independently.
    pub stages: Vec<DeadlineStage>,
}

/// A recurring or one-shot task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Task id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// When it fires.
    pub schedule: Schedule,
    /// What it does.
    pub action: TaskAction,
}

#[derive(Debug, Clone, PartialEq)]
enum RowStatus {
    Pending,
    Complete,
}

#[derive(Debug, Clone)]
struct DeadlineRow {
    deadline: Deadline,
    fired_stages: HashSet<usize>,
    status: RowStatus,
}

#[derive(Debug, Clone)]
struct TaskRow {
    task: ScheduledTask,
    next_fire: Option<DateTime<Utc>>,
    status: RowStatus,
}

/// The shared schedule table. In production this is the relational store;
/// replicas in one process share it behind an [`Arc`].
#[derive(Debug, Default)]
pub struct ScheduleTable {
    deadlines: RwLock<BTreeMap<String, DeadlineRow>>,
    tasks: RwLock<BTreeMap<String, TaskRow>>,
}

impl ScheduleTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a deadline.
    pub fn add_deadline(&self, deadline: Deadline) {
        self.deadlines
            .write()
            .expect("schedule table poisoned")
            .insert(
                deadline.id.clone(),
                DeadlineRow {
                    deadline,
                    fired_stages: HashSet::new(),
                    status: RowStatus::Pending,
                },
            );
    }

    /// Register a task, computing its first fire time.
    ///
    /// # Errors
    ///
    /// Propagates cron parse errors.
    pub fn add_task(&self, task: ScheduledTask, now: DateTime<Utc>) -> LedgerResult<()> {
        let next_fire = task.schedule.next_after(now)?;
        self.tasks.write().expect("schedule table poisoned").insert(
            task.id.clone(),
            TaskRow {
                task,
                next_fire,
                status: RowStatus::Pending,
            },
        );
        Ok(())
    }

    /// Whether a deadline has fired all its stages.
    #[must_use]
    pub fn deadline_complete(&self, id: &str) -> bool {
        self.deadlines
            .read()
            .expect("schedule table poisoned")
            .get(id)
            .is_some_and(|row| row.status == RowStatus::Complete)
    }
}

/// The idempotency index. In production this is a unique-keyed table in
/// the relational store; replicas share one instance.
#[derive(Debug, Default)]
pub struct IdempotencyIndex {
    claimed: Mutex<HashSet<String>>,
}

impl IdempotencyIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a key. Returns `false` when it was already claimed —
    /// structurally rejecting the duplicate, like a unique constraint.
    pub fn claim(&self, key: &str) -> bool {
        self.claimed
            .lock()
            .expect("idempotency index poisoned")
            .insert(key.to_string())
    }

    /// Whether a key has been claimed.
    #[must_use]
    pub fn is_claimed(&self, key: &str) -> bool {
        self.claimed
            .lock()
            .expect("idempotency index poisoned")
            .contains(key)
    }
}

/// Named hooks a task action can invoke.
pub type HookFn = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// The tick lost the advisory lock and did nothing.
    pub skipped: bool,
    /// Actions executed.
    pub fired: u32,
    /// Rows skipped because their idempotency key was already claimed.
    pub deduplicated: u32,
}

/// A scheduler replica.
///
/// Construct one per process; all replicas share the table, lock service,
/// idempotency index, and store.
pub struct Scheduler {
    store: Arc<dyn EventStore>,
    locks: Arc<dyn LockService>,
    table: Arc<ScheduleTable>,
    idempotency: Arc<IdempotencyIndex>,
    hooks: RwLock<HashMap<String, HookFn>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Wire a replica over the shared collaborators.
    pub fn new(
        store: Arc<dyn EventStore>,
        locks: Arc<dyn LockService>,
        table: Arc<ScheduleTable>,
        idempotency: Arc<IdempotencyIndex>,
    ) -> Self {
        Self {
            store,
            locks,
            table,
            idempotency,
            hooks: RwLock::new(HashMap::new()),
        }
    }

    /// Register a named hook for [`TaskAction::InvokeHook`].
    pub fn register_hook(&self, name: impl Into<String>, hook: HookFn) {
        self.hooks
            .write()
            .expect("hook registry poisoned")
            .insert(name.into(), hook);
    }

    /// Run one scheduling tick.
    ///
    /// The tick algorithm: acquire the advisory lock (skip the tick on
    /// contention), claim due rows, build each row's idempotency key and
    /// skip already-claimed ones, execute actions, mark rows, release.
    ///
    /// # Errors
    ///
    /// Propagates store failures from event emission; the lock is released
    /// on every path.
    pub async fn run_scheduling_tick(&self, now: DateTime<Utc>) -> LedgerResult<TickReport> {
        if !self.locks.try_lock(TICK_LOCK).await {
            return Ok(TickReport {
                skipped: true,
                fired: 0,
                deduplicated: 0,
            });
        }
        let result = self.tick_under_lock(now).await;
        self.locks.unlock(TICK_LOCK).await;
        result
    }

    async fn tick_under_lock(&self, now: DateTime<Utc>) -> LedgerResult<TickReport> {
        let mut fired = 0;
        let mut deduplicated = 0;

        // Due deadline stages, claimed under the lock.
        let due_stages: Vec<(String, usize, DeadlineStage, DateTime<Utc>)> = {
            let deadlines = self.table.deadlines.read().expect("schedule table poisoned");
            deadlines
                .values()
                .filter(|row| row.status == RowStatus::Pending)
                .flat_map(|row| {
                    row.deadline
                        .stages
                        .iter()
                        .enumerate()
                        .filter(|(index, _)| !row.fired_stages.contains(index))
                        .filter_map(|(index, stage)| {
                            let fire_time = stage.trigger.fire_time(row.deadline.due_at);
                            (fire_time <= now).then(|| {
                                (row.deadline.id.clone(), index, stage.clone(), fire_time)
                            })
                        })
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        for (deadline_id, stage_index, stage, fire_time) in due_stages {
            let key = format!(
                "{deadline_id}:{stage_index}:{}",
                fire_time.timestamp_millis()
            );
            if !self.idempotency.claim(&key) {
                deduplicated += 1;
                self.mark_stage_fired(&deadline_id, stage_index);
                continue;
            }
            self.execute(&stage.action, &key).await?;
            self.mark_stage_fired(&deadline_id, stage_index);
            fired += 1;
            tracing::info!(
                target: "ubl.scheduler",
                deadline = %deadline_id,
                stage = stage_index,
                label = %stage.label,
                "deadline stage fired"
            );
        }

        // Due tasks.
        let due_tasks: Vec<(String, TaskAction, DateTime<Utc>)> = {
            let tasks = self.table.tasks.read().expect("schedule table poisoned");
            tasks
                .values()
                .filter(|row| row.status == RowStatus::Pending)
                .filter_map(|row| {
                    row.next_fire.and_then(|fire_time| {
                        (fire_time <= now).then(|| {
                            (row.task.id.clone(), row.task.action.clone(), fire_time)
                        })
                    })
                })
                .collect()
        };

        for (task_id, action, fire_time) in due_tasks {
            let key = format!("{task_id}:0:{}", fire_time.timestamp_millis());
            if !self.idempotency.claim(&key) {
                deduplicated += 1;
                self.advance_task(&task_id, now)?;
                continue;
            }
            self.execute(&action, &key).await?;
            self.advance_task(&task_id, now)?;
            fired += 1;
            tracing::info!(target: "ubl.scheduler", task = %task_id, "task fired");
        }

        Ok(TickReport {
            skipped: false,
            fired,
            deduplicated,
        })
    }

    fn mark_stage_fired(&self, deadline_id: &str, stage_index: usize) {
        let mut deadlines = self.table.deadlines.write().expect("schedule table poisoned");
        if let Some(row) = deadlines.get_mut(deadline_id) {
            row.fired_stages.insert(stage_index);
            if row.fired_stages.len() == row.deadline.stages.len() {
                row.status = RowStatus::Complete;
            }
        }
    }

    fn advance_task(&self, task_id: &str, now: DateTime<Utc>) -> LedgerResult<()> {
        let mut tasks = self.table.tasks.write().expect("schedule table poisoned");
        if let Some(row) = tasks.get_mut(task_id) {
            row.next_fire = row.task.schedule.next_after(now)?;
            if row.next_fire.is_none() {
                row.status = RowStatus::Complete;
            }
        }
        Ok(())
    }

    async fn execute(&self, action: &TaskAction, idempotency_key: &str) -> LedgerResult<()> {
        match action {
            TaskAction::EmitEvent {
                event_type,
                aggregate_type,
                aggregate_id,
                payload,
            } => {
                let latest = self.store.get_latest(aggregate_type, aggregate_id).await?;
                let version = latest.map_or(1, |e| e.aggregate_version + 1);
                self.store
                    .append(
                        EventInputBuilder::new(event_type, aggregate_type, aggregate_id)
                            .version(version)
                            .payload(payload.clone())
                            .metadata(IDEMPOTENCY_KEY, serde_json::json!(idempotency_key))
                            .actor(ActorRef::system_component("ledger", "scheduler"))
                            .build(),
                    )
                    .await?;
            }
            TaskAction::InvokeHook { name, payload } => {
                let hook = self
                    .hooks
                    .read()
                    .expect("hook registry poisoned")
                    .get(name)
                    .cloned();
                match hook {
                    Some(hook) => hook(payload),
                    None => {
                        tracing::warn!(
                            target: "ubl.scheduler",
                            hook = %name,
                            "task action references unregistered hook"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

/// Convenience: the canonical deadline-fired action.
#[must_use]
pub fn deadline_triggered_action(deadline_id: &str, label: &str) -> TaskAction {
    TaskAction::EmitEvent {
        event_type: event_types::DEADLINE_TRIGGERED.into(),
        aggregate_type: aggregate_types::DEADLINE.into(),
        aggregate_id: deadline_id.into(),
        payload: serde_json::json!({"deadline_id": deadline_id, "label": label}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubl_core::filter::EventFilter;
    use ubl_store::{MemoryEventStore, MemoryLockService};

    fn wiring() -> (
        Arc<MemoryEventStore>,
        Arc<MemoryLockService>,
        Arc<ScheduleTable>,
        Arc<IdempotencyIndex>,
    ) {
        (
            Arc::new(MemoryEventStore::new()),
            Arc::new(MemoryLockService::new()),
            Arc::new(ScheduleTable::new()),
            Arc::new(IdempotencyIndex::new()),
        )
    }

    fn replica(
        store: &Arc<MemoryEventStore>,
        locks: &Arc<MemoryLockService>,
        table: &Arc<ScheduleTable>,
        idempotency: &Arc<IdempotencyIndex>,
    ) -> Scheduler {
        Scheduler::new(
            Arc::clone(store) as Arc<dyn EventStore>,
            Arc::clone(locks) as Arc<dyn LockService>,
            Arc::clone(table),
            Arc::clone(idempotency),
        )
    }

    fn overdue_deadline(id: &str, now: DateTime<Utc>) -> Deadline {
        Deadline {
            id: id.into(),
            subject: ("Agreement".into(), "agr-1".into()),
            due_at: now - Duration::milliseconds(1_000),
            stages: vec![DeadlineStage {
                trigger: StageTrigger::AtDue,
                action: deadline_triggered_action(id, "final"),
                label: "final".into(),
            }],
        }
    }

    async fn count_triggered(store: &MemoryEventStore, deadline_id: &str) -> usize {
        store
            .get_by_sequence(1, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| {
                e.event_type == event_types::DEADLINE_TRIGGERED
                    && e.payload["deadline_id"] == deadline_id
            })
            .count()
    }

    #[tokio::test]
    async fn overdue_deadline_fires_once() {
        let (store, locks, table, idem) = wiring();
        let now = Utc::now();
        table.add_deadline(overdue_deadline("D1", now));

        let scheduler = replica(&store, &locks, &table, &idem);
        let report = scheduler.run_scheduling_tick(now).await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.fired, 1);

        // Further ticks do nothing.
        let report = scheduler.run_scheduling_tick(now).await.unwrap();
        assert_eq!(report.fired, 0);
        assert_eq!(count_triggered(&store, "D1").await, 1);
        assert!(table.deadline_complete("D1"));
    }

    #[tokio::test]
    async fn emitted_event_carries_idempotency_key() {
        let (store, locks, table, idem) = wiring();
        let now = Utc::now();
        table.add_deadline(overdue_deadline("D1", now));
        replica(&store, &locks, &table, &idem)
            .run_scheduling_tick(now)
            .await
            .unwrap();

        let event = store
            .get_latest(aggregate_types::DEADLINE, "D1")
            .await
            .unwrap()
            .unwrap();
        let key = event
            .metadata_value(IDEMPOTENCY_KEY)
            .and_then(|v| v.as_str())
            .unwrap();
        assert!(key.starts_with("D1:0:"));
        assert!(idem.is_claimed(key));
    }

    #[tokio::test]
    async fn concurrent_replicas_fire_exactly_once() {
        // Two replicas, four concurrent ticks in total: the ledger must
        // contain exactly one DeadlineTriggered for D1.
        let (store, locks, table, idem) = wiring();
        let now = Utc::now();
        table.add_deadline(overdue_deadline("D1", now));

        let a = Arc::new(replica(&store, &locks, &table, &idem));
        let b = Arc::new(replica(&store, &locks, &table, &idem));

        let (r1, r2, r3, r4) = tokio::join!(
            a.run_scheduling_tick(now),
            b.run_scheduling_tick(now),
            a.run_scheduling_tick(now),
            b.run_scheduling_tick(now),
        );
        let total: u32 = [r1, r2, r3, r4]
            .into_iter()
            .map(|r| r.unwrap().fired)
            .sum();
        assert_eq!(total, 1);
        assert_eq!(count_triggered(&store, "D1").await, 1);
        assert!(store.verify_integrity(None, None).await.unwrap().valid);
    }

    #[tokio::test]
    async fn multi_stage_deadline_fires_each_stage_once() {
        let (store, locks, table, idem) = wiring();
        let now = Utc::now();
        let deadline = Deadline {
            id: "D2".into(),
            subject: ("Agreement".into(), "agr-1".into()),
            due_at: now,
            stages: vec![
                DeadlineStage {
                    trigger: StageTrigger::Before { ms: 86_400_000 },
                    action: deadline_triggered_action("D2", "reminder"),
                    label: "reminder".into(),
                },
                DeadlineStage {
                    trigger: StageTrigger::AtDue,
                    action: deadline_triggered_action("D2", "final"),
                    label: "final".into(),
                },
                DeadlineStage {
                    trigger: StageTrigger::After { ms: 86_400_000 },
                    action: deadline_triggered_action("D2", "overdue"),
                    label: "overdue".into(),
                },
            ],
        };
        table.add_deadline(deadline);

        let scheduler = replica(&store, &locks, &table, &idem);
        // At the due time, the reminder and the final stage are due; the
        // overdue follow-up is not.
        let report = scheduler.run_scheduling_tick(now).await.unwrap();
        assert_eq!(report.fired, 2);
        assert!(!table.deadline_complete("D2"));

        // A day later the follow-up fires.
        let later = now + Duration::milliseconds(86_400_001);
        let report = scheduler.run_scheduling_tick(later).await.unwrap();
        assert_eq!(report.fired, 1);
        assert!(table.deadline_complete("D2"));
        assert_eq!(count_triggered(&store, "D2").await, 3);
    }

    #[tokio::test]
    async fn one_shot_task_completes_after_firing() {
        let (store, locks, table, idem) = wiring();
        let now = Utc::now();
        table
            .add_task(
                ScheduledTask {
                    id: "T1".into(),
                    name: "one shot".into(),
                    schedule: Schedule::At {
                        at: now - Duration::milliseconds(10),
                    },
                    action: TaskAction::EmitEvent {
                        event_type: event_types::TASK_TRIGGERED.into(),
                        aggregate_type: "Job".into(),
                        aggregate_id: "T1".into(),
                        payload: serde_json::json!({}),
                    },
                },
                now - Duration::milliseconds(20),
            )
            .unwrap();

        let scheduler = replica(&store, &locks, &table, &idem);
        assert_eq!(scheduler.run_scheduling_tick(now).await.unwrap().fired, 1);
        assert_eq!(scheduler.run_scheduling_tick(now).await.unwrap().fired, 0);
    }

    #[tokio::test]
    async fn recurring_task_advances() {
        let (store, locks, table, idem) = wiring();
        let anchor = Utc::now() - Duration::milliseconds(10_000);
        table
            .add_task(
                ScheduledTask {
                    id: "T2".into(),
                    name: "recurring".into(),
                    schedule: Schedule::Every {
                        period_ms: 1_000,
                        anchor,
                    },
                    action: TaskAction::EmitEvent {
                        event_type: event_types::TASK_TRIGGERED.into(),
                        aggregate_type: "Job".into(),
                        aggregate_id: "T2".into(),
                        payload: serde_json::json!({}),
                    },
                },
                anchor,
            )
            .unwrap();

        let scheduler = replica(&store, &locks, &table, &idem);
        let now = Utc::now();
        assert_eq!(scheduler.run_scheduling_tick(now).await.unwrap().fired, 1);
        // Next period: fires again with a fresh idempotency key.
        let next = now + Duration::milliseconds(1_500);
        assert_eq!(scheduler.run_scheduling_tick(next).await.unwrap().fired, 1);
    }

    #[tokio::test]
    async fn hook_actions_invoke_registered_hooks() {
        let (store, locks, table, idem) = wiring();
        let now = Utc::now();
        table
            .add_task(
                ScheduledTask {
                    id: "T3".into(),
                    name: "hooky".into(),
                    schedule: Schedule::At {
                        at: now - Duration::milliseconds(10),
                    },
                    action: TaskAction::InvokeHook {
                        name: "cleanup".into(),
                        payload: serde_json::json!({"target": "tmp"}),
                    },
                },
                now - Duration::milliseconds(20),
            )
            .unwrap();

        let scheduler = replica(&store, &locks, &table, &idem);
        let invoked = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&invoked);
        scheduler.register_hook(
            "cleanup",
            Arc::new(move |payload| {
                sink.lock().unwrap().push(payload.clone());
            }),
        );

        scheduler.run_scheduling_tick(now).await.unwrap();
        assert_eq!(invoked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tick_skips_when_lock_is_held() {
        let (store, locks, table, idem) = wiring();
        let now = Utc::now();
        table.add_deadline(overdue_deadline("D1", now));

        locks.try_lock(TICK_LOCK).await;
        let scheduler = replica(&store, &locks, &table, &idem);
        let report = scheduler.run_scheduling_tick(now).await.unwrap();
        assert!(report.skipped);
        assert_eq!(count_triggered(&store, "D1").await, 0);

        locks.unlock(TICK_LOCK).await;
        assert_eq!(scheduler.run_scheduling_tick(now).await.unwrap().fired, 1);
    }

    #[tokio::test]
    async fn store_uniqueness_backstops_the_index() {
        // Even if a row were somehow presented twice, the emitted event's
        // key lands in metadata, and subscribers can deduplicate on it.
        let (store, locks, table, idem) = wiring();
        let now = Utc::now();
        table.add_deadline(overdue_deadline("D1", now));
        let scheduler = replica(&store, &locks, &table, &idem);
        scheduler.run_scheduling_tick(now).await.unwrap();

        let mut sub = store.subscribe(EventFilter::any().after(0)).await.unwrap();
        let event = sub.recv().await.unwrap();
        assert!(event.metadata_value(IDEMPOTENCY_KEY).is_some());
    }
}
