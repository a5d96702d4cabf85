// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory event store backend.
//!
//! Used by tests and single-process deployments. Obeys the same contract a
//! relational backend must provide: serialized sequence allocation (the
//! state lock is the tail lock), a unique
//! `(aggregate_type, aggregate_id, aggregate_version)` index, hash-link
//! re-verification on insert, and no update/delete surface at all.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use uuid::Uuid;

use ubl_core::chain::ChainReport;
use ubl_core::filter::EventFilter;
use ubl_core::{event_hash, ActorRef, Event, EventInput, LedgerError, LedgerResult, GENESIS_HASH};

use crate::subscription::{EventRange, Subscription};
use crate::{AggregateQuery, EventStore, StoreStats};

/// Default broadcast capacity for the fan-out channel.
const DEFAULT_FANOUT_CAPACITY: usize = 1024;

#[derive(Default)]
struct State {
    /// Dense log: `events[i]` has sequence `i + 1`.
    events: Vec<Event>,
    /// Sequence by event id.
    by_id: HashMap<Uuid, u64>,
    /// Sequences per aggregate, in version order. The vector length is the
    /// aggregate's current version — this is the unique version index.
    by_aggregate: HashMap<(String, String), Vec<u64>>,
}

pub(crate) struct Inner {
    state: RwLock<State>,
    tx: broadcast::Sender<Event>,
    appended: AtomicU64,
    lagged_resyncs: AtomicU64,
}

/// An in-memory [`EventStore`].
///
/// Cloning is cheap and shares the underlying log, which is how multiple
/// components (and multiple scheduler replicas in tests) observe one
/// installation.
#[derive(Clone)]
pub struct MemoryEventStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEventStore")
            .field("appended", &self.inner.appended.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventStore {
    /// Create an empty store with the default fan-out capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_fanout_capacity(DEFAULT_FANOUT_CAPACITY)
    }

    /// Create an empty store with the given fan-out channel capacity.
    #[must_use]
    pub fn with_fanout_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                tx,
                appended: AtomicU64::new(0),
                lagged_resyncs: AtomicU64::new(0),
            }),
        }
    }

    /// Snapshot of store counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            events_appended: self.inner.appended.load(Ordering::Relaxed),
            active_subscribers: self.inner.tx.receiver_count(),
            lagged_resyncs: self.inner.lagged_resyncs.load(Ordering::Relaxed),
        }
    }

    fn validate_input(input: &EventInput) -> LedgerResult<()> {
        if input.event_type.trim().is_empty() {
            return Err(LedgerError::invalid_event("event type must not be empty"));
        }
        if input.aggregate_type.trim().is_empty() || input.aggregate_id.trim().is_empty() {
            return Err(LedgerError::invalid_event(
                "aggregate type and id must not be empty",
            ));
        }
        if input.aggregate_version == 0 {
            return Err(LedgerError::invalid_event(
                "aggregate versions are 1-based; 0 is not a valid expected version",
            ));
        }
        if let ActorRef::Anonymous { reason } = &input.actor {
            if reason.trim().is_empty() {
                return Err(LedgerError::invalid_event(
                    "anonymous actors must carry a reason",
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, input: EventInput) -> LedgerResult<Event> {
        Self::validate_input(&input)?;

        // The write lock is the tail lock: at most one append in flight.
        let mut state = self.inner.state.write().expect("store lock poisoned");

        let key = (input.aggregate_type.clone(), input.aggregate_id.clone());
        let current_version = state.by_aggregate.get(&key).map_or(0, Vec::len) as u64;
        if input.aggregate_version != current_version + 1 {
            return Err(LedgerError::concurrency_conflict(format!(
                "aggregate {}/{} is at version {current_version}, expected append at {}",
                key.0,
                key.1,
                current_version + 1
            ))
            .with_detail("expected", serde_json::json!(current_version + 1))
            .with_detail("got", serde_json::json!(input.aggregate_version)));
        }

        let timestamp = input.timestamp.unwrap_or_else(Utc::now);
        if let Some(last_seq) = state.by_aggregate.get(&key).and_then(|v| v.last()) {
            let last = &state.events[(last_seq - 1) as usize];
            if timestamp < last.timestamp {
                return Err(LedgerError::invariant_violation(format!(
                    "aggregate {}/{} timestamps must be non-decreasing",
                    key.0, key.1
                )));
            }
        }

        let previous_hash = match state.events.last() {
            Some(tail) => {
                // Insert-time integrity check: refuse to extend a corrupted
                // tail rather than bury the break deeper.
                if event_hash(tail)? != tail.hash {
                    return Err(LedgerError::chain_broken(format!(
                        "tail event at sequence {} fails hash re-verification",
                        tail.sequence
                    )));
                }
                tail.hash.clone()
            }
            None => GENESIS_HASH.to_string(),
        };

        let sequence = state.events.len() as u64 + 1;
        let mut event = Event {
            id: ubl_core::new_event_id(),
            sequence,
            timestamp,
            event_type: input.event_type,
            aggregate_type: input.aggregate_type,
            aggregate_id: input.aggregate_id,
            aggregate_version: input.aggregate_version,
            payload: input.payload,
            causation: input.causation,
            actor: input.actor,
            previous_hash,
            hash: String::new(),
            schema_version: input.schema_version,
            metadata: input.metadata,
        };
        event.hash = event_hash(&event)?;

        state.by_id.insert(event.id, sequence);
        state.by_aggregate.entry(key).or_default().push(sequence);
        state.events.push(event.clone());
        drop(state);

        self.inner.appended.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            target: "ubl.store",
            sequence,
            event_type = %event.event_type,
            aggregate = %format!("{}/{}", event.aggregate_type, event.aggregate_id),
            version = event.aggregate_version,
            "event appended"
        );

        // No subscribers is fine; laggards resync from the log.
        let _ = self.inner.tx.send(event.clone());
        Ok(event)
    }

    async fn get_by_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        query: &AggregateQuery,
    ) -> LedgerResult<Vec<Event>> {
        let state = self.inner.state.read().expect("store lock poisoned");
        let key = (aggregate_type.to_string(), aggregate_id.to_string());
        let Some(sequences) = state.by_aggregate.get(&key) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for &seq in sequences {
            let event = &state.events[(seq - 1) as usize];
            if query.admits(event) {
                out.push(event.clone());
                if query.limit.is_some_and(|limit| out.len() >= limit) {
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn get_by_sequence(&self, from: u64, to: Option<u64>) -> LedgerResult<Vec<Event>> {
        let state = self.inner.state.read().expect("store lock poisoned");
        let len = state.events.len() as u64;
        let from = from.max(1);
        let to = to.unwrap_or(len).min(len);
        if from > to {
            return Ok(Vec::new());
        }
        Ok(state.events[(from - 1) as usize..to as usize].to_vec())
    }

    async fn get_by_id(&self, event_id: Uuid) -> LedgerResult<Option<Event>> {
        let state = self.inner.state.read().expect("store lock poisoned");
        Ok(state
            .by_id
            .get(&event_id)
            .map(|&seq| state.events[(seq - 1) as usize].clone()))
    }

    async fn get_latest(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> LedgerResult<Option<Event>> {
        let state = self.inner.state.read().expect("store lock poisoned");
        let key = (aggregate_type.to_string(), aggregate_id.to_string());
        Ok(state
            .by_aggregate
            .get(&key)
            .and_then(|seqs| seqs.last())
            .map(|&seq| state.events[(seq - 1) as usize].clone()))
    }

    async fn get_current_sequence(&self) -> LedgerResult<u64> {
        let state = self.inner.state.read().expect("store lock poisoned");
        Ok(state.events.len() as u64)
    }

    async fn list_aggregate_ids(&self, aggregate_type: &str) -> LedgerResult<Vec<String>> {
        let state = self.inner.state.read().expect("store lock poisoned");
        let ids: BTreeSet<String> = state
            .by_aggregate
            .keys()
            .filter(|(t, _)| t == aggregate_type)
            .map(|(_, id)| id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn subscribe(&self, filter: EventFilter) -> LedgerResult<Subscription> {
        let rx = self.inner.tx.subscribe();
        let current = self.get_current_sequence().await?;
        let start_after = filter.after_sequence.unwrap_or(current);

        // Catch-up phase: everything already in the log past the requested
        // position is queued before live delivery begins.
        let mut pending = VecDeque::new();
        if start_after < current {
            for event in self.get_by_sequence(start_after + 1, Some(current)).await? {
                pending.push_back(event);
            }
        }

        Ok(Subscription::new(
            rx,
            filter,
            start_after + 1,
            pending,
            Arc::clone(&self.inner) as Arc<dyn EventRange>,
        ))
    }

    async fn verify_integrity(
        &self,
        from: Option<u64>,
        to: Option<u64>,
    ) -> LedgerResult<ChainReport> {
        let events = self.get_by_sequence(from.unwrap_or(1), to).await?;
        ubl_core::chain::verify_chain(&events)
    }
}

#[async_trait]
impl EventRange for Inner {
    async fn range(&self, from: u64, to: Option<u64>) -> LedgerResult<Vec<Event>> {
        let state = self.state.read().expect("store lock poisoned");
        let len = state.events.len() as u64;
        let from = from.max(1);
        let to = to.unwrap_or(len).min(len);
        if from > to {
            return Ok(Vec::new());
        }
        Ok(state.events[(from - 1) as usize..to as usize].to_vec())
    }

    fn note_lagged_resync(&self) {
        self.lagged_resyncs.fetch_add(1, Ordering::Relaxed);
    }
}
