// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! ubl-aggregate
//!
//! Deterministic state reconstruction: an aggregate's state is nothing but
//! the fold of its events. A [`Rehydrator`] supplies the initial state and
//! the pure `apply` step; the [`Repository`] composes rehydrators with the
//! event store, the schema registry (lazy upcasting), and the snapshot
//! store (replay acceleration).

/// Snapshot persistence and creation policy.
pub mod snapshot;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use ubl_core::{Event, LedgerError, LedgerResult};
use ubl_schema::SchemaRegistry;
use ubl_store::{AggregateQuery, EventStore};

pub use snapshot::{MemorySnapshotStore, Snapshot, SnapshotPolicy, SnapshotStore};

/// A pure fold turning events into aggregate state.
///
/// `apply` must be total, deterministic, and side-effect-free: replaying
/// the same event sequence yields equal state every time. Bump
/// [`Rehydrator::version`] whenever `apply`'s semantics change so stale
/// snapshots are invalidated.
pub trait Rehydrator: Send + Sync {
    /// The derived state type.
    type State: Clone + Serialize + DeserializeOwned + Send + Sync;

    /// The aggregate type this rehydrator folds (e.g. `"Agreement"`).
    fn aggregate_type(&self) -> &str;

    /// Declared fold version; snapshots taken under a different version
    /// are ignored and purged.
    fn version(&self) -> u32;

    /// State before any event has been applied.
    fn initial_state(&self) -> Self::State;

    /// Fold one event into the state.
    fn apply(&self, state: Self::State, event: &Event) -> Self::State;
}

/// A rehydrated aggregate with its stream position.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<S> {
    /// The folded state.
    pub state: S,
    /// The aggregate's current version (equals its event count).
    pub version: u64,
    /// Global sequence of the aggregate's most recent event.
    pub last_sequence: u64,
}

/// Composes a [`Rehydrator`] with the event store, schema registry, and
/// snapshot store.
pub struct Repository<R: Rehydrator> {
    store: Arc<dyn EventStore>,
    schema: Arc<SchemaRegistry>,
    snapshots: Arc<dyn SnapshotStore>,
    rehydrator: R,
    policy: SnapshotPolicy,
}

impl<R: Rehydrator> std::fmt::Debug for Repository<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("aggregate_type", &self.rehydrator.aggregate_type())
            .field("rehydrator_version", &self.rehydrator.version())
            .finish_non_exhaustive()
    }
}

impl<R: Rehydrator> Repository<R> {
    /// Wire a repository over the given collaborators.
    pub fn new(
        store: Arc<dyn EventStore>,
        schema: Arc<SchemaRegistry>,
        snapshots: Arc<dyn SnapshotStore>,
        rehydrator: R,
    ) -> Self {
        Self {
            store,
            schema,
            snapshots,
            rehydrator,
            policy: SnapshotPolicy::default(),
        }
    }

    /// Override the snapshot creation policy.
    #[must_use]
    pub fn with_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The aggregate type this repository serves.
    #[must_use]
    pub fn aggregate_type(&self) -> &str {
        self.rehydrator.aggregate_type()
    }

    /// Purge snapshots taken under a different rehydrator version. Run at
    /// startup.
    ///
    /// # Errors
    ///
    /// Propagates snapshot store failures.
    pub async fn invalidate_stale_snapshots(&self) -> LedgerResult<u64> {
        let purged = self
            .snapshots
            .purge_except(self.rehydrator.aggregate_type(), self.rehydrator.version())
            .await?;
        if purged > 0 {
            tracing::info!(
                target: "ubl.aggregate",
                aggregate_type = %self.rehydrator.aggregate_type(),
                purged,
                "stale snapshots invalidated"
            );
        }
        Ok(purged)
    }

    /// Reconstruct current state: latest valid snapshot plus the event
    /// suffix, or a full replay when no usable snapshot exists.
    ///
    /// Returns `None` for an aggregate with no events.
    ///
    /// # Errors
    ///
    /// Propagates store, schema, and snapshot failures.
    pub async fn load(&self, aggregate_id: &str) -> LedgerResult<Option<Loaded<R::State>>> {
        let aggregate_type = self.rehydrator.aggregate_type();

        let snapshot = match self
            .snapshots
            .latest(aggregate_type, aggregate_id, self.rehydrator.version())
            .await?
        {
            Some(snap) if snap.verify_state_hash() => Some(snap),
            Some(snap) => {
                // A corrupt snapshot is discarded, not fatal: the log is
                // still the source of truth.
                tracing::warn!(
                    target: "ubl.aggregate",
                    aggregate = %format!("{aggregate_type}/{aggregate_id}"),
                    version = snap.aggregate_version,
                    "snapshot failed state-hash verification; replaying from zero"
                );
                None
            }
            None => None,
        };

        let (mut state, mut version, mut last_sequence) = match &snapshot {
            Some(snap) => (
                serde_json::from_value::<R::State>(snap.state.clone()).map_err(|e| {
                    LedgerError::internal(format!("deserialize snapshot state: {e}"))
                })?,
                snap.aggregate_version,
                snap.sequence,
            ),
            None => (self.rehydrator.initial_state(), 0, 0),
        };

        let query = AggregateQuery::all().from_version(version + 1);
        let events = self
            .store
            .get_by_aggregate(aggregate_type, aggregate_id, &query)
            .await?;
        if version == 0 && events.is_empty() {
            return Ok(None);
        }

        let replayed = events.len() as u64;
        for event in &events {
            let event = self.schema.upcast_event(event)?;
            state = self.rehydrator.apply(state, &event);
            version = event.aggregate_version;
            last_sequence = event.sequence;
        }

        self.maybe_snapshot(aggregate_id, &state, version, last_sequence, replayed)
            .await?;

        Ok(Some(Loaded {
            state,
            version,
            last_sequence,
        }))
    }

    /// Reconstruct state as of an aggregate version (inclusive).
    ///
    /// Temporal queries never consult snapshots; they replay from zero and
    /// stop at the first event exceeding the bound.
    ///
    /// # Errors
    ///
    /// Propagates store and schema failures.
    pub async fn load_at_version(
        &self,
        aggregate_id: &str,
        at_version: u64,
    ) -> LedgerResult<Option<Loaded<R::State>>> {
        let query = AggregateQuery::all().to_version(at_version);
        self.replay(aggregate_id, &query).await
    }

    /// Reconstruct state as of a timestamp (inclusive).
    ///
    /// # Errors
    ///
    /// Propagates store and schema failures.
    pub async fn load_at_timestamp(
        &self,
        aggregate_id: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<Option<Loaded<R::State>>> {
        let query = AggregateQuery {
            to_timestamp: Some(at),
            ..AggregateQuery::all()
        };
        self.replay(aggregate_id, &query).await
    }

    async fn replay(
        &self,
        aggregate_id: &str,
        query: &AggregateQuery,
    ) -> LedgerResult<Option<Loaded<R::State>>> {
        let events = self
            .store
            .get_by_aggregate(self.rehydrator.aggregate_type(), aggregate_id, query)
            .await?;
        if events.is_empty() {
            return Ok(None);
        }
        let mut state = self.rehydrator.initial_state();
        let mut version = 0;
        let mut last_sequence = 0;
        for event in &events {
            let event = self.schema.upcast_event(event)?;
            state = self.rehydrator.apply(state, &event);
            version = event.aggregate_version;
            last_sequence = event.sequence;
        }
        Ok(Some(Loaded {
            state,
            version,
            last_sequence,
        }))
    }

    async fn maybe_snapshot(
        &self,
        aggregate_id: &str,
        state: &R::State,
        version: u64,
        sequence: u64,
        replayed: u64,
    ) -> LedgerResult<()> {
        if !self.policy.should_snapshot(version, replayed) {
            return Ok(());
        }
        let snap = Snapshot::seal(
            self.rehydrator.aggregate_type(),
            aggregate_id,
            state,
            version,
            sequence,
            self.rehydrator.version(),
        )?;
        tracing::debug!(
            target: "ubl.aggregate",
            aggregate = %format!("{}/{aggregate_id}", self.rehydrator.aggregate_type()),
            version,
            "snapshot created"
        );
        self.snapshots.save(snap).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubl_core::{ActorRef, EventInputBuilder};
    use ubl_store::MemoryEventStore;

    /// Toy aggregate: a counter that sums payload `delta` fields.
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Counter {
        total: i64,
        events_seen: u64,
    }

    struct CounterRehydrator;

    impl Rehydrator for CounterRehydrator {
        type State = Counter;

        fn aggregate_type(&self) -> &str {
            "Counter"
        }

        fn version(&self) -> u32 {
            1
        }

        fn initial_state(&self) -> Counter {
            Counter {
                total: 0,
                events_seen: 0,
            }
        }

        fn apply(&self, mut state: Counter, event: &Event) -> Counter {
            state.total += event.payload["delta"].as_i64().unwrap_or(0);
            state.events_seen += 1;
            state
        }
    }

    fn wiring() -> (Arc<MemoryEventStore>, Repository<CounterRehydrator>) {
        let store = Arc::new(MemoryEventStore::new());
        let repo = Repository::new(
            store.clone(),
            Arc::new(SchemaRegistry::new()),
            Arc::new(MemorySnapshotStore::new()),
            CounterRehydrator,
        );
        (store, repo)
    }

    async fn bump(store: &MemoryEventStore, id: &str, version: u64, delta: i64, millis: i64) {
        use chrono::TimeZone;
        let input = EventInputBuilder::new("CounterBumped", "Counter", id)
            .version(version)
            .payload(serde_json::json!({ "delta": delta }))
            .actor(ActorRef::system("test"))
            .timestamp(chrono::Utc.timestamp_millis_opt(millis).unwrap())
            .build();
        store.append(input).await.unwrap();
    }

    #[tokio::test]
    async fn missing_aggregate_loads_none() {
        let (_store, repo) = wiring();
        assert!(repo.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_folds_all_events() {
        let (store, repo) = wiring();
        bump(&store, "c-1", 1, 5, 1_000).await;
        bump(&store, "c-1", 2, -2, 2_000).await;
        bump(&store, "c-1", 3, 10, 3_000).await;

        let loaded = repo.load("c-1").await.unwrap().unwrap();
        assert_eq!(loaded.state.total, 13);
        assert_eq!(loaded.version, 3);
        assert_eq!(loaded.last_sequence, 3);
    }

    #[tokio::test]
    async fn temporal_load_stops_at_version_bound() {
        let (store, repo) = wiring();
        bump(&store, "c-1", 1, 5, 1_000).await;
        bump(&store, "c-1", 2, 7, 2_000).await;
        bump(&store, "c-1", 3, 11, 3_000).await;

        let at_two = repo.load_at_version("c-1", 2).await.unwrap().unwrap();
        assert_eq!(at_two.state.total, 12);
        assert_eq!(at_two.version, 2);
    }

    #[tokio::test]
    async fn temporal_load_stops_at_timestamp_bound() {
        use chrono::TimeZone;
        let (store, repo) = wiring();
        bump(&store, "c-1", 1, 5, 1_000).await;
        bump(&store, "c-1", 2, 7, 2_000).await;
        bump(&store, "c-1", 3, 11, 3_000).await;

        let mid = chrono::Utc.timestamp_millis_opt(1_500).unwrap();
        let loaded = repo.load_at_timestamp("c-1", mid).await.unwrap().unwrap();
        assert_eq!(loaded.state.total, 5);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn snapshot_accelerated_load_matches_full_replay() {
        let (store, _) = wiring();
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let repo = Repository::new(
            store.clone(),
            Arc::new(SchemaRegistry::new()),
            snapshots.clone(),
            CounterRehydrator,
        )
        .with_policy(SnapshotPolicy { every: 5, floor: 5 });

        for v in 1..=12 {
            bump(&store, "c-1", v, 1, 1_000 * v as i64).await;
        }

        // First load snapshots at v12; second load starts from it.
        let first = repo.load("c-1").await.unwrap().unwrap();
        assert!(snapshots.count().await > 0);
        let second = repo.load("c-1").await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(second.state.total, 12);
    }

    #[tokio::test]
    async fn stale_rehydrator_version_forces_full_replay() {
        let (store, _) = wiring();
        let snapshots = Arc::new(MemorySnapshotStore::new());
        for v in 1..=6 {
            bump(&store, "c-1", v, 2, 1_000 * v as i64).await;
        }

        // Seed a snapshot under an old rehydrator version.
        let stale = Snapshot::seal(
            "Counter",
            "c-1",
            &Counter {
                total: 999,
                events_seen: 3,
            },
            3,
            3,
            99,
        )
        .unwrap();
        snapshots.save(stale).await.unwrap();

        let repo = Repository::new(
            store,
            Arc::new(SchemaRegistry::new()),
            snapshots.clone(),
            CounterRehydrator,
        );
        let loaded = repo.load("c-1").await.unwrap().unwrap();
        // The poisoned total never surfaces: versions differ, so replay
        // starts from zero.
        assert_eq!(loaded.state.total, 12);

        assert_eq!(repo.invalidate_stale_snapshots().await.unwrap(), 1);
        assert_eq!(snapshots.count().await, 0);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_discarded() {
        let (store, _) = wiring();
        let snapshots = Arc::new(MemorySnapshotStore::new());
        for v in 1..=4 {
            bump(&store, "c-1", v, 3, 1_000 * v as i64).await;
        }

        let mut snap = Snapshot::seal(
            "Counter",
            "c-1",
            &Counter {
                total: 6,
                events_seen: 2,
            },
            2,
            2,
            1,
        )
        .unwrap();
        snap.state = serde_json::json!({ "total": -1000, "events_seen": 2 });
        snapshots.save(snap).await.unwrap();

        let repo = Repository::new(
            store,
            Arc::new(SchemaRegistry::new()),
            snapshots,
            CounterRehydrator,
        );
        let loaded = repo.load("c-1").await.unwrap().unwrap();
        assert_eq!(loaded.state.total, 12);
    }

    #[tokio::test]
    async fn replay_is_deterministic() {
        let (store, repo) = wiring();
        for v in 1..=8 {
            bump(&store, "c-1", v, v as i64, 1_000 * v as i64).await;
        }
        let a = repo.load("c-1").await.unwrap().unwrap();
        let b = repo.load("c-1").await.unwrap().unwrap();
        assert_eq!(a, b);
    }
}
