// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Distributed advisory locks.
pub mod lock;
/// In-memory event store backend.
pub mod memory;
/// Ordered, backfilling event subscriptions.
pub mod subscription;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use ubl_core::chain::ChainReport;
use ubl_core::filter::EventFilter;
use ubl_core::{Event, EventInput, LedgerResult};

pub use lock::{LockService, MemoryLockService};
pub use memory::MemoryEventStore;
pub use subscription::Subscription;

/// Bounds for a per-aggregate read.
///
/// All bounds are inclusive. Version and timestamp bounds compose; `limit`
/// applies last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateQuery {
    /// Lowest aggregate version to include.
    pub from_version: Option<u64>,
    /// Highest aggregate version to include.
    pub to_version: Option<u64>,
    /// Earliest timestamp to include.
    pub from_timestamp: Option<DateTime<Utc>>,
    /// Latest timestamp to include.
    pub to_timestamp: Option<DateTime<Utc>>,
    /// Maximum number of events to return.
    pub limit: Option<usize>,
}

impl AggregateQuery {
    /// A query returning the aggregate's full stream.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to versions at or above `v`.
    #[must_use]
    pub fn from_version(mut self, v: u64) -> Self {
        self.from_version = Some(v);
        self
    }

    /// Restrict to versions at or below `v`.
    #[must_use]
    pub fn to_version(mut self, v: u64) -> Self {
        self.to_version = Some(v);
        self
    }

    /// Restrict to events at or before `t`.
    #[must_use]
    pub fn to_timestamp(mut self, t: DateTime<Utc>) -> Self {
        self.to_timestamp = Some(t);
        self
    }

    /// Cap the number of returned events.
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Whether an event falls inside the query bounds.
    #[must_use]
    pub fn admits(&self, event: &Event) -> bool {
        if let Some(from) = self.from_version {
            if event.aggregate_version < from {
                return false;
            }
        }
        if let Some(to) = self.to_version {
            if event.aggregate_version > to {
                return false;
            }
        }
        if let Some(from) = self.from_timestamp {
            if event.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to_timestamp {
            if event.timestamp > to {
                return false;
            }
        }
        true
    }
}

/// The append-only event store contract.
///
/// Implementations must uphold, atomically per append:
///
/// 1. the supplied `aggregate_version` equals one past the aggregate's
///    current version (`CONCURRENCY_CONFLICT` otherwise),
/// 2. sequence assignment is serialized — no two appends race to the same
///    sequence,
/// 3. `previous_hash` links to the event at `sequence - 1` (or the genesis
///    literal), refusing with `CHAIN_BROKEN` if the tail fails
///    re-verification.
///
/// There is deliberately no update or delete in this trait; events are
/// immutable once appended.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a new event, assigning its sequence, hash, and links.
    async fn append(&self, input: EventInput) -> LedgerResult<Event>;

    /// Events for one aggregate in ascending `aggregate_version` order.
    async fn get_by_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        query: &AggregateQuery,
    ) -> LedgerResult<Vec<Event>>;

    /// Events in ascending global order, `from..=to` (open-ended when `to`
    /// is absent).
    async fn get_by_sequence(&self, from: u64, to: Option<u64>) -> LedgerResult<Vec<Event>>;

    /// Point lookup by event id.
    async fn get_by_id(&self, event_id: Uuid) -> LedgerResult<Option<Event>>;

    /// The most recent event for an aggregate, if any.
    async fn get_latest(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> LedgerResult<Option<Event>>;

    /// The last assigned sequence; 0 before any append.
    async fn get_current_sequence(&self) -> LedgerResult<u64>;

    /// All aggregate ids of a type that have at least one event.
    async fn list_aggregate_ids(&self, aggregate_type: &str) -> LedgerResult<Vec<String>>;

    /// Subscribe to newly appended events matching `filter`, delivered in
    /// strict sequence order, at-least-once. When `filter.after_sequence`
    /// names a past position the gap is backfilled before live delivery.
    async fn subscribe(&self, filter: EventFilter) -> LedgerResult<Subscription>;

    /// Walk `[from, to]` (defaults: full range) re-verifying hashes and
    /// links.
    async fn verify_integrity(
        &self,
        from: Option<u64>,
        to: Option<u64>,
    ) -> LedgerResult<ChainReport>;
}

/// Snapshot of store counters for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    /// Events appended since creation.
    pub events_appended: u64,
    /// Subscribers currently attached to the fan-out channel.
    pub active_subscribers: usize,
    /// Times a subscriber fell behind and resynced from storage.
    pub lagged_resyncs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ubl_core::{event_hash, ActorRef, GENESIS_HASH};

    fn event_at(version: u64, millis: i64) -> Event {
        let mut ev = Event {
            id: ubl_core::new_event_id(),
            sequence: version,
            timestamp: Utc.timestamp_millis_opt(millis).unwrap(),
            event_type: "Ping".into(),
            aggregate_type: "Probe".into(),
            aggregate_id: "p-1".into(),
            aggregate_version: version,
            payload: serde_json::json!({}),
            causation: None,
            actor: ActorRef::system("test"),
            previous_hash: GENESIS_HASH.into(),
            hash: String::new(),
            schema_version: None,
            metadata: None,
        };
        ev.hash = event_hash(&ev).unwrap();
        ev
    }

    #[test]
    fn query_version_bounds_inclusive() {
        let q = AggregateQuery::all().from_version(2).to_version(3);
        assert!(!q.admits(&event_at(1, 0)));
        assert!(q.admits(&event_at(2, 0)));
        assert!(q.admits(&event_at(3, 0)));
        assert!(!q.admits(&event_at(4, 0)));
    }

    #[test]
    fn query_timestamp_bounds_inclusive() {
        let q = AggregateQuery {
            to_timestamp: Some(Utc.timestamp_millis_opt(1_500).unwrap()),
            ..AggregateQuery::all()
        };
        assert!(q.admits(&event_at(1, 1_000)));
        assert!(q.admits(&event_at(2, 1_500)));
        assert!(!q.admits(&event_at(3, 2_000)));
    }

    #[test]
    fn empty_query_admits_everything() {
        let q = AggregateQuery::all();
        assert!(q.admits(&event_at(1, 0)));
        assert!(q.admits(&event_at(100, i64::MAX / 4)));
    }
}
