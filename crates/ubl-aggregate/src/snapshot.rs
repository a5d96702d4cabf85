// SPDX-License-Identifier: MIT OR Apache-2.0

//! Snapshot persistence and creation policy.
//!
//! A snapshot is a persisted checkpoint of folded state keyed by
//! `(aggregate, rehydrator version)`. Snapshots only ever accelerate
//! replay; the log remains the source of truth, so a missing or corrupt
//! snapshot degrades to a full replay and nothing else.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Serialize;

use ubl_core::{sha256_tagged, LedgerError, LedgerResult};

/// A persisted checkpoint of aggregate state.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    /// Aggregate type.
    pub aggregate_type: String,
    /// Aggregate instance.
    pub aggregate_id: String,
    /// Folded state at `aggregate_version`, as canonical JSON.
    pub state: serde_json::Value,
    /// Aggregate version the state reflects.
    pub aggregate_version: u64,
    /// Global sequence of the last folded event.
    pub sequence: u64,
    /// Rehydrator version the state was folded under.
    pub rehydrator_version: u32,
    /// Tagged digest of the canonical state JSON.
    pub state_hash: String,
}

impl Snapshot {
    /// Build a snapshot from typed state, computing its state hash.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the state cannot be serialized.
    pub fn seal<S: Serialize>(
        aggregate_type: &str,
        aggregate_id: &str,
        state: &S,
        aggregate_version: u64,
        sequence: u64,
        rehydrator_version: u32,
    ) -> LedgerResult<Self> {
        let state = serde_json::to_value(state)
            .map_err(|e| LedgerError::internal(format!("serialize snapshot state: {e}")))?;
        let state_hash = hash_state(&state)?;
        Ok(Self {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            state,
            aggregate_version,
            sequence,
            rehydrator_version,
            state_hash,
        })
    }

    /// Whether the stored state still matches its digest.
    #[must_use]
    pub fn verify_state_hash(&self) -> bool {
        hash_state(&self.state).is_ok_and(|h| h == self.state_hash)
    }
}

fn hash_state(state: &serde_json::Value) -> LedgerResult<String> {
    let json = serde_json::to_string(state)
        .map_err(|e| LedgerError::internal(format!("render snapshot state: {e}")))?;
    Ok(sha256_tagged(json.as_bytes()))
}

/// Decides when a fresh snapshot is worth persisting, evaluated after a
/// load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// Snapshot when at least this many events were replayed past the last
    /// snapshot.
    pub every: u64,
    /// Never snapshot aggregates below this version.
    pub floor: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            every: 100,
            floor: 10,
        }
    }
}

impl SnapshotPolicy {
    /// Whether a load that replayed `replayed` events to reach `version`
    /// should persist a snapshot.
    #[must_use]
    pub fn should_snapshot(&self, version: u64, replayed: u64) -> bool {
        version >= self.floor && replayed >= self.every
    }
}

/// Snapshot persistence. Append-only history per aggregate; `latest`
/// returns the newest snapshot matching the requested rehydrator version.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist a snapshot.
    async fn save(&self, snapshot: Snapshot) -> LedgerResult<()>;

    /// The newest snapshot for the aggregate folded under
    /// `rehydrator_version`, if any.
    async fn latest(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        rehydrator_version: u32,
    ) -> LedgerResult<Option<Snapshot>>;

    /// Remove all snapshots of `aggregate_type` whose rehydrator version
    /// differs from `keep_version`. Returns how many were purged.
    async fn purge_except(&self, aggregate_type: &str, keep_version: u32) -> LedgerResult<u64>;
}

/// In-memory [`SnapshotStore`].
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    by_aggregate: RwLock<HashMap<(String, String), Vec<Snapshot>>>,
}

impl MemorySnapshotStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total snapshots currently held.
    pub async fn count(&self) -> usize {
        self.by_aggregate
            .read()
            .expect("snapshot store lock poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: Snapshot) -> LedgerResult<()> {
        let key = (
            snapshot.aggregate_type.clone(),
            snapshot.aggregate_id.clone(),
        );
        self.by_aggregate
            .write()
            .expect("snapshot store lock poisoned")
            .entry(key)
            .or_default()
            .push(snapshot);
        Ok(())
    }

    async fn latest(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        rehydrator_version: u32,
    ) -> LedgerResult<Option<Snapshot>> {
        let key = (aggregate_type.to_string(), aggregate_id.to_string());
        Ok(self
            .by_aggregate
            .read()
            .expect("snapshot store lock poisoned")
            .get(&key)
            .and_then(|snaps| {
                snaps
                    .iter()
                    .rev()
                    .find(|s| s.rehydrator_version == rehydrator_version)
                    .cloned()
            }))
    }

    async fn purge_except(&self, aggregate_type: &str, keep_version: u32) -> LedgerResult<u64> {
        let mut purged = 0;
        let mut map = self
            .by_aggregate
            .write()
            .expect("snapshot store lock poisoned");
        for ((atype, _), snaps) in map.iter_mut() {
            if atype != aggregate_type {
                continue;
            }
            let before = snaps.len();
            snaps.retain(|s| s.rehydrator_version == keep_version);
            purged += (before - snaps.len()) as u64;
        }
        Ok(purged)
    }
}
