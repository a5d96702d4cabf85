// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! ubl-projection
//!
//! Denormalized read models kept eventually consistent with the ledger.
//! Each projection declares the event types it consumes and a handler; the
//! manager drives it from a persisted checkpoint, advancing only after the
//! handler succeeds, retrying with exponential backoff, and parking the
//! projection in an error state (offending sequence preserved) when
//! retries are exhausted. A rebuild discards state and replays from zero.

/// Incremental search indexing with consistency tracking.
pub mod indexer;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use ubl_core::{Event, LedgerError, LedgerResult};
use ubl_store::EventStore;

pub use indexer::{
    MemorySearchEngine, Pagination, SearchDocument, SearchEngine, SearchIndexer, SearchResults,
};

/// A read model over the event stream.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Stable projection name; keys the checkpoint.
    fn name(&self) -> &str;

    /// Event types this projection consumes. Empty means all.
    fn subscribes_to(&self) -> Vec<String> {
        Vec::new()
    }

    /// Fold one event into the read model. Must be idempotent for a given
    /// `(name, sequence)`: the manager may redeliver across restarts.
    async fn handle(&self, event: &Event) -> LedgerResult<()>;

    /// Discard all derived state, ahead of a rebuild.
    async fn reset(&self) -> LedgerResult<()> {
        Ok(())
    }
}

/// Checkpoint persistence: `(projection_name, sequence)`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last successfully handled sequence; 0 when never advanced.
    async fn load(&self, name: &str) -> LedgerResult<u64>;
    /// Persist the checkpoint.
    async fn save(&self, name: &str, sequence: u64) -> LedgerResult<()>;
    /// Reset the checkpoint to 0.
    async fn reset(&self, name: &str) -> LedgerResult<()>;
}

/// In-memory [`CheckpointStore`].
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, u64>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, name: &str) -> LedgerResult<u64> {
        Ok(*self
            .checkpoints
            .read()
            .expect("checkpoint lock poisoned")
            .get(name)
            .unwrap_or(&0))
    }

    async fn save(&self, name: &str, sequence: u64) -> LedgerResult<()> {
        self.checkpoints
            .write()
            .expect("checkpoint lock poisoned")
            .insert(name.to_string(), sequence);
        Ok(())
    }

    async fn reset(&self, name: &str) -> LedgerResult<()> {
        self.checkpoints
            .write()
            .expect("checkpoint lock poisoned")
            .remove(name);
        Ok(())
    }
}

/// Exponential backoff for failing projection handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first failure before parking the projection.
    pub max_retries: u32,
    /// Delay before the first retry; doubles each attempt.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 50,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.base_delay_ms.saturating_mul(1u64 << attempt.min(16))
    }
}

/// Health of a registered projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionStatus {
    /// Processing normally.
    Live,
    /// Retries exhausted; stopped at the offending sequence.
    Error {
        /// Sequence whose handling failed.
        at_sequence: u64,
        /// Final error message.
        message: String,
    },
}

struct Entry {
    projection: Arc<dyn Projection>,
    status: Mutex<ProjectionStatus>,
}

/// Drives registered projections from their checkpoints.
pub struct ProjectionManager {
    store: Arc<dyn EventStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    retry: RetryPolicy,
    entries: RwLock<Vec<Arc<Entry>>>,
}

impl std::fmt::Debug for ProjectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read().expect("projection registry poisoned");
        f.debug_struct("ProjectionManager")
            .field("projections", &entries.len())
            .finish_non_exhaustive()
    }
}

/// Batch size for catch-up reads.
const CATCH_UP_BATCH: u64 = 256;

impl ProjectionManager {
    /// Wire a manager over the given store and checkpoint persistence.
    pub fn new(store: Arc<dyn EventStore>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            checkpoints,
            retry: RetryPolicy::default(),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Register a projection. Registration order is delivery order within a
    /// catch-up pass.
    pub fn register(&self, projection: Arc<dyn Projection>) {
        self.entries
            .write()
            .expect("projection registry poisoned")
            .push(Arc::new(Entry {
                projection,
                status: Mutex::new(ProjectionStatus::Live),
            }));
    }

    /// Names of all registered projections.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("projection registry poisoned")
            .iter()
            .map(|e| e.projection.name().to_string())
            .collect()
    }

    /// Current status of a projection.
    pub fn status(&self, name: &str) -> Option<ProjectionStatus> {
        self.find(name)
            .map(|e| e.status.lock().expect("status lock poisoned").clone())
    }

    /// Eventual-consistency marker: events not yet applied.
    ///
    /// # Errors
    ///
    /// Propagates store and checkpoint failures.
    pub async fn lag(&self, name: &str) -> LedgerResult<u64> {
        let current = self.store.get_current_sequence().await?;
        let checkpoint = self.checkpoints.load(name).await?;
        Ok(current.saturating_sub(checkpoint))
    }

    /// Process every registered projection until it reaches the current
    /// head. Returns the total number of events handled.
    ///
    /// # Errors
    ///
    /// Propagates store and checkpoint failures. Handler failures do not
    /// error the pass; they park the projection (see
    /// [`ProjectionManager::status`]).
    pub async fn catch_up(&self) -> LedgerResult<u64> {
        let entries: Vec<Arc<Entry>> = self
            .entries
            .read()
            .expect("projection registry poisoned")
            .clone();
        let mut handled = 0;
        for entry in entries {
            handled += self.catch_up_entry(&entry).await?;
        }
        Ok(handled)
    }

    /// Process a single projection to the current head.
    ///
    /// # Errors
    ///
    /// Returns `NOT_FOUND` for an unregistered name; otherwise as
    /// [`ProjectionManager::catch_up`].
    pub async fn catch_up_one(&self, name: &str) -> LedgerResult<u64> {
        let entry = self
            .find(name)
            .ok_or_else(|| LedgerError::not_found(format!("projection {name} not registered")))?;
        self.catch_up_entry(&entry).await
    }

    /// Discard a projection's state and checkpoint, then replay from the
    /// beginning.
    ///
    /// # Errors
    ///
    /// As [`ProjectionManager::catch_up_one`], plus reset failures.
    pub async fn rebuild(&self, name: &str) -> LedgerResult<u64> {
        let entry = self
            .find(name)
            .ok_or_else(|| LedgerError::not_found(format!("projection {name} not registered")))?;
        entry.projection.reset().await?;
        self.checkpoints.reset(name).await?;
        *entry.status.lock().expect("status lock poisoned") = ProjectionStatus::Live;
        tracing::info!(target: "ubl.projection", projection = name, "rebuild started");
        self.catch_up_entry(&entry).await
    }

    fn find(&self, name: &str) -> Option<Arc<Entry>> {
        self.entries
            .read()
            .expect("projection registry poisoned")
            .iter()
            .find(|e| e.projection.name() == name)
            .cloned()
    }

    async fn catch_up_entry(&self, entry: &Entry) -> LedgerResult<u64> {
        if matches!(
            *entry.status.lock().expect("status lock poisoned"),
            ProjectionStatus::Error { .. }
        ) {
            return Ok(0);
        }

        let name = entry.projection.name().to_string();
        let interested: Vec<String> = entry.projection.subscribes_to();
        let mut checkpoint = self.checkpoints.load(&name).await?;
        let mut handled = 0;

        loop {
            let head = self.store.get_current_sequence().await?;
            if checkpoint >= head {
                return Ok(handled);
            }
            let to = (checkpoint + CATCH_UP_BATCH).min(head);
            let batch = self.store.get_by_sequence(checkpoint + 1, Some(to)).await?;
            for event in batch {
                let wanted =
                    interested.is_empty() || interested.iter().any(|t| t == &event.event_type);
                if wanted {
                    match self.handle_with_retry(entry, &event).await {
                        Ok(()) => handled += 1,
                        Err(e) => {
                            *entry.status.lock().expect("status lock poisoned") =
                                ProjectionStatus::Error {
                                    at_sequence: event.sequence,
                                    message: e.to_string(),
                                };
                            tracing::error!(
                                target: "ubl.projection",
                                projection = %name,
                                sequence = event.sequence,
                                error = %e,
                                "projection parked after exhausting retries"
                            );
                            return Ok(handled);
                        }
                    }
                }
                // The checkpoint advances over filtered-out events too;
                // they are trivially handled.
                checkpoint = event.sequence;
                self.checkpoints.save(&name, checkpoint).await?;
            }
        }
    }

    async fn handle_with_retry(&self, entry: &Entry, event: &Event) -> LedgerResult<()> {
        let mut attempt = 0;
        loop {
            match entry.projection.handle(event).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_ms(attempt);
                    tracing::warn!(
                        target: "ubl.projection",
                        projection = %entry.projection.name(),
                        sequence = event.sequence,
                        attempt,
                        delay_ms = delay,
                        error = %e,
                        "projection handler failed; backing off"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
