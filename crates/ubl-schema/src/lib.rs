// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! ubl-schema
//!
//! Per-event-type schema versioning with lazy upcasting.
//!
//! Stored events are never rewritten. Readers (rehydrators, projections)
//! pass events through [`SchemaRegistry::upcast_event`], which chains pure
//! payload transformers from the stored `schema_version` up to the current
//! one. A batch [`Migration`] mechanism exists for archival and corruption
//! repair, but it is policy-restricted and refuses to run unless explicitly
//! unlocked.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use ubl_core::{Event, LedgerError, LedgerResult};

/// A pure payload transformer from version `n` to version `n + 1`.
///
/// Receives the payload at the source version plus the surrounding event
/// for context (ids, timestamps); must not perform I/O.
pub type UpcastFn = Arc<dyn Fn(serde_json::Value, &Event) -> serde_json::Value + Send + Sync>;

struct TypeSchemas {
    current_version: u32,
    /// Keyed by source version: the upcaster at key `n` produces `n + 1`.
    upcasters: BTreeMap<u32, UpcastFn>,
}

/// Registry of event-type schema versions and their upcaster chains.
///
/// One registry per installation; it is a pure registry, so sharing a
/// single instance behind an [`Arc`] is the expected usage.
#[derive(Default)]
pub struct SchemaRegistry {
    types: RwLock<BTreeMap<String, TypeSchemas>>,
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let types = self.types.read().expect("schema registry lock poisoned");
        f.debug_struct("SchemaRegistry")
            .field("registered_types", &types.len())
            .finish()
    }
}

impl SchemaRegistry {
    /// Create an empty registry. Unregistered event types are treated as
    /// version 1 with no upcasters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the current schema version for an event type.
    pub fn register_type(&self, event_type: impl Into<String>, current_version: u32) {
        let mut types = self.types.write().expect("schema registry lock poisoned");
        let entry = types.entry(event_type.into()).or_insert_with(|| TypeSchemas {
            current_version: 1,
            upcasters: BTreeMap::new(),
        });
        entry.current_version = current_version;
    }

    /// Register the upcaster that lifts `event_type` payloads from
    /// `from_version` to `from_version + 1`.
    pub fn register_upcaster<F>(&self, event_type: impl Into<String>, from_version: u32, f: F)
    where
        F: Fn(serde_json::Value, &Event) -> serde_json::Value + Send + Sync + 'static,
    {
        let mut types = self.types.write().expect("schema registry lock poisoned");
        let entry = types.entry(event_type.into()).or_insert_with(|| TypeSchemas {
            current_version: 1,
            upcasters: BTreeMap::new(),
        });
        entry.upcasters.insert(from_version, Arc::new(f));
    }

    /// The declared current version for an event type (1 if unregistered).
    #[must_use]
    pub fn current_version(&self, event_type: &str) -> u32 {
        let types = self.types.read().expect("schema registry lock poisoned");
        types.get(event_type).map_or(1, |t| t.current_version)
    }

    /// Upcast an event's payload to the current schema version.
    ///
    /// Events already at (or above) the current version pass through
    /// untouched. Otherwise the chain is applied in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`ubl_core::ErrorKind::InvalidEvent`] when a link in the
    /// chain is missing, since feeding a half-upcast payload to a reader
    /// would corrupt derived state.
    pub fn upcast(&self, event: &Event) -> LedgerResult<serde_json::Value> {
        let types = self.types.read().expect("schema registry lock poisoned");
        let Some(schemas) = types.get(&event.event_type) else {
            return Ok(event.payload.clone());
        };
        let stored = event.schema_version();
        if stored >= schemas.current_version {
            return Ok(event.payload.clone());
        }

        let mut payload = event.payload.clone();
        for version in stored..schemas.current_version {
            let Some(upcaster) = schemas.upcasters.get(&version) else {
                return Err(LedgerError::invalid_event(format!(
                    "no upcaster for {} v{} -> v{}",
                    event.event_type,
                    version,
                    version + 1
                )));
            };
            payload = upcaster(payload, event);
        }
        tracing::debug!(
            target: "ubl.schema",
            event_type = %event.event_type,
            from = stored,
            to = schemas.current_version,
            "payload upcast"
        );
        Ok(payload)
    }

    /// Return a copy of the event with its payload upcast and the schema
    /// version stamped to current. The stored original is untouched.
    ///
    /// # Errors
    ///
    /// Propagates the same errors as [`SchemaRegistry::upcast`].
    pub fn upcast_event(&self, event: &Event) -> LedgerResult<Event> {
        let payload = self.upcast(event)?;
        let mut out = event.clone();
        out.payload = payload;
        out.schema_version = Some(self.current_version(&event.event_type));
        Ok(out)
    }
}

/// Gate controlling the batch [`Migration`] mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationPolicy {
    /// Refuse to run. The default.
    #[default]
    Restricted,
    /// Explicitly unlocked by an operator for archival or corruption repair.
    Unlocked,
}

/// Outcome of a batch migration pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Events inspected.
    pub scanned: u64,
    /// Events whose payload required upcasting.
    pub upcast: u64,
    /// Events skipped because they were already current.
    pub current: u64,
}

/// Batch transformation over stored events.
///
/// Migration never rewrites storage: it produces transformed copies for an
/// archival sink the caller supplies. It exists for exceptional use only
/// and refuses to run under [`MigrationPolicy::Restricted`].
#[derive(Debug)]
pub struct Migration<'a> {
    registry: &'a SchemaRegistry,
    policy: MigrationPolicy,
}

impl<'a> Migration<'a> {
    /// Create a migration over the given registry.
    #[must_use]
    pub fn new(registry: &'a SchemaRegistry, policy: MigrationPolicy) -> Self {
        Self { registry, policy }
    }

    /// Run the migration over a batch of events, feeding each transformed
    /// event to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`ubl_core::ErrorKind::Unauthorized`] under
    /// [`MigrationPolicy::Restricted`], or an upcasting error from the
    /// registry.
    pub fn run<F>(&self, events: &[Event], mut sink: F) -> LedgerResult<MigrationReport>
    where
        F: FnMut(Event),
    {
        if self.policy == MigrationPolicy::Restricted {
            return Err(LedgerError::unauthorized(
                "batch migration is policy-restricted; unlock explicitly for archival or repair",
            ));
        }
        let mut report = MigrationReport {
            scanned: 0,
            upcast: 0,
            current: 0,
        };
        for event in events {
            report.scanned += 1;
            let stored = event.schema_version();
            let current = self.registry.current_version(&event.event_type);
            if stored >= current {
                report.current += 1;
                sink(event.clone());
                continue;
            }
            report.upcast += 1;
            sink(self.registry.upcast_event(event)?);
        }
        tracing::info!(
            target: "ubl.schema",
            scanned = report.scanned,
            upcast = report.upcast,
            "migration pass complete"
        );
        Ok(report)
    }
}
