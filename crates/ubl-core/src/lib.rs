// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! ubl-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the business ledger.
//!
//! If you only take one dependency, take this one.

/// Hash chain verification over event sequences.
pub mod chain;
/// Comprehensive error catalog for the ledger core.
pub mod error;
/// Event filtering for subscriptions and reads.
pub mod filter;
/// Authorization scopes and containment rules.
pub mod scope;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

pub use error::{ErrorKind, LedgerError, LedgerResult};

/// Literal `previous_hash` of the first event in an installation.
///
/// # Examples
///
/// ```
/// assert_eq!(ubl_core::GENESIS_HASH, "genesis");
/// ```
pub const GENESIS_HASH: &str = "genesis";

/// Algorithm tag prefixed to every computed digest.
pub const HASH_PREFIX: &str = "sha256:";

/// A single appended ledger record. The only write the system knows.
///
/// Events are immutable once persisted: `sequence` orders them globally,
/// `aggregate_version` orders them within one aggregate, and `previous_hash`
/// links each event to its predecessor so that tampering is detectable.
///
/// Use [`EventInput`] to request an append; the store fills in `id`,
/// `sequence`, `previous_hash`, and `hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    /// Unique, time-sortable identifier (UUID v7).
    pub id: Uuid,

    /// Global position, 1-based, strictly increasing and gap-free.
    pub sequence: u64,

    /// Wall-clock milliseconds since the Unix epoch.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    #[schemars(with = "i64")]
    pub timestamp: DateTime<Utc>,

    /// Event kind (e.g. `"AgreementProposed"`).
    #[serde(rename = "type")]
    pub event_type: String,

    /// Aggregate type this event targets (e.g. `"Agreement"`).
    pub aggregate_type: String,

    /// Aggregate instance this event targets.
    pub aggregate_id: String,

    /// 1-based position within the aggregate's own stream.
    pub aggregate_version: u64,

    /// Opaque structured payload, interpreted only by rehydrators and
    /// projections.
    pub payload: serde_json::Value,

    /// Optional command/correlation/workflow provenance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation: Option<CausationRefs>,

    /// Who (or what) caused this event.
    pub actor: ActorRef,

    /// Hash of the prior event in global order, or [`GENESIS_HASH`].
    pub previous_hash: String,

    /// Canonical hash of all other fields (see [`event_hash`]).
    pub hash: String,

    /// Payload schema version; absent means 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,

    /// Free-form annotations (idempotency keys, trace ids, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

impl Event {
    /// Payload schema version, defaulting to 1 when absent.
    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.schema_version.unwrap_or(1)
    }

    /// Look up a metadata value by key.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }
}

/// An append request: everything the caller supplies, nothing the store
/// computes.
///
/// `aggregate_version` is the caller's optimistic-concurrency claim: it must
/// equal one past the aggregate's current version or the append fails with
/// [`ErrorKind::ConcurrencyConflict`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EventInput {
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Target aggregate type.
    pub aggregate_type: String,

    /// Target aggregate instance.
    pub aggregate_id: String,

    /// Expected next version for the aggregate (1-based).
    pub aggregate_version: u64,

    /// Structured payload.
    pub payload: serde_json::Value,

    /// Optional provenance references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation: Option<CausationRefs>,

    /// Originating actor.
    pub actor: ActorRef,

    /// Payload schema version; absent means current.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,

    /// Free-form annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,

    /// Event time override. Absent means "now" at append time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Who (or what) caused an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActorRef {
    /// The installation itself, optionally narrowed to a component.
    System {
        /// Stable system identifier.
        system_id: String,
        /// Component within the system (e.g. `"scheduler"`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        component: Option<String>,
    },
    /// A party (entity) acting on its own behalf.
    Party {
        /// Entity identifier of the party.
        party_id: String,
    },
    /// A workflow instance acting as part of its execution.
    Workflow {
        /// Workflow instance identifier.
        workflow_id: String,
    },
    /// An unauthenticated actor. Always carries a reason.
    Anonymous {
        /// Why an anonymous write was accepted.
        reason: String,
    },
}

impl ActorRef {
    /// Shorthand for a system actor with no component.
    #[must_use]
    pub fn system(system_id: impl Into<String>) -> Self {
        Self::System {
            system_id: system_id.into(),
            component: None,
        }
    }

    /// Shorthand for a system actor narrowed to a component.
    #[must_use]
    pub fn system_component(system_id: impl Into<String>, component: impl Into<String>) -> Self {
        Self::System {
            system_id: system_id.into(),
            component: Some(component.into()),
        }
    }

    /// Shorthand for a party actor.
    #[must_use]
    pub fn party(party_id: impl Into<String>) -> Self {
        Self::Party {
            party_id: party_id.into(),
        }
    }

    /// Shorthand for a workflow actor.
    #[must_use]
    pub fn workflow(workflow_id: impl Into<String>) -> Self {
        Self::Workflow {
            workflow_id: workflow_id.into(),
        }
    }

    /// The party's entity id, if this actor is a party.
    #[must_use]
    pub fn party_id(&self) -> Option<&str> {
        match self {
            Self::Party { party_id } => Some(party_id),
            _ => None,
        }
    }
}

/// Optional references linking an event to the command, correlation, and
/// workflow that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CausationRefs {
    /// Command that requested the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,

    /// Correlation across a multi-event exchange.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Workflow instance the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
}

/// A half-open validity window.
///
/// # Examples
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use ubl_core::Validity;
///
/// let v = Validity {
///     effective_from: Utc.timestamp_millis_opt(1_000).unwrap(),
///     effective_until: Some(Utc.timestamp_millis_opt(2_000).unwrap()),
/// };
/// assert!(v.covers(Utc.timestamp_millis_opt(1_500).unwrap()));
/// assert!(!v.covers(Utc.timestamp_millis_opt(2_500).unwrap()));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Validity {
    /// Inclusive start of the window.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    #[schemars(with = "i64")]
    pub effective_from: DateTime<Utc>,

    /// Exclusive end of the window; absent means open-ended.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    #[schemars(with = "Option<i64>")]
    pub effective_until: Option<DateTime<Utc>>,
}

impl Validity {
    /// A window starting at `from` with no end.
    #[must_use]
    pub fn from(from: DateTime<Utc>) -> Self {
        Self {
            effective_from: from,
            effective_until: None,
        }
    }

    /// Whether the window covers the given instant.
    #[must_use]
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        if at < self.effective_from {
            return false;
        }
        match self.effective_until {
            Some(until) => at < until,
            None => true,
        }
    }
}

/// Allocate a new time-sortable event identifier.
#[must_use]
pub fn new_event_id() -> Uuid {
    Uuid::now_v7()
}

/// Compute the hex-encoded SHA-256 digest of `bytes`, tagged with the
/// algorithm prefix.
#[must_use]
pub fn sha256_tagged(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{HASH_PREFIX}{:x}", hasher.finalize())
}

/// Produce the canonical JSON form of an event for hashing.
///
/// The representation is deterministic: keys sorted lexicographically
/// (`serde_json::Map` is a `BTreeMap` by default), UTF-8, no insignificant
/// whitespace, integers in their shortest decimal form, absent optional
/// fields omitted. The `hash` field itself is never part of the
/// representation.
///
/// # Errors
///
/// Returns [`ErrorKind::InvalidEvent`] if the event cannot be serialized.
pub fn canonical_event_json(event: &Event) -> LedgerResult<String> {
    let mut v = serde_json::to_value(event)
        .map_err(|e| LedgerError::invalid_event(format!("serialize event: {e}")))?;
    if let serde_json::Value::Object(map) = &mut v {
        map.remove("hash");
    }
    serde_json::to_string(&v)
        .map_err(|e| LedgerError::invalid_event(format!("render canonical json: {e}")))
}

/// Compute the canonical hash of an event.
///
/// **Gotcha:** the stored `hash` field is excluded from the input, otherwise
/// the hash would be self-referential. The stored value of `hash` therefore
/// never influences the result.
///
/// # Errors
///
/// Returns [`ErrorKind::InvalidEvent`] if the event cannot be serialized.
pub fn event_hash(event: &Event) -> LedgerResult<String> {
    let json = canonical_event_json(event)?;
    Ok(sha256_tagged(json.as_bytes()))
}

/// Returns `true` if the event's stored hash matches its recomputed
/// canonical hash.
///
/// # Errors
///
/// Returns [`ErrorKind::InvalidEvent`] if the event cannot be serialized.
pub fn verify_event_hash(event: &Event) -> LedgerResult<bool> {
    Ok(event.hash == event_hash(event)?)
}

/// Builder for constructing [`EventInput`]s ergonomically.
///
/// # Examples
///
/// ```
/// use ubl_core::{ActorRef, EventInputBuilder};
///
/// let input = EventInputBuilder::new("EntityCreated", "Entity", "ent-1")
///     .version(1)
///     .actor(ActorRef::system("ledger"))
///     .payload(serde_json::json!({"name": "Acme"}))
///     .build();
///
/// assert_eq!(input.event_type, "EntityCreated");
/// assert_eq!(input.aggregate_version, 1);
/// ```
#[derive(Debug, Clone)]
pub struct EventInputBuilder {
    event_type: String,
    aggregate_type: String,
    aggregate_id: String,
    aggregate_version: u64,
    payload: serde_json::Value,
    causation: Option<CausationRefs>,
    actor: ActorRef,
    schema_version: Option<u32>,
    metadata: Option<BTreeMap<String, serde_json::Value>>,
    timestamp: Option<DateTime<Utc>>,
}

impl EventInputBuilder {
    /// Create a builder targeting the given aggregate. The version defaults
    /// to 1 and the actor to an anonymous placeholder that callers are
    /// expected to replace.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            aggregate_version: 1,
            payload: serde_json::Value::Object(serde_json::Map::new()),
            causation: None,
            actor: ActorRef::Anonymous {
                reason: "unspecified".into(),
            },
            schema_version: None,
            metadata: None,
            timestamp: None,
        }
    }

    /// Set the expected aggregate version.
    #[must_use]
    pub fn version(mut self, version: u64) -> Self {
        self.aggregate_version = version;
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the originating actor.
    #[must_use]
    pub fn actor(mut self, actor: ActorRef) -> Self {
        self.actor = actor;
        self
    }

    /// Set causation references.
    #[must_use]
    pub fn causation(mut self, causation: CausationRefs) -> Self {
        self.causation = Some(causation);
        self
    }

    /// Set the payload schema version.
    #[must_use]
    pub fn schema_version(mut self, version: u32) -> Self {
        self.schema_version = Some(version);
        self
    }

    /// Attach a metadata key/value pair.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }

    /// Override the event timestamp.
    #[must_use]
    pub fn timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }

    /// Consume the builder and produce an [`EventInput`].
    #[must_use]
    pub fn build(self) -> EventInput {
        EventInput {
            event_type: self.event_type,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            aggregate_version: self.aggregate_version,
            payload: self.payload,
            causation: self.causation,
            actor: self.actor,
            schema_version: self.schema_version,
            metadata: self.metadata,
            timestamp: self.timestamp,
        }
    }
}
