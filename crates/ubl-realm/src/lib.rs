// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! ubl-realm
//!
//! Tenant boundaries. Realm state is rebuilt purely from events — the
//! in-process cache is derived and discarded on any inconsistency — and
//! cross-realm operations are validated against isolation modes,
//! hierarchical ancestry, and each side's cross-realm flag. Bootstrap is
//! idempotent: the primordial realm, the system entity, and the genesis
//! agreement exist exactly once per installation.

/// Rate-limit and quota gates over external limiter interfaces.
pub mod governance;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ubl_aggregate::Rehydrator;
use ubl_core::{ActorRef, EventInputBuilder, LedgerError, LedgerResult};
use ubl_domain::{aggregate_types, event_types, IsolationMode, RealmConfig, RealmRehydrator, RealmState};
use ubl_store::{AggregateQuery, EventStore};

pub use governance::{
    GovernanceGate, MemoryQuotaManager, MemoryRateLimiter, QuotaDecision, QuotaManager,
    RateDecision, RateLimiter, RateScope,
};

/// The primordial realm's well-known id.
pub const PRIMORDIAL_REALM_ID: &str = "00000000-0000-0000-0000-000000000000";

/// The installation's system entity id.
pub const SYSTEM_ENTITY_ID: &str = "ent-system";

/// The genesis agreement id, establishing the primordial realm.
pub const GENESIS_AGREEMENT_ID: &str = "agr-genesis";

/// Manages realms over the event store.
pub struct RealmManager {
    store: Arc<dyn EventStore>,
    rehydrator: RealmRehydrator,
    cache: RwLock<HashMap<String, RealmState>>,
}

impl std::fmt::Debug for RealmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cache = self.cache.read().expect("realm cache poisoned");
        f.debug_struct("RealmManager")
            .field("cached_realms", &cache.len())
            .finish_non_exhaustive()
    }
}

impl RealmManager {
    /// Wire a manager over the store.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            rehydrator: RealmRehydrator,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotent installation bootstrap.
    ///
    /// On first run, appends `RealmCreated` for the primordial realm, an
    /// `EntityCreated` for the system entity, and the genesis agreement's
    /// proposal, consent, and activation. On subsequent runs it detects
    /// the existing `RealmCreated` and does nothing.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn bootstrap(&self) -> LedgerResult<RealmState> {
        if let Some(existing) = self.rebuild_realm_from_events(PRIMORDIAL_REALM_ID).await? {
            tracing::debug!(target: "ubl.realm", "bootstrap: primordial realm already exists");
            return Ok(existing);
        }

        let actor = ActorRef::system_component("ledger", "bootstrap");

        self.store
            .append(
                EventInputBuilder::new(
                    event_types::REALM_CREATED,
                    aggregate_types::REALM,
                    PRIMORDIAL_REALM_ID,
                )
                .version(1)
                .payload(serde_json::json!({
                    "name": "primordial",
                    "established_by": GENESIS_AGREEMENT_ID,
                    "config": {
                        "isolation": "hierarchical",
                        "cross_realm_allowed": true,
                    },
                }))
                .actor(actor.clone())
                .build(),
            )
            .await?;

        self.store
            .append(
                EventInputBuilder::new(
                    event_types::ENTITY_CREATED,
                    aggregate_types::ENTITY,
                    SYSTEM_ENTITY_ID,
                )
                .version(1)
                .payload(serde_json::json!({
                    "realm_id": PRIMORDIAL_REALM_ID,
                    "entity_type": "system",
                    "name": "system",
                }))
                .actor(actor.clone())
                .build(),
            )
            .await?;

        // The genesis agreement: the system entity stewards the
        // installation, consents, and the agreement activates.
        self.store
            .append(
                EventInputBuilder::new(
                    event_types::AGREEMENT_PROPOSED,
                    aggregate_types::AGREEMENT,
                    GENESIS_AGREEMENT_ID,
                )
                .version(1)
                .payload(serde_json::json!({
                    "realm_id": PRIMORDIAL_REALM_ID,
                    "agreement_type": "genesis",
                    "parties": [{"entity_id": SYSTEM_ENTITY_ID, "role": "steward"}],
                }))
                .actor(actor.clone())
                .build(),
            )
            .await?;
        self.store
            .append(
                EventInputBuilder::new(
                    event_types::CONSENT_RECORDED,
                    aggregate_types::AGREEMENT,
                    GENESIS_AGREEMENT_ID,
                )
                .version(2)
                .payload(serde_json::json!({
                    "party_id": SYSTEM_ENTITY_ID,
                    "method": "implicit",
                }))
                .actor(actor.clone())
                .build(),
            )
            .await?;
        self.store
            .append(
                EventInputBuilder::new(
                    event_types::AGREEMENT_ACTIVATED,
                    aggregate_types::AGREEMENT,
                    GENESIS_AGREEMENT_ID,
                )
                .version(3)
                .payload(serde_json::json!({}))
                .actor(actor)
                .build(),
            )
            .await?;

        tracing::info!(target: "ubl.realm", "bootstrap complete");
        self.get_realm(PRIMORDIAL_REALM_ID).await?.ok_or_else(|| {
            LedgerError::internal("bootstrap appended events but the primordial realm is missing")
        })
    }

    /// The primordial realm.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` before bootstrap.
    pub async fn get_primordial_realm(&self) -> LedgerResult<RealmState> {
        self.get_realm(PRIMORDIAL_REALM_ID)
            .await?
            .ok_or_else(|| LedgerError::not_found("primordial realm; run bootstrap first"))
    }

    /// The only canonical state reconstruction: fold the realm's events.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn rebuild_realm_from_events(
        &self,
        realm_id: &str,
    ) -> LedgerResult<Option<RealmState>> {
        let events = self
            .store
            .get_by_aggregate(aggregate_types::REALM, realm_id, &AggregateQuery::all())
            .await?;
        if events.is_empty() {
            return Ok(None);
        }
        let mut state = self.rehydrator.initial_state();
        for event in &events {
            state = self.rehydrator.apply(state, event);
        }
        Ok(Some(state))
    }

    /// Cached realm lookup; a miss rebuilds from events.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn get_realm(&self, realm_id: &str) -> LedgerResult<Option<RealmState>> {
        if let Some(cached) = self
            .cache
            .read()
            .expect("realm cache poisoned")
            .get(realm_id)
            .cloned()
        {
            return Ok(Some(cached));
        }
        let rebuilt = self.rebuild_realm_from_events(realm_id).await?;
        if let Some(state) = &rebuilt {
            self.cache
                .write()
                .expect("realm cache poisoned")
                .insert(realm_id.to_string(), state.clone());
        }
        Ok(rebuilt)
    }

    /// Drop the derived cache; the next lookup rebuilds from events.
    pub fn invalidate_cache(&self) {
        self.cache.write().expect("realm cache poisoned").clear();
    }

    /// Create a realm. The returned state is rebuilt from events — never
    /// trusted from the arguments alone.
    ///
    /// # Errors
    ///
    /// Propagates store failures; `NOT_FOUND` for an unknown parent.
    pub async fn create_realm(
        &self,
        name: &str,
        config: RealmConfig,
        license_agreement_id: &str,
        parent_realm_id: Option<&str>,
        actor: ActorRef,
    ) -> LedgerResult<RealmState> {
        if let Some(parent) = parent_realm_id {
            if self.get_realm(parent).await?.is_none() {
                return Err(LedgerError::not_found(format!("parent realm {parent}")));
            }
        }
        let realm_id = format!("realm-{}", ubl_core::new_event_id());
        self.store
            .append(
                EventInputBuilder::new(
                    event_types::REALM_CREATED,
                    aggregate_types::REALM,
                    &realm_id,
                )
                .version(1)
                .payload(serde_json::json!({
                    "name": name,
                    "established_by": license_agreement_id,
                    "config": config,
                    "parent_realm_id": parent_realm_id,
                }))
                .actor(actor)
                .build(),
            )
            .await?;

        self.get_realm(&realm_id).await?.ok_or_else(|| {
            LedgerError::internal("realm creation appended an event but rebuild found nothing")
        })
    }

    /// Whether `ancestor_id` is an ancestor of (or equal to) `realm_id`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn is_ancestor(&self, ancestor_id: &str, realm_id: &str) -> LedgerResult<bool> {
        let mut current = Some(realm_id.to_string());
        // Parent chains are short; a hard cap guards against cycles in
        // corrupted data.
        for _ in 0..64 {
            let Some(id) = current else { return Ok(false) };
            if id == ancestor_id {
                return Ok(true);
            }
            current = self
                .get_realm(&id)
                .await?
                .and_then(|r| r.parent_realm_id);
        }
        Ok(false)
    }

    /// Validate a cross-realm operation between two realms.
    ///
    /// Both realms must allow cross-realm operations; `Full` isolation on
    /// either side rejects; `Hierarchical` isolation permits only
    /// ancestor/descendant pairs.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` for unknown realms, `INVARIANT_VIOLATION` for refused
    /// operations.
    pub async fn validate_cross_realm_operation(
        &self,
        source_id: &str,
        target_id: &str,
        operation: &str,
    ) -> LedgerResult<()> {
        if source_id == target_id {
            return Ok(());
        }
        let source = self
            .get_realm(source_id)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("realm {source_id}")))?;
        let target = self
            .get_realm(target_id)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("realm {target_id}")))?;

        if !source.config.cross_realm_allowed || !target.config.cross_realm_allowed {
            return Err(LedgerError::invariant_violation(format!(
                "cross-realm {operation} refused: a side does not allow cross-realm operations"
            )));
        }
        if source.config.isolation == IsolationMode::Full
            || target.config.isolation == IsolationMode::Full
        {
            return Err(LedgerError::invariant_violation(format!(
                "cross-realm {operation} refused: full isolation"
            )));
        }
        // Hierarchical isolation: only along ancestry lines.
        let related = self.is_ancestor(source_id, target_id).await?
            || self.is_ancestor(target_id, source_id).await?;
        if !related {
            return Err(LedgerError::invariant_violation(format!(
                "cross-realm {operation} refused: realms are not in one hierarchy"
            )));
        }
        Ok(())
    }
}
