// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// External adapter contracts (notifications, documents).
pub mod adapters;
/// Event hooks (agreement→role coupling).
pub mod hooks;
/// Intent registry and dispatch.
pub mod intent;
/// Realm membership projection.
pub mod membership;
/// Ledger-backed service seams.
pub mod services;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;

use ubl_aggregate::{MemorySnapshotStore, Repository, SnapshotStore};
use ubl_authz::{AccessDecision, AccessRequest, AuditEntry, AuthorizationEngine, PolicyEngine};
use ubl_core::{
    ActorRef, ErrorKind, Event, EventInput, LedgerError, LedgerResult,
};
use ubl_domain::{
    AgreementRehydrator, AssetRehydrator, EntityRehydrator, InvariantGate, RealmRehydrator,
    RoleRehydrator,
};
use ubl_projection::{
    CheckpointStore, MemoryCheckpointStore, MemorySearchEngine, ProjectionManager, SearchEngine,
    SearchIndexer,
};
use ubl_realm::{
    GovernanceGate, MemoryQuotaManager, MemoryRateLimiter, QuotaManager, RateLimiter, RealmManager,
};
use ubl_saga::{transfer, SagaCoordinator};
use ubl_schema::SchemaRegistry;
use ubl_scheduler::{IdempotencyIndex, ScheduleTable, Scheduler};
use ubl_store::{EventStore, LockService, MemoryEventStore, MemoryLockService};
use ubl_workflow::{FlowOrchestrator, WorkflowEngine};

use adapters::{MemoryNotifier, Notifier};
use hooks::{AgreementRoleHook, EventHook};
use membership::MembershipProjection;
use services::{
    LedgerInvariantContext, LedgerRoleSource, LedgerWorkflowServices, RealmGateAdapter,
};

pub use intent::{IntentHandler, IntentOutcome};

/// The aggregate repositories the runtime maintains.
pub struct DomainRepos {
    /// Realm aggregates.
    pub realms: Arc<Repository<RealmRehydrator>>,
    /// Entity aggregates.
    pub entities: Arc<Repository<EntityRehydrator>>,
    /// Asset aggregates.
    pub assets: Arc<Repository<AssetRehydrator>>,
    /// Agreement aggregates.
    pub agreements: Arc<Repository<AgreementRehydrator>>,
    /// Role aggregates.
    pub roles: Arc<Repository<RoleRehydrator>>,
}

/// Everything wired together: the ledger core in one value.
pub struct LedgerRuntime {
    store: Arc<dyn EventStore>,
    schema: Arc<SchemaRegistry>,
    repos: DomainRepos,
    membership: Arc<MembershipProjection>,
    projections: Arc<ProjectionManager>,
    indexer: Arc<SearchIndexer>,
    authz: Arc<AuthorizationEngine>,
    workflows: Arc<WorkflowEngine>,
    flows: Arc<FlowOrchestrator>,
    sagas: Arc<SagaCoordinator>,
    scheduler: Arc<Scheduler>,
    realms: Arc<RealmManager>,
    governance: Arc<GovernanceGate>,
    invariants: InvariantGate,
    invariant_ctx: LedgerInvariantContext,
    hooks: RwLock<Vec<Arc<dyn EventHook>>>,
    intents: RwLock<HashMap<String, Arc<dyn IntentHandler>>>,
    pump_checkpoint: Mutex<u64>,
}

impl std::fmt::Debug for LedgerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerRuntime").finish_non_exhaustive()
    }
}

/// Builder for [`LedgerRuntime`]. Every collaborator has a memory default,
/// so `LedgerRuntime::builder().build()` yields a fully working in-process
/// installation.
pub struct LedgerRuntimeBuilder {
    store: Option<Arc<dyn EventStore>>,
    locks: Option<Arc<dyn LockService>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    search: Option<Arc<dyn SearchEngine>>,
    notifier: Option<Arc<dyn Notifier>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    quotas: Option<Arc<dyn QuotaManager>>,
}

impl LedgerRuntimeBuilder {
    /// Use a specific event store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a specific lock service.
    #[must_use]
    pub fn locks(mut self, locks: Arc<dyn LockService>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Use a specific snapshot store.
    #[must_use]
    pub fn snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Use a specific projection checkpoint store.
    #[must_use]
    pub fn checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Use a specific search engine adapter.
    #[must_use]
    pub fn search(mut self, search: Arc<dyn SearchEngine>) -> Self {
        self.search = Some(search);
        self
    }

    /// Use a specific notifier adapter.
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Use a specific rate limiter.
    #[must_use]
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Use a specific quota manager.
    #[must_use]
    pub fn quotas(mut self, quotas: Arc<dyn QuotaManager>) -> Self {
        self.quotas = Some(quotas);
        self
    }

    /// Wire everything.
    #[must_use]
    pub fn build(self) -> LedgerRuntime {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryEventStore::new()) as Arc<dyn EventStore>);
        let locks = self
            .locks
            .unwrap_or_else(|| Arc::new(MemoryLockService::new()) as Arc<dyn LockService>);
        let snapshots = self
            .snapshots
            .unwrap_or_else(|| Arc::new(MemorySnapshotStore::new()) as Arc<dyn SnapshotStore>);
        let checkpoints = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new()) as Arc<dyn CheckpointStore>);
        let search = self
            .search
            .unwrap_or_else(|| Arc::new(MemorySearchEngine::new()) as Arc<dyn SearchEngine>);
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(MemoryNotifier::new()) as Arc<dyn Notifier>);
        let rate_limiter = self.rate_limiter.unwrap_or_else(|| {
            Arc::new(MemoryRateLimiter::new(1_000, 60_000)) as Arc<dyn RateLimiter>
        });
        let quotas = self
            .quotas
            .unwrap_or_else(|| Arc::new(MemoryQuotaManager::new(HashMap::new())) as Arc<dyn QuotaManager>);

        let schema = Arc::new(SchemaRegistry::new());

        let repos = DomainRepos {
            realms: Arc::new(Repository::new(
                Arc::clone(&store),
                Arc::clone(&schema),
                Arc::clone(&snapshots),
                RealmRehydrator,
            )),
            entities: Arc::new(Repository::new(
                Arc::clone(&store),
                Arc::clone(&schema),
                Arc::clone(&snapshots),
                EntityRehydrator,
            )),
            assets: Arc::new(Repository::new(
                Arc::clone(&store),
                Arc::clone(&schema),
                Arc::clone(&snapshots),
                AssetRehydrator,
            )),
            agreements: Arc::new(Repository::new(
                Arc::clone(&store),
                Arc::clone(&schema),
                Arc::clone(&snapshots),
                AgreementRehydrator,
            )),
            roles: Arc::new(Repository::new(
                Arc::clone(&store),
                Arc::clone(&schema),
                Arc::clone(&snapshots),
                RoleRehydrator,
            )),
        };

        let membership = Arc::new(MembershipProjection::new());
        let indexer = Arc::new(SearchIndexer::new(Arc::clone(&store), search));
        let projections = Arc::new(ProjectionManager::new(
            Arc::clone(&store),
            Arc::clone(&checkpoints),
        ));
        projections.register(Arc::clone(&membership) as Arc<dyn ubl_projection::Projection>);
        projections.register(Arc::clone(&indexer) as Arc<dyn ubl_projection::Projection>);

        let role_source = Arc::new(LedgerRoleSource::new(
            Arc::clone(&store),
            Arc::clone(&repos.roles),
            Arc::clone(&repos.agreements),
        ));
        let authz = Arc::new(AuthorizationEngine::new(
            Arc::clone(&role_source) as Arc<dyn ubl_authz::RoleSource>,
            Arc::clone(&membership) as Arc<dyn ubl_core::scope::RealmLookup + Send + Sync>,
            Arc::new(PolicyEngine::new()),
        ));

        let workflow_services = Arc::new(LedgerWorkflowServices::new(
            Arc::clone(&role_source),
            Arc::clone(&repos.agreements),
            Arc::clone(&repos.assets),
            notifier,
        ));
        let workflows = Arc::new(WorkflowEngine::new(
            Arc::clone(&store),
            workflow_services as Arc<dyn ubl_workflow::WorkflowServices>,
        ));
        let flows = Arc::new(FlowOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&workflows),
        ));

        let realms = Arc::new(RealmManager::new(Arc::clone(&store)));
        let sagas = Arc::new(SagaCoordinator::new(Arc::clone(&store)));
        sagas.register(transfer::cross_realm_transfer_saga(Arc::new(
            RealmGateAdapter::new(Arc::clone(&realms)),
        )));

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            locks,
            Arc::new(ScheduleTable::new()),
            Arc::new(IdempotencyIndex::new()),
        ));

        let governance = Arc::new(GovernanceGate::new(rate_limiter, quotas));

        let invariant_ctx = LedgerInvariantContext::new(
            Arc::clone(&repos.agreements),
            Arc::clone(&repos.realms),
        );
        let hook: Arc<dyn EventHook> = Arc::new(AgreementRoleHook::new(
            Arc::clone(&store),
            Arc::clone(&repos.agreements),
        ));

        LedgerRuntime {
            store,
            schema,
            repos,
            membership,
            projections,
            indexer,
            authz,
            workflows,
            flows,
            sagas,
            scheduler,
            realms,
            governance,
            invariants: InvariantGate::new(),
            invariant_ctx,
            hooks: RwLock::new(vec![hook]),
            intents: RwLock::new(HashMap::new()),
            pump_checkpoint: Mutex::new(0),
        }
    }
}

impl LedgerRuntime {
    /// Start building a runtime.
    #[must_use]
    pub fn builder() -> LedgerRuntimeBuilder {
        LedgerRuntimeBuilder {
            store: None,
            locks: None,
            snapshots: None,
            checkpoints: None,
            search: None,
            notifier: None,
            rate_limiter: None,
            quotas: None,
        }
    }

    /// The event store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// The schema registry.
    #[must_use]
    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    /// The aggregate repositories.
    #[must_use]
    pub fn repos(&self) -> &DomainRepos {
        &self.repos
    }

    /// The projection manager.
    #[must_use]
    pub fn projections(&self) -> &Arc<ProjectionManager> {
        &self.projections
    }

    /// The realm membership lookup (entity/agreement/asset → realm).
    #[must_use]
    pub fn membership(&self) -> &Arc<MembershipProjection> {
        &self.membership
    }

    /// The search indexer.
    #[must_use]
    pub fn search(&self) -> &Arc<SearchIndexer> {
        &self.indexer
    }

    /// The authorization engine.
    #[must_use]
    pub fn authz(&self) -> &Arc<AuthorizationEngine> {
        &self.authz
    }

    /// The workflow engine.
    #[must_use]
    pub fn workflows(&self) -> &Arc<WorkflowEngine> {
        &self.workflows
    }

    /// The flow orchestrator.
    #[must_use]
    pub fn flows(&self) -> &Arc<FlowOrchestrator> {
        &self.flows
    }

    /// The saga coordinator.
    #[must_use]
    pub fn sagas(&self) -> &Arc<SagaCoordinator> {
        &self.sagas
    }

    /// The scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The realm manager.
    #[must_use]
    pub fn realms(&self) -> &Arc<RealmManager> {
        &self.realms
    }

    /// The governance gate.
    #[must_use]
    pub fn governance(&self) -> &Arc<GovernanceGate> {
        &self.governance
    }

    /// Register an additional event hook.
    pub fn register_hook(&self, hook: Arc<dyn EventHook>) {
        self.hooks.write().expect("hook registry poisoned").push(hook);
    }

    /// Register an intent handler.
    pub fn register_intent(&self, handler: Arc<dyn IntentHandler>) {
        self.intents
            .write()
            .expect("intent registry poisoned")
            .insert(handler.name().to_string(), handler);
    }

    /// Bootstrap the installation (idempotent) and catch projections up.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn bootstrap(&self) -> LedgerResult<()> {
        self.realms.bootstrap().await?;
        self.run_until_idle().await?;
        Ok(())
    }

    /// The checked write path: command validation, invariant gate, append.
    ///
    /// Every state change in the system goes through here (or through an
    /// engine that appends equivalent events); there is no path that
    /// bypasses the event store or uses a constant version.
    ///
    /// # Errors
    ///
    /// `INVALID_EVENT`, `INVARIANT_VIOLATION`, `CONCURRENCY_CONFLICT`, or
    /// store failures.
    pub async fn append(&self, input: EventInput) -> LedgerResult<Event> {
        self.invariants.check(&input, &self.invariant_ctx).await?;
        self.store.append(input).await
    }

    /// Decide an access request and append the audit entry. Audit entries
    /// are appended for every decision, allow or deny.
    ///
    /// # Errors
    ///
    /// Propagates engine and store failures; a deny is a normal decision,
    /// not an error.
    pub async fn authorize(&self, request: &AccessRequest) -> LedgerResult<AccessDecision> {
        let decision = self.authz.decide(request).await?;
        let audit = AuditEntry::new(request.clone(), decision.clone());
        self.store.append(audit.to_event_input()?).await?;
        Ok(decision)
    }

    /// Dispatch a named intent: governance gate, authorization (audited),
    /// then the registered handler.
    ///
    /// # Errors
    ///
    /// `RATE_LIMITED`/`QUOTA_EXCEEDED` from governance, `UNAUTHORIZED` or
    /// `POLICY_DENIED` from authorization, `NOT_FOUND` for unknown
    /// intents, and whatever the handler raises.
    pub async fn dispatch(
        &self,
        intent: &str,
        actor: ActorRef,
        realm_id: Option<&str>,
        payload: serde_json::Value,
    ) -> LedgerResult<IntentOutcome> {
        self.governance
            .admit(
                &ubl_realm::RateScope::Intent {
                    intent: intent.to_string(),
                },
                intent,
                realm_id,
            )
            .await?;

        let mut context = ubl_authz::AccessContext::at(Utc::now());
        if let Some(realm) = realm_id {
            context = context.in_realm(realm);
        }
        let request = AccessRequest {
            actor: actor.clone(),
            action: format!("intent:{intent}"),
            resource: realm_id
                .map_or_else(|| format!("intent:{intent}"), |r| format!("Realm:{r}")),
            context,
        };
        let decision = self.authorize(&request).await?;
        if !decision.allowed {
            return Err(match decision.denied_by_policy {
                Some(policy_id) => LedgerError::new(ErrorKind::PolicyDenied, "policy denied")
                    .with_detail("policy_id", serde_json::json!(policy_id)),
                None => LedgerError::unauthorized(format!("intent {intent} denied")),
            });
        }

        let handler = self
            .intents
            .read()
            .expect("intent registry poisoned")
            .get(intent)
            .cloned()
            .ok_or_else(|| LedgerError::not_found(format!("intent {intent}")))?;

        let outcome = handler.handle(self, &actor, realm_id, payload).await?;
        self.run_until_idle().await?;
        Ok(outcome)
    }

    /// Drive the pump until no component produces further events: hooks
    /// fire, flows wake, projections catch up.
    ///
    /// Background deployments run this from a subscription loop; tests
    /// call it directly for deterministic settling.
    ///
    /// # Errors
    ///
    /// Propagates store and hook failures.
    pub async fn run_until_idle(&self) -> LedgerResult<u64> {
        let mut processed = 0;
        loop {
            let head = self.store.get_current_sequence().await?;
            let from = *self.pump_checkpoint.lock().expect("pump checkpoint poisoned");
            if from >= head {
                break;
            }
            let batch = self.store.get_by_sequence(from + 1, Some(head)).await?;
            for event in batch {
                let hooks: Vec<Arc<dyn EventHook>> = self
                    .hooks
                    .read()
                    .expect("hook registry poisoned")
                    .clone();
                for hook in hooks {
                    for follow_up in hook.on_event(&event).await? {
                        self.append(follow_up).await?;
                    }
                }
                self.flows.on_event(&event).await?;
                *self.pump_checkpoint.lock().expect("pump checkpoint poisoned") = event.sequence;
                processed += 1;
            }
        }
        self.projections.catch_up().await?;
        Ok(processed)
    }

    /// Advance time-driven components: workflow timeouts, flow waits, and
    /// the scheduler tick.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn tick(&self, now: chrono::DateTime<Utc>) -> LedgerResult<()> {
        self.workflows.tick(now).await?;
        self.flows.tick(now).await?;
        self.scheduler.run_scheduling_tick(now).await?;
        self.run_until_idle().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubl_core::EventInputBuilder;
    use ubl_domain::{aggregate_types, event_types};

    #[tokio::test]
    async fn build_and_bootstrap() {
        let runtime = LedgerRuntime::builder().build();
        runtime.bootstrap().await.unwrap();
        let realm = runtime.realms().get_primordial_realm().await.unwrap();
        assert_eq!(realm.id, ubl_realm::PRIMORDIAL_REALM_ID);
    }

    #[tokio::test]
    async fn checked_append_rejects_invalid_input() {
        let runtime = LedgerRuntime::builder().build();
        let input = EventInputBuilder::new(
            event_types::ENTITY_CREATED,
            aggregate_types::ENTITY,
            "ent-x",
        )
        .payload(serde_json::json!({"realm_id": "", "entity_type": "person", "name": "x"}))
        .actor(ActorRef::system("test"))
        .build();
        let err = runtime.append(input).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidEvent);
    }

    #[tokio::test]
    async fn authorize_appends_an_audit_event() {
        let runtime = LedgerRuntime::builder().build();
        let before = runtime.store().get_current_sequence().await.unwrap();

        let request = AccessRequest {
            actor: ActorRef::party("ent-x"),
            action: "read".into(),
            resource: "Realm:r-1".into(),
            context: ubl_authz::AccessContext::at(Utc::now()).in_realm("r-1"),
        };
        let decision = runtime.authorize(&request).await.unwrap();
        assert!(!decision.allowed);

        let after = runtime.store().get_current_sequence().await.unwrap();
        assert_eq!(after, before + 1);
        let audit = runtime
            .store()
            .get_by_sequence(after, Some(after))
            .await
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(audit.event_type, event_types::ACCESS_EVALUATED);
    }

    #[tokio::test]
    async fn dispatch_unknown_intent_is_not_found_after_gates() {
        let runtime = LedgerRuntime::builder().build();
        // Allow the request through authorization with a permissive policy.
        runtime.authz().policies().upsert(ubl_authz::Policy {
            id: "open".into(),
            name: "open".into(),
            priority: 1,
            enabled: true,
            conditions: vec![],
            effect: ubl_authz::Effect::Allow,
            rules: vec![],
        });

        let err = runtime
            .dispatch(
                "does_not_exist",
                ActorRef::party("ent-x"),
                None,
                serde_json::json!({}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn dispatch_without_grant_is_unauthorized() {
        let runtime = LedgerRuntime::builder().build();
        let err = runtime
            .dispatch(
                "create_entity",
                ActorRef::party("ent-stranger"),
                Some("realm-1"),
                serde_json::json!({}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);
    }
}
