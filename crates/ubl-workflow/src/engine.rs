// SPDX-License-Identifier: MIT OR Apache-2.0

//! The transition engine.
//!
//! All side effects of a transition are event appends (on the workflow
//! instance and, via `emits`, on its target aggregate) or calls through
//! [`WorkflowServices`]. The engine makes no writes outside the event
//! store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use ubl_aggregate::Rehydrator;
use ubl_core::{
    ActorRef, ErrorKind, EventInputBuilder, LedgerError, LedgerResult,
};
use ubl_domain::{aggregate_types, event_types};
use ubl_store::{AggregateQuery, EventStore};

use crate::definition::{
    ActionDef, ActorConstraint, Guard, GuardCondition, TimeoutAction, TransitionDef,
    WorkflowDefinition,
};
use crate::instance::{WorkflowInstance, WorkflowRehydrator};
use crate::WorkflowServices;

/// Executes workflow definitions against the ledger.
pub struct WorkflowEngine {
    store: Arc<dyn EventStore>,
    services: Arc<dyn WorkflowServices>,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    rehydrator: WorkflowRehydrator,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let definitions = self.definitions.read().expect("definition registry poisoned");
        f.debug_struct("WorkflowEngine")
            .field("definitions", &definitions.len())
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    /// Wire an engine over the store and services seam.
    pub fn new(store: Arc<dyn EventStore>, services: Arc<dyn WorkflowServices>) -> Self {
        Self {
            store,
            services,
            definitions: RwLock::new(HashMap::new()),
            rehydrator: WorkflowRehydrator,
        }
    }

    /// Register a definition after validating it.
    ///
    /// # Errors
    ///
    /// Propagates [`WorkflowDefinition::validate`] failures.
    pub fn register(&self, definition: WorkflowDefinition) -> LedgerResult<()> {
        definition.validate()?;
        self.definitions
            .write()
            .expect("definition registry poisoned")
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    fn definition(&self, id: &str) -> LedgerResult<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .expect("definition registry poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found(format!("workflow definition {id}")))
    }

    /// Load an instance by folding its events.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` when the instance has no events.
    pub async fn load(&self, instance_id: &str) -> LedgerResult<WorkflowInstance> {
        let events = self
            .store
            .get_by_aggregate(aggregate_types::WORKFLOW, instance_id, &AggregateQuery::all())
            .await?;
        if events.is_empty() {
            return Err(LedgerError::not_found(format!(
                "workflow instance {instance_id}"
            )));
        }
        let mut state = self.rehydrator.initial_state();
        for event in &events {
            state = self.rehydrator.apply(state, event);
        }
        Ok(state)
    }

    /// All instance ids, complete or not.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn instance_ids(&self) -> LedgerResult<Vec<String>> {
        self.store.list_aggregate_ids(aggregate_types::WORKFLOW).await
    }

    /// Start a new instance of a registered definition.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` for unknown definitions; store errors otherwise.
    pub async fn start(
        &self,
        definition_id: &str,
        target_type: &str,
        target_id: &str,
        actor: ActorRef,
    ) -> LedgerResult<WorkflowInstance> {
        let definition = self.definition(definition_id)?;
        let instance_id = format!("wf-{}", ubl_core::new_event_id());

        self.store
            .append(
                EventInputBuilder::new(
                    event_types::WORKFLOW_STARTED,
                    aggregate_types::WORKFLOW,
                    &instance_id,
                )
                .version(1)
                .payload(serde_json::json!({
                    "definition_id": definition.id,
                    "target_type": target_type,
                    "target_id": target_id,
                    "initial_state": definition.initial_state,
                }))
                .actor(actor)
                .build(),
            )
            .await?;

        let instance = self.load(&instance_id).await?;
        if let Some(state) = definition.state(&definition.initial_state) {
            let mut vars = BTreeMap::new();
            self.run_actions(&state.on_enter, &instance, &mut vars).await?;
        }
        tracing::info!(
            target: "ubl.workflow",
            instance = %instance_id,
            definition = %definition.id,
            "workflow started"
        );
        Ok(instance)
    }

    /// Fire a transition on an instance.
    ///
    /// # Errors
    ///
    /// `WORKFLOW_COMPLETE`, `INVALID_TRANSITION`, `UNAUTHORIZED`, or
    /// `GUARDS_FAILED` per the transition algorithm; store errors
    /// otherwise.
    pub async fn transition(
        &self,
        instance_id: &str,
        transition_name: &str,
        actor: ActorRef,
        payload: Option<serde_json::Value>,
    ) -> LedgerResult<WorkflowInstance> {
        // 1. Load; completed instances accept nothing.
        let instance = self.load(instance_id).await?;
        if instance.is_complete {
            return Err(LedgerError::new(
                ErrorKind::WorkflowComplete,
                format!("workflow instance {instance_id} is complete"),
            ));
        }
        let definition = self.definition(&instance.definition_id)?;

        // 2. Resolve the transition against the current state.
        let Some(transition) =
            definition.transition_from(transition_name, &instance.current_state)
        else {
            return Err(LedgerError::new(
                ErrorKind::InvalidTransition,
                format!(
                    "no transition {transition_name} from state {}",
                    instance.current_state
                ),
            ));
        };

        // 3. Actor authorization; first match wins, empty list allows.
        if !self.actor_allowed(transition, &actor, &instance).await? {
            return Err(LedgerError::unauthorized(format!(
                "actor may not fire {transition_name}"
            )));
        }

        // 4. Guards; all failures are reported together.
        let failed = self.failed_guards(&transition.guards, &actor, &instance).await?;
        if !failed.is_empty() {
            return Err(LedgerError::new(
                ErrorKind::GuardsFailed,
                format!("{} guard(s) failed for {transition_name}", failed.len()),
            )
            .with_detail("failed_guards", serde_json::json!(failed)));
        }

        let mut variables = BTreeMap::new();

        // 5. Leaving-state actions.
        if let Some(state) = definition.state(&instance.current_state) {
            self.run_actions(&state.on_exit, &instance, &mut variables).await?;
        }

        // 6. Transition actions.
        self.run_actions(&transition.actions, &instance, &mut variables).await?;

        // 7. Record the transition, emit on the target, complete if
        //    terminal.
        let mut event_payload = serde_json::json!({
            "transition": transition.name,
            "from": instance.current_state,
            "to": transition.to,
        });
        if !variables.is_empty() {
            event_payload["variables"] = serde_json::to_value(&variables)?;
        }
        if let Some(extra) = &payload {
            event_payload["input"] = extra.clone();
        }

        let mut version = instance.version + 1;
        self.store
            .append(
                EventInputBuilder::new(
                    event_types::WORKFLOW_TRANSITIONED,
                    aggregate_types::WORKFLOW,
                    instance_id,
                )
                .version(version)
                .payload(event_payload)
                .actor(actor.clone())
                .build(),
            )
            .await?;

        for event_type in &transition.emits {
            self.emit_on_target(&instance, event_type, payload.clone(), instance_id)
                .await?;
        }

        if definition.is_terminal(&transition.to) {
            version += 1;
            self.store
                .append(
                    EventInputBuilder::new(
                        event_types::WORKFLOW_COMPLETED,
                        aggregate_types::WORKFLOW,
                        instance_id,
                    )
                    .version(version)
                    .payload(serde_json::json!({"final_state": transition.to}))
                    .actor(actor.clone())
                    .build(),
                )
                .await?;
        }

        // 8. Entering-state actions.
        let updated = self.load(instance_id).await?;
        if let Some(state) = definition.state(&transition.to) {
            let mut vars = BTreeMap::new();
            self.run_actions(&state.on_enter, &updated, &mut vars).await?;
        }

        tracing::info!(
            target: "ubl.workflow",
            instance = %instance_id,
            transition = %transition.name,
            to = %transition.to,
            "workflow transitioned"
        );
        Ok(updated)
    }

    /// Evaluate declared state timeouts for every live instance.
    ///
    /// Escalations fire once per state; auto-transitions run as the system
    /// actor; expiry completes the instance.
    ///
    /// # Errors
    ///
    /// Propagates store failures. Per-instance timeout actions that fail
    /// are logged and skipped so one instance cannot wedge the tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> LedgerResult<u32> {
        let mut fired = 0;
        for instance_id in self.instance_ids().await? {
            let instance = match self.load(&instance_id).await {
                Ok(i) => i,
                Err(_) => continue,
            };
            if instance.is_complete {
                continue;
            }
            let Ok(definition) = self.definition(&instance.definition_id) else {
                continue;
            };
            let Some(state) = definition.state(&instance.current_state) else {
                continue;
            };
            let Some(timeout) = &state.timeout else {
                continue;
            };
            let Some(entered) = instance.state_entered_at else {
                continue;
            };
            let elapsed = now.signed_duration_since(entered).num_milliseconds();
            if elapsed < timeout.after_ms as i64 {
                continue;
            }

            let outcome = self
                .fire_timeout(&instance, &timeout.action, now)
                .await;
            match outcome {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        target: "ubl.workflow",
                        instance = %instance_id,
                        error = %e,
                        "timeout action failed"
                    );
                }
            }
        }
        Ok(fired)
    }

    async fn fire_timeout(
        &self,
        instance: &WorkflowInstance,
        action: &TimeoutAction,
        _now: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        match action {
            TimeoutAction::AutoTransition { transition } => {
                self.transition(
                    &instance.id,
                    transition,
                    ActorRef::system_component("ledger", "workflow-timeout"),
                    None,
                )
                .await?;
                Ok(true)
            }
            TimeoutAction::Escalate { notify } => {
                if instance
                    .escalated_states
                    .iter()
                    .any(|s| s == &instance.current_state)
                {
                    return Ok(false);
                }
                self.services
                    .notify(
                        notify,
                        &format!(
                            "workflow {} stalled in state {}",
                            instance.id, instance.current_state
                        ),
                    )
                    .await?;
                self.store
                    .append(
                        EventInputBuilder::new(
                            event_types::WORKFLOW_ESCALATED,
                            aggregate_types::WORKFLOW,
                            &instance.id,
                        )
                        .version(instance.version + 1)
                        .payload(serde_json::json!({"state": instance.current_state}))
                        .actor(ActorRef::system_component("ledger", "workflow-timeout"))
                        .build(),
                    )
                    .await?;
                Ok(true)
            }
            TimeoutAction::Expire => {
                self.store
                    .append(
                        EventInputBuilder::new(
                            event_types::WORKFLOW_COMPLETED,
                            aggregate_types::WORKFLOW,
                            &instance.id,
                        )
                        .version(instance.version + 1)
                        .payload(serde_json::json!({
                            "final_state": instance.current_state,
                            "expired": true,
                        }))
                        .actor(ActorRef::system_component("ledger", "workflow-timeout"))
                        .build(),
                    )
                    .await?;
                Ok(true)
            }
        }
    }

    async fn actor_allowed(
        &self,
        transition: &TransitionDef,
        actor: &ActorRef,
        instance: &WorkflowInstance,
    ) -> LedgerResult<bool> {
        if transition.allowed_actors.is_empty() {
            return Ok(true);
        }
        for constraint in &transition.allowed_actors {
            let matched = match constraint {
                ActorConstraint::System => matches!(actor, ActorRef::System { .. }),
                ActorConstraint::Party { party_id } => actor.party_id() == Some(party_id.as_str()),
                ActorConstraint::SelfActor => {
                    actor.party_id() == Some(instance.target_id.as_str())
                }
                ActorConstraint::Role { role_type } => match actor.party_id() {
                    Some(holder) => self.services.has_active_role(holder, role_type).await?,
                    None => false,
                },
                ActorConstraint::AgreementParty { role } => match actor.party_id() {
                    Some(party) => {
                        self.services
                            .is_agreement_party(&instance.target_id, party, role.as_deref())
                            .await?
                    }
                    None => false,
                },
            };
            if matched {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn failed_guards(
        &self,
        guards: &[Guard],
        actor: &ActorRef,
        instance: &WorkflowInstance,
    ) -> LedgerResult<Vec<String>> {
        let mut failed = Vec::new();
        for guard in guards {
            if !self.guard_holds(&guard.condition, actor, instance).await? {
                failed.push(guard.name.clone());
            }
        }
        Ok(failed)
    }

    async fn guard_holds(
        &self,
        condition: &GuardCondition,
        actor: &ActorRef,
        instance: &WorkflowInstance,
    ) -> LedgerResult<bool> {
        match condition {
            GuardCondition::HasRole { role_type } => match actor.party_id() {
                Some(holder) => self.services.has_active_role(holder, role_type).await,
                None => Ok(false),
            },
            GuardCondition::HasConsent { from_all } => {
                self.services.consent_given(&instance.target_id, *from_all).await
            }
            GuardCondition::TimeElapsed {
                since_state,
                duration_ms,
            } => {
                let Some(entered) = instance.entered_at(since_state) else {
                    return Ok(false);
                };
                let elapsed = Utc::now().signed_duration_since(entered).num_milliseconds();
                Ok(elapsed >= *duration_ms as i64)
            }
            GuardCondition::AssetInStatus { asset_id, status } => {
                let id = asset_id.as_deref().unwrap_or(&instance.target_id);
                Ok(self.services.asset_status(id).await?.as_deref() == Some(status))
            }
            GuardCondition::AgreementInStatus { status } => {
                Ok(self.services.agreement_status(&instance.target_id).await?.as_deref()
                    == Some(status))
            }
            GuardCondition::Custom {
                validator_id,
                params,
            } => self.services.custom_guard(validator_id, params, instance).await,
        }
    }

    async fn run_actions(
        &self,
        actions: &[ActionDef],
        instance: &WorkflowInstance,
        variables: &mut BTreeMap<String, serde_json::Value>,
    ) -> LedgerResult<()> {
        for action in actions {
            match action {
                ActionDef::SetVariable { key, value } => {
                    variables.insert(key.clone(), value.clone());
                }
                ActionDef::Notify { recipient, message } => {
                    self.services.notify(recipient, message).await?;
                }
                ActionDef::EmitEvent {
                    event_type,
                    payload,
                } => {
                    self.emit_on_target(
                        instance,
                        event_type,
                        Some(payload.clone()),
                        &instance.id,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Append an event on the workflow's target aggregate, claiming its
    /// next version.
    async fn emit_on_target(
        &self,
        instance: &WorkflowInstance,
        event_type: &str,
        payload: Option<serde_json::Value>,
        workflow_id: &str,
    ) -> LedgerResult<()> {
        let latest = self
            .store
            .get_latest(&instance.target_type, &instance.target_id)
            .await?;
        let next_version = latest.map_or(1, |e| e.aggregate_version + 1);
        self.store
            .append(
                EventInputBuilder::new(event_type, &instance.target_type, &instance.target_id)
                    .version(next_version)
                    .payload(payload.unwrap_or_else(|| serde_json::json!({})))
                    .actor(ActorRef::workflow(workflow_id))
                    .build(),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use ubl_core::filter::EventFilter;
    use ubl_store::MemoryEventStore;

    /// Configurable fixture for the services seam.
    #[derive(Default)]
    struct FixtureServices {
        agreement_status: Mutex<Option<String>>,
        consent_all: Mutex<bool>,
        roles: Mutex<Vec<(String, String)>>,
        notifications: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl WorkflowServices for FixtureServices {
        async fn agreement_status(&self, _id: &str) -> LedgerResult<Option<String>> {
            Ok(self.agreement_status.lock().unwrap().clone())
        }
        async fn asset_status(&self, _id: &str) -> LedgerResult<Option<String>> {
            Ok(Some("available".into()))
        }
        async fn consent_given(&self, _id: &str, _from_all: bool) -> LedgerResult<bool> {
            Ok(*self.consent_all.lock().unwrap())
        }
        async fn has_active_role(&self, holder: &str, role_type: &str) -> LedgerResult<bool> {
            Ok(self
                .roles
                .lock()
                .unwrap()
                .iter()
                .any(|(h, r)| h == holder && r == role_type))
        }
        async fn is_agreement_party(
            &self,
            _agreement_id: &str,
            entity_id: &str,
            _role: Option<&str>,
        ) -> LedgerResult<bool> {
            Ok(entity_id.starts_with("ent-"))
        }
        async fn custom_guard(
            &self,
            validator_id: &str,
            _params: &serde_json::Value,
            _instance: &WorkflowInstance,
        ) -> LedgerResult<bool> {
            Ok(validator_id == "always_true")
        }
        async fn notify(&self, recipient: &str, message: &str) -> LedgerResult<()> {
            self.notifications
                .lock()
                .unwrap()
                .push((recipient.into(), message.into()));
            Ok(())
        }
    }

    fn approval_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "agreement-approval".into(),
            states: vec![
                crate::StateDef {
                    name: "pending".into(),
                    on_enter: vec![],
                    on_exit: vec![],
                    timeout: None,
                },
                crate::StateDef {
                    name: "approved".into(),
                    on_enter: vec![],
                    on_exit: vec![],
                    timeout: None,
                },
                crate::StateDef {
                    name: "rejected".into(),
                    on_enter: vec![],
                    on_exit: vec![],
                    timeout: None,
                },
            ],
            transitions: vec![
                TransitionDef {
                    name: "approve".into(),
                    from: vec!["pending".into()],
                    to: "approved".into(),
                    allowed_actors: vec![ActorConstraint::Role {
                        role_type: "manager".into(),
                    }],
                    guards: vec![Guard {
                        name: "all_consented".into(),
                        condition: GuardCondition::HasConsent { from_all: true },
                    }],
                    actions: vec![ActionDef::SetVariable {
                        key: "outcome".into(),
                        value: serde_json::json!("approved"),
                    }],
                    emits: vec!["AgreementActivated".into()],
                },
                TransitionDef {
                    name: "reject".into(),
                    from: vec!["pending".into()],
                    to: "rejected".into(),
                    allowed_actors: vec![],
                    guards: vec![],
                    actions: vec![],
                    emits: vec![],
                },
            ],
            initial_state: "pending".into(),
            terminal_states: vec!["approved".into(), "rejected".into()],
        }
    }

    fn wiring() -> (Arc<MemoryEventStore>, Arc<FixtureServices>, WorkflowEngine) {
        let store = Arc::new(MemoryEventStore::new());
        let services = Arc::new(FixtureServices::default());
        let engine = WorkflowEngine::new(
            store.clone() as Arc<dyn EventStore>,
            services.clone() as Arc<dyn WorkflowServices>,
        );
        engine.register(approval_definition()).unwrap();
        (store, services, engine)
    }

    #[tokio::test]
    async fn start_creates_instance_in_initial_state() {
        let (_store, _services, engine) = wiring();
        let instance = engine
            .start("agreement-approval", "Agreement", "agr-1", ActorRef::party("ent-a"))
            .await
            .unwrap();
        assert_eq!(instance.current_state, "pending");
        assert!(!instance.is_complete);
    }

    #[tokio::test]
    async fn unknown_definition_is_not_found() {
        let (_store, _services, engine) = wiring();
        let err = engine
            .start("ghost", "Agreement", "agr-1", ActorRef::party("ent-a"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn full_approval_path_emits_on_target() {
        let (store, services, engine) = wiring();
        *services.consent_all.lock().unwrap() = true;
        services
            .roles
            .lock()
            .unwrap()
            .push(("ent-manager".into(), "manager".into()));

        let instance = engine
            .start("agreement-approval", "Agreement", "agr-1", ActorRef::party("ent-a"))
            .await
            .unwrap();

        let updated = engine
            .transition(&instance.id, "approve", ActorRef::party("ent-manager"), None)
            .await
            .unwrap();
        assert_eq!(updated.current_state, "approved");
        assert!(updated.is_complete);
        assert_eq!(updated.variables["outcome"], "approved");

        // The emitted event landed on the target aggregate with a workflow
        // actor.
        let emitted = store.get_latest("Agreement", "agr-1").await.unwrap().unwrap();
        assert_eq!(emitted.event_type, "AgreementActivated");
        assert!(matches!(emitted.actor, ActorRef::Workflow { .. }));
    }

    #[tokio::test]
    async fn transition_on_complete_instance_fails() {
        let (_store, _services, engine) = wiring();
        let instance = engine
            .start("agreement-approval", "Agreement", "agr-1", ActorRef::party("ent-a"))
            .await
            .unwrap();
        engine
            .transition(&instance.id, "reject", ActorRef::party("ent-a"), None)
            .await
            .unwrap();

        let err = engine
            .transition(&instance.id, "reject", ActorRef::party("ent-a"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::WorkflowComplete);
    }

    #[tokio::test]
    async fn unknown_transition_is_invalid() {
        let (_store, _services, engine) = wiring();
        let instance = engine
            .start("agreement-approval", "Agreement", "agr-1", ActorRef::party("ent-a"))
            .await
            .unwrap();
        let err = engine
            .transition(&instance.id, "escalate", ActorRef::party("ent-a"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn actor_constraint_rejects_non_manager() {
        let (_store, services, engine) = wiring();
        *services.consent_all.lock().unwrap() = true;

        let instance = engine
            .start("agreement-approval", "Agreement", "agr-1", ActorRef::party("ent-a"))
            .await
            .unwrap();
        let err = engine
            .transition(&instance.id, "approve", ActorRef::party("ent-intern"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn guard_failure_lists_guard_names() {
        let (_store, services, engine) = wiring();
        services
            .roles
            .lock()
            .unwrap()
            .push(("ent-manager".into(), "manager".into()));
        // Consent not given: the guard must fail.

        let instance = engine
            .start("agreement-approval", "Agreement", "agr-1", ActorRef::party("ent-a"))
            .await
            .unwrap();
        let err = engine
            .transition(&instance.id, "approve", ActorRef::party("ent-manager"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::GuardsFailed);
        assert_eq!(
            err.detail("failed_guards"),
            Some(&serde_json::json!(["all_consented"]))
        );
    }

    #[tokio::test]
    async fn escalation_fires_once() {
        let (_store, services, engine) = wiring();
        let mut def = approval_definition();
        def.id = "with-timeout".into();
        def.states[0].timeout = Some(crate::TimeoutPolicy {
            after_ms: 10,
            action: TimeoutAction::Escalate {
                notify: "ent-supervisor".into(),
            },
        });
        engine.register(def).unwrap();

        engine
            .start("with-timeout", "Agreement", "agr-1", ActorRef::party("ent-a"))
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::milliseconds(60_000);
        assert_eq!(engine.tick(later).await.unwrap(), 1);
        // A second tick past the deadline does not re-escalate.
        assert_eq!(engine.tick(later).await.unwrap(), 0);
        assert_eq!(services.notifications.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expire_completes_the_instance() {
        let (_store, _services, engine) = wiring();
        let mut def = approval_definition();
        def.id = "expiring".into();
        def.states[0].timeout = Some(crate::TimeoutPolicy {
            after_ms: 10,
            action: TimeoutAction::Expire,
        });
        engine.register(def).unwrap();

        let instance = engine
            .start("expiring", "Agreement", "agr-1", ActorRef::party("ent-a"))
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::milliseconds(60_000);
        assert_eq!(engine.tick(later).await.unwrap(), 1);
        let reloaded = engine.load(&instance.id).await.unwrap();
        assert!(reloaded.is_complete);
    }

    #[tokio::test]
    async fn transition_events_are_chained_in_store() {
        let (store, _services, engine) = wiring();
        let instance = engine
            .start("agreement-approval", "Agreement", "agr-1", ActorRef::party("ent-a"))
            .await
            .unwrap();
        engine
            .transition(&instance.id, "reject", ActorRef::party("ent-a"), None)
            .await
            .unwrap();

        assert!(store.verify_integrity(None, None).await.unwrap().valid);
        let mut sub = store
            .subscribe(EventFilter::any().after(0))
            .await
            .unwrap();
        let first = sub.recv().await.unwrap();
        assert_eq!(first.event_type, event_types::WORKFLOW_STARTED);
    }
}
