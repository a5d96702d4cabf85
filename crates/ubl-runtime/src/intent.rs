// SPDX-License-Identifier: MIT OR Apache-2.0

//! Intent registry and dispatch.
//!
//! An intent is a user-facing verb requesting a change. Dispatch runs the
//! full gauntlet — governance gate, authorization (audited), then the
//! handler — and the handler's only write surface is the runtime's checked
//! append. Outcomes carry the emitted events plus machine-readable
//! affordances for the caller's next actions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ubl_core::{ActorRef, Event, LedgerResult};

use crate::LedgerRuntime;

/// A machine-readable next-action descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Affordance {
    /// The intent the caller could dispatch next.
    pub intent: String,
    /// Human-readable description.
    pub description: String,
}

/// What an intent produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentOutcome {
    /// Whether the intent succeeded.
    pub success: bool,
    /// Handler-specific result value.
    pub outcome: serde_json::Value,
    /// Next actions the caller may take.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affordances: Vec<Affordance>,
    /// Events the handler appended, in order.
    pub emitted_events: Vec<Event>,
}

impl IntentOutcome {
    /// A successful outcome.
    #[must_use]
    pub fn ok(outcome: serde_json::Value, emitted_events: Vec<Event>) -> Self {
        Self {
            success: true,
            outcome,
            affordances: Vec::new(),
            emitted_events,
        }
    }

    /// Attach an affordance.
    #[must_use]
    pub fn with_affordance(mut self, intent: impl Into<String>, description: impl Into<String>) -> Self {
        self.affordances.push(Affordance {
            intent: intent.into(),
            description: description.into(),
        });
        self
    }
}

/// A registered intent handler.
///
/// Handlers validate their payload, load whatever state they need through
/// the runtime's repositories, and append events through
/// [`LedgerRuntime::append`].
#[async_trait]
pub trait IntentHandler: Send + Sync {
    /// The intent name this handler serves.
    fn name(&self) -> &str;

    /// Handle a dispatched intent.
    async fn handle(
        &self,
        runtime: &LedgerRuntime,
        actor: &ActorRef,
        realm_id: Option<&str>,
        payload: serde_json::Value,
    ) -> LedgerResult<IntentOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubl_authz::{Condition, Effect, Policy};
    use ubl_core::EventInputBuilder;
    use ubl_domain::{aggregate_types, event_types};

    /// Creates an entity from the payload.
    struct CreateEntity;

    #[async_trait]
    impl IntentHandler for CreateEntity {
        fn name(&self) -> &str {
            "create_entity"
        }

        async fn handle(
            &self,
            runtime: &LedgerRuntime,
            _actor: &ActorRef,
            realm_id: Option<&str>,
            payload: serde_json::Value,
        ) -> LedgerResult<IntentOutcome> {
            let entity_id = format!("ent-{}", ubl_core::new_event_id());
            let event = runtime
                .append(
                    EventInputBuilder::new(
                        event_types::ENTITY_CREATED,
                        aggregate_types::ENTITY,
                        &entity_id,
                    )
                    .version(1)
                    .payload(serde_json::json!({
                        "realm_id": realm_id.unwrap_or(ubl_realm::PRIMORDIAL_REALM_ID),
                        "entity_type": payload["entity_type"],
                        "name": payload["name"],
                    }))
                    .actor(ActorRef::system_component("ledger", "intent"))
                    .build(),
                )
                .await?;
            Ok(IntentOutcome::ok(
                serde_json::json!({"entity_id": entity_id}),
                vec![event],
            )
            .with_affordance("update_entity", "amend the entity's identity"))
        }
    }

    fn open_policy() -> Policy {
        Policy {
            id: "open".into(),
            name: "open".into(),
            priority: 1,
            enabled: true,
            conditions: vec![Condition::Actor(ubl_authz::ActorCondition::Any)],
            effect: Effect::Allow,
            rules: vec![],
        }
    }

    #[tokio::test]
    async fn dispatch_runs_handler_and_returns_events() {
        let runtime = LedgerRuntime::builder().build();
        runtime.bootstrap().await.unwrap();
        runtime.authz().policies().upsert(open_policy());
        runtime.register_intent(std::sync::Arc::new(CreateEntity));

        let outcome = runtime
            .dispatch(
                "create_entity",
                ActorRef::party("ent-founder"),
                Some(ubl_realm::PRIMORDIAL_REALM_ID),
                serde_json::json!({"entity_type": "person", "name": "Ada"}),
            )
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.emitted_events.len(), 1);
        assert_eq!(
            outcome.emitted_events[0].event_type,
            event_types::ENTITY_CREATED
        );
        assert_eq!(outcome.affordances[0].intent, "update_entity");

        // The whole exchange stayed chained.
        assert!(runtime
            .store()
            .verify_integrity(None, None)
            .await
            .unwrap()
            .valid);
    }

    #[tokio::test]
    async fn outcome_serializes_for_bindings() {
        let outcome = IntentOutcome::ok(serde_json::json!({"id": 1}), vec![])
            .with_affordance("next", "do the next thing");
        let v = serde_json::to_value(&outcome).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["affordances"][0]["intent"], "next");
    }
}
