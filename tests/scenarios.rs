// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end scenarios across the wired runtime: bootstrap, agreement
//! activation with derived roles, concurrent conflicts, cluster-safe
//! deadlines, cross-realm sagas, and temporal reconstruction.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use ubl_authz::{AccessContext, AccessRequest};
use ubl_core::{ActorRef, ErrorKind, EventInputBuilder};
use ubl_domain::invariant::SAGA_ID_KEY;
use ubl_domain::{aggregate_types, event_types, IsolationMode, RealmConfig};
use ubl_realm::PRIMORDIAL_REALM_ID;
use ubl_runtime::LedgerRuntime;
use ubl_saga::{CrossRealmTransferSaga, SagaStatus};
use ubl_scheduler::{
    deadline_triggered_action, Deadline, DeadlineStage, IdempotencyIndex, ScheduleTable,
    Scheduler, StageTrigger,
};
use ubl_store::{AggregateQuery, EventStore, MemoryEventStore, MemoryLockService};

// ── S1: bootstrap idempotency ───────────────────────────────────────────

#[tokio::test]
async fn s1_bootstrap_is_idempotent() {
    let runtime = LedgerRuntime::builder().build();
    runtime.bootstrap().await.unwrap();
    let first = runtime.realms().get_primordial_realm().await.unwrap();

    runtime.bootstrap().await.unwrap();
    let second = runtime.realms().get_primordial_realm().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.id, "00000000-0000-0000-0000-000000000000");

    let realm_created: Vec<_> = runtime
        .store()
        .get_by_sequence(1, None)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| {
            e.event_type == event_types::REALM_CREATED && e.aggregate_id == PRIMORDIAL_REALM_ID
        })
        .collect();
    assert_eq!(realm_created.len(), 1);
}

// ── S2: employment agreement activation grants a working role ───────────

async fn propose_employment(runtime: &LedgerRuntime) {
    // The realm the agreement lives in.
    runtime
        .append(
            EventInputBuilder::new(event_types::REALM_CREATED, aggregate_types::REALM, "internal")
                .version(1)
                .payload(serde_json::json!({
                    "name": "internal",
                    "established_by": ubl_realm::GENESIS_AGREEMENT_ID,
                    "config": {"isolation": "hierarchical", "cross_realm_allowed": true},
                }))
                .actor(ActorRef::system("test"))
                .build(),
        )
        .await
        .unwrap();

    for (id, entity_type, name) in [
        ("ent-acme", "organization", "Acme"),
        ("ent-john", "person", "John"),
    ] {
        runtime
            .append(
                EventInputBuilder::new(event_types::ENTITY_CREATED, aggregate_types::ENTITY, id)
                    .version(1)
                    .payload(serde_json::json!({
                        "realm_id": "internal",
                        "entity_type": entity_type,
                        "name": name,
                    }))
                    .actor(ActorRef::system("test"))
                    .build(),
            )
            .await
            .unwrap();
    }

    runtime
        .append(
            EventInputBuilder::new(
                event_types::AGREEMENT_PROPOSED,
                aggregate_types::AGREEMENT,
                "agr-employment",
            )
            .version(1)
            .payload(serde_json::json!({
                "realm_id": "internal",
                "agreement_type": "employment",
                "parties": [
                    {"entity_id": "ent-acme", "role": "employer"},
                    {"entity_id": "ent-john", "role": "employee"}
                ],
                "terms": {
                    "role_templates": [{
                        "template_id": "tmpl-employee",
                        "role_type": "employee",
                        "party_role": "employee",
                        "permissions": [{"action": "read", "resource": "Realm:internal"}],
                        "scope": {"type": "realm", "realm_id": "internal"}
                    }]
                }
            }))
            .actor(ActorRef::party("ent-acme"))
            .build(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn s2_agreement_activation_grants_authorizing_role() {
    let runtime = LedgerRuntime::builder().build();
    runtime.bootstrap().await.unwrap();
    propose_employment(&runtime).await;

    // Activation before consent is a domain invariant violation.
    let premature = EventInputBuilder::new(
        event_types::AGREEMENT_ACTIVATED,
        aggregate_types::AGREEMENT,
        "agr-employment",
    )
    .version(2)
    .actor(ActorRef::party("ent-acme"))
    .build();
    let err = runtime.append(premature).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvariantViolation);

    // Both principals consent, then activation succeeds.
    for (version, party) in [(2, "ent-acme"), (3, "ent-john")] {
        runtime
            .append(
                EventInputBuilder::new(
                    event_types::CONSENT_RECORDED,
                    aggregate_types::AGREEMENT,
                    "agr-employment",
                )
                .version(version)
                .payload(serde_json::json!({"party_id": party, "method": "digital"}))
                .actor(ActorRef::party(party))
                .build(),
            )
            .await
            .unwrap();
    }
    runtime
        .append(
            EventInputBuilder::new(
                event_types::AGREEMENT_ACTIVATED,
                aggregate_types::AGREEMENT,
                "agr-employment",
            )
            .version(4)
            .actor(ActorRef::party("ent-acme"))
            .build(),
        )
        .await
        .unwrap();

    // The activation hook grants the templated role.
    runtime.run_until_idle().await.unwrap();

    let decision = runtime
        .authorize(&AccessRequest {
            actor: ActorRef::party("ent-john"),
            action: "read".into(),
            resource: "Realm:internal".into(),
            context: AccessContext::at(Utc::now()).in_realm("internal"),
        })
        .await
        .unwrap();

    assert!(decision.allowed);
    assert_eq!(decision.granted_by.len(), 1);
    assert_eq!(decision.granted_by[0].agreement_id, "agr-employment");
    assert_eq!(decision.granted_by[0].role_type, "employee");

    // A stranger gets no such grant.
    let stranger = runtime
        .authorize(&AccessRequest {
            actor: ActorRef::party("ent-stranger"),
            action: "read".into(),
            resource: "Realm:internal".into(),
            context: AccessContext::at(Utc::now()).in_realm("internal"),
        })
        .await
        .unwrap();
    assert!(!stranger.allowed);
}

// ── S3: concurrent version conflict ─────────────────────────────────────

#[tokio::test]
async fn s3_concurrent_appends_one_winner() {
    let store = Arc::new(MemoryEventStore::new());
    store
        .append(
            EventInputBuilder::new("AgreementProposed", "Agreement", "agr-x")
                .version(1)
                .actor(ActorRef::system("test"))
                .build(),
        )
        .await
        .unwrap();

    let a = store.clone();
    let b = store.clone();
    let (first, second) = tokio::join!(
        a.append(
            EventInputBuilder::new("ConsentRecorded", "Agreement", "agr-x")
                .version(2)
                .actor(ActorRef::party("p-1"))
                .build(),
        ),
        b.append(
            EventInputBuilder::new("ConsentRecorded", "Agreement", "agr-x")
                .version(2)
                .actor(ActorRef::party("p-2"))
                .build(),
        ),
    );

    assert!(first.is_ok() ^ second.is_ok());
    let loser = if first.is_err() {
        first.unwrap_err()
    } else {
        second.unwrap_err()
    };
    assert_eq!(loser.kind, ErrorKind::ConcurrencyConflict);
    assert!(store.verify_integrity(None, None).await.unwrap().valid);
}

// ── S4: scheduler single-fire under replicas ────────────────────────────

#[tokio::test]
async fn s4_deadline_fires_exactly_once_across_replicas() {
    let store = Arc::new(MemoryEventStore::new());
    let locks = Arc::new(MemoryLockService::new());
    let table = Arc::new(ScheduleTable::new());
    let idempotency = Arc::new(IdempotencyIndex::new());

    let now = Utc::now();
    table.add_deadline(Deadline {
        id: "D1".into(),
        subject: (aggregate_types::AGREEMENT.into(), "agr-x".into()),
        due_at: now - Duration::milliseconds(1_000),
        stages: vec![DeadlineStage {
            trigger: StageTrigger::AtDue,
            action: deadline_triggered_action("D1", "final"),
            label: "final".into(),
        }],
    });

    let replica_a = Arc::new(Scheduler::new(
        store.clone() as Arc<dyn EventStore>,
        locks.clone() as Arc<dyn ubl_store::LockService>,
        table.clone(),
        idempotency.clone(),
    ));
    let replica_b = Arc::new(Scheduler::new(
        store.clone() as Arc<dyn EventStore>,
        locks as Arc<dyn ubl_store::LockService>,
        table,
        idempotency,
    ));

    let (r1, r2, r3, r4) = tokio::join!(
        replica_a.run_scheduling_tick(now),
        replica_b.run_scheduling_tick(now),
        replica_a.run_scheduling_tick(now),
        replica_b.run_scheduling_tick(now),
    );
    for r in [r1, r2, r3, r4] {
        r.unwrap();
    }

    let triggered: Vec<_> = store
        .get_by_sequence(1, None)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| {
            e.event_type == event_types::DEADLINE_TRIGGERED && e.payload["deadline_id"] == "D1"
        })
        .collect();
    assert_eq!(triggered.len(), 1);
}

// ── S5: cross-realm transfer only through the saga ──────────────────────

async fn two_realms(runtime: &LedgerRuntime) -> (String, String) {
    let parent = runtime
        .realms()
        .create_realm(
            "r1",
            RealmConfig {
                isolation: IsolationMode::Hierarchical,
                cross_realm_allowed: true,
                ..RealmConfig::default()
            },
            "agr-license",
            Some(PRIMORDIAL_REALM_ID),
            ActorRef::system("test"),
        )
        .await
        .unwrap();
    let child = runtime
        .realms()
        .create_realm(
            "r2",
            RealmConfig {
                isolation: IsolationMode::Hierarchical,
                cross_realm_allowed: true,
                ..RealmConfig::default()
            },
            "agr-license",
            Some(&parent.id),
            ActorRef::system("test"),
        )
        .await
        .unwrap();
    (parent.id, child.id)
}

#[tokio::test]
async fn s5_cross_realm_transfer_requires_saga() {
    let runtime = LedgerRuntime::builder().build();
    runtime.bootstrap().await.unwrap();
    let (r1, r2) = two_realms(&runtime).await;

    runtime
        .append(
            EventInputBuilder::new(event_types::ASSET_CREATED, aggregate_types::ASSET, "asset-1")
                .version(1)
                .payload(serde_json::json!({
                    "realm_id": r1,
                    "asset_type": "vehicle",
                    "owner_id": "ent-acme",
                }))
                .actor(ActorRef::system("test"))
                .build(),
        )
        .await
        .unwrap();

    // Direct two-realm write: rejected by the invariant gate.
    let direct = EventInputBuilder::new(
        event_types::ASSET_TRANSFERRED,
        aggregate_types::ASSET,
        "asset-1",
    )
    .version(2)
    .payload(serde_json::json!({
        "to_owner": "ent-john",
        "from_realm": r1,
        "to_realm": r2,
    }))
    .actor(ActorRef::party("ent-acme"))
    .build();
    let err = runtime.append(direct).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvariantViolation);

    // The registered saga performs the same transfer.
    let mut vars = BTreeMap::new();
    vars.insert("asset_id".to_string(), serde_json::json!("asset-1"));
    vars.insert("to_owner".to_string(), serde_json::json!("ent-john"));
    vars.insert("from_realm".to_string(), serde_json::json!(r1.clone()));
    vars.insert("to_realm".to_string(), serde_json::json!(r2.clone()));
    vars.insert("original_owner".to_string(), serde_json::json!("ent-acme"));

    let report = runtime
        .sagas()
        .run(CrossRealmTransferSaga::NAME, vars.clone())
        .await
        .unwrap();
    assert_eq!(report.status, SagaStatus::Completed);

    let asset = runtime.repos().assets.load("asset-1").await.unwrap().unwrap();
    assert_eq!(asset.state.realm_id, r2);
    assert_eq!(asset.state.owner_id.as_deref(), Some("ent-john"));

    // Every saga-stamped event carries the saga id.
    let stamped = runtime
        .store()
        .get_by_aggregate(aggregate_types::ASSET, "asset-1", &AggregateQuery::all())
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.metadata_value(SAGA_ID_KEY).is_some())
        .count();
    assert!(stamped >= 3);

    assert!(runtime
        .store()
        .verify_integrity(None, None)
        .await
        .unwrap()
        .valid);
}

#[tokio::test]
async fn s5_failed_saga_leaves_both_realms_unchanged() {
    let runtime = LedgerRuntime::builder().build();
    runtime.bootstrap().await.unwrap();
    let (r1, r2) = two_realms(&runtime).await;

    runtime
        .append(
            EventInputBuilder::new(event_types::ASSET_CREATED, aggregate_types::ASSET, "asset-1")
                .version(1)
                .payload(serde_json::json!({
                    "realm_id": r1,
                    "asset_type": "vehicle",
                    "owner_id": "ent-acme",
                }))
                .actor(ActorRef::system("test"))
                .build(),
        )
        .await
        .unwrap();

    let mut vars = BTreeMap::new();
    vars.insert("asset_id".to_string(), serde_json::json!("asset-1"));
    vars.insert("to_owner".to_string(), serde_json::json!("ent-john"));
    vars.insert("from_realm".to_string(), serde_json::json!(r1.clone()));
    vars.insert("to_realm".to_string(), serde_json::json!(r2));
    vars.insert("original_owner".to_string(), serde_json::json!("ent-acme"));
    vars.insert("fail_move".to_string(), serde_json::json!(true));

    let report = runtime
        .sagas()
        .run(CrossRealmTransferSaga::NAME, vars)
        .await
        .unwrap();
    assert_eq!(report.status, SagaStatus::Compensated);

    // Compensation restored the original state on both sides.
    let asset = runtime.repos().assets.load("asset-1").await.unwrap().unwrap();
    assert_eq!(asset.state.realm_id, r1);
    assert_eq!(asset.state.owner_id.as_deref(), Some("ent-acme"));
    assert_eq!(asset.state.status, "available");
}

// ── S6: temporal reconstruction ─────────────────────────────────────────

#[tokio::test]
async fn s6_reconstruct_at_version_and_timestamp() {
    let runtime = LedgerRuntime::builder().build();

    let at = |ms: i64| Utc.timestamp_millis_opt(ms).unwrap();
    let events = [
        (1u64, 1_000, serde_json::json!({
            "realm_id": "r-1", "entity_type": "person", "name": "one",
        })),
        (2, 2_000, serde_json::json!({"name": "two"})),
        (3, 3_000, serde_json::json!({"name": "three"})),
    ];
    for (version, ms, payload) in events {
        let event_type = if version == 1 {
            event_types::ENTITY_CREATED
        } else {
            event_types::ENTITY_UPDATED
        };
        runtime
            .append(
                EventInputBuilder::new(event_type, aggregate_types::ENTITY, "ent-t")
                    .version(version)
                    .payload(payload)
                    .timestamp(at(ms))
                    .actor(ActorRef::system("test"))
                    .build(),
            )
            .await
            .unwrap();
    }

    let entities = &runtime.repos().entities;

    let at_v2 = entities.load_at_version("ent-t", 2).await.unwrap().unwrap();
    assert_eq!(at_v2.state.identity.name, "two");
    assert_eq!(at_v2.version, 2);

    let at_t1500 = entities
        .load_at_timestamp("ent-t", at(1_500))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(at_t1500.state.identity.name, "one");
    assert_eq!(at_t1500.version, 1);

    let current = entities.load("ent-t").await.unwrap().unwrap();
    assert_eq!(current.state.identity.name, "three");
    assert_eq!(current.version, 3);
}
