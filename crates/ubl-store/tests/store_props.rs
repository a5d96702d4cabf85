// SPDX-License-Identifier: MIT OR Apache-2.0

//! Property tests over the append contract: canonical hashes, chain links,
//! gap-free versions, conflict behavior, and whole-log integrity.

use proptest::prelude::*;
use tokio::runtime::Runtime;

use ubl_core::{event_hash, ActorRef, EventInputBuilder};
use ubl_store::{AggregateQuery, EventStore, MemoryEventStore};

/// An arbitrary append plan: which aggregate each event targets.
fn append_plan() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(0u8..4, 1..40)
}

fn aggregate_name(slot: u8) -> String {
    format!("agg-{slot}")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every persisted event's stored hash equals its recomputed canonical
    /// hash, and every previous_hash links to its predecessor.
    #[test]
    fn hashes_and_links_hold_for_all_plans(plan in append_plan()) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let store = MemoryEventStore::new();
            let mut versions = [0u64; 4];
            for slot in &plan {
                let v = &mut versions[*slot as usize];
                *v += 1;
                let input = EventInputBuilder::new("Ping", "Probe", aggregate_name(*slot))
                    .version(*v)
                    .actor(ActorRef::system("prop"))
                    .build();
                store.append(input).await.unwrap();
            }

            let events = store.get_by_sequence(1, None).await.unwrap();
            prop_assert_eq!(events.len(), plan.len());

            let mut prev_hash = ubl_core::GENESIS_HASH.to_string();
            for (i, event) in events.iter().enumerate() {
                prop_assert_eq!(event.sequence, i as u64 + 1);
                prop_assert_eq!(&event.previous_hash, &prev_hash);
                prop_assert_eq!(&event_hash(event).unwrap(), &event.hash);
                prev_hash = event.hash.clone();
            }
            Ok(())
        })?;
    }

    /// Per aggregate, the multiset of versions is exactly {1..k}.
    #[test]
    fn aggregate_versions_are_gap_free(plan in append_plan()) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let store = MemoryEventStore::new();
            let mut versions = [0u64; 4];
            for slot in &plan {
                let v = &mut versions[*slot as usize];
                *v += 1;
                let input = EventInputBuilder::new("Ping", "Probe", aggregate_name(*slot))
                    .version(*v)
                    .actor(ActorRef::system("prop"))
                    .build();
                store.append(input).await.unwrap();
            }

            for slot in 0u8..4 {
                let events = store
                    .get_by_aggregate("Probe", &aggregate_name(slot), &AggregateQuery::all())
                    .await
                    .unwrap();
                let got: Vec<u64> = events.iter().map(|e| e.aggregate_version).collect();
                let expected: Vec<u64> = (1..=versions[slot as usize]).collect();
                prop_assert_eq!(got, expected);
            }
            Ok(())
        })?;
    }

    /// Reusing a version fails with CONCURRENCY_CONFLICT; claiming the next
    /// version succeeds. Exactly one of two identical claims wins.
    #[test]
    fn version_reuse_conflicts(reuse_at in 1u64..10) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let store = MemoryEventStore::new();
            for v in 1..=reuse_at {
                let input = EventInputBuilder::new("Ping", "Probe", "solo")
                    .version(v)
                    .actor(ActorRef::system("prop"))
                    .build();
                store.append(input).await.unwrap();
            }
            let stale = EventInputBuilder::new("Ping", "Probe", "solo")
                .version(reuse_at)
                .actor(ActorRef::system("prop"))
                .build();
            let err = store.append(stale).await.unwrap_err();
            prop_assert_eq!(err.kind, ubl_core::ErrorKind::ConcurrencyConflict);

            let fresh = EventInputBuilder::new("Ping", "Probe", "solo")
                .version(reuse_at + 1)
                .actor(ActorRef::system("prop"))
                .build();
            prop_assert!(store.append(fresh).await.is_ok());
            Ok(())
        })?;
    }

    /// An installation that has only ever used the append API verifies
    /// clean over its full range.
    #[test]
    fn append_only_installations_verify_clean(plan in append_plan()) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let store = MemoryEventStore::new();
            let mut versions = [0u64; 4];
            for slot in &plan {
                let v = &mut versions[*slot as usize];
                *v += 1;
                let input = EventInputBuilder::new("Ping", "Probe", aggregate_name(*slot))
                    .version(*v)
                    .actor(ActorRef::system("prop"))
                    .build();
                store.append(input).await.unwrap();
            }
            let current = store.get_current_sequence().await.unwrap();
            let report = store.verify_integrity(Some(1), Some(current)).await.unwrap();
            prop_assert!(report.valid);
            Ok(())
        })?;
    }
}
