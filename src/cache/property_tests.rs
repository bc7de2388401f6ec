//! Property-Based Tests for Cache Module
//!
//! Drives [`BoundedCache`] over the in-memory store with generated operation
//! sequences.

use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{BoundedCache, MAX_ID_LENGTH};
use crate::config::CacheConfig;
use crate::store::MemoryStore;

// == Test Configuration ==
const TEST_MAX_ENTRIES: u64 = 10;

// == Strategies ==
/// Small identifier pool so sequences revisit the same ids
fn id_strategy() -> impl Strategy<Value = String> {
    (0u32..25).prop_map(|n| n.to_string())
}

fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..64)
}

#[derive(Debug, Clone)]
enum CacheOp {
    Set { id: String, payload: Vec<u8> },
    Get { id: String },
    Delete { id: String },
}

fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        3 => (id_strategy(), payload_strategy())
            .prop_map(|(id, payload)| CacheOp::Set { id, payload }),
        2 => id_strategy().prop_map(|id| CacheOp::Get { id }),
        1 => id_strategy().prop_map(|id| CacheOp::Delete { id }),
    ]
}

async fn new_cache(max_entries: u64) -> BoundedCache<MemoryStore> {
    let config = CacheConfig {
        max_entries,
        ..CacheConfig::default()
    };
    BoundedCache::start(Arc::new(MemoryStore::new()), config)
        .await
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // Sequential writers never leave the index above its bound.
    #[test]
    fn prop_size_never_exceeds_bound(ops in prop::collection::vec(cache_op_strategy(), 1..80)) {
        tokio_test::block_on(async {
            let cache = new_cache(TEST_MAX_ENTRIES).await;
            for op in ops {
                match op {
                    CacheOp::Set { id, payload } => {
                        cache.set(&id, &payload, Duration::ZERO).await.unwrap();
                    }
                    CacheOp::Get { id } => {
                        cache.get(&id).await.unwrap();
                    }
                    CacheOp::Delete { id } => {
                        cache.delete(&id).await.unwrap();
                    }
                }
                prop_assert!(cache.len().await.unwrap() <= TEST_MAX_ENTRIES);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    // Distinct inserts leave exactly the newest `max` identifiers, oldest first.
    #[test]
    fn prop_fifo_keeps_newest(count in 1usize..40, max in 1u64..15) {
        tokio_test::block_on(async {
            let cache = new_cache(max).await;
            for i in 0..count {
                cache.set(&i.to_string(), b"p", Duration::ZERO).await.unwrap();
            }

            let keep = count.min(max as usize);
            let expected: Vec<String> = (count - keep..count).map(|i| i.to_string()).collect();
            prop_assert_eq!(cache.order().await.unwrap(), expected);
            prop_assert_eq!(cache.stats().evictions, (count - keep) as u64);
            Ok::<(), TestCaseError>(())
        })?;
    }

    // Every index member has a payload and no identifier appears twice.
    #[test]
    fn prop_index_matches_payloads(ops in prop::collection::vec(cache_op_strategy(), 1..60)) {
        tokio_test::block_on(async {
            let cache = new_cache(TEST_MAX_ENTRIES).await;
            for op in ops {
                match op {
                    CacheOp::Set { id, payload } => {
                        cache.set(&id, &payload, Duration::ZERO).await.unwrap();
                    }
                    CacheOp::Delete { id } => {
                        cache.delete(&id).await.unwrap();
                    }
                    CacheOp::Get { .. } => {}
                }
            }

            let order = cache.order().await.unwrap();
            let unique: HashSet<&String> = order.iter().collect();
            prop_assert_eq!(unique.len(), order.len());
            for id in &order {
                prop_assert!(cache.get(id).await.unwrap().is_some());
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    // Hit and miss counters match the lookups performed.
    #[test]
    fn prop_statistics_accuracy(ops in prop::collection::vec(cache_op_strategy(), 1..50)) {
        tokio_test::block_on(async {
            let cache = new_cache(TEST_MAX_ENTRIES).await;
            let mut expected_hits = 0u64;
            let mut expected_misses = 0u64;

            for op in ops {
                match op {
                    CacheOp::Set { id, payload } => {
                        cache.set(&id, &payload, Duration::ZERO).await.unwrap();
                    }
                    CacheOp::Get { id } => match cache.get(&id).await.unwrap() {
                        Some(_) => expected_hits += 1,
                        None => expected_misses += 1,
                    },
                    CacheOp::Delete { id } => {
                        cache.delete(&id).await.unwrap();
                    }
                }
            }

            let stats = cache.stats();
            prop_assert_eq!(stats.hits, expected_hits);
            prop_assert_eq!(stats.misses, expected_misses);
            prop_assert_eq!(stats.total_requests, expected_hits + expected_misses);
            Ok::<(), TestCaseError>(())
        })?;
    }

    // Identifiers above the length limit are rejected without touching the store.
    #[test]
    fn prop_oversized_ids_rejected(extra in 1usize..64) {
        tokio_test::block_on(async {
            let cache = new_cache(TEST_MAX_ENTRIES).await;
            let id = "k".repeat(MAX_ID_LENGTH + extra);
            prop_assert!(cache.set(&id, b"p", Duration::ZERO).await.is_err());
            prop_assert_eq!(cache.len().await.unwrap(), 0);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
