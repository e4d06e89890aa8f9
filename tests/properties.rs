#[macro_use]
extern crate proptest;

mod common;

use proptest::prelude::*;

use common::{draft, open_store};
use taskvault::store::{Page, Sort, SortField, SortOrder, TaskFilter};
use taskvault::task::TaskPatch;

fn block_on<F: std::future::Future<Output = ()>>(fut: F) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(fut);
}

proptest! {
    /// After N successful priority patches, a task's version equals `1 + N`
    /// and its stored checksum matches a fresh recomputation.
    #[test]
    fn prop_version_tracks_mutation_count_and_checksum_stays_valid(
        priorities in prop::collection::vec(0i64..1000, 0..15),
    ) {
        block_on(async move {
            let dir = tempfile::tempdir().unwrap();
            let store = open_store(dir.path()).await;
            let mut task = store.create(draft("t", 0)).await.unwrap();
            assert_eq!(task.version, 1);

            for p in &priorities {
                task = store
                    .update(
                        &task.id,
                        TaskPatch { priority: Some(*p), ..Default::default() },
                    )
                    .await
                    .unwrap();
            }

            assert_eq!(task.version, 1 + priorities.len() as u64);
            assert!(task.checksum_valid());
            let fetched = store.get(&task.id).await.unwrap().unwrap();
            assert!(fetched.checksum_valid());
            assert_eq!(fetched.version, task.version);
        });
    }
}

proptest! {
    /// The audit hash chain verifies after any interleaving of creates and
    /// updates.
    #[test]
    fn prop_audit_chain_stays_linked(
        ops in prop::collection::vec(0u8..2, 1..20),
    ) {
        block_on(async move {
            let dir = tempfile::tempdir().unwrap();
            let store = open_store(dir.path()).await;
            let mut ids = Vec::new();

            for op in ops {
                if op == 0 || ids.is_empty() {
                    let task = store.create(draft("t", 0)).await.unwrap();
                    ids.push(task.id);
                } else {
                    let id = &ids[ids.len() - 1];
                    let _ = store
                        .update(
                            id,
                            TaskPatch { priority: Some(1), ..Default::default() },
                        )
                        .await
                        .unwrap();
                }
            }

            let stats = store.stats().await.unwrap();
            assert!(stats.audit_chain_ok);
        });
    }
}

proptest! {
    /// Repeated `list` calls with the same filter, sort, and page return
    /// identical orderings.
    #[test]
    fn prop_list_is_stable_across_repeated_calls(
        priorities in prop::collection::vec(0i64..50, 1..20),
    ) {
        block_on(async move {
            let dir = tempfile::tempdir().unwrap();
            let store = open_store(dir.path()).await;
            for p in &priorities {
                store.create(draft("t", *p)).await.unwrap();
            }

            let sort = Sort { field: SortField::Priority, order: SortOrder::Desc };
            let page = Page { page: 1, limit: priorities.len().max(1) };
            let first = store.list(&TaskFilter::default(), sort, page).await.unwrap();
            let second = store.list(&TaskFilter::default(), sort, page).await.unwrap();

            let first_ids: Vec<_> = first.items.iter().map(|t| t.id.clone()).collect();
            let second_ids: Vec<_> = second.items.iter().map(|t| t.id.clone()).collect();
            assert_eq!(first_ids, second_ids);

            for window in first.items.windows(2) {
                assert!(window[0].priority >= window[1].priority);
            }
        });
    }
}

proptest! {
    /// A `get` right after `create` is served from cache and matches the
    /// record; invalidating and re-`get`-ting still returns the same
    /// logical value.
    #[test]
    fn prop_cache_get_and_invalidate_agree_with_store(
        priority in 0i64..1000,
    ) {
        block_on(async move {
            let dir = tempfile::tempdir().unwrap();
            let store = open_store(dir.path()).await;
            let task = store.create(draft("t", priority)).await.unwrap();

            let cached = store.get(&task.id).await.unwrap().unwrap();
            assert_eq!(cached.checksum, task.checksum);

            store.invalidate_cache(&task.id);
            let reread = store.get(&task.id).await.unwrap().unwrap();
            assert_eq!(reread.checksum, task.checksum);
        });
    }
}
