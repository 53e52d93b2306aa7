//! Leader merge selection end to end: local merges on every replica, and the
//! fetch fallback when a follower is missing inputs.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TABLE_PATH, TestCluster, TogglePolicy};
use replitree::replication::{InMemoryPartStore, PartStore};

async fn settle(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

// ============================================================================
// S3: merge on leader and follower
// ============================================================================

#[tokio::test(start_paused = true)]
async fn both_replicas_merge_locally() {
    let cluster = TestCluster::new();
    let policy = TogglePolicy::new();
    let r1 = cluster
        .start_replica_with("r1", false, InMemoryPartStore::new(), policy.clone())
        .await
        .unwrap();
    let r2 = cluster
        .start_replica_with("r2", false, InMemoryPartStore::new(), TogglePolicy::new())
        .await
        .unwrap();

    r1.insert_part("20210101_0_0_0").await.unwrap();
    r1.insert_part("20210101_1_1_0").await.unwrap();

    // Let both parts replicate everywhere before merges start.
    settle(20).await;
    assert_eq!(r2.store.part_names().len(), 2);
    assert!(r1.table.is_leader());
    assert!(!r2.table.is_leader());

    policy.enable();
    settle(30).await;

    // Both replicas converged on the merged part, inputs gone everywhere.
    let merged = "20210101_0_1_1".to_string();
    for replica in [&r1, &r2] {
        assert_eq!(replica.store.part_names(), vec![merged.clone()]);
    }
    for name in ["r1", "r2"] {
        assert_eq!(cluster.coordinator_parts(name).await, vec![merged.clone()]);
        assert!(cluster.checksums_node(name, &merged).await.is_some());
    }

    // Merging is deterministic: identical checksums on both replicas.
    assert_eq!(
        cluster.checksums_node("r1", &merged).await,
        cluster.checksums_node("r2", &merged).await,
    );

    r1.table.shutdown().await;
    r2.table.shutdown().await;
}

// ============================================================================
// S4: merge fallback to fetch
// ============================================================================

#[tokio::test(start_paused = true)]
async fn follower_missing_input_fetches_merged_part() {
    let cluster = TestCluster::new();
    let policy = TogglePolicy::new();
    let r1 = cluster
        .start_replica_with("r1", false, InMemoryPartStore::new(), policy.clone())
        .await
        .unwrap();
    let r2 = cluster
        .start_replica_with("r2", false, InMemoryPartStore::new(), TogglePolicy::new())
        .await
        .unwrap();

    r1.insert_part("20210101_0_0_0").await.unwrap();
    r1.insert_part("20210101_1_1_0").await.unwrap();
    settle(20).await;
    assert_eq!(r2.store.part_names().len(), 2);

    // r2 loses its copy of B (disk swap, operator action); the coordinator
    // node stays.
    r2.store
        .rename_and_detach_part("20210101_1_1_0", "broken_")
        .await
        .unwrap();

    policy.enable();
    settle(40).await;

    let merged = "20210101_0_1_1".to_string();
    // r1 merged locally.
    assert_eq!(r1.store.part_names(), vec![merged.clone()]);
    // r2 could not: it fetched the merged part instead, and the fetch
    // obsoleted its local copy of A.
    assert!(r2.store.part_names().contains(&merged));
    assert!(!r2.store.part_names().contains(&"20210101_0_0_0".to_string()));
    let r2_parts = cluster.coordinator_parts("r2").await;
    assert!(r2_parts.contains(&merged));
    assert!(!r2_parts.contains(&"20210101_0_0_0".to_string()));
    assert!(cluster.checksums_node("r2", &merged).await.is_some());

    // The two replicas hold byte-identical merged parts.
    assert_eq!(
        cluster.checksums_node("r1", &merged).await,
        cluster.checksums_node("r2", &merged).await,
    );

    r1.table.shutdown().await;
    r2.table.shutdown().await;
}

// ============================================================================
// Abandoned inserts leave mergeable gaps
// ============================================================================

#[tokio::test(start_paused = true)]
async fn abandoned_insert_gap_is_merged_across() {
    let cluster = TestCluster::new();
    let policy = TogglePolicy::new();
    let r1 = cluster
        .start_replica_with("r1", false, InMemoryPartStore::new(), policy.clone())
        .await
        .unwrap();

    r1.insert_part("20210101_0_0_0").await.unwrap();

    // A writer allocates block 1, then dies before committing anything.
    let lock = r1.table.allocate_block_number().await.unwrap();
    assert_eq!(lock.number, 1);
    let gap_block = lock.path.clone();
    let zk = cluster.session();
    lock.abandon(&zk).await.unwrap();

    r1.insert_part("20210101_2_2_0").await.unwrap();
    settle(10).await;

    // The gap number reads as abandoned, so the leader merges across it and
    // garbage-collects the marker.
    policy.enable();
    settle(30).await;
    assert_eq!(r1.store.part_names(), vec!["20210101_0_2_1".to_string()]);
    assert_eq!(
        cluster.coordinator_parts("r1").await,
        vec!["20210101_0_2_1".to_string()]
    );
    assert!(!zk.exists(&gap_block).await.unwrap());

    r1.table.shutdown().await;
}

// ============================================================================
// The leader caps concurrently proposed merges
// ============================================================================

#[tokio::test(start_paused = true)]
async fn selector_respects_merge_cap() {
    let cluster = TestCluster::new();
    let policy = TogglePolicy::new();
    let r1 = cluster
        .start_replica_with("r1", false, InMemoryPartStore::new(), policy.clone())
        .await
        .unwrap();

    for i in 0..6 {
        r1.insert_part(&format!("20210101_{i}_{i}_0")).await.unwrap();
    }
    settle(20).await;

    policy.enable();
    settle(60).await;

    // Everything eventually folds together; the default policy folds the
    // longest run, so a single covering part remains.
    let parts = r1.store.part_names();
    assert_eq!(parts.len(), 1, "expected one merged part, got {parts:?}");
    let zk = cluster.session();
    let log = zk
        .children(&format!("{TABLE_PATH}/replicas/r1/log"))
        .await
        .unwrap();
    // 6 inserts plus at least one merge record.
    assert!(log.len() > 6);

    r1.table.shutdown().await;
}
