//! End-to-end replication scenarios over the in-memory ensemble.
//!
//! Every test runs with paused time: the background loops' sleeps advance
//! instantly once all tasks are idle, so "wait ten seconds" costs nothing
//! while still exercising the real schedules.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{NoMergePolicy, TABLE_PATH, TestCluster};
use replitree::replication::{InMemoryPartStore, ReplicationError};

async fn settle(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

// ============================================================================
// S1: single-replica no-op
// ============================================================================

#[tokio::test(start_paused = true)]
async fn idle_replica_keeps_empty_queue() {
    let cluster = TestCluster::new();

    // First start creates the structure; the replica then goes away.
    let r1 = cluster.start_replica("r1", false).await.unwrap();
    r1.table.shutdown().await;

    // Its part arrived outside the log (announced directly), and the replica
    // re-attaches.
    let store = r1.store.clone();
    store.seed_part("20210101_0_0_0");
    cluster.seed_announced_part("r1", "20210101_0_0_0").await;
    let r1 = cluster
        .start_replica_with_store("r1", true, store)
        .await
        .unwrap();

    // Nothing is published; after ten seconds the queue is still empty.
    settle(10).await;
    assert_eq!(r1.table.queue_size(), 0);
    assert_eq!(
        cluster.coordinator_parts("r1").await,
        vec!["20210101_0_0_0".to_string()]
    );
    r1.table.shutdown().await;
}

// ============================================================================
// S2: two-replica fetch
// ============================================================================

#[tokio::test(start_paused = true)]
async fn fresh_replica_fetches_published_part() {
    let cluster = TestCluster::new();
    let r1 = cluster
        .start_replica_with("r1", false, InMemoryPartStore::new(), Arc::new(NoMergePolicy))
        .await
        .unwrap();
    let r2 = cluster
        .start_replica_with("r2", false, InMemoryPartStore::new(), Arc::new(NoMergePolicy))
        .await
        .unwrap();

    // r1 already carries a part that predates the log.
    r1.store.seed_part("20210101_0_0_0");
    cluster.seed_announced_part("r1", "20210101_0_0_0").await;

    // An external writer commits a new part on r1 and announces it.
    r1.insert_part("20210102_0_0_0").await.unwrap();

    // Within one fan-in period plus execution, r2 materializes the part.
    settle(15).await;
    assert!(
        cluster
            .coordinator_parts("r2")
            .await
            .contains(&"20210102_0_0_0".to_string())
    );
    assert!(r2.store.part_names().contains(&"20210102_0_0_0".to_string()));
    // The pre-log part was never replicated: it has no log record.
    assert!(!r2.store.part_names().contains(&"20210101_0_0_0".to_string()));

    // Both replicas advanced their pointer past r1's record.
    let zk = cluster.session();
    for reader in ["r1", "r2"] {
        let (data, _) = zk
            .get(&format!("{TABLE_PATH}/replicas/{reader}/log_pointers/r1"))
            .await
            .unwrap();
        assert_eq!(data, b"1".to_vec());
    }

    r1.table.shutdown().await;
    r2.table.shutdown().await;
}

// ============================================================================
// Convergence: same publications, identical part sets
// ============================================================================

#[tokio::test(start_paused = true)]
async fn replicas_converge_to_identical_part_sets() {
    let cluster = TestCluster::new();
    let r1 = cluster
        .start_replica_with("r1", false, InMemoryPartStore::new(), Arc::new(NoMergePolicy))
        .await
        .unwrap();
    let r2 = cluster
        .start_replica_with("r2", false, InMemoryPartStore::new(), Arc::new(NoMergePolicy))
        .await
        .unwrap();

    // Writers land on both replicas.
    r1.insert_part("20210101_0_0_0").await.unwrap();
    r2.insert_part("20210101_1_1_0").await.unwrap();
    r1.insert_part("20210102_2_2_0").await.unwrap();

    settle(20).await;

    let expected = vec![
        "20210101_0_0_0".to_string(),
        "20210101_1_1_0".to_string(),
        "20210102_2_2_0".to_string(),
    ];
    assert_eq!(cluster.coordinator_parts("r1").await, expected);
    assert_eq!(cluster.coordinator_parts("r2").await, expected);
    assert_eq!(r1.store.part_names(), expected);
    assert_eq!(r2.store.part_names(), expected);

    // Queues drained; every queue node retired.
    assert_eq!(r1.table.queue_size(), 0);
    assert_eq!(r2.table.queue_size(), 0);
    let zk = cluster.session();
    for name in ["r1", "r2"] {
        assert!(
            zk.children(&format!("{TABLE_PATH}/replicas/{name}/queue"))
                .await
                .unwrap()
                .is_empty()
        );
    }

    // Fetched checksums match the source's.
    assert_eq!(
        cluster.checksums_node("r1", "20210101_1_1_0").await,
        cluster.checksums_node("r2", "20210101_1_1_0").await,
    );

    r1.table.shutdown().await;
    r2.table.shutdown().await;
}

// ============================================================================
// S6: duplicate start rejected
// ============================================================================

#[tokio::test(start_paused = true)]
async fn duplicate_replica_start_is_rejected() {
    let cluster = TestCluster::new();
    let r1 = cluster.start_replica("r1", false).await.unwrap();

    let err = cluster
        .start_replica_with_store("r1", true, r1.store.clone())
        .await
        .unwrap_err();
    assert!(
        matches!(err, ReplicationError::ReplicaIsAlreadyActive { .. }),
        "expected ReplicaIsAlreadyActive, got {err:?}"
    );

    // After a clean shutdown the replica can come back.
    r1.table.shutdown().await;
    let r1b = cluster
        .start_replica_with_store("r1", true, r1.store.clone())
        .await
        .unwrap();
    r1b.table.shutdown().await;
}

// ============================================================================
// Restart: pointers and queue nodes survive
// ============================================================================

#[tokio::test(start_paused = true)]
async fn restart_reloads_pending_queue_nodes() {
    use replitree::replication::{CreateMode, LogEntry};

    let cluster = TestCluster::new();
    let r1 = cluster
        .start_replica_with("r1", false, InMemoryPartStore::new(), Arc::new(NoMergePolicy))
        .await
        .unwrap();
    let r2 = cluster
        .start_replica_with("r2", false, InMemoryPartStore::new(), Arc::new(NoMergePolicy))
        .await
        .unwrap();
    r2.table.shutdown().await;

    r1.insert_part("20210104_0_0_0").await.unwrap();

    // Simulate r2 crashing right after its fan-in multi committed: the queue
    // node exists and the pointer is advanced, but nothing executed.
    let zk = cluster.session();
    let entry = LogEntry::get_part("r1", "20210104_0_0_0");
    zk.create(
        &format!("{TABLE_PATH}/replicas/r2/queue/queue-"),
        entry.to_text().as_bytes(),
        CreateMode::PersistentSequential,
    )
    .await
    .unwrap();
    let pointer = format!("{TABLE_PATH}/replicas/r2/log_pointers/r1");
    if zk.exists(&pointer).await.unwrap() {
        zk.set(&pointer, b"1").await.unwrap();
    } else {
        zk.create(&pointer, b"1", CreateMode::Persistent).await.unwrap();
    }

    let r2 = cluster
        .start_replica_with_store("r2", true, r2.store.clone())
        .await
        .unwrap();
    settle(15).await;

    assert!(r2.store.part_names().contains(&"20210104_0_0_0".to_string()));
    assert!(
        zk.children(&format!("{TABLE_PATH}/replicas/r2/queue"))
            .await
            .unwrap()
            .is_empty()
    );

    r1.table.shutdown().await;
    r2.table.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn restart_resumes_from_log_pointer() {
    let cluster = TestCluster::new();
    let r1 = cluster
        .start_replica_with("r1", false, InMemoryPartStore::new(), Arc::new(NoMergePolicy))
        .await
        .unwrap();
    let r2 = cluster
        .start_replica_with("r2", false, InMemoryPartStore::new(), Arc::new(NoMergePolicy))
        .await
        .unwrap();

    // Stop r2's loops, then publish on r1: the record reaches r2's log
    // pointer only after restart.
    r2.table.shutdown().await;
    r1.insert_part("20210103_0_0_0").await.unwrap();
    settle(10).await;

    let r2 = cluster
        .start_replica_with_store("r2", true, r2.store.clone())
        .await
        .unwrap();
    settle(15).await;
    assert!(r2.store.part_names().contains(&"20210103_0_0_0".to_string()));
    assert_eq!(r2.table.queue_size(), 0);

    r1.table.shutdown().await;
    r2.table.shutdown().await;
}
