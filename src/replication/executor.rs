//! Queue workers: execute replication log entries.
//!
//! Each worker loops claiming the earliest executable entry and running it:
//! merge the named inputs locally, or fetch the target part from an active
//! peer. A merge whose inputs are not all committed locally falls back to
//! fetching the already-merged part: the result is identical by
//! construction, since merging is deterministic and checksums are published.
//!
//! Failures never kill a worker. The entry is returned to the queue tail and
//! retried; if the failed fetch was feeding a pending merge, the remaining
//! sibling fetches are deferred behind the merge so the replica fetches one
//! merged part instead of chasing inputs that the merge supersedes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use backon::Retryable;
use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::constants::{QUEUE_AFTER_WORK_SLEEP, QUEUE_ERROR_SLEEP, QUEUE_NO_WORK_SLEEP};

use super::coordinator::{Coordinator, Op, RemoveOutcome};
use super::error::{ReplicationError, ReplicationResult};
use super::log_entry::{EntryKind, LogEntry};
use super::metrics;
use super::part::PartInfo;
use super::queue::ReplicationQueue;
use super::retry;
use super::store::{PartFetcher, PartStore};

/// Why an entry failed, and where.
#[derive(Debug)]
pub struct ExecutionFailure {
    pub error: ReplicationError,
    /// The failure happened while fetching the target part (including peer
    /// selection). Only these trigger sibling-fetch deferral.
    pub during_fetch: bool,
}

impl ExecutionFailure {
    fn local(error: ReplicationError) -> Self {
        ExecutionFailure {
            error,
            during_fetch: false,
        }
    }

    fn fetch(error: ReplicationError) -> Self {
        ExecutionFailure {
            error,
            during_fetch: true,
        }
    }
}

/// Shared state driving one replica's queue workers.
pub struct QueueExecutor {
    coordinator: Arc<dyn Coordinator>,
    store: Arc<dyn PartStore>,
    fetcher: Arc<dyn PartFetcher>,
    queue: Arc<ReplicationQueue>,
    /// Held shared during a fetch so a concurrent schema change cannot land
    /// mid-download.
    structure_lock: Arc<RwLock<()>>,
    table_path: String,
    replica_path: String,
    replica_name: String,
}

impl QueueExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        store: Arc<dyn PartStore>,
        fetcher: Arc<dyn PartFetcher>,
        queue: Arc<ReplicationQueue>,
        structure_lock: Arc<RwLock<()>>,
        table_path: impl Into<String>,
        replica_path: impl Into<String>,
        replica_name: impl Into<String>,
    ) -> Self {
        QueueExecutor {
            coordinator,
            store,
            fetcher,
            queue,
            structure_lock,
            table_path: table_path.into(),
            replica_path: replica_path.into(),
            replica_name: replica_name.into(),
        }
    }

    fn part_node(&self, name: &str) -> String {
        format!("{}/parts/{name}", self.replica_path)
    }

    /// Pick an active peer holding `part_name`, uniformly at random.
    ///
    /// The parts check and the liveness check are two separate reads; a peer
    /// losing its session in between can still be selected. The fetch then
    /// fails and the entry is re-queued: the normal transient path.
    pub async fn find_active_replica_having_part(
        &self,
        part_name: &str,
    ) -> ReplicationResult<String> {
        let mut replicas = self
            .coordinator
            .children(&format!("{}/replicas", self.table_path))
            .await?;
        replicas.shuffle(&mut rand::thread_rng());

        for replica in replicas {
            let base = format!("{}/replicas/{replica}", self.table_path);
            if self
                .coordinator
                .exists(&format!("{base}/parts/{part_name}"))
                .await?
                && self.coordinator.exists(&format!("{base}/is_active")).await?
            {
                return Ok(replica);
            }
        }
        Err(ReplicationError::NoReplicaHasPart {
            part_name: part_name.to_string(),
        })
    }

    /// Parse a `/replicas/<r>/host` record.
    fn parse_host(path: &str, data: &[u8]) -> ReplicationResult<(String, u16)> {
        let malformed = |detail: String| ReplicationError::MalformedNode {
            path: path.to_string(),
            detail,
        };
        let text = std::str::from_utf8(data)
            .map_err(|_| malformed("host record is not UTF-8".to_string()))?;
        let mut lines = text.lines();
        let host = lines
            .next()
            .and_then(|l| l.strip_prefix("host: "))
            .ok_or_else(|| malformed(format!("bad host record {text:?}")))?;
        let port = lines
            .next()
            .and_then(|l| l.strip_prefix("port: "))
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| malformed(format!("bad host record {text:?}")))?;
        Ok((host.to_string(), port))
    }

    /// Download `part_name` from `replica`, commit it locally, and publish
    /// the coordinator nodes, removing any parts the download obsoleted.
    async fn fetch_part(&self, part_name: &str, replica: &str) -> ReplicationResult<()> {
        debug!(part = part_name, from = replica, "Fetching part");

        let _structure_guard = self.structure_lock.read().await;

        let peer_path = format!("{}/replicas/{replica}", self.table_path);
        let (data, _) = self.coordinator.get(&format!("{peer_path}/host")).await?;
        let (host, port) = Self::parse_host(&format!("{peer_path}/host"), &data)?;

        // Short transport blips (the peer restarting, a dropped connection)
        // are retried in place; anything that survives the policy re-queues
        // the entry.
        let part = (|| async {
            self.fetcher
                .fetch_part(part_name, &peer_path, &host, port)
                .await
        })
        .retry(retry::fetch_policy())
        .when(|e| matches!(e, ReplicationError::FetchFailed { .. }))
        .await?;
        let checksums = part.checksums.clone();
        let removed_parts = self.store.rename_temp_part_and_replace(part).await?;

        let mut ops = vec![
            Op::create(self.part_node(part_name), b"".to_vec()),
            Op::create(format!("{}/checksums", self.part_node(part_name)), checksums.to_vec()),
        ];
        for removed in &removed_parts {
            debug!(
                obsolete = %removed.name(),
                by = part_name,
                "Part is rendered obsolete by fetched part"
            );
            metrics::OBSOLETE_PARTS.inc();
            ops.push(Op::remove(format!("{}/checksums", self.part_node(&removed.name()))));
            ops.push(Op::remove(self.part_node(&removed.name())));
        }
        self.coordinator.multi(ops).await?;

        metrics::PART_FETCHES.inc();
        debug!(part = part_name, "Fetched part");
        Ok(())
    }

    /// Execute a merge whose inputs are all committed locally.
    async fn merge_locally(
        &self,
        entry: &LogEntry,
        parts: Vec<PartInfo>,
    ) -> ReplicationResult<()> {
        let merged = self.store.merge_parts(&parts, &entry.new_part_name).await?;

        let mut ops = vec![
            Op::create(self.part_node(&entry.new_part_name), b"".to_vec()),
            Op::create(
                format!("{}/checksums", self.part_node(&entry.new_part_name)),
                merged.checksums.to_vec(),
            ),
        ];
        for part in &parts {
            ops.push(Op::remove(format!("{}/checksums", self.part_node(&part.name()))));
            ops.push(Op::remove(self.part_node(&part.name())));
        }
        self.coordinator.multi(ops).await?;

        self.store.clear_old_parts().await?;
        metrics::PART_MERGES.inc();
        Ok(())
    }

    /// Execute one entry. A no-op when the target (or a part covering it) is
    /// already committed both locally and in the coordinator.
    pub async fn execute_log_entry(&self, entry: &LogEntry) -> Result<(), ExecutionFailure> {
        let containing = self
            .store
            .get_containing_part(&entry.new_part_name)
            .await
            .map_err(ExecutionFailure::local)?;
        if let Some(containing) = containing {
            if self
                .coordinator
                .exists(&self.part_node(&containing.name()))
                .await
                .map_err(|e| ExecutionFailure::local(e.into()))?
            {
                if !(entry.kind == EntryKind::GetPart && entry.source_replica == self.replica_name)
                {
                    debug!(part = %entry.new_part_name, "Skipping action - part already exists");
                }
                return Ok(());
            }
        }

        if entry.kind == EntryKind::GetPart && entry.source_replica == self.replica_name {
            // Our own log says we wrote this part, yet it is gone locally.
            error!(part = %entry.new_part_name, "Part from own log doesn't exist. This is a bug.");
            return Ok(());
        }

        let fallback_fetch = match entry.kind {
            EntryKind::GetPart => true,
            EntryKind::MergeParts => {
                let mut parts = Vec::with_capacity(entry.parts_to_merge.len());
                let mut have_all_parts = true;
                for name in &entry.parts_to_merge {
                    match self
                        .store
                        .get_containing_part(name)
                        .await
                        .map_err(ExecutionFailure::local)?
                    {
                        None => {
                            have_all_parts = false;
                            break;
                        }
                        Some(part) if part.name() != *name => {
                            error!(
                                input = %name,
                                covered_by = %part.name(),
                                target = %entry.new_part_name,
                                "Log and parts set look inconsistent"
                            );
                            have_all_parts = false;
                            break;
                        }
                        Some(part) => parts.push(part),
                    }
                }
                if have_all_parts {
                    self.merge_locally(entry, parts)
                        .await
                        .map_err(ExecutionFailure::local)?;
                    false
                } else {
                    debug!(
                        part = %entry.new_part_name,
                        "Don't have all parts for merge; will try to fetch it instead"
                    );
                    true
                }
            }
        };

        if fallback_fetch {
            let replica = self
                .find_active_replica_having_part(&entry.new_part_name)
                .await
                .map_err(ExecutionFailure::fetch)?;
            self.fetch_part(&entry.new_part_name, &replica)
                .await
                .map_err(ExecutionFailure::fetch)?;
            if entry.kind == EntryKind::MergeParts {
                metrics::MERGED_PART_FETCHES.inc();
            }
        }
        Ok(())
    }

    /// One worker cycle: claim the earliest executable entry, run it, and
    /// either retire its queue node or send it back to the tail.
    pub async fn process_one(&self, shutdown: &AtomicBool) -> WorkOutcome {
        let Some(claimed) = self.queue.claim_next_executable() else {
            return WorkOutcome::Idle;
        };

        let result = self.execute_log_entry(&claimed.entry).await;
        metrics::QUEUE_SIZE.set(self.queue.len() as i64);

        if shutdown.load(Ordering::SeqCst) && result.is_err() {
            // Tear-down races are not worth re-queueing; the coordinator
            // queue node survives and is reloaded on next start.
            return WorkOutcome::ShuttingDown;
        }

        match result {
            Ok(()) => {
                let znode_path = format!("{}/queue/{}", self.replica_path, claimed.entry.znode_name);
                match self.coordinator.try_remove(&znode_path).await {
                    Ok(RemoveOutcome::Removed) => {}
                    Ok(RemoveOutcome::NoNode) => {
                        error!(
                            path = %znode_path,
                            "Couldn't remove queue node: no node. There must be a bug somewhere. Ignoring it."
                        );
                    }
                    Err(e) => {
                        error!(
                            path = %znode_path,
                            error = %e,
                            "Couldn't remove queue node. There must be a bug somewhere. Ignoring it."
                        );
                    }
                }
                drop(claimed);
                WorkOutcome::Done
            }
            Err(failure) => {
                if failure.error.is_transient_absence() {
                    // Nobody has the part yet; expected while the source
                    // replica is still writing or announcing it.
                    info!(error = %failure.error, "Entry postponed");
                } else {
                    warn!(
                        part = %claimed.entry.new_part_name,
                        error = %failure.error,
                        "Failed to execute queue entry; re-queueing"
                    );
                }

                if failure.during_fetch
                    && self
                        .queue
                        .defer_inputs_of_merge_containing(&claimed.entry.new_part_name)
                {
                    debug!(
                        part = %claimed.entry.new_part_name,
                        "Deferred sibling fetches behind their merge"
                    );
                }
                self.queue.requeue_tail(claimed);
                WorkOutcome::Failed
            }
        }
    }

    /// The worker loop.
    pub async fn run(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::SeqCst) {
            match self.process_one(&shutdown).await {
                WorkOutcome::Idle => tokio::time::sleep(QUEUE_NO_WORK_SLEEP).await,
                WorkOutcome::Done => {
                    if !QUEUE_AFTER_WORK_SLEEP.is_zero() {
                        tokio::time::sleep(QUEUE_AFTER_WORK_SLEEP).await;
                    }
                }
                WorkOutcome::Failed => tokio::time::sleep(QUEUE_ERROR_SLEEP).await,
                WorkOutcome::ShuttingDown => break,
            }
        }
    }
}

/// Result of one worker cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// No executable entry was queued.
    Idle,
    /// An entry executed and its queue node was retired.
    Done,
    /// An entry failed and went back to the queue tail.
    Failed,
    /// Shutdown raced an in-flight entry; the loop should exit.
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::coordinator::CreateMode;
    use crate::replication::memory::InMemoryEnsemble;
    use crate::replication::store::{InMemoryPartFetcher, InMemoryPartStore};

    struct Fixture {
        executor: Arc<QueueExecutor>,
        store: Arc<InMemoryPartStore>,
        zk: Arc<dyn Coordinator>,
    }

    async fn fixture(replica: &str) -> Fixture {
        let ensemble = InMemoryEnsemble::new();
        let zk: Arc<dyn Coordinator> = ensemble.session();
        for path in [
            format!("/t/replicas/{replica}/parts"),
            format!("/t/replicas/{replica}/queue"),
        ] {
            zk.create(&path, b"", CreateMode::Persistent).await.unwrap();
        }
        let store = InMemoryPartStore::new();
        let store_dyn: Arc<dyn PartStore> = store.clone();
        let fetcher: Arc<dyn PartFetcher> = InMemoryPartFetcher::new();
        let queue = Arc::new(ReplicationQueue::new());
        let executor = Arc::new(QueueExecutor::new(
            Arc::clone(&zk),
            store_dyn,
            fetcher,
            queue,
            Arc::new(RwLock::new(())),
            "/t",
            format!("/t/replicas/{replica}"),
            replica,
        ));
        Fixture {
            executor,
            store,
            zk,
        }
    }

    #[tokio::test]
    async fn merge_with_all_inputs_runs_locally() {
        let f = fixture("r1").await;
        for name in ["20210101_0_0_0", "20210101_1_1_0"] {
            f.store.seed_part(name);
            f.zk
                .create(&format!("/t/replicas/r1/parts/{name}"), b"", CreateMode::Persistent)
                .await
                .unwrap();
            f.zk
                .create(
                    &format!("/t/replicas/r1/parts/{name}/checksums"),
                    b"c",
                    CreateMode::Persistent,
                )
                .await
                .unwrap();
        }

        let entry = LogEntry::merge_parts(
            "r1",
            vec!["20210101_0_0_0".to_string(), "20210101_1_1_0".to_string()],
            "20210101_0_1_1",
        );
        f.executor.execute_log_entry(&entry).await.unwrap();

        assert_eq!(f.store.part_names(), vec!["20210101_0_1_1".to_string()]);
        assert!(f.zk.exists("/t/replicas/r1/parts/20210101_0_1_1").await.unwrap());
        assert!(
            f.zk.exists("/t/replicas/r1/parts/20210101_0_1_1/checksums")
                .await
                .unwrap()
        );
        assert!(!f.zk.exists("/t/replicas/r1/parts/20210101_0_0_0").await.unwrap());
        assert!(!f.zk.exists("/t/replicas/r1/parts/20210101_1_1_0").await.unwrap());
    }

    #[tokio::test]
    async fn already_present_part_is_a_noop() {
        let f = fixture("r1").await;
        f.store.seed_part("20210101_0_1_1");
        f.zk
            .create(
                "/t/replicas/r1/parts/20210101_0_1_1",
                b"",
                CreateMode::Persistent,
            )
            .await
            .unwrap();

        // A merge targeting an already-covered part does nothing.
        let entry = LogEntry::merge_parts(
            "r2",
            vec!["20210101_0_0_0".to_string(), "20210101_1_1_0".to_string()],
            "20210101_0_1_1",
        );
        f.executor.execute_log_entry(&entry).await.unwrap();
        assert_eq!(f.store.part_names(), vec!["20210101_0_1_1".to_string()]);
    }

    #[tokio::test]
    async fn own_missing_part_logs_bug_and_succeeds() {
        let f = fixture("r1").await;
        let entry = LogEntry::get_part("r1", "20210101_0_0_0");
        f.executor.execute_log_entry(&entry).await.unwrap();
        assert!(f.store.part_names().is_empty());
    }

    #[tokio::test]
    async fn get_from_peer_with_nobody_active_is_transient() {
        let f = fixture("r1").await;
        let entry = LogEntry::get_part("r2", "20210101_0_0_0");
        let failure = f.executor.execute_log_entry(&entry).await.unwrap_err();
        assert!(failure.during_fetch);
        assert!(failure.error.is_transient_absence());
    }

    #[tokio::test]
    async fn host_record_parses_strictly() {
        let ok = QueueExecutor::parse_host("/p", b"host: box1\nport: 9009\n").unwrap();
        assert_eq!(ok, ("box1".to_string(), 9009));
        assert!(QueueExecutor::parse_host("/p", b"host box1\nport: 9009\n").is_err());
        assert!(QueueExecutor::parse_host("/p", b"host: box1\n").is_err());
        assert!(QueueExecutor::parse_host("/p", b"host: box1\nport: x\n").is_err());
    }
}
