//! The replicated table: bootstrap, background loops, lifecycle.
//!
//! [`ReplicatedTable::open`] either creates the coordinator structure for a
//! brand-new table, adds a fresh replica to an existing (empty) one, or
//! re-attaches an existing replica after a restart: verifying on every path
//! that the coordinator's notion of the table matches the local one before a
//! single background loop starts.
//!
//! Once open, a replica runs:
//!
//! - one log puller (fan-in of peer logs into the queue)
//! - `replication_threads` queue workers
//! - the election watcher, which starts the merge selector on becoming leader

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use backon::Retryable;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::constants::IGNORED_PART_PREFIX;

use super::background_tasks::BackgroundTaskRegistry;
use super::block_lock::BlockLock;
use super::config::ReplicaConfig;
use super::coordinator::{Coordinator, CreateMode, Op};
use super::error::{CoordinatorError, ReplicationError, ReplicationResult};
use super::executor::QueueExecutor;
use super::leader::LeaderElection;
use super::log_entry::LogEntry;
use super::log_puller::LogPuller;
use super::merge_selector::{MergePolicy, MergeSelector};
use super::metadata::TableMetadata;
use super::metrics;
use super::queue::ReplicationQueue;
use super::retry;
use super::store::{PartFetcher, PartStore};

/// Registration of the inter-server part endpoint.
///
/// The part service itself is external; the holder pins the registration for
/// the replica's lifetime and must be released before shutdown completes, so
/// peers stop being routed to a replica that is going away.
#[derive(Debug)]
struct EndpointHolder {
    name: String,
}

impl EndpointHolder {
    fn register(name: String) -> Self {
        debug!(endpoint = %name, "Registered inter-server endpoint");
        EndpointHolder { name }
    }
}

impl Drop for EndpointHolder {
    fn drop(&mut self) {
        debug!(endpoint = %self.name, "Released inter-server endpoint");
    }
}

/// One replica of a replicated merge-tree table.
pub struct ReplicatedTable {
    config: ReplicaConfig,
    replica_path: String,
    coordinator: Arc<dyn Coordinator>,
    store: Arc<dyn PartStore>,
    queue: Arc<ReplicationQueue>,
    puller: Arc<LogPuller>,
    election: Arc<LeaderElection>,
    shutdown_called: Arc<AtomicBool>,
    tasks: tokio::sync::Mutex<BackgroundTaskRegistry>,
    endpoint: std::sync::Mutex<Option<EndpointHolder>>,
}

impl std::fmt::Debug for ReplicatedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedTable")
            .field("replica_path", &self.replica_path)
            .finish_non_exhaustive()
    }
}

impl ReplicatedTable {
    /// Open this replica: create or verify the coordinator structure,
    /// reconcile parts, reload the queue, mark the replica active, and start
    /// the background loops.
    pub async fn open(
        config: ReplicaConfig,
        metadata: TableMetadata,
        coordinator: Arc<dyn Coordinator>,
        store: Arc<dyn PartStore>,
        fetcher: Arc<dyn PartFetcher>,
        policy: Arc<dyn MergePolicy>,
    ) -> ReplicationResult<Arc<ReplicatedTable>> {
        config.validate()?;
        let replica_path = config.replica_path();

        if !config.attach {
            if !coordinator.exists(&config.table_path).await? {
                Self::create_table(&coordinator, &config, &metadata).await?;
            }
            if !Self::is_table_empty(&coordinator, &config.table_path).await? {
                return Err(ReplicationError::AddingReplicaToNonEmptyTable {
                    table_path: config.table_path.clone(),
                });
            }
            Self::check_table_structure(&coordinator, &config.table_path, &metadata).await?;
            Self::create_replica(&coordinator, &replica_path).await?;
        } else {
            Self::check_table_structure(&coordinator, &config.table_path, &metadata).await?;
            Self::check_parts(&coordinator, &store, &replica_path).await?;
        }

        let queue = Arc::new(ReplicationQueue::new());
        Self::load_queue(&coordinator, &queue, &replica_path).await?;
        Self::activate_replica(&coordinator, &config, &replica_path).await?;

        let structure_lock = Arc::new(RwLock::new(()));
        let puller = Arc::new(LogPuller::new(
            Arc::clone(&coordinator),
            config.table_path.clone(),
            replica_path.clone(),
            Arc::clone(&queue),
        ));
        let executor = Arc::new(QueueExecutor::new(
            Arc::clone(&coordinator),
            Arc::clone(&store),
            fetcher,
            Arc::clone(&queue),
            structure_lock,
            config.table_path.clone(),
            replica_path.clone(),
            config.replica_name.clone(),
        ));
        let selector = Arc::new(MergeSelector::new(
            Arc::clone(&coordinator),
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&puller),
            policy,
            config.table_path.clone(),
            replica_path.clone(),
            config.replica_name.clone(),
            config.merging_threads,
            metadata.index_granularity,
        ));
        let election = Arc::new(LeaderElection::new(
            Arc::clone(&coordinator),
            &config.table_path,
            config.replica_name.clone(),
        ));
        election.join().await?;

        let shutdown_called = Arc::new(AtomicBool::new(false));
        let mut tasks = BackgroundTaskRegistry::new();
        tasks.spawn(
            "log-puller",
            Arc::clone(&puller).run(Arc::clone(&shutdown_called)),
        );
        for i in 0..config.replication_threads {
            tasks.spawn(
                format!("queue-worker-{i}"),
                Arc::clone(&executor).run(Arc::clone(&shutdown_called)),
            );
        }
        tasks.spawn(
            "leader-election",
            Arc::clone(&election).run(Arc::clone(&shutdown_called), selector),
        );

        let endpoint = EndpointHolder::register(config.endpoint_name());
        info!(
            replica = %config.replica_name,
            table = %config.table_path,
            "Replica active"
        );

        Ok(Arc::new(ReplicatedTable {
            config,
            replica_path,
            coordinator,
            store,
            queue,
            puller,
            election,
            shutdown_called,
            tasks: tokio::sync::Mutex::new(tasks),
            endpoint: std::sync::Mutex::new(Some(endpoint)),
        }))
    }

    // =========================================================================
    // Bootstrap
    // =========================================================================

    async fn create_table(
        coordinator: &Arc<dyn Coordinator>,
        config: &ReplicaConfig,
        metadata: &TableMetadata,
    ) -> ReplicationResult<()> {
        info!(table = %config.table_path, "Creating table structure");
        let root = &config.table_path;
        coordinator.create(root, b"", CreateMode::Persistent).await?;
        coordinator
            .create(
                &format!("{root}/metadata"),
                metadata.to_text().as_bytes(),
                CreateMode::Persistent,
            )
            .await?;
        for child in ["replicas", "blocks", "block_numbers", "leader_election", "temp"] {
            coordinator
                .create(&format!("{root}/{child}"), b"", CreateMode::Persistent)
                .await?;
        }
        Ok(())
    }

    async fn is_table_empty(
        coordinator: &Arc<dyn Coordinator>,
        table_path: &str,
    ) -> ReplicationResult<bool> {
        let replicas = coordinator.children(&format!("{table_path}/replicas")).await?;
        for replica in replicas {
            let parts = coordinator
                .children(&format!("{table_path}/replicas/{replica}/parts"))
                .await?;
            if !parts.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn check_table_structure(
        coordinator: &Arc<dyn Coordinator>,
        table_path: &str,
        metadata: &TableMetadata,
    ) -> ReplicationResult<()> {
        let (stored, _) = coordinator.get(&format!("{table_path}/metadata")).await?;
        let stored = String::from_utf8(stored).map_err(|_| ReplicationError::MetadataMismatch {
            detail: "stored metadata is not UTF-8".to_string(),
        })?;
        metadata.check_equals(&stored)
    }

    async fn create_replica(
        coordinator: &Arc<dyn Coordinator>,
        replica_path: &str,
    ) -> ReplicationResult<()> {
        coordinator.create(replica_path, b"", CreateMode::Persistent).await?;
        for child in ["host", "log", "log_pointers", "queue", "parts"] {
            coordinator
                .create(&format!("{replica_path}/{child}"), b"", CreateMode::Persistent)
                .await?;
        }
        Ok(())
    }

    /// Reconcile the coordinator's part list for this replica against the
    /// local store.
    async fn check_parts(
        coordinator: &Arc<dyn Coordinator>,
        store: &Arc<dyn PartStore>,
        replica_path: &str,
    ) -> ReplicationResult<()> {
        let mut expected: std::collections::HashSet<String> = coordinator
            .children(&format!("{replica_path}/parts"))
            .await?
            .into_iter()
            .collect();

        let mut unexpected = Vec::new();
        for part in store.get_data_parts().await? {
            let name = part.name();
            if !expected.remove(&name) {
                unexpected.push(name);
            }
        }

        if !expected.is_empty() {
            let example = expected.iter().next().cloned().unwrap_or_default();
            return Err(ReplicationError::NotFoundExpectedDataPart {
                count: expected.len(),
                example,
            });
        }
        if unexpected.len() > 1 {
            return Err(ReplicationError::TooManyUnexpectedDataParts {
                example: unexpected[0].clone(),
            });
        }
        for name in unexpected {
            error!(part = %name, "Unexpected part. Renaming it to {IGNORED_PART_PREFIX}{name}");
            store
                .rename_and_detach_part(&name, IGNORED_PART_PREFIX)
                .await?;
        }
        Ok(())
    }

    /// Reload the queue from the coordinator after a restart, in queue-node
    /// order.
    ///
    /// Merge inputs are re-registered as currently merging; target parts are
    /// *not* pre-registered as future parts: a worker registers its target
    /// only when it claims the entry. Between restart and the first claims,
    /// two workers can therefore claim entries feeding the same downstream
    /// merge; the merge simply waits for both and nothing diverges.
    async fn load_queue(
        coordinator: &Arc<dyn Coordinator>,
        queue: &Arc<ReplicationQueue>,
        replica_path: &str,
    ) -> ReplicationResult<()> {
        let mut children = coordinator.children(&format!("{replica_path}/queue")).await?;
        children.sort();
        for child in children {
            let (data, _) = coordinator
                .get(&format!("{replica_path}/queue/{child}"))
                .await?;
            let text = String::from_utf8(data).map_err(|_| ReplicationError::MalformedNode {
                path: format!("{replica_path}/queue/{child}"),
                detail: "queue record is not UTF-8".to_string(),
            })?;
            let mut entry = LogEntry::parse(&text)?;
            entry.znode_name = child;
            queue.append(entry);
        }
        metrics::QUEUE_SIZE.set(queue.len() as i64);
        Ok(())
    }

    /// Announce this replica as active and publish its endpoint, atomically.
    async fn activate_replica(
        coordinator: &Arc<dyn Coordinator>,
        config: &ReplicaConfig,
        replica_path: &str,
    ) -> ReplicationResult<()> {
        let host_text = format!("host: {}\nport: {}\n", config.host, config.port);
        let ops = vec![
            Op::create_mode(
                format!("{replica_path}/is_active"),
                b"".to_vec(),
                CreateMode::Ephemeral,
            ),
            Op::set_data(format!("{replica_path}/host"), host_text.as_bytes().to_vec()),
        ];
        match coordinator.multi(ops).await {
            Ok(_) => Ok(()),
            Err(e @ CoordinatorError::MultiFailed { failed_op: 0, .. }) => {
                // Distinguish "someone else is active" from a plain
                // coordinator failure.
                if coordinator
                    .exists(&format!("{replica_path}/is_active"))
                    .await
                    .unwrap_or(false)
                {
                    Err(ReplicationError::ReplicaIsAlreadyActive {
                        replica_path: replica_path.to_string(),
                    })
                } else {
                    Err(e.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Public surface
    // =========================================================================

    /// Allocate the block number for an insert. The write path names the new
    /// part after the returned number, writes it locally, and hands the lock
    /// back to [`commit_part`](Self::commit_part); giving up instead leaves
    /// the number to read as abandoned.
    pub async fn allocate_block_number(&self) -> ReplicationResult<BlockLock> {
        Ok(BlockLock::acquire(&self.coordinator, &self.config.table_path).await?)
    }

    /// Announce a freshly written local part: publish its coordinator nodes,
    /// append a `GET_PART` record to our log, and release the insert's block
    /// lock, all in one atomic multi. The write path calls this after the
    /// store has committed the part named for `block_lock`'s number.
    ///
    /// On failure the lock's session marker is dropped, so the allocated
    /// number reads as abandoned and the leader can merge across it.
    pub async fn commit_part(
        &self,
        part_name: &str,
        block_lock: BlockLock,
    ) -> ReplicationResult<()> {
        let checksums = self.store.checksums_of(part_name).await?;
        let entry = LogEntry::get_part(&self.config.replica_name, part_name);
        let mut ops = vec![
            Op::create(format!("{}/parts/{part_name}", self.replica_path), b"".to_vec()),
            Op::create(
                format!("{}/parts/{part_name}/checksums", self.replica_path),
                checksums.to_vec(),
            ),
            Op::create_mode(
                format!("{}/log/log-", self.replica_path),
                entry.to_text().as_bytes().to_vec(),
                CreateMode::PersistentSequential,
            ),
        ];
        ops.extend(block_lock.unlock_ops());

        let result = (|| async { self.coordinator.multi(ops.clone()).await })
            .retry(retry::coordinator_policy())
            .when(|e| {
                matches!(
                    e,
                    CoordinatorError::SessionExpired | CoordinatorError::Other(_)
                )
            })
            .await;
        match result {
            Ok(_) => {
                debug!(part = part_name, block = block_lock.number, "Committed part");
                Ok(())
            }
            Err(e) => {
                if let Err(abandon_err) = block_lock.abandon(&self.coordinator).await {
                    debug!(error = %abandon_err, "Failed to abandon block lock");
                }
                Err(e.into())
            }
        }
    }

    /// One synchronous fan-in pass, for callers that cannot wait for the
    /// puller's next tick.
    pub async fn pull_logs_to_queue(&self) -> ReplicationResult<usize> {
        self.puller.pull_logs_to_queue().await
    }

    /// Entries currently queued.
    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    /// Whether this replica currently leads merge selection.
    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    /// This replica's name.
    pub fn replica_name(&self) -> &str {
        &self.config.replica_name
    }

    /// Health of the background loops, by task name.
    pub async fn health_check(&self) -> Vec<(String, super::background_tasks::TaskStatus)> {
        self.tasks.lock().await.health_check()
    }

    /// Graceful shutdown: leave the election, deactivate, release the
    /// endpoint, and join every background loop. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown_called.swap(true, Ordering::SeqCst) {
            return;
        }
        self.election.resign().await;
        if let Err(e) = self
            .coordinator
            .try_remove(&format!("{}/is_active", self.replica_path))
            .await
        {
            debug!(error = %e, "Failed to remove is_active during shutdown");
        }
        self.endpoint.lock().unwrap().take();

        debug!("Waiting for background tasks to finish");
        self.tasks.lock().await.shutdown_all().await;
        debug!("Background tasks finished");
    }

    /// Whether [`shutdown`](Self::shutdown) has completed or begun.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown_called.load(Ordering::SeqCst)
    }

    /// Drop this replica from the table; the last replica to leave removes
    /// the whole table subtree.
    pub async fn drop_table(&self) -> ReplicationResult<()> {
        self.shutdown().await;
        self.coordinator.remove_recursive(&self.replica_path).await?;
        let replicas = self
            .coordinator
            .children(&format!("{}/replicas", self.config.table_path))
            .await?;
        if replicas.is_empty() {
            self.coordinator
                .remove_recursive(&self.config.table_path)
                .await?;
        }
        Ok(())
    }
}

impl Drop for ReplicatedTable {
    fn drop(&mut self) {
        // An async shutdown cannot run here; the session drop will still
        // release the ephemerals, and queue nodes are reloaded on restart.
        if !self.shutdown_called.load(Ordering::SeqCst) {
            tracing::warn!(
                replica = %self.config.replica_name,
                "ReplicatedTable dropped without shutdown; background tasks are detached"
            );
        }
    }
}
