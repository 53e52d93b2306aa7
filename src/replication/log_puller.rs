//! Log fan-in: copy peer replicas' log records into the local queue.
//!
//! Every replica, including the one that produced a record, consumes the
//! cluster's logs through this path, so every queue sees the same actions.
//! Records are interleaved by their `czxid` (the coordinator's creation
//! transaction id), giving all replicas a consistent notion of "earlier"
//! without trusting any wall clock.
//!
//! Pointer advancement and queue insertion happen in one atomic multi, so a
//! crash between them cannot drop or duplicate a record: either the pointer
//! still names the record (re-pulled next iteration) or the queue node
//! already holds it (reloaded by `load_queue` on restart).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::constants::{LOG_NODE_PREFIX, QUEUE_UPDATE_SLEEP, SEQUENTIAL_SUFFIX_WIDTH};

use super::coordinator::{Coordinator, CreateMode, Op, node_name};
use super::error::{ReplicationError, ReplicationResult};
use super::log_entry::LogEntry;
use super::metrics;
use super::queue::ReplicationQueue;

/// A peer log position with the record found there.
#[derive(Debug, PartialEq, Eq)]
struct LogCursor {
    czxid: i64,
    replica: String,
    index: u64,
    entry_text: String,
}

impl Ord for LogCursor {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // czxid is the real key; the rest only makes the order total.
        (self.czxid, &self.replica, self.index).cmp(&(other.czxid, &other.replica, other.index))
    }
}

impl PartialOrd for LogCursor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Pulls peer logs into this replica's queue.
pub struct LogPuller {
    coordinator: Arc<dyn Coordinator>,
    table_path: String,
    replica_path: String,
    queue: Arc<ReplicationQueue>,
}

impl LogPuller {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        table_path: impl Into<String>,
        replica_path: impl Into<String>,
        queue: Arc<ReplicationQueue>,
    ) -> Self {
        LogPuller {
            coordinator,
            table_path: table_path.into(),
            replica_path: replica_path.into(),
            queue,
        }
    }

    fn log_node_path(&self, replica: &str, index: u64) -> String {
        format!(
            "{}/replicas/{replica}/log/{LOG_NODE_PREFIX}{index:0width$}",
            self.table_path,
            width = SEQUENTIAL_SUFFIX_WIDTH
        )
    }

    async fn read_log_entry(&self, replica: &str, index: u64) -> ReplicationResult<Option<LogCursor>> {
        let path = self.log_node_path(replica, index);
        let Some((data, stat)) = self.coordinator.try_get(&path).await? else {
            return Ok(None);
        };
        let entry_text = String::from_utf8(data).map_err(|_| ReplicationError::MalformedNode {
            path,
            detail: "log record is not UTF-8".to_string(),
        })?;
        Ok(Some(LogCursor {
            czxid: stat.czxid,
            replica: replica.to_string(),
            index,
            entry_text,
        }))
    }

    /// Read this replica's pointer into `replica`'s log, seeding it to the
    /// lowest existing record (or 0) if absent.
    async fn log_pointer(&self, replica: &str) -> ReplicationResult<u64> {
        let pointer_path = format!("{}/log_pointers/{replica}", self.replica_path);
        if let Some((data, _)) = self.coordinator.try_get(&pointer_path).await? {
            let text = String::from_utf8_lossy(&data);
            return text.trim().parse().map_err(|_| ReplicationError::MalformedNode {
                path: pointer_path,
                detail: format!("bad log pointer {text:?}"),
            });
        }

        let log_path = format!("{}/replicas/{replica}/log", self.table_path);
        let mut entries = self.coordinator.children(&log_path).await?;
        entries.sort();
        let index = match entries.first() {
            Some(name) => name
                .strip_prefix(LOG_NODE_PREFIX)
                .and_then(|suffix| suffix.parse().ok())
                .ok_or_else(|| ReplicationError::MalformedNode {
                    path: format!("{log_path}/{name}"),
                    detail: "unexpected log node name".to_string(),
                })?,
            None => 0,
        };
        self.coordinator
            .create(&pointer_path, index.to_string().as_bytes(), CreateMode::Persistent)
            .await?;
        Ok(index)
    }

    /// One fan-in iteration: drain every peer's unconsumed records into the
    /// queue in czxid order. Returns the number of entries pulled.
    pub async fn pull_logs_to_queue(&self) -> ReplicationResult<usize> {
        let replicas = self
            .coordinator
            .children(&format!("{}/replicas", self.table_path))
            .await?;

        let mut cursors = BinaryHeap::new();
        for replica in &replicas {
            let index = self.log_pointer(replica).await?;
            if let Some(cursor) = self.read_log_entry(replica, index).await? {
                cursors.push(Reverse(cursor));
            }
        }

        let mut count = 0usize;
        while let Some(Reverse(cursor)) = cursors.pop() {
            let mut entry = LogEntry::parse(&cursor.entry_text)?;

            // Insert into the coordinator queue and advance the pointer in
            // one atomic step.
            let results = self
                .coordinator
                .multi(vec![
                    Op::create_mode(
                        format!("{}/queue/queue-", self.replica_path),
                        cursor.entry_text.as_bytes(),
                        CreateMode::PersistentSequential,
                    ),
                    Op::set_data(
                        format!("{}/log_pointers/{}", self.replica_path, cursor.replica),
                        (cursor.index + 1).to_string().as_bytes(),
                    ),
                ])
                .await?;
            let created = results[0].created_path().ok_or_else(|| {
                ReplicationError::MalformedNode {
                    path: format!("{}/queue", self.replica_path),
                    detail: "multi did not report the created queue node".to_string(),
                }
            })?;
            entry.znode_name = node_name(created).to_string();
            self.queue.append(entry);

            count += 1;
            metrics::LOG_ENTRIES_PULLED.inc();

            if let Some(next) = self.read_log_entry(&cursor.replica, cursor.index + 1).await? {
                cursors.push(Reverse(next));
            }
        }

        metrics::QUEUE_SIZE.set(self.queue.len() as i64);
        if count > 0 {
            debug!(count, "Pulled entries to queue");
        }
        Ok(count)
    }

    /// The fan-in loop: pull, sleep, repeat until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.pull_logs_to_queue().await {
                warn!(error = %e, "Log pull failed; will retry");
            }
            tokio::time::sleep(QUEUE_UPDATE_SLEEP).await;
        }
    }
}
