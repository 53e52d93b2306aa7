//! Leader-only merge selection.
//!
//! The elected leader periodically picks sets of adjacent small parts and
//! publishes `MERGE_PARTS` records to *its own* log. It never assigns work to
//! a follower: every replica pulls the record through the normal fan-in and
//! decides for itself whether to merge locally or fetch the merged part.
//!
//! Selection is bounded two ways:
//!
//! - at most `merging_threads` merges may sit in the queue at once
//! - while a big merge is in flight, only small merges are proposed, so one
//!   long merge cannot starve the turnover of fresh small parts
//!
//! A pair of adjacent parts may only be merged across a numeric gap when
//! every block number in the gap carries an abandoned lock: a live lock means
//! an insert still in flight that may yet fill the gap with a part.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::constants::{BIG_MERGE_THRESHOLD_BYTES, MERGE_SELECTING_SLEEP};

use super::block_lock::{self, BlockLockState, block_number_path};
use super::coordinator::{Coordinator, CreateMode};
use super::error::ReplicationResult;
use super::log_entry::LogEntry;
use super::log_puller::LogPuller;
use super::part::PartInfo;
use super::queue::ReplicationQueue;
use super::store::PartStore;

/// Chooses which adjacent parts to merge.
///
/// `parts` is the committed part list sorted by `(partition, left)`;
/// `allowed[i]` says whether `parts[i]` and `parts[i + 1]` may be merged
/// across (same partition, neither already merging, gap fully abandoned).
/// `only_small` is set while a big merge is in flight.
pub trait MergePolicy: Send + Sync {
    fn select_parts_to_merge(
        &self,
        parts: &[PartInfo],
        allowed: &[bool],
        aggressive: bool,
        only_small: bool,
    ) -> Option<Vec<PartInfo>>;
}

/// Default policy: take the longest allowed run of adjacent parts.
///
/// The non-aggressive pass wants at least `min_parts` inputs so merges pay
/// for themselves; the aggressive pass settles for any pair. `only_small`
/// caps the run's combined byte size under the big-merge threshold.
#[derive(Debug, Clone)]
pub struct SimpleMergePolicy {
    /// Minimum run length for a non-aggressive merge.
    pub min_parts: usize,
    /// Maximum parts folded into one merge.
    pub max_parts: usize,
    /// Bytes per granule, for sizing runs against the big-merge threshold.
    pub index_granularity: u64,
}

impl Default for SimpleMergePolicy {
    fn default() -> Self {
        SimpleMergePolicy {
            min_parts: 3,
            max_parts: 10,
            index_granularity: 8192,
        }
    }
}

impl MergePolicy for SimpleMergePolicy {
    fn select_parts_to_merge(
        &self,
        parts: &[PartInfo],
        allowed: &[bool],
        aggressive: bool,
        only_small: bool,
    ) -> Option<Vec<PartInfo>> {
        let min_len = if aggressive { 2 } else { self.min_parts };
        let mut best: Option<&[PartInfo]> = None;

        let mut run_start = 0;
        for i in 0..parts.len() {
            let run_broken = i + 1 >= parts.len() || !allowed.get(i).copied().unwrap_or(false);
            if run_broken {
                let run = &parts[run_start..=i];
                run_start = i + 1;
                let run = &run[..run.len().min(self.max_parts)];
                if run.len() < min_len {
                    continue;
                }
                let bytes: u64 = run.iter().map(|p| p.size * self.index_granularity).sum();
                if only_small && bytes > BIG_MERGE_THRESHOLD_BYTES {
                    continue;
                }
                if best.map_or(true, |b| run.len() > b.len()) {
                    best = Some(run);
                }
            }
        }
        best.map(|run| run.to_vec())
    }
}

/// The leader's selection loop.
pub struct MergeSelector {
    coordinator: Arc<dyn Coordinator>,
    store: Arc<dyn PartStore>,
    queue: Arc<ReplicationQueue>,
    puller: Arc<LogPuller>,
    policy: Arc<dyn MergePolicy>,
    table_path: String,
    replica_path: String,
    replica_name: String,
    merging_threads: usize,
    index_granularity: u64,
}

impl MergeSelector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        store: Arc<dyn PartStore>,
        queue: Arc<ReplicationQueue>,
        puller: Arc<LogPuller>,
        policy: Arc<dyn MergePolicy>,
        table_path: impl Into<String>,
        replica_path: impl Into<String>,
        replica_name: impl Into<String>,
        merging_threads: usize,
        index_granularity: u64,
    ) -> Self {
        MergeSelector {
            coordinator,
            store,
            queue,
            puller,
            policy,
            table_path: table_path.into(),
            replica_path: replica_path.into(),
            replica_name: replica_name.into(),
            merging_threads,
            index_granularity,
        }
    }

    /// Whether `left` and `right` (adjacent in range order) may be merged
    /// across.
    pub async fn can_merge_parts(&self, left: &PartInfo, right: &PartInfo) -> ReplicationResult<bool> {
        if left.partition != right.partition {
            return Ok(false);
        }
        if self.queue.is_currently_merging(&left.name())
            || self.queue.is_currently_merging(&right.name())
        {
            return Ok(false);
        }

        // Every block number in the gap must be an abandoned insert.
        for number in (left.right + 1)..right.left {
            let path = block_number_path(&self.table_path, number);
            if block_lock::check(&self.coordinator, &path).await? != BlockLockState::Abandoned {
                debug!(
                    left = %left.name(),
                    right = %right.name(),
                    block = %path,
                    "Can't merge parts because block exists"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether a merge over parts bigger than the threshold is in flight.
    async fn has_big_merge(&self) -> ReplicationResult<bool> {
        for name in self.queue.currently_merging_snapshot() {
            let Some(part) = self.store.get_containing_part(&name).await? else {
                continue;
            };
            if part.name() != name {
                info!(part = %name, contained_in = %part.name(), "currently_merging contains obsolete part");
                continue;
            }
            if part.size * self.index_granularity > BIG_MERGE_THRESHOLD_BYTES {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// One selection round. Returns the selected parts if a merge was
    /// published.
    pub async fn select_once(&self) -> ReplicationResult<Option<Vec<PartInfo>>> {
        if self.queue.merges_queued() >= self.merging_threads {
            return Ok(None);
        }

        let has_big_merge = self.has_big_merge().await?;

        let mut parts = self.store.get_data_parts().await?;
        parts.sort_by(|a, b| (&a.partition, a.left).cmp(&(&b.partition, b.left)));

        let mut allowed = Vec::with_capacity(parts.len().saturating_sub(1));
        for pair in parts.windows(2) {
            allowed.push(self.can_merge_parts(&pair[0], &pair[1]).await?);
        }

        debug!(only_small = has_big_merge, "Selecting parts to merge");
        let selected = self
            .policy
            .select_parts_to_merge(&parts, &allowed, false, has_big_merge)
            .or_else(|| {
                self.policy
                    .select_parts_to_merge(&parts, &allowed, true, has_big_merge)
            });

        let Some(selected) = selected else {
            return Ok(None);
        };
        let merged_name = PartInfo::merged_name(&selected).expect("non-empty selection");

        let entry = LogEntry::merge_parts(
            &self.replica_name,
            selected.iter().map(|p| p.name()).collect(),
            &merged_name,
        );
        self.coordinator
            .create(
                &format!("{}/log/log-", self.replica_path),
                entry.to_text().as_bytes(),
                CreateMode::PersistentSequential,
            )
            .await?;
        info!(
            target_part = %merged_name,
            inputs = selected.len(),
            "Proposed merge"
        );
        Ok(Some(selected))
    }

    /// Remove the abandoned-lock markers between the selected parts: they
    /// justified the merge and nothing will look at them again.
    async fn clear_gap_block_numbers(&self, selected: &[PartInfo]) {
        for pair in selected.windows(2) {
            for number in (pair[0].right + 1)..pair[1].left {
                let path = block_number_path(&self.table_path, number);
                if let Err(e) = self.coordinator.try_remove(&path).await {
                    warn!(path = %path, error = %e, "Failed to clear block number");
                }
            }
        }
    }

    /// The selection loop, running while this replica leads.
    pub async fn run(self: Arc<Self>, shutdown: Arc<AtomicBool>, is_leader: Arc<AtomicBool>) {
        // One pull before the first selection, so the queue reflects the log
        // even if leadership arrived mid-cluster-activity.
        if let Err(e) = self.puller.pull_logs_to_queue().await {
            warn!(error = %e, "Initial log pull failed");
        }

        while !shutdown.load(Ordering::SeqCst) && is_leader.load(Ordering::SeqCst) {
            let selected = match self.select_once().await {
                Ok(selected) => selected,
                Err(e) => {
                    warn!(error = %e, "Merge selection failed");
                    None
                }
            };

            // Load the new record into our own queue before the next round,
            // so its inputs read as currently merging.
            if let Err(e) = self.puller.pull_logs_to_queue().await {
                warn!(error = %e, "Log pull after selection failed");
            }

            if let Some(selected) = &selected {
                self.clear_gap_block_numbers(selected).await;
            }

            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            if selected.is_none() {
                tokio::time::sleep(MERGE_SELECTING_SLEEP).await;
            }
        }
    }
}
