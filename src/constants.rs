//! Centralized timing and sizing constants.
//!
//! This module consolidates the magic numbers used throughout the replication
//! control plane. Having them in one place makes it easier to:
//!
//! - Understand the pacing of the background loops
//! - Update values consistently
//! - Document the rationale for each constant
//!
//! # Categories
//!
//! - **Loop pacing**: sleeps between iterations of the background loops
//! - **Wire format**: fixed widths that are part of the coordinator layout
//! - **Merge selection**: thresholds governing which merges the leader proposes

use std::time::Duration;

// =============================================================================
// Loop Pacing
// =============================================================================

/// How long the log puller sleeps between fan-in iterations.
///
/// Every iteration reads each peer's log from that peer's pointer onward, so
/// this bounds how stale a replica's queue can be relative to the cluster.
pub const QUEUE_UPDATE_SLEEP: Duration = Duration::from_secs(5);

/// How long a queue worker sleeps when no entry is executable.
pub const QUEUE_NO_WORK_SLEEP: Duration = Duration::from_secs(5);

/// How long a queue worker sleeps after an entry fails.
///
/// Short on purpose: most failures are transient (a peer restarting, a
/// coordinator hiccup) and the entry was re-queued at the tail.
pub const QUEUE_ERROR_SLEEP: Duration = Duration::from_secs(1);

/// How long a queue worker sleeps after successfully executing an entry.
///
/// Zero: a worker that just finished work should immediately look for more.
/// Kept as a named constant so the worker loop reads as a complete schedule.
pub const QUEUE_AFTER_WORK_SLEEP: Duration = Duration::from_secs(0);

/// How long the merge selector sleeps when it proposed nothing, or when the
/// queue already holds `merging_threads` merges.
pub const MERGE_SELECTING_SLEEP: Duration = Duration::from_secs(5);

/// How often a non-leading participant re-checks the election state.
pub const LEADER_CHECK_SLEEP: Duration = Duration::from_secs(1);

// =============================================================================
// Wire Format
// =============================================================================

/// Width of the zero-padded numeric suffix on sequential coordinator nodes
/// (`log-<n>`, `queue-<n>`) and block-number nodes (`block-<n>`).
///
/// This width is part of the wire contract: log pointers are parsed by
/// stripping a fixed-length prefix, and lexicographic order of the padded
/// suffix must match numeric order.
pub const SEQUENTIAL_SUFFIX_WIDTH: usize = 10;

/// Prefix of per-replica log nodes: `/replicas/<r>/log/log-<n>`.
pub const LOG_NODE_PREFIX: &str = "log-";

/// Prefix of per-replica queue nodes: `/replicas/<r>/queue/queue-<n>`.
pub const QUEUE_NODE_PREFIX: &str = "queue-";

/// Prefix of block-number lock nodes: `/block_numbers/block-<n>`.
pub const BLOCK_NODE_PREFIX: &str = "block-";

/// Prefix applied to a local part that the coordinator does not know about.
///
/// Bootstrap detaches at most one such part instead of deleting it, so an
/// operator can inspect or restore it.
pub const IGNORED_PART_PREFIX: &str = "ignored_";

// =============================================================================
// Merge Selection
// =============================================================================

/// A merge whose inputs exceed this many bytes of granule-adjusted size counts
/// as "big": while one is in flight the leader only proposes small merges.
pub const BIG_MERGE_THRESHOLD_BYTES: u64 = 25 * 1024 * 1024;

// =============================================================================
// Defaults
// =============================================================================

/// Default number of queue worker tasks per replica.
pub const DEFAULT_REPLICATION_THREADS: usize = 2;

/// Default cap on concurrently proposed merges (leader only).
pub const DEFAULT_MERGING_THREADS: usize = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_suffix_orders_lexicographically() {
        let a = format!("{:0width$}", 9u64, width = SEQUENTIAL_SUFFIX_WIDTH);
        let b = format!("{:0width$}", 10u64, width = SEQUENTIAL_SUFFIX_WIDTH);
        let c = format!("{:0width$}", 1_000_000_000u64, width = SEQUENTIAL_SUFFIX_WIDTH);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.len(), SEQUENTIAL_SUFFIX_WIDTH);
        assert_eq!(c.len(), SEQUENTIAL_SUFFIX_WIDTH);
    }

    #[test]
    fn error_sleep_is_shorter_than_idle_sleep() {
        assert!(QUEUE_ERROR_SLEEP < QUEUE_NO_WORK_SLEEP);
        assert_eq!(QUEUE_AFTER_WORK_SLEEP, Duration::ZERO);
    }
}
