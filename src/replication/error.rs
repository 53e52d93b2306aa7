//! Error types for the replication control plane.
//!
//! # Error Handling Patterns
//!
//! This crate uses two patterns based on where an error occurs:
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! Used during bootstrap, where a broken invariant means the replica must not
//! start:
//! - Metadata divergence between the coordinator and the local table
//! - Local parts missing that the coordinator says we own
//! - Another live session already holding `/is_active`
//!
//! ## Best-Effort (Log and Retry)
//!
//! Used inside the background loops, where the cluster heals on its own:
//! - Coordinator session errors: the loop retries on its next iteration
//! - A failed part fetch: the entry goes back to the queue tail
//! - `NoReplicaHasPart`: logged at info level only, transient by nature;
//!   the source replica simply has not announced the part yet
//!
//! Queue workers catch every error per entry; nothing a single entry does can
//! take the worker down.

use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors produced by the replication control plane.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// A new (non-attach) replica was pointed at a table where peers already
    /// hold parts. Joining would require an initial sync this engine does not
    /// perform; the replica must be created against an empty table.
    #[error("can't add new replica to non-empty table at {table_path}")]
    AddingReplicaToNonEmptyTable { table_path: String },

    /// `/is_active` already exists under this replica path: another process is
    /// running as the same replica, or a previous session has not expired yet.
    #[error(
        "replica {replica_path} appears to be already active; if you're sure it's not, \
         try again in a minute or remove {replica_path}/is_active manually"
    )]
    ReplicaIsAlreadyActive { replica_path: String },

    /// The coordinator lists parts for this replica that the local store does
    /// not hold. Data is missing; starting would silently diverge.
    #[error("{count} expected parts not found locally (including {example})")]
    NotFoundExpectedDataPart { count: usize, example: String },

    /// The local store holds more than one part the coordinator knows nothing
    /// about. One stray part is detached and ignored; several indicate the
    /// replica was pointed at the wrong data directory.
    #[error("more than one unexpected local part (including {example})")]
    TooManyUnexpectedDataParts { example: String },

    /// A column in the coordinator metadata does not match the local table.
    #[error("unexpected column in coordinator metadata: expected {expected}, found {found}")]
    UnknownIdentifier { expected: String, found: String },

    /// The coordinator metadata diverges from the local table structure
    /// somewhere other than a column definition.
    #[error("table metadata in coordinator differs from local table: {detail}")]
    MetadataMismatch { detail: String },

    /// No active peer advertises the part we need to fetch. Transient: the
    /// entry stays queued and is retried after the source replica announces
    /// the part or comes back up.
    #[error("no active replica has part {part_name}")]
    NoReplicaHasPart { part_name: String },

    /// A coordinator node was expected to exist but does not, or held data
    /// that failed to parse.
    #[error("coordinator node {path}: {detail}")]
    MalformedNode { path: String, detail: String },

    /// A log or queue record failed to parse.
    #[error("can't parse log entry: {detail}")]
    MalformedLogEntry { detail: String },

    /// An error reported by the coordinator client (session loss, node exists,
    /// node missing, failed multi).
    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    /// An error reported by the local part store.
    #[error("part store error: {0}")]
    Store(String),

    /// An error during an inter-replica part fetch.
    #[error("fetch of part {part_name} from {replica} failed: {detail}")]
    FetchFailed {
        part_name: String,
        replica: String,
        detail: String,
    },

    /// Configuration error found at validation time.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Errors surfaced by the coordinator facade.
///
/// These mirror the outcome codes of a ZooKeeper-style client: the control
/// plane switches on `NodeExists` / `NoNode` in a few places (activation,
/// best-effort removals) and treats everything else as a transient session
/// problem for the enclosing loop to retry.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Create hit an existing node.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// Get/set/remove hit a missing node.
    #[error("no node: {0}")]
    NoNode(String),

    /// Remove hit a node that still has children.
    #[error("node not empty: {0}")]
    NotEmpty(String),

    /// An atomic multi was rejected; no operation in it was applied.
    #[error("multi-op failed at op {failed_op}: {detail}")]
    MultiFailed { failed_op: usize, detail: String },

    /// The session to the coordinator ensemble is gone.
    #[error("session expired")]
    SessionExpired,

    /// Any other client-level failure (timeouts, connection loss).
    #[error("{0}")]
    Other(String),
}

impl ReplicationError {
    /// True for errors that the queue workers log at info level and retry,
    /// rather than reporting as failures.
    pub fn is_transient_absence(&self) -> bool {
        matches!(self, ReplicationError::NoReplicaHasPart { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_replica_path() {
        let err = ReplicationError::ReplicaIsAlreadyActive {
            replica_path: "/tables/t/replicas/r1".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("/tables/t/replicas/r1/is_active"));
    }

    #[test]
    fn no_replica_has_part_is_transient() {
        let err = ReplicationError::NoReplicaHasPart {
            part_name: "20210101_0_0_0".to_string(),
        };
        assert!(err.is_transient_absence());

        let err = ReplicationError::Store("disk full".to_string());
        assert!(!err.is_transient_absence());
    }

    #[test]
    fn coordinator_error_converts() {
        let err: ReplicationError = CoordinatorError::SessionExpired.into();
        assert!(matches!(
            err,
            ReplicationError::Coordinator(CoordinatorError::SessionExpired)
        ));
    }
}
