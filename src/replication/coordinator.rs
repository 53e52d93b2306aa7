//! Coordinator facade: the seam between the control plane and the
//! hierarchical configuration store.
//!
//! The trait abstracts a ZooKeeper-compatible ensemble, allowing for:
//! - Different backend implementations (a real client, in-memory for testing)
//! - Easier testing with a shared in-process ensemble
//! - Clear separation of concerns
//!
//! # Available Implementations
//!
//! - [`InMemoryCoordinator`](super::memory::InMemoryCoordinator): in-process
//!   ensemble for tests and single-node experiments (behind `test-utilities`)
//!
//! A production deployment plugs a real coordinator client in behind this
//! trait; the control plane never talks to the wire directly.
//!
//! # Ordering
//!
//! Every node carries a [`Stat`] with its `czxid`: the coordinator-assigned
//! creation transaction id, totally ordered across the ensemble. The log
//! fan-in relies on `czxid` rather than wall clocks to interleave peer logs.

use async_trait::async_trait;

use super::error::CoordinatorError;

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives session loss.
    Persistent,
    /// Survives session loss; a zero-padded sequence number is appended to
    /// the supplied path.
    PersistentSequential,
    /// Removed automatically when the creating session ends.
    Ephemeral,
    /// Ephemeral with an appended sequence number.
    EphemeralSequential,
}

impl CreateMode {
    /// True for the sequential variants.
    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }

    /// True for the ephemeral variants.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }
}

/// Node metadata returned alongside reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// Creation transaction id: a total order over node creations across the
    /// whole ensemble.
    pub czxid: i64,
}

/// One operation inside an atomic [`Coordinator::multi`] batch.
#[derive(Debug, Clone)]
pub enum Op {
    /// Create a node with the given data.
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    /// Overwrite a node's data.
    SetData { path: String, data: Vec<u8> },
    /// Remove a node (must have no children).
    Remove { path: String },
}

impl Op {
    /// Create op with [`CreateMode::Persistent`].
    pub fn create(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Op::Create {
            path: path.into(),
            data: data.into(),
            mode: CreateMode::Persistent,
        }
    }

    /// Create op with an explicit mode.
    pub fn create_mode(
        path: impl Into<String>,
        data: impl Into<Vec<u8>>,
        mode: CreateMode,
    ) -> Self {
        Op::Create {
            path: path.into(),
            data: data.into(),
            mode,
        }
    }

    /// SetData op.
    pub fn set_data(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Op::SetData {
            path: path.into(),
            data: data.into(),
        }
    }

    /// Remove op.
    pub fn remove(path: impl Into<String>) -> Self {
        Op::Remove { path: path.into() }
    }
}

/// Per-operation result of an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    /// The path actually created: for sequential creates this carries the
    /// generated suffix the caller needs.
    Created { path: String },
    /// Data was set.
    Set,
    /// Node was removed.
    Removed,
}

impl OpResult {
    /// The created path, if this result came from a create op.
    pub fn created_path(&self) -> Option<&str> {
        match self {
            OpResult::Created { path } => Some(path),
            _ => None,
        }
    }
}

/// Outcome of a best-effort removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The node existed and was removed.
    Removed,
    /// There was nothing to remove.
    NoNode,
}

/// The hierarchical coordinator, as seen by the replication control plane.
///
/// All methods are cancel-safe from the caller's point of view: an operation
/// either took effect on the ensemble or errored; the control-plane loops
/// re-read state on every iteration and never depend on in-flight calls.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Create a node. Returns the path actually created (differs from the
    /// argument only for sequential modes).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordinatorResult<String>;

    /// Read a node's data and stat. Errors with `NoNode` if absent.
    async fn get(&self, path: &str) -> CoordinatorResult<(Vec<u8>, Stat)>;

    /// Read a node's data and stat, or `None` if absent.
    async fn try_get(&self, path: &str) -> CoordinatorResult<Option<(Vec<u8>, Stat)>>;

    /// Overwrite a node's data.
    async fn set(&self, path: &str, data: &[u8]) -> CoordinatorResult<()>;

    /// Whether a node exists.
    async fn exists(&self, path: &str) -> CoordinatorResult<bool>;

    /// Names (not paths) of a node's children, unordered.
    async fn children(&self, path: &str) -> CoordinatorResult<Vec<String>>;

    /// Remove a node if it exists; `NoNode` absence is not an error.
    async fn try_remove(&self, path: &str) -> CoordinatorResult<RemoveOutcome>;

    /// Remove a node and everything below it.
    async fn remove_recursive(&self, path: &str) -> CoordinatorResult<()>;

    /// Apply a batch of operations atomically: either every op takes effect
    /// or none does.
    async fn multi(&self, ops: Vec<Op>) -> CoordinatorResult<Vec<OpResult>>;
}

/// Last path component of a coordinator path.
///
/// Sequential creates return full paths; callers that store the znode name of
/// a queue entry only need the final component.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
