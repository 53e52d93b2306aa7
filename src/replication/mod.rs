//! The replication control plane.
//!
//! Replicas of one table cooperate through a hierarchical coordinator to keep
//! their part sets eventually identical, while still merging small parts into
//! larger ones locally:
//!
//! ```text
//!        writer                         leader only
//!          │                                │
//!          ▼                                ▼
//!   ┌────────────┐  commit_part    ┌───────────────┐
//!   │ PartStore  │───────────────► │ MergeSelector │
//!   └────────────┘                 └───────┬───────┘
//!          ▲                               │ MERGE_PARTS
//!          │                               ▼
//!   ┌──────┴──────┐   pull   ┌──────────────────────────┐
//!   │  Executor   │◄─────────│ /replicas/<R>/log  (all) │
//!   │  workers    │  queue   └──────────────────────────┘
//!   └─────────────┘
//! ```
//!
//! Every replica (the producer included) consumes the cluster's logs
//! through [`LogPuller`](log_puller::LogPuller), so every queue sees the same
//! actions in the same coordinator (`czxid`) order; workers then either merge
//! locally or fetch the finished part from a peer, converging on identical
//! part sets.

pub mod background_tasks;
pub mod block_lock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod leader;
pub mod log_entry;
pub mod log_puller;
pub mod merge_selector;
pub mod metadata;
pub mod metrics;
pub mod part;
pub mod queue;
pub mod retry;
pub mod store;
pub mod table;

#[cfg(any(test, feature = "test-utilities"))]
pub mod memory;

pub use background_tasks::{BackgroundTaskRegistry, TaskStatus};
pub use block_lock::{BlockLock, BlockLockState};
pub use config::ReplicaConfig;
pub use coordinator::{Coordinator, CoordinatorResult, CreateMode, Op, OpResult, RemoveOutcome, Stat};
pub use error::{CoordinatorError, ReplicationError, ReplicationResult};
pub use executor::{QueueExecutor, WorkOutcome};
pub use leader::LeaderElection;
pub use log_entry::{EntryKind, LogEntry};
pub use log_puller::LogPuller;
pub use merge_selector::{MergePolicy, MergeSelector, SimpleMergePolicy};
pub use metadata::{ColumnDef, TableMetadata};
pub use part::PartInfo;
pub use queue::ReplicationQueue;
pub use store::{PartFetcher, PartStore, TempPart};
pub use table::ReplicatedTable;

#[cfg(any(test, feature = "test-utilities"))]
pub use memory::{InMemoryCoordinator, InMemoryEnsemble};
#[cfg(any(test, feature = "test-utilities"))]
pub use store::{InMemoryPartFetcher, InMemoryPartStore};
