//! # replitree
//! Replication control plane for a sharded, columnar merge-tree table engine.
//!
//! Each replica owns a local table of immutable data parts (contiguous sorted
//! row ranges) and cooperates with its peers through a ZooKeeper-compatible
//! coordinator to keep the part sets eventually identical, while still
//! merging small parts into larger ones locally.
//!
//! This crate is the replication state machine: replica bootstrap and
//! structure verification, the per-replica log and queue, leader election,
//! merge selection, log fan-in with coordinator-order interleaving, and the
//! workers that execute log entries (fetch a part from a peer, or merge local
//! parts) with recovery on failure.
//!
//! The data plane stays outside: the on-disk part store and the bulk
//! transfer service plug in behind the [`PartStore`](replication::PartStore)
//! and [`PartFetcher`](replication::PartFetcher) traits, and the coordinator
//! client behind [`Coordinator`](replication::Coordinator).
//!
//! # Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/)
//! - Converge replicas without any leader-assigned work: the leader only
//!   publishes merges to its own log, and every replica pulls every log
//!
//! ## Opening a replica
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replitree::prelude::*;
//!
//! # async fn open(
//! #     coordinator: Arc<dyn Coordinator>,
//! #     store: Arc<dyn PartStore>,
//! #     fetcher: Arc<dyn PartFetcher>,
//! # ) -> ReplicationResult<()> {
//! let config = ReplicaConfig::new("/tables/hits", "r1", "host1", 9009);
//! let metadata = TableMetadata {
//!     date_column: "EventDate".to_string(),
//!     sampling_expression: String::new(),
//!     index_granularity: 8192,
//!     mode: 0,
//!     sign_column: String::new(),
//!     primary_key: "(CounterID, EventDate)".to_string(),
//!     columns: vec![ColumnDef::new("CounterID", "UInt32")],
//! };
//! let table = ReplicatedTable::open(
//!     config,
//!     metadata,
//!     coordinator,
//!     store,
//!     fetcher,
//!     Arc::new(SimpleMergePolicy::default()),
//! )
//! .await?;
//!
//! // ... serve traffic ...
//! table.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod constants;
pub mod replication;
pub mod telemetry;

pub mod prelude {
    //! Main exports for building and embedding a replica.
    pub use crate::replication::{
        ColumnDef, Coordinator, CoordinatorError, EntryKind, LogEntry, MergePolicy, PartFetcher,
        PartInfo, PartStore, ReplicaConfig, ReplicatedTable, ReplicationError, ReplicationResult,
        SimpleMergePolicy, TableMetadata, TempPart,
    };
}
