//! Abandonable locks over block numbers.
//!
//! Every insert allocates a block number by creating a sequential node under
//! `/block_numbers`. The node's data names an ephemeral marker under `/temp`
//! owned by the inserting session:
//!
//! - insert succeeds → the writer unlocks, removing both nodes; the number
//!   now lives on in a part name
//! - writer crashes mid-insert → the marker dies with the session, the block
//!   node persists, and the lock reads as **abandoned**
//!
//! The merge selector may only merge across a numeric gap when every number
//! in the gap is abandoned: a live lock means an insert is still in flight
//! and the number may yet become a part.

use std::sync::Arc;

use crate::constants::{BLOCK_NODE_PREFIX, SEQUENTIAL_SUFFIX_WIDTH};

use super::coordinator::{Coordinator, CoordinatorResult, CreateMode, Op};
use super::error::CoordinatorError;

/// Observed state of one block-number lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLockState {
    /// The lock node exists and its session marker is alive: an insert is in
    /// flight.
    Live,
    /// The lock node exists but its session marker is gone: the inserting
    /// process died and the number will never become a part.
    Abandoned,
    /// No lock node exists for the number.
    NotFound,
}

/// Path of the lock node for a block number.
pub fn block_number_path(table_path: &str, number: u64) -> String {
    format!(
        "{table_path}/block_numbers/{BLOCK_NODE_PREFIX}{number:0width$}",
        width = SEQUENTIAL_SUFFIX_WIDTH
    )
}

/// A held block-number lock.
#[derive(Debug)]
pub struct BlockLock {
    /// The allocated number.
    pub number: u64,
    /// `/block_numbers/block-<n>` node.
    pub path: String,
    /// Ephemeral session marker under `/temp`.
    pub marker_path: String,
}

impl BlockLock {
    /// Allocate the next block number.
    pub async fn acquire(
        coordinator: &Arc<dyn Coordinator>,
        table_path: &str,
    ) -> CoordinatorResult<BlockLock> {
        let marker_path = coordinator
            .create(
                &format!("{table_path}/temp/abandonable_lock-"),
                b"",
                CreateMode::EphemeralSequential,
            )
            .await?;
        let path = coordinator
            .create(
                &format!("{table_path}/block_numbers/{BLOCK_NODE_PREFIX}"),
                marker_path.as_bytes(),
                CreateMode::PersistentSequential,
            )
            .await?;
        let number = path
            .rsplit('/')
            .next()
            .and_then(|name| name.strip_prefix(BLOCK_NODE_PREFIX))
            .and_then(|suffix| suffix.parse().ok())
            .ok_or_else(|| CoordinatorError::Other(format!("unparsable block node {path:?}")))?;
        Ok(BlockLock {
            number,
            path,
            marker_path,
        })
    }

    /// Operations releasing the lock after a successful insert: the number
    /// is now carried by a part, so the lock node disappears entirely. The
    /// caller folds these into the same multi that commits the part, making
    /// commit and unlock atomic.
    pub fn unlock_ops(&self) -> Vec<Op> {
        vec![Op::remove(&self.path), Op::remove(&self.marker_path)]
    }

    /// Give up without inserting: drop the marker, leaving the lock node to
    /// read as abandoned (and be garbage-collected by a later merge).
    pub async fn abandon(self, coordinator: &Arc<dyn Coordinator>) -> CoordinatorResult<()> {
        coordinator.try_remove(&self.marker_path).await?;
        Ok(())
    }
}

/// Check the state of the lock node at `block_path`.
pub async fn check(
    coordinator: &Arc<dyn Coordinator>,
    block_path: &str,
) -> CoordinatorResult<BlockLockState> {
    let Some((data, _)) = coordinator.try_get(block_path).await? else {
        return Ok(BlockLockState::NotFound);
    };
    if data.is_empty() {
        return Ok(BlockLockState::Abandoned);
    }
    let marker_path = String::from_utf8_lossy(&data);
    if coordinator.exists(&marker_path).await? {
        Ok(BlockLockState::Live)
    } else {
        Ok(BlockLockState::Abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::memory::InMemoryEnsemble;

    #[tokio::test]
    async fn lock_lifecycle() {
        let ensemble = InMemoryEnsemble::new();
        let writer = ensemble.session();
        let observer = ensemble.session();
        let writer_zk: Arc<dyn Coordinator> = writer.clone();
        let observer_zk: Arc<dyn Coordinator> = observer;
        writer_zk
            .create("/t/block_numbers", b"", CreateMode::Persistent)
            .await
            .unwrap();
        writer_zk
            .create("/t/temp", b"", CreateMode::Persistent)
            .await
            .unwrap();

        let lock = BlockLock::acquire(&writer_zk, "/t").await.unwrap();
        assert_eq!(lock.number, 0);
        assert_eq!(lock.path, block_number_path("/t", 0));
        assert_eq!(
            check(&observer_zk, &lock.path).await.unwrap(),
            BlockLockState::Live
        );

        // Writer crashes: the marker dies, the lock reads abandoned.
        let path = lock.path.clone();
        writer.expire_session();
        assert_eq!(
            check(&observer_zk, &path).await.unwrap(),
            BlockLockState::Abandoned
        );
    }

    #[tokio::test]
    async fn unlock_ops_remove_the_node() {
        let ensemble = InMemoryEnsemble::new();
        let session = ensemble.session();
        let zk: Arc<dyn Coordinator> = session;
        zk.create("/t/block_numbers", b"", CreateMode::Persistent)
            .await
            .unwrap();
        zk.create("/t/temp", b"", CreateMode::Persistent)
            .await
            .unwrap();

        let lock = BlockLock::acquire(&zk, "/t").await.unwrap();
        let path = lock.path.clone();
        zk.multi(lock.unlock_ops()).await.unwrap();
        assert_eq!(check(&zk, &path).await.unwrap(), BlockLockState::NotFound);
    }
}
