//! In-memory coordinator ensemble for testing.
//!
//! A full-featured in-process implementation of the [`Coordinator`] trait:
//! hierarchical nodes, ephemeral ownership tied to sessions, per-parent
//! sequential counters, ensemble-wide `czxid` assignment, and atomic multi
//! batches. Multi-replica tests share one [`InMemoryEnsemble`] and give each
//! replica its own session, so `is_active` semantics, duplicate-start
//! rejection, and leader re-election are all exercisable without an external
//! coordinator.
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled, or
//! during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! replitree = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::constants::SEQUENTIAL_SUFFIX_WIDTH;

use super::coordinator::{
    Coordinator, CoordinatorResult, CreateMode, Op, OpResult, RemoveOutcome, Stat,
};
use super::error::CoordinatorError;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    czxid: i64,
    /// Session that owns this node if it is ephemeral.
    ephemeral_owner: Option<u64>,
    /// Counter for sequential children created under this node.
    next_sequence: u64,
}

#[derive(Debug, Default)]
struct EnsembleState {
    nodes: HashMap<String, Node>,
    next_czxid: i64,
    next_session: u64,
}

/// The shared in-process ensemble. Clone the `Arc` and open one session per
/// replica.
#[derive(Debug, Default)]
pub struct InMemoryEnsemble {
    state: Mutex<EnsembleState>,
}

impl InMemoryEnsemble {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a new session. Ephemeral nodes created through the returned
    /// handle vanish when the session expires (or the handle is dropped).
    pub fn session(self: &Arc<Self>) -> Arc<InMemoryCoordinator> {
        let session_id = {
            let mut state = self.state.lock().unwrap();
            state.next_session += 1;
            state.next_session
        };
        Arc::new(InMemoryCoordinator {
            ensemble: Arc::clone(self),
            session_id,
            expired: AtomicBool::new(false),
        })
    }

    /// All node paths, sorted. Test helper.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.state.lock().unwrap().nodes.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn expire(&self, session_id: u64) {
        let mut state = self.state.lock().unwrap();
        state
            .nodes
            .retain(|_, node| node.ephemeral_owner != Some(session_id));
    }
}

fn parent_of(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    if idx == 0 { None } else { Some(&path[..idx]) }
}

fn is_child_of(path: &str, parent: &str) -> bool {
    path.len() > parent.len() + 1
        && path.starts_with(parent)
        && path.as_bytes()[parent.len()] == b'/'
        && !path[parent.len() + 1..].contains('/')
}

impl EnsembleState {
    fn next_czxid(&mut self) -> i64 {
        self.next_czxid += 1;
        self.next_czxid
    }

    fn has_children(&self, path: &str) -> bool {
        self.nodes.keys().any(|p| is_child_of(p, path))
    }

    /// Resolve the final path of a create, consuming a sequence number for
    /// sequential modes.
    fn resolve_create_path(&mut self, path: &str, mode: CreateMode) -> CoordinatorResult<String> {
        if !mode.is_sequential() {
            if self.nodes.contains_key(path) {
                return Err(CoordinatorError::NodeExists(path.to_string()));
            }
            return Ok(path.to_string());
        }
        let parent = parent_of(path)
            .ok_or_else(|| CoordinatorError::Other(format!("bad path {path:?}")))?
            .to_string();
        let seq = {
            let parent_node = self
                .nodes
                .get_mut(&parent)
                .ok_or_else(|| CoordinatorError::NoNode(parent.clone()))?;
            let seq = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            seq
        };
        Ok(format!("{path}{seq:0width$}", width = SEQUENTIAL_SUFFIX_WIDTH))
    }

    fn apply_create(
        &mut self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        session_id: u64,
    ) -> CoordinatorResult<String> {
        let final_path = self.resolve_create_path(path, mode)?;
        // Intermediate parents are created implicitly; a real client would
        // create them explicitly, which makes no observable difference to the
        // control plane.
        let mut ancestors = Vec::new();
        let mut cursor = final_path.as_str();
        while let Some(parent) = parent_of(cursor) {
            if !self.nodes.contains_key(parent) {
                ancestors.push(parent.to_string());
            }
            cursor = parent;
        }
        for parent in ancestors.into_iter().rev() {
            let czxid = self.next_czxid();
            self.nodes.insert(
                parent,
                Node {
                    data: Vec::new(),
                    czxid,
                    ephemeral_owner: None,
                    next_sequence: 0,
                },
            );
        }
        let czxid = self.next_czxid();
        self.nodes.insert(
            final_path.clone(),
            Node {
                data: data.to_vec(),
                czxid,
                ephemeral_owner: mode.is_ephemeral().then_some(session_id),
                next_sequence: 0,
            },
        );
        Ok(final_path)
    }

    fn apply_set(&mut self, path: &str, data: &[u8]) -> CoordinatorResult<()> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinatorError::NoNode(path.to_string()))?;
        node.data = data.to_vec();
        Ok(())
    }

    fn apply_remove(&mut self, path: &str) -> CoordinatorResult<()> {
        if !self.nodes.contains_key(path) {
            return Err(CoordinatorError::NoNode(path.to_string()));
        }
        if self.has_children(path) {
            return Err(CoordinatorError::NotEmpty(path.to_string()));
        }
        self.nodes.remove(path);
        Ok(())
    }
}

/// One session against an [`InMemoryEnsemble`].
#[derive(Debug)]
pub struct InMemoryCoordinator {
    ensemble: Arc<InMemoryEnsemble>,
    session_id: u64,
    expired: AtomicBool,
}

impl InMemoryCoordinator {
    /// Kill this session: its ephemeral nodes vanish and every subsequent
    /// operation fails with `SessionExpired`. Test helper for crash and
    /// split-brain scenarios.
    pub fn expire_session(&self) {
        self.expired.store(true, Ordering::SeqCst);
        self.ensemble.expire(self.session_id);
    }

    /// The ensemble this session belongs to.
    pub fn ensemble(&self) -> &Arc<InMemoryEnsemble> {
        &self.ensemble
    }

    fn check_alive(&self) -> CoordinatorResult<()> {
        if self.expired.load(Ordering::SeqCst) {
            return Err(CoordinatorError::SessionExpired);
        }
        Ok(())
    }
}

impl Drop for InMemoryCoordinator {
    fn drop(&mut self) {
        if !self.expired.load(Ordering::SeqCst) {
            self.ensemble.expire(self.session_id);
        }
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordinatorResult<String> {
        self.check_alive()?;
        let mut state = self.ensemble.state.lock().unwrap();
        state.apply_create(path, data, mode, self.session_id)
    }

    async fn get(&self, path: &str) -> CoordinatorResult<(Vec<u8>, Stat)> {
        self.check_alive()?;
        let state = self.ensemble.state.lock().unwrap();
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| CoordinatorError::NoNode(path.to_string()))?;
        Ok((node.data.clone(), Stat { czxid: node.czxid }))
    }

    async fn try_get(&self, path: &str) -> CoordinatorResult<Option<(Vec<u8>, Stat)>> {
        self.check_alive()?;
        let state = self.ensemble.state.lock().unwrap();
        Ok(state
            .nodes
            .get(path)
            .map(|node| (node.data.clone(), Stat { czxid: node.czxid })))
    }

    async fn set(&self, path: &str, data: &[u8]) -> CoordinatorResult<()> {
        self.check_alive()?;
        let mut state = self.ensemble.state.lock().unwrap();
        state.apply_set(path, data)
    }

    async fn exists(&self, path: &str) -> CoordinatorResult<bool> {
        self.check_alive()?;
        let state = self.ensemble.state.lock().unwrap();
        Ok(state.nodes.contains_key(path))
    }

    async fn children(&self, path: &str) -> CoordinatorResult<Vec<String>> {
        self.check_alive()?;
        let state = self.ensemble.state.lock().unwrap();
        if !state.nodes.contains_key(path) {
            return Err(CoordinatorError::NoNode(path.to_string()));
        }
        Ok(state
            .nodes
            .keys()
            .filter(|p| is_child_of(p, path))
            .map(|p| p[path.len() + 1..].to_string())
            .collect())
    }

    async fn try_remove(&self, path: &str) -> CoordinatorResult<RemoveOutcome> {
        self.check_alive()?;
        let mut state = self.ensemble.state.lock().unwrap();
        match state.apply_remove(path) {
            Ok(()) => Ok(RemoveOutcome::Removed),
            Err(CoordinatorError::NoNode(_)) => Ok(RemoveOutcome::NoNode),
            Err(e) => Err(e),
        }
    }

    async fn remove_recursive(&self, path: &str) -> CoordinatorResult<()> {
        self.check_alive()?;
        let mut state = self.ensemble.state.lock().unwrap();
        let prefix = format!("{path}/");
        state
            .nodes
            .retain(|p, _| p != path && !p.starts_with(&prefix));
        Ok(())
    }

    async fn multi(&self, ops: Vec<Op>) -> CoordinatorResult<Vec<OpResult>> {
        self.check_alive()?;
        let mut state = self.ensemble.state.lock().unwrap();
        // Apply against a scratch copy; commit only if every op succeeds.
        let mut scratch = EnsembleState {
            nodes: state.nodes.clone(),
            next_czxid: state.next_czxid,
            next_session: state.next_session,
        };
        let mut results = Vec::with_capacity(ops.len());
        for (idx, op) in ops.iter().enumerate() {
            let result = match op {
                Op::Create { path, data, mode } => scratch
                    .apply_create(path, data, *mode, self.session_id)
                    .map(|path| OpResult::Created { path }),
                Op::SetData { path, data } => {
                    scratch.apply_set(path, data).map(|()| OpResult::Set)
                }
                Op::Remove { path } => scratch.apply_remove(path).map(|()| OpResult::Removed),
            };
            match result {
                Ok(r) => results.push(r),
                Err(e) => {
                    return Err(CoordinatorError::MultiFailed {
                        failed_op: idx,
                        detail: e.to_string(),
                    });
                }
            }
        }
        *state = scratch;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequential_creates_are_padded_and_ordered() {
        let ensemble = InMemoryEnsemble::new();
        let zk = ensemble.session();
        zk.create("/log", b"", CreateMode::Persistent).await.unwrap();
        let a = zk
            .create("/log/log-", b"a", CreateMode::PersistentSequential)
            .await
            .unwrap();
        let b = zk
            .create("/log/log-", b"b", CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert_eq!(a, "/log/log-0000000000");
        assert_eq!(b, "/log/log-0000000001");
    }

    #[tokio::test]
    async fn czxid_totally_ordered_across_parents() {
        let ensemble = InMemoryEnsemble::new();
        let zk = ensemble.session();
        zk.create("/a", b"", CreateMode::Persistent).await.unwrap();
        zk.create("/b", b"", CreateMode::Persistent).await.unwrap();
        zk.create("/a/x", b"", CreateMode::Persistent).await.unwrap();
        let (_, stat_b) = zk.get("/b").await.unwrap();
        let (_, stat_ax) = zk.get("/a/x").await.unwrap();
        assert!(stat_b.czxid < stat_ax.czxid);
    }

    #[tokio::test]
    async fn ephemeral_nodes_die_with_session() {
        let ensemble = InMemoryEnsemble::new();
        let zk1 = ensemble.session();
        let zk2 = ensemble.session();
        zk1.create("/r", b"", CreateMode::Persistent).await.unwrap();
        zk1.create("/r/is_active", b"", CreateMode::Ephemeral)
            .await
            .unwrap();
        assert!(zk2.exists("/r/is_active").await.unwrap());
        zk1.expire_session();
        assert!(!zk2.exists("/r/is_active").await.unwrap());
        assert!(zk1.exists("/r").await.is_err());
    }

    #[tokio::test]
    async fn multi_is_atomic() {
        let ensemble = InMemoryEnsemble::new();
        let zk = ensemble.session();
        zk.create("/q", b"", CreateMode::Persistent).await.unwrap();
        // Second op fails (no such node) so the first must not apply.
        let err = zk
            .multi(vec![
                Op::create_mode("/q/queue-", b"e", CreateMode::PersistentSequential),
                Op::set_data("/missing", b"x"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::MultiFailed { failed_op: 1, .. }));
        assert!(zk.children("/q").await.unwrap().is_empty());

        let results = zk
            .multi(vec![
                Op::create_mode("/q/queue-", b"e", CreateMode::PersistentSequential),
                Op::create("/p", b""),
            ])
            .await
            .unwrap();
        assert_eq!(results[0].created_path(), Some("/q/queue-0000000000"));
    }

    #[tokio::test]
    async fn remove_refuses_non_empty() {
        let ensemble = InMemoryEnsemble::new();
        let zk = ensemble.session();
        zk.create("/a/b", b"", CreateMode::Persistent).await.unwrap();
        assert!(matches!(
            zk.try_remove("/a").await,
            Err(CoordinatorError::NotEmpty(_))
        ));
        zk.remove_recursive("/a").await.unwrap();
        assert!(!zk.exists("/a").await.unwrap());
        assert_eq!(zk.try_remove("/a").await.unwrap(), RemoveOutcome::NoNode);
    }
}
