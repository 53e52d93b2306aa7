//! Leader election over ephemeral-sequential nodes.
//!
//! Every replica parks an ephemeral-sequential node under
//! `/leader_election/`; the participant holding the lowest sequence leads.
//! Leadership carries exactly one duty: running the merge selector. Losing
//! the coordinator session removes the node and thereby the leadership;
//! re-election happens when the remaining participants next check the
//! children: there is no hot handoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::constants::LEADER_CHECK_SLEEP;

use super::coordinator::{Coordinator, CreateMode, node_name};
use super::error::ReplicationResult;
use super::merge_selector::MergeSelector;
use super::metrics;

/// One replica's participation in the election.
pub struct LeaderElection {
    coordinator: Arc<dyn Coordinator>,
    election_path: String,
    replica_name: String,
    is_leader: Arc<AtomicBool>,
    my_node: Mutex<Option<String>>,
    selector_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElection {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        table_path: &str,
        replica_name: impl Into<String>,
    ) -> Self {
        LeaderElection {
            coordinator,
            election_path: format!("{table_path}/leader_election"),
            replica_name: replica_name.into(),
            is_leader: Arc::new(AtomicBool::new(false)),
            my_node: Mutex::new(None),
            selector_handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Enter the election by creating our ephemeral-sequential node.
    pub async fn join(&self) -> ReplicationResult<()> {
        let path = self
            .coordinator
            .create(
                &format!("{}/leader_election-", self.election_path),
                self.replica_name.as_bytes(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        *self.my_node.lock().unwrap() = Some(node_name(&path).to_string());
        Ok(())
    }

    /// Whether this replica currently leads.
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Shared leadership flag, polled by the merge selector loop.
    pub fn leadership_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.is_leader)
    }

    /// Whether our node holds the lowest sequence among the participants.
    async fn holds_lowest_sequence(&self) -> ReplicationResult<bool> {
        let Some(my_node) = self.my_node.lock().unwrap().clone() else {
            return Ok(false);
        };
        let mut children = self.coordinator.children(&self.election_path).await?;
        children.sort();
        Ok(children.first().map(String::as_str) == Some(my_node.as_str()))
    }

    /// The election loop: watch for leadership, and on acquiring it start
    /// the merge selector.
    pub async fn run(
        self: Arc<Self>,
        shutdown: Arc<AtomicBool>,
        selector: Arc<MergeSelector>,
    ) {
        while !shutdown.load(Ordering::SeqCst) {
            if !self.is_leader() {
                match self.holds_lowest_sequence().await {
                    Ok(true) => {
                        info!(replica = %self.replica_name, "Became leader");
                        self.is_leader.store(true, Ordering::SeqCst);
                        metrics::IS_LEADER.set(1);
                        let handle = tokio::spawn(Arc::clone(&selector).run(
                            Arc::clone(&shutdown),
                            Arc::clone(&self.is_leader),
                        ));
                        *self.selector_handle.lock().await = Some(handle);
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "Leader election check failed"),
                }
            }
            tokio::time::sleep(LEADER_CHECK_SLEEP).await;
        }
    }

    /// Leave the election: drop leadership, remove our node, and wait for
    /// the merge selector to wind down. Idempotent.
    pub async fn resign(&self) {
        self.is_leader.store(false, Ordering::SeqCst);
        metrics::IS_LEADER.set(0);

        let my_node = self.my_node.lock().unwrap().take();
        if let Some(my_node) = my_node {
            let path = format!("{}/{}", self.election_path, my_node);
            if let Err(e) = self.coordinator.try_remove(&path).await {
                warn!(path = %path, error = %e, "Failed to remove election node");
            }
        }

        if let Some(handle) = self.selector_handle.lock().await.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Merge selector task panicked");
                }
            }
        }
    }
}
