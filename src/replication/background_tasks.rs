//! Background task lifecycle for a replica.
//!
//! One replica runs several loops: the log puller, `N` queue workers, the
//! election watcher, and (while leading) the merge selector. This registry
//! centralizes their lifecycle:
//!
//! - Named task registration
//! - A single broadcast shutdown signal all loops select on
//! - Join-on-shutdown so `shutdown()` returns only after every loop exited
//! - Health monitoring of the individual loops

use std::collections::HashMap;
use std::future::Future;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Task loop is still running.
    Running,
    /// Task exited (normally or via shutdown signal).
    Finished,
}

/// Central registry for a replica's background loops.
pub struct BackgroundTaskRegistry {
    tasks: HashMap<String, JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: bool,
}

impl Default for BackgroundTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        BackgroundTaskRegistry {
            tasks: HashMap::new(),
            shutdown_tx,
            shutting_down: false,
        }
    }

    /// A receiver for the shutdown signal, for loops that need to select on
    /// it inside their own awaits.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a named loop. The task is raced against the shutdown signal: it
    /// should still poll [`shutdown_signal`](Self::shutdown_signal) (or its
    /// own flag) around blocking sections, but a sleep between iterations is
    /// interruptible for free.
    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.shutting_down {
            tracing::warn!(task = %name, "Ignoring spawn during shutdown");
            return;
        }
        if let Some(old) = self.tasks.remove(&name) {
            old.abort();
            tracing::debug!(task = %name, "Aborted previous task instance");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => {
                    tracing::debug!(task = %task_name, "Task completed");
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!(task = %task_name, "Task received shutdown signal");
                }
            }
        });
        tracing::debug!(task = %name, "Spawned background task");
        self.tasks.insert(name, handle);
    }

    /// Status of every registered task.
    pub fn health_check(&self) -> Vec<(String, TaskStatus)> {
        self.tasks
            .iter()
            .map(|(name, handle)| {
                let status = if handle.is_finished() {
                    TaskStatus::Finished
                } else {
                    TaskStatus::Running
                };
                (name.clone(), status)
            })
            .collect()
    }

    /// Signal shutdown and wait for every task to exit. Idempotent.
    pub async fn shutdown_all(&mut self) {
        self.shutting_down = true;
        let _ = self.shutdown_tx.send(());
        for (name, handle) in self.tasks.drain() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::error!(task = %name, error = %e, "Background task panicked");
                }
            }
        }
    }
}
