//! Registry of background tasks keyed by the entity they work on

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::DockyardError;

#[derive(Debug)]
struct TrackedTask {
    id: u64,
    handle: JoinHandle<()>,
}

/// Background tasks with a handle retained per entity key
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    tasks: Arc<DashMap<String, TrackedTask>>,
    next_id: Arc<AtomicU64>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` under `key`.
    ///
    /// Fails with `Conflict` while another task for the same key is running.
    /// The entry removes itself when the task finishes.
    pub fn spawn<F>(&self, key: impl Into<String>, fut: F) -> Result<(), DockyardError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        if self.is_running(&key) {
            return Err(DockyardError::Conflict(format!(
                "a background task for {} is already running",
                key
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let tasks = Arc::clone(&self.tasks);
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            // the entry must exist before the task can remove it
            let _ = registered_rx.await;
            fut.await;
            tasks.remove_if(&task_key, |_, task| task.id == id);
        });

        self.tasks.insert(key, TrackedTask { id, handle });
        let _ = registered_tx.send(());
        Ok(())
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.tasks
            .get(key)
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    /// Abort the task under `key`; returns whether one was registered
    pub fn cancel(&self, key: &str) -> bool {
        match self.tasks.remove(key) {
            Some((_, task)) => {
                task.handle.abort();
                debug!("Cancelled background task {}", key);
                true
            }
            None => false,
        }
    }

    /// Wait for the task under `key` to finish
    pub async fn wait(&self, key: &str) {
        if let Some((_, task)) = self.tasks.remove(key) {
            let _ = task.handle.await;
        }
    }

    /// Wait for every registered task
    pub async fn wait_all(&self) {
        let keys: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.wait(&key).await;
        }
    }

    /// Abort every registered task
    pub fn cancel_all(&self) {
        let keys: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
