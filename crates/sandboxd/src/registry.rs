//! Managed background tasks.
//!
//! Every live terminal and watcher owns exactly one reader task that
//! republishes its events to the connection manager, and the signal service
//! owns one broadcaster per start. The [`TaskRegistry`] keeps those tasks
//! keyed by channel name together with their cancellation tokens, so a
//! resource can be torn down by cancelling, removing and joining its task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long `cancel` waits for a task to observe cancellation before aborting it.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors returned by the task registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A live task is already registered under this key.
    #[error("task already registered: {0}")]
    AlreadyRegistered(String),
}

struct ManagedTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Registry of cancellable background tasks keyed by channel name.
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, ManagedTask>>,
    join_timeout: Duration,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::with_join_timeout(DEFAULT_JOIN_TIMEOUT)
    }

    /// Creates an empty registry with a custom join timeout.
    pub fn with_join_timeout(join_timeout: Duration) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            join_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ManagedTask>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawns a task under `key`.
    ///
    /// The closure receives the task's cancellation token. A key whose
    /// previous task has already finished may be reused; a key with a live
    /// task is rejected and the closure is never called.
    pub fn spawn<F, Fut>(&self, key: impl Into<String>, f: F) -> Result<(), RegistryError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let mut tasks = self.lock();

        if let Some(existing) = tasks.get(&key) {
            if !existing.handle.is_finished() {
                return Err(RegistryError::AlreadyRegistered(key));
            }
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(f(token.clone()));
        tasks.insert(key.clone(), ManagedTask { token, handle });

        tracing::debug!(task = %key, "Registered background task");
        Ok(())
    }

    /// Cancels and joins the task registered under `key`.
    ///
    /// Removal and cancellation happen under the lock; the join happens
    /// after releasing it. A task that ignores cancellation past the join
    /// timeout is aborted. Returns false if no task was registered.
    pub async fn cancel(&self, key: &str) -> bool {
        let task = {
            let mut tasks = self.lock();
            let task = tasks.remove(key);
            if let Some(ref task) = task {
                task.token.cancel();
            }
            task
        };

        match task {
            Some(task) => {
                self.join(key, task.handle).await;
                true
            }
            None => false,
        }
    }

    async fn join(&self, key: &str, mut handle: JoinHandle<()>) {
        match tokio::time::timeout(self.join_timeout, &mut handle).await {
            Ok(Ok(())) => tracing::debug!(task = %key, "Background task stopped"),
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => tracing::error!(task = %key, error = %e, "Background task panicked"),
            Err(_) => {
                tracing::warn!(task = %key, "Background task did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    /// Returns whether a task is registered under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Returns the number of registered tasks.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no tasks are registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the registered keys.
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Cancels and joins every registered task.
    pub async fn shutdown(&self) {
        let tasks: Vec<(String, ManagedTask)> = {
            let mut tasks = self.lock();
            let drained: Vec<_> = tasks.drain().collect();
            for (_, task) in &drained {
                task.token.cancel();
            }
            drained
        };

        for (key, task) in tasks {
            self.join(&key, task.handle).await;
        }
    }
}
