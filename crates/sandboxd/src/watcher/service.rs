//! File watcher service.
//!
//! Each watcher registers a non-recursive native watch on every directory of
//! its tree that is not ignored, so ignored subtrees are never watched at
//! all. Directories created later are registered as they appear.
//!
//! Walking the tree and registering watches happens on the blocking pool.
//!
//! Native notifications are classified and filtered on a per-watcher task
//! and pushed into a bounded channel. Both hops use `try_send`: when a
//! consumer falls behind, events are dropped rather than stalling the OS
//! watch loop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notify::event::{ModifyKind, RemoveKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use protocol::api::WatcherStatus;
use protocol::messages::{FileChange, FileChangeKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use walkdir::WalkDir;

use super::ignore::IgnoreMatcher;
use super::WatcherError;
use crate::config::WatcherConfig;

/// Capacity of the hop between the native callback and the watcher task.
const RAW_EVENT_BUFFER: usize = 1024;

/// How long `delete` waits for the watcher task to finish.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Snapshot of a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherInfo {
    pub id: String,
    pub path: PathBuf,
    pub include_content: bool,
    pub ignored: Vec<String>,
    pub status: WatcherStatus,
    pub created_at: DateTime<Utc>,
}

type SharedWatcher = Arc<Mutex<Option<RecommendedWatcher>>>;

struct WatchHandle {
    info: WatcherInfo,
    token: CancellationToken,
    native: SharedWatcher,
    task: JoinHandle<()>,
}

impl WatchHandle {
    fn info(&self) -> WatcherInfo {
        let mut info = self.info.clone();
        if self.task.is_finished() {
            info.status = WatcherStatus::Stopped;
        }
        info
    }
}

/// A claimed watcher slot, given back on drop unless committed.
struct Slot<'a> {
    slots: &'a AtomicUsize,
    committed: bool,
}

impl Slot<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.slots.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Owns every live file watcher.
pub struct WatcherService {
    watchers: DashMap<String, WatchHandle>,
    config: WatcherConfig,
    /// Live watchers plus creations in flight.
    slots: AtomicUsize,
}

impl WatcherService {
    pub fn new(config: WatcherConfig) -> Self {
        Self {
            watchers: DashMap::new(),
            config,
            slots: AtomicUsize::new(0),
        }
    }

    fn reserve_slot(&self) -> Result<Slot<'_>, WatcherError> {
        let max = self.config.max_watchers;
        self.slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|_| WatcherError::LimitReached(max))?;
        Ok(Slot {
            slots: &self.slots,
            committed: false,
        })
    }

    /// Starts watching the directory tree at `path`.
    ///
    /// Returns the watcher and the receiving end of its event stream.
    pub async fn create(
        &self,
        path: &Path,
        include_content: bool,
        ignored: Vec<String>,
    ) -> Result<(WatcherInfo, mpsc::Receiver<FileChange>), WatcherError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| WatcherError::PathNotFound(path.display().to_string()))?;
        if !metadata.is_dir() {
            return Err(WatcherError::NotADirectory(path.display().to_string()));
        }
        let root = tokio::fs::canonicalize(path).await?;
        let matcher = Arc::new(IgnoreMatcher::new(&ignored)?);

        let slot = self.reserve_slot()?;

        let id = Uuid::new_v4().to_string();
        let (raw_tx, raw_rx) = mpsc::channel(RAW_EVENT_BUFFER);

        let callback_id = id.clone();
        let walk_root = root.clone();
        let walk_matcher = Arc::clone(&matcher);
        let (native, registered) = tokio::task::spawn_blocking(move || {
            let mut native = notify::recommended_watcher(move |res: notify::Result<Event>| {
                if raw_tx.try_send(res).is_err() {
                    tracing::trace!(watcher_id = %callback_id, "Dropping native event");
                }
            })?;
            native.watch(&walk_root, RecursiveMode::NonRecursive)?;
            let registered = register_tree(&mut native, &walk_root, &walk_matcher, false);
            Ok::<_, WatcherError>((native, registered))
        })
        .await
        .map_err(|e| WatcherError::Io(std::io::Error::other(e)))??;

        let info = WatcherInfo {
            id: id.clone(),
            path: root.clone(),
            include_content,
            ignored,
            status: WatcherStatus::Active,
            created_at: Utc::now(),
        };

        let (event_tx, event_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let token = CancellationToken::new();
        let native: SharedWatcher = Arc::new(Mutex::new(Some(native)));

        let worker = EventWorker {
            id: id.clone(),
            matcher,
            include_content,
            settle_delay: self.config.settle_delay(),
            native: Arc::clone(&native),
            events: event_tx,
        };
        let task = tokio::spawn(worker.run(raw_rx, token.clone()));

        self.watchers.insert(
            id.clone(),
            WatchHandle {
                info: info.clone(),
                token,
                native,
                task,
            },
        );
        slot.commit();

        tracing::info!(
            watcher_id = %id,
            path = %root.display(),
            directories = registered + 1,
            include_content,
            "Created watcher"
        );
        Ok((info, event_rx))
    }

    /// Returns a watcher's current state.
    pub fn get(&self, id: &str) -> Result<WatcherInfo, WatcherError> {
        self.watchers
            .get(id)
            .map(|entry| entry.value().info())
            .ok_or_else(|| WatcherError::NotFound(id.to_string()))
    }

    /// Lists all watchers, oldest first.
    pub fn list(&self) -> Vec<WatcherInfo> {
        let mut watchers: Vec<WatcherInfo> =
            self.watchers.iter().map(|entry| entry.value().info()).collect();
        watchers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        watchers
    }

    /// Returns the number of registered watchers.
    pub fn count(&self) -> usize {
        self.watchers.len()
    }

    /// Returns the registered watcher IDs.
    pub fn ids(&self) -> Vec<String> {
        self.watchers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Stops and removes a watcher.
    ///
    /// Cancels the worker, then closes the native watch, then waits for the
    /// worker to drop the event sender. The receiver sees end-of-stream.
    pub async fn delete(&self, id: &str) -> Result<(), WatcherError> {
        let (_, handle) = self
            .watchers
            .remove(id)
            .ok_or_else(|| WatcherError::NotFound(id.to_string()))?;
        self.slots.fetch_sub(1, Ordering::SeqCst);

        handle.token.cancel();
        handle
            .native
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let mut task = handle.task;
        if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut task).await.is_err() {
            tracing::warn!(watcher_id = %id, "Watcher task did not stop in time, aborting");
            task.abort();
        }

        tracing::info!(watcher_id = %id, "Deleted watcher");
        Ok(())
    }

    /// Deletes every watcher.
    pub async fn shutdown(&self) {
        for id in self.ids() {
            if let Err(e) = self.delete(&id).await {
                tracing::debug!(watcher_id = %id, error = %e, "Watcher already gone");
            }
        }
    }
}

/// Maps a native event kind onto a change type. Anything else is dropped.
pub fn classify(kind: &EventKind) -> Option<FileChangeKind> {
    match kind {
        EventKind::Create(_) => Some(FileChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(_)) => Some(FileChangeKind::Renamed),
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            Some(FileChangeKind::Modified)
        }
        EventKind::Remove(_) => Some(FileChangeKind::Deleted),
        _ => None,
    }
}

/// Registers a non-recursive watch on every non-ignored directory below
/// `root`. Ignored directories are not descended into.
fn register_tree(
    native: &mut RecommendedWatcher,
    root: &Path,
    matcher: &IgnoreMatcher,
    include_root: bool,
) -> usize {
    let mut registered = 0;
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !matcher.is_ignored(entry.path()));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_dir() || (entry.depth() == 0 && !include_root) {
            continue;
        }
        match native.watch(entry.path(), RecursiveMode::NonRecursive) {
            Ok(()) => registered += 1,
            Err(e) => tracing::debug!(
                path = %entry.path().display(),
                error = %e,
                "Failed to watch directory"
            ),
        }
    }
    registered
}

struct EventWorker {
    id: String,
    matcher: Arc<IgnoreMatcher>,
    include_content: bool,
    settle_delay: Duration,
    native: SharedWatcher,
    events: mpsc::Sender<FileChange>,
}

impl EventWorker {
    async fn run(
        self,
        mut raw: mpsc::Receiver<notify::Result<Event>>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                incoming = raw.recv() => match incoming {
                    Some(Ok(event)) => {
                        if !self.process(event, &token).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(watcher_id = %self.id, error = %e, "Native watcher error");
                    }
                    None => break,
                },
            }
        }
        tracing::debug!(watcher_id = %self.id, "Watcher task stopped");
    }

    /// Returns false once the event receiver is gone or the task is cancelled.
    async fn process(&self, event: Event, token: &CancellationToken) -> bool {
        let Some(kind) = classify(&event.kind) else {
            return true;
        };

        for path in event.paths {
            if self.matcher.is_ignored(&path) {
                continue;
            }

            let is_dir = match kind {
                FileChangeKind::Deleted => matches!(event.kind, EventKind::Remove(RemoveKind::Folder)),
                _ => tokio::fs::metadata(&path)
                    .await
                    .map(|m| m.is_dir())
                    .unwrap_or(false),
            };

            if is_dir && kind == FileChangeKind::Created {
                self.register_new_directory(&path).await;
            }

            let content = if self.include_content && !is_dir && kind.carries_content() {
                if !self.settle(token).await {
                    return false;
                }
                read_content(&path).await
            } else {
                None
            };

            let change = FileChange {
                watcher_id: self.id.clone(),
                path: path.to_string_lossy().into_owned(),
                kind,
                is_dir,
                content,
                timestamp: Utc::now(),
            };

            match self.events.try_send(change) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(change)) => {
                    tracing::debug!(
                        watcher_id = %self.id,
                        path = %change.path,
                        "Event buffer full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
            }
        }
        true
    }

    async fn settle(&self, token: &CancellationToken) -> bool {
        if self.settle_delay.is_zero() {
            return true;
        }
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(self.settle_delay) => true,
        }
    }

    async fn register_new_directory(&self, path: &Path) {
        let native = Arc::clone(&self.native);
        let matcher = Arc::clone(&self.matcher);
        let dir = path.to_path_buf();

        let registered = tokio::task::spawn_blocking(move || {
            let mut native = native
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            native
                .as_mut()
                .map(|native| register_tree(native, &dir, &matcher, true))
        })
        .await;

        match registered {
            Ok(Some(registered)) => tracing::debug!(
                watcher_id = %self.id,
                path = %path.display(),
                registered,
                "Registered new directory"
            ),
            Ok(None) => {}
            Err(e) => tracing::warn!(
                watcher_id = %self.id,
                path = %path.display(),
                error = %e,
                "Directory registration task failed"
            ),
        }
    }
}

async fn read_content(path: &Path) -> Option<String> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            tracing::trace!(path = %path.display(), error = %e, "Content capture failed");
            None
        }
    }
}
