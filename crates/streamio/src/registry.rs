//! # Task Registry
//!
//! Collapses concurrent requests for the same resource onto a single
//! transfer. Every entry carries a reference count and an effective
//! priority; the whole acquire/release path runs under one lock because it
//! makes read-then-write decisions that must be atomic across callers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::FileStorage;
use crate::error::{DownloadError, Result};
use crate::resource::{ResolvedSource, ResourceDescriptor};
use crate::task::{LocalFileTask, RemoteTask, TransferTask};
use crate::transport::Transport;

/// Priority of a pending transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdmissionOutcome {
    /// The task is no longer registered; stop considering it.
    Missing,
    /// The task was already transferring.
    AlreadyRunning,
    /// Capacity was available and the task has been resumed.
    Started,
    /// No capacity at this priority; check again later.
    Deferred,
}

struct PendingTask {
    task: Arc<dyn TransferTask>,
    priority: TaskPriority,
    ref_count: usize,
}

/// Owner of all in-flight transfers, keyed by resource uid.
pub struct TaskRegistry {
    storage: Arc<FileStorage>,
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<String, PendingTask>>,
}

impl TaskRegistry {
    pub fn new(storage: Arc<FileStorage>, transport: Arc<dyn Transport>) -> Self {
        Self {
            storage,
            transport,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Return the transfer for `descriptor`, creating it if needed.
    ///
    /// An existing entry gains a reference and is promoted to the requested
    /// priority when higher. Otherwise the storage index is consulted first:
    /// an already-cached file short-circuits to a local read regardless of
    /// the descriptor's url. Only then is the url resolved into a fresh
    /// local or remote task.
    pub fn acquire(
        &self,
        descriptor: &ResourceDescriptor,
        priority: TaskPriority,
    ) -> Result<Arc<dyn TransferTask>> {
        let mut pending = self.pending.lock();

        if let Some(entry) = pending.get_mut(&descriptor.uid) {
            entry.ref_count += 1;
            if priority > entry.priority {
                debug!(
                    uid = %descriptor.uid,
                    from = ?entry.priority,
                    to = ?priority,
                    "promoting pending task priority"
                );
                entry.priority = priority;
            }
            return Ok(entry.task.clone());
        }

        if let Some(path) = self.storage.cached_path(&descriptor.uid) {
            // The index verified the file moments ago; a miss here means it
            // vanished in between, so fall through to normal resolution.
            if let Some(task) =
                LocalFileTask::new(&descriptor.uid, &path, descriptor.content_type.clone())
            {
                debug!(uid = %descriptor.uid, path = ?path, "serving from cached file");
                return Ok(Self::register(&mut pending, &descriptor.uid, task, priority));
            }
        }

        match descriptor.resolve()? {
            ResolvedSource::LocalFile(path) => {
                let task =
                    LocalFileTask::new(&descriptor.uid, &path, descriptor.content_type.clone())
                        .ok_or_else(|| DownloadError::ResourceMissing {
                            path: path.display().to_string(),
                            uid: descriptor.uid.clone(),
                        })?;
                debug!(uid = %descriptor.uid, path = ?path, "created local file task");
                Ok(Self::register(&mut pending, &descriptor.uid, task, priority))
            }
            ResolvedSource::Remote(url) => {
                let task = RemoteTask::new(
                    &descriptor.uid,
                    url,
                    descriptor.headers.clone(),
                    descriptor.content_type.clone(),
                    self.transport.clone(),
                );
                debug!(uid = %descriptor.uid, "created remote task");
                Ok(Self::register(&mut pending, &descriptor.uid, task, priority))
            }
        }
    }

    fn register<T: TransferTask + 'static>(
        pending: &mut HashMap<String, PendingTask>,
        uid: &str,
        task: T,
        priority: TaskPriority,
    ) -> Arc<dyn TransferTask> {
        let task: Arc<dyn TransferTask> = Arc::new(task);
        pending.insert(
            uid.to_string(),
            PendingTask {
                task: task.clone(),
                priority,
                ref_count: 1,
            },
        );
        task
    }

    /// Drop one reference to `uid`. When the last reference goes away, or
    /// when `force` is set (consumer error or abandonment), the underlying
    /// transfer is canceled and the entry removed.
    pub fn release(&self, uid: &str, force: bool) {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(uid) else {
            return;
        };

        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count == 0 || force {
            entry.task.cancel();
            pending.remove(uid);
            debug!(uid = %uid, force = force, "disposed pending task");
        }
    }

    /// One admission pass for `uid`: resume it when fewer than `limit`
    /// currently-transferring tasks have a priority at or above its own.
    pub(crate) fn try_admit(&self, uid: &str, limit: usize) -> AdmissionOutcome {
        let pending = self.pending.lock();
        let Some(entry) = pending.get(uid) else {
            return AdmissionOutcome::Missing;
        };
        if entry.task.is_resumed() {
            return AdmissionOutcome::AlreadyRunning;
        }

        let running = pending
            .values()
            .filter(|p| p.task.is_resumed() && p.priority >= entry.priority)
            .count();
        if running < limit {
            entry.task.resume();
            debug!(uid = %uid, running = running, "task admitted");
            AdmissionOutcome::Started
        } else {
            AdmissionOutcome::Deferred
        }
    }

    /// Number of registered transfers.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn ref_count(&self, uid: &str) -> Option<usize> {
        self.pending.lock().get(uid).map(|p| p.ref_count)
    }

    pub fn priority(&self, uid: &str) -> Option<TaskPriority> {
        self.pending.lock().get(uid).map(|p| p.priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StorageConfig;
    use crate::transport::testing::{FakeTransport, success_script};

    fn registry_with(transport: Arc<FakeTransport>) -> (tempfile::TempDir, TaskRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            FileStorage::new(StorageConfig {
                root: dir.path().to_path_buf(),
                persist_index: false,
            })
            .unwrap(),
        );
        (dir, TaskRegistry::new(storage, transport))
    }

    fn held_transport() -> Arc<FakeTransport> {
        Arc::new(FakeTransport::new(vec![]).with_hold_open())
    }

    #[tokio::test]
    async fn test_acquire_deduplicates_same_identity() {
        let (_dir, registry) = registry_with(held_transport());
        let descriptor = ResourceDescriptor::from_url("https://x/y.mp3");

        let a = registry.acquire(&descriptor, TaskPriority::Normal).unwrap();
        let b = registry.acquire(&descriptor, TaskPriority::Normal).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.pending_count(), 1);
        assert_eq!(registry.ref_count("https://x/y.mp3"), Some(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquires_create_one_transfer() {
        let transport = held_transport();
        let (_dir, registry) = registry_with(transport.clone());
        let registry = Arc::new(registry);
        let descriptor = ResourceDescriptor::from_url("https://x/y.mp3");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let descriptor = descriptor.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                registry.acquire(&descriptor, TaskPriority::Normal).unwrap()
            }));
        }
        let tasks: Vec<_> = futures::future::try_join_all(handles).await.unwrap();

        assert_eq!(registry.pending_count(), 1);
        assert_eq!(registry.ref_count("https://x/y.mp3"), Some(16));
        assert!(tasks.iter().all(|t| Arc::ptr_eq(t, &tasks[0])));

        // One admission pass later, exactly one underlying fetch runs.
        registry.try_admit("https://x/y.mp3", 1);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(transport.start_count(), 1);
    }

    #[tokio::test]
    async fn test_priority_promotes_and_never_decreases() {
        let (_dir, registry) = registry_with(held_transport());
        let descriptor = ResourceDescriptor::from_url("https://x/y.mp3");

        registry.acquire(&descriptor, TaskPriority::Normal).unwrap();
        assert_eq!(registry.priority("https://x/y.mp3"), Some(TaskPriority::Normal));

        registry.acquire(&descriptor, TaskPriority::High).unwrap();
        assert_eq!(registry.priority("https://x/y.mp3"), Some(TaskPriority::High));

        registry.acquire(&descriptor, TaskPriority::Low).unwrap();
        assert_eq!(registry.priority("https://x/y.mp3"), Some(TaskPriority::High));
        assert_eq!(registry.ref_count("https://x/y.mp3"), Some(3));
    }

    #[tokio::test]
    async fn test_release_disposes_on_last_reference() {
        let (_dir, registry) = registry_with(held_transport());
        let descriptor = ResourceDescriptor::from_url("https://x/y.mp3");

        for _ in 0..3 {
            registry.acquire(&descriptor, TaskPriority::Normal).unwrap();
        }

        registry.release("https://x/y.mp3", false);
        registry.release("https://x/y.mp3", false);
        assert_eq!(registry.pending_count(), 1);

        registry.release("https://x/y.mp3", false);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_forced_release_disposes_immediately() {
        let (_dir, registry) = registry_with(held_transport());
        let descriptor = ResourceDescriptor::from_url("https://x/y.mp3");

        registry.acquire(&descriptor, TaskPriority::Normal).unwrap();
        registry.acquire(&descriptor, TaskPriority::Normal).unwrap();

        registry.release("https://x/y.mp3", true);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_disposed_task_priority_resets_on_recreation() {
        let (_dir, registry) = registry_with(held_transport());
        let descriptor = ResourceDescriptor::from_url("https://x/y.mp3");

        registry.acquire(&descriptor, TaskPriority::High).unwrap();
        registry.release("https://x/y.mp3", false);

        registry.acquire(&descriptor, TaskPriority::Low).unwrap();
        assert_eq!(registry.priority("https://x/y.mp3"), Some(TaskPriority::Low));
    }

    #[tokio::test]
    async fn test_unsupported_scheme_never_enters_registry() {
        let (_dir, registry) = registry_with(held_transport());
        let descriptor = ResourceDescriptor::from_url("ftp://x/y.mp3");

        let result = registry.acquire(&descriptor, TaskPriority::Normal);
        assert!(matches!(
            result,
            Err(DownloadError::UnsupportedScheme { .. })
        ));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cached_file_short_circuits_to_local_task() {
        let transport = Arc::new(FakeTransport::new(success_script(None, &[b"x"])));
        let (_dir, registry) = registry_with(transport.clone());

        // Prime the storage with a completed download.
        let provider = crate::cache::CacheProvider::new("track-9", None);
        provider.append_data(b"cached bytes");
        provider.finalize();
        registry.storage.save_to_temp(&provider).await.unwrap();

        let descriptor = ResourceDescriptor::new("track-9", "https://x/track-9.mp3");
        let task = registry.acquire(&descriptor, TaskPriority::Normal).unwrap();
        task.resume();

        use futures::StreamExt;
        let mut events = task.events();
        let mut data = None;
        while let Some(event) = events.next().await {
            match event {
                crate::events::TransferEvent::DataAppended(p) => data = Some(p.current_data()),
                e if e.is_terminal() => break,
                _ => {}
            }
        }

        assert_eq!(data.unwrap().as_ref(), b"cached bytes");
        assert_eq!(transport.start_count(), 0);
    }
}
