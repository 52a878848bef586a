//! # Admission Control
//!
//! Limits how many transfers run at once. A task that cannot start right
//! away is rechecked on a fixed interval until it is admitted or leaves the
//! registry. Slots free up when a running task completes, fails, or is
//! canceled; nothing is preempted to make room.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::registry::{AdmissionOutcome, TaskRegistry};

/// Configuration for the [`AdmissionController`].
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Maximum number of simultaneously transferring tasks. Zero is coerced
    /// to one.
    pub simultaneous_tasks: usize,
    /// How often deferred tasks are rechecked. Non-positive values are
    /// coerced to one second.
    pub check_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            simultaneous_tasks: 1,
            check_interval: Duration::from_secs(5),
        }
    }
}

impl AdmissionConfig {
    fn effective_limit(&self) -> usize {
        self.simultaneous_tasks.max(1)
    }

    fn effective_interval(&self) -> Duration {
        if self.check_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.check_interval
        }
    }
}

/// Decides when registered tasks may start transferring.
pub struct AdmissionController {
    registry: Arc<TaskRegistry>,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(registry: Arc<TaskRegistry>, config: AdmissionConfig) -> Self {
        Self { registry, config }
    }

    /// Drive `uid` through admission: try immediately, then keep rechecking
    /// on the configured interval while the task stays deferred. Returns
    /// once the task started, was already running, or left the registry.
    pub async fn admit(&self, uid: &str) {
        let limit = self.config.effective_limit();

        match self.registry.try_admit(uid, limit) {
            AdmissionOutcome::Deferred => {}
            outcome => {
                trace!(uid = %uid, outcome = ?outcome, "admission settled immediately");
                return;
            }
        }

        debug!(uid = %uid, "task deferred, entering recheck loop");
        let mut interval = tokio::time::interval(self.config.effective_interval());
        // The first tick fires immediately and would duplicate the check
        // above.
        interval.tick().await;

        loop {
            interval.tick().await;
            match self.registry.try_admit(uid, limit) {
                AdmissionOutcome::Deferred => continue,
                outcome => {
                    debug!(uid = %uid, outcome = ?outcome, "admission settled");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FileStorage, StorageConfig};
    use crate::registry::TaskPriority;
    use crate::resource::ResourceDescriptor;
    use crate::transport::testing::FakeTransport;

    fn controller(
        limit: usize,
        interval: Duration,
    ) -> (tempfile::TempDir, Arc<TaskRegistry>, AdmissionController) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            FileStorage::new(StorageConfig {
                root: dir.path().to_path_buf(),
                persist_index: false,
            })
            .unwrap(),
        );
        let transport = Arc::new(FakeTransport::new(vec![]).with_hold_open());
        let registry = Arc::new(TaskRegistry::new(storage, transport));
        let controller = AdmissionController::new(
            registry.clone(),
            AdmissionConfig {
                simultaneous_tasks: limit,
                check_interval: interval,
            },
        );
        (dir, registry, controller)
    }

    #[tokio::test]
    async fn test_first_task_starts_immediately() {
        let (_dir, registry, controller) = controller(1, Duration::from_millis(10));
        let descriptor = ResourceDescriptor::from_url("https://x/a.mp3");
        let task = registry.acquire(&descriptor, TaskPriority::Normal).unwrap();

        controller.admit("https://x/a.mp3").await;
        assert!(task.is_resumed());
    }

    #[tokio::test]
    async fn test_second_task_waits_for_free_slot() {
        let (_dir, registry, controller) = controller(1, Duration::from_millis(10));
        let first = ResourceDescriptor::from_url("https://x/a.mp3");
        let second = ResourceDescriptor::from_url("https://x/b.mp3");

        let running = registry.acquire(&first, TaskPriority::Normal).unwrap();
        let waiting = registry.acquire(&second, TaskPriority::Normal).unwrap();
        controller.admit("https://x/a.mp3").await;

        let admit = tokio::spawn(async move { controller.admit("https://x/b.mp3").await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiting.is_resumed());

        // Canceling the running task frees the slot within one recheck.
        running.cancel();
        tokio::time::timeout(Duration::from_secs(1), admit)
            .await
            .unwrap()
            .unwrap();
        assert!(waiting.is_resumed());
    }

    #[tokio::test]
    async fn test_released_task_stops_being_rechecked() {
        let (_dir, registry, controller) = controller(1, Duration::from_millis(10));
        let first = ResourceDescriptor::from_url("https://x/a.mp3");
        let second = ResourceDescriptor::from_url("https://x/b.mp3");

        registry.acquire(&first, TaskPriority::Normal).unwrap();
        registry.acquire(&second, TaskPriority::Normal).unwrap();
        controller.admit("https://x/a.mp3").await;

        registry.release("https://x/b.mp3", true);

        // Returns promptly because the registry no longer knows the uid.
        tokio::time::timeout(Duration::from_secs(1), controller.admit("https://x/b.mp3"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_limit_still_admits_one() {
        let (_dir, registry, controller) = controller(0, Duration::from_millis(10));
        let descriptor = ResourceDescriptor::from_url("https://x/a.mp3");
        let task = registry.acquire(&descriptor, TaskPriority::Normal).unwrap();

        controller.admit("https://x/a.mp3").await;
        assert!(task.is_resumed());
    }

    #[tokio::test]
    async fn test_higher_priority_is_not_blocked_by_lower() {
        let (_dir, registry, controller) = controller(1, Duration::from_millis(10));
        let low = ResourceDescriptor::from_url("https://x/a.mp3");
        let high = ResourceDescriptor::from_url("https://x/b.mp3");

        registry.acquire(&low, TaskPriority::Low).unwrap();
        let urgent = registry.acquire(&high, TaskPriority::High).unwrap();
        controller.admit("https://x/a.mp3").await;

        // Only same-or-higher priority transfers count against the limit.
        controller.admit("https://x/b.mp3").await;
        assert!(urgent.is_resumed());
    }
}
