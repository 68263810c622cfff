use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::schedule::broadcast::TaskBroadcaster;
use crate::schedule::types::Task;
use crate::storage::task::TaskStorage;
use crate::utils::clock::Clock;

/// Returned by [`TaskContext::checkpoint`] once cancellation was requested.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("task cancelled")]
pub struct Cancelled;

struct ContextInner {
    snapshot: Mutex<Task>,
    storage: Arc<dyn TaskStorage>,
    broadcaster: Arc<TaskBroadcaster>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    limiter: DefaultDirectRateLimiter,
}

/// Handle an execution body uses to report progress and observe cancellation.
///
/// Cheap to clone. A context made with [`TaskContext::slice`] maps 0..=100 onto
/// a sub-range of its parent, so nested jobs of a batch can report progress
/// without knowing about each other.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
    low: u8,
    high: u8,
}

impl TaskContext {
    pub fn new(
        task: Task,
        storage: Arc<dyn TaskStorage>,
        broadcaster: Arc<TaskBroadcaster>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
        progress_events_per_sec: u32,
    ) -> Self {
        let rate = NonZeroU32::new(progress_events_per_sec).unwrap_or(NonZeroU32::MIN);
        Self {
            inner: Arc::new(ContextInner {
                snapshot: Mutex::new(task),
                storage,
                broadcaster,
                clock,
                cancel,
                limiter: RateLimiter::direct(Quota::per_second(rate)),
            }),
            low: 0,
            high: 100,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Task> {
        self.inner.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn task_id(&self) -> Uuid {
        self.lock().id
    }

    /// Latest in-memory view of the task, including unpersisted progress.
    pub fn snapshot(&self) -> Task {
        self.lock().clone()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Call at loop boundaries and before spawning tools.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Sub-context covering `from..=to` percent of this context's range.
    pub fn slice(&self, from: u8, to: u8) -> TaskContext {
        let from = from.min(100);
        let to = to.clamp(from, 100);
        TaskContext {
            inner: self.inner.clone(),
            low: self.scale(from),
            high: self.scale(to),
        }
    }

    fn scale(&self, percentage: u8) -> u8 {
        let span = u32::from(self.high - self.low);
        let scaled = u32::from(self.low) + span * u32::from(percentage.min(100)) / 100;
        scaled as u8
    }

    /// Records progress within this context's range. Persisted on every change;
    /// the broadcast is rate limited. Lower values than already reported are
    /// ignored.
    pub async fn progress(&self, percentage: u8, message: impl Into<String>) {
        let absolute = self.scale(percentage);
        let message = message.into();
        let now = self.now();

        let (changed, snapshot) = {
            let mut task = self.lock();
            let changed = task.record_progress(absolute, Some(message.clone()), now);
            (changed, task.clone())
        };
        if !changed {
            return;
        }

        if let Err(e) = self
            .inner
            .storage
            .update_progress(snapshot.id, snapshot.progress_percentage, Some(&message), now)
            .await
        {
            warn!(task_id = %snapshot.id, "Failed to persist progress: {}", e);
        }

        if self.inner.limiter.check().is_ok() {
            self.inner.broadcaster.publish(&snapshot);
        }
    }

    /// Refreshes the lease. The executor calls this on its own interval, so
    /// bodies only need it inside long silent stretches.
    pub async fn heartbeat(&self) {
        let now = self.now();
        let id = {
            let mut task = self.lock();
            task.record_heartbeat(now);
            task.id
        };
        match self.inner.storage.touch_heartbeat(id, now).await {
            Ok(true) => {}
            Ok(false) => warn!(task_id = %id, "Heartbeat not recorded, task no longer running"),
            Err(e) => warn!(task_id = %id, "Failed to persist heartbeat: {}", e),
        }
    }
}
