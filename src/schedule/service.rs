use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, TaskError};
use crate::schedule::broadcast::{TaskBroadcaster, TaskStream};
use crate::schedule::executor::TaskExecutor;
use crate::schedule::scheduler::{CancelOutcome, DispatchOutcome, TaskScheduler};
use crate::schedule::types::{NewTask, Task, TaskFilter, TaskStatus};
use crate::storage::task::TaskStorage;
use crate::utils::clock::Clock;
use crate::web::Pagination;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStats {
    pub counts: HashMap<TaskStatus, u64>,
    pub total: u64,
    pub in_flight: usize,
}

/// Entry point for callers outside the scheduling core: HTTP handlers,
/// recurring triggers, the binary.
pub struct TaskService {
    storage: Arc<dyn TaskStorage>,
    executor: Arc<TaskExecutor>,
    scheduler: Arc<TaskScheduler>,
    broadcaster: Arc<TaskBroadcaster>,
    clock: Arc<dyn Clock>,
}

impl TaskService {
    pub fn new(
        storage: Arc<dyn TaskStorage>,
        executor: Arc<TaskExecutor>,
        scheduler: Arc<TaskScheduler>,
        broadcaster: Arc<TaskBroadcaster>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            executor,
            scheduler,
            broadcaster,
            clock,
        }
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn broadcaster(&self) -> &Arc<TaskBroadcaster> {
        &self.broadcaster
    }

    fn dispatch(&self, task: &Task) {
        match self.scheduler.schedule(task) {
            Ok(DispatchOutcome::Started) => {}
            Ok(outcome) => debug!(task_id = %task.id, ?outcome, "Task queued"),
            // stays in its persisted status for the dispatch loop
            Err(e) => warn!(task_id = %task.id, "Failed to dispatch task: {}", e),
        }
    }

    /// Validates, persists and dispatches a task. The returned snapshot is the
    /// task as created (PENDING, or SCHEDULED when `scheduled_for` is in the future).
    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        self.executor.validate(&new.params)?;
        let task = Task::new(
            new,
            self.clock.now(),
            self.executor.config().default_max_retries,
        );
        self.storage.insert(&task).await?;
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = ?task.priority,
            status = %task.status,
            "Task created"
        );
        self.broadcaster.publish(&task);
        self.dispatch(&task);
        Ok(task)
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.storage.get(id).await?.ok_or(TaskError::NotFound(id))
    }

    pub async fn list_tasks(&self, filter: &TaskFilter, pagination: &Pagination) -> Result<Vec<Task>> {
        self.storage.list(filter, pagination).await
    }

    pub async fn statistics(&self) -> Result<TaskStats> {
        let stored = self.storage.count_by_status().await?;
        let counts: HashMap<TaskStatus, u64> = TaskStatus::ALL
            .iter()
            .map(|status| (*status, stored.get(status).copied().unwrap_or(0)))
            .collect();
        Ok(TaskStats {
            total: counts.values().sum(),
            counts,
            in_flight: self.scheduler.in_flight(),
        })
    }

    pub fn subscribe(&self) -> TaskStream {
        self.broadcaster.subscribe()
    }

    pub fn subscribe_where<F>(&self, predicate: F) -> TaskStream
    where
        F: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        self.broadcaster.subscribe_where(predicate)
    }

    pub async fn cancel_task(&self, id: Uuid) -> Result<CancelOutcome> {
        self.scheduler.cancel(id).await
    }

    /// FAILED back to PENDING, counting against `max_retries`.
    pub async fn retry_task(&self, id: Uuid) -> Result<Task> {
        let mut task = self.get_task(id).await?;
        task.retry(self.clock.now())?;
        if !self.storage.compare_and_save(&task, TaskStatus::Failed).await? {
            return Err(TaskError::Conflict(id));
        }
        info!(task_id = %id, attempt = task.retry_count + 1, "Task retried");
        self.broadcaster.publish(&task);
        self.dispatch(&task);
        Ok(task)
    }

    pub async fn pause_task(&self, id: Uuid) -> Result<Task> {
        let mut task = self.get_task(id).await?;
        let previous = task.status;
        task.pause(self.clock.now())?;
        if !self.storage.compare_and_save(&task, previous).await? {
            return Err(TaskError::Conflict(id));
        }
        info!(task_id = %id, "Task paused");
        self.broadcaster.publish(&task);
        Ok(task)
    }

    pub async fn resume_task(&self, id: Uuid) -> Result<Task> {
        let mut task = self.get_task(id).await?;
        task.resume(self.clock.now())?;
        if !self.storage.compare_and_save(&task, TaskStatus::Paused).await? {
            return Err(TaskError::Conflict(id));
        }
        info!(task_id = %id, "Task resumed");
        self.broadcaster.publish(&task);
        self.dispatch(&task);
        Ok(task)
    }

    /// On-demand retention: COMPLETED and FAILED tasks finished more than
    /// `age_days` ago.
    pub async fn cleanup_old_tasks(&self, age_days: u32) -> Result<u64> {
        let cutoff = self.clock.now() - Duration::days(i64::from(age_days));
        self.scheduler.purge_expired(cutoff).await
    }

    pub async fn recover_stuck_tasks(&self) -> Result<Vec<Uuid>> {
        self.scheduler.recover_stuck().await
    }
}
