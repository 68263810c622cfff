use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::schedule::types::{Task, TaskFilter, TaskStatus};
use crate::web::Pagination;

pub mod entity;
pub mod mapping;
pub mod memory;
pub mod sqlite;

/// Durable record of tasks.
///
/// Callers stamp `updated_at` and every other timestamp; implementations never
/// read the wall clock. Status writes go through [`TaskStorage::compare_and_save`]
/// so that racing writers (a heartbeat against a cancel, two sweeps) cannot
/// overwrite a status they did not observe.
#[async_trait]
pub trait TaskStorage: Send + Sync + 'static {
    async fn insert(&self, task: &Task) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Task>>;

    /// Writes every mutable field of `task` only if the stored status is still
    /// `expected`. Returns false when the row is gone or has moved on.
    async fn compare_and_save(&self, task: &Task, expected: TaskStatus) -> Result<bool>;

    /// Progress write for a RUNNING task. The stored percentage never decreases.
    async fn update_progress(
        &self,
        id: Uuid,
        percentage: u8,
        message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Refreshes `last_heartbeat` of a RUNNING task, never moving it backwards.
    async fn touch_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    /// Filtered page, newest first.
    async fn list(&self, filter: &TaskFilter, pagination: &Pagination) -> Result<Vec<Task>>;

    /// PENDING tasks and SCHEDULED tasks that are due, ordered by priority
    /// (highest first) then creation time ascending.
    async fn find_dispatchable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>>;

    /// RUNNING tasks whose heartbeat is missing or older than `cutoff`.
    async fn find_stuck(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>>;

    /// COMPLETED or FAILED tasks that finished before `cutoff`.
    async fn find_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>>;

    async fn count_by_status(&self) -> Result<HashMap<TaskStatus, u64>>;

    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Writes a consistent snapshot of the store to `destination` and returns
    /// its size in bytes.
    async fn backup(&self, destination: &Path) -> Result<u64>;

    async fn optimize(&self) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}
