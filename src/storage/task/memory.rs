use std::collections::HashMap;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::TaskStorage;
use crate::error::{Result, TaskError};
use crate::schedule::types::{Task, TaskFilter, TaskStatus};
use crate::web::Pagination;

/// Process-local store, used by tests and ephemeral deployments.
#[derive(Default)]
pub struct InMemoryTaskStorage {
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl InMemoryTaskStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Task>> {
        self.tasks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Task>> {
        self.tasks.write().unwrap_or_else(|e| e.into_inner())
    }

    fn collect_sorted<F>(&self, predicate: F) -> Vec<Task>
    where
        F: Fn(&Task) -> bool,
    {
        let mut tasks: Vec<Task> = self.read().values().filter(|t| predicate(t)).cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        tasks
    }

    fn is_expired_terminal(task: &Task, cutoff: DateTime<Utc>) -> bool {
        matches!(task.status, TaskStatus::Completed | TaskStatus::Failed)
            && task.completed_at.is_some_and(|at| at < cutoff)
    }
}

#[async_trait]
impl TaskStorage for InMemoryTaskStorage {
    async fn insert(&self, task: &Task) -> Result<()> {
        let mut tasks = self.write();
        if tasks.contains_key(&task.id) {
            return Err(TaskError::Storage(format!("duplicate task id {}", task.id)));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(self.read().get(&id).cloned())
    }

    async fn compare_and_save(&self, task: &Task, expected: TaskStatus) -> Result<bool> {
        let mut tasks = self.write();
        match tasks.get_mut(&task.id) {
            Some(stored) if stored.status == expected => {
                let created_at = stored.created_at;
                *stored = task.clone();
                stored.created_at = created_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_progress(
        &self,
        id: Uuid,
        percentage: u8,
        message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let percentage = percentage.min(100);
        let mut tasks = self.write();
        match tasks.get_mut(&id) {
            Some(task)
                if task.status == TaskStatus::Running && task.progress_percentage <= percentage =>
            {
                task.progress_percentage = percentage;
                if let Some(message) = message {
                    task.progress_message = Some(message.to_string());
                }
                task.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut tasks = self.write();
        match tasks.get_mut(&id) {
            Some(task)
                if task.status == TaskStatus::Running
                    && task.last_heartbeat.map_or(true, |previous| previous <= at) =>
            {
                task.last_heartbeat = Some(at);
                task.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self, filter: &TaskFilter, pagination: &Pagination) -> Result<Vec<Task>> {
        let pagination = pagination.check();
        Ok(self
            .collect_sorted(|task| filter.matches(task))
            .into_iter()
            .skip(pagination.offset() as usize)
            .take(pagination.limit() as usize)
            .collect())
    }

    async fn find_dispatchable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        let mut due: Vec<Task> = self.read().values().filter(|t| t.is_due(now)).cloned().collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn find_stuck(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        Ok(self.collect_sorted(|task| {
            task.status == TaskStatus::Running && task.last_heartbeat.map_or(true, |hb| hb < cutoff)
        }))
    }

    async fn find_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        Ok(self.collect_sorted(|task| Self::is_expired_terminal(task, cutoff)))
    }

    async fn count_by_status(&self) -> Result<HashMap<TaskStatus, u64>> {
        let mut counts = HashMap::new();
        for task in self.read().values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.write().remove(&id).is_some())
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tasks = self.write();
        let before = tasks.len();
        tasks.retain(|_, task| !Self::is_expired_terminal(task, cutoff));
        Ok((before - tasks.len()) as u64)
    }

    async fn backup(&self, destination: &Path) -> Result<u64> {
        let snapshot = self.collect_sorted(|_| true);
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(destination, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn optimize(&self) -> Result<()> {
        self.write().shrink_to_fit();
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
