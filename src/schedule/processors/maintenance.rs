use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use super::{unexpected_params, TaskProcessor};
use crate::schedule::executor::TaskContext;
use crate::schedule::types::{BackupResult, OptimizeResult, TaskParams, TaskResult, TaskType};
use crate::storage::task::TaskStorage;

const BACKUP_PREFIX: &str = "tasks-";
const BACKUP_SUFFIX: &str = ".db";

/// Snapshots the task database into a timestamped file and rotates old ones.
pub struct BackupProcessor {
    storage: Arc<dyn TaskStorage>,
    backup_dir: PathBuf,
}

impl BackupProcessor {
    pub fn new(storage: Arc<dyn TaskStorage>, backup_dir: PathBuf) -> Self {
        Self {
            storage,
            backup_dir,
        }
    }
}

/// Backups in `dir`, newest first. Names embed the timestamp so lexical order
/// is chronological.
async fn existing_backups(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut backups = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(BACKUP_PREFIX) && name.ends_with(BACKUP_SUFFIX) {
            backups.push(entry.path());
        }
    }
    backups.sort();
    backups.reverse();
    Ok(backups)
}

#[async_trait]
impl TaskProcessor for BackupProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::BackupDatabase
    }

    async fn process(&self, ctx: TaskContext, params: TaskParams) -> Result<TaskResult> {
        let params = match params {
            TaskParams::BackupDatabase(p) => p,
            other => return Err(unexpected_params(self.task_type(), &other)),
        };
        let dir = params
            .destination_dir
            .unwrap_or_else(|| self.backup_dir.clone());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let name = format!(
            "{}{}{}",
            BACKUP_PREFIX,
            ctx.now().format("%Y%m%d-%H%M%S%3f"),
            BACKUP_SUFFIX
        );
        let path = dir.join(name);

        ctx.checkpoint()?;
        ctx.progress(10, "Writing database snapshot").await;
        let size_bytes = self
            .storage
            .backup(&path)
            .await
            .with_context(|| format!("backing up to {}", path.display()))?;
        ctx.progress(80, "Snapshot written").await;

        let mut rotated = Vec::new();
        if let Some(keep_last) = params.keep_last {
            for old in existing_backups(&dir).await?.into_iter().skip(keep_last) {
                match tokio::fs::remove_file(&old).await {
                    Ok(()) => rotated.push(old),
                    Err(e) => warn!("Failed to rotate backup {}: {}", old.display(), e),
                }
            }
        }
        ctx.progress(100, "Backup finished").await;

        info!(
            "Database backed up to {} ({} bytes, {} rotated)",
            path.display(),
            size_bytes,
            rotated.len()
        );
        Ok(TaskResult::BackupDatabase(BackupResult {
            path,
            size_bytes,
            rotated,
        }))
    }
}

pub struct OptimizeProcessor {
    storage: Arc<dyn TaskStorage>,
}

impl OptimizeProcessor {
    pub fn new(storage: Arc<dyn TaskStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl TaskProcessor for OptimizeProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::OptimizeDatabase
    }

    async fn process(&self, ctx: TaskContext, params: TaskParams) -> Result<TaskResult> {
        if !matches!(params, TaskParams::OptimizeDatabase(_)) {
            return Err(unexpected_params(self.task_type(), &params));
        }
        ctx.checkpoint()?;
        ctx.progress(10, "Optimizing database").await;
        let started = Instant::now();
        self.storage.optimize().await.context("optimizing database")?;
        let duration_ms = started.elapsed().as_millis() as u64;
        ctx.progress(100, "Database optimized").await;

        info!("Database optimized in {}ms", duration_ms);
        Ok(TaskResult::OptimizeDatabase(OptimizeResult { duration_ms }))
    }
}
