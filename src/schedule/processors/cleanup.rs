use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use super::{has_extension, normalize_extensions, unexpected_params, TaskProcessor};
use crate::schedule::executor::TaskContext;
use crate::schedule::types::{CleanupParams, CleanupResult, TaskParams, TaskResult, TaskType};

/// Removes leftover files (temporary extracts, stale subtitles) by extension
/// and optional age.
pub struct CleanupProcessor;

struct Candidate {
    path: PathBuf,
    size: u64,
}

async fn collect(
    ctx: &TaskContext,
    root: &Path,
    extensions: &[String],
    cutoff: Option<DateTime<Utc>>,
) -> Result<Vec<Candidate>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        ctx.checkpoint()?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if dir != root => {
                warn!("Skipping unreadable directory {}: {}", dir.display(), e);
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", dir.display())),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                pending.push(path);
                continue;
            }
            if !metadata.is_file() || !has_extension(&path, extensions) {
                continue;
            }
            if let Some(cutoff) = cutoff {
                let modified: DateTime<Utc> = metadata.modified()?.into();
                if modified >= cutoff {
                    continue;
                }
            }
            found.push(Candidate {
                path,
                size: metadata.len(),
            });
        }
    }
    found.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(found)
}

#[async_trait]
impl TaskProcessor for CleanupProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::CleanupFiles
    }

    async fn process(&self, ctx: TaskContext, params: TaskParams) -> Result<TaskResult> {
        let params: CleanupParams = match params {
            TaskParams::CleanupFiles(p) => p,
            other => return Err(unexpected_params(self.task_type(), &other)),
        };
        let extensions = normalize_extensions(&params.extensions);
        let cutoff = params
            .older_than_days
            .map(|days| ctx.now() - Duration::days(i64::from(days)));

        let mut result = CleanupResult {
            dry_run: params.dry_run,
            ..Default::default()
        };
        let total = params.directories.len();
        for (index, dir) in params.directories.iter().enumerate() {
            if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
                warn!("Cleanup directory does not exist: {}", dir.display());
                continue;
            }
            for candidate in collect(&ctx, dir, &extensions, cutoff).await? {
                ctx.checkpoint()?;
                if params.dry_run {
                    debug!("Would remove {}", candidate.path.display());
                } else if let Err(e) = tokio::fs::remove_file(&candidate.path).await {
                    warn!("Failed to remove {}: {}", candidate.path.display(), e);
                    continue;
                }
                result.bytes_freed += candidate.size;
                result.removed.push(candidate.path);
            }
            let percentage = ((index + 1) * 100 / total.max(1)) as u8;
            ctx.progress(percentage, format!("Cleaned {}", dir.display())).await;
        }

        info!(
            "Cleanup {}: {} files, {} bytes",
            if params.dry_run { "preview" } else { "finished" },
            result.removed.len(),
            result.bytes_freed
        );
        Ok(TaskResult::CleanupFiles(result))
    }
}
