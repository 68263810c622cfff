use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::{unexpected_params, TaskProcessor};
use crate::schedule::executor::TaskContext;
use crate::schedule::types::{ExportResult, Task, TaskFilter, TaskParams, TaskResult, TaskType};
use crate::storage::task::TaskStorage;
use crate::web::Pagination;

const PAGE_SIZE: u64 = 200;

#[derive(Serialize)]
struct UserExport<'a> {
    user: &'a str,
    exported_at: DateTime<Utc>,
    tasks: &'a [Task],
}

/// Dumps every task a user requested into one JSON document.
pub struct UserExportProcessor {
    storage: Arc<dyn TaskStorage>,
}

impl UserExportProcessor {
    pub fn new(storage: Arc<dyn TaskStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl TaskProcessor for UserExportProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::UserExport
    }

    async fn process(&self, ctx: TaskContext, params: TaskParams) -> Result<TaskResult> {
        let params = match params {
            TaskParams::UserExport(p) => p,
            other => return Err(unexpected_params(self.task_type(), &other)),
        };
        let own_id = ctx.task_id();
        let filter = TaskFilter {
            requested_by: Some(params.user.clone()),
            ..Default::default()
        };

        let mut tasks = Vec::new();
        let mut offset = 0;
        loop {
            ctx.checkpoint()?;
            let page = self
                .storage
                .list(&filter, &Pagination::new(PAGE_SIZE, offset))
                .await
                .context("listing tasks")?;
            let fetched = page.len() as u64;
            tasks.extend(page.into_iter().filter(|t| t.id != own_id));
            if fetched < PAGE_SIZE {
                break;
            }
            offset += fetched;
            ctx.progress(50, format!("Collected {} tasks", tasks.len())).await;
        }
        ctx.progress(60, format!("Collected {} tasks", tasks.len())).await;

        let document = serde_json::to_vec_pretty(&UserExport {
            user: &params.user,
            exported_at: ctx.now(),
            tasks: &tasks,
        })?;
        if let Some(parent) = params.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(&params.output_path, document)
            .await
            .with_context(|| format!("writing {}", params.output_path.display()))?;
        ctx.progress(100, "Export written").await;

        info!(
            "Exported {} tasks of {} to {}",
            tasks.len(),
            params.user,
            params.output_path.display()
        );
        Ok(TaskResult::UserExport(ExportResult {
            path: params.output_path,
            task_count: tasks.len(),
        }))
    }
}
