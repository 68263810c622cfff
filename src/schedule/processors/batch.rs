use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use super::{unexpected_params, TaskProcessor};
use crate::error::{self, TaskError};
use crate::schedule::executor::TaskContext;
use crate::schedule::types::{BatchFailure, BatchResult, TaskParams, TaskResult, TaskType};

/// Runs a list of jobs in order inside one task, each job reporting into its
/// own slice of the progress bar.
pub struct BatchProcessor {
    processors: HashMap<TaskType, Arc<dyn TaskProcessor>>,
}

impl BatchProcessor {
    pub fn new(processors: impl IntoIterator<Item = Arc<dyn TaskProcessor>>) -> Self {
        let processors = processors
            .into_iter()
            .filter(|p| p.task_type() != TaskType::BatchProcess)
            .map(|p| (p.task_type(), p))
            .collect();
        Self { processors }
    }

    fn processor(&self, task_type: TaskType) -> Option<&Arc<dyn TaskProcessor>> {
        self.processors.get(&task_type)
    }
}

#[async_trait]
impl TaskProcessor for BatchProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::BatchProcess
    }

    fn validate_params(&self, params: &TaskParams) -> error::Result<()> {
        let TaskParams::BatchProcess(batch) = params else {
            return Ok(());
        };
        for (index, job) in batch.jobs.iter().enumerate() {
            let processor = self.processor(job.task_type()).ok_or_else(|| {
                TaskError::Validation(format!(
                    "job {}: {} cannot run inside a batch",
                    index,
                    job.task_type()
                ))
            })?;
            processor.validate_params(job).map_err(|e| match e {
                TaskError::Validation(message) => {
                    TaskError::Validation(format!("job {}: {}", index, message))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    async fn process(&self, ctx: TaskContext, params: TaskParams) -> Result<TaskResult> {
        let batch = match params {
            TaskParams::BatchProcess(p) => p,
            other => return Err(unexpected_params(self.task_type(), &other)),
        };

        let total = batch.jobs.len();
        let mut result = BatchResult::default();
        for (index, job) in batch.jobs.into_iter().enumerate() {
            ctx.checkpoint()?;
            let task_type = job.task_type();
            let Some(processor) = self.processor(task_type).cloned() else {
                bail!("job {}: no processor for {}", index, task_type);
            };

            let from = (index * 100 / total) as u8;
            let to = ((index + 1) * 100 / total) as u8;
            match processor.process(ctx.slice(from, to), job).await {
                Ok(output) => {
                    result.succeeded += 1;
                    result.results.push(output);
                }
                Err(e) if ctx.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!("Batch job {} ({}) failed: {:#}", index, task_type, e);
                    if !batch.continue_on_error {
                        bail!("job {} ({}) failed: {:#}", index, task_type, e);
                    }
                    result.failures.push(BatchFailure {
                        index,
                        task_type,
                        error: format!("{:#}", e),
                    });
                }
            }
            ctx.progress(to, format!("Finished job {} of {}", index + 1, total)).await;
        }

        if result.succeeded == 0 && !result.failures.is_empty() {
            bail!("all {} batch jobs failed", total);
        }
        info!(
            "Batch finished: {} succeeded, {} failed",
            result.succeeded,
            result.failures.len()
        );
        Ok(TaskResult::BatchProcess(result))
    }
}
