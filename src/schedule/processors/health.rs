use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use super::{unexpected_params, TaskProcessor};
use crate::config::ToolPaths;
use crate::schedule::executor::TaskContext;
use crate::schedule::types::{HealthReport, TaskParams, TaskResult, TaskType, ToolStatus};
use crate::storage::task::TaskStorage;
use crate::tools::ToolRunner;

/// Checks the task store and the external tools. Problems end up in the
/// report; the task itself only fails when it cannot run at all.
pub struct HealthCheckProcessor {
    storage: Arc<dyn TaskStorage>,
    runner: Arc<dyn ToolRunner>,
    tools: ToolPaths,
}

impl HealthCheckProcessor {
    pub fn new(storage: Arc<dyn TaskStorage>, runner: Arc<dyn ToolRunner>, tools: ToolPaths) -> Self {
        Self {
            storage,
            runner,
            tools,
        }
    }

    fn probes(&self) -> [(&'static str, &str, &'static str); 4] {
        [
            ("ffmpeg", self.tools.ffmpeg.as_str(), "-version"),
            ("ffsubsync", self.tools.ffsubsync.as_str(), "--version"),
            ("whisper", self.tools.whisper.as_str(), "--help"),
            ("translator", self.tools.translator.as_str(), "--version"),
        ]
    }
}

#[async_trait]
impl TaskProcessor for HealthCheckProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::HealthCheck
    }

    async fn process(&self, ctx: TaskContext, params: TaskParams) -> Result<TaskResult> {
        let params = match params {
            TaskParams::HealthCheck(p) => p,
            other => return Err(unexpected_params(self.task_type(), &other)),
        };

        let (storage_ok, storage_detail) = match self.storage.ping().await {
            Ok(()) => (true, None),
            Err(e) => {
                warn!("Health check: storage unreachable: {}", e);
                (false, Some(e.to_string()))
            }
        };
        ctx.progress(20, "Storage checked").await;

        let mut tools = Vec::new();
        if params.probe_tools {
            let probes = self.probes();
            let total = probes.len();
            for (index, (name, program, version_arg)) in probes.into_iter().enumerate() {
                ctx.checkpoint()?;
                let status = match self.runner.probe(program, version_arg).await {
                    Ok(banner) => ToolStatus {
                        name: name.to_string(),
                        program: program.to_string(),
                        available: true,
                        detail: (!banner.is_empty()).then_some(banner),
                    },
                    Err(e) => {
                        warn!("Health check: {} unavailable: {}", name, e);
                        ToolStatus {
                            name: name.to_string(),
                            program: program.to_string(),
                            available: false,
                            detail: Some(e.to_string()),
                        }
                    }
                };
                tools.push(status);
                let percentage = 20 + ((index + 1) * 80 / total) as u8;
                ctx.progress(percentage, format!("Probed {}", name)).await;
            }
        }
        ctx.progress(100, "Health check finished").await;

        let healthy = storage_ok && tools.iter().all(|t| t.available);
        info!("Health check finished: healthy={}", healthy);
        Ok(TaskResult::HealthCheck(HealthReport {
            healthy,
            storage_ok,
            storage_detail,
            tools,
        }))
    }
}
