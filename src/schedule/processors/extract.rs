use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::{ensure_file, file_stem, output_dir, unexpected_params, TaskProcessor};
use crate::schedule::executor::TaskContext;
use crate::schedule::types::{ExtractResult, TaskParams, TaskResult, TaskType};
use crate::tools::{ToolInvocation, ToolRunner};

/// Pulls embedded subtitle streams out of a container with ffmpeg, one
/// invocation per stream.
pub struct ExtractProcessor {
    runner: Arc<dyn ToolRunner>,
    ffmpeg: String,
}

impl ExtractProcessor {
    pub fn new(runner: Arc<dyn ToolRunner>, ffmpeg: String) -> Self {
        Self { runner, ffmpeg }
    }
}

#[async_trait]
impl TaskProcessor for ExtractProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::ExtractSubtitles
    }

    async fn process(&self, ctx: TaskContext, params: TaskParams) -> Result<TaskResult> {
        let params = match params {
            TaskParams::ExtractSubtitles(p) => p,
            other => return Err(unexpected_params(self.task_type(), &other)),
        };
        ensure_file(&params.video_path, "video").await?;

        let stem = file_stem(&params.video_path)?;
        let dir = output_dir(&params.video_path, params.output_dir.as_ref());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let total = params.streams.len();
        let mut outputs = Vec::with_capacity(total);
        for (index, stream) in params.streams.iter().enumerate() {
            ctx.checkpoint()?;
            let output = dir.join(format!("{}.{}.{}", stem, stream, params.format.extension()));
            let invocation = ToolInvocation::new(&self.ffmpeg)
                .args(["-nostdin", "-y", "-i"])
                .arg(params.video_path.to_string_lossy())
                .args(["-map".to_string(), format!("0:s:{}", stream)])
                .args(["-c:s", params.format.ffmpeg_codec()])
                .arg(output.to_string_lossy());

            self.runner
                .run(&invocation, ctx.cancellation())
                .await
                .with_context(|| format!("extracting subtitle stream {}", stream))?;

            outputs.push(output);
            let percentage = ((index + 1) * 100 / total) as u8;
            ctx.progress(percentage, format!("Extracted stream {}", stream)).await;
        }

        info!(
            "Extracted {} subtitle streams from {}",
            outputs.len(),
            params.video_path.display()
        );
        Ok(TaskResult::ExtractSubtitles(ExtractResult { outputs }))
    }
}
