use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::{ensure_file, file_stem, unexpected_params, TaskProcessor};
use crate::schedule::executor::TaskContext;
use crate::schedule::types::{SyncParams, SyncResult, TaskParams, TaskResult, TaskType};
use crate::tools::{ToolInvocation, ToolRunner};

/// Re-times a subtitle against the video's audio track with ffsubsync.
pub struct SyncProcessor {
    runner: Arc<dyn ToolRunner>,
    ffsubsync: String,
}

impl SyncProcessor {
    pub fn new(runner: Arc<dyn ToolRunner>, ffsubsync: String) -> Self {
        Self { runner, ffsubsync }
    }

    fn output_path(params: &SyncParams) -> Result<PathBuf> {
        if let Some(path) = &params.output_path {
            return Ok(path.clone());
        }
        let stem = file_stem(&params.subtitle_path)?;
        let extension = params
            .subtitle_path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "srt".to_string());
        Ok(params
            .subtitle_path
            .with_file_name(format!("{}.synced.{}", stem, extension)))
    }
}

/// ffsubsync logs `offset seconds: 1.250` once it settles on a shift.
fn parse_offset(output: &str) -> Option<f64> {
    output.lines().rev().find_map(|line| {
        let (_, value) = line.split_once("offset seconds:")?;
        value.trim().parse().ok()
    })
}

#[async_trait]
impl TaskProcessor for SyncProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::SyncSubtitles
    }

    async fn process(&self, ctx: TaskContext, params: TaskParams) -> Result<TaskResult> {
        let params = match params {
            TaskParams::SyncSubtitles(p) => p,
            other => return Err(unexpected_params(self.task_type(), &other)),
        };
        ensure_file(&params.video_path, "video").await?;
        ensure_file(&params.subtitle_path, "subtitle").await?;
        let output_path = Self::output_path(&params)?;

        let invocation = ToolInvocation::new(&self.ffsubsync)
            .arg(params.video_path.to_string_lossy())
            .arg("-i")
            .arg(params.subtitle_path.to_string_lossy())
            .arg("-o")
            .arg(output_path.to_string_lossy());

        ctx.checkpoint()?;
        ctx.progress(5, "Aligning subtitle with audio").await;
        let output = self
            .runner
            .run(&invocation, ctx.cancellation())
            .await
            .context("ffsubsync")?;

        let offset_seconds = parse_offset(&output.stderr).or_else(|| parse_offset(&output.stdout));
        ctx.progress(100, "Subtitle synchronized").await;

        info!(
            "Synchronized {} (offset {:?}s)",
            output_path.display(),
            offset_seconds
        );
        Ok(TaskResult::SyncSubtitles(SyncResult {
            output_path,
            offset_seconds,
        }))
    }
}
