use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::{ensure_file, file_stem, output_dir, unexpected_params, validate_language, TaskProcessor};
use crate::error::{self, TaskError};
use crate::schedule::executor::TaskContext;
use crate::schedule::types::{GenerateResult, TaskParams, TaskResult, TaskType};
use crate::tools::{ToolInvocation, ToolRunner};

const MODELS: &[&str] = &[
    "tiny", "tiny.en", "base", "base.en", "small", "small.en", "medium", "medium.en", "large",
    "large-v2", "large-v3", "turbo",
];

/// Speech-to-text subtitles through the whisper command line.
pub struct GenerateProcessor {
    runner: Arc<dyn ToolRunner>,
    whisper: String,
}

impl GenerateProcessor {
    pub fn new(runner: Arc<dyn ToolRunner>, whisper: String) -> Self {
        Self { runner, whisper }
    }
}

#[async_trait]
impl TaskProcessor for GenerateProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::GenerateSubtitles
    }

    fn validate_params(&self, params: &TaskParams) -> error::Result<()> {
        if let TaskParams::GenerateSubtitles(p) = params {
            if let Some(language) = &p.language {
                validate_language(language, "language")?;
            }
            if !MODELS.contains(&p.model.as_str()) {
                return Err(TaskError::Validation(format!(
                    "unknown whisper model: {}",
                    p.model
                )));
            }
        }
        Ok(())
    }

    async fn process(&self, ctx: TaskContext, params: TaskParams) -> Result<TaskResult> {
        let params = match params {
            TaskParams::GenerateSubtitles(p) => p,
            other => return Err(unexpected_params(self.task_type(), &other)),
        };
        ensure_file(&params.video_path, "video").await?;

        let stem = file_stem(&params.video_path)?;
        let dir = output_dir(&params.video_path, params.output_dir.as_ref());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let mut invocation = ToolInvocation::new(&self.whisper)
            .arg(params.video_path.to_string_lossy())
            .args(["--model", params.model.as_str()])
            .args(["--output_format", "srt"])
            .arg("--output_dir")
            .arg(dir.to_string_lossy());
        if let Some(language) = &params.language {
            invocation = invocation.args(["--language", language.as_str()]);
        }

        ctx.checkpoint()?;
        ctx.progress(5, format!("Transcribing with whisper {}", params.model)).await;
        self.runner
            .run(&invocation, ctx.cancellation())
            .await
            .context("whisper transcription")?;

        let subtitle_path = dir.join(format!("{}.srt", stem));
        ensure_file(&subtitle_path, "generated subtitle").await?;
        ctx.progress(100, "Transcription finished").await;

        info!("Generated subtitles {}", subtitle_path.display());
        Ok(TaskResult::GenerateSubtitles(GenerateResult {
            subtitle_path,
            language: params.language,
        }))
    }
}
