use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::{ensure_file, file_stem, unexpected_params, validate_language, TaskProcessor};
use crate::error;
use crate::schedule::executor::TaskContext;
use crate::schedule::types::{TaskParams, TaskResult, TaskType, TranslateParams, TranslateResult};
use crate::tools::{ToolInvocation, ToolRunner};

/// Hands a subtitle file to the configured translator command.
pub struct TranslateProcessor {
    runner: Arc<dyn ToolRunner>,
    translator: String,
}

impl TranslateProcessor {
    pub fn new(runner: Arc<dyn ToolRunner>, translator: String) -> Self {
        Self { runner, translator }
    }

    fn output_path(params: &TranslateParams) -> Result<PathBuf> {
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
            .with_file_name(format!("{}.{}.{}", stem, params.target_language, extension)))
    }
}

#[async_trait]
impl TaskProcessor for TranslateProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::TranslateSubtitles
    }

    fn validate_params(&self, params: &TaskParams) -> error::Result<()> {
        if let TaskParams::TranslateSubtitles(p) = params {
            validate_language(&p.target_language, "target_language")?;
            if let Some(source) = &p.source_language {
                validate_language(source, "source_language")?;
            }
        }
        Ok(())
    }

    async fn process(&self, ctx: TaskContext, params: TaskParams) -> Result<TaskResult> {
        let params = match params {
            TaskParams::TranslateSubtitles(p) => p,
            other => return Err(unexpected_params(self.task_type(), &other)),
        };
        ensure_file(&params.subtitle_path, "subtitle").await?;
        let output_path = Self::output_path(&params)?;

        let mut invocation = ToolInvocation::new(&self.translator)
            .arg("--input")
            .arg(params.subtitle_path.to_string_lossy())
            .arg("--output")
            .arg(output_path.to_string_lossy())
            .args(["--target", params.target_language.as_str()]);
        if let Some(source) = &params.source_language {
            invocation = invocation.args(["--source", source.as_str()]);
        }
        if let Some(provider) = &params.provider {
            invocation = invocation.args(["--provider", provider.as_str()]);
        }

        ctx.checkpoint()?;
        ctx.progress(5, format!("Translating to {}", params.target_language)).await;
        self.runner
            .run(&invocation, ctx.cancellation())
            .await
            .context("subtitle translation")?;
        ctx.progress(100, "Translation finished").await;

        info!(
            "Translated {} to {}",
            params.subtitle_path.display(),
            output_path.display()
        );
        Ok(TaskResult::TranslateSubtitles(TranslateResult {
            output_path,
            target_language: params.target_language,
        }))
    }
}
