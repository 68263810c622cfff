pub mod batch;
pub mod cleanup;
pub mod export;
pub mod extract;
pub mod generate;
pub mod health;
pub mod maintenance;
pub mod scan;
pub mod sync;
pub mod translate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;

use crate::config::ToolPaths;
use crate::error::{Result, TaskError};
use crate::schedule::executor::TaskContext;
use crate::schedule::types::{TaskParams, TaskResult, TaskType};
use crate::storage::task::TaskStorage;
use crate::tools::ToolRunner;

pub use batch::BatchProcessor;
pub use cleanup::CleanupProcessor;
pub use export::UserExportProcessor;
pub use extract::ExtractProcessor;
pub use generate::GenerateProcessor;
pub use health::HealthCheckProcessor;
pub use maintenance::{BackupProcessor, OptimizeProcessor};
pub use scan::ScanProcessor;
pub use sync::SyncProcessor;
pub use translate::TranslateProcessor;

/// Execution body for one task type.
///
/// Bodies must poll [`TaskContext::checkpoint`] at loop boundaries and before
/// spawning tools, and pass [`TaskContext::cancellation`] to the tool runner.
#[async_trait]
pub trait TaskProcessor: Send + Sync + 'static {
    fn task_type(&self) -> TaskType;

    /// Extra create-time checks beyond [`TaskParams::validate`].
    fn validate_params(&self, _params: &TaskParams) -> Result<()> {
        Ok(())
    }

    async fn process(&self, ctx: TaskContext, params: TaskParams) -> anyhow::Result<TaskResult>;
}

/// Every built-in body, batch last so it can delegate to the others.
pub fn default_processors(
    storage: Arc<dyn TaskStorage>,
    runner: Arc<dyn ToolRunner>,
    tools: &ToolPaths,
    backup_dir: PathBuf,
) -> Vec<Arc<dyn TaskProcessor>> {
    let mut processors: Vec<Arc<dyn TaskProcessor>> = vec![
        Arc::new(ScanProcessor),
        Arc::new(ExtractProcessor::new(runner.clone(), tools.ffmpeg.clone())),
        Arc::new(GenerateProcessor::new(runner.clone(), tools.whisper.clone())),
        Arc::new(TranslateProcessor::new(runner.clone(), tools.translator.clone())),
        Arc::new(SyncProcessor::new(runner.clone(), tools.ffsubsync.clone())),
        Arc::new(CleanupProcessor),
        Arc::new(BackupProcessor::new(storage.clone(), backup_dir)),
        Arc::new(OptimizeProcessor::new(storage.clone())),
        Arc::new(HealthCheckProcessor::new(storage.clone(), runner, tools.clone())),
        Arc::new(UserExportProcessor::new(storage)),
    ];
    let batch = BatchProcessor::new(processors.iter().cloned());
    processors.push(Arc::new(batch));
    processors
}

pub(crate) fn unexpected_params(expected: TaskType, params: &TaskParams) -> anyhow::Error {
    anyhow!("{} processor received {} params", expected, params.task_type())
}

pub(crate) fn file_stem(path: &Path) -> anyhow::Result<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}

/// Explicit directory, else the directory holding `source`.
pub(crate) fn output_dir(source: &Path, explicit: Option<&PathBuf>) -> PathBuf {
    match explicit {
        Some(dir) => dir.clone(),
        None => source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    }
}

pub(crate) async fn ensure_file(path: &Path, what: &str) -> anyhow::Result<()> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("{} not found: {}", what, path.display()))?;
    anyhow::ensure!(metadata.is_file(), "{} is not a file: {}", what, path.display());
    Ok(())
}

pub(crate) fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| extensions.iter().any(|wanted| *wanted == ext))
}

pub(crate) fn normalize_extensions<S: AsRef<str>>(extensions: &[S]) -> Vec<String> {
    extensions
        .iter()
        .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}

/// `en`, `eng`, `pt-BR`, `zh-Hans`.
pub(crate) fn validate_language(code: &str, field: &str) -> Result<()> {
    let mut parts = code.splitn(2, '-');
    let primary = parts.next().unwrap_or_default();
    let primary_ok = (2..=3).contains(&primary.len()) && primary.chars().all(|c| c.is_ascii_lowercase());
    let region_ok = parts
        .next()
        .map_or(true, |region| {
            (2..=8).contains(&region.len()) && region.chars().all(|c| c.is_ascii_alphanumeric())
        });
    if primary_ok && region_ok {
        Ok(())
    } else {
        Err(TaskError::Validation(format!(
            "{} is not a language code: {}",
            field, code
        )))
    }
}
