use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{has_extension, normalize_extensions, unexpected_params, TaskProcessor};
use crate::schedule::executor::TaskContext;
use crate::schedule::types::{ScanParams, ScanResult, ScannedVideo, TaskParams, TaskResult, TaskType};

const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "m4v", "avi", "mov", "webm", "wmv", "flv", "ts", "mpg", "mpeg",
];
const SUBTITLE_EXTENSIONS: &[&str] = &["srt", "ass", "ssa", "vtt", "sub"];

/// Walks library roots and pairs each video with its sidecar subtitles
/// (`movie.mkv` with `movie.srt`, `movie.en.srt`, ...).
pub struct ScanProcessor;

struct DirectoryListing {
    files: Vec<PathBuf>,
    subdirs: Vec<PathBuf>,
}

async fn list_directory(dir: &Path) -> Result<DirectoryListing> {
    let mut listing = DirectoryListing {
        files: Vec::new(),
        subdirs: Vec::new(),
    };
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            listing.subdirs.push(entry.path());
        } else if file_type.is_file() {
            listing.files.push(entry.path());
        }
    }
    listing.files.sort();
    listing.subdirs.sort();
    Ok(listing)
}

fn sidecars(video: &Path, files: &[PathBuf], subtitle_extensions: &[String]) -> Vec<PathBuf> {
    let Some(stem) = video.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
        return Vec::new();
    };
    files
        .iter()
        .filter(|file| has_extension(file, subtitle_extensions))
        .filter(|file| {
            file.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .is_some_and(|name| name.starts_with(&format!("{}.", stem)))
        })
        .cloned()
        .collect()
}

impl ScanProcessor {
    async fn scan_root(
        &self,
        ctx: &TaskContext,
        root: &Path,
        params: &ScanParams,
        video_extensions: &[String],
        subtitle_extensions: &[String],
    ) -> Result<Vec<ScannedVideo>> {
        let mut found = Vec::new();

        // a single video file as root
        if tokio::fs::metadata(root).await?.is_file() {
            if has_extension(root, video_extensions) {
                let parent = root.parent().unwrap_or(Path::new("."));
                let listing = list_directory(parent).await?;
                found.push(ScannedVideo {
                    path: root.to_path_buf(),
                    subtitles: sidecars(root, &listing.files, subtitle_extensions),
                });
            }
            return Ok(found);
        }

        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            ctx.checkpoint()?;
            let listing = match list_directory(&dir).await {
                Ok(listing) => listing,
                Err(e) if dir != root => {
                    warn!("Skipping unreadable directory {}: {:#}", dir.display(), e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            for video in listing.files.iter().filter(|f| has_extension(f, video_extensions)) {
                found.push(ScannedVideo {
                    path: video.clone(),
                    subtitles: sidecars(video, &listing.files, subtitle_extensions),
                });
            }
            if params.recursive {
                pending.extend(listing.subdirs.into_iter().rev());
            }
        }
        debug!("Found {} videos under {}", found.len(), root.display());
        Ok(found)
    }
}

#[async_trait]
impl TaskProcessor for ScanProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::ScanLibrary
    }

    async fn process(&self, ctx: TaskContext, params: TaskParams) -> Result<TaskResult> {
        let params = match params {
            TaskParams::ScanLibrary(p) => p,
            other => return Err(unexpected_params(self.task_type(), &other)),
        };

        let video_extensions = if params.extensions.is_empty() {
            normalize_extensions(VIDEO_EXTENSIONS)
        } else {
            normalize_extensions(&params.extensions)
        };
        let subtitle_extensions = normalize_extensions(SUBTITLE_EXTENSIONS);

        let total = params.paths.len().max(1);
        let mut result = ScanResult::default();
        for (index, root) in params.paths.iter().enumerate() {
            ctx.checkpoint()?;
            if !tokio::fs::try_exists(root).await.unwrap_or(false) {
                warn!("Library path does not exist: {}", root.display());
                result.missing_paths.push(root.clone());
            } else {
                let videos = self
                    .scan_root(&ctx, root, &params, &video_extensions, &subtitle_extensions)
                    .await?;
                result.subtitle_count += videos.iter().map(|v| v.subtitles.len()).sum::<usize>();
                result.videos.extend(videos);
            }
            let percentage = ((index + 1) * 100 / total) as u8;
            ctx.progress(percentage, format!("Scanned {}", root.display())).await;
        }
        result.video_count = result.videos.len();

        info!(
            "Scan finished: {} videos, {} subtitles, {} missing paths",
            result.video_count,
            result.subtitle_count,
            result.missing_paths.len()
        );
        Ok(TaskResult::ScanLibrary(result))
    }
}
