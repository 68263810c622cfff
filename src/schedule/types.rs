use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TaskError};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    ScanLibrary,
    ExtractSubtitles,
    GenerateSubtitles,
    TranslateSubtitles,
    SyncSubtitles,
    BatchProcess,
    CleanupFiles,
    BackupDatabase,
    OptimizeDatabase,
    HealthCheck,
    UserExport,
}

impl TaskType {
    pub const ALL: [TaskType; 11] = [
        TaskType::ScanLibrary,
        TaskType::ExtractSubtitles,
        TaskType::GenerateSubtitles,
        TaskType::TranslateSubtitles,
        TaskType::SyncSubtitles,
        TaskType::BatchProcess,
        TaskType::CleanupFiles,
        TaskType::BackupDatabase,
        TaskType::OptimizeDatabase,
        TaskType::HealthCheck,
        TaskType::UserExport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::ScanLibrary => "SCAN_LIBRARY",
            TaskType::ExtractSubtitles => "EXTRACT_SUBTITLES",
            TaskType::GenerateSubtitles => "GENERATE_SUBTITLES",
            TaskType::TranslateSubtitles => "TRANSLATE_SUBTITLES",
            TaskType::SyncSubtitles => "SYNC_SUBTITLES",
            TaskType::BatchProcess => "BATCH_PROCESS",
            TaskType::CleanupFiles => "CLEANUP_FILES",
            TaskType::BackupDatabase => "BACKUP_DATABASE",
            TaskType::OptimizeDatabase => "OPTIMIZE_DATABASE",
            TaskType::HealthCheck => "HEALTH_CHECK",
            TaskType::UserExport => "USER_EXPORT",
        }
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Invalid task type: {}", s))
    }
}

/// Lifecycle status of a task.
///
/// ```text
/// PENDING | SCHEDULED -> RUNNING -> COMPLETED | FAILED | CANCELLED
/// FAILED -> PENDING (retry), RUNNING -> PENDING (stuck recovery)
/// PENDING | SCHEDULED -> PAUSED -> PENDING
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Scheduled,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Scheduled => "SCHEDULED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Paused => "PAUSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Statuses the scheduler may pick up for execution.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Scheduled)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (*self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Paused)
                | (Scheduled, Running)
                | (Scheduled, Cancelled)
                | (Scheduled, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Pending)
                | (Failed, Pending)
                | (Paused, Pending)
                | (Paused, Cancelled)
        )
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid task status: {}", s))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    /// Stored rank, higher dispatches first.
    pub fn rank(&self) -> i32 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Medium => 1,
            TaskPriority::High => 2,
            TaskPriority::Urgent => 3,
        }
    }

    pub fn from_rank(rank: i32) -> Option<Self> {
        match rank {
            0 => Some(TaskPriority::Low),
            1 => Some(TaskPriority::Medium),
            2 => Some(TaskPriority::High),
            3 => Some(TaskPriority::Urgent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleFormat {
    #[default]
    Srt,
    Ass,
    Vtt,
}

impl SubtitleFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            SubtitleFormat::Srt => "srt",
            SubtitleFormat::Ass => "ass",
            SubtitleFormat::Vtt => "vtt",
        }
    }

    pub fn ffmpeg_codec(&self) -> &'static str {
        match self {
            SubtitleFormat::Srt => "srt",
            SubtitleFormat::Ass => "ass",
            SubtitleFormat::Vtt => "webvtt",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_streams() -> Vec<u32> {
    vec![0]
}

fn default_model() -> String {
    "base".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParams {
    pub paths: Vec<PathBuf>,
    #[serde(default = "default_true")]
    pub recursive: bool,
    // empty means the built-in video extensions
    #[serde(default)]
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractParams {
    pub video_path: PathBuf,
    #[serde(default = "default_streams")]
    pub streams: Vec<u32>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub format: SubtitleFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateParams {
    pub video_path: PathBuf,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslateParams {
    pub subtitle_path: PathBuf,
    #[serde(default)]
    pub source_language: Option<String>,
    pub target_language: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncParams {
    pub video_path: PathBuf,
    pub subtitle_path: PathBuf,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchParams {
    pub jobs: Vec<TaskParams>,
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupParams {
    pub directories: Vec<PathBuf>,
    pub extensions: Vec<String>,
    #[serde(default)]
    pub older_than_days: Option<u32>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupParams {
    #[serde(default)]
    pub destination_dir: Option<PathBuf>,
    #[serde(default)]
    pub keep_last: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizeParams {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckParams {
    #[serde(default = "default_true")]
    pub probe_tools: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserExportParams {
    pub user: String,
    pub output_path: PathBuf,
}

/// Typed parameters, one variant per task type. Decoded once at the service
/// boundary so execution bodies never re-parse a generic payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskParams {
    ScanLibrary(ScanParams),
    ExtractSubtitles(ExtractParams),
    GenerateSubtitles(GenerateParams),
    TranslateSubtitles(TranslateParams),
    SyncSubtitles(SyncParams),
    BatchProcess(BatchParams),
    CleanupFiles(CleanupParams),
    BackupDatabase(BackupParams),
    OptimizeDatabase(OptimizeParams),
    HealthCheck(HealthCheckParams),
    UserExport(UserExportParams),
}

fn require(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(TaskError::Validation(message.to_string()))
    }
}

fn require_path(path: &Path, field: &str) -> Result<()> {
    require(
        !path.as_os_str().is_empty(),
        &format!("{} must not be empty", field),
    )
}

impl TaskParams {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskParams::ScanLibrary(_) => TaskType::ScanLibrary,
            TaskParams::ExtractSubtitles(_) => TaskType::ExtractSubtitles,
            TaskParams::GenerateSubtitles(_) => TaskType::GenerateSubtitles,
            TaskParams::TranslateSubtitles(_) => TaskType::TranslateSubtitles,
            TaskParams::SyncSubtitles(_) => TaskType::SyncSubtitles,
            TaskParams::BatchProcess(_) => TaskType::BatchProcess,
            TaskParams::CleanupFiles(_) => TaskType::CleanupFiles,
            TaskParams::BackupDatabase(_) => TaskType::BackupDatabase,
            TaskParams::OptimizeDatabase(_) => TaskType::OptimizeDatabase,
            TaskParams::HealthCheck(_) => TaskType::HealthCheck,
            TaskParams::UserExport(_) => TaskType::UserExport,
        }
    }

    /// Structural checks that do not depend on the registered processors.
    pub fn validate(&self) -> Result<()> {
        match self {
            TaskParams::ScanLibrary(p) => {
                require(!p.paths.is_empty(), "scan requires at least one path")?;
                p.paths.iter().try_for_each(|path| require_path(path, "paths"))
            }
            TaskParams::ExtractSubtitles(p) => {
                require_path(&p.video_path, "video_path")?;
                require(!p.streams.is_empty(), "streams must not be empty")
            }
            TaskParams::GenerateSubtitles(p) => require_path(&p.video_path, "video_path"),
            TaskParams::TranslateSubtitles(p) => {
                require_path(&p.subtitle_path, "subtitle_path")?;
                require(
                    !p.target_language.trim().is_empty(),
                    "target_language must not be empty",
                )
            }
            TaskParams::SyncSubtitles(p) => {
                require_path(&p.video_path, "video_path")?;
                require_path(&p.subtitle_path, "subtitle_path")
            }
            TaskParams::BatchProcess(p) => {
                require(!p.jobs.is_empty(), "batch requires at least one job")?;
                for (index, job) in p.jobs.iter().enumerate() {
                    if let TaskParams::BatchProcess(_) = job {
                        return Err(TaskError::Validation(format!(
                            "job {}: batches cannot be nested",
                            index
                        )));
                    }
                    if let Err(TaskError::Validation(message)) = job.validate() {
                        return Err(TaskError::Validation(format!("job {}: {}", index, message)));
                    }
                }
                Ok(())
            }
            TaskParams::CleanupFiles(p) => {
                require(!p.directories.is_empty(), "cleanup requires at least one directory")?;
                require(!p.extensions.is_empty(), "cleanup requires at least one extension")
            }
            TaskParams::BackupDatabase(p) => {
                require(p.keep_last != Some(0), "keep_last must be at least 1")
            }
            TaskParams::OptimizeDatabase(_) | TaskParams::HealthCheck(_) => Ok(()),
            TaskParams::UserExport(p) => {
                require(!p.user.trim().is_empty(), "user must not be empty")?;
                require_path(&p.output_path, "output_path")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannedVideo {
    pub path: PathBuf,
    pub subtitles: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub videos: Vec<ScannedVideo>,
    pub video_count: usize,
    pub subtitle_count: usize,
    pub missing_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractResult {
    pub outputs: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResult {
    pub subtitle_path: PathBuf,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslateResult {
    pub output_path: PathBuf,
    pub target_language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub output_path: PathBuf,
    pub offset_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub index: usize,
    pub task_type: TaskType,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub succeeded: usize,
    pub failures: Vec<BatchFailure>,
    pub results: Vec<TaskResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub removed: Vec<PathBuf>,
    pub bytes_freed: u64,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupResult {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub rotated: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeResult {
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStatus {
    pub name: String,
    pub program: String,
    pub available: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub storage_ok: bool,
    pub storage_detail: Option<String>,
    pub tools: Vec<ToolStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportResult {
    pub path: PathBuf,
    pub task_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResult {
    ScanLibrary(ScanResult),
    ExtractSubtitles(ExtractResult),
    GenerateSubtitles(GenerateResult),
    TranslateSubtitles(TranslateResult),
    SyncSubtitles(SyncResult),
    BatchProcess(BatchResult),
    CleanupFiles(CleanupResult),
    BackupDatabase(BackupResult),
    OptimizeDatabase(OptimizeResult),
    HealthCheck(HealthReport),
    UserExport(ExportResult),
}

/// Input of create-task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub params: TaskParams,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub video_file_id: Option<Uuid>,
    #[serde(default)]
    pub subtitle_id: Option<Uuid>,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(params: TaskParams) -> Self {
        Self {
            params,
            priority: TaskPriority::default(),
            video_file_id: None,
            subtitle_id: None,
            requested_by: None,
            max_retries: None,
            scheduled_for: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn requested_by(mut self, user: impl Into<String>) -> Self {
        self.requested_by = Some(user.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub params: TaskParams,
    pub result: Option<TaskResult>,
    pub error_message: Option<String>,
    pub progress_percentage: u8,
    pub progress_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub video_file_id: Option<Uuid>,
    pub subtitle_id: Option<Uuid>,
    pub requested_by: Option<String>,
}

impl Task {
    /// Builds a fresh task: PENDING, or SCHEDULED when `scheduled_for` lies
    /// in the future.
    pub fn new(new: NewTask, now: DateTime<Utc>, default_max_retries: u32) -> Self {
        let status = match new.scheduled_for {
            Some(at) if at > now => TaskStatus::Scheduled,
            _ => TaskStatus::Pending,
        };
        Self {
            id: Uuid::new_v4(),
            task_type: new.params.task_type(),
            status,
            priority: new.priority,
            params: new.params,
            result: None,
            error_message: None,
            progress_percentage: 0,
            progress_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            last_heartbeat: None,
            scheduled_for: new.scheduled_for,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(default_max_retries),
            video_file_id: new.video_file_id,
            subtitle_id: new.subtitle_id,
            requested_by: new.requested_by,
        }
    }

    fn transition(&mut self, to: TaskStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        self.completed_at = if to.is_terminal() { Some(now) } else { None };
        Ok(())
    }

    pub fn invalid_state(&self, action: &'static str) -> TaskError {
        TaskError::InvalidState {
            id: self.id,
            status: self.status,
            action,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending => true,
            TaskStatus::Scheduled => self.scheduled_for.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Running, now)?;
        self.started_at = Some(now);
        self.last_heartbeat = Some(now);
        self.progress_percentage = 0;
        self.progress_message = None;
        self.result = None;
        self.error_message = None;
        Ok(())
    }

    pub fn complete(&mut self, result: TaskResult, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Completed, now)?;
        self.result = Some(result);
        self.progress_percentage = 100;
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Failed, now)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Cancelled, now)
    }

    /// Stuck recovery: back to PENDING with a fresh heartbeat. Does not count
    /// as a retry.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Running {
            return Err(self.invalid_state("requeue"));
        }
        self.transition(TaskStatus::Pending, now)?;
        self.last_heartbeat = Some(now);
        Ok(())
    }

    pub fn retry(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Failed {
            return Err(self.invalid_state("retry"));
        }
        if self.retry_count >= self.max_retries {
            return Err(TaskError::Validation(format!(
                "retry limit reached ({}/{})",
                self.retry_count, self.max_retries
            )));
        }
        self.transition(TaskStatus::Pending, now)?;
        self.retry_count += 1;
        self.result = None;
        self.error_message = None;
        self.progress_percentage = 0;
        self.progress_message = None;
        self.started_at = None;
        self.last_heartbeat = None;
        Ok(())
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(TaskStatus::Paused) {
            return Err(self.invalid_state("pause"));
        }
        self.transition(TaskStatus::Paused, now)
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Paused {
            return Err(self.invalid_state("resume"));
        }
        self.transition(TaskStatus::Pending, now)
    }

    /// Progress never moves backwards within one attempt.
    pub fn record_progress(
        &mut self,
        percentage: u8,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let percentage = percentage.min(100).max(self.progress_percentage);
        let changed = percentage != self.progress_percentage
            || (message.is_some() && message != self.progress_message);
        self.progress_percentage = percentage;
        if message.is_some() {
            self.progress_message = message;
        }
        self.updated_at = now;
        changed
    }

    pub fn record_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = Some(match self.last_heartbeat {
            Some(previous) if previous > now => previous,
            _ => now,
        });
        self.updated_at = now;
    }

    pub fn touches_resource(&self, resource_id: Uuid) -> bool {
        self.video_file_id == Some(resource_id) || self.subtitle_id == Some(resource_id)
    }
}

/// Query filter shared by the stores, list endpoints and update streams.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default, rename = "type")]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub resource_id: Option<Uuid>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

impl TaskFilter {
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |status| task.status == status)
            && self.task_type.map_or(true, |task_type| task.task_type == task_type)
            && self
                .resource_id
                .map_or(true, |resource_id| task.touches_resource(resource_id))
            && self
                .requested_by
                .as_ref()
                .map_or(true, |user| task.requested_by.as_ref() == Some(user))
    }
}
