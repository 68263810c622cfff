use chrono::{DateTime, Utc};
use sea_orm::ActiveValue::Set;
use uuid::Uuid;

use crate::error::{Result, TaskError};
use crate::schedule::types::{Task, TaskPriority, TaskStatus, TaskType};
use crate::storage::task::entity::{ActiveModel, Model as TaskModel};

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(column: &str, millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| TaskError::Storage(format!("{} out of range: {}", column, millis)))
}

fn from_millis_opt(column: &str, millis: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    millis.map(|m| from_millis(column, m)).transpose()
}

fn parse_uuid(column: &str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| TaskError::Storage(format!("{} is not a uuid: {}", column, e)))
}

fn parse_uuid_opt(column: &str, raw: Option<String>) -> Result<Option<Uuid>> {
    raw.map(|r| parse_uuid(column, &r)).transpose()
}

fn non_negative(column: &str, value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|_| TaskError::Storage(format!("{} is negative: {}", column, value)))
}

impl TryFrom<TaskModel> for Task {
    type Error = TaskError;

    fn try_from(model: TaskModel) -> Result<Self> {
        let task_type: TaskType = model.task_type.parse().map_err(TaskError::Storage)?;
        let status: TaskStatus = model.status.parse().map_err(TaskError::Storage)?;
        let priority = TaskPriority::from_rank(model.priority).ok_or_else(|| {
            TaskError::Storage(format!("Invalid priority rank: {}", model.priority))
        })?;

        Ok(Task {
            id: parse_uuid("id", &model.id)?,
            task_type,
            status,
            priority,
            params: serde_json::from_str(&model.params)?,
            result: model.output.map(|r| serde_json::from_str(&r)).transpose()?,
            error_message: model.error_message,
            progress_percentage: model.progress_percentage.clamp(0, 100) as u8,
            progress_message: model.progress_message,
            created_at: from_millis("created_at", model.created_at)?,
            updated_at: from_millis("updated_at", model.updated_at)?,
            started_at: from_millis_opt("started_at", model.started_at)?,
            completed_at: from_millis_opt("completed_at", model.completed_at)?,
            last_heartbeat: from_millis_opt("last_heartbeat", model.last_heartbeat)?,
            scheduled_for: from_millis_opt("scheduled_for", model.scheduled_for)?,
            retry_count: non_negative("retry_count", model.retry_count)?,
            max_retries: non_negative("max_retries", model.max_retries)?,
            video_file_id: parse_uuid_opt("video_file_id", model.video_file_id)?,
            subtitle_id: parse_uuid_opt("subtitle_id", model.subtitle_id)?,
            requested_by: model.requested_by,
        })
    }
}

impl TryFrom<&Task> for TaskModel {
    type Error = TaskError;

    fn try_from(task: &Task) -> Result<Self> {
        Ok(TaskModel {
            id: task.id.to_string(),
            task_type: task.task_type.as_str().to_string(),
            status: task.status.as_str().to_string(),
            priority: task.priority.rank(),
            params: serde_json::to_string(&task.params)?,
            output: task.result.as_ref().map(serde_json::to_string).transpose()?,
            error_message: task.error_message.clone(),
            progress_percentage: i32::from(task.progress_percentage),
            progress_message: task.progress_message.clone(),
            created_at: to_millis(task.created_at),
            updated_at: to_millis(task.updated_at),
            started_at: task.started_at.map(to_millis),
            completed_at: task.completed_at.map(to_millis),
            last_heartbeat: task.last_heartbeat.map(to_millis),
            scheduled_for: task.scheduled_for.map(to_millis),
            retry_count: task.retry_count as i32,
            max_retries: task.max_retries as i32,
            video_file_id: task.video_file_id.map(|id| id.to_string()),
            subtitle_id: task.subtitle_id.map(|id| id.to_string()),
            requested_by: task.requested_by.clone(),
        })
    }
}

/// Every mutable column, for whole-row compare-and-set writes. The id and
/// creation fields are left unset.
pub(crate) fn mutable_columns(task: &Task) -> Result<ActiveModel> {
    let model = TaskModel::try_from(task)?;
    Ok(ActiveModel {
        status: Set(model.status),
        priority: Set(model.priority),
        output: Set(model.output),
        error_message: Set(model.error_message),
        progress_percentage: Set(model.progress_percentage),
        progress_message: Set(model.progress_message),
        updated_at: Set(model.updated_at),
        started_at: Set(model.started_at),
        completed_at: Set(model.completed_at),
        last_heartbeat: Set(model.last_heartbeat),
        scheduled_for: Set(model.scheduled_for),
        retry_count: Set(model.retry_count),
        max_retries: Set(model.max_retries),
        ..Default::default()
    })
}
