use thiserror::Error;
use uuid::Uuid;

use crate::schedule::types::TaskStatus;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    NotFound(Uuid),

    #[error("Task {id} is {status}, cannot {action}")]
    InvalidState {
        id: Uuid,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task {0} changed concurrently, could not interrupt")]
    Conflict(Uuid),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for TaskError {
    fn from(error: sqlx::Error) -> Self {
        TaskError::Storage(error.to_string())
    }
}

impl From<sea_orm::DbErr> for TaskError {
    fn from(error: sea_orm::DbErr) -> Self {
        TaskError::Storage(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
