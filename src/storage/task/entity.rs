use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Row layout of the `tasks` table. Timestamps are unix milliseconds so
/// cutoff comparisons stay numeric.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub task_type: String,
    pub status: String,
    pub priority: i32,
    pub params: String, // serialized TaskParams
    pub output: Option<String>, // serialized TaskResult
    pub error_message: Option<String>,
    pub progress_percentage: i32,
    pub progress_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub last_heartbeat: Option<i64>,
    pub scheduled_for: Option<i64>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub video_file_id: Option<String>,
    pub subtitle_id: Option<String>,
    pub requested_by: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
