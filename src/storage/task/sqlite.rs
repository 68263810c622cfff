use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    SqlxSqliteConnector,
};
use sea_query::{Expr, Index, SqliteQueryBuilder};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use super::entity::{ActiveModel, Column, Entity, Model as TaskModel};
use super::mapping::{mutable_columns, to_millis};
use super::TaskStorage;
use crate::error::{Result, TaskError};
use crate::schedule::types::{Task, TaskFilter, TaskStatus};
use crate::web::Pagination;

pub struct SqliteTaskStorage {
    pool: SqlitePool,
    db: DatabaseConnection,
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

impl SqliteTaskStorage {
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Initializing SQLite task storage at {}", database_url);

        let in_memory = is_in_memory(database_url);
        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // every connection to :memory: is its own database, so pin exactly one
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };
        let pool = pool_options.connect_with(options).await?;

        Self::create_schema(&pool).await?;

        let db = SqlxSqliteConnector::from_sqlx_sqlite_pool(pool.clone());
        Ok(Self { pool, db })
    }

    async fn create_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                params TEXT NOT NULL,
                output TEXT,
                error_message TEXT,
                progress_percentage INTEGER NOT NULL DEFAULT 0,
                progress_message TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                last_heartbeat INTEGER,
                scheduled_for INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                video_file_id TEXT,
                subtitle_id TEXT,
                requested_by TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        let indexes = [
            Index::create()
                .if_not_exists()
                .name("idx_tasks_status_heartbeat")
                .table(Entity)
                .col(Column::Status)
                .col(Column::LastHeartbeat)
                .to_owned(),
            Index::create()
                .if_not_exists()
                .name("idx_tasks_dispatch")
                .table(Entity)
                .col(Column::Status)
                .col(Column::Priority)
                .col(Column::CreatedAt)
                .to_owned(),
            Index::create()
                .if_not_exists()
                .name("idx_tasks_completed_at")
                .table(Entity)
                .col(Column::CompletedAt)
                .to_owned(),
            Index::create()
                .if_not_exists()
                .name("idx_tasks_video_file")
                .table(Entity)
                .col(Column::VideoFileId)
                .to_owned(),
            Index::create()
                .if_not_exists()
                .name("idx_tasks_subtitle")
                .table(Entity)
                .col(Column::SubtitleId)
                .to_owned(),
            Index::create()
                .if_not_exists()
                .name("idx_tasks_created_at")
                .table(Entity)
                .col(Column::CreatedAt)
                .to_owned(),
        ];
        for index in indexes {
            let sql = index.to_string(SqliteQueryBuilder);
            sqlx::query(&sql).execute(pool).await?;
        }

        Ok(())
    }

    fn into_tasks(models: Vec<TaskModel>) -> Result<Vec<Task>> {
        models.into_iter().map(Task::try_from).collect()
    }

    fn filter_condition(filter: &TaskFilter) -> Condition {
        let mut condition = Condition::all();
        if let Some(status) = filter.status {
            condition = condition.add(Column::Status.eq(status.as_str()));
        }
        if let Some(task_type) = filter.task_type {
            condition = condition.add(Column::TaskType.eq(task_type.as_str()));
        }
        if let Some(resource_id) = filter.resource_id {
            let resource_id = resource_id.to_string();
            condition = condition.add(
                Condition::any()
                    .add(Column::VideoFileId.eq(resource_id.clone()))
                    .add(Column::SubtitleId.eq(resource_id)),
            );
        }
        if let Some(requested_by) = &filter.requested_by {
            condition = condition.add(Column::RequestedBy.eq(requested_by.as_str()));
        }
        condition
    }

    fn terminal_before(cutoff: DateTime<Utc>) -> Condition {
        Condition::all()
            .add(Column::Status.is_in([
                TaskStatus::Completed.as_str(),
                TaskStatus::Failed.as_str(),
            ]))
            .add(Column::CompletedAt.lt(to_millis(cutoff)))
    }
}

#[async_trait]
impl TaskStorage for SqliteTaskStorage {
    async fn insert(&self, task: &Task) -> Result<()> {
        let model: ActiveModel = TaskModel::try_from(task)?.into();
        Entity::insert(model).exec_without_returning(&self.db).await?;
        debug!("Inserted task {} ({})", task.id, task.task_type);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .map(Task::try_from)
            .transpose()
    }

    async fn compare_and_save(&self, task: &Task, expected: TaskStatus) -> Result<bool> {
        let result = Entity::update_many()
            .set(mutable_columns(task)?)
            .filter(Column::Id.eq(task.id.to_string()))
            .filter(Column::Status.eq(expected.as_str()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn update_progress(
        &self,
        id: Uuid,
        percentage: u8,
        message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let percentage = i32::from(percentage.min(100));
        let mut update = Entity::update_many()
            .col_expr(Column::ProgressPercentage, Expr::value(percentage))
            .col_expr(Column::UpdatedAt, Expr::value(to_millis(at)));
        if let Some(message) = message {
            update = update.col_expr(Column::ProgressMessage, Expr::value(message));
        }
        let result = update
            .filter(Column::Id.eq(id.to_string()))
            .filter(Column::Status.eq(TaskStatus::Running.as_str()))
            .filter(Column::ProgressPercentage.lte(percentage))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn touch_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let at = to_millis(at);
        let result = Entity::update_many()
            .col_expr(Column::LastHeartbeat, Expr::value(at))
            .col_expr(Column::UpdatedAt, Expr::value(at))
            .filter(Column::Id.eq(id.to_string()))
            .filter(Column::Status.eq(TaskStatus::Running.as_str()))
            .filter(
                Condition::any()
                    .add(Column::LastHeartbeat.is_null())
                    .add(Column::LastHeartbeat.lte(at)),
            )
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn list(&self, filter: &TaskFilter, pagination: &Pagination) -> Result<Vec<Task>> {
        let pagination = pagination.check();
        let models = Entity::find()
            .filter(Self::filter_condition(filter))
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .offset(pagination.offset())
            .limit(pagination.limit())
            .all(&self.db)
            .await?;
        Self::into_tasks(models)
    }

    async fn find_dispatchable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        let due = Condition::any()
            .add(Column::Status.eq(TaskStatus::Pending.as_str()))
            .add(
                Condition::all()
                    .add(Column::Status.eq(TaskStatus::Scheduled.as_str()))
                    .add(
                        Condition::any()
                            .add(Column::ScheduledFor.is_null())
                            .add(Column::ScheduledFor.lte(to_millis(now))),
                    ),
            );
        let models = Entity::find()
            .filter(due)
            .order_by_desc(Column::Priority)
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .limit(limit as u64)
            .all(&self.db)
            .await?;
        Self::into_tasks(models)
    }

    async fn find_stuck(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        let models = Entity::find()
            .filter(Column::Status.eq(TaskStatus::Running.as_str()))
            .filter(
                Condition::any()
                    .add(Column::LastHeartbeat.is_null())
                    .add(Column::LastHeartbeat.lt(to_millis(cutoff))),
            )
            .order_by_desc(Column::CreatedAt)
            .all(&self.db)
            .await?;
        Self::into_tasks(models)
    }

    async fn find_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        let models = Entity::find()
            .filter(Self::terminal_before(cutoff))
            .order_by_desc(Column::CreatedAt)
            .all(&self.db)
            .await?;
        Self::into_tasks(models)
    }

    async fn count_by_status(&self) -> Result<HashMap<TaskStatus, u64>> {
        let rows: Vec<(String, i64)> = Entity::find()
            .select_only()
            .column(Column::Status)
            .column_as(Expr::col(Column::Id).count(), "count")
            .group_by(Column::Status)
            .into_tuple()
            .all(&self.db)
            .await?;

        rows.into_iter()
            .map(|(status, count)| {
                let status: TaskStatus = status.parse().map_err(TaskError::Storage)?;
                Ok((status, count.max(0) as u64))
            })
            .collect()
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = Entity::delete_by_id(id.to_string()).exec(&self.db).await?;
        Ok(result.rows_affected > 0)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = Entity::delete_many()
            .filter(Self::terminal_before(cutoff))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn backup(&self, destination: &Path) -> Result<u64> {
        if tokio::fs::try_exists(destination).await? {
            return Err(TaskError::Validation(format!(
                "backup target already exists: {}",
                destination.display()
            )));
        }
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        sqlx::query("VACUUM INTO ?")
            .bind(destination.to_string_lossy().to_string())
            .execute(&self.pool)
            .await?;

        let size = tokio::fs::metadata(destination).await?.len();
        info!("SQLite backup written to {} ({} bytes)", destination.display(), size);
        Ok(size)
    }

    async fn optimize(&self) -> Result<()> {
        sqlx::query("PRAGMA optimize").execute(&self.pool).await?;
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
