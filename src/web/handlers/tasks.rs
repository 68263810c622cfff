use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::ApiError;
use crate::error::TaskError;
use crate::schedule::broadcast::TaskStream;
use crate::schedule::scheduler::CancelOutcome;
use crate::schedule::service::{TaskService, TaskStats};
use crate::schedule::types::{NewTask, Task, TaskFilter, TaskParams, TaskPriority, TaskStatus, TaskType};
use crate::utils::http::ApiResponse;
use crate::web::Pagination;

pub fn tasks_router(service: Arc<TaskService>) -> Router {
    Router::new()
        .route("/", post(create_task).get(list_tasks))
        .route("/stats", get(get_task_stats))
        .route("/stream", get(stream_tasks))
        .route("/cleanup", post(cleanup_tasks))
        .route("/recover", post(recover_tasks))
        .route("/:task_id", get(get_task))
        .route("/:task_id/cancel", post(cancel_task))
        .route("/:task_id/retry", post(retry_task))
        .route("/:task_id/pause", post(pause_task))
        .route("/:task_id/resume", post(resume_task))
        .with_state(service)
}

type ApiResult<T> = Result<(StatusCode, Json<ApiResponse<T>>), ApiError>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(ApiResponse::success(data))))
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub priority: TaskPriority,
    pub video_file_id: Option<Uuid>,
    pub subtitle_id: Option<Uuid>,
    pub requested_by: Option<String>,
    pub max_retries: Option<u32>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl CreateTaskRequest {
    /// Decodes the type-specific payload into typed parameters.
    fn into_new_task(self) -> Result<NewTask, TaskError> {
        let params = match self.params {
            serde_json::Value::Null => json!({}),
            other => other,
        };
        let params: TaskParams =
            serde_json::from_value(json!({ "type": self.task_type, "params": params })).map_err(|e| {
                TaskError::Validation(format!("invalid params for {}: {}", self.task_type, e))
            })?;
        Ok(NewTask {
            params,
            priority: self.priority,
            video_file_id: self.video_file_id,
            subtitle_id: self.subtitle_id,
            requested_by: self.requested_by,
            max_retries: self.max_retries,
            scheduled_for: self.scheduled_for,
        })
    }
}

async fn create_task(
    State(service): State<Arc<TaskService>>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<Task> {
    let task = service.create_task(req.into_new_task()?).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(task))))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    status: Option<TaskStatus>,
    #[serde(rename = "type")]
    task_type: Option<TaskType>,
    resource: Option<Uuid>,
    requested_by: Option<String>,
    #[serde(default)]
    limit: u64,
    #[serde(default)]
    offset: u64,
}

async fn list_tasks(
    State(service): State<Arc<TaskService>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Task>> {
    let filter = TaskFilter {
        status: query.status,
        task_type: query.task_type,
        resource_id: query.resource,
        requested_by: query.requested_by,
    };
    let pagination = Pagination::new(query.limit, query.offset);
    ok(service.list_tasks(&filter, &pagination).await?)
}

async fn get_task_stats(State(service): State<Arc<TaskService>>) -> ApiResult<TaskStats> {
    ok(service.statistics().await?)
}

async fn get_task(
    State(service): State<Arc<TaskService>>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Task> {
    ok(service.get_task(task_id).await?)
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
    pub interrupt_requested: bool,
    pub task: Option<Task>,
}

async fn cancel_task(
    State(service): State<Arc<TaskService>>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<CancelResponse> {
    let response = match service.cancel_task(task_id).await? {
        CancelOutcome::Cancelled(task) => CancelResponse {
            cancelled: true,
            interrupt_requested: false,
            task: Some(task),
        },
        CancelOutcome::InterruptRequested => CancelResponse {
            cancelled: false,
            interrupt_requested: true,
            task: None,
        },
    };
    ok(response)
}

async fn retry_task(
    State(service): State<Arc<TaskService>>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Task> {
    ok(service.retry_task(task_id).await?)
}

async fn pause_task(
    State(service): State<Arc<TaskService>>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Task> {
    ok(service.pause_task(task_id).await?)
}

async fn resume_task(
    State(service): State<Arc<TaskService>>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Task> {
    ok(service.resume_task(task_id).await?)
}

#[derive(Debug, Deserialize)]
pub struct CleanupRequest {
    age_days: u32,
}

async fn cleanup_tasks(
    State(service): State<Arc<TaskService>>,
    Json(req): Json<CleanupRequest>,
) -> ApiResult<serde_json::Value> {
    let deleted = service.cleanup_old_tasks(req.age_days).await?;
    ok(json!({ "deleted": deleted }))
}

async fn recover_tasks(State(service): State<Arc<TaskService>>) -> ApiResult<serde_json::Value> {
    let recovered = service.recover_stuck_tasks().await?;
    ok(json!({ "recovered": recovered }))
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    status: Option<TaskStatus>,
    #[serde(rename = "type")]
    task_type: Option<TaskType>,
    task_id: Option<Uuid>,
}

/// Server-sent events, one JSON task snapshot per `task` event.
async fn stream_tasks(
    State(service): State<Arc<TaskService>>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let updates = service.subscribe_where(move |task| {
        query.status.map_or(true, |status| task.status == status)
            && query.task_type.map_or(true, |task_type| task.task_type == task_type)
            && query.task_id.map_or(true, |id| task.id == id)
    });
    Sse::new(events(updates)).keep_alive(KeepAlive::default())
}

fn events(updates: TaskStream) -> impl Stream<Item = Result<Event, Infallible>> {
    updates.filter_map(|task| async move {
        Event::default()
            .event("task")
            .json_data(&task)
            .ok()
            .map(Ok)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutorConfig, SchedulerConfig};
    use crate::schedule::broadcast::TaskBroadcaster;
    use crate::schedule::processors::OptimizeProcessor;
    use crate::schedule::{create_service, TaskProcessor};
    use crate::storage::task::memory::InMemoryTaskStorage;
    use crate::storage::task::TaskStorage;
    use crate::utils::clock::SystemClock;
    use crate::AppContext;

    async fn serve() -> (String, Arc<TaskService>) {
        let storage: Arc<dyn TaskStorage> = Arc::new(InMemoryTaskStorage::new());
        let processors: Vec<Arc<dyn TaskProcessor>> =
            vec![Arc::new(OptimizeProcessor::new(storage.clone()))];
        let service = Arc::new(create_service(
            storage,
            processors,
            Arc::new(TaskBroadcaster::new(16)),
            Arc::new(SystemClock),
            SchedulerConfig::default(),
            ExecutorConfig::default(),
        ));
        let app = super::super::router(Arc::new(AppContext {
            service: service.clone(),
        }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), service)
    }

    #[tokio::test]
    async fn test_create_and_fetch_task() {
        let (base, _service) = serve().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/tasks", base))
            .json(&json!({ "type": "OPTIMIZE_DATABASE", "priority": "HIGH" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["priority"], "HIGH");
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let fetched: serde_json::Value = client
            .get(format!("{}/tasks/{}", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(fetched["data"]["id"], id);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let (base, _service) = serve().await;
        let client = reqwest::Client::new();

        let missing = client
            .get(format!("{}/tasks/{}", base, Uuid::new_v4()))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        let unsupported = client
            .post(format!("{}/tasks", base))
            .json(&json!({ "type": "SCAN_LIBRARY", "params": { "paths": ["/a"] } }))
            .send()
            .await
            .unwrap();
        assert_eq!(unsupported.status(), reqwest::StatusCode::BAD_REQUEST);

        let malformed = client
            .post(format!("{}/tasks", base))
            .json(&json!({ "type": "SYNC_SUBTITLES", "params": { "video_path": 3 } }))
            .send()
            .await
            .unwrap();
        assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = malformed.json().await.unwrap();
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_stats_and_health() {
        let (base, _service) = serve().await;
        let client = reqwest::Client::new();

        let stats: serde_json::Value = client
            .get(format!("{}/tasks/stats", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["data"]["total"], 0);
        assert_eq!(stats["data"]["counts"]["PENDING"], 0);

        let health = client.get(format!("{}/health", base)).send().await.unwrap();
        assert!(health.status().is_success());
    }

    async fn create(client: &reqwest::Client, base: &str, body: serde_json::Value) -> serde_json::Value {
        let response = client.post(format!("{}/tasks", base)).json(&body).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        let body: serde_json::Value = response.json().await.unwrap();
        body["data"].clone()
    }

    async fn wait_until(client: &reqwest::Client, base: &str, id: &str, status: &str) {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let body: serde_json::Value = client
                .get(format!("{}/tasks/{}", base, id))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if body["data"]["status"] == status {
                return;
            }
            assert!(tokio::time::Instant::now() < deadline, "task never reached {}", status);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    /// Next `task` event of an SSE response, skipping keep-alive comments.
    async fn next_task_event(response: &mut reqwest::Response, buffer: &mut String) -> serde_json::Value {
        loop {
            if let Some(end) = buffer.find("\n\n") {
                let frame: String = buffer.drain(..end + 2).collect();
                let mut event = None;
                let mut data = String::new();
                for line in frame.lines() {
                    if let Some(name) = line.strip_prefix("event:") {
                        event = Some(name.trim().to_string());
                    } else if let Some(payload) = line.strip_prefix("data:") {
                        data.push_str(payload.trim_start());
                    }
                }
                if event.as_deref() == Some("task") {
                    return serde_json::from_str(&data).unwrap();
                }
                continue;
            }
            let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), response.chunk())
                .await
                .expect("no event within 5s")
                .unwrap()
                .expect("event stream ended");
            buffer.push_str(std::str::from_utf8(&chunk).unwrap());
        }
    }

    #[tokio::test]
    async fn test_stream_follows_task_to_completion() {
        let (base, _service) = serve().await;
        let client = reqwest::Client::new();

        let mut stream = client
            .get(format!("{}/tasks/stream?type=OPTIMIZE_DATABASE", base))
            .send()
            .await
            .unwrap();
        assert!(stream.status().is_success());

        let created = create(&client, &base, json!({ "type": "OPTIMIZE_DATABASE" })).await;
        let mut buffer = String::new();
        let mut statuses = Vec::new();
        loop {
            let task = next_task_event(&mut stream, &mut buffer).await;
            assert_eq!(task["id"], created["id"]);
            assert!(task["progress_percentage"].is_u64());
            assert!(task["updated_at"].is_string());
            let status = task["status"].as_str().unwrap().to_string();
            if statuses.last() != Some(&status) {
                statuses.push(status.clone());
            }
            if status == "COMPLETED" {
                assert_eq!(task["progress_percentage"], 100);
                break;
            }
        }
        assert_eq!(statuses, vec!["PENDING", "RUNNING", "COMPLETED"]);
    }

    #[tokio::test]
    async fn test_stream_by_task_id_sees_cancellation() {
        let (base, _service) = serve().await;
        let client = reqwest::Client::new();

        let later = Utc::now() + chrono::Duration::hours(1);
        let created = create(
            &client,
            &base,
            json!({ "type": "OPTIMIZE_DATABASE", "scheduled_for": later }),
        )
        .await;
        assert_eq!(created["status"], "SCHEDULED");
        let id = created["id"].as_str().unwrap().to_string();
        // unrelated updates are filtered out
        create(&client, &base, json!({ "type": "OPTIMIZE_DATABASE" })).await;

        let mut stream = client
            .get(format!("{}/tasks/stream?task_id={}", base, id))
            .send()
            .await
            .unwrap();
        let cancelled: serde_json::Value = client
            .post(format!("{}/tasks/{}/cancel", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(cancelled["data"]["cancelled"], true);
        assert_eq!(cancelled["data"]["task"]["status"], "CANCELLED");

        let mut buffer = String::new();
        let event = next_task_event(&mut stream, &mut buffer).await;
        assert_eq!(event["id"], id.as_str());
        assert_eq!(event["status"], "CANCELLED");
        assert!(event["completed_at"].is_string());
    }

    #[tokio::test]
    async fn test_cancel_and_retry_of_finished_task_conflict() {
        let (base, _service) = serve().await;
        let client = reqwest::Client::new();

        let created = create(&client, &base, json!({ "type": "OPTIMIZE_DATABASE" })).await;
        let id = created["id"].as_str().unwrap().to_string();
        wait_until(&client, &base, &id, "COMPLETED").await;

        let cancel = client
            .post(format!("{}/tasks/{}/cancel", base, id))
            .send()
            .await
            .unwrap();
        assert_eq!(cancel.status(), reqwest::StatusCode::CONFLICT);
        let body: serde_json::Value = cancel.json().await.unwrap();
        assert_eq!(body["success"], false);

        let retry = client
            .post(format!("{}/tasks/{}/retry", base, id))
            .send()
            .await
            .unwrap();
        assert_eq!(retry.status(), reqwest::StatusCode::CONFLICT);

        let unknown = client
            .post(format!("{}/tasks/{}/retry", base, Uuid::new_v4()))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pause_and_resume_routes() {
        let (base, _service) = serve().await;
        let client = reqwest::Client::new();

        let later = Utc::now() + chrono::Duration::hours(1);
        let created = create(
            &client,
            &base,
            json!({ "type": "OPTIMIZE_DATABASE", "scheduled_for": later }),
        )
        .await;
        let id = created["id"].as_str().unwrap().to_string();

        let paused: serde_json::Value = client
            .post(format!("{}/tasks/{}/pause", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(paused["data"]["status"], "PAUSED");

        let again = client
            .post(format!("{}/tasks/{}/pause", base, id))
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), reqwest::StatusCode::CONFLICT);

        let resumed: serde_json::Value = client
            .post(format!("{}/tasks/{}/resume", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resumed["data"]["status"], "PENDING");
        wait_until(&client, &base, &id, "COMPLETED").await;
    }

    #[test]
    fn test_request_decodes_typed_params() {
        let req: CreateTaskRequest = serde_json::from_value(json!({
            "type": "TRANSLATE_SUBTITLES",
            "params": { "subtitle_path": "/s.srt", "target_language": "fr" },
            "requested_by": "alice"
        }))
        .unwrap();
        let new = req.into_new_task().unwrap();
        assert_eq!(new.params.task_type(), TaskType::TranslateSubtitles);
        assert_eq!(new.requested_by.as_deref(), Some("alice"));
    }
}
