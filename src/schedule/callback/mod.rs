use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::schedule::broadcast::TaskBroadcaster;
use crate::schedule::types::{Task, TaskStatus, TaskType};

#[derive(Debug, Serialize)]
struct CallbackPayload<'a> {
    task_id: Uuid,
    task_type: TaskType,
    status: TaskStatus,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<&'a str>,
    task: &'a Task,
}

/// POSTs every terminal task snapshot to a fixed URL.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    callback_url: String,
}

impl WebhookNotifier {
    pub fn new(callback_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            callback_url: callback_url.into(),
        })
    }

    pub async fn notify(&self, task: &Task) -> Result<()> {
        let payload = CallbackPayload {
            task_id: task.id,
            task_type: task.task_type,
            status: task.status,
            completed_at: task.completed_at,
            error_message: task.error_message.as_deref(),
            task,
        };
        self.client
            .post(&self.callback_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Forwards terminal updates until `shutdown` fires or the broadcaster
    /// closes. Delivery failures are logged and dropped.
    pub fn spawn(self, broadcaster: &TaskBroadcaster, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut updates = broadcaster.subscribe_where(|task| task.status.is_terminal());
        info!("Webhook notifier posting to {}", self.callback_url);
        tokio::spawn(async move {
            loop {
                let task = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = updates.next() => match next {
                        Some(task) => task,
                        None => break,
                    },
                };
                match self.notify(&task).await {
                    Ok(()) => debug!(task_id = %task.id, status = %task.status, "Webhook delivered"),
                    Err(e) => warn!(task_id = %task.id, "Webhook delivery failed: {:#}", e),
                }
            }
            debug!("Webhook notifier stopped");
        })
    }
}
