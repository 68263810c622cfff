use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::error::{Result, TaskError};
use crate::schedule::broadcast::TaskBroadcaster;
use crate::schedule::processors::TaskProcessor;
use crate::schedule::types::{Task, TaskParams, TaskResult, TaskStatus, TaskType};
use crate::storage::task::TaskStorage;
use crate::utils::clock::Clock;

mod context;

pub use context::{Cancelled, TaskContext};

/// How one execution attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed(String),
    Cancelled,
    TimedOut,
    /// Nothing ran: the task was missing, no longer dispatchable, or another
    /// writer moved it first.
    Skipped,
}

enum Verdict {
    Completed(TaskResult),
    Failed(String),
    Cancelled,
    TimedOut(String),
}

type BodyResult = std::result::Result<anyhow::Result<TaskResult>, Box<dyn Any + Send>>;

enum Step {
    Finished(BodyResult),
    TimedOut,
    CancelRequested,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Drives one task through RUNNING to a terminal status.
pub struct TaskExecutor {
    storage: Arc<dyn TaskStorage>,
    broadcaster: Arc<TaskBroadcaster>,
    clock: Arc<dyn Clock>,
    processors: HashMap<TaskType, Arc<dyn TaskProcessor>>,
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(
        storage: Arc<dyn TaskStorage>,
        broadcaster: Arc<TaskBroadcaster>,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            storage,
            broadcaster,
            clock,
            processors: HashMap::new(),
            config,
        }
    }

    pub fn register_processor(&mut self, processor: Arc<dyn TaskProcessor>) {
        let task_type = processor.task_type();
        info!("Registering processor for {}", task_type);
        self.processors.insert(task_type, processor);
    }

    pub fn supports(&self, task_type: TaskType) -> bool {
        self.processors.contains_key(&task_type)
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Create-time check: structural validity plus whatever the processor
    /// for this type demands.
    pub fn validate(&self, params: &TaskParams) -> Result<()> {
        params.validate()?;
        let processor = self.processors.get(&params.task_type()).ok_or_else(|| {
            TaskError::Validation(format!("no processor registered for {}", params.task_type()))
        })?;
        processor.validate_params(params)
    }

    /// Runs one attempt of task `id`. Never returns an error: every failure
    /// ends up in the task row or the log.
    pub async fn execute(&self, id: Uuid, cancel: CancellationToken) -> ExecutionOutcome {
        let task = match self.storage.get(id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id = %id, "Task vanished before execution");
                return ExecutionOutcome::Skipped;
            }
            Err(e) => {
                error!(task_id = %id, "Failed to load task for execution: {}", e);
                return ExecutionOutcome::Skipped;
            }
        };

        if !task.status.is_dispatchable() {
            debug!(task_id = %id, status = %task.status, "Task not dispatchable, skipping");
            return ExecutionOutcome::Skipped;
        }

        if cancel.is_cancelled() {
            return self.cancel_before_start(task).await;
        }

        let previous = task.status;
        let mut running = task;
        if let Err(e) = running.start(self.clock.now()) {
            warn!(task_id = %id, "Cannot start task: {}", e);
            return ExecutionOutcome::Skipped;
        }
        match self.storage.compare_and_save(&running, previous).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = %id, "Task changed before start, skipping");
                return ExecutionOutcome::Skipped;
            }
            Err(e) => {
                error!(task_id = %id, "Failed to mark task running: {}", e);
                return ExecutionOutcome::Skipped;
            }
        }
        info!(
            task_id = %id,
            task_type = %running.task_type,
            attempt = running.retry_count + 1,
            "Task started"
        );
        self.broadcaster.publish(&running);

        let ctx = TaskContext::new(
            running.clone(),
            self.storage.clone(),
            self.broadcaster.clone(),
            self.clock.clone(),
            cancel.clone(),
            self.config.progress_events_per_sec,
        );

        let verdict = match self.processors.get(&running.task_type).cloned() {
            Some(processor) => self.run_body(processor, &ctx, running.params.clone(), &cancel).await,
            None => Verdict::Failed(format!("no processor registered for {}", running.task_type)),
        };

        self.finish(&ctx, verdict).await
    }

    async fn cancel_before_start(&self, task: Task) -> ExecutionOutcome {
        let previous = task.status;
        let mut cancelled = task;
        if cancelled.cancel(self.clock.now()).is_err() {
            return ExecutionOutcome::Skipped;
        }
        match self.storage.compare_and_save(&cancelled, previous).await {
            Ok(true) => {
                info!(task_id = %cancelled.id, "Task cancelled before start");
                self.broadcaster.publish(&cancelled);
                ExecutionOutcome::Cancelled
            }
            Ok(false) => ExecutionOutcome::Skipped,
            Err(e) => {
                error!(task_id = %cancelled.id, "Failed to cancel task: {}", e);
                ExecutionOutcome::Skipped
            }
        }
    }

    async fn run_body(
        &self,
        processor: Arc<dyn TaskProcessor>,
        ctx: &TaskContext,
        params: TaskParams,
        cancel: &CancellationToken,
    ) -> Verdict {
        let mut body = Box::pin(AssertUnwindSafe(processor.process(ctx.clone(), params)).catch_unwind());
        let deadline = sleep(self.config.execution_timeout);
        tokio::pin!(deadline);

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let step = loop {
            tokio::select! {
                result = &mut body => break Step::Finished(result),
                _ = &mut deadline => break Step::TimedOut,
                _ = heartbeat.tick() => ctx.heartbeat().await,
                _ = cancel.cancelled() => break Step::CancelRequested,
            }
        };

        let result = match step {
            Step::Finished(result) => result,
            Step::TimedOut => {
                // dropping the body kills any tool it is waiting on
                drop(body);
                return Verdict::TimedOut(format!(
                    "Execution timed out after {:?}",
                    self.config.execution_timeout
                ));
            }
            Step::CancelRequested => {
                debug!(task_id = %ctx.task_id(), "Cancellation requested, waiting for body");
                let grace = sleep(self.config.cancel_grace);
                tokio::pin!(grace);
                let settled = loop {
                    tokio::select! {
                        result = &mut body => break Some(result),
                        _ = &mut grace => break None,
                        _ = heartbeat.tick() => ctx.heartbeat().await,
                    }
                };
                return match settled {
                    // finished work is kept even if the cancel arrived late
                    Some(Ok(Ok(result))) => Verdict::Completed(result),
                    Some(_) => Verdict::Cancelled,
                    None => {
                        warn!(
                            task_id = %ctx.task_id(),
                            "Body ignored cancellation for {:?}, dropping it",
                            self.config.cancel_grace
                        );
                        drop(body);
                        Verdict::Cancelled
                    }
                };
            }
        };

        match result {
            Ok(Ok(output)) => Verdict::Completed(output),
            Ok(Err(_)) if cancel.is_cancelled() => Verdict::Cancelled,
            Ok(Err(e)) => Verdict::Failed(format!("{:#}", e)),
            Err(payload) => Verdict::Failed(format!(
                "Execution body panicked: {}",
                panic_message(payload.as_ref())
            )),
        }
    }

    async fn finish(&self, ctx: &TaskContext, verdict: Verdict) -> ExecutionOutcome {
        let mut task = ctx.snapshot();
        let now = self.clock.now();

        let (transition, outcome) = match verdict {
            Verdict::Completed(result) => (task.complete(result, now), ExecutionOutcome::Completed),
            Verdict::Failed(message) => {
                let outcome = ExecutionOutcome::Failed(message.clone());
                (task.fail(message, now), outcome)
            }
            Verdict::TimedOut(message) => (task.fail(message, now), ExecutionOutcome::TimedOut),
            Verdict::Cancelled => (task.cancel(now), ExecutionOutcome::Cancelled),
        };
        if let Err(e) = transition {
            error!(task_id = %task.id, "Invalid terminal transition: {}", e);
            return outcome;
        }

        for attempt in 1..=2 {
            match self.storage.compare_and_save(&task, TaskStatus::Running).await {
                Ok(true) => {
                    match &outcome {
                        ExecutionOutcome::Failed(message) => {
                            warn!(task_id = %task.id, task_type = %task.task_type, "Task failed: {}", message)
                        }
                        _ => info!(
                            task_id = %task.id,
                            task_type = %task.task_type,
                            status = %task.status,
                            "Task finished"
                        ),
                    }
                    self.broadcaster.publish(&task);
                    return outcome;
                }
                Ok(false) => {
                    warn!(
                        task_id = %task.id,
                        "Task left RUNNING while executing, dropping {} result",
                        task.status
                    );
                    return outcome;
                }
                Err(e) if attempt == 1 => {
                    warn!(task_id = %task.id, "Terminal write failed, retrying: {}", e);
                }
                Err(e) => {
                    error!(
                        task_id = %task.id,
                        "Terminal write failed twice, leaving it to the stuck sweep: {}",
                        e
                    );
                }
            }
        }
        outcome
    }
}
