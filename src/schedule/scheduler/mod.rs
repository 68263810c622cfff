mod registry;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, TaskError};
use crate::schedule::broadcast::TaskBroadcaster;
use crate::schedule::executor::TaskExecutor;
use crate::schedule::types::{Task, TaskStatus};
use crate::storage::task::TaskStorage;
use crate::utils::clock::Clock;

pub use registry::Registry;
use registry::RegistrationGuard;

/// What [`TaskScheduler::schedule`] did with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Started,
    /// Already in flight; nothing new was spawned.
    AlreadyRunning,
    /// Every worker slot is busy. The dispatch loop picks it up later.
    Deferred,
    /// SCHEDULED for a later time.
    NotDue,
    NotDispatchable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The task was not executing and is now CANCELLED.
    Cancelled(Task),
    /// The execution was asked to stop. Its row turns CANCELLED once the body
    /// returns or the grace period runs out.
    InterruptRequested,
}

pub(crate) fn chrono_duration(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| TaskError::Config(format!("duration out of range: {:?}: {}", duration, e)))
}

/// Turns dispatchable tasks into at most one execution each, bounded by a
/// worker pool, and runs the stuck and retention sweeps.
pub struct TaskScheduler {
    storage: Arc<dyn TaskStorage>,
    executor: Arc<TaskExecutor>,
    broadcaster: Arc<TaskBroadcaster>,
    clock: Arc<dyn Clock>,
    registry: Arc<Registry>,
    slots: Arc<Semaphore>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
    config: SchedulerConfig,
}

impl TaskScheduler {
    pub fn new(
        storage: Arc<dyn TaskStorage>,
        executor: Arc<TaskExecutor>,
        broadcaster: Arc<TaskBroadcaster>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            storage,
            executor,
            broadcaster,
            clock,
            registry: Arc::new(Registry::new()),
            slots: Arc::new(Semaphore::new(config.workers.max(1))),
            wake: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Starts `task` now if it is dispatchable, due, not already in flight and
    /// a worker slot is free. Only the enqueue step can fail; the outcome of
    /// the execution itself lands in the task row.
    pub fn schedule(&self, task: &Task) -> Result<DispatchOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(TaskError::Dispatch("scheduler is shut down".into()));
        }
        if !task.status.is_dispatchable() {
            return Ok(DispatchOutcome::NotDispatchable);
        }
        let now = self.clock.now();
        if !task.is_due(now) {
            return Ok(DispatchOutcome::NotDue);
        }
        if self.registry.contains(task.id) {
            return Ok(DispatchOutcome::AlreadyRunning);
        }
        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(task_id = %task.id, "All workers busy, deferring");
                return Ok(DispatchOutcome::Deferred);
            }
        };

        let cancel = CancellationToken::new();
        if !self.registry.try_register(task.id, cancel.clone(), now) {
            return Ok(DispatchOutcome::AlreadyRunning);
        }

        let id = task.id;
        let guard = RegistrationGuard::new(self.registry.clone(), id);
        let executor = self.executor.clone();
        let wake = self.wake.clone();
        let join = tokio::spawn(async move {
            let outcome = executor.execute(id, cancel).await;
            debug!(task_id = %id, ?outcome, "Execution finished");
            drop(guard);
            drop(permit);
            wake.notify_one();
        });
        self.registry.attach(id, join.abort_handle());

        debug!(task_id = %id, task_type = %task.task_type, "Task dispatched");
        Ok(DispatchOutcome::Started)
    }

    /// Cancels a task that has not started directly in the store, or signals
    /// the execution that holds a RUNNING one.
    ///
    /// A PENDING or SCHEDULED row is cancelled by compare-and-set even when an
    /// execution is already registered for it; that execution then fails its
    /// own start write and never runs the body.
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome> {
        let task = self.storage.get(id).await?.ok_or(TaskError::NotFound(id))?;
        if task.status.is_terminal() {
            return Err(task.invalid_state("cancel"));
        }
        if task.status == TaskStatus::Running {
            let dispatched_at = self.registry.dispatched_at(id);
            if self.registry.signal_cancel(id) {
                info!(task_id = %id, ?dispatched_at, "Cancellation signalled to running execution");
                return Ok(CancelOutcome::InterruptRequested);
            }
            // RUNNING without a registration is an orphan of a previous process
        }

        let previous = task.status;
        let mut cancelled = task;
        cancelled.cancel(self.clock.now())?;
        if self.storage.compare_and_save(&cancelled, previous).await? {
            info!(task_id = %id, from = %previous, "Task cancelled");
            self.broadcaster.publish(&cancelled);
            return Ok(CancelOutcome::Cancelled(cancelled));
        }

        // lost a race, most likely against the executor's start write
        match self.storage.get(id).await? {
            Some(current) if current.status == TaskStatus::Running && self.registry.signal_cancel(id) => {
                info!(task_id = %id, "Task started meanwhile, cancellation signalled");
                Ok(CancelOutcome::InterruptRequested)
            }
            Some(current) if current.status.is_terminal() => Err(current.invalid_state("cancel")),
            _ => {
                warn!(task_id = %id, "Task changed while cancelling");
                Err(TaskError::Conflict(id))
            }
        }
    }

    /// Resets RUNNING tasks with a stale heartbeat to PENDING and dispatches
    /// them again. Tasks held by this process are left alone.
    pub async fn recover_stuck(&self) -> Result<Vec<Uuid>> {
        let now = self.clock.now();
        let cutoff = now - chrono_duration(self.config.stuck_threshold)?;
        let stuck = self.storage.find_stuck(cutoff).await?;

        let mut recovered = Vec::new();
        for mut task in stuck {
            if self.registry.contains(task.id) {
                continue;
            }
            let last_heartbeat = task.last_heartbeat;
            task.requeue(now)?;
            if !self.storage.compare_and_save(&task, TaskStatus::Running).await? {
                continue;
            }
            warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                ?last_heartbeat,
                "Recovered stuck task"
            );
            self.broadcaster.publish(&task);
            match self.schedule(&task) {
                Ok(outcome) => debug!(task_id = %task.id, ?outcome, "Re-dispatched recovered task"),
                Err(e) => warn!(task_id = %task.id, "Recovered task not dispatched: {}", e),
            }
            recovered.push(task.id);
        }
        if !recovered.is_empty() {
            info!("Stuck sweep recovered {} tasks", recovered.len());
        }
        Ok(recovered)
    }

    /// Deletes COMPLETED and FAILED tasks that finished before `cutoff`.
    pub async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = self.storage.delete_terminal_before(cutoff).await?;
        if deleted > 0 {
            info!("Retention sweep deleted {} tasks finished before {}", deleted, cutoff);
        }
        Ok(deleted)
    }

    /// Fills free worker slots with due tasks, highest priority first.
    pub async fn dispatch_due(&self) -> Result<usize> {
        let free = self.slots.available_permits();
        if free == 0 || self.shutdown.is_cancelled() {
            return Ok(0);
        }
        // claimed tasks stay PENDING until their executor marks them RUNNING
        let limit = free + self.registry.len();
        let candidates = self.storage.find_dispatchable(self.clock.now(), limit).await?;

        let mut started = 0;
        for task in candidates {
            match self.schedule(&task)? {
                DispatchOutcome::Started => started += 1,
                DispatchOutcome::Deferred => break,
                _ => {}
            }
        }
        if started > 0 {
            debug!("Dispatch loop started {} tasks", started);
        }
        Ok(started)
    }

    /// Spawns the dispatch, stuck-sweep and retention loops.
    pub fn start(self: &Arc<Self>) {
        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        if !loops.is_empty() {
            warn!("Scheduler loops already running");
            return;
        }

        let scheduler = self.clone();
        loops.push(tokio::spawn(async move { scheduler.dispatch_loop().await }));
        let scheduler = self.clone();
        loops.push(tokio::spawn(async move { scheduler.stuck_sweep_loop().await }));
        let scheduler = self.clone();
        loops.push(tokio::spawn(async move { scheduler.retention_loop().await }));

        info!(
            workers = self.config.workers,
            stuck_threshold = ?self.config.stuck_threshold,
            retention = ?self.config.retention,
            "Task scheduler started"
        );
    }

    async fn dispatch_loop(&self) {
        let mut ticker = interval(self.config.dispatch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.dispatch_due().await {
                error!("Dispatch loop failed: {}", e);
            }
        }
        debug!("Dispatch loop stopped");
    }

    async fn stuck_sweep_loop(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = sleep(self.config.stuck_sweep_initial_delay) => {}
        }
        let mut ticker = interval(self.config.stuck_sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.recover_stuck().await {
                error!("Stuck sweep failed: {}", e);
            }
        }
        debug!("Stuck sweep stopped");
    }

    async fn retention_loop(&self) {
        let mut ticker = interval(self.config.retention_sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let cutoff = match chrono_duration(self.config.retention) {
                Ok(retention) => self.clock.now() - retention,
                Err(e) => {
                    error!("Retention sweep disabled: {}", e);
                    break;
                }
            };
            if let Err(e) = self.purge_expired(cutoff).await {
                error!("Retention sweep failed: {}", e);
            }
        }
        debug!("Retention sweep stopped");
    }

    /// Stops the loops and aborts in-flight executions. Their rows stay
    /// RUNNING so the next process's stuck sweep picks them up.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let loops: Vec<JoinHandle<()>> = self
            .loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in loops {
            if let Err(e) = handle.await {
                warn!("Scheduler loop ended abnormally: {}", e);
            }
        }
        let aborted = self.registry.abort_all();
        info!("Task scheduler stopped, {} executions aborted", aborted);
    }
}
