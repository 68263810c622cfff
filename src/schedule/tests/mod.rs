//! End-to-end behaviour of executor, scheduler and service over the
//! in-memory store, a manual clock and scripted processors.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::*;
use crate::config::{ExecutorConfig, SchedulerConfig};
use crate::error::{Result as TaskResultOf, TaskError};
use crate::schedule::processors::ScanProcessor;
use crate::schedule::types::{
    BackupParams, HealthCheckParams, OptimizeParams, OptimizeResult, ScanParams,
};
use crate::storage::task::memory::InMemoryTaskStorage;
use crate::utils::clock::ManualClock;
use crate::web::Pagination;

/// Holds its body until released; optionally ignores cancellation.
#[derive(Default)]
struct Gate {
    release: CancellationToken,
    started: AtomicUsize,
    ignore_cancel: bool,
}

impl Gate {
    fn ignoring_cancel() -> Self {
        Self {
            ignore_cancel: true,
            ..Default::default()
        }
    }

    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

struct GateProcessor {
    task_type: TaskType,
    gate: Arc<Gate>,
}

#[async_trait]
impl TaskProcessor for GateProcessor {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn process(&self, ctx: TaskContext, _params: TaskParams) -> anyhow::Result<TaskResult> {
        self.gate.started.fetch_add(1, Ordering::SeqCst);
        ctx.progress(10, "waiting at gate").await;
        if self.gate.ignore_cancel {
            self.gate.release.cancelled().await;
        } else {
            tokio::select! {
                _ = self.gate.release.cancelled() => {}
                _ = ctx.cancellation().cancelled() => return Err(Cancelled.into()),
            }
        }
        Ok(TaskResult::OptimizeDatabase(OptimizeResult { duration_ms: 0 }))
    }
}

/// Completes immediately, remembering the order it ran tasks in.
struct Recorder {
    task_type: TaskType,
    order: Mutex<Vec<Uuid>>,
}

impl Recorder {
    fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            order: Mutex::new(Vec::new()),
        }
    }

    fn order(&self) -> Vec<Uuid> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskProcessor for Recorder {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn process(&self, ctx: TaskContext, _params: TaskParams) -> anyhow::Result<TaskResult> {
        self.order.lock().unwrap().push(ctx.task_id());
        ctx.progress(100, "recorded").await;
        Ok(TaskResult::OptimizeDatabase(OptimizeResult { duration_ms: 1 }))
    }
}

struct Failing(TaskType);

#[async_trait]
impl TaskProcessor for Failing {
    fn task_type(&self) -> TaskType {
        self.0
    }

    async fn process(&self, _ctx: TaskContext, _params: TaskParams) -> anyhow::Result<TaskResult> {
        Err(anyhow!("ffmpeg exited with code 1"))
    }
}

struct Panicking(TaskType);

#[async_trait]
impl TaskProcessor for Panicking {
    fn task_type(&self) -> TaskType {
        self.0
    }

    async fn process(&self, _ctx: TaskContext, _params: TaskParams) -> anyhow::Result<TaskResult> {
        panic!("subtitle index out of range")
    }
}

/// Fails the first `failures` terminal writes, then behaves.
struct FlakyTerminalWrites {
    inner: InMemoryTaskStorage,
    failures: AtomicUsize,
}

#[async_trait]
impl TaskStorage for FlakyTerminalWrites {
    async fn insert(&self, task: &Task) -> TaskResultOf<()> {
        self.inner.insert(task).await
    }

    async fn get(&self, id: Uuid) -> TaskResultOf<Option<Task>> {
        self.inner.get(id).await
    }

    async fn compare_and_save(&self, task: &Task, expected: TaskStatus) -> TaskResultOf<bool> {
        if expected == TaskStatus::Running
            && task.status.is_terminal()
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(TaskError::Storage("database is locked".into()));
        }
        self.inner.compare_and_save(task, expected).await
    }

    async fn update_progress(
        &self,
        id: Uuid,
        percentage: u8,
        message: Option<&str>,
        at: DateTime<Utc>,
    ) -> TaskResultOf<bool> {
        self.inner.update_progress(id, percentage, message, at).await
    }

    async fn touch_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> TaskResultOf<bool> {
        self.inner.touch_heartbeat(id, at).await
    }

    async fn list(&self, filter: &TaskFilter, pagination: &Pagination) -> TaskResultOf<Vec<Task>> {
        self.inner.list(filter, pagination).await
    }

    async fn find_dispatchable(&self, now: DateTime<Utc>, limit: usize) -> TaskResultOf<Vec<Task>> {
        self.inner.find_dispatchable(now, limit).await
    }

    async fn find_stuck(&self, cutoff: DateTime<Utc>) -> TaskResultOf<Vec<Task>> {
        self.inner.find_stuck(cutoff).await
    }

    async fn find_terminal_before(&self, cutoff: DateTime<Utc>) -> TaskResultOf<Vec<Task>> {
        self.inner.find_terminal_before(cutoff).await
    }

    async fn count_by_status(&self) -> TaskResultOf<HashMap<TaskStatus, u64>> {
        self.inner.count_by_status().await
    }

    async fn delete(&self, id: Uuid) -> TaskResultOf<bool> {
        self.inner.delete(id).await
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> TaskResultOf<u64> {
        self.inner.delete_terminal_before(cutoff).await
    }

    async fn backup(&self, destination: &Path) -> TaskResultOf<u64> {
        self.inner.backup(destination).await
    }

    async fn optimize(&self) -> TaskResultOf<()> {
        self.inner.optimize().await
    }

    async fn ping(&self) -> TaskResultOf<()> {
        self.inner.ping().await
    }
}

fn executor_config() -> ExecutorConfig {
    ExecutorConfig {
        heartbeat_interval: Duration::from_millis(50),
        execution_timeout: Duration::from_secs(10),
        cancel_grace: Duration::from_millis(200),
        progress_events_per_sec: 100,
        default_max_retries: 2,
    }
}

fn scheduler_config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        workers,
        dispatch_interval: Duration::from_millis(50),
        stuck_threshold: Duration::from_secs(30 * 60),
        stuck_sweep_interval: Duration::from_secs(3600),
        stuck_sweep_initial_delay: Duration::from_secs(3600),
        retention: Duration::from_secs(7 * 24 * 3600),
        retention_sweep_interval: Duration::from_secs(24 * 3600),
    }
}

struct Harness {
    storage: Arc<dyn TaskStorage>,
    clock: ManualClock,
    service: TaskService,
}

impl Harness {
    fn new(workers: usize, processors: Vec<Arc<dyn TaskProcessor>>) -> Self {
        Self::build(
            Arc::new(InMemoryTaskStorage::new()),
            workers,
            processors,
            executor_config(),
        )
    }

    fn build(
        storage: Arc<dyn TaskStorage>,
        workers: usize,
        processors: Vec<Arc<dyn TaskProcessor>>,
        executor_config: ExecutorConfig,
    ) -> Self {
        let clock = ManualClock::default();
        let service = create_service(
            storage.clone(),
            processors,
            Arc::new(TaskBroadcaster::new(256)),
            Arc::new(clock.clone()),
            scheduler_config(workers),
            executor_config,
        );
        Self {
            storage,
            clock,
            service,
        }
    }

    fn scheduler(&self) -> &Arc<TaskScheduler> {
        self.service.scheduler()
    }

    async fn wait_for<F>(&self, id: Uuid, what: &str, predicate: F) -> Task
    where
        F: Fn(&Task) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(task) = self.storage.get(id).await.unwrap() {
                if predicate(&task) {
                    return task;
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_status(&self, id: Uuid, status: TaskStatus) -> Task {
        self.wait_for(id, status.as_str(), |t| t.status == status).await
    }

    /// Until every execution released its registry slot and worker permit.
    async fn wait_idle(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.scheduler().in_flight() > 0 {
            assert!(Instant::now() < deadline, "executions still in flight");
            sleep(Duration::from_millis(10)).await;
        }
        // the permit is released right after the registry slot
        sleep(Duration::from_millis(20)).await;
    }
}

fn gate(task_type: TaskType, gate: &Arc<Gate>) -> Arc<dyn TaskProcessor> {
    Arc::new(GateProcessor {
        task_type,
        gate: gate.clone(),
    })
}

fn health_check() -> NewTask {
    NewTask::new(TaskParams::HealthCheck(HealthCheckParams { probe_tools: false }))
}

fn optimize() -> NewTask {
    NewTask::new(TaskParams::OptimizeDatabase(OptimizeParams {}))
}

fn backup() -> NewTask {
    NewTask::new(TaskParams::BackupDatabase(BackupParams::default()))
}

async fn statuses_until_terminal(updates: &mut TaskStream, id: Uuid) -> Vec<TaskStatus> {
    let mut seen = Vec::new();
    loop {
        let task = timeout(Duration::from_secs(5), updates.next())
            .await
            .expect("no update within 5s")
            .expect("update stream closed");
        if task.id != id {
            continue;
        }
        if seen.last() != Some(&task.status) {
            seen.push(task.status);
        }
        if task.status.is_terminal() {
            return seen;
        }
    }
}

fn assert_valid_path(statuses: &[TaskStatus]) {
    for pair in statuses.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "invalid transition {} -> {} in {:?}",
            pair[0],
            pair[1],
            statuses
        );
    }
}

#[tokio::test]
async fn test_scan_task_runs_to_completion() {
    let h = Harness::new(2, vec![Arc::new(ScanProcessor)]);
    let mut updates = h.service.subscribe();

    let task = h
        .service
        .create_task(NewTask::new(TaskParams::ScanLibrary(ScanParams {
            paths: vec!["/nonexistent-library-root".into()],
            recursive: true,
            extensions: vec![],
        })))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);

    let statuses = statuses_until_terminal(&mut updates, task.id).await;
    assert_eq!(
        statuses,
        vec![TaskStatus::Pending, TaskStatus::Running, TaskStatus::Completed]
    );
    assert_valid_path(&statuses);

    let done = h.service.get_task(task.id).await.unwrap();
    assert_eq!(done.progress_percentage, 100);
    assert!(done.result.is_some());
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn test_cancel_pending_task_never_runs() {
    let blocker = Arc::new(Gate::default());
    let recorder = Arc::new(Recorder::new(TaskType::OptimizeDatabase));
    let h = Harness::new(
        1,
        vec![gate(TaskType::HealthCheck, &blocker), recorder.clone()],
    );
    let mut updates = h.service.subscribe();

    let running = h.service.create_task(health_check()).await.unwrap();
    h.wait_status(running.id, TaskStatus::Running).await;

    let queued = h.service.create_task(optimize()).await.unwrap();
    assert_eq!(queued.status, TaskStatus::Pending);

    match h.service.cancel_task(queued.id).await.unwrap() {
        CancelOutcome::Cancelled(task) => {
            assert_eq!(task.status, TaskStatus::Cancelled);
            assert!(task.completed_at.is_some());
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    blocker.release.cancel();
    h.wait_status(running.id, TaskStatus::Completed).await;
    h.wait_idle().await;
    assert_eq!(h.scheduler().dispatch_due().await.unwrap(), 0);

    let statuses = statuses_until_terminal(&mut updates, queued.id).await;
    assert_eq!(statuses, vec![TaskStatus::Pending, TaskStatus::Cancelled]);
    assert!(recorder.order().is_empty());
}

#[tokio::test]
async fn test_cancel_dispatched_pending_task_is_synchronous() {
    let held = Arc::new(Gate::default());
    let h = Harness::new(2, vec![gate(TaskType::HealthCheck, &held)]);
    let mut updates = h.service.subscribe();

    // a free worker means the task is registered before it is claimed
    let task = h.service.create_task(health_check()).await.unwrap();
    assert_eq!(h.scheduler().in_flight(), 1);

    match h.service.cancel_task(task.id).await.unwrap() {
        CancelOutcome::Cancelled(cancelled) => assert_eq!(cancelled.status, TaskStatus::Cancelled),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(
        h.service.get_task(task.id).await.unwrap().status,
        TaskStatus::Cancelled
    );

    h.wait_idle().await;
    assert_eq!(held.started(), 0);
    let statuses = statuses_until_terminal(&mut updates, task.id).await;
    assert_eq!(statuses, vec![TaskStatus::Pending, TaskStatus::Cancelled]);
    assert!(
        timeout(Duration::from_millis(100), updates.next()).await.is_err(),
        "no update may follow the cancellation"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_right_after_create_never_runs_cancelled_rows() {
    let held = Arc::new(Gate::default());
    let h = Harness::new(4, vec![gate(TaskType::HealthCheck, &held)]);

    let mut interrupted = 0;
    for _ in 0..50 {
        let task = h.service.create_task(health_check()).await.unwrap();
        match h.service.cancel_task(task.id).await.unwrap() {
            CancelOutcome::Cancelled(cancelled) => {
                assert_eq!(cancelled.status, TaskStatus::Cancelled);
                assert!(cancelled.started_at.is_none());
            }
            // the executor claimed the row first
            CancelOutcome::InterruptRequested => interrupted += 1,
        }
        h.wait_status(task.id, TaskStatus::Cancelled).await;
        h.wait_idle().await;
    }
    assert!(
        held.started() <= interrupted,
        "{} bodies ran for {} interrupted tasks",
        held.started(),
        interrupted
    );
}

#[tokio::test]
async fn test_cancel_finished_task_before_slot_release_is_invalid_state() {
    let h = Harness::new(1, vec![Arc::new(Recorder::new(TaskType::OptimizeDatabase))]);
    let task = h.service.create_task(optimize()).await.unwrap();
    h.wait_status(task.id, TaskStatus::Completed).await;
    h.wait_idle().await;

    // terminal row whose execution has not dropped its registration yet
    let token = CancellationToken::new();
    assert!(h
        .scheduler()
        .registry()
        .try_register(task.id, token.clone(), h.clock.now()));

    match h.service.cancel_task(task.id).await {
        Err(TaskError::InvalidState { status, action, .. }) => {
            assert_eq!(status, TaskStatus::Completed);
            assert_eq!(action, "cancel");
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert!(!token.is_cancelled());
    assert_eq!(
        h.service.get_task(task.id).await.unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn test_stuck_task_is_recovered_and_rerun() {
    let recorder = Arc::new(Recorder::new(TaskType::OptimizeDatabase));
    let h = Harness::new(2, vec![recorder.clone()]);
    let now = h.clock.now();

    // a RUNNING row left behind by a crashed process
    let mut orphan = Task::new(optimize(), now - ChronoDuration::minutes(61), 3);
    orphan.start(now - ChronoDuration::minutes(60)).unwrap();
    h.storage.insert(&orphan).await.unwrap();

    let mut updates = h.service.subscribe();
    let recovered = h.service.recover_stuck_tasks().await.unwrap();
    assert_eq!(recovered, vec![orphan.id]);

    let statuses = statuses_until_terminal(&mut updates, orphan.id).await;
    assert_eq!(
        statuses,
        vec![TaskStatus::Pending, TaskStatus::Running, TaskStatus::Completed]
    );
    let done = h.service.get_task(orphan.id).await.unwrap();
    assert_eq!(done.last_heartbeat, Some(now));
    assert_eq!(done.retry_count, 0);
    assert_eq!(recorder.order(), vec![orphan.id]);
}

#[tokio::test]
async fn test_stuck_sweep_is_idempotent() {
    let held = Arc::new(Gate::default());
    let h = Harness::new(2, vec![gate(TaskType::OptimizeDatabase, &held)]);
    let now = h.clock.now();

    let mut orphan = Task::new(optimize(), now - ChronoDuration::hours(2), 3);
    orphan.start(now - ChronoDuration::hours(2)).unwrap();
    h.storage.insert(&orphan).await.unwrap();
    let fresh = {
        let mut task = Task::new(optimize(), now, 3);
        task.start(now - ChronoDuration::minutes(5)).unwrap();
        task
    };
    h.storage.insert(&fresh).await.unwrap();

    let first = h.scheduler().recover_stuck().await.unwrap();
    let second = h.scheduler().recover_stuck().await.unwrap();
    assert_eq!(first, vec![orphan.id]);
    assert!(second.is_empty());

    h.wait_status(orphan.id, TaskStatus::Running).await;
    h.wait_for(orphan.id, "body start", |_| held.started() == 1).await;
    assert!(h.scheduler().recover_stuck().await.unwrap().is_empty());
    assert_eq!(held.started(), 1);

    // healthy heartbeat, untouched
    let untouched = h.service.get_task(fresh.id).await.unwrap();
    assert_eq!(untouched.status, TaskStatus::Running);

    held.release.cancel();
    h.wait_status(orphan.id, TaskStatus::Completed).await;
}

#[tokio::test]
async fn test_retry_requires_failed_status() {
    let h = Harness::new(2, vec![Arc::new(Recorder::new(TaskType::OptimizeDatabase))]);
    let task = h.service.create_task(optimize()).await.unwrap();
    let done = h.wait_status(task.id, TaskStatus::Completed).await;

    match h.service.retry_task(task.id).await {
        Err(TaskError::InvalidState { status, action, .. }) => {
            assert_eq!(status, TaskStatus::Completed);
            assert_eq!(action, "retry");
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(h.service.get_task(task.id).await.unwrap(), done);

    assert!(matches!(
        h.service.retry_task(Uuid::new_v4()).await,
        Err(TaskError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_failed_task_retries_until_limit() {
    let h = Harness::new(2, vec![Arc::new(Failing(TaskType::BackupDatabase))]);
    let task = h.service.create_task(backup()).await.unwrap();
    assert_eq!(task.max_retries, 2);

    let failed = h.wait_status(task.id, TaskStatus::Failed).await;
    assert_eq!(failed.error_message.as_deref(), Some("ffmpeg exited with code 1"));
    assert!(failed.completed_at.is_some());

    for attempt in 1..=2 {
        h.wait_idle().await;
        let retried = h.service.retry_task(task.id).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
        assert_eq!(retried.retry_count, attempt);
        assert!(retried.completed_at.is_none());
        assert!(retried.error_message.is_none());
        h.wait_for(task.id, "failed retry", |t| {
            t.status == TaskStatus::Failed && t.retry_count == attempt
        })
        .await;
    }

    h.wait_idle().await;
    assert!(matches!(
        h.service.retry_task(task.id).await,
        Err(TaskError::Validation(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_schedule_dispatches_once() {
    let held = Arc::new(Gate::default());
    let h = Harness::new(4, vec![gate(TaskType::OptimizeDatabase, &held)]);

    // inserted directly so create_task does not dispatch it first
    let task = Task::new(optimize(), h.clock.now(), 3);
    h.storage.insert(&task).await.unwrap();

    let calls: Vec<_> = (0..16)
        .map(|_| {
            let scheduler = h.scheduler().clone();
            let task = task.clone();
            tokio::spawn(async move { scheduler.schedule(&task).unwrap() })
        })
        .collect();
    let mut started = 0;
    for call in calls {
        if call.await.unwrap() == DispatchOutcome::Started {
            started += 1;
        }
    }
    assert_eq!(started, 1);
    assert_eq!(h.scheduler().in_flight(), 1);

    h.wait_status(task.id, TaskStatus::Running).await;
    assert_eq!(h.scheduler().schedule(&task).unwrap(), DispatchOutcome::AlreadyRunning);

    held.release.cancel();
    h.wait_status(task.id, TaskStatus::Completed).await;
    assert_eq!(held.started(), 1);
}

#[tokio::test]
async fn test_cancel_running_task_is_cooperative() {
    let held = Arc::new(Gate::default());
    let h = Harness::new(2, vec![gate(TaskType::HealthCheck, &held)]);
    let task = h.service.create_task(health_check()).await.unwrap();
    h.wait_for(task.id, "body start", |_| held.started() == 1).await;

    assert_eq!(
        h.service.cancel_task(task.id).await.unwrap(),
        CancelOutcome::InterruptRequested
    );
    let cancelled = h.wait_status(task.id, TaskStatus::Cancelled).await;
    assert!(cancelled.completed_at.is_some());
    assert!(cancelled.result.is_none());

    h.wait_idle().await;
    match h.service.cancel_task(task.id).await {
        Err(TaskError::InvalidState { status, .. }) => assert_eq!(status, TaskStatus::Cancelled),
        other => panic!("unexpected: {:?}", other),
    }
    assert!(matches!(
        h.service.cancel_task(Uuid::new_v4()).await,
        Err(TaskError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_body_ignoring_cancel_is_dropped_after_grace() {
    let stubborn = Arc::new(Gate::ignoring_cancel());
    let h = Harness::new(2, vec![gate(TaskType::HealthCheck, &stubborn)]);
    let task = h.service.create_task(health_check()).await.unwrap();
    h.wait_for(task.id, "body start", |_| stubborn.started() == 1).await;

    h.service.cancel_task(task.id).await.unwrap();
    // still RUNNING inside the grace period
    sleep(Duration::from_millis(50)).await;
    assert_eq!(h.service.get_task(task.id).await.unwrap().status, TaskStatus::Running);

    h.wait_status(task.id, TaskStatus::Cancelled).await;
    h.wait_idle().await;
}

#[tokio::test]
async fn test_execution_timeout_fails_task() {
    let stubborn = Arc::new(Gate::ignoring_cancel());
    let config = ExecutorConfig {
        execution_timeout: Duration::from_millis(100),
        ..executor_config()
    };
    let h = Harness::build(
        Arc::new(InMemoryTaskStorage::new()),
        1,
        vec![gate(TaskType::HealthCheck, &stubborn)],
        config,
    );
    let task = h.service.create_task(health_check()).await.unwrap();

    let failed = h.wait_status(task.id, TaskStatus::Failed).await;
    assert!(failed.error_message.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_panicking_body_fails_only_its_task() {
    let recorder = Arc::new(Recorder::new(TaskType::OptimizeDatabase));
    let h = Harness::new(
        2,
        vec![Arc::new(Panicking(TaskType::HealthCheck)), recorder.clone()],
    );
    let doomed = h.service.create_task(health_check()).await.unwrap();
    let fine = h.service.create_task(optimize()).await.unwrap();

    let failed = h.wait_status(doomed.id, TaskStatus::Failed).await;
    assert!(failed
        .error_message
        .unwrap()
        .contains("subtitle index out of range"));
    h.wait_status(fine.id, TaskStatus::Completed).await;
}

#[tokio::test]
async fn test_heartbeat_advances_while_running() {
    let held = Arc::new(Gate::default());
    let h = Harness::new(1, vec![gate(TaskType::HealthCheck, &held)]);
    let task = h.service.create_task(health_check()).await.unwrap();
    let running = h.wait_status(task.id, TaskStatus::Running).await;
    let first = running.last_heartbeat.unwrap();

    let mut previous = first;
    for _ in 0..3 {
        let later = h.clock.advance(ChronoDuration::seconds(90));
        let beat = h
            .wait_for(task.id, "heartbeat", |t| t.last_heartbeat == Some(later))
            .await
            .last_heartbeat
            .unwrap();
        assert!(beat >= previous);
        previous = beat;
    }
    assert_eq!(previous, first + ChronoDuration::seconds(270));

    held.release.cancel();
    h.wait_status(task.id, TaskStatus::Completed).await;
}

#[tokio::test]
async fn test_priority_orders_dispatch_when_saturated() {
    let blocker = Arc::new(Gate::default());
    let recorder = Arc::new(Recorder::new(TaskType::OptimizeDatabase));
    let h = Harness::new(
        1,
        vec![gate(TaskType::HealthCheck, &blocker), recorder.clone()],
    );

    let running = h.service.create_task(health_check()).await.unwrap();
    h.wait_status(running.id, TaskStatus::Running).await;

    let low = h
        .service
        .create_task(optimize().with_priority(TaskPriority::Low))
        .await
        .unwrap();
    let urgent = h
        .service
        .create_task(optimize().with_priority(TaskPriority::Urgent))
        .await
        .unwrap();

    blocker.release.cancel();
    h.wait_status(running.id, TaskStatus::Completed).await;
    h.wait_idle().await;

    assert_eq!(h.scheduler().dispatch_due().await.unwrap(), 1);
    h.wait_status(urgent.id, TaskStatus::Completed).await;
    h.wait_idle().await;
    assert_eq!(h.scheduler().dispatch_due().await.unwrap(), 1);
    h.wait_status(low.id, TaskStatus::Completed).await;

    assert_eq!(recorder.order(), vec![urgent.id, low.id]);
}

#[tokio::test]
async fn test_pause_resume_and_statistics() {
    let blocker = Arc::new(Gate::default());
    let recorder = Arc::new(Recorder::new(TaskType::OptimizeDatabase));
    let h = Harness::new(
        1,
        vec![gate(TaskType::HealthCheck, &blocker), recorder.clone()],
    );

    let running = h.service.create_task(health_check()).await.unwrap();
    h.wait_status(running.id, TaskStatus::Running).await;
    let queued = h.service.create_task(optimize()).await.unwrap();

    let paused = h.service.pause_task(queued.id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);
    assert!(matches!(
        h.service.pause_task(running.id).await,
        Err(TaskError::InvalidState { .. })
    ));

    let stats = h.service.statistics().await.unwrap();
    assert_eq!(stats.counts[&TaskStatus::Running], 1);
    assert_eq!(stats.counts[&TaskStatus::Paused], 1);
    assert_eq!(stats.counts[&TaskStatus::Completed], 0);
    assert_eq!(stats.total, 2);
    assert_eq!(stats.in_flight, 1);

    blocker.release.cancel();
    h.wait_status(running.id, TaskStatus::Completed).await;
    h.wait_idle().await;
    assert_eq!(h.scheduler().dispatch_due().await.unwrap(), 0);

    let resumed = h.service.resume_task(queued.id).await.unwrap();
    assert_eq!(resumed.status, TaskStatus::Pending);
    h.wait_status(queued.id, TaskStatus::Completed).await;
    assert_eq!(recorder.order(), vec![queued.id]);
}

#[tokio::test]
async fn test_scheduled_task_waits_until_due() {
    let recorder = Arc::new(Recorder::new(TaskType::OptimizeDatabase));
    let h = Harness::new(2, vec![recorder.clone()]);
    let at = h.clock.now() + ChronoDuration::hours(1);

    let task = h.service.create_task(optimize().scheduled_for(at)).await.unwrap();
    assert_eq!(task.status, TaskStatus::Scheduled);
    assert_eq!(h.scheduler().schedule(&task).unwrap(), DispatchOutcome::NotDue);
    assert_eq!(h.scheduler().dispatch_due().await.unwrap(), 0);

    h.clock.advance(ChronoDuration::hours(2));
    assert_eq!(h.scheduler().dispatch_due().await.unwrap(), 1);
    h.wait_status(task.id, TaskStatus::Completed).await;
}

#[tokio::test]
async fn test_retention_keeps_recent_and_unfinished_tasks() {
    let h = Harness::new(1, vec![Arc::new(Recorder::new(TaskType::OptimizeDatabase))]);
    let now = h.clock.now();
    let ten_days_ago = now - ChronoDuration::days(10);
    let one_day_ago = now - ChronoDuration::days(1);

    let mut old_failed = Task::new(optimize(), ten_days_ago, 3);
    old_failed.start(ten_days_ago).unwrap();
    old_failed.fail("boom", ten_days_ago).unwrap();

    let mut recent_completed = Task::new(optimize(), one_day_ago, 3);
    recent_completed.start(one_day_ago).unwrap();
    recent_completed
        .complete(TaskResult::OptimizeDatabase(OptimizeResult { duration_ms: 1 }), one_day_ago)
        .unwrap();

    let mut old_cancelled = Task::new(optimize(), ten_days_ago, 3);
    old_cancelled.cancel(ten_days_ago).unwrap();

    let mut old_paused = Task::new(optimize(), ten_days_ago, 3);
    old_paused.pause(ten_days_ago).unwrap();

    for task in [&old_failed, &recent_completed, &old_cancelled, &old_paused] {
        h.storage.insert(task).await.unwrap();
    }

    assert_eq!(h.service.cleanup_old_tasks(7).await.unwrap(), 1);
    assert!(h.storage.get(old_failed.id).await.unwrap().is_none());
    for kept in [&recent_completed, &old_cancelled, &old_paused] {
        assert!(h.storage.get(kept.id).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn test_terminal_write_is_retried_once() {
    let storage = Arc::new(FlakyTerminalWrites {
        inner: InMemoryTaskStorage::new(),
        failures: AtomicUsize::new(1),
    });
    let h = Harness::build(
        storage,
        1,
        vec![Arc::new(Recorder::new(TaskType::OptimizeDatabase))],
        executor_config(),
    );
    let task = h.service.create_task(optimize()).await.unwrap();
    h.wait_status(task.id, TaskStatus::Completed).await;
}

#[tokio::test]
async fn test_lost_terminal_write_is_left_to_the_stuck_sweep() {
    let storage = Arc::new(FlakyTerminalWrites {
        inner: InMemoryTaskStorage::new(),
        failures: AtomicUsize::new(2),
    });
    let recorder = Arc::new(Recorder::new(TaskType::OptimizeDatabase));
    let h = Harness::build(storage, 1, vec![recorder.clone()], executor_config());

    let task = h.service.create_task(optimize()).await.unwrap();
    h.wait_for(task.id, "first run", |_| recorder.order().len() == 1).await;
    h.wait_idle().await;
    assert_eq!(h.service.get_task(task.id).await.unwrap().status, TaskStatus::Running);

    h.clock.advance(ChronoDuration::hours(1));
    assert_eq!(h.service.recover_stuck_tasks().await.unwrap(), vec![task.id]);
    h.wait_status(task.id, TaskStatus::Completed).await;
    assert_eq!(recorder.order().len(), 2);
}

#[tokio::test]
async fn test_create_rejects_unsupported_and_invalid_params() {
    let h = Harness::new(1, vec![Arc::new(Recorder::new(TaskType::OptimizeDatabase))]);

    assert!(matches!(
        h.service.create_task(health_check()).await,
        Err(TaskError::Validation(_))
    ));
    assert!(matches!(
        h.service
            .create_task(NewTask::new(TaskParams::ScanLibrary(ScanParams {
                paths: vec![],
                recursive: true,
                extensions: vec![],
            })))
            .await,
        Err(TaskError::Validation(_))
    ));
    let all = h
        .service
        .list_tasks(&TaskFilter::default(), &Pagination::default())
        .await
        .unwrap();
    assert!(all.is_empty());
}

#[tokio::test]
async fn test_list_filters_by_resource_and_requester() {
    let h = Harness::new(1, vec![Arc::new(Recorder::new(TaskType::OptimizeDatabase))]);
    let video = Uuid::new_v4();

    let mut about_video = optimize().requested_by("alice");
    about_video.video_file_id = Some(video);
    let about_video = h.service.create_task(about_video).await.unwrap();
    h.service.create_task(optimize().requested_by("bob")).await.unwrap();

    let by_resource = h
        .service
        .list_tasks(
            &TaskFilter {
                resource_id: Some(video),
                ..Default::default()
            },
            &Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(by_resource.len(), 1);
    assert_eq!(by_resource[0].id, about_video.id);

    let by_bob = h
        .service
        .list_tasks(
            &TaskFilter {
                requested_by: Some("bob".into()),
                ..Default::default()
            },
            &Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(by_bob.len(), 1);
}

#[tokio::test]
async fn test_shutdown_aborts_executions_and_keeps_rows_running() {
    let held = Arc::new(Gate::ignoring_cancel());
    let h = Harness::new(2, vec![gate(TaskType::HealthCheck, &held)]);
    h.scheduler().start();

    let task = h.service.create_task(health_check()).await.unwrap();
    h.wait_for(task.id, "body start", |_| held.started() == 1).await;

    h.scheduler().shutdown().await;
    assert_eq!(h.scheduler().in_flight(), 0);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.service.get_task(task.id).await.unwrap().status, TaskStatus::Running);

    let another = Task::new(health_check(), h.clock.now(), 3);
    assert!(matches!(
        h.scheduler().schedule(&another),
        Err(TaskError::Dispatch(_))
    ));
}

#[tokio::test]
async fn test_dispatch_loop_drains_queue() {
    let recorder = Arc::new(Recorder::new(TaskType::OptimizeDatabase));
    let h = Harness::new(1, vec![recorder.clone()]);

    let mut ids = Vec::new();
    for _ in 0..3 {
        let task = Task::new(optimize(), h.clock.now(), 3);
        h.storage.insert(&task).await.unwrap();
        ids.push(task.id);
    }
    h.scheduler().start();
    for id in &ids {
        h.wait_status(*id, TaskStatus::Completed).await;
    }
    assert_eq!(recorder.order().len(), 3);
    h.scheduler().shutdown().await;
}
