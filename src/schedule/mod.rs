pub mod broadcast;
pub mod callback;
pub mod executor;
pub mod processors;
pub mod scheduler;
pub mod service;
pub mod types;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use crate::config::{ExecutorConfig, SchedulerConfig};
use crate::utils::clock::Clock;

pub use broadcast::{TaskBroadcaster, TaskStream};
pub use callback::WebhookNotifier;
pub use executor::{Cancelled, ExecutionOutcome, TaskContext, TaskExecutor};
pub use processors::{default_processors, TaskProcessor};
pub use scheduler::{CancelOutcome, DispatchOutcome, Registry, TaskScheduler};
pub use service::{TaskService, TaskStats};
pub use types::{
    NewTask, Task, TaskFilter, TaskParams, TaskPriority, TaskResult, TaskStatus, TaskType,
};

pub use crate::storage::task::TaskStorage;

/// Wires executor, scheduler and service around one store and broadcaster.
pub fn create_service(
    storage: Arc<dyn TaskStorage>,
    processors: Vec<Arc<dyn TaskProcessor>>,
    broadcaster: Arc<TaskBroadcaster>,
    clock: Arc<dyn Clock>,
    scheduler_config: SchedulerConfig,
    executor_config: ExecutorConfig,
) -> TaskService {
    let mut executor = TaskExecutor::new(
        storage.clone(),
        broadcaster.clone(),
        clock.clone(),
        executor_config,
    );
    for processor in processors {
        executor.register_processor(processor);
    }
    let executor = Arc::new(executor);

    let scheduler = Arc::new(TaskScheduler::new(
        storage.clone(),
        executor.clone(),
        broadcaster.clone(),
        clock.clone(),
        scheduler_config,
    ));

    TaskService::new(storage, executor, scheduler, broadcaster, clock)
}
