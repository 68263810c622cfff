use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug)]
struct ExecutionHandle {
    cancel: CancellationToken,
    dispatched_at: DateTime<Utc>,
    abort: Option<AbortHandle>,
}

/// In-flight executions keyed by task id. At most one handle per id.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<HashMap<Uuid, ExecutionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, ExecutionHandle>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claims `id`. False when another execution already holds it.
    pub fn try_register(&self, id: Uuid, cancel: CancellationToken, at: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        if inner.contains_key(&id) {
            return false;
        }
        inner.insert(
            id,
            ExecutionHandle {
                cancel,
                dispatched_at: at,
                abort: None,
            },
        );
        true
    }

    /// Attaches the spawned task's abort handle. A no-op when the execution
    /// already finished and removed itself.
    pub fn attach(&self, id: Uuid, abort: AbortHandle) {
        if let Some(handle) = self.lock().get_mut(&id) {
            handle.abort = Some(abort);
        }
    }

    pub fn remove(&self, id: Uuid) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn dispatched_at(&self, id: Uuid) -> Option<DateTime<Utc>> {
        self.lock().get(&id).map(|h| h.dispatched_at)
    }

    /// Requests cooperative cancellation. True if `id` was in flight.
    pub fn signal_cancel(&self, id: Uuid) -> bool {
        match self.lock().get(&id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Hard-stops every execution without touching their rows.
    pub fn abort_all(&self) -> usize {
        let drained: Vec<ExecutionHandle> = self.lock().drain().map(|(_, h)| h).collect();
        for handle in &drained {
            if let Some(abort) = &handle.abort {
                abort.abort();
            }
        }
        drained.len()
    }
}

/// Removes its id from the registry when the execution future is dropped,
/// whether it finished, panicked or was aborted.
pub(crate) struct RegistrationGuard {
    registry: Arc<Registry>,
    id: Uuid,
}

impl RegistrationGuard {
    pub(crate) fn new(registry: Arc<Registry>, id: Uuid) -> Self {
        Self { registry, id }
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
