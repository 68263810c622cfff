use std::pin::Pin;
use std::sync::RwLock;

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::schedule::types::Task;

pub type TaskStream = Pin<Box<dyn Stream<Item = Task> + Send>>;

/// Multicast of task snapshots to live subscribers.
///
/// Each subscriber owns a bounded ring buffer; one that falls behind loses the
/// oldest snapshots instead of slowing down the publisher or other subscribers.
/// Dropping a stream releases its slot.
pub struct TaskBroadcaster {
    sender: RwLock<Option<broadcast::Sender<Task>>>,
}

impl TaskBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: RwLock::new(Some(sender)),
        }
    }

    fn sender(&self) -> Option<broadcast::Sender<Task>> {
        self.sender
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .cloned()
    }

    /// Fire and forget. Having no subscribers is not an error.
    pub fn publish(&self, task: &Task) {
        if let Some(sender) = self.sender() {
            if let Ok(receivers) = sender.send(task.clone()) {
                debug!(
                    task_id = %task.id,
                    status = %task.status,
                    receivers,
                    "Published task update"
                );
            }
        }
    }

    /// Every snapshot published from now on. Closed broadcasters yield an
    /// already-finished stream.
    pub fn subscribe(&self) -> TaskStream {
        self.subscribe_where(|_| true)
    }

    pub fn subscribe_where<F>(&self, predicate: F) -> TaskStream
    where
        F: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        let Some(sender) = self.sender() else {
            return Box::pin(futures::stream::empty());
        };

        let stream = BroadcastStream::new(sender.subscribe()).filter_map(move |event| {
            let item = match event {
                Ok(task) if predicate(&task) => Some(task),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("Task update subscriber lagged, dropped {} events", skipped);
                    None
                }
            };
            futures::future::ready(item)
        });
        Box::pin(stream)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender().map_or(0, |sender| sender.receiver_count())
    }

    /// Ends every open stream once its buffered events are drained.
    pub fn close(&self) {
        let mut sender = self.sender.write().unwrap_or_else(|e| e.into_inner());
        if sender.take().is_some() {
            debug!("Task broadcaster closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }
}

impl Default for TaskBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
