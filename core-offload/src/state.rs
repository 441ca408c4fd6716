//! Observable offload state.
//!
//! The coordinator publishes an [`OffloadSnapshot`] after every serialized
//! step through a `tokio::sync::watch` channel. Readers either take a
//! point-in-time copy, hold a receiver, or register a callback.

use crate::queue::{DownloadQueue, QueueStats};
use crate::task::DownloadTask;
use bridge_traits::DeviceRef;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Everything a host UI needs to render the queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadSnapshot {
    /// All tasks in insertion order, finished ones included
    pub tasks: Vec<DownloadTask>,
    pub running: bool,
    pub active_index: Option<usize>,
    pub stats: QueueStats,
    /// Currently attached devices, in discovery order
    pub devices: Vec<DeviceRef>,
}

impl OffloadSnapshot {
    pub fn capture(queue: &DownloadQueue, devices: &[DeviceRef]) -> Self {
        Self {
            tasks: queue.tasks().to_vec(),
            running: queue.is_running(),
            active_index: queue.active_index(),
            stats: queue.stats(),
            devices: devices.to_vec(),
        }
    }

    pub fn active_task(&self) -> Option<&DownloadTask> {
        self.active_index.and_then(|index| self.tasks.get(index))
    }

    /// True when the runner stopped and no task is waiting
    pub fn is_idle(&self) -> bool {
        !self.running && self.stats.pending == 0 && self.stats.in_progress == 0
    }
}

/// Write side of the observable state
#[derive(Debug)]
pub(crate) struct StatePublisher {
    sender: watch::Sender<OffloadSnapshot>,
}

impl StatePublisher {
    pub(crate) fn new() -> (Self, watch::Receiver<OffloadSnapshot>) {
        let (sender, receiver) = watch::channel(OffloadSnapshot::default());
        (Self { sender }, receiver)
    }

    /// Replace the published snapshot; observers wake only on real changes
    pub(crate) fn publish(&self, snapshot: OffloadSnapshot) {
        self.sender.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

/// Keeps an [`on_change`](crate::SessionCoordinator::on_change) callback registered.
///
/// Dropping the subscription unregisters the callback.
#[derive(Debug)]
pub struct ChangeSubscription {
    handle: JoinHandle<()>,
}

impl ChangeSubscription {
    pub(crate) fn spawn<F>(mut receiver: watch::Receiver<OffloadSnapshot>, mut callback: F) -> Self
    where
        F: FnMut(&OffloadSnapshot) + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                let snapshot = receiver.borrow_and_update().clone();
                callback(&snapshot);
            }
        });
        Self { handle }
    }

    /// Unregister the callback
    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
