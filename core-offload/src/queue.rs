//! # Download Queue
//!
//! Ordered task list plus a single-runner scheduler.
//!
//! ## Overview
//!
//! The queue never performs I/O. Operations that activate a task return a
//! [`Dispatch`] describing it; the caller (the session coordinator) performs
//! the enumeration and transfers and later reports the outcome through
//! [`DownloadQueue::on_task_completed`], the only way the queue advances.
//!
//! ## Invariants
//!
//! - At most one task is `InProgress`.
//! - `active_index()` is `Some` exactly while a task is `InProgress`, and
//!   only while the runner is running.
//! - Tasks run in insertion order and are kept as history once finished.
//!
//! ## Usage
//!
//! ```ignore
//! let mut queue = DownloadQueue::new(Arc::new(SystemClock));
//! queue.enqueue(camera, "/Users/jo/Pictures", "Trip");
//!
//! if let Some(dispatch) = queue.start() {
//!     // enumerate and transfer dispatch.task_id, then:
//!     let next = queue.on_task_completed(dispatch.index, TaskOutcome::Done)?;
//! }
//! ```

use crate::error::{OffloadError, Result};
use crate::task::{DownloadTask, OffloadRecord, TaskId, TaskOutcome, TaskStatus};
use bridge_traits::{Clock, DeviceRef};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A task that just became active and must be handed to the device service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Position of the task in the queue
    pub index: usize,
    pub task_id: TaskId,
    pub device: DeviceRef,
    pub prefix: String,
    /// Directory the task's files are written to
    pub subdirectory: PathBuf,
    /// Short device identifier recorded with every transferred file
    pub short_id: String,
}

impl Dispatch {
    fn for_task(index: usize, task: &DownloadTask) -> Self {
        Self {
            index,
            task_id: task.id,
            device: task.device.clone(),
            prefix: task.prefix.clone(),
            subdirectory: task.subdirectory(),
            short_id: task.short_device_id(),
        }
    }
}

/// Task counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.done + self.failed
    }
}

/// FIFO queue of download tasks with one runner
pub struct DownloadQueue {
    tasks: Vec<DownloadTask>,
    running: bool,
    active_index: Option<usize>,
    clock: Arc<dyn Clock>,
}

impl DownloadQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tasks: Vec::new(),
            running: false,
            active_index: None,
            clock,
        }
    }

    /// Append a pending task. Always succeeds.
    pub fn enqueue(
        &mut self,
        device: DeviceRef,
        destination: impl Into<PathBuf>,
        prefix: impl Into<String>,
    ) -> TaskId {
        let task = DownloadTask::new(device, destination, prefix, self.clock.unix_timestamp());
        let id = task.id;

        info!(
            task_id = %id,
            device = %task.device.display_name(),
            prefix = %task.prefix,
            position = self.tasks.len(),
            "Enqueued download task"
        );

        self.tasks.push(task);
        id
    }

    /// Start the runner.
    ///
    /// Returns `None` without any effect when it is already running.
    pub fn start(&mut self) -> Option<Dispatch> {
        if self.running {
            debug!("Queue already running");
            return None;
        }

        self.running = true;
        self.run_next()
    }

    /// Activate the first pending task, or stop the runner if there is none
    fn run_next(&mut self) -> Option<Dispatch> {
        let Some(index) = self
            .tasks
            .iter()
            .position(|task| task.status == TaskStatus::Pending)
        else {
            info!("No pending tasks, queue idle");
            self.running = false;
            self.active_index = None;
            return None;
        };

        let now = self.clock.unix_timestamp();
        let task = &mut self.tasks[index];
        if let Err(e) = task.start(now) {
            // Only pending tasks are selected, so this cannot fail
            warn!(task_id = %task.id, error = %e, "Failed to start task");
            return None;
        }
        self.active_index = Some(index);

        info!(task_id = %task.id, index, device = %task.device.display_name(), "Started task");
        Some(Dispatch::for_task(index, task))
    }

    /// Finish the active task and, if the runner is running, activate the next one.
    ///
    /// # Errors
    ///
    /// [`OffloadError::TaskNotActive`] if `index` is not the active task;
    /// nothing changes in that case.
    pub fn on_task_completed(
        &mut self,
        index: usize,
        outcome: TaskOutcome,
    ) -> Result<Option<Dispatch>> {
        if self.active_index != Some(index) {
            return Err(OffloadError::TaskNotActive { index });
        }

        let now = self.clock.unix_timestamp();
        let task = &mut self.tasks[index];
        task.finish(outcome, now)?;
        self.active_index = None;

        match task.status {
            TaskStatus::Failed => warn!(
                task_id = %task.id,
                error = task.error_detail.as_deref().unwrap_or_default(),
                "Task failed"
            ),
            _ => info!(
                task_id = %task.id,
                files = task.progress.files_completed,
                "Task completed"
            ),
        }

        if self.running {
            Ok(self.run_next())
        } else {
            Ok(None)
        }
    }

    /// Update byte progress of the active task
    pub fn record_file_progress(
        &mut self,
        index: usize,
        bytes_done: u64,
        bytes_total: u64,
    ) -> Result<()> {
        self.active_mut(index)?.set_bytes(bytes_done, bytes_total);
        Ok(())
    }

    /// Count one finished file of the active task
    pub fn record_file_result(
        &mut self,
        index: usize,
        result: std::result::Result<OffloadRecord, String>,
    ) -> Result<()> {
        self.active_mut(index)?.record_file(result);
        Ok(())
    }

    /// Record the listing size of the active task
    pub fn record_plan(&mut self, index: usize, files_total: u64, bytes_total: u64) -> Result<()> {
        self.active_mut(index)?.set_planned(files_total, bytes_total);
        Ok(())
    }

    fn active_mut(&mut self, index: usize) -> Result<&mut DownloadTask> {
        if self.active_index != Some(index) {
            return Err(OffloadError::TaskNotActive { index });
        }
        Ok(&mut self.tasks[index])
    }

    pub fn tasks(&self) -> &[DownloadTask] {
        &self.tasks
    }

    pub fn get(&self, id: &TaskId) -> Result<&DownloadTask> {
        self.tasks
            .iter()
            .find(|task| task.id == *id)
            .ok_or_else(|| OffloadError::TaskNotFound {
                task_id: id.to_string(),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active_index
    }

    pub fn active_task(&self) -> Option<&DownloadTask> {
        self.active_index.map(|index| &self.tasks[index])
    }

    pub fn stats(&self) -> QueueStats {
        self.tasks
            .iter()
            .fold(QueueStats::default(), |mut stats, task| {
                match task.status {
                    TaskStatus::Pending => stats.pending += 1,
                    TaskStatus::InProgress => stats.in_progress += 1,
                    TaskStatus::Done => stats.done += 1,
                    TaskStatus::Failed => stats.failed += 1,
                }
                stats
            })
    }
}

impl std::fmt::Debug for DownloadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadQueue")
            .field("tasks", &self.tasks.len())
            .field("running", &self.running)
            .field("active_index", &self.active_index)
            .finish()
    }
}
