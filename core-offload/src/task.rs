//! # Download Task
//!
//! One "offload this device into this folder with this prefix" request and
//! its lifecycle.
//!
//! ## State Machine
//!
//! ```text
//! Pending → InProgress → Done
//!               ↓
//!             Failed
//! ```
//!
//! `Done` and `Failed` are terminal. A failed task is never retried; enqueue
//! a new one instead.

use crate::error::{OffloadError, Result};
use crate::naming;
use bridge_traits::DeviceRef;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new random task ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a task ID from a string
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID
    pub fn from_string(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| OffloadError::InvalidTaskId(e.to_string()))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TaskId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ============================================================================
// Status Types
// ============================================================================

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue
    Pending,
    /// The single active task; its files are being transferred
    InProgress,
    /// Every file transferred
    Done,
    /// The task stopped on an error; see `error_detail`
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = OffloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(OffloadError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Failed(String),
}

// ============================================================================
// Progress Types
// ============================================================================

/// Progress of the files of one task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Number of items in the device listing
    pub files_total: u64,
    /// Files that transferred successfully
    pub files_completed: u64,
    /// Files that failed
    pub files_failed: u64,
    /// Bytes written across all files
    pub bytes_done: u64,
    /// Expected bytes across all files, as far as known
    pub bytes_total: u64,
    /// Finished files as a percentage of `files_total` (0-100)
    pub percent: u8,
}

impl TaskProgress {
    pub fn files_finished(&self) -> u64 {
        self.files_completed + self.files_failed
    }

    fn recompute_percent(&mut self) {
        self.percent = if self.files_total > 0 {
            ((self.files_finished() * 100) / self.files_total).min(100) as u8
        } else {
            0
        };
    }
}

/// One successfully transferred file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadRecord {
    /// Position of the item in the device listing
    pub position: usize,
    /// Name of the file on the device
    pub original_name: String,
    /// Name the file was saved as
    pub new_name: String,
    /// Short device identifier used in the subdirectory name
    pub device_id: String,
}

// ============================================================================
// Download Task Entity
// ============================================================================

/// One offload request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: TaskId,
    /// Device to offload; the device service owns the session
    pub device: DeviceRef,
    /// Folder chosen by the user; files land in a subdirectory of it
    pub destination: PathBuf,
    /// User-supplied name prefix, possibly empty
    pub prefix: String,
    pub status: TaskStatus,
    /// Set only when `status` is `Failed`
    pub error_detail: Option<String>,
    pub progress: TaskProgress,
    pub records: Vec<OffloadRecord>,
    /// Unix seconds
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl DownloadTask {
    /// Create a pending task
    pub fn new(
        device: DeviceRef,
        destination: impl Into<PathBuf>,
        prefix: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            id: TaskId::new(),
            device,
            destination: destination.into(),
            prefix: prefix.into(),
            status: TaskStatus::Pending,
            error_detail: None,
            progress: TaskProgress::default(),
            records: Vec::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Short identifier of the task's device
    pub fn short_device_id(&self) -> String {
        naming::short_device_id(self.device.serial_number.as_deref())
    }

    /// Directory the task's files are written to
    pub fn subdirectory(&self) -> PathBuf {
        self.destination
            .join(naming::subdirectory_name(&self.prefix, &self.short_device_id()))
    }

    /// Pending → InProgress
    pub fn start(&mut self, now: i64) -> Result<()> {
        self.validate_transition(TaskStatus::InProgress)?;
        self.status = TaskStatus::InProgress;
        self.started_at = Some(now);
        Ok(())
    }

    /// InProgress → Done or Failed
    pub fn finish(&mut self, outcome: TaskOutcome, now: i64) -> Result<()> {
        match outcome {
            TaskOutcome::Done => {
                self.validate_transition(TaskStatus::Done)?;
                self.status = TaskStatus::Done;
                self.progress.percent = 100;
            }
            TaskOutcome::Failed(message) => {
                self.validate_transition(TaskStatus::Failed)?;
                self.status = TaskStatus::Failed;
                self.error_detail = Some(message);
            }
        }
        self.completed_at = Some(now);
        Ok(())
    }

    /// Record the size of the listing once it is known
    pub fn set_planned(&mut self, files_total: u64, bytes_total: u64) {
        self.progress.files_total = files_total;
        self.progress.bytes_total = bytes_total;
        self.progress.recompute_percent();
    }

    pub fn set_bytes(&mut self, bytes_done: u64, bytes_total: u64) {
        self.progress.bytes_done = bytes_done;
        self.progress.bytes_total = bytes_total;
    }

    /// Count one finished file; successful files are recorded in listing
    /// order, whatever order they complete in
    pub fn record_file(&mut self, result: std::result::Result<OffloadRecord, String>) {
        match result {
            Ok(record) => {
                self.progress.files_completed += 1;
                let at = self
                    .records
                    .partition_point(|known| known.position < record.position);
                self.records.insert(at, record);
            }
            Err(_) => self.progress.files_failed += 1,
        }
        self.progress.recompute_percent();
    }

    /// Seconds between start and completion, once both happened
    pub fn duration_secs(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start).max(0) as u64),
            _ => None,
        }
    }

    fn validate_transition(&self, to: TaskStatus) -> Result<()> {
        let valid = matches!(
            (self.status, to),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Done)
                | (TaskStatus::InProgress, TaskStatus::Failed)
        );

        if !valid {
            return Err(OffloadError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        Ok(())
    }
}
