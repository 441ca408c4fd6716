//! # Core Offload Module
//!
//! Sequential offload of camera media into named destination folders.
//!
//! ## Overview
//!
//! Users enqueue one task per device ("copy everything from this camera into
//! this folder, prefixed `Trip`"). Tasks run one at a time in insertion order.
//! Each task lists the device once, creates `<prefix>_<short id>` inside the
//! destination and transfers every item under a deterministic new name.
//!
//! ## Modules
//!
//! - [`naming`] - Subdirectory and file name rules
//! - [`task`] - Task entity and its state machine
//! - [`queue`] - FIFO queue with a single runner, free of I/O
//! - [`coordinator`] - Drives the queue from device-service callbacks
//! - [`state`] - Observable snapshots for host UIs

pub mod coordinator;
pub mod error;
pub mod naming;
pub mod queue;
pub mod state;
pub mod task;

pub use coordinator::{CoordinatorSettings, SessionCoordinator, MANIFEST_FILE_NAME};
pub use error::{OffloadError, Result};
pub use naming::{MediaKind, NamingPlan, PlannedFile};
pub use queue::{Dispatch, DownloadQueue, QueueStats};
pub use state::{ChangeSubscription, OffloadSnapshot};
pub use task::{DownloadTask, OffloadRecord, TaskId, TaskOutcome, TaskProgress, TaskStatus};
