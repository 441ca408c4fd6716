//! # Event Bus System
//!
//! Provides an event-driven channel for the offload core using `tokio::sync::broadcast`.
//! Hosts subscribe to learn about attached devices, queue transitions and
//! per-file transfer activity without polling the queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐  emit   ┌───────────┐   subscribe   ┌────────────┐
//! │ SessionCoordinator ├────────>│ EventBus  ├──────────────>│ UI / CLI   │
//! └────────────────────┘         │ (broadcast│               └────────────┘
//!                                │  channel) ├──────────────>┌────────────┐
//!                                └───────────┘               │ Log writer │
//!                                                            └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, QueueEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Queue(QueueEvent::Idle {
//!         tasks_done: 2,
//!         tasks_failed: 0,
//!     }))
//!     .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event.description(), "Queue idle");
//! # }
//! ```
//!
//! ## Event Types
//!
//! ### Device Events
//! - `Discovered`, `Removed`: device attached / detached
//! - `SessionOpened`, `SessionFailed`, `Ready`: session lifecycle
//!
//! ### Queue Events
//! - `TaskEnqueued`, `TaskStarted`, `TaskCompleted`, `TaskFailed`
//! - `Idle`: no pending task remains and the runner stopped
//!
//! ### Transfer Events
//! - `Progress`: byte progress for one file
//! - `FileCompleted`, `FileFailed`: per-file outcome
//!
//! ## Error Handling
//!
//! Subscribers may see `RecvError::Lagged(n)` when they fall more than the
//! buffer size behind; this is non-fatal. `RecvError::Closed` means every
//! sender was dropped and the subscriber should exit.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// Progress events are the bulk of the traffic; slow subscribers receive
/// `RecvError::Lagged` instead of blocking transfers.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Device discovery and session events
    Device(DeviceEvent),
    /// Task queue events
    Queue(QueueEvent),
    /// Per-file transfer events
    Transfer(TransferEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Device(e) => e.description(),
            CoreEvent::Queue(e) => e.description(),
            CoreEvent::Transfer(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Device(DeviceEvent::SessionFailed { .. }) => EventSeverity::Error,
            CoreEvent::Queue(QueueEvent::TaskFailed { .. }) => EventSeverity::Error,
            CoreEvent::Transfer(TransferEvent::FileFailed { .. }) => EventSeverity::Warning,
            CoreEvent::Device(DeviceEvent::Removed { .. }) => EventSeverity::Warning,
            CoreEvent::Device(DeviceEvent::Discovered { .. }) => EventSeverity::Info,
            CoreEvent::Queue(QueueEvent::TaskCompleted { .. }) => EventSeverity::Info,
            CoreEvent::Queue(QueueEvent::Idle { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Device Events
// ============================================================================

/// Events related to device discovery and sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DeviceEvent {
    /// A device was attached.
    Discovered {
        /// Service-assigned device identifier.
        device_id: String,
        /// Device name, if reported.
        name: Option<String>,
    },
    /// A device was detached.
    Removed {
        /// The device that went away.
        device_id: String,
    },
    /// A session was opened successfully.
    SessionOpened {
        /// The device the session belongs to.
        device_id: String,
    },
    /// Opening a session failed.
    SessionFailed {
        /// The device the session was requested for.
        device_id: String,
        /// Human-readable error message.
        message: String,
    },
    /// The device finished building its content catalog.
    Ready {
        /// The device that became ready.
        device_id: String,
    },
}

impl DeviceEvent {
    fn description(&self) -> &str {
        match self {
            DeviceEvent::Discovered { .. } => "Device discovered",
            DeviceEvent::Removed { .. } => "Device removed",
            DeviceEvent::SessionOpened { .. } => "Device session opened",
            DeviceEvent::SessionFailed { .. } => "Device session failed",
            DeviceEvent::Ready { .. } => "Device ready",
        }
    }
}

// ============================================================================
// Queue Events
// ============================================================================

/// Events related to the offload task queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum QueueEvent {
    /// A task was appended to the queue.
    TaskEnqueued {
        /// The new task's identifier.
        task_id: String,
        /// The device the task offloads.
        device_id: String,
        /// User-supplied name prefix.
        prefix: String,
    },
    /// A task became the active task.
    TaskStarted {
        /// The task identifier.
        task_id: String,
        /// The device the task offloads.
        device_id: String,
    },
    /// Every file of a task transferred successfully.
    TaskCompleted {
        /// The task identifier.
        task_id: String,
        /// Number of files transferred.
        files_transferred: u64,
        /// Wall-clock duration in seconds.
        duration_secs: u64,
    },
    /// A task ended with an error.
    TaskFailed {
        /// The task identifier.
        task_id: String,
        /// Error detail recorded on the task.
        message: String,
        /// Number of files that failed.
        files_failed: u64,
    },
    /// No pending task remains; the runner stopped.
    Idle {
        /// Tasks in the queue that ended `Done`.
        tasks_done: u64,
        /// Tasks in the queue that ended `Failed`.
        tasks_failed: u64,
    },
}

impl QueueEvent {
    fn description(&self) -> &str {
        match self {
            QueueEvent::TaskEnqueued { .. } => "Task enqueued",
            QueueEvent::TaskStarted { .. } => "Task started",
            QueueEvent::TaskCompleted { .. } => "Task completed",
            QueueEvent::TaskFailed { .. } => "Task failed",
            QueueEvent::Idle { .. } => "Queue idle",
        }
    }
}

// ============================================================================
// Transfer Events
// ============================================================================

/// Events related to individual file transfers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum TransferEvent {
    /// Byte progress for one file.
    Progress {
        /// The task the file belongs to.
        task_id: String,
        /// Final (renamed) file name.
        file_name: String,
        /// Bytes written so far.
        bytes_done: u64,
        /// Expected size in bytes.
        bytes_total: u64,
    },
    /// One file transferred successfully.
    FileCompleted {
        /// The task the file belongs to.
        task_id: String,
        /// Name of the file on the device.
        original_name: String,
        /// Final (renamed) file name.
        file_name: String,
    },
    /// One file failed to transfer.
    FileFailed {
        /// The task the file belongs to.
        task_id: String,
        /// Final (renamed) file name.
        file_name: String,
        /// Human-readable error message.
        message: String,
    },
}

impl TransferEvent {
    fn description(&self) -> &str {
        match self {
            TransferEvent::Progress { .. } => "Transfer in progress",
            TransferEvent::FileCompleted { .. } => "File transferred",
            TransferEvent::FileFailed { .. } => "File transfer failed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Uses `tokio::sync::broadcast` internally: cloning the bus adds producers,
/// each `subscribe()` adds an independent consumer, and sends never block.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of events to buffer per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are no active subscribers.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

/// Type alias for event filter functions.
type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let queue_only = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Queue(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    /// Creates a new event stream from a receiver.
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` will be returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without waiting.
    ///
    /// Returns `None` if no matching event is currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
