//! # Host Bridge Traits
//!
//! Platform abstraction traits that must be implemented by each host platform.
//!
//! ## Overview
//!
//! This crate defines the contract between the offload core and the
//! platform-specific code that actually talks to cameras and disks. Each trait
//! represents a capability the core requires but that is implemented
//! differently per platform (ImageCapture on macOS, MTP/PTP on Linux and
//! Windows, plain mounted volumes for mass-storage cameras).
//!
//! ## Traits
//!
//! ### Devices
//! - [`DeviceService`](device::DeviceService) - Discovery, sessions, media listing, transfers
//! - [`DeviceEventHandler`](device::DeviceEventHandler) - Callback sink the service reports into
//!
//! ### Storage
//! - [`FileSystemAccess`](storage::FileSystemAccess) - Local directory creation and file I/O
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Platform Requirements
//!
//! | Platform | Implementation Crate | Status |
//! |----------|---------------------|--------|
//! | Desktop (mass storage) | `bridge-desktop` | ✅ Available |
//! | macOS (ImageCapture)   | TBD              | 📋 Planned |
//!
//! ## Error Handling
//!
//! All bridge traits use the [`BridgeError`](error::BridgeError) type. Platform
//! implementations should convert native errors to `BridgeError` and keep the
//! message readable, since per-file messages end up on failed tasks.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so implementations can be shared
//! across async tasks. Event handler callbacks may be invoked from any thread.

pub mod device;
pub mod error;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use device::{
    DeviceEventHandler, DeviceId, DeviceRef, DeviceService, DownloadRequest, MediaItem,
    TransferId,
};
pub use storage::{FileMetadata, FileSystemAccess};
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
