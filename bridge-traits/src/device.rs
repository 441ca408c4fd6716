//! Device Access Abstractions
//!
//! Traits and value types describing a camera-like device service: discovery,
//! sessions, point-in-time media listings and per-file transfers.
//!
//! The service is push-based. Discovery, session and transfer outcomes are
//! reported through a registered [`DeviceEventHandler`], one method per event
//! kind, rather than through return values. Calls such as
//! [`DeviceService::begin_download`] only *issue* work and return as soon as
//! the request has been accepted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;

/// Identifier of an attached device, as assigned by the device service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Non-owning handle to a device.
///
/// The device service owns the underlying session; holders of a `DeviceRef`
/// only use it to address the device in service calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRef {
    /// Service-assigned identifier
    pub id: DeviceId,
    /// Human-readable name, if the device reports one
    pub name: Option<String>,
    /// Hardware serial number, if the device reports one
    pub serial_number: Option<String>,
}

impl DeviceRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: DeviceId::new(id),
            name: None,
            serial_number: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    /// Name for logs and UIs, falling back to `"Unknown"`
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// One transferable file known to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    /// Opaque key the service uses to address the item (object handle, path, ...)
    pub handle: String,
    /// Original file name on the device, including its extension
    pub name: String,
    /// Size in bytes, when known up front
    pub size: Option<u64>,
}

impl MediaItem {
    pub fn new(handle: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            name: name.into(),
            size: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

/// Correlates progress and completion callbacks with the request that caused them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single file transfer request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub transfer_id: TransferId,
    pub item: MediaItem,
    /// Directory the file is written into; must already exist
    pub directory: PathBuf,
    /// File name to save as, replacing the original name
    pub file_name: String,
    /// Replace an existing file with the same name instead of failing
    pub overwrite: bool,
}

impl DownloadRequest {
    /// Full destination path of the transferred file
    pub fn destination(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }
}

/// Callback sink for everything a [`DeviceService`] reports asynchronously.
///
/// Implementations must be cheap and non-blocking: the service may call them
/// from its own worker threads. For a given transfer, every `file_progress`
/// call happens before its `file_completed` call; no other ordering between
/// transfers is guaranteed.
pub trait DeviceEventHandler: Send + Sync {
    /// A device was attached or became visible
    fn device_added(&self, device: DeviceRef);

    /// A previously reported device went away
    fn device_removed(&self, device_id: DeviceId);

    /// Outcome of an `open_session` request
    fn session_opened(&self, device_id: DeviceId, result: Result<()>);

    /// The device finished building its content catalog and can be listed
    fn device_ready(&self, device_id: DeviceId);

    /// Byte progress for one transfer
    fn file_progress(&self, transfer_id: TransferId, bytes_done: u64, bytes_total: u64);

    /// Final outcome for one transfer
    fn file_completed(&self, transfer_id: TransferId, result: Result<()>);
}

/// Device access service.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::device::{DeviceService, DownloadRequest, TransferId};
///
/// async fn pull_first(service: &dyn DeviceService, device: &DeviceRef) -> Result<()> {
///     service.open_session(device).await?;
///     let items = service.list_media_items(device).await?;
///     if let Some(item) = items.into_iter().next() {
///         service
///             .begin_download(
///                 device,
///                 DownloadRequest {
///                     transfer_id: TransferId::new(),
///                     file_name: item.name.clone(),
///                     item,
///                     directory: "/tmp/offload".into(),
///                     overwrite: true,
///                 },
///             )
///             .await?;
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait DeviceService: Send + Sync {
    /// Register the handler that receives all asynchronous callbacks.
    ///
    /// Replaces any previously registered handler.
    fn set_event_handler(&self, handler: Arc<dyn DeviceEventHandler>);

    /// Start reporting attached devices through `device_added`/`device_removed`
    async fn start_discovery(&self) -> Result<()>;

    /// Request a session with the device.
    ///
    /// Returning `Ok` means the request was accepted; the outcome is also
    /// reported through `session_opened`, readiness through `device_ready`.
    async fn open_session(&self, device: &DeviceRef) -> Result<()>;

    /// Point-in-time snapshot of the device's media items, in listing order
    async fn list_media_items(&self, device: &DeviceRef) -> Result<Vec<MediaItem>>;

    /// Issue one transfer.
    ///
    /// Returns once the request is accepted; progress and completion are
    /// reported through the handler under `request.transfer_id`.
    async fn begin_download(&self, device: &DeviceRef, request: DownloadRequest) -> Result<()>;
}
