//! # Core Configuration Module
//!
//! Provides configuration management for the offload core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! holding the host bridges and the tunables of the session coordinator. It
//! fails fast: missing bridges and out-of-range values are reported by
//! [`CoreConfigBuilder::build`] before anything is started.
//!
//! ## Required Dependencies
//!
//! - `DeviceService` - Camera discovery, sessions and transfers
//!
//! ## Optional Dependencies (with platform defaults)
//!
//! - `FileSystemAccess` - Destination directories and manifests (desktop default: tokio fs)
//! - `Clock` - Task timestamps (default: system clock)
//!
//! When the `desktop-shims` feature is enabled, `MountedVolumeService` is
//! injected as the `DeviceService` if none is provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{CoreConfig, SessionPolicy};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = CoreConfig::builder()
//!     .device_service(Arc::new(MyDeviceService))
//!     .session_policy(SessionPolicy::AwaitReady)
//!     .stall_timeout(Duration::from_secs(120))
//!     .write_manifest(true)
//!     .build()
//!     .expect("Failed to build config");
//! ```
//!
//! ## Error Handling
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//!
//! // Without `desktop-shims` this fails with CapabilityMissing("DeviceService")
//! let config = CoreConfig::builder().build();
//! assert!(config.is_err());
//! ```

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use bridge_traits::{Clock, DeviceService, FileSystemAccess, SystemClock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Longest accepted stall timeout.
pub const MAX_STALL_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// When the coordinator enumerates a device for the active task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionPolicy {
    /// Enumerate as soon as a task becomes active.
    ///
    /// The session is expected to be open already. Some devices report an
    /// empty or partial catalog until they signal readiness.
    #[default]
    Eager,
    /// Request the session and enumerate once the device reports ready.
    AwaitReady,
}

/// Core configuration for the offload core.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Device access service (required)
    pub device_service: Arc<dyn DeviceService>,

    /// File system used for destination directories and manifests
    pub file_system: Arc<dyn FileSystemAccess>,

    /// Clock used for task timestamps
    pub clock: Arc<dyn Clock>,

    /// Capacity of the event bus channel
    pub event_buffer_size: usize,

    /// When to enumerate a device after requesting its session
    pub session_policy: SessionPolicy,

    /// Force-fail the active task after this long without transfer events
    pub stall_timeout: Option<Duration>,

    /// Write `offload-manifest.json` next to the transferred files
    pub write_manifest: bool,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("device_service", &"DeviceService { ... }")
            .field("file_system", &"FileSystemAccess { ... }")
            .field("event_buffer_size", &self.event_buffer_size)
            .field("session_policy", &self.session_policy)
            .field("stall_timeout", &self.stall_timeout)
            .field("write_manifest", &self.write_manifest)
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Event buffer size is greater than zero
    /// - Stall timeout, when set, is non-zero and at most one day
    pub fn validate(&self) -> Result<()> {
        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        if let Some(timeout) = self.stall_timeout {
            if timeout.is_zero() {
                return Err(Error::Config(
                    "Stall timeout must be greater than 0. \
                     Omit .stall_timeout() to disable stall detection."
                        .to_string(),
                ));
            }

            if timeout > MAX_STALL_TIMEOUT {
                return Err(Error::Config(
                    "Stall timeout exceeds maximum of 24 hours".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_device_service() -> Result<Arc<dyn DeviceService>> {
    use bridge_desktop::MountedVolumeService;

    let service: Arc<dyn DeviceService> = Arc::new(MountedVolumeService::with_default_roots());
    Ok(service)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_device_service() -> Result<Arc<dyn DeviceService>> {
    Err(Error::missing(
        "DeviceService",
        "DeviceService implementation is required to discover cameras and transfer files. \
         Desktop: enable the 'desktop-shims' feature to use MountedVolumeService. \
         Otherwise inject a platform device service (ImageCaptureCore, MTP, PTP/IP).",
    ))
}

#[cfg(feature = "desktop-shims")]
fn provide_default_file_system() -> Result<Arc<dyn FileSystemAccess>> {
    use bridge_desktop::TokioFileSystem;

    let fs: Arc<dyn FileSystemAccess> = Arc::new(TokioFileSystem::new());
    Ok(fs)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_file_system() -> Result<Arc<dyn FileSystemAccess>> {
    Err(Error::missing(
        "FileSystemAccess",
        "FileSystemAccess implementation is required to create destination folders. \
         Desktop: enable the 'desktop-shims' feature to use TokioFileSystem.",
    ))
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    device_service: Option<Arc<dyn DeviceService>>,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    clock: Option<Arc<dyn Clock>>,
    event_buffer_size: Option<usize>,
    session_policy: SessionPolicy,
    stall_timeout: Option<Duration>,
    write_manifest: bool,
}

impl CoreConfigBuilder {
    /// Sets the device service implementation (required).
    pub fn device_service(mut self, service: Arc<dyn DeviceService>) -> Self {
        self.device_service = Some(service);
        self
    }

    /// Sets the file system access implementation.
    ///
    /// If not provided, the desktop default (tokio fs-based) will be used when
    /// the `desktop-shims` feature is enabled.
    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    /// Sets the clock used to timestamp tasks.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the event bus capacity.
    ///
    /// Default: 100
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Sets when devices are enumerated after their session is requested.
    ///
    /// Default: [`SessionPolicy::Eager`]
    pub fn session_policy(mut self, policy: SessionPolicy) -> Self {
        self.session_policy = policy;
        self
    }

    /// Enables stall detection for the active task.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    /// use std::time::Duration;
    ///
    /// let builder = CoreConfig::builder().stall_timeout(Duration::from_secs(90));
    /// ```
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = Some(timeout);
        self
    }

    /// Enables or disables writing `offload-manifest.json` per task.
    ///
    /// Default: false
    pub fn write_manifest(mut self, enabled: bool) -> Self {
        self.write_manifest = enabled;
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// # Errors
    ///
    /// - [`Error::CapabilityMissing`] if a required bridge is missing and no
    ///   platform default is available
    /// - [`Error::Config`] if a value is out of range
    pub fn build(self) -> Result<CoreConfig> {
        let device_service = match self.device_service {
            Some(service) => service,
            None => provide_default_device_service()?,
        };

        let file_system = match self.file_system {
            Some(fs) => fs,
            None => provide_default_file_system()?,
        };

        let config = CoreConfig {
            device_service,
            file_system,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
            session_policy: self.session_policy,
            stall_timeout: self.stall_timeout,
            write_manifest: self.write_manifest,
        };

        config.validate()?;

        Ok(config)
    }
}
