//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (device service,
//! filesystem, clock) into the offload core and hands back a single
//! [`OffloadService`] handle. Desktop apps typically enable the
//! `desktop-shims` feature (which depends on `bridge-desktop`) and call
//! [`bootstrap_desktop`]; other hosts build a [`CoreConfig`] with their own
//! device service.

pub mod error;

pub use error::{CoreError, Result};

pub use core_offload::{
    CoordinatorSettings, DownloadTask, OffloadError, OffloadRecord, OffloadSnapshot, QueueStats,
    TaskId, TaskProgress, TaskStatus,
};
pub use core_runtime::config::{CoreConfig, CoreConfigBuilder, SessionPolicy};
pub use core_runtime::events::{CoreEvent, EventBus};

use bridge_traits::DeviceRef;
use core_offload::{ChangeSubscription, SessionCoordinator};
use core_runtime::events::Receiver;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[cfg(feature = "desktop-shims")]
use bridge_desktop::{MountedVolumeService, TokioFileSystem};

struct ServiceInner {
    event_bus: Arc<EventBus>,
    coordinator: SessionCoordinator,
}

/// Primary façade exposed to host applications.
///
/// Cloning is cheap; every clone drives the same queue.
#[derive(Clone)]
pub struct OffloadService {
    inner: Arc<ServiceInner>,
}

impl OffloadService {
    /// Validate the configuration and start the session coordinator.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: CoreConfig) -> Result<Self> {
        config.validate()?;

        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let coordinator = SessionCoordinator::from_config(&config, Arc::clone(&event_bus));

        info!(?config, "Offload service ready");

        Ok(Self {
            inner: Arc::new(ServiceInner {
                event_bus,
                coordinator,
            }),
        })
    }

    /// Event bus carrying device, queue and transfer events
    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.event_bus)
    }

    pub fn subscribe_events(&self) -> Receiver<CoreEvent> {
        self.inner.event_bus.subscribe()
    }

    pub async fn start_discovery(&self) -> Result<()> {
        Ok(self.inner.coordinator.start_discovery().await?)
    }

    pub fn devices(&self) -> Vec<DeviceRef> {
        self.inner.coordinator.devices()
    }

    /// Open a session with a device before offloading it
    pub async fn select_device(&self, device: &DeviceRef) -> Result<()> {
        Ok(self.inner.coordinator.select_device(device).await?)
    }

    /// Queue an offload of `device` into `destination`, prefixing every file name
    pub async fn enqueue(
        &self,
        device: DeviceRef,
        destination: impl Into<PathBuf>,
        prefix: impl Into<String>,
    ) -> Result<TaskId> {
        Ok(self
            .inner
            .coordinator
            .enqueue(device, destination, prefix)
            .await?)
    }

    pub async fn start(&self) -> Result<()> {
        Ok(self.inner.coordinator.start().await?)
    }

    pub fn snapshot(&self) -> OffloadSnapshot {
        self.inner.coordinator.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<OffloadSnapshot> {
        self.inner.coordinator.subscribe()
    }

    pub fn on_change<F>(&self, callback: F) -> ChangeSubscription
    where
        F: FnMut(&OffloadSnapshot) + Send + 'static,
    {
        self.inner.coordinator.on_change(callback)
    }

    pub async fn wait_until_idle(&self) -> Result<OffloadSnapshot> {
        Ok(self.inner.coordinator.wait_until_idle().await?)
    }

    pub async fn shutdown(&self) {
        self.inner.coordinator.shutdown().await;
    }
}

/// Convenience bootstrapper for desktop hosts offloading mounted camera cards.
///
/// ```no_run
/// # async fn example() -> core_service::Result<()> {
/// use core_service::bootstrap_desktop;
///
/// let service = bootstrap_desktop(vec!["/media/jo".into()], |builder| builder)?;
/// service.start_discovery().await?;
/// # Ok(())
/// # }
/// ```
#[cfg(feature = "desktop-shims")]
pub fn bootstrap_desktop<F>(roots: Vec<PathBuf>, customize: F) -> Result<OffloadService>
where
    F: FnOnce(CoreConfigBuilder) -> CoreConfigBuilder,
{
    if roots.is_empty() {
        return Err(CoreError::InitializationFailed(
            "at least one volume root is required".to_string(),
        ));
    }

    let builder = CoreConfig::builder()
        .device_service(Arc::new(MountedVolumeService::new(roots)))
        .file_system(Arc::new(TokioFileSystem::new()));
    let config = customize(builder).build()?;
    OffloadService::new(config)
}
