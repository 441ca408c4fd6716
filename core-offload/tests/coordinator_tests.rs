//! Integration tests for the session coordinator
//!
//! These tests drive the coordinator through a scripted device service:
//! - Sequential execution and auto-advance
//! - Directory, listing and per-file failures
//! - Completion counting, duplicates and stalls
//! - Readiness gating and device removal
//! - Callers stay served while a device call hangs
//! - Manifests

use async_trait::async_trait;
use bridge_traits::{
    error::Result as BridgeResult, BridgeError, DeviceEventHandler, DeviceId, DeviceRef,
    DeviceService, DownloadRequest, FileMetadata, FileSystemAccess, MediaItem, SystemClock,
};
use bytes::Bytes;
use core_offload::{
    CoordinatorSettings, OffloadError, OffloadRecord, OffloadSnapshot, SessionCoordinator,
    TaskStatus, MANIFEST_FILE_NAME,
};
use core_runtime::config::SessionPolicy;
use core_runtime::events::{CoreEvent, EventBus, QueueEvent, TransferEvent};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Mock Implementations
// ============================================================================

/// Device service whose callbacks are fired by the test
#[derive(Default)]
struct ScriptedDevices {
    handler: Mutex<Option<Arc<dyn DeviceEventHandler>>>,
    listings: Mutex<HashMap<String, Vec<MediaItem>>>,
    failing_listings: Mutex<HashSet<String>>,
    hanging_listings: Mutex<HashSet<String>>,
    session_error: Mutex<Option<String>>,
    rejected_items: Mutex<HashSet<String>>,
    sessions: Mutex<Vec<DeviceId>>,
    downloads: Mutex<Vec<(DeviceId, DownloadRequest)>>,
}

impl ScriptedDevices {
    fn set_listing(&self, device_id: &str, names: &[&str]) {
        let items = names
            .iter()
            .map(|name| MediaItem::new(format!("DCIM/{}", name), *name).with_size(100))
            .collect();
        self.listings
            .lock()
            .unwrap()
            .insert(device_id.to_string(), items);
    }

    fn fail_listing(&self, device_id: &str) {
        self.failing_listings
            .lock()
            .unwrap()
            .insert(device_id.to_string());
    }

    fn hang_listing(&self, device_id: &str) {
        self.hanging_listings
            .lock()
            .unwrap()
            .insert(device_id.to_string());
    }

    fn refuse_sessions(&self, message: &str) {
        *self.session_error.lock().unwrap() = Some(message.to_string());
    }

    fn reject_item(&self, name: &str) {
        self.rejected_items.lock().unwrap().insert(name.to_string());
    }

    fn handler(&self) -> Arc<dyn DeviceEventHandler> {
        self.handler
            .lock()
            .unwrap()
            .clone()
            .expect("coordinator registers a handler")
    }

    fn downloads(&self) -> Vec<(DeviceId, DownloadRequest)> {
        self.downloads.lock().unwrap().clone()
    }

    fn sessions(&self) -> Vec<DeviceId> {
        self.sessions.lock().unwrap().clone()
    }

    fn complete(&self, index: usize) {
        let (_, request) = self.downloads()[index].clone();
        self.handler().file_completed(request.transfer_id, Ok(()));
    }

    fn fail(&self, index: usize, message: &str) {
        let (_, request) = self.downloads()[index].clone();
        self.handler().file_completed(
            request.transfer_id,
            Err(BridgeError::Transfer(message.to_string())),
        );
    }
}

#[async_trait]
impl DeviceService for ScriptedDevices {
    fn set_event_handler(&self, handler: Arc<dyn DeviceEventHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    async fn start_discovery(&self) -> BridgeResult<()> {
        Ok(())
    }

    async fn open_session(&self, device: &DeviceRef) -> BridgeResult<()> {
        self.sessions.lock().unwrap().push(device.id.clone());
        match self.session_error.lock().unwrap().clone() {
            Some(message) => Err(BridgeError::Session(message)),
            None => Ok(()),
        }
    }

    async fn list_media_items(&self, device: &DeviceRef) -> BridgeResult<Vec<MediaItem>> {
        let hangs = self
            .hanging_listings
            .lock()
            .unwrap()
            .contains(device.id.as_str());
        if hangs {
            return std::future::pending().await;
        }
        if self
            .failing_listings
            .lock()
            .unwrap()
            .contains(device.id.as_str())
        {
            return Err(BridgeError::DeviceNotFound(device.id.to_string()));
        }
        Ok(self
            .listings
            .lock()
            .unwrap()
            .get(device.id.as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn begin_download(
        &self,
        device: &DeviceRef,
        request: DownloadRequest,
    ) -> BridgeResult<()> {
        if self.rejected_items.lock().unwrap().contains(&request.item.name) {
            return Err(BridgeError::Transfer("device busy".to_string()));
        }
        self.downloads
            .lock()
            .unwrap()
            .push((device.id.clone(), request));
        Ok(())
    }
}

/// In-memory file system
#[derive(Default)]
struct MemoryFs {
    dirs: Mutex<HashSet<PathBuf>>,
    files: Mutex<HashMap<PathBuf, Bytes>>,
    read_only_roots: Mutex<HashSet<PathBuf>>,
}

impl MemoryFs {
    fn deny_under(&self, root: &str) {
        self.read_only_roots
            .lock()
            .unwrap()
            .insert(PathBuf::from(root));
    }

    fn has_dir(&self, path: &str) -> bool {
        self.dirs.lock().unwrap().contains(Path::new(path))
    }

    fn file(&self, path: &str) -> Option<Bytes> {
        self.files.lock().unwrap().get(Path::new(path)).cloned()
    }
}

#[async_trait]
impl FileSystemAccess for MemoryFs {
    async fn exists(&self, path: &Path) -> BridgeResult<bool> {
        let is_dir = self.dirs.lock().unwrap().contains(path);
        Ok(is_dir || self.files.lock().unwrap().contains_key(path))
    }

    async fn metadata(&self, path: &Path) -> BridgeResult<FileMetadata> {
        let files = self.files.lock().unwrap();
        let data = files
            .get(path)
            .ok_or_else(|| BridgeError::OperationFailed(format!("{} not found", path.display())))?;
        Ok(FileMetadata {
            size: data.len() as u64,
            created_at: None,
            modified_at: None,
            is_directory: false,
        })
    }

    async fn create_dir_all(&self, path: &Path) -> BridgeResult<()> {
        let denied = self
            .read_only_roots
            .lock()
            .unwrap()
            .iter()
            .any(|root| path.starts_with(root));
        if denied {
            return Err(BridgeError::OperationFailed("permission denied".to_string()));
        }
        self.dirs.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> BridgeResult<Bytes> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| BridgeError::OperationFailed(format!("{} not found", path.display())))
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> BridgeResult<()> {
        self.files.lock().unwrap().insert(path.to_path_buf(), data);
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> BridgeResult<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn list_directory(&self, _path: &Path) -> BridgeResult<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    devices: Arc<ScriptedDevices>,
    fs: Arc<MemoryFs>,
    event_bus: Arc<EventBus>,
    coordinator: SessionCoordinator,
}

impl Fixture {
    fn new() -> Self {
        Self::with_settings(CoordinatorSettings::default())
    }

    fn with_settings(settings: CoordinatorSettings) -> Self {
        let devices = Arc::new(ScriptedDevices::default());
        let fs = Arc::new(MemoryFs::default());
        let event_bus = Arc::new(EventBus::new(256));
        let coordinator = SessionCoordinator::new(
            devices.clone(),
            fs.clone(),
            Arc::new(SystemClock),
            settings,
            Arc::clone(&event_bus),
        );
        Self {
            devices,
            fs,
            event_bus,
            coordinator,
        }
    }

    async fn wait_for<F>(&self, condition: F) -> OffloadSnapshot
    where
        F: Fn(&OffloadSnapshot) -> bool,
    {
        let mut state = self.coordinator.subscribe();
        let snapshot = tokio::time::timeout(WAIT, state.wait_for(|s| condition(s)))
            .await
            .expect("timed out waiting for coordinator state")
            .expect("coordinator stopped");
        snapshot.clone()
    }

    /// Downloads are issued off the coordinator loop; wait until `count` arrived
    async fn wait_for_downloads(&self, count: usize) -> Vec<(DeviceId, DownloadRequest)> {
        eventually(|| self.devices.downloads().len() >= count).await;
        self.devices.downloads()
    }

    async fn wait_until_idle(&self) -> OffloadSnapshot {
        tokio::time::timeout(WAIT, self.coordinator.wait_until_idle())
            .await
            .expect("timed out waiting for idle queue")
            .expect("coordinator stopped")
    }
}

async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

fn camera(id: &str, serial: &str) -> DeviceRef {
    DeviceRef::new(id)
        .with_name(format!("Camera {}", id))
        .with_serial_number(serial)
}

fn file_names(downloads: &[(DeviceId, DownloadRequest)]) -> Vec<String> {
    downloads
        .iter()
        .map(|(_, request)| request.file_name.clone())
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_tasks_run_in_insertion_order() {
    let fx = Fixture::new();
    fx.devices.set_listing("a", &["A.JPG"]);
    fx.devices.set_listing("b", &["B.MOV"]);
    fx.devices.set_listing("c", &["C.CR3"]);

    let first = fx
        .coordinator
        .enqueue(camera("a", "SN-AAAA1111"), "/photos", "Trip")
        .await
        .unwrap();
    fx.coordinator
        .enqueue(camera("b", "SN-BBBB2222"), "/photos", "Trip")
        .await
        .unwrap();
    fx.coordinator
        .enqueue(camera("c", "SN-CCCC3333"), "/photos", "Trip")
        .await
        .unwrap();

    let snapshot = fx.coordinator.snapshot();
    assert_eq!(snapshot.stats.pending, 3);
    assert!(!snapshot.running);

    fx.coordinator.start().await.unwrap();

    let snapshot = fx.coordinator.snapshot();
    assert_eq!(snapshot.active_index, Some(0));
    assert_eq!(snapshot.active_task().unwrap().id, first);

    let downloads = fx.wait_for_downloads(1).await;
    assert_eq!(downloads.len(), 1);
    assert_eq!(downloads[0].0.as_str(), "a");
    assert_eq!(downloads[0].1.directory, PathBuf::from("/photos/Trip_1111"));
    assert_eq!(downloads[0].1.file_name, "Trip_IMG_0001.JPG");
    assert!(downloads[0].1.overwrite);

    fx.devices.complete(0);
    let snapshot = fx.wait_for(|s| s.active_index == Some(1)).await;
    assert_eq!(snapshot.tasks[0].status, TaskStatus::Done);
    assert_eq!(fx.wait_for_downloads(2).await[1].1.file_name, "Trip_VID_0001.MOV");

    fx.devices.complete(1);
    fx.wait_for(|s| s.active_index == Some(2)).await;
    assert_eq!(fx.wait_for_downloads(3).await[2].1.file_name, "Trip_FILE_0001.CR3");

    fx.devices.complete(2);
    let snapshot = fx.wait_until_idle().await;

    assert_eq!(snapshot.stats.done, 3);
    assert_eq!(snapshot.active_index, None);
    assert!(fx.fs.has_dir("/photos/Trip_1111"));
    assert!(fx.fs.has_dir("/photos/Trip_2222"));
    assert!(fx.fs.has_dir("/photos/Trip_3333"));

    let started: Vec<_> = snapshot.tasks.iter().map(|t| t.started_at.is_some()).collect();
    assert_eq!(started, vec![true, true, true]);
}

#[tokio::test]
async fn test_start_twice_has_no_extra_effect() {
    let fx = Fixture::new();
    fx.devices.set_listing("a", &["1.JPG", "2.JPG"]);
    fx.coordinator.enqueue(camera("a", "1234"), "/photos", "Day").await.unwrap();

    fx.coordinator.start().await.unwrap();
    fx.coordinator.start().await.unwrap();

    fx.wait_for_downloads(2).await;
    fx.wait_for(|s| s.tasks[0].progress.files_total == 2).await;
    let snapshot = fx.coordinator.snapshot();
    assert!(snapshot.running);
    assert_eq!(snapshot.stats.in_progress, 1);
    assert_eq!(fx.devices.downloads().len(), 2);
}

#[tokio::test]
async fn test_start_with_empty_queue_goes_idle() {
    let fx = Fixture::new();
    let mut events = fx.event_bus.subscribe();

    fx.coordinator.start().await.unwrap();

    let snapshot = fx.coordinator.snapshot();
    assert!(!snapshot.running);
    assert!(snapshot.is_idle());
    assert!(matches!(
        events.recv().await.unwrap(),
        CoreEvent::Queue(QueueEvent::Idle { tasks_done: 0, tasks_failed: 0 })
    ));
}

#[tokio::test]
async fn test_directory_failure_fails_task_without_transfers() {
    let fx = Fixture::new();
    fx.fs.deny_under("/readonly");
    fx.devices.set_listing("a", &["A.JPG"]);
    fx.devices.set_listing("b", &["B.JPG"]);

    fx.coordinator.enqueue(camera("a", "AAAA"), "/readonly", "X").await.unwrap();
    fx.coordinator.enqueue(camera("b", "BBBB"), "/photos", "Y").await.unwrap();
    fx.coordinator.start().await.unwrap();

    let snapshot = fx.wait_for(|s| s.active_index == Some(1)).await;
    let failed = &snapshot.tasks[0];
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed
        .error_detail
        .as_deref()
        .unwrap()
        .contains("Failed to create directory /readonly/X_AAAA"));
    assert_eq!(failed.progress.files_finished(), 0);

    // Only the second task's file was requested
    let downloads = fx.wait_for_downloads(1).await;
    assert_eq!(downloads.len(), 1);
    assert_eq!(downloads[0].0.as_str(), "b");
}

#[tokio::test]
async fn test_listing_failure_fails_task() {
    let fx = Fixture::new();
    fx.devices.fail_listing("a");

    fx.coordinator.enqueue(camera("a", "AAAA"), "/photos", "X").await.unwrap();
    fx.coordinator.start().await.unwrap();

    let snapshot = fx.wait_until_idle().await;
    assert_eq!(snapshot.tasks[0].status, TaskStatus::Failed);
    assert!(snapshot.tasks[0]
        .error_detail
        .as_deref()
        .unwrap()
        .starts_with("Failed to list media"));
    assert!(fx.devices.downloads().is_empty());
    assert!(!fx.fs.has_dir("/photos/X_AAAA"));
}

#[tokio::test]
async fn test_empty_listing_completes_immediately() {
    let fx = Fixture::new();
    fx.coordinator.enqueue(camera("a", "AAAA"), "/photos", "Empty").await.unwrap();
    fx.coordinator.start().await.unwrap();

    let snapshot = fx.wait_until_idle().await;
    assert_eq!(snapshot.tasks[0].status, TaskStatus::Done);
    assert_eq!(snapshot.tasks[0].progress.files_total, 0);
    assert!(fx.fs.has_dir("/photos/Empty_AAAA"));
}

#[tokio::test]
async fn test_task_outcome_waits_for_every_file() {
    let fx = Fixture::new();
    fx.devices.set_listing("a", &["1.JPG", "2.JPG", "3.JPG"]);
    fx.coordinator.enqueue(camera("a", "SN0042"), "/photos", "Trip").await.unwrap();
    fx.coordinator.start().await.unwrap();

    assert_eq!(
        file_names(&fx.wait_for_downloads(3).await),
        vec!["Trip_IMG_0001.JPG", "Trip_IMG_0002.JPG", "Trip_IMG_0003.JPG"]
    );

    // Out of order: third succeeds, second fails
    fx.devices.complete(2);
    fx.devices.fail(1, "card error");
    let snapshot = fx
        .wait_for(|s| s.tasks[0].progress.files_finished() == 2)
        .await;
    assert_eq!(snapshot.tasks[0].status, TaskStatus::InProgress);
    assert_eq!(snapshot.tasks[0].progress.files_failed, 1);

    fx.devices.complete(0);
    let snapshot = fx.wait_until_idle().await;

    let task = &snapshot.tasks[0];
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(
        task.error_detail.as_deref(),
        Some("Failed to download Trip_IMG_0002.JPG: Transfer failed: card error")
    );
    assert_eq!(task.progress.files_completed, 2);
    assert_eq!(task.progress.percent, 100);

    let recorded: Vec<&str> = task.records.iter().map(|r| r.new_name.as_str()).collect();
    assert_eq!(recorded, vec!["Trip_IMG_0001.JPG", "Trip_IMG_0003.JPG"]);
}

#[tokio::test]
async fn test_rejected_download_counts_as_failed_file() {
    let fx = Fixture::new();
    fx.devices.set_listing("a", &["1.JPG", "2.JPG"]);
    fx.devices.reject_item("2.JPG");
    fx.coordinator.enqueue(camera("a", "AAAA"), "/photos", "T").await.unwrap();
    fx.coordinator.start().await.unwrap();

    let snapshot = fx.wait_for(|s| s.tasks[0].progress.files_failed == 1).await;
    assert_eq!(snapshot.tasks[0].status, TaskStatus::InProgress);
    assert_eq!(fx.wait_for_downloads(1).await.len(), 1);

    fx.devices.complete(0);
    let snapshot = fx.wait_until_idle().await;
    assert_eq!(snapshot.tasks[0].status, TaskStatus::Failed);
    assert!(snapshot.tasks[0]
        .error_detail
        .as_deref()
        .unwrap()
        .contains("device busy"));
}

#[tokio::test]
async fn test_duplicate_completion_is_ignored() {
    let fx = Fixture::new();
    fx.devices.set_listing("a", &["1.JPG", "2.JPG"]);
    fx.coordinator.enqueue(camera("a", "AAAA"), "/photos", "T").await.unwrap();
    fx.coordinator.start().await.unwrap();
    fx.wait_for_downloads(2).await;

    fx.devices.complete(0);
    fx.devices.complete(0);
    fx.devices.fail(0, "late");
    let snapshot = fx
        .wait_for(|s| s.tasks[0].progress.files_completed == 1)
        .await;
    assert_eq!(snapshot.tasks[0].status, TaskStatus::InProgress);

    fx.devices.complete(1);
    let snapshot = fx.wait_until_idle().await;
    let task = &snapshot.tasks[0];
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.progress.files_failed, 0);
    assert_eq!(task.records.len(), 2);
}

#[tokio::test]
async fn test_progress_updates_bytes_and_emits_events() {
    let fx = Fixture::new();
    let mut events = fx.event_bus.subscribe();
    fx.devices.set_listing("a", &["1.JPG"]);
    fx.coordinator.enqueue(camera("a", "AAAA"), "/photos", "T").await.unwrap();
    fx.coordinator.start().await.unwrap();

    let (_, request) = fx.wait_for_downloads(1).await[0].clone();
    fx.devices.handler().file_progress(request.transfer_id, 40, 100);

    let snapshot = fx.wait_for(|s| s.tasks[0].progress.bytes_done == 40).await;
    assert_eq!(snapshot.tasks[0].progress.bytes_total, 100);

    let progress = loop {
        match tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            CoreEvent::Transfer(event @ TransferEvent::Progress { .. }) => break event,
            _ => continue,
        }
    };
    match progress {
        TransferEvent::Progress {
            file_name,
            bytes_done,
            bytes_total,
            ..
        } => {
            assert_eq!(file_name, "T_IMG_0001.JPG");
            assert_eq!((bytes_done, bytes_total), (40, 100));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_stalled_transfer_fails_task_and_advances() {
    let fx = Fixture::with_settings(CoordinatorSettings {
        stall_timeout: Some(Duration::from_millis(250)),
        ..Default::default()
    });
    fx.devices.set_listing("a", &["1.JPG"]);
    fx.devices.set_listing("b", &["2.JPG"]);
    fx.coordinator.enqueue(camera("a", "AAAA"), "/photos", "T").await.unwrap();
    fx.coordinator.enqueue(camera("b", "BBBB"), "/photos", "T").await.unwrap();
    fx.coordinator.start().await.unwrap();

    let snapshot = fx.wait_for(|s| s.active_index == Some(1)).await;
    assert_eq!(snapshot.tasks[0].status, TaskStatus::Failed);
    assert!(snapshot.tasks[0]
        .error_detail
        .as_deref()
        .unwrap()
        .starts_with("No transfer activity"));

    // A late callback for the abandoned transfer changes nothing
    fx.wait_for_downloads(2).await;
    fx.devices.complete(0);
    fx.devices.complete(1);
    let snapshot = fx.wait_until_idle().await;
    assert_eq!(snapshot.tasks[0].status, TaskStatus::Failed);
    assert_eq!(snapshot.tasks[1].status, TaskStatus::Done);
}

#[tokio::test]
async fn test_hung_listing_does_not_block_callers() {
    let fx = Fixture::new();
    fx.devices.hang_listing("a");
    fx.coordinator.enqueue(camera("a", "AAAA"), "/photos", "T").await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), fx.coordinator.start())
        .await
        .expect("start returns while the listing hangs")
        .unwrap();
    assert_eq!(fx.coordinator.snapshot().tasks[0].status, TaskStatus::InProgress);

    tokio::time::timeout(
        Duration::from_secs(1),
        fx.coordinator.enqueue(camera("b", "BBBB"), "/photos", "T"),
    )
    .await
    .expect("enqueue returns while the listing hangs")
    .unwrap();

    let snapshot = fx.coordinator.snapshot();
    assert_eq!(snapshot.stats.in_progress, 1);
    assert_eq!(snapshot.stats.pending, 1);
    assert_eq!(snapshot.active_index, Some(0));
}

#[tokio::test]
async fn test_stall_timeout_fails_hung_listing() {
    let fx = Fixture::with_settings(CoordinatorSettings {
        stall_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    });
    fx.devices.hang_listing("a");
    fx.devices.set_listing("b", &["B.JPG"]);
    fx.coordinator.enqueue(camera("a", "AAAA"), "/photos", "T").await.unwrap();
    fx.coordinator.enqueue(camera("b", "BBBB"), "/photos", "T").await.unwrap();
    fx.coordinator.start().await.unwrap();

    let snapshot = fx.wait_for(|s| s.tasks[0].status == TaskStatus::Failed).await;
    assert!(snapshot.tasks[0]
        .error_detail
        .as_deref()
        .unwrap()
        .starts_with("No transfer activity"));

    // The queue moved on to the next card
    let downloads = fx.wait_for_downloads(1).await;
    assert_eq!(downloads[0].0.as_str(), "b");
}

#[tokio::test]
async fn test_await_ready_defers_enumeration() {
    let fx = Fixture::with_settings(CoordinatorSettings {
        session_policy: SessionPolicy::AwaitReady,
        ..Default::default()
    });
    fx.devices.set_listing("a", &["1.JPG"]);
    let device = camera("a", "AAAA");
    fx.coordinator.enqueue(device.clone(), "/photos", "T").await.unwrap();
    fx.coordinator.start().await.unwrap();

    eventually(|| fx.devices.sessions() == vec![device.id.clone()]).await;
    assert!(fx.devices.downloads().is_empty());
    assert_eq!(fx.coordinator.snapshot().stats.in_progress, 1);

    fx.devices.handler().device_ready(device.id.clone());
    fx.wait_for(|s| s.tasks[0].progress.files_total == 1).await;
    assert_eq!(fx.wait_for_downloads(1).await.len(), 1);

    fx.devices.complete(0);
    let snapshot = fx.wait_until_idle().await;
    assert_eq!(snapshot.tasks[0].status, TaskStatus::Done);
}

#[tokio::test]
async fn test_await_ready_skips_wait_for_ready_device() {
    let fx = Fixture::with_settings(CoordinatorSettings {
        session_policy: SessionPolicy::AwaitReady,
        ..Default::default()
    });
    fx.devices.set_listing("a", &["1.JPG"]);
    let device = camera("a", "AAAA");

    fx.coordinator.enqueue(device.clone(), "/photos", "T").await.unwrap();
    fx.devices.handler().device_ready(device.id.clone());
    fx.coordinator.start().await.unwrap();

    assert_eq!(fx.wait_for_downloads(1).await.len(), 1);
    assert!(fx.devices.sessions().is_empty());
}

#[tokio::test]
async fn test_await_ready_session_failure_fails_task() {
    let fx = Fixture::with_settings(CoordinatorSettings {
        session_policy: SessionPolicy::AwaitReady,
        ..Default::default()
    });
    let device = camera("a", "AAAA");
    fx.coordinator.enqueue(device.clone(), "/photos", "T").await.unwrap();
    fx.coordinator.start().await.unwrap();

    fx.devices.handler().session_opened(
        device.id.clone(),
        Err(BridgeError::Session("locked".to_string())),
    );

    let snapshot = fx.wait_until_idle().await;
    assert_eq!(snapshot.tasks[0].status, TaskStatus::Failed);
    // Named like every other device error
    assert_eq!(
        snapshot.tasks[0].error_detail.as_deref(),
        Some("Device session error for Camera a: Device session error: locked")
    );
}

#[tokio::test]
async fn test_await_ready_refused_session_request_fails_task() {
    let fx = Fixture::with_settings(CoordinatorSettings {
        session_policy: SessionPolicy::AwaitReady,
        ..Default::default()
    });
    fx.devices.refuse_sessions("busy");
    fx.coordinator.enqueue(camera("a", "AAAA"), "/photos", "T").await.unwrap();
    fx.coordinator.start().await.unwrap();

    let snapshot = fx.wait_until_idle().await;
    assert_eq!(
        snapshot.tasks[0].error_detail.as_deref(),
        Some("Device session error for Camera a: Device session error: busy")
    );
    assert!(fx.devices.downloads().is_empty());
}

#[tokio::test]
async fn test_await_ready_device_removed_fails_task() {
    let fx = Fixture::with_settings(CoordinatorSettings {
        session_policy: SessionPolicy::AwaitReady,
        ..Default::default()
    });
    let device = camera("a", "AAAA");
    fx.coordinator.enqueue(device.clone(), "/photos", "T").await.unwrap();
    fx.coordinator.enqueue(camera("b", "BBBB"), "/photos", "T").await.unwrap();
    fx.coordinator.start().await.unwrap();
    eventually(|| !fx.devices.sessions().is_empty()).await;

    fx.devices.handler().device_removed(device.id.clone());

    let snapshot = fx.wait_for(|s| s.tasks[0].status == TaskStatus::Failed).await;
    assert_eq!(
        snapshot.tasks[0].error_detail.as_deref(),
        Some("Device session error for Camera a: device removed before it became ready")
    );
    assert_eq!(snapshot.active_index, Some(1));
    assert!(!fx.fs.has_dir("/photos/T_AAAA"));
}

#[tokio::test]
async fn test_device_removed_mid_transfer_waits_for_callbacks() {
    let fx = Fixture::new();
    fx.devices.set_listing("a", &["1.JPG", "2.JPG"]);
    let device = camera("a", "AAAA");
    fx.coordinator.enqueue(device.clone(), "/photos", "T").await.unwrap();
    fx.coordinator.start().await.unwrap();
    fx.wait_for_downloads(2).await;

    fx.devices.handler().device_removed(device.id.clone());
    fx.devices.complete(0);

    // The removal is handled before the completion; the task keeps going
    let snapshot = fx
        .wait_for(|s| s.tasks[0].progress.files_completed == 1)
        .await;
    assert_eq!(snapshot.tasks[0].status, TaskStatus::InProgress);

    fx.devices.fail(1, "card removed");
    let snapshot = fx.wait_until_idle().await;
    assert_eq!(snapshot.tasks[0].status, TaskStatus::Failed);
    assert_eq!(
        snapshot.tasks[0].error_detail.as_deref(),
        Some("Failed to download T_IMG_0002.JPG: Transfer failed: card removed")
    );
}

#[tokio::test]
async fn test_manifest_lists_transferred_files() {
    let fx = Fixture::with_settings(CoordinatorSettings {
        write_manifest: true,
        ..Default::default()
    });
    fx.devices.set_listing("a", &["DSC_1.JPG", "DSC_2.JPG", "MVI_3.MOV"]);
    fx.coordinator
        .enqueue(camera("a", "SN9876"), "/photos", "Trip")
        .await
        .unwrap();
    fx.coordinator.start().await.unwrap();
    fx.wait_for_downloads(3).await;

    // Completion order differs from listing order
    fx.devices.complete(2);
    fx.devices.fail(1, "unreadable");
    fx.devices.complete(0);
    fx.wait_until_idle().await;

    let path = format!("/photos/Trip_9876/{}", MANIFEST_FILE_NAME);
    let data = fx.fs.file(&path).expect("manifest written");
    let records: Vec<OffloadRecord> = serde_json::from_slice(&data).unwrap();
    assert_eq!(
        records,
        vec![
            OffloadRecord {
                position: 0,
                original_name: "DSC_1.JPG".to_string(),
                new_name: "Trip_IMG_0001.JPG".to_string(),
                device_id: "9876".to_string(),
            },
            OffloadRecord {
                position: 2,
                original_name: "MVI_3.MOV".to_string(),
                new_name: "Trip_VID_0003.MOV".to_string(),
                device_id: "9876".to_string(),
            },
        ]
    );
}

#[tokio::test]
async fn test_no_manifest_by_default() {
    let fx = Fixture::new();
    fx.devices.set_listing("a", &["1.JPG"]);
    fx.coordinator.enqueue(camera("a", "AAAA"), "/photos", "T").await.unwrap();
    fx.coordinator.start().await.unwrap();
    fx.wait_for_downloads(1).await;
    fx.devices.complete(0);
    fx.wait_until_idle().await;

    assert!(fx
        .fs
        .file(&format!("/photos/T_AAAA/{}", MANIFEST_FILE_NAME))
        .is_none());
}

#[tokio::test]
async fn test_device_registry_follows_discovery() {
    let fx = Fixture::new();
    let handler = fx.devices.handler();

    handler.device_added(camera("a", "AAAA"));
    handler.device_added(camera("b", "BBBB"));
    fx.wait_for(|s| s.devices.len() == 2).await;

    handler.device_removed(DeviceId::new("a"));
    let snapshot = fx.wait_for(|s| s.devices.len() == 1).await;
    assert_eq!(snapshot.devices[0].id.as_str(), "b");
    assert_eq!(fx.coordinator.devices(), snapshot.devices);
}

#[tokio::test]
async fn test_on_change_callback_sees_progress() {
    let fx = Fixture::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = fx.coordinator.on_change(move |snapshot| {
        sink.lock().unwrap().push(snapshot.stats);
    });

    fx.coordinator.enqueue(camera("a", "AAAA"), "/photos", "T").await.unwrap();
    fx.coordinator.start().await.unwrap();
    fx.wait_until_idle().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert_eq!(seen.last().unwrap().done, 1);
}

#[tokio::test]
async fn test_shutdown_stops_accepting_commands() {
    let fx = Fixture::new();
    fx.coordinator.shutdown().await;

    let result = fx
        .coordinator
        .enqueue(camera("a", "AAAA"), "/photos", "T")
        .await;
    assert_eq!(result, Err(OffloadError::CoordinatorStopped));
}
