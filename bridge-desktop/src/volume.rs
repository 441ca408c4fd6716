//! Device service for cameras that mount as mass storage.
//!
//! A volume counts as a camera when it carries a `DCIM` directory. Media items
//! are the regular files below `DCIM`, listed in path order. Transfers are
//! chunked copies run on the Tokio runtime; progress and completion are
//! reported through the registered [`DeviceEventHandler`].

use async_trait::async_trait;
use bridge_traits::{
    device::{DeviceEventHandler, DeviceId, DeviceRef, DeviceService, DownloadRequest, MediaItem},
    error::{BridgeError, Result},
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const DCIM: &str = "DCIM";

/// Default copy chunk size (1 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Reference [`DeviceService`] over mounted volumes.
///
/// Each configured root is scanned on `start_discovery`: the root itself is a
/// device if it has a `DCIM` directory (Windows drive letters), otherwise each
/// child directory with `DCIM` is (`/Volumes/*`, `/media/$USER/*`). Calling
/// `start_discovery` again rescans and reports removals.
pub struct MountedVolumeService {
    roots: Vec<PathBuf>,
    chunk_size: usize,
    handler: RwLock<Option<Arc<dyn DeviceEventHandler>>>,
    volumes: Mutex<HashMap<DeviceId, PathBuf>>,
}

impl MountedVolumeService {
    /// Create a service scanning the given mount roots
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            chunk_size: DEFAULT_CHUNK_SIZE,
            handler: RwLock::new(None),
            volumes: Mutex::new(HashMap::new()),
        }
    }

    /// Create a service scanning the platform's usual mount locations
    pub fn with_default_roots() -> Self {
        Self::new(default_mount_roots())
    }

    /// Override the copy chunk size (and with it the progress granularity)
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn handler(&self) -> Option<Arc<dyn DeviceEventHandler>> {
        self.handler
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn volume_path(&self, device_id: &DeviceId) -> Result<PathBuf> {
        self.volumes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(device_id)
            .cloned()
            .ok_or_else(|| BridgeError::DeviceNotFound(device_id.to_string()))
    }

    async fn scan_roots(&self) -> Vec<(PathBuf, DeviceRef)> {
        let mut found = Vec::new();

        for root in &self.roots {
            if is_camera_volume(root).await {
                found.push((root.clone(), volume_device(root)));
                continue;
            }

            let Ok(mut entries) = fs::read_dir(root).await else {
                debug!(root = ?root, "Mount root not readable, skipping");
                continue;
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if is_camera_volume(&path).await {
                    found.push((path.clone(), volume_device(&path)));
                }
            }
        }

        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }
}

impl std::fmt::Debug for MountedVolumeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountedVolumeService")
            .field("roots", &self.roots)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

fn default_mount_roots() -> Vec<PathBuf> {
    if cfg!(target_os = "macos") {
        vec![PathBuf::from("/Volumes")]
    } else if cfg!(target_os = "windows") {
        ('D'..='Z').map(|letter| PathBuf::from(format!("{}:\\", letter))).collect()
    } else {
        let mut roots = Vec::new();
        if let Ok(user) = std::env::var("USER") {
            roots.push(PathBuf::from("/media").join(&user));
            roots.push(PathBuf::from("/run/media").join(&user));
        }
        roots.push(PathBuf::from("/mnt"));
        roots
    }
}

async fn is_camera_volume(path: &Path) -> bool {
    fs::metadata(path.join(DCIM))
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

fn volume_device(path: &Path) -> DeviceRef {
    let device = DeviceRef::new(path.display().to_string());
    match path.file_name() {
        Some(name) => device.with_name(name.to_string_lossy()),
        None => device,
    }
}

/// Regular files below `root`, sorted by path.
async fn collect_files(root: &Path) -> Result<Vec<(PathBuf, u64)>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                let size = entry.metadata().await?.len();
                files.push((entry.path(), size));
            }
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

async fn copy_with_progress(
    source: &Path,
    destination: &Path,
    overwrite: bool,
    chunk_size: usize,
    mut on_progress: impl FnMut(u64, u64),
) -> Result<()> {
    if !overwrite && fs::try_exists(destination).await? {
        return Err(BridgeError::Transfer(format!(
            "{} already exists",
            destination.display()
        )));
    }

    let mut reader = fs::File::open(source).await?;
    let total = reader.metadata().await?.len();
    let mut writer = fs::File::create(destination).await?;
    let mut buffer = vec![0u8; chunk_size];
    let mut done = 0u64;

    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read]).await?;
        done += read as u64;
        on_progress(done, total);
    }

    writer.flush().await?;
    Ok(())
}

#[async_trait]
impl DeviceService for MountedVolumeService {
    fn set_event_handler(&self, handler: Arc<dyn DeviceEventHandler>) {
        *self
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handler);
    }

    async fn start_discovery(&self) -> Result<()> {
        let found = self.scan_roots().await;
        let handler = self.handler();

        let (added, removed) = {
            let mut volumes = self
                .volumes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            let removed: Vec<DeviceId> = volumes
                .keys()
                .filter(|id| !found.iter().any(|(_, device)| &device.id == *id))
                .cloned()
                .collect();
            for id in &removed {
                volumes.remove(id);
            }

            let mut added = Vec::new();
            for (path, device) in found {
                if volumes.insert(device.id.clone(), path).is_none() {
                    added.push(device);
                }
            }
            (added, removed)
        };

        info!(added = added.len(), removed = removed.len(), "Scanned mounted volumes");

        if let Some(handler) = handler {
            for device_id in removed {
                handler.device_removed(device_id);
            }
            for device in added {
                handler.device_added(device);
            }
        }

        Ok(())
    }

    async fn open_session(&self, device: &DeviceRef) -> Result<()> {
        let outcome = match self.volume_path(&device.id) {
            Ok(path) if is_camera_volume(&path).await => Ok(()),
            Ok(path) => Err(BridgeError::Session(format!(
                "{} is no longer mounted",
                path.display()
            ))),
            Err(e) => Err(e),
        };

        if let Some(handler) = self.handler() {
            match &outcome {
                Ok(()) => {
                    handler.session_opened(device.id.clone(), Ok(()));
                    // The file tree is the catalog; it is ready as soon as it is mounted.
                    handler.device_ready(device.id.clone());
                }
                Err(e) => handler.session_opened(
                    device.id.clone(),
                    Err(BridgeError::Session(e.to_string())),
                ),
            }
        }

        outcome
    }

    async fn list_media_items(&self, device: &DeviceRef) -> Result<Vec<MediaItem>> {
        let root = self.volume_path(&device.id)?.join(DCIM);
        let files = collect_files(&root).await?;

        let items: Vec<MediaItem> = files
            .into_iter()
            .filter_map(|(path, size)| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                Some(MediaItem::new(path.display().to_string(), name).with_size(size))
            })
            .collect();

        debug!(device = %device.display_name(), count = items.len(), "Listed media items");
        Ok(items)
    }

    async fn begin_download(&self, device: &DeviceRef, request: DownloadRequest) -> Result<()> {
        let volume = self.volume_path(&device.id)?;
        let source = PathBuf::from(&request.item.handle);
        if !source.starts_with(&volume) {
            return Err(BridgeError::Transfer(format!(
                "{} is not on {}",
                request.item.name,
                device.display_name()
            )));
        }

        let handler = self
            .handler()
            .ok_or_else(|| BridgeError::NotAvailable("DeviceEventHandler".to_string()))?;
        let chunk_size = self.chunk_size;

        tokio::spawn(async move {
            let destination = request.destination();
            let transfer_id = request.transfer_id;
            let progress_handler = Arc::clone(&handler);

            let result = copy_with_progress(
                &source,
                &destination,
                request.overwrite,
                chunk_size,
                |done, total| progress_handler.file_progress(transfer_id, done, total),
            )
            .await;

            match &result {
                Ok(()) => debug!(
                    transfer_id = %transfer_id,
                    file = %request.file_name,
                    "Transfer finished"
                ),
                Err(e) => warn!(
                    transfer_id = %transfer_id,
                    file = %request.file_name,
                    error = %e,
                    "Transfer failed"
                ),
            }
            handler.file_completed(transfer_id, result);
        });

        Ok(())
    }
}
