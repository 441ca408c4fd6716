//! # Session Coordinator
//!
//! Drives the [`DownloadQueue`] from device-service callbacks.
//!
//! ## Overview
//!
//! The coordinator owns the queue inside a single Tokio task (the event
//! loop). Every input, whether a caller request (`enqueue`, `start`) or a
//! device callback (`file_progress`, `file_completed`, ...), is turned into a
//! command on an unbounded channel and handled there one at a time, so the
//! queue is only ever touched by one writer and needs no lock.
//!
//! The loop itself never waits on a device or the file system. Those calls
//! run in tasks spawned for the active task and report back as commands;
//! results for a task that is no longer active are dropped, and the spawned
//! calls are aborted when the task ends.
//!
//! ## Workflow
//!
//! For each task the queue activates:
//! 1. Wait for the device to report ready (`SessionPolicy::AwaitReady` only)
//! 2. List the device's media items once
//! 3. Compute the subdirectory and every final file name
//! 4. Create the subdirectory; failure fails the task with no transfers
//! 5. Issue one overwriting download per item, back to back
//! 6. Count completions; at N the task ends `Done`, or `Failed` with the
//!    message of the last file that failed
//! 7. Optionally write `offload-manifest.json` (records in listing order),
//!    then activate the next task
//!
//! After each handled command the new [`OffloadSnapshot`] is published.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_offload::SessionCoordinator;
//!
//! let coordinator = SessionCoordinator::from_config(&config, event_bus);
//! coordinator.start_discovery().await?;
//!
//! let camera = coordinator.devices().remove(0);
//! coordinator.select_device(&camera).await?;
//! coordinator.enqueue(camera, "/Users/jo/Pictures", "Trip").await?;
//! coordinator.start().await?;
//!
//! let done = coordinator.wait_until_idle().await?;
//! println!("{} done, {} failed", done.stats.done, done.stats.failed);
//! ```

use crate::{
    error::{OffloadError, Result},
    naming,
    queue::{Dispatch, DownloadQueue},
    state::{ChangeSubscription, OffloadSnapshot, StatePublisher},
    task::{OffloadRecord, TaskId, TaskOutcome, TaskStatus},
};
use bridge_traits::{
    BridgeError, Clock, DeviceEventHandler, DeviceId, DeviceRef, DeviceService, DownloadRequest,
    FileSystemAccess, MediaItem, TransferId,
};
use bytes::Bytes;
use core_runtime::config::{CoreConfig, SessionPolicy};
use core_runtime::events::{CoreEvent, DeviceEvent, EventBus, QueueEvent, Receiver, TransferEvent};
use core_runtime::logging::strip_path;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// File written next to the transferred files when manifests are enabled
pub const MANIFEST_FILE_NAME: &str = "offload-manifest.json";

/// Coordinator behavior knobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub session_policy: SessionPolicy,
    /// Force-fail the active task after this long without transfer events
    pub stall_timeout: Option<Duration>,
    pub write_manifest: bool,
}

impl From<&CoreConfig> for CoordinatorSettings {
    fn from(config: &CoreConfig) -> Self {
        Self {
            session_policy: config.session_policy,
            stall_timeout: config.stall_timeout,
            write_manifest: config.write_manifest,
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

enum Command {
    Enqueue {
        device: DeviceRef,
        destination: PathBuf,
        prefix: String,
        reply: oneshot::Sender<TaskId>,
    },
    Start {
        reply: oneshot::Sender<()>,
    },
    DeviceAdded(DeviceRef),
    DeviceRemoved(DeviceId),
    SessionOpened {
        device_id: DeviceId,
        result: std::result::Result<(), String>,
    },
    DeviceReady(DeviceId),
    FileProgress {
        transfer_id: TransferId,
        bytes_done: u64,
        bytes_total: u64,
    },
    FileCompleted {
        transfer_id: TransferId,
        result: std::result::Result<(), String>,
    },
    /// Listing done and subdirectory created for the active task
    Prepared {
        task_id: TaskId,
        result: Result<Vec<MediaItem>>,
    },
    /// The session request made for a task waiting on its device failed
    SessionRejected {
        task_id: TaskId,
        error: OffloadError,
    },
    ManifestWritten {
        task_id: TaskId,
    },
}

/// [`DeviceEventHandler`] registered with the device service.
///
/// Callbacks may arrive on any thread; each one only enqueues a command.
struct CommandForwarder {
    commands: mpsc::UnboundedSender<Command>,
}

impl CommandForwarder {
    fn forward(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Coordinator stopped, dropping device callback");
        }
    }
}

impl DeviceEventHandler for CommandForwarder {
    fn device_added(&self, device: DeviceRef) {
        self.forward(Command::DeviceAdded(device));
    }

    fn device_removed(&self, device_id: DeviceId) {
        self.forward(Command::DeviceRemoved(device_id));
    }

    fn session_opened(&self, device_id: DeviceId, result: std::result::Result<(), BridgeError>) {
        self.forward(Command::SessionOpened {
            device_id,
            result: result.map_err(|e| e.to_string()),
        });
    }

    fn device_ready(&self, device_id: DeviceId) {
        self.forward(Command::DeviceReady(device_id));
    }

    fn file_progress(&self, transfer_id: TransferId, bytes_done: u64, bytes_total: u64) {
        self.forward(Command::FileProgress {
            transfer_id,
            bytes_done,
            bytes_total,
        });
    }

    fn file_completed(
        &self,
        transfer_id: TransferId,
        result: std::result::Result<(), BridgeError>,
    ) {
        self.forward(Command::FileCompleted {
            transfer_id,
            result: result.map_err(|e| e.to_string()),
        });
    }
}

// ============================================================================
// Session Coordinator
// ============================================================================

/// Runs offload tasks one at a time against a [`DeviceService`]
pub struct SessionCoordinator {
    forwarder: Arc<CommandForwarder>,
    state: watch::Receiver<OffloadSnapshot>,
    device_service: Arc<dyn DeviceService>,
    event_bus: Arc<EventBus>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionCoordinator {
    /// Create a coordinator and spawn its event loop.
    ///
    /// Registers itself as the device service's event handler. Must be called
    /// from within a Tokio runtime.
    pub fn new(
        device_service: Arc<dyn DeviceService>,
        file_system: Arc<dyn FileSystemAccess>,
        clock: Arc<dyn Clock>,
        settings: CoordinatorSettings,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let forwarder = Arc::new(CommandForwarder {
            commands: commands.clone(),
        });
        device_service.set_event_handler(forwarder.clone());

        let (publisher, state) = StatePublisher::new();
        let shutdown = CancellationToken::new();

        let event_loop = EventLoop {
            queue: DownloadQueue::new(clock),
            devices: Vec::new(),
            ready: HashSet::new(),
            run: None,
            stall_deadline: None,
            settings,
            device_service: Arc::clone(&device_service),
            file_system,
            event_bus: Arc::clone(&event_bus),
            publisher,
            commands,
        };
        let worker = tokio::spawn(event_loop.run(receiver, shutdown.clone()));

        info!(
            policy = ?settings.session_policy,
            stall_timeout = ?settings.stall_timeout,
            write_manifest = settings.write_manifest,
            "Session coordinator started"
        );

        Self {
            forwarder,
            state,
            device_service,
            event_bus,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Create a coordinator from the bridges and settings of a [`CoreConfig`]
    pub fn from_config(config: &CoreConfig, event_bus: Arc<EventBus>) -> Self {
        Self::new(
            Arc::clone(&config.device_service),
            Arc::clone(&config.file_system),
            Arc::clone(&config.clock),
            CoordinatorSettings::from(config),
            event_bus,
        )
    }

    fn send(&self, command: Command) -> Result<()> {
        self.forwarder
            .commands
            .send(command)
            .map_err(|_| OffloadError::CoordinatorStopped)
    }

    /// Ask the device service to start reporting attached devices
    pub async fn start_discovery(&self) -> Result<()> {
        self.device_service
            .start_discovery()
            .await
            .map_err(|e| OffloadError::DiscoveryFailed(e.to_string()))
    }

    /// Request a session with a device.
    ///
    /// A session failure is returned here and reported on the event bus; it
    /// never fails a queued task on its own.
    #[instrument(skip(self, device), fields(device = %device.display_name()))]
    pub async fn select_device(&self, device: &DeviceRef) -> Result<()> {
        self.device_service.open_session(device).await.map_err(|e| {
            warn!(error = %e, "Failed to open device session");
            OffloadError::DeviceSessionError {
                device: device.display_name().to_string(),
                message: e.to_string(),
            }
        })
    }

    /// Append a pending task; it runs once the queue is started
    #[instrument(
        skip(self, device, destination, prefix),
        fields(device = %device.display_name())
    )]
    pub async fn enqueue(
        &self,
        device: DeviceRef,
        destination: impl Into<PathBuf>,
        prefix: impl Into<String>,
    ) -> Result<TaskId> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Enqueue {
            device,
            destination: destination.into(),
            prefix: prefix.into(),
            reply,
        })?;
        response.await.map_err(|_| OffloadError::CoordinatorStopped)
    }

    /// Start the queue runner; no effect while it is already running
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Start { reply })?;
        response.await.map_err(|_| OffloadError::CoordinatorStopped)
    }

    /// Current state
    pub fn snapshot(&self) -> OffloadSnapshot {
        self.state.borrow().clone()
    }

    /// Attached devices, in discovery order
    pub fn devices(&self) -> Vec<DeviceRef> {
        self.state.borrow().devices.clone()
    }

    /// Receiver that is notified of every state change
    pub fn subscribe(&self) -> watch::Receiver<OffloadSnapshot> {
        self.state.clone()
    }

    /// Call `callback` with every new state until the subscription is dropped
    pub fn on_change<F>(&self, callback: F) -> ChangeSubscription
    where
        F: FnMut(&OffloadSnapshot) + Send + 'static,
    {
        ChangeSubscription::spawn(self.state.clone(), callback)
    }

    /// Subscribe to device, queue and transfer events
    pub fn subscribe_events(&self) -> Receiver<CoreEvent> {
        self.event_bus.subscribe()
    }

    /// Wait until no task is pending or in progress and the runner stopped
    pub async fn wait_until_idle(&self) -> Result<OffloadSnapshot> {
        let mut state = self.state.clone();
        let snapshot = state
            .wait_for(|snapshot| snapshot.is_idle())
            .await
            .map_err(|_| OffloadError::CoordinatorStopped)?;
        Ok(snapshot.clone())
    }

    /// Stop the event loop. Tasks keep their last state; in-flight transfers
    /// are no longer tracked.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Coordinator event loop ended abnormally");
            }
        }
        info!("Session coordinator stopped");
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl DeviceEventHandler for SessionCoordinator {
    fn device_added(&self, device: DeviceRef) {
        self.forwarder.device_added(device);
    }

    fn device_removed(&self, device_id: DeviceId) {
        self.forwarder.device_removed(device_id);
    }

    fn session_opened(&self, device_id: DeviceId, result: std::result::Result<(), BridgeError>) {
        self.forwarder.session_opened(device_id, result);
    }

    fn device_ready(&self, device_id: DeviceId) {
        self.forwarder.device_ready(device_id);
    }

    fn file_progress(&self, transfer_id: TransferId, bytes_done: u64, bytes_total: u64) {
        self.forwarder.file_progress(transfer_id, bytes_done, bytes_total);
    }

    fn file_completed(
        &self,
        transfer_id: TransferId,
        result: std::result::Result<(), BridgeError>,
    ) {
        self.forwarder.file_completed(transfer_id, result);
    }
}

// ============================================================================
// Event Loop
// ============================================================================

struct FileSlot {
    /// Position of the item in the device listing
    position: usize,
    original_name: String,
    final_name: String,
    bytes_done: u64,
    bytes_total: u64,
    finished: bool,
}

struct Transfers {
    expected: usize,
    finished: usize,
    last_error: Option<String>,
    files: HashMap<TransferId, FileSlot>,
}

enum RunPhase {
    /// Listing the device and creating the subdirectory
    Starting,
    AwaitingReady,
    Transferring(Transfers),
    /// Every file reported; the manifest is being written
    Finishing(TaskOutcome),
}

/// Bookkeeping for the active task
struct ActiveRun {
    index: usize,
    task_id: TaskId,
    device: DeviceRef,
    prefix: String,
    subdirectory: PathBuf,
    short_id: String,
    phase: RunPhase,
    /// Device and file-system calls spawned for this task
    io: Vec<JoinHandle<()>>,
}

impl ActiveRun {
    fn abort_io(&self) {
        for handle in &self.io {
            handle.abort();
        }
    }
}

struct EventLoop {
    queue: DownloadQueue,
    devices: Vec<DeviceRef>,
    ready: HashSet<DeviceId>,
    run: Option<ActiveRun>,
    stall_deadline: Option<Instant>,
    settings: CoordinatorSettings,
    device_service: Arc<dyn DeviceService>,
    file_system: Arc<dyn FileSystemAccess>,
    event_bus: Arc<EventBus>,
    publisher: StatePublisher,
    /// Spawned I/O reports back through the same channel as callbacks
    commands: mpsc::UnboundedSender<Command>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// List the device, then create the task's subdirectory
async fn list_and_create_dir(
    device_service: &dyn DeviceService,
    file_system: &dyn FileSystemAccess,
    device: &DeviceRef,
    subdirectory: &Path,
) -> Result<Vec<MediaItem>> {
    let items = device_service
        .list_media_items(device)
        .await
        .map_err(|e| OffloadError::MediaListingFailed {
            device: device.display_name().to_string(),
            message: e.to_string(),
        })?;

    file_system
        .create_dir_all(subdirectory)
        .await
        .map_err(|e| OffloadError::DirectoryCreationFailed {
            path: subdirectory.display().to_string(),
            message: e.to_string(),
        })?;

    Ok(items)
}

impl EventLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) {
        self.publish();

        loop {
            let deadline = self.stall_deadline;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sleep_until(deadline) => self.on_stall(),
            }
            self.publish();
        }

        if let Some(run) = self.run.take() {
            run.abort_io();
        }
        debug!("Coordinator event loop exited");
    }

    fn publish(&self) {
        self.publisher
            .publish(OffloadSnapshot::capture(&self.queue, &self.devices));
    }

    fn emit(&self, event: CoreEvent) {
        self.event_bus.emit(event).ok();
    }

    fn next_deadline(settings: &CoordinatorSettings) -> Option<Instant> {
        settings.stall_timeout.map(|timeout| Instant::now() + timeout)
    }

    fn is_active(&self, task_id: TaskId) -> bool {
        self.run.as_ref().is_some_and(|run| run.task_id == task_id)
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue {
                device,
                destination,
                prefix,
                reply,
            } => {
                let device_id = device.id.to_string();
                let task_id = self.queue.enqueue(device, destination, prefix.clone());
                self.emit(CoreEvent::Queue(QueueEvent::TaskEnqueued {
                    task_id: task_id.to_string(),
                    device_id,
                    prefix,
                }));
                self.publish();
                reply.send(task_id).ok();
            }
            Command::Start { reply } => {
                if !self.queue.is_running() {
                    let next = self.queue.start();
                    self.advance(next);
                }
                self.publish();
                reply.send(()).ok();
            }
            Command::DeviceAdded(device) => self.on_device_added(device),
            Command::DeviceRemoved(device_id) => self.on_device_removed(device_id),
            Command::SessionOpened { device_id, result } => {
                self.on_session_opened(device_id, result)
            }
            Command::DeviceReady(device_id) => self.on_device_ready(device_id),
            Command::FileProgress {
                transfer_id,
                bytes_done,
                bytes_total,
            } => self.on_file_progress(transfer_id, bytes_done, bytes_total),
            Command::FileCompleted {
                transfer_id,
                result,
            } => {
                if let Some(outcome) = self.on_file_finished(transfer_id, result) {
                    self.finish_transfers(outcome);
                }
            }
            Command::Prepared { task_id, result } => self.on_prepared(task_id, result),
            Command::SessionRejected { task_id, error } => {
                self.on_session_rejected(task_id, error)
            }
            Command::ManifestWritten { task_id } => self.on_manifest_written(task_id),
        }
    }

    /// Begin the dispatched task, or report the queue idle
    fn advance(&mut self, next: Option<Dispatch>) {
        if let Some(dispatch) = next {
            self.begin_task(dispatch);
            return;
        }

        if !self.queue.is_running() {
            let stats = self.queue.stats();
            info!(done = stats.done, failed = stats.failed, "Queue idle");
            self.emit(CoreEvent::Queue(QueueEvent::Idle {
                tasks_done: stats.done as u64,
                tasks_failed: stats.failed as u64,
            }));
        }
    }

    fn begin_task(&mut self, dispatch: Dispatch) {
        self.emit(CoreEvent::Queue(QueueEvent::TaskStarted {
            task_id: dispatch.task_id.to_string(),
            device_id: dispatch.device.id.to_string(),
        }));
        self.stall_deadline = Self::next_deadline(&self.settings);

        let awaiting_ready = self.settings.session_policy == SessionPolicy::AwaitReady
            && !self.ready.contains(&dispatch.device.id);

        self.run = Some(ActiveRun {
            index: dispatch.index,
            task_id: dispatch.task_id,
            device: dispatch.device,
            prefix: dispatch.prefix,
            subdirectory: dispatch.subdirectory,
            short_id: dispatch.short_id,
            phase: if awaiting_ready {
                RunPhase::AwaitingReady
            } else {
                RunPhase::Starting
            },
            io: Vec::new(),
        });

        if awaiting_ready {
            debug!(task_id = %dispatch.task_id, "Waiting for device to become ready");
            self.request_session();
        } else {
            self.prepare();
        }
    }

    /// Run `work` off the loop; it is aborted when the active task ends
    fn spawn_io<F>(&mut self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        match self.run.as_mut() {
            Some(run) => run.io.push(handle),
            None => handle.abort(),
        }
    }

    /// Ask for a session with the active task's device; only a failure reports back
    fn request_session(&mut self) {
        let Some(run) = self.run.as_ref() else {
            return;
        };
        let task_id = run.task_id;
        let device = run.device.clone();
        let device_service = Arc::clone(&self.device_service);
        let commands = self.commands.clone();

        self.spawn_io(async move {
            if let Err(e) = device_service.open_session(&device).await {
                let error = OffloadError::DeviceSessionError {
                    device: device.display_name().to_string(),
                    message: e.to_string(),
                };
                commands.send(Command::SessionRejected { task_id, error }).ok();
            }
        });
    }

    /// List the active task's device and create its subdirectory
    fn prepare(&mut self) {
        let Some(run) = self.run.as_ref() else {
            return;
        };
        let task_id = run.task_id;
        let device = run.device.clone();
        let subdirectory = run.subdirectory.clone();
        let device_service = Arc::clone(&self.device_service);
        let file_system = Arc::clone(&self.file_system);
        let commands = self.commands.clone();

        self.spawn_io(async move {
            let result = list_and_create_dir(
                device_service.as_ref(),
                file_system.as_ref(),
                &device,
                &subdirectory,
            )
            .await;
            commands.send(Command::Prepared { task_id, result }).ok();
        });
    }

    /// Name every listed item and issue the downloads
    fn on_prepared(&mut self, task_id: TaskId, result: Result<Vec<MediaItem>>) {
        if !self.is_active(task_id) {
            debug!(task_id = %task_id, "Listing for inactive task ignored");
            return;
        }
        let items = match result {
            Ok(items) => items,
            Err(error) => {
                warn!(task_id = %task_id, error = %error, "Task setup failed");
                self.fail_active(error);
                return;
            }
        };
        let Some(run) = self.run.as_mut() else {
            return;
        };
        self.stall_deadline = Self::next_deadline(&self.settings);

        let plan = naming::plan_names(&run.prefix, run.device.serial_number.as_deref(), &items);
        let files_total = items.len() as u64;
        let bytes_total: u64 = items.iter().filter_map(|item| item.size).sum();

        let requests: Vec<DownloadRequest> = items
            .into_iter()
            .zip(plan.files)
            .map(|(item, planned)| DownloadRequest {
                transfer_id: TransferId::new(),
                item,
                directory: run.subdirectory.clone(),
                file_name: planned.final_name,
                overwrite: true,
            })
            .collect();

        let files = requests
            .iter()
            .enumerate()
            .map(|(position, request)| {
                (
                    request.transfer_id,
                    FileSlot {
                        position,
                        original_name: request.item.name.clone(),
                        final_name: request.file_name.clone(),
                        bytes_done: 0,
                        bytes_total: request.item.size.unwrap_or(0),
                        finished: false,
                    },
                )
            })
            .collect();

        info!(
            task_id = %task_id,
            files = requests.len(),
            subdirectory = %plan.subdirectory,
            "Transferring files"
        );

        run.phase = RunPhase::Transferring(Transfers {
            expected: requests.len(),
            finished: 0,
            last_error: None,
            files,
        });
        let index = run.index;
        let device = run.device.clone();

        if let Err(e) = self.queue.record_plan(index, files_total, bytes_total) {
            warn!(task_id = %task_id, error = %e, "Failed to record listing size");
        }

        if requests.is_empty() {
            self.finish_transfers(TaskOutcome::Done);
        } else {
            self.issue_downloads(device, requests);
        }
    }

    /// Hand every request to the device service, back to back. A rejected
    /// request reports back as a failed file.
    fn issue_downloads(&mut self, device: DeviceRef, requests: Vec<DownloadRequest>) {
        let device_service = Arc::clone(&self.device_service);
        let commands = self.commands.clone();

        self.spawn_io(async move {
            for request in requests {
                let transfer_id = request.transfer_id;
                debug!(
                    item = strip_path(&request.item.handle),
                    file = %request.file_name,
                    "Requesting download"
                );
                if let Err(e) = device_service.begin_download(&device, request).await {
                    commands
                        .send(Command::FileCompleted {
                            transfer_id,
                            result: Err(e.to_string()),
                        })
                        .ok();
                }
            }
        });
    }

    fn on_file_progress(&mut self, transfer_id: TransferId, bytes_done: u64, bytes_total: u64) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let RunPhase::Transferring(transfers) = &mut run.phase else {
            return;
        };
        let Some(slot) = transfers.files.get_mut(&transfer_id) else {
            debug!(transfer_id = %transfer_id, "Progress for unknown transfer ignored");
            return;
        };
        if slot.finished {
            return;
        }

        slot.bytes_done = bytes_done;
        slot.bytes_total = bytes_total;
        let file_name = slot.final_name.clone();

        let (done, total) = transfers
            .files
            .values()
            .fold((0u64, 0u64), |(done, total), slot| {
                (done + slot.bytes_done, total + slot.bytes_total)
            });
        if let Err(e) = self.queue.record_file_progress(run.index, done, total) {
            warn!(error = %e, "Failed to record transfer progress");
        }
        self.stall_deadline = Self::next_deadline(&self.settings);

        self.event_bus
            .emit(CoreEvent::Transfer(TransferEvent::Progress {
                task_id: run.task_id.to_string(),
                file_name,
                bytes_done,
                bytes_total,
            }))
            .ok();
    }

    /// Count one file; returns the task outcome once all files finished
    fn on_file_finished(
        &mut self,
        transfer_id: TransferId,
        result: std::result::Result<(), String>,
    ) -> Option<TaskOutcome> {
        let run = self.run.as_mut()?;
        let RunPhase::Transferring(transfers) = &mut run.phase else {
            return None;
        };
        let Some(slot) = transfers.files.get_mut(&transfer_id) else {
            debug!(transfer_id = %transfer_id, "Completion for unknown transfer ignored");
            return None;
        };
        if slot.finished {
            debug!(transfer_id = %transfer_id, "Duplicate completion ignored");
            return None;
        }

        slot.finished = true;
        transfers.finished += 1;
        self.stall_deadline = Self::next_deadline(&self.settings);
        let task_id = run.task_id.to_string();

        match result {
            Ok(()) => {
                slot.bytes_done = slot.bytes_done.max(slot.bytes_total);
                let record = OffloadRecord {
                    position: slot.position,
                    original_name: slot.original_name.clone(),
                    new_name: slot.final_name.clone(),
                    device_id: run.short_id.clone(),
                };
                debug!(task_id = %task_id, file = %record.new_name, "File transferred");
                if let Err(e) = self.queue.record_file_result(run.index, Ok(record.clone())) {
                    warn!(error = %e, "Failed to record transferred file");
                }
                self.event_bus
                    .emit(CoreEvent::Transfer(TransferEvent::FileCompleted {
                        task_id,
                        original_name: record.original_name,
                        file_name: record.new_name,
                    }))
                    .ok();
            }
            Err(message) => {
                let error = OffloadError::FileDownloadFailed {
                    file_name: slot.final_name.clone(),
                    message: message.clone(),
                }
                .to_string();
                warn!(
                    task_id = %task_id,
                    file = %slot.final_name,
                    error = %message,
                    "File transfer failed"
                );
                if let Err(e) = self.queue.record_file_result(run.index, Err(error.clone())) {
                    warn!(error = %e, "Failed to record failed file");
                }
                self.event_bus
                    .emit(CoreEvent::Transfer(TransferEvent::FileFailed {
                        task_id,
                        file_name: slot.final_name.clone(),
                        message,
                    }))
                    .ok();
                transfers.last_error = Some(error);
            }
        }

        if transfers.finished < transfers.expected {
            return None;
        }

        Some(match transfers.last_error.clone() {
            Some(message) => TaskOutcome::Failed(message),
            None => TaskOutcome::Done,
        })
    }

    /// Every file reported: write the manifest when enabled, then complete
    fn finish_transfers(&mut self, outcome: TaskOutcome) {
        if !self.settings.write_manifest {
            let next = self.complete_task(outcome);
            self.advance(next);
            return;
        }
        let Some(run) = self.run.as_ref() else {
            return;
        };

        let task_id = run.task_id;
        let path = run.subdirectory.join(MANIFEST_FILE_NAME);
        let records = self
            .queue
            .get(&task_id)
            .map(|task| task.records.clone())
            .unwrap_or_default();
        let data = match serde_json::to_vec_pretty(&records) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to serialize offload manifest");
                let next = self.complete_task(outcome);
                self.advance(next);
                return;
            }
        };

        let file_system = Arc::clone(&self.file_system);
        let commands = self.commands.clone();
        if let Some(run) = self.run.as_mut() {
            run.phase = RunPhase::Finishing(outcome);
        }
        self.spawn_io(async move {
            match file_system.write_file(&path, Bytes::from(data)).await {
                Ok(()) => debug!(path = ?path, records = records.len(), "Wrote offload manifest"),
                Err(e) => warn!(path = ?path, error = %e, "Failed to write offload manifest"),
            }
            commands.send(Command::ManifestWritten { task_id }).ok();
        });
    }

    fn on_manifest_written(&mut self, task_id: TaskId) {
        let outcome = match self.run.as_ref() {
            Some(run) if run.task_id == task_id => match &run.phase {
                RunPhase::Finishing(outcome) => outcome.clone(),
                _ => return,
            },
            _ => return,
        };
        let next = self.complete_task(outcome);
        self.advance(next);
    }

    /// Finish the active task; returns the next dispatch if the queue advanced
    fn complete_task(&mut self, outcome: TaskOutcome) -> Option<Dispatch> {
        let run = self.run.take()?;
        run.abort_io();
        self.stall_deadline = None;

        let next = match self.queue.on_task_completed(run.index, outcome) {
            Ok(next) => next,
            Err(e) => {
                warn!(task_id = %run.task_id, error = %e, "Failed to complete task");
                return None;
            }
        };

        if let Ok(task) = self.queue.get(&run.task_id) {
            let event = match task.status {
                TaskStatus::Failed => QueueEvent::TaskFailed {
                    task_id: task.id.to_string(),
                    message: task.error_detail.clone().unwrap_or_default(),
                    files_failed: task.progress.files_failed,
                },
                _ => QueueEvent::TaskCompleted {
                    task_id: task.id.to_string(),
                    files_transferred: task.progress.files_completed,
                    duration_secs: task.duration_secs().unwrap_or(0),
                },
            };
            self.emit(CoreEvent::Queue(event));
        }

        next
    }

    fn fail_active(&mut self, error: OffloadError) {
        let next = self.complete_task(TaskOutcome::Failed(error.to_string()));
        self.advance(next);
    }

    fn on_stall(&mut self) {
        self.stall_deadline = None;
        let Some(timeout) = self.settings.stall_timeout else {
            return;
        };
        let Some(run) = self.run.as_ref() else {
            return;
        };

        if let RunPhase::Finishing(outcome) = &run.phase {
            warn!(task_id = %run.task_id, "Manifest write timed out");
            let outcome = outcome.clone();
            let next = self.complete_task(outcome);
            self.advance(next);
            return;
        }

        warn!(
            task_id = %run.task_id,
            timeout_secs = timeout.as_secs(),
            "No transfer activity, failing task"
        );
        self.fail_active(OffloadError::TransferStalled {
            seconds: timeout.as_secs(),
        });
    }

    fn on_device_added(&mut self, device: DeviceRef) {
        info!(device = %device.display_name(), id = %device.id, "Device discovered");
        self.emit(CoreEvent::Device(DeviceEvent::Discovered {
            device_id: device.id.to_string(),
            name: device.name.clone(),
        }));

        match self.devices.iter_mut().find(|known| known.id == device.id) {
            Some(known) => *known = device,
            None => self.devices.push(device),
        }
    }

    fn on_device_removed(&mut self, device_id: DeviceId) {
        info!(id = %device_id, "Device removed");
        self.devices.retain(|device| device.id != device_id);
        self.ready.remove(&device_id);
        self.emit(CoreEvent::Device(DeviceEvent::Removed {
            device_id: device_id.to_string(),
        }));

        let awaiting = match self.run.as_ref() {
            Some(run) if run.device.id == device_id => match run.phase {
                RunPhase::AwaitingReady => Some(run.device.display_name().to_string()),
                _ => {
                    warn!(
                        task_id = %run.task_id,
                        "Active device removed; waiting for its transfers to report"
                    );
                    None
                }
            },
            _ => None,
        };

        if let Some(device) = awaiting {
            self.fail_active(OffloadError::DeviceSessionError {
                device,
                message: "device removed before it became ready".to_string(),
            });
        }
    }

    /// Name of the active task's device while it waits on `device_id`
    fn awaiting_device(&self, device_id: &DeviceId) -> Option<String> {
        self.run
            .as_ref()
            .filter(|run| &run.device.id == device_id)
            .filter(|run| matches!(run.phase, RunPhase::AwaitingReady))
            .map(|run| run.device.display_name().to_string())
    }

    fn on_session_opened(&mut self, device_id: DeviceId, result: std::result::Result<(), String>) {
        let message = match result {
            Ok(()) => {
                debug!(id = %device_id, "Device session opened");
                self.emit(CoreEvent::Device(DeviceEvent::SessionOpened {
                    device_id: device_id.to_string(),
                }));
                return;
            }
            Err(message) => message,
        };

        warn!(id = %device_id, error = %message, "Device session failed");
        self.emit(CoreEvent::Device(DeviceEvent::SessionFailed {
            device_id: device_id.to_string(),
            message: message.clone(),
        }));

        if let Some(device) = self.awaiting_device(&device_id) {
            self.fail_active(OffloadError::DeviceSessionError { device, message });
        }
    }

    fn on_session_rejected(&mut self, task_id: TaskId, error: OffloadError) {
        let awaiting = self.run.as_ref().is_some_and(|run| {
            run.task_id == task_id && matches!(run.phase, RunPhase::AwaitingReady)
        });
        if !awaiting {
            debug!(task_id = %task_id, "Session failure for inactive task ignored");
            return;
        }

        warn!(task_id = %task_id, error = %error, "Device session request failed");
        self.fail_active(error);
    }

    fn on_device_ready(&mut self, device_id: DeviceId) {
        debug!(id = %device_id, "Device ready");
        let awaiting = self.awaiting_device(&device_id).is_some();
        self.ready.insert(device_id.clone());
        self.emit(CoreEvent::Device(DeviceEvent::Ready {
            device_id: device_id.to_string(),
        }));

        if !awaiting {
            return;
        }
        if let Some(run) = self.run.as_mut() {
            run.phase = RunPhase::Starting;
        }
        self.stall_deadline = Self::next_deadline(&self.settings);
        self.prepare();
    }
}
