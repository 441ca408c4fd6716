use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OffloadError {
    #[error("Failed to create directory {path}: {message}")]
    DirectoryCreationFailed { path: String, message: String },

    #[error("Failed to download {file_name}: {message}")]
    FileDownloadFailed { file_name: String, message: String },

    #[error("Device session error for {device}: {message}")]
    DeviceSessionError { device: String, message: String },

    #[error("Device discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Failed to list media on {device}: {message}")]
    MediaListingFailed { device: String, message: String },

    #[error("No transfer activity for {seconds} seconds")]
    TransferStalled { seconds: u64 },

    #[error("Task at index {index} is not the active task")]
    TaskNotActive { index: usize },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Task {task_id} not found")]
    TaskNotFound { task_id: String },

    #[error("Invalid task ID: {0}")]
    InvalidTaskId(String),

    #[error("Invalid task status: {0}")]
    InvalidStatus(String),

    #[error("Session coordinator has stopped")]
    CoordinatorStopped,
}

pub type Result<T> = std::result::Result<T, OffloadError>;
