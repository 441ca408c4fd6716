//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `FileSystemAccess` using `tokio::fs`
//! - `DeviceService` for cameras and card readers that mount as mass storage
//!   (any volume with a `DCIM` directory)
//!
//! Cameras that only speak PTP/MTP need a platform service instead; the
//! offload core only sees the bridge traits.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{MountedVolumeService, TokioFileSystem};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let devices = Arc::new(MountedVolumeService::with_default_roots());
//!     let fs = Arc::new(TokioFileSystem::new());
//!
//!     // Use in core configuration
//! }
//! ```

mod filesystem;
mod volume;

pub use filesystem::TokioFileSystem;
pub use volume::{MountedVolumeService, DEFAULT_CHUNK_SIZE};
