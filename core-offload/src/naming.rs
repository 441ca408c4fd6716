//! # File Naming
//!
//! Pure functions deciding where transferred files land and what they are
//! called. Given the same prefix, device serial and listing they always
//! produce the same names:
//!
//! ```text
//! <destination>/<prefix>_<short id>/<prefix><type tag><NNNN>.<ext>
//!               Trip_C0FE/           Trip_IMG_0001.JPG
//! ```
//!
//! The prefix is used verbatim. A prefix containing a path separator yields
//! a nested directory and names containing that separator.

use bridge_traits::MediaItem;
use serde::{Deserialize, Serialize};

/// Short identifier used when the device reports no serial number
pub const UNKNOWN_DEVICE_ID: &str = "UnknownDev";

const SHORT_ID_LEN: usize = 4;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "heic", "heif", "tif", "tiff"];
const VIDEO_EXTENSIONS: &[&str] = &["mov", "mp4", "m4v", "avi"];

/// Media category derived from a file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Image,
    Video,
    File,
}

impl MediaKind {
    /// Classify an extension (without the dot), ignoring case
    pub fn from_extension(extension: &str) -> Self {
        let lower = extension.to_lowercase();
        if IMAGE_EXTENSIONS.contains(&lower.as_str()) {
            MediaKind::Image
        } else if VIDEO_EXTENSIONS.contains(&lower.as_str()) {
            MediaKind::Video
        } else {
            MediaKind::File
        }
    }

    /// The infix placed between prefix and sequence number
    pub fn tag(&self) -> &'static str {
        match self {
            MediaKind::Image => "_IMG_",
            MediaKind::Video => "_VID_",
            MediaKind::File => "_FILE_",
        }
    }
}

/// Last four characters of the serial, the whole serial if shorter, or
/// [`UNKNOWN_DEVICE_ID`] when it is absent or empty.
///
/// ```
/// use core_offload::naming::short_device_id;
///
/// assert_eq!(short_device_id(Some("SN-00C0FE")), "C0FE");
/// assert_eq!(short_device_id(None), "UnknownDev");
/// ```
pub fn short_device_id(serial: Option<&str>) -> String {
    match serial {
        Some(serial) if !serial.is_empty() => {
            let count = serial.chars().count();
            serial
                .chars()
                .skip(count.saturating_sub(SHORT_ID_LEN))
                .collect()
        }
        _ => UNKNOWN_DEVICE_ID.to_string(),
    }
}

/// `"{prefix}_{short_id}"`
pub fn subdirectory_name(prefix: &str, short_id: &str) -> String {
    format!("{}_{}", prefix, short_id)
}

/// Type tag for an extension; see [`MediaKind`]
pub fn type_tag(extension: &str) -> &'static str {
    MediaKind::from_extension(extension).tag()
}

/// `"{prefix}{tag}{ordinal:04}.{extension}"`.
///
/// Ordinals above 9999 keep all their digits. The extension keeps its case
/// and an empty extension still gets the dot.
pub fn final_file_name(prefix: &str, tag: &str, ordinal: usize, extension: &str) -> String {
    format!("{}{}{:04}.{}", prefix, tag, ordinal, extension)
}

/// Text after the last `.` of a file name; empty when there is none or the
/// only dot starts a hidden file name.
pub fn extension_of(name: &str) -> &str {
    match name.rfind('.') {
        None | Some(0) => "",
        Some(dot) => &name[dot + 1..],
    }
}

/// One item of a [`NamingPlan`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedFile {
    /// 1-based position in the device listing
    pub ordinal: usize,
    pub original_name: String,
    pub final_name: String,
}

/// Names for one task: the subdirectory and one entry per media item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingPlan {
    pub short_id: String,
    pub subdirectory: String,
    pub files: Vec<PlannedFile>,
}

/// Compute every name a task needs, in listing order
pub fn plan_names(prefix: &str, serial: Option<&str>, items: &[MediaItem]) -> NamingPlan {
    let short_id = short_device_id(serial);
    let subdirectory = subdirectory_name(prefix, &short_id);

    let files = items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let extension = extension_of(&item.name);
            let ordinal = index + 1;
            PlannedFile {
                ordinal,
                original_name: item.name.clone(),
                final_name: final_file_name(prefix, type_tag(extension), ordinal, extension),
            }
        })
        .collect();

    NamingPlan {
        short_id,
        subdirectory,
        files,
    }
}
