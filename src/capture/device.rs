//! Camera device descriptions
//!
//! A node drives exactly two cameras, addressed by their v4l2 device
//! paths. Device assignment comes from the resolved node configuration;
//! this module only checks that the assigned paths actually exist.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::supervisor::state::CaptureError;

/// Information about one of the node's cameras
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraInfo {
    /// Pane index: 0 is composed top/left, 1 bottom/right
    pub index: u8,

    /// v4l2 device path, e.g. `/dev/video0`
    pub device: PathBuf,
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Check that a camera device path exists.
///
/// A path that exists but is held by a live capture job is rejected by the
/// supervisor before this check; cross-process contention only surfaces
/// once ffmpeg tries to open the device.
pub fn resolve_device(device: &Path) -> Result<(), CaptureError> {
    if device.exists() {
        Ok(())
    } else {
        Err(CaptureError::DeviceNotFound(
            device.to_string_lossy().to_string(),
        ))
    }
}
