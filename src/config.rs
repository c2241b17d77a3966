//! Node configuration
//!
//! The resolved settings one recording node runs with: camera device
//! assignment, output root, control endpoint address, and capture limits.
//! Loading and saving these records is the concern of an external
//! configuration layer; the supervisor only consumes resolved values.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::capture::{CameraInfo, Resolution};

/// Resolved per-node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Address the control endpoint binds to
    pub bind: SocketAddr,

    /// Device path for camera 0 (top/left pane in fusion)
    pub cam0_device: PathBuf,

    /// Device path for camera 1 (bottom/right pane in fusion)
    pub cam1_device: PathBuf,

    /// Root directory capture folders are created under
    pub output_root: PathBuf,

    /// Capture ranges the cameras support
    #[serde(default)]
    pub limits: CaptureLimits,

    /// Allowed frame-count divergence between the two files, as a
    /// fraction of the expected frame count
    #[serde(default = "default_desync_tolerance")]
    pub desync_tolerance: f64,

    /// Seconds to wait for ffmpeg to finalize before force-killing
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl NodeConfig {
    /// The node's two cameras in pane order
    pub fn cameras(&self) -> Vec<CameraInfo> {
        vec![
            CameraInfo {
                index: 0,
                device: self.cam0_device.clone(),
            },
            CameraInfo {
                index: 1,
                device: self.cam1_device.clone(),
            },
        ]
    }
}

fn default_desync_tolerance() -> f64 {
    0.01
}

fn default_stop_grace_secs() -> u64 {
    5
}

/// Parameter ranges a node's cameras support
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureLimits {
    pub min_fps: u32,
    pub max_fps: u32,

    /// Supported capture resolutions. Empty means any resolution is
    /// accepted as-is.
    #[serde(default)]
    pub resolutions: Vec<Resolution>,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            min_fps: 1,
            max_fps: 120,
            resolutions: vec![
                Resolution {
                    width: 640,
                    height: 480,
                },
                Resolution {
                    width: 1280,
                    height: 720,
                },
                Resolution {
                    width: 1920,
                    height: 1080,
                },
            ],
        }
    }
}

impl CaptureLimits {
    pub fn supports_fps(&self, fps: u32) -> bool {
        fps >= self.min_fps && fps <= self.max_fps
    }

    pub fn supports_resolution(&self, width: u32, height: u32) -> bool {
        self.resolutions.is_empty()
            || self
                .resolutions
                .iter()
                .any(|r| r.width == width && r.height == height)
    }
}
