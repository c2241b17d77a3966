//! Fusion job types and strategy selection
//!
//! A `FusionJob` describes one post-processing unit over a capture
//! folder. Strategy choice is a pure function of the declared input
//! properties, so it can be tested without ever invoking an encoder.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::capture::VideoProbe;
use crate::utils::error::ErrorResponse;

/// Pane arrangement of the composite: cam0 goes top (vertical) or left
/// (horizontal), cam1 takes the complementary position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    Vertical,
    Horizontal,
}

impl Layout {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layout::Vertical => "vertical",
            Layout::Horizontal => "horizontal",
        }
    }
}

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Layout {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vertical" => Ok(Layout::Vertical),
            "horizontal" => Ok(Layout::Horizontal),
            other => Err(FusionError::UnsupportedLayout(other.to_string())),
        }
    }
}

/// Per-camera rotation in clockwise degrees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub fn degrees(&self) -> u16 {
        match self {
            Rotation::None => 0,
            Rotation::Cw90 => 90,
            Rotation::Cw180 => 180,
            Rotation::Cw270 => 270,
        }
    }

    /// ffmpeg transpose steps for this rotation, if any
    pub fn transpose(&self) -> Option<&'static str> {
        match self {
            Rotation::None => None,
            Rotation::Cw90 => Some("transpose=1"),
            Rotation::Cw180 => Some("transpose=1,transpose=1"),
            Rotation::Cw270 => Some("transpose=2"),
        }
    }

    /// Quarter turns swap width and height
    pub fn swaps_dimensions(&self) -> bool {
        matches!(self, Rotation::Cw90 | Rotation::Cw270)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Rotation::None)
    }
}

impl TryFrom<u16> for Rotation {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Rotation::None),
            90 => Ok(Rotation::Cw90),
            180 => Ok(Rotation::Cw180),
            270 => Ok(Rotation::Cw270),
            other => Err(format!("rotation must be 0, 90, 180 or 270, got {}", other)),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(value: Rotation) -> Self {
        value.degrees()
    }
}

/// How the composite gets produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// Container-level remux, no re-encoding
    #[serde(rename = "copy")]
    Copy,
    /// Software decode/compose/re-encode
    #[serde(rename = "transcode")]
    Transcode,
    /// Transcode through the host's hardware encoder
    #[serde(rename = "hw-accel")]
    HwAccel,
}

/// One post-processing unit over a capture folder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionJob {
    /// Capture folder holding `cam0.mp4` and `cam1.mp4`
    pub folder: PathBuf,

    pub layout: Layout,

    #[serde(default)]
    pub rotation0: Rotation,

    #[serde(default)]
    pub rotation1: Rotation,

    /// Skip strategy selection and re-encode unconditionally; the retry
    /// knob after a copy remux failed on mismatched inputs
    #[serde(default)]
    pub force_transcode: bool,

    /// Output override; defaults to the deterministic name in the folder
    #[serde(default)]
    pub output: Option<PathBuf>,
}

impl FusionJob {
    pub fn new(folder: impl Into<PathBuf>, layout: Layout) -> Self {
        Self {
            folder: folder.into(),
            layout,
            rotation0: Rotation::None,
            rotation1: Rotation::None,
            force_transcode: false,
            output: None,
        }
    }

    pub fn cam0_input(&self) -> PathBuf {
        self.folder.join("cam0.mp4")
    }

    pub fn cam1_input(&self) -> PathBuf {
        self.folder.join("cam1.mp4")
    }

    pub fn rotated(&self) -> bool {
        !(self.rotation0.is_none() && self.rotation1.is_none())
    }

    fn folder_name(&self) -> String {
        self.folder
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "capture".to_string())
    }

    /// Deterministic composite path: derived from the folder name,
    /// layout, and rotations, so re-running the job overwrites its own
    /// previous output
    pub fn output_path(&self) -> PathBuf {
        if let Some(output) = &self.output {
            return output.clone();
        }
        let name = self.folder_name();
        let file = if self.rotated() {
            format!(
                "{}_concatenated_r{}_{}_{}.mp4",
                name,
                self.rotation0.degrees(),
                self.rotation1.degrees(),
                self.layout
            )
        } else {
            format!("{}_concatenated_{}.mp4", name, self.layout)
        };
        self.folder.join(file)
    }

    /// Still-image path for preview mode
    pub fn preview_path(&self) -> PathBuf {
        self.folder
            .join(format!("{}_preview_{}.jpg", self.folder_name(), self.layout))
    }
}

/// Result of a completed fusion
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionResult {
    pub output: PathBuf,
    pub strategy: Strategy,
    pub width: u32,
    pub height: u32,
    pub duration_ms: u64,

    /// Set when the inputs diverged beyond tolerance; the job ran anyway
    pub mismatch: Option<String>,
}

/// Pipeline stage a failure occurred in, reported so a retry can adjust
/// parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionStage {
    Probe,
    Compose,
    Encode,
}

impl std::fmt::Display for FusionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FusionStage::Probe => "probe",
            FusionStage::Compose => "compose",
            FusionStage::Encode => "encode",
        })
    }
}

/// Fusion errors
#[derive(Error, Debug)]
pub enum FusionError {
    #[error("input missing: {0}")]
    InputMissing(PathBuf),

    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),

    #[error("{stage} failed: {message}")]
    EncodeFailure { stage: FusionStage, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FusionError> for ErrorResponse {
    fn from(error: FusionError) -> Self {
        let code = match &error {
            FusionError::InputMissing(_) => "INPUT_MISSING",
            FusionError::UnsupportedLayout(_) => "UNSUPPORTED_LAYOUT",
            FusionError::EncodeFailure { .. } => "ENCODE_FAILURE",
            FusionError::Io(_) => "IO_ERROR",
        };
        ErrorResponse::new(code, error.to_string())
    }
}

/// Pick the encode strategy from the declared input properties.
///
/// Copy mode is only safe when both streams are interchangeable at the
/// container level and no pixel-domain transform is requested.
pub fn select_strategy(
    job: &FusionJob,
    cam0: &VideoProbe,
    cam1: &VideoProbe,
    hw_available: bool,
) -> Strategy {
    if !job.force_transcode && can_copy(job, cam0, cam1) {
        return Strategy::Copy;
    }
    if hw_available {
        Strategy::HwAccel
    } else {
        Strategy::Transcode
    }
}

fn can_copy(job: &FusionJob, cam0: &VideoProbe, cam1: &VideoProbe) -> bool {
    !job.rotated()
        && cam0.codec == cam1.codec
        && cam0.width == cam1.width
        && cam0.height == cam1.height
        && (cam0.fps - cam1.fps).abs() < 0.1
        && cam0.time_base == cam1.time_base
}

/// List `record_*` capture folders under a root, noting whether both
/// camera files are present
pub fn list_capture_folders(root: &Path) -> std::io::Result<Vec<CaptureFolder>> {
    let mut folders = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("record_") {
            continue;
        }
        let complete = path.join("cam0.mp4").exists() && path.join("cam1.mp4").exists();
        folders.push(CaptureFolder {
            path,
            name,
            complete,
        });
    }
    folders.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(folders)
}

/// A capture folder found under the output root
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureFolder {
    pub path: PathBuf,
    pub name: String,
    pub complete: bool,
}
