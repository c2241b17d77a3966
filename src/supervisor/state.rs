//! Capture state machine
//!
//! Defines the per-node capture state, the request parameters, and the
//! capture error taxonomy. State is mutated only by the supervisor that
//! owns the node's processes and reported upward through status responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::utils::error::ErrorResponse;

/// Parameters of one capture request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureParams {
    /// Recording duration in seconds
    pub duration_secs: u32,

    /// Target frame rate
    pub fps: u32,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Subject label, used in the capture folder name
    #[serde(default = "default_subject")]
    pub subject: String,
}

fn default_subject() -> String {
    "default".to_string()
}

impl CaptureParams {
    /// Frame budget per camera for the requested duration
    pub fn expected_frames(&self) -> u64 {
        self.duration_secs as u64 * self.fps as u64
    }
}

/// One finalized camera output file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraFile {
    pub path: PathBuf,
    pub frame_count: u64,
    pub duration_ms: u64,
}

/// Result of a completed capture
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResult {
    /// Shared start timestamp both processes were launched under
    pub started_at: DateTime<Utc>,

    /// Directory holding both raw files
    pub output_dir: PathBuf,

    pub cam0: CameraFile,
    pub cam1: CameraFile,
}

/// Handle returned when a capture starts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureHandle {
    pub started_at: DateTime<Utc>,
    pub output_dir: PathBuf,
}

/// Current state of the node's capture job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum CaptureState {
    /// No capture in progress
    Idle,
    /// Parameters validated and devices reserved, not yet recording
    Preparing,
    /// Both camera processes running
    Recording,
    /// Finalizing output files
    Stopping,
    /// Capture finished, both files measured
    Done { result: CaptureResult },
    /// Capture failed; any partial files are retained for diagnosis
    Failed { reason: ErrorResponse },
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::Idle
    }
}

impl CaptureState {
    /// A live job exists while preparing, recording, or stopping
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CaptureState::Preparing | CaptureState::Recording | CaptureState::Stopping
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CaptureState::Done { .. } | CaptureState::Failed { .. })
    }

    pub fn is_done(&self) -> bool {
        matches!(self, CaptureState::Done { .. })
    }
}

/// Capture errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("device not found or busy: {0}")]
    DeviceNotFound(String),

    #[error("capture process exited early: {0}")]
    ProcessExited(String),

    #[error("frame counts diverged beyond tolerance: cam0={cam0} cam1={cam1} expected={expected}")]
    Desync { cam0: u64, cam1: u64, expected: u64 },

    #[error("no capture is active")]
    NotRecording,

    #[error("probe failed: {0}")]
    Probe(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CaptureError> for ErrorResponse {
    fn from(error: CaptureError) -> Self {
        let code = match &error {
            CaptureError::InvalidParameter(_) => "INVALID_PARAMETER",
            CaptureError::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            CaptureError::ProcessExited(_) => "PROCESS_EXITED",
            CaptureError::Desync { .. } => "DESYNC",
            CaptureError::NotRecording => "NOT_RECORDING",
            CaptureError::Probe(_) => "PROBE_ERROR",
            CaptureError::Io(_) => "IO_ERROR",
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}
