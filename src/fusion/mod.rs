//! Fusion pipeline
//!
//! Turns one node's raw `cam0.mp4`/`cam1.mp4` pair into a single
//! analysis-ready composite: probe both inputs, pick a strategy (copy
//! remux when the streams are interchangeable, otherwise a software or
//! hardware transcode through the rotate/scale/stack graph), run one
//! ffmpeg job, and report what was produced.
//!
//! Jobs are stateless and idempotent. One input pair is never read by
//! two jobs at once: a second request for the same folder waits for the
//! in-flight job.

pub mod filter;
pub mod types;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use crate::capture::{self, VideoProbe};
use filter::{compose_graph, copy_args, hw_probe_args, preview_args, transcode_args};
pub use types::{
    list_capture_folders, select_strategy, CaptureFolder, FusionError, FusionJob, FusionResult,
    FusionStage, Layout, Rotation, Strategy,
};

/// Hardware encoders probed for, in preference order
const HW_ENCODER_CANDIDATES: &[&str] = &["h264_v4l2m2m", "h264_vaapi"];

/// Relative frame-count or duration divergence that flags a result
const MISMATCH_TOLERANCE: f64 = 0.01;

/// Bound on the throwaway hardware-detection encode
const HW_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Post-capture fusion of one node's two camera streams
pub struct FusionPipeline {
    /// Detected hardware encoder, if any
    hw_encoder: Option<String>,

    /// Per-folder guards: exclusive access to each input pair
    inflight: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl FusionPipeline {
    /// Software-only pipeline
    pub fn new() -> Self {
        Self {
            hw_encoder: None,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Pipeline with a known-good hardware encoder
    pub fn with_encoder(encoder: impl Into<String>) -> Self {
        Self {
            hw_encoder: Some(encoder.into()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Probe the host for a usable hardware encoder and build the
    /// pipeline accordingly
    pub async fn detect() -> Self {
        for candidate in HW_ENCODER_CANDIDATES {
            if hw_encoder_works(candidate).await {
                tracing::info!("hardware encoder available: {}", candidate);
                return Self::with_encoder(*candidate);
            }
        }
        tracing::info!("no hardware encoder available, using software transcode");
        Self::new()
    }

    pub fn hw_encoder(&self) -> Option<&str> {
        self.hw_encoder.as_deref()
    }

    /// Run one fusion job to completion
    pub async fn fuse(&self, job: &FusionJob) -> Result<FusionResult, FusionError> {
        let _guard = self.lock_folder(&job.folder).await;

        let (cam0, cam1) = resolve_inputs(job)?;
        let probe0 = probe_input(&cam0).await?;
        let probe1 = probe_input(&cam1).await?;

        let mismatch = check_mismatch(&probe0, &probe1);
        if let Some(reason) = &mismatch {
            tracing::warn!("inputs diverge, result will be flagged: {}", reason);
        }

        let strategy = select_strategy(job, &probe0, &probe1, self.hw_encoder.is_some());
        let output = job.output_path();
        tracing::info!(
            "fusing {:?} -> {:?} ({:?})",
            job.folder,
            output.file_name().unwrap_or_default(),
            strategy
        );

        match strategy {
            Strategy::Copy => {
                run_ffmpeg(copy_args(&cam0, &cam1, &output), FusionStage::Encode).await?;
                Ok(FusionResult {
                    output,
                    strategy,
                    width: probe0.width.max(probe1.width),
                    height: probe0.height.max(probe1.height),
                    duration_ms: probe0.duration_ms().min(probe1.duration_ms()),
                    mismatch,
                })
            }
            Strategy::Transcode | Strategy::HwAccel => {
                let graph = compose_graph(job.layout, job.rotation0, job.rotation1, &probe0, &probe1);
                let encoder = match strategy {
                    Strategy::HwAccel => self.hw_encoder.as_deref(),
                    _ => None,
                };

                let args = transcode_args(&cam0, &cam1, &graph, encoder, &output);
                let mut used = strategy;
                if let Err(err) = run_ffmpeg(args, FusionStage::Encode).await {
                    if encoder.is_none() {
                        return Err(err);
                    }
                    // a broken hardware path degrades the job, it does
                    // not fail it
                    tracing::warn!("hardware encode failed, retrying in software: {}", err);
                    let args = transcode_args(&cam0, &cam1, &graph, None, &output);
                    run_ffmpeg(args, FusionStage::Encode).await?;
                    used = Strategy::Transcode;
                }

                Ok(FusionResult {
                    output,
                    strategy: used,
                    width: graph.width,
                    height: graph.height,
                    duration_ms: probe0.duration_ms().max(probe1.duration_ms()),
                    mismatch,
                })
            }
        }
    }

    /// Extract one composed still instead of running the full encode;
    /// the cheap way to check orientation before a long fusion
    pub async fn preview(&self, job: &FusionJob) -> Result<PathBuf, FusionError> {
        let _guard = self.lock_folder(&job.folder).await;

        let (cam0, cam1) = resolve_inputs(job)?;
        let probe0 = probe_input(&cam0).await?;
        let probe1 = probe_input(&cam1).await?;

        let graph = compose_graph(job.layout, job.rotation0, job.rotation1, &probe0, &probe1);
        let output = job.preview_path();
        tracing::info!("writing preview {:?}", output.file_name().unwrap_or_default());

        run_ffmpeg(preview_args(&cam0, &cam1, &graph, &output), FusionStage::Compose).await?;
        Ok(output)
    }

    async fn lock_folder(&self, folder: &Path) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut inflight = self.inflight.lock();
            inflight
                .entry(folder.to_path_buf())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

impl Default for FusionPipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_inputs(job: &FusionJob) -> Result<(PathBuf, PathBuf), FusionError> {
    let cam0 = job.cam0_input();
    if !cam0.exists() {
        return Err(FusionError::InputMissing(cam0));
    }
    let cam1 = job.cam1_input();
    if !cam1.exists() {
        return Err(FusionError::InputMissing(cam1));
    }
    Ok((cam0, cam1))
}

async fn probe_input(path: &Path) -> Result<VideoProbe, FusionError> {
    capture::probe(path)
        .await
        .map_err(|e| FusionError::EncodeFailure {
            stage: FusionStage::Probe,
            message: format!("{}: {}", path.display(), e),
        })
}

/// Flag inputs whose frame counts or durations diverge beyond tolerance
fn check_mismatch(probe0: &VideoProbe, probe1: &VideoProbe) -> Option<String> {
    let frames = probe0.frame_count.max(probe1.frame_count);
    if frames > 0 {
        let allowed = ((frames as f64) * MISMATCH_TOLERANCE).round().max(1.0) as u64;
        let diff = probe0.frame_count.abs_diff(probe1.frame_count);
        if diff > allowed {
            return Some(format!(
                "frame counts diverge: cam0={} cam1={}",
                probe0.frame_count, probe1.frame_count
            ));
        }
    }
    let duration = probe0.duration_secs.max(probe1.duration_secs);
    if duration > 0.0 {
        let diff = (probe0.duration_secs - probe1.duration_secs).abs();
        if diff / duration > MISMATCH_TOLERANCE {
            return Some(format!(
                "durations diverge: cam0={:.2}s cam1={:.2}s",
                probe0.duration_secs, probe1.duration_secs
            ));
        }
    }
    None
}

async fn run_ffmpeg(args: Vec<String>, stage: FusionStage) -> Result<(), FusionError> {
    tracing::debug!("running ffmpeg {:?}", args);
    let output = Command::new("ffmpeg")
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| FusionError::EncodeFailure {
            stage,
            message: format!("failed to run ffmpeg: {}", e),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(4).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        return Err(FusionError::EncodeFailure {
            stage,
            message: format!("ffmpeg exited with {}: {}", output.status, tail.join(" | ")),
        });
    }
    Ok(())
}

async fn hw_encoder_works(encoder: &str) -> bool {
    let probe = Command::new("ffmpeg")
        .args(hw_probe_args(encoder))
        .stdin(Stdio::null())
        .output();
    matches!(
        tokio::time::timeout(HW_PROBE_TIMEOUT, probe).await,
        Ok(Ok(output)) if output.status.success()
    )
}
