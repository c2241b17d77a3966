//! Capture supervisor
//!
//! Owns the node's two camera processes and the state machine around
//! them. `start` launches both ffmpeg children back to back under one
//! shared timestamp; a monitor task polls their liveness, kills the
//! sibling when one dies early, finalizes output on stop or duration
//! expiry, and measures both files before reporting `Done`.
//!
//! All state transitions happen on the supervisor's own monitor task;
//! callers only read.

pub mod state;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::capture::{self, ffmpeg};
use crate::config::NodeConfig;
pub use state::{
    CameraFile, CaptureError, CaptureHandle, CaptureParams, CaptureResult, CaptureState,
};

/// Lines of ffmpeg stderr retained per camera for failure reports
const STDERR_TAIL: usize = 16;

/// Liveness poll period while recording
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Both children reach their frame budget within a frame interval of
/// each other, but not necessarily inside the same poll tick. A single
/// exit this close to the expected end is a finishing capture, not a
/// dead one.
const EARLY_EXIT_SLACK: Duration = Duration::from_secs(1);

/// Supervises one node's dual-camera capture job
pub struct CaptureSupervisor {
    config: NodeConfig,

    /// Current capture state; written only by the monitor task and the
    /// synchronous prepare/start transitions
    state: Arc<RwLock<CaptureState>>,

    /// Control channel to the live monitor task, if any
    control: Mutex<Option<JobControl>>,
}

struct JobControl {
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// One camera process under supervision
struct CameraProc {
    index: u8,
    output: PathBuf,
    child: Option<Child>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

/// Everything the monitor task owns for the lifetime of one job
struct JobContext {
    params: CaptureParams,
    started_at: DateTime<Utc>,
    start: Instant,
    output_dir: PathBuf,
    cams: [CameraProc; 2],
    desync_tolerance: f64,
    grace: Duration,
    state: Arc<RwLock<CaptureState>>,
}

impl CaptureSupervisor {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(CaptureState::Idle)),
            control: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Validate parameters and device availability without recording
    /// anything. Transitions to `Preparing` on success.
    pub fn prepare(&self, params: &CaptureParams) -> Result<(), CaptureError> {
        let mut control = self.control.lock();
        clear_finished(&mut control);
        if control.is_some() {
            return Err(self.busy());
        }

        self.validate(params)?;
        capture::resolve_device(&self.config.cam0_device)?;
        capture::resolve_device(&self.config.cam1_device)?;

        *self.state.write() = CaptureState::Preparing;
        tracing::info!(
            "prepared capture: {}s at {}fps, {}x{}, subject '{}'",
            params.duration_secs,
            params.fps,
            params.width,
            params.height,
            params.subject
        );
        Ok(())
    }

    /// Start recording on both cameras.
    ///
    /// Both children are spawned back to back with no await between
    /// them; the shared timestamp taken just before the first spawn is
    /// the job's start time.
    pub fn start(&self, params: &CaptureParams) -> Result<CaptureHandle, CaptureError> {
        let mut control = self.control.lock();
        clear_finished(&mut control);
        if control.is_some() {
            return Err(self.busy());
        }

        self.validate(params)?;
        capture::resolve_device(&self.config.cam0_device)?;
        capture::resolve_device(&self.config.cam1_device)?;

        let started_at = Utc::now();
        let dir_name = format!(
            "record_{}_{}",
            params.subject,
            started_at.format("%Y%m%d_%H%M%S")
        );
        let output_dir = self.config.output_root.join(dir_name);
        std::fs::create_dir_all(&output_dir)?;

        let cam0_out = output_dir.join("cam0.mp4");
        let cam1_out = output_dir.join("cam1.mp4");

        let start = Instant::now();
        let mut child0 = ffmpeg::capture_command(&self.config.cam0_device, &cam0_out, params)
            .spawn()
            .map_err(|e| {
                CaptureError::ProcessExited(format!("failed to spawn cam0 capture: {}", e))
            })?;
        let child1 = match ffmpeg::capture_command(&self.config.cam1_device, &cam1_out, params)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                // never leave an unbalanced single-camera capture running
                let _ = child0.start_kill();
                return Err(CaptureError::ProcessExited(format!(
                    "failed to spawn cam1 capture: {}",
                    e
                )));
            }
        };

        let cams = [
            CameraProc::new(0, cam0_out, child0),
            CameraProc::new(1, cam1_out, child1),
        ];

        *self.state.write() = CaptureState::Recording;

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let ctx = JobContext {
            params: params.clone(),
            started_at,
            start,
            output_dir: output_dir.clone(),
            cams,
            desync_tolerance: self.config.desync_tolerance,
            grace: Duration::from_secs(self.config.stop_grace_secs),
            state: self.state.clone(),
        };
        let task = tokio::spawn(run_capture(ctx, stop_rx));
        *control = Some(JobControl { stop_tx, task });

        tracing::info!(
            "recording started: {} frames per camera into {:?}",
            params.expected_frames(),
            output_dir
        );
        Ok(CaptureHandle {
            started_at,
            output_dir,
        })
    }

    /// Stop the active capture and wait for it to settle.
    ///
    /// Returns the terminal state: `Done` with both files measured, or
    /// `Failed` with the recorded reason. Stopping a node that is only
    /// `Preparing` releases it back to `Idle`.
    pub async fn stop(&self) -> Result<CaptureState, CaptureError> {
        let control = self.control.lock().take();
        match control {
            Some(JobControl { stop_tx, task }) => {
                let _ = stop_tx.send(()).await;
                let _ = task.await;
                Ok(self.state.read().clone())
            }
            None => {
                let mut state = self.state.write();
                if matches!(*state, CaptureState::Preparing) {
                    *state = CaptureState::Idle;
                    Ok(CaptureState::Idle)
                } else {
                    Err(CaptureError::NotRecording)
                }
            }
        }
    }

    /// Last known capture state
    pub fn status(&self) -> CaptureState {
        self.state.read().clone()
    }

    fn validate(&self, params: &CaptureParams) -> Result<(), CaptureError> {
        if params.duration_secs == 0 {
            return Err(CaptureError::InvalidParameter(
                "duration must be positive".to_string(),
            ));
        }
        let limits = &self.config.limits;
        if !limits.supports_fps(params.fps) {
            return Err(CaptureError::InvalidParameter(format!(
                "fps {} outside supported range {}..={}",
                params.fps, limits.min_fps, limits.max_fps
            )));
        }
        if !limits.supports_resolution(params.width, params.height) {
            return Err(CaptureError::InvalidParameter(format!(
                "resolution {}x{} not supported by this node",
                params.width, params.height
            )));
        }
        if params.subject.is_empty()
            || !params
                .subject
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CaptureError::InvalidParameter(format!(
                "subject '{}' must be non-empty and contain only alphanumerics, '-' or '_'",
                params.subject
            )));
        }
        Ok(())
    }

    fn busy(&self) -> CaptureError {
        CaptureError::DeviceNotFound(format!(
            "{}: busy, capture in progress",
            self.config.cam0_device.display()
        ))
    }
}

fn clear_finished(control: &mut Option<JobControl>) {
    if control.as_ref().is_some_and(|c| c.task.is_finished()) {
        *control = None;
    }
}

impl CameraProc {
    fn new(index: u8, output: PathBuf, mut child: Child) -> Self {
        let stderr_tail = match child.stderr.take() {
            Some(stderr) => spawn_stderr_drain(index, stderr),
            None => Arc::new(Mutex::new(VecDeque::new())),
        };
        Self {
            index,
            output,
            child: Some(child),
            stderr_tail,
        }
    }

    /// Non-blocking liveness check. An errored check counts as exited.
    fn exited(&mut self) -> bool {
        match self.child.as_mut() {
            None => true,
            Some(child) => match child.try_wait() {
                Ok(Some(_)) => true,
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!("liveness check failed for cam{}: {}", self.index, e);
                    true
                }
            },
        }
    }

    /// Reap the exited child and describe why it died
    async fn exit_detail(&mut self) -> String {
        let status = match self.child.take() {
            Some(mut child) => match child.wait().await {
                Ok(status) => status.to_string(),
                Err(e) => e.to_string(),
            },
            None => "unknown status".to_string(),
        };
        let buf = self.stderr_tail.lock();
        let tail: Vec<String> = buf.iter().rev().take(4).rev().cloned().collect();
        drop(buf);
        if tail.is_empty() {
            format!("cam{}: {}", self.index, status)
        } else {
            format!("cam{}: {} ({})", self.index, status, tail.join(" | "))
        }
    }
}

/// Drain a child's stderr so the pipe never backs up, keeping the last
/// few lines for failure reports.
fn spawn_stderr_drain(index: u8, stderr: ChildStderr) -> Arc<Mutex<VecDeque<String>>> {
    let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL)));
    let buf = tail.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            tracing::debug!("ffmpeg cam{}: {}", index, line);
            let mut buf = buf.lock();
            if buf.len() == STDERR_TAIL {
                buf.pop_front();
            }
            buf.push_back(line);
        }
    });
    tail
}

/// Monitor loop for one job: watches liveness until stop, duration
/// expiry, or early exit, then finalizes.
async fn run_capture(mut ctx: JobContext, mut stop_rx: mpsc::Receiver<()>) {
    let expected = Duration::from_secs(ctx.params.duration_secs as u64);
    let hard_deadline = ctx.start + expected + ctx.grace + Duration::from_secs(2);
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let early_failure = loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                tracing::info!("stop requested after {:?}", ctx.start.elapsed());
                break None;
            }
            _ = poll.tick() => {
                let exited0 = ctx.cams[0].exited();
                let exited1 = ctx.cams[1].exited();
                if exited0 && exited1 {
                    break None;
                }
                let elapsed = ctx.start.elapsed();
                if exited0 || exited1 {
                    if elapsed + EARLY_EXIT_SLACK < expected {
                        let dead = if exited0 { 0 } else { 1 };
                        let live = 1 - dead;
                        let detail = ctx.cams[dead].exit_detail().await;
                        // terminate the sibling: a single-camera file is useless
                        if let Some(child) = ctx.cams[live].child.as_mut() {
                            let _ = child.kill().await;
                        }
                        break Some(CaptureError::ProcessExited(detail));
                    }
                    // near the expected end: let the straggler reach its
                    // own frame budget instead of cutting it short
                }
                if Instant::now() >= hard_deadline {
                    tracing::warn!("capture overran its deadline, forcing finalization");
                    break None;
                }
            }
        }
    };

    if let Some(err) = early_failure {
        tracing::error!("capture failed: {}", err);
        *ctx.state.write() = CaptureState::Failed { reason: err.into() };
        return;
    }

    *ctx.state.write() = CaptureState::Stopping;
    let outcome = finalize(&mut ctx).await;
    match outcome {
        Ok(result) => {
            tracing::info!(
                "capture done: cam0 {} frames, cam1 {} frames",
                result.cam0.frame_count,
                result.cam1.frame_count
            );
            *ctx.state.write() = CaptureState::Done { result };
        }
        Err(err) => {
            tracing::error!("capture failed during finalization: {}", err);
            *ctx.state.write() = CaptureState::Failed { reason: err.into() };
        }
    }
}

/// Graceful shutdown and measurement of both output files
async fn finalize(ctx: &mut JobContext) -> Result<CaptureResult, CaptureError> {
    // ask ffmpeg to finalize the container
    for cam in ctx.cams.iter_mut() {
        if let Some(child) = cam.child.as_mut() {
            if let Some(stdin) = child.stdin.as_mut() {
                let _ = stdin.write_all(b"q").await;
                let _ = stdin.flush().await;
            }
        }
    }

    for cam in ctx.cams.iter_mut() {
        if let Some(mut child) = cam.child.take() {
            match tokio::time::timeout(ctx.grace, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(
                        "cam{} did not finalize within {:?}, killing",
                        cam.index,
                        ctx.grace
                    );
                    let _ = child.kill().await;
                }
            }
        }
    }

    let cam0 = measure_output(&ctx.cams[0].output).await?;
    let cam1 = measure_output(&ctx.cams[1].output).await?;

    let expected = ctx.params.expected_frames();
    if !within_tolerance(
        cam0.frame_count,
        cam1.frame_count,
        expected,
        ctx.desync_tolerance,
    ) {
        // files stay on disk for diagnosis
        return Err(CaptureError::Desync {
            cam0: cam0.frame_count,
            cam1: cam1.frame_count,
            expected,
        });
    }

    Ok(CaptureResult {
        started_at: ctx.started_at,
        output_dir: ctx.output_dir.clone(),
        cam0,
        cam1,
    })
}

async fn measure_output(path: &Path) -> Result<CameraFile, CaptureError> {
    let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if len == 0 {
        return Err(CaptureError::ProcessExited(format!(
            "output missing or empty: {}",
            path.display()
        )));
    }
    let probe = ffmpeg::probe(path)
        .await
        .map_err(|e| CaptureError::Probe(e.to_string()))?;
    Ok(CameraFile {
        path: path.to_path_buf(),
        frame_count: probe.frame_count,
        duration_ms: probe.duration_ms(),
    })
}

/// Frame counts agree when their difference is at most the tolerance
/// fraction of the expected count, never less than one frame.
fn within_tolerance(cam0: u64, cam1: u64, expected: u64, tolerance: f64) -> bool {
    let allowed = ((expected as f64) * tolerance).round().max(1.0) as u64;
    cam0.abs_diff(cam1) <= allowed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn test_config(dir: &Path) -> NodeConfig {
        let cam0 = dir.join("video0");
        let cam1 = dir.join("video2");
        std::fs::write(&cam0, b"").unwrap();
        std::fs::write(&cam1, b"").unwrap();
        NodeConfig {
            bind: "127.0.0.1:5000".parse::<SocketAddr>().unwrap(),
            cam0_device: cam0,
            cam1_device: cam1,
            output_root: dir.join("captures"),
            limits: Default::default(),
            desync_tolerance: 0.01,
            stop_grace_secs: 5,
        }
    }

    fn params() -> CaptureParams {
        CaptureParams {
            duration_secs: 10,
            fps: 30,
            width: 640,
            height: 480,
            subject: "default".to_string(),
        }
    }

    #[test]
    fn test_validate_rejects_zero_duration() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = CaptureSupervisor::new(test_config(dir.path()));
        let mut p = params();
        p.duration_secs = 0;
        assert!(matches!(
            supervisor.prepare(&p),
            Err(CaptureError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_validate_rejects_out_of_range_fps() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = CaptureSupervisor::new(test_config(dir.path()));
        let mut p = params();
        p.fps = 500;
        assert!(matches!(
            supervisor.prepare(&p),
            Err(CaptureError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unsupported_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = CaptureSupervisor::new(test_config(dir.path()));
        let mut p = params();
        p.width = 123;
        p.height = 45;
        assert!(matches!(
            supervisor.prepare(&p),
            Err(CaptureError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_validate_rejects_path_hostile_subject() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = CaptureSupervisor::new(test_config(dir.path()));
        let mut p = params();
        p.subject = "../etc".to_string();
        assert!(matches!(
            supervisor.prepare(&p),
            Err(CaptureError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_prepare_fails_on_missing_device() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.cam1_device = dir.path().join("no-such-device");
        let supervisor = CaptureSupervisor::new(config);
        assert!(matches!(
            supervisor.prepare(&params()),
            Err(CaptureError::DeviceNotFound(_))
        ));
        // the failed prepare must not leave the node reserved
        assert!(matches!(supervisor.status(), CaptureState::Idle));
    }

    #[test]
    fn test_prepare_transitions_to_preparing() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = CaptureSupervisor::new(test_config(dir.path()));
        supervisor.prepare(&params()).unwrap();
        assert!(matches!(supervisor.status(), CaptureState::Preparing));
    }

    #[tokio::test]
    async fn test_stop_without_job() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = CaptureSupervisor::new(test_config(dir.path()));
        assert!(matches!(
            supervisor.stop().await,
            Err(CaptureError::NotRecording)
        ));
    }

    #[tokio::test]
    async fn test_stop_releases_prepared_node() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = CaptureSupervisor::new(test_config(dir.path()));
        supervisor.prepare(&params()).unwrap();
        let state = supervisor.stop().await.unwrap();
        assert!(matches!(state, CaptureState::Idle));
        assert!(matches!(supervisor.status(), CaptureState::Idle));
    }

    #[test]
    fn test_within_tolerance() {
        // 1% of 300 frames rounds to 3
        assert!(within_tolerance(300, 300, 300, 0.01));
        assert!(within_tolerance(300, 297, 300, 0.01));
        assert!(!within_tolerance(300, 296, 300, 0.01));
        // the allowance never drops below one frame
        assert!(within_tolerance(10, 11, 10, 0.001));
        assert!(!within_tolerance(10, 12, 10, 0.001));
    }
}
