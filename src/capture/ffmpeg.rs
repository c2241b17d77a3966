//! FFmpeg capture command and ffprobe inspection
//!
//! The capture side records one camera per ffmpeg process: raw mjpeg
//! packets are stream-copied into the output container, bounded by a
//! frame budget so each process stops itself when the requested duration
//! has been captured. Probing reads back what actually landed on disk.

use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

use crate::supervisor::state::CaptureParams;

/// Errors from ffprobe inspection
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to run ffprobe: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("ffprobe failed: {0}")]
    Failed(String),

    #[error("unexpected ffprobe output: {0}")]
    Parse(String),
}

/// Metadata of one video file, as measured by ffprobe
#[derive(Debug, Clone, PartialEq)]
pub struct VideoProbe {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub time_base: String,
    pub duration_secs: f64,
    pub frame_count: u64,
}

impl VideoProbe {
    pub fn duration_ms(&self) -> u64 {
        (self.duration_secs * 1000.0).round() as u64
    }
}

/// Build the ffmpeg command that records one camera.
///
/// `-frames:v` bounds the capture to the frame budget, so the process
/// finalizes its output and exits on its own once the requested duration
/// has elapsed. Stdin stays open for the `q` finalize key.
pub fn capture_command(device: &Path, output: &Path, params: &CaptureParams) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.args([
        "-f",
        "v4l2",
        "-input_format",
        "mjpeg",
        "-video_size",
        &format!("{}x{}", params.width, params.height),
        "-framerate",
        &params.fps.to_string(),
        "-i",
        &device.to_string_lossy(),
        "-vcodec",
        "copy",
        "-frames:v",
        &params.expected_frames().to_string(),
        "-y",
        &output.to_string_lossy(),
    ])
    .stdin(Stdio::piped())
    .stdout(Stdio::null())
    .stderr(Stdio::piped())
    .kill_on_drop(true);
    cmd
}

/// Probe a video file for codec, geometry, frame rate, timebase,
/// duration, and packet count.
pub async fn probe(video_path: &Path) -> Result<VideoProbe, ProbeError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-count_packets",
            "-show_entries",
            "stream=codec_name,width,height,r_frame_rate,time_base,duration,nb_read_packets",
            "-of",
            "csv=p=0",
            &video_path.to_string_lossy(),
        ])
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::Failed(stderr.trim().to_string()));
    }

    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse one csv line of ffprobe output. Field order follows ffprobe's
/// stream section, not the request order.
fn parse_probe_output(stdout: &str) -> Result<VideoProbe, ProbeError> {
    let line = stdout
        .lines()
        .next()
        .ok_or_else(|| ProbeError::Parse("empty output".to_string()))?;
    let parts: Vec<&str> = line.trim().split(',').collect();

    if parts.len() < 7 {
        return Err(ProbeError::Parse(line.to_string()));
    }

    let codec = parts[0].to_string();
    let width: u32 = parts[1]
        .parse()
        .map_err(|_| ProbeError::Parse(format!("invalid width: {}", parts[1])))?;
    let height: u32 = parts[2]
        .parse()
        .map_err(|_| ProbeError::Parse(format!("invalid height: {}", parts[2])))?;
    let fps = parse_rate(parts[3]);
    let time_base = parts[4].to_string();
    let duration_secs: f64 = parts[5].parse().unwrap_or(0.0);
    let frame_count: u64 = parts[6].parse().unwrap_or(0);

    Ok(VideoProbe {
        codec,
        width,
        height,
        fps,
        time_base,
        duration_secs,
        frame_count,
    })
}

/// Parse a frame rate of the form "30/1" or "30000/1001"
fn parse_rate(raw: &str) -> f64 {
    let parts: Vec<&str> = raw.split('/').collect();
    if parts.len() == 2 {
        let num: f64 = parts[0].parse().unwrap_or(30.0);
        let den: f64 = parts[1].parse().unwrap_or(1.0);
        if den != 0.0 {
            num / den
        } else {
            30.0
        }
    } else {
        raw.parse().unwrap_or(30.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> CaptureParams {
        CaptureParams {
            duration_secs: 10,
            fps: 30,
            width: 640,
            height: 480,
            subject: "test".to_string(),
        }
    }

    #[test]
    fn test_capture_command_args() {
        let cmd = capture_command(
            Path::new("/dev/video0"),
            Path::new("/tmp/cam0.mp4"),
            &params(),
        );
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();

        assert!(args.windows(2).any(|w| w == ["-f", "v4l2"]));
        assert!(args.windows(2).any(|w| w == ["-video_size", "640x480"]));
        assert!(args.windows(2).any(|w| w == ["-framerate", "30"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/dev/video0"]));
        assert!(args.windows(2).any(|w| w == ["-vcodec", "copy"]));
        // frame budget bounds the recording: 10s at 30fps
        assert!(args.windows(2).any(|w| w == ["-frames:v", "300"]));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/cam0.mp4"));
    }

    #[test]
    fn test_parse_probe_output() {
        let p = parse_probe_output("mjpeg,640,480,30/1,1/15360,10.000000,300\n").unwrap();
        assert_eq!(
            p,
            VideoProbe {
                codec: "mjpeg".to_string(),
                width: 640,
                height: 480,
                fps: 30.0,
                time_base: "1/15360".to_string(),
                duration_secs: 10.0,
                frame_count: 300,
            }
        );
        assert_eq!(p.duration_ms(), 10_000);
    }

    #[test]
    fn test_parse_probe_fractional_rate() {
        let p = parse_probe_output("h264,1920,1080,30000/1001,1/90000,5.5,165").unwrap();
        assert!((p.fps - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_parse_probe_missing_duration() {
        // streams without a duration field report N/A
        let p = parse_probe_output("mjpeg,640,480,100/1,1/1000000,N/A,6000").unwrap();
        assert_eq!(p.duration_secs, 0.0);
        assert_eq!(p.frame_count, 6000);
    }

    #[test]
    fn test_parse_probe_garbage() {
        assert!(parse_probe_output("").is_err());
        assert!(parse_probe_output("not,enough,fields").is_err());
    }
}
