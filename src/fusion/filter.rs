//! Filter graph and argument construction
//!
//! Builds the ffmpeg invocations for each strategy. Rotation is applied
//! per camera in the pixel domain, then both panes are scaled to a
//! common edge and stacked. All functions here are pure string work, so
//! the graphs are testable without running an encoder.

use std::path::Path;

use super::types::{Layout, Rotation};
use crate::capture::VideoProbe;

/// A composed filter graph and the geometry it produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedGraph {
    pub filter: String,
    pub width: u32,
    pub height: u32,
}

/// Dimensions after applying a rotation
pub fn rotated_dims(width: u32, height: u32, rotation: Rotation) -> (u32, u32) {
    if rotation.swaps_dimensions() {
        (height, width)
    } else {
        (width, height)
    }
}

/// Rotation step for one input, always producing the given label
fn rotation_chain(input: usize, rotation: Rotation, label: &str) -> String {
    match rotation.transpose() {
        Some(steps) => format!("[{}:v]{}[{}];", input, steps, label),
        None => format!("[{}:v]copy[{}];", input, label),
    }
}

/// Build the rotate/scale/stack graph for a transcode or preview.
///
/// Vertical: both panes scaled to the wider pane's width, cam0 stacked
/// on top. Horizontal: both panes scaled to the taller pane's height,
/// cam0 on the left.
pub fn compose_graph(
    layout: Layout,
    rotation0: Rotation,
    rotation1: Rotation,
    cam0: &VideoProbe,
    cam1: &VideoProbe,
) -> ComposedGraph {
    let (w0, h0) = rotated_dims(cam0.width, cam0.height, rotation0);
    let (w1, h1) = rotated_dims(cam1.width, cam1.height, rotation1);

    let rotate = format!(
        "{}{}",
        rotation_chain(0, rotation0, "v0r"),
        rotation_chain(1, rotation1, "v1r")
    );

    match layout {
        Layout::Vertical => {
            let width = w0.max(w1);
            let height = h0 + h1;
            let filter = format!(
                "{}[v0r]scale={}:{}[v0s];[v1r]scale={}:{}[v1s];[v0s][v1s]vstack=inputs=2[v]",
                rotate, width, h0, width, h1
            );
            ComposedGraph {
                filter,
                width,
                height,
            }
        }
        Layout::Horizontal => {
            let width = w0 + w1;
            let height = h0.max(h1);
            let filter = format!(
                "{}[v0r]scale={}:{}[v0s];[v1r]scale={}:{}[v1s];[v0s][v1s]hstack=inputs=2[v]",
                rotate, w0, height, w1, height
            );
            ComposedGraph {
                filter,
                width,
                height,
            }
        }
    }
}

/// Copy-mode remux: both streams land untouched in one container,
/// trimmed to the shorter one
pub fn copy_args(cam0: &Path, cam1: &Path, output: &Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        cam0.to_string_lossy().to_string(),
        "-i".to_string(),
        cam1.to_string_lossy().to_string(),
        "-map".to_string(),
        "0:v".to_string(),
        "-map".to_string(),
        "1:v".to_string(),
        "-map".to_string(),
        "0:a?".to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-shortest".to_string(),
        "-avoid_negative_ts".to_string(),
        "make_zero".to_string(),
        "-y".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

/// Full decode/compose/encode. `encoder` selects the hardware encoder;
/// None means software x264.
pub fn transcode_args(
    cam0: &Path,
    cam1: &Path,
    graph: &ComposedGraph,
    encoder: Option<&str>,
    output: &Path,
) -> Vec<String> {
    let mut args = vec![
        "-i".to_string(),
        cam0.to_string_lossy().to_string(),
        "-i".to_string(),
        cam1.to_string_lossy().to_string(),
        "-filter_complex".to_string(),
        graph.filter.clone(),
        "-map".to_string(),
        "[v]".to_string(),
        "-map".to_string(),
        "0:a?".to_string(),
    ];
    match encoder {
        Some(hw) => {
            args.extend([
                "-c:v".to_string(),
                hw.to_string(),
                "-b:v".to_string(),
                "5M".to_string(),
            ]);
        }
        None => {
            args.extend([
                "-c:v".to_string(),
                "libx264".to_string(),
                "-preset".to_string(),
                "ultrafast".to_string(),
                "-crf".to_string(),
                "23".to_string(),
            ]);
        }
    }
    args.extend([
        "-threads".to_string(),
        "0".to_string(),
        "-y".to_string(),
        output.to_string_lossy().to_string(),
    ]);
    args
}

/// Single representative frame through the same graph, grabbed half a
/// second in
pub fn preview_args(
    cam0: &Path,
    cam1: &Path,
    graph: &ComposedGraph,
    output: &Path,
) -> Vec<String> {
    vec![
        "-i".to_string(),
        cam0.to_string_lossy().to_string(),
        "-i".to_string(),
        cam1.to_string_lossy().to_string(),
        "-filter_complex".to_string(),
        graph.filter.clone(),
        "-map".to_string(),
        "[v]".to_string(),
        "-ss".to_string(),
        "0.5".to_string(),
        "-vframes".to_string(),
        "1".to_string(),
        "-y".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

/// Throwaway encode used to detect whether a hardware encoder works on
/// this host
pub fn hw_probe_args(encoder: &str) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-f".to_string(),
        "lavfi".to_string(),
        "-i".to_string(),
        "testsrc=duration=1:size=640x480:rate=1".to_string(),
        "-c:v".to_string(),
        encoder.to_string(),
        "-f".to_string(),
        "null".to_string(),
        "-".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn probe(width: u32, height: u32) -> VideoProbe {
        VideoProbe {
            codec: "mjpeg".to_string(),
            width,
            height,
            fps: 30.0,
            time_base: "1/15360".to_string(),
            duration_secs: 10.0,
            frame_count: 300,
        }
    }

    #[test]
    fn test_rotated_dims() {
        assert_eq!(rotated_dims(640, 480, Rotation::None), (640, 480));
        assert_eq!(rotated_dims(640, 480, Rotation::Cw90), (480, 640));
        assert_eq!(rotated_dims(640, 480, Rotation::Cw180), (640, 480));
        assert_eq!(rotated_dims(640, 480, Rotation::Cw270), (480, 640));
    }

    #[test]
    fn test_vertical_graph_geometry() {
        // two equal panes stack to double height
        let g = compose_graph(
            Layout::Vertical,
            Rotation::Cw180,
            Rotation::None,
            &probe(640, 480),
            &probe(640, 480),
        );
        assert_eq!((g.width, g.height), (640, 960));
        assert!(g.filter.contains("[0:v]transpose=1,transpose=1[v0r]"));
        assert!(g.filter.contains("[1:v]copy[v1r]"));
        assert!(g.filter.contains("vstack=inputs=2[v]"));
    }

    #[test]
    fn test_vertical_graph_with_quarter_turn() {
        // a 90 degree pane contributes swapped dimensions
        let g = compose_graph(
            Layout::Vertical,
            Rotation::Cw90,
            Rotation::None,
            &probe(640, 480),
            &probe(640, 480),
        );
        assert_eq!((g.width, g.height), (640, 1120));
        assert!(g.filter.contains("[v0r]scale=640:640[v0s]"));
        assert!(g.filter.contains("[v1r]scale=640:480[v1s]"));
    }

    #[test]
    fn test_horizontal_graph_geometry() {
        let g = compose_graph(
            Layout::Horizontal,
            Rotation::None,
            Rotation::None,
            &probe(640, 480),
            &probe(320, 240),
        );
        assert_eq!((g.width, g.height), (960, 480));
        assert!(g.filter.contains("hstack=inputs=2[v]"));
        assert!(g.filter.contains("[v0r]scale=640:480[v0s]"));
        assert!(g.filter.contains("[v1r]scale=320:480[v1s]"));
    }

    #[test]
    fn test_copy_args_are_pure_remux() {
        let args = copy_args(
            &PathBuf::from("/c/cam0.mp4"),
            &PathBuf::from("/c/cam1.mp4"),
            &PathBuf::from("/c/out.mp4"),
        );
        assert!(args.windows(2).any(|w| w == ["-c", "copy"]));
        assert!(args.contains(&"-shortest".to_string()));
        assert!(args.windows(2).any(|w| w == ["-avoid_negative_ts", "make_zero"]));
        assert!(!args.contains(&"-filter_complex".to_string()));
    }

    #[test]
    fn test_transcode_args_software() {
        let g = compose_graph(
            Layout::Vertical,
            Rotation::None,
            Rotation::None,
            &probe(640, 480),
            &probe(640, 480),
        );
        let args = transcode_args(
            &PathBuf::from("/c/cam0.mp4"),
            &PathBuf::from("/c/cam1.mp4"),
            &g,
            None,
            &PathBuf::from("/c/out.mp4"),
        );
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(args.windows(2).any(|w| w == ["-preset", "ultrafast"]));
        assert!(args.contains(&"-filter_complex".to_string()));
    }

    #[test]
    fn test_transcode_args_hardware() {
        let g = compose_graph(
            Layout::Vertical,
            Rotation::None,
            Rotation::None,
            &probe(640, 480),
            &probe(640, 480),
        );
        let args = transcode_args(
            &PathBuf::from("/c/cam0.mp4"),
            &PathBuf::from("/c/cam1.mp4"),
            &g,
            Some("h264_v4l2m2m"),
            &PathBuf::from("/c/out.mp4"),
        );
        assert!(args.windows(2).any(|w| w == ["-c:v", "h264_v4l2m2m"]));
        assert!(args.windows(2).any(|w| w == ["-b:v", "5M"]));
    }

    #[test]
    fn test_preview_args_grab_one_frame() {
        let g = compose_graph(
            Layout::Vertical,
            Rotation::None,
            Rotation::None,
            &probe(640, 480),
            &probe(640, 480),
        );
        let args = preview_args(
            &PathBuf::from("/c/cam0.mp4"),
            &PathBuf::from("/c/cam1.mp4"),
            &g,
            &PathBuf::from("/c/preview.jpg"),
        );
        assert!(args.windows(2).any(|w| w == ["-ss", "0.5"]));
        assert!(args.windows(2).any(|w| w == ["-vframes", "1"]));
        assert_eq!(args.last().map(String::as_str), Some("/c/preview.jpg"));
    }
}
