//! Camera capture primitives
//!
//! Device descriptions, the per-camera ffmpeg capture command, and
//! ffprobe-based media inspection. Cameras are driven as ffmpeg
//! subprocesses reading v4l2 devices; nothing here talks to a camera API
//! in-process.

pub mod device;
pub mod ffmpeg;

pub use device::{resolve_device, CameraInfo, Resolution};
pub use ffmpeg::{capture_command, probe, ProbeError, VideoProbe};
