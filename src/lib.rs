//! duocam - synchronized dual-camera capture across recording nodes.
//!
//! Each node runs a [`supervisor::CaptureSupervisor`] driving two camera
//! processes behind a small HTTP control endpoint ([`server`]). A
//! [`coordinator::SessionCoordinator`] starts and stops recording
//! sessions across any set of nodes with a two-phase prepare/commit so
//! capture begins within a bounded skew window. After capture, the
//! [`fusion::FusionPipeline`] composes each node's two raw files into
//! one composite video.

pub mod capture;
pub mod config;
pub mod coordinator;
pub mod fusion;
pub mod server;
pub mod supervisor;
pub mod utils;

pub use config::NodeConfig;
pub use coordinator::SessionCoordinator;
pub use fusion::FusionPipeline;
pub use supervisor::CaptureSupervisor;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging for a duocam process
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duocam=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
