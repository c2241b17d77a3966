//! duocam node agent
//!
//! Runs one recording node: loads the resolved node configuration and
//! serves the control endpoint over the capture supervisor.
//!
//! ## Usage
//!
//! ```bash
//! # config path from argv
//! duocam-node /etc/duocam/node.json
//!
//! # or from the environment
//! export DUOCAM_NODE_CONFIG=/etc/duocam/node.json
//! duocam-node
//! ```

use anyhow::{Context, Result};
use std::sync::Arc;

use duocam::{server, CaptureSupervisor, NodeConfig};

#[tokio::main]
async fn main() -> Result<()> {
    duocam::init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DUOCAM_NODE_CONFIG").ok())
        .context("config path required: pass it as the first argument or set DUOCAM_NODE_CONFIG")?;

    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("failed to read node config {}", config_path))?;
    let config: NodeConfig = serde_json::from_str(&raw)
        .with_context(|| format!("invalid node config {}", config_path))?;

    std::fs::create_dir_all(&config.output_root)
        .with_context(|| format!("failed to create output root {:?}", config.output_root))?;

    tracing::info!(
        "starting duocam-node v{}: cam0={:?} cam1={:?}",
        env!("CARGO_PKG_VERSION"),
        config.cam0_device,
        config.cam1_device
    );

    let bind = config.bind;
    let supervisor = Arc::new(CaptureSupervisor::new(config));
    server::serve(supervisor, bind).await
}
