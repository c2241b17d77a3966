//! Node control endpoint
//!
//! The HTTP service each recording node runs so a coordinator can reach
//! its capture supervisor:
//! - `POST /prepare` - validate parameters and reserve the cameras
//! - `POST /start`   - begin recording on both cameras
//! - `POST /stop`    - finalize the active capture, returns the terminal state
//! - `GET /status`   - last known capture state
//! - `GET /cameras`  - the node's camera assignment
//!
//! Plain JSON over plain HTTP; authentication is assumed to be handled
//! outside this service or absent.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::capture::CameraInfo;
use crate::supervisor::{CaptureError, CaptureHandle, CaptureParams, CaptureState, CaptureSupervisor};
use crate::utils::error::ErrorResponse;

/// Acknowledgement body for commands without richer payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAck {
    pub status: String,
}

/// Error type handlers bubble up to the wire
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl From<CaptureError> for ApiError {
    fn from(err: CaptureError) -> Self {
        let status = match &err {
            CaptureError::InvalidParameter(_) | CaptureError::NotRecording => {
                StatusCode::BAD_REQUEST
            }
            CaptureError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: err.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Build the control router over a supervisor
pub fn router(supervisor: Arc<CaptureSupervisor>) -> Router {
    Router::new()
        .route("/prepare", post(prepare))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/status", get(status))
        .route("/cameras", get(cameras))
        .with_state(supervisor)
}

/// Serve the control endpoint until the process exits
pub async fn serve(supervisor: Arc<CaptureSupervisor>, bind: SocketAddr) -> Result<()> {
    let app = router(supervisor);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind to {}", bind))?;

    tracing::info!("node control endpoint listening on http://{}", bind);

    axum::serve(listener, app)
        .await
        .context("control endpoint error")?;
    Ok(())
}

async fn prepare(
    State(supervisor): State<Arc<CaptureSupervisor>>,
    Json(params): Json<CaptureParams>,
) -> Result<Json<CommandAck>, ApiError> {
    supervisor.prepare(&params)?;
    Ok(Json(CommandAck {
        status: "prepared".to_string(),
    }))
}

async fn start(
    State(supervisor): State<Arc<CaptureSupervisor>>,
    Json(params): Json<CaptureParams>,
) -> Result<Json<CaptureHandle>, ApiError> {
    let handle = supervisor.start(&params)?;
    Ok(Json(handle))
}

async fn stop(
    State(supervisor): State<Arc<CaptureSupervisor>>,
) -> Result<Json<CaptureState>, ApiError> {
    let state = supervisor.stop().await?;
    Ok(Json(state))
}

async fn status(State(supervisor): State<Arc<CaptureSupervisor>>) -> Json<CaptureState> {
    Json(supervisor.status())
}

async fn cameras(State(supervisor): State<Arc<CaptureSupervisor>>) -> Json<Vec<CameraInfo>> {
    Json(supervisor.config().cameras())
}
