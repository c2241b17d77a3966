//! Node transport
//!
//! The async seam between the coordinator and each node's control
//! endpoint. The HTTP implementation talks to the axum service a node
//! agent runs; tests swap in a scripted in-process implementation.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use super::session::Node;
use crate::supervisor::state::{CaptureParams, CaptureState};
use crate::utils::error::ErrorResponse;

/// Transport-level failures, one per command
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The node could not be reached inside the command timeout. Never
    /// retried automatically: a duplicate start could desynchronize a
    /// capture that did begin.
    #[error("node unreachable: {0}")]
    Unreachable(String),

    /// The node answered and refused the command
    #[error("node rejected command [{code}]: {message}")]
    Rejected { code: String, message: String },
}

impl TransportError {
    pub fn to_response(&self) -> ErrorResponse {
        match self {
            TransportError::Unreachable(message) => {
                ErrorResponse::new("UNREACHABLE", message.clone())
            }
            TransportError::Rejected { code, message } => {
                ErrorResponse::new(code.clone(), message.clone())
            }
        }
    }
}

/// Commands a node's control endpoint accepts
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn prepare(&self, node: &Node, params: &CaptureParams) -> Result<(), TransportError>;

    async fn start(&self, node: &Node, params: &CaptureParams) -> Result<(), TransportError>;

    /// Returns the node's terminal state after the stop settles
    async fn stop(&self, node: &Node) -> Result<CaptureState, TransportError>;

    async fn status(&self, node: &Node) -> Result<CaptureState, TransportError>;
}

/// HTTP transport against the node agents' control endpoints
pub struct HttpNodeTransport {
    client: reqwest::Client,
    command_timeout: Duration,
}

impl HttpNodeTransport {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            command_timeout,
        }
    }

    fn url(node: &Node, path: &str) -> String {
        format!("{}/{}", node.addr.trim_end_matches('/'), path)
    }

    fn unreachable(err: reqwest::Error) -> TransportError {
        TransportError::Unreachable(err.to_string())
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        match response.json::<ErrorResponse>().await {
            Ok(body) => Err(TransportError::Rejected {
                code: body.code,
                message: body.message,
            }),
            Err(_) => Err(TransportError::Rejected {
                code: format!("HTTP_{}", status.as_u16()),
                message: status.to_string(),
            }),
        }
    }
}

#[async_trait]
impl NodeTransport for HttpNodeTransport {
    async fn prepare(&self, node: &Node, params: &CaptureParams) -> Result<(), TransportError> {
        let response = self
            .client
            .post(Self::url(node, "prepare"))
            .timeout(self.command_timeout)
            .json(params)
            .send()
            .await
            .map_err(Self::unreachable)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn start(&self, node: &Node, params: &CaptureParams) -> Result<(), TransportError> {
        let response = self
            .client
            .post(Self::url(node, "start"))
            .timeout(self.command_timeout)
            .json(params)
            .send()
            .await
            .map_err(Self::unreachable)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn stop(&self, node: &Node) -> Result<CaptureState, TransportError> {
        let response = self
            .client
            .post(Self::url(node, "stop"))
            .timeout(self.command_timeout)
            .send()
            .await
            .map_err(Self::unreachable)?;
        let response = Self::check(response).await?;
        response.json::<CaptureState>().await.map_err(|e| {
            TransportError::Rejected {
                code: "INVALID_RESPONSE".to_string(),
                message: e.to_string(),
            }
        })
    }

    async fn status(&self, node: &Node) -> Result<CaptureState, TransportError> {
        let response = self
            .client
            .get(Self::url(node, "status"))
            .timeout(self.command_timeout)
            .send()
            .await
            .map_err(Self::unreachable)?;
        let response = Self::check(response).await?;
        response.json::<CaptureState>().await.map_err(|e| {
            TransportError::Rejected {
                code: "INVALID_RESPONSE".to_string(),
                message: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let node = Node {
            name: "pi1".to_string(),
            addr: "http://192.168.1.101:5000/".to_string(),
            cameras: vec![],
        };
        assert_eq!(
            HttpNodeTransport::url(&node, "prepare"),
            "http://192.168.1.101:5000/prepare"
        );
    }

    #[test]
    fn test_error_responses() {
        let err = TransportError::Unreachable("connection refused".to_string());
        assert_eq!(err.to_response().code, "UNREACHABLE");

        let err = TransportError::Rejected {
            code: "INVALID_PARAMETER".to_string(),
            message: "fps".to_string(),
        };
        assert_eq!(err.to_response().code, "INVALID_PARAMETER");
    }
}
