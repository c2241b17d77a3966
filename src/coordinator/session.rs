//! Session model
//!
//! One `RecordingSession` tracks a synchronized capture attempt across a
//! set of nodes. The per-node state map is the only stored state; the
//! session's overall outcome is always computed from it, never cached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::supervisor::state::{CaptureParams, CaptureState};

pub type SessionId = Uuid;

/// One recording host with two attached cameras
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub name: String,

    /// Base URL of the node's control endpoint, e.g. `http://pi1:5000`
    pub addr: String,

    /// Camera device paths the node reports
    #[serde(default)]
    pub cameras: Vec<String>,
}

/// Read-only set of known nodes, injected at coordinator construction.
/// How nodes get discovered and registered is someone else's problem.
#[derive(Debug, Clone, Default)]
pub struct NodeDirectory {
    nodes: Vec<Node>,
}

impl NodeDirectory {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

/// Session policy knobs
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Tolerate individual node failures and record partial success
    /// instead of aborting the whole session
    pub best_effort: bool,

    /// Bound on each node's prepare round trip
    pub prepare_timeout: Duration,

    /// Bound on command issuance (start/stop), not on the recording itself
    pub command_timeout: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            best_effort: false,
            prepare_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
        }
    }
}

/// Computed overall status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionOutcome {
    /// Prepare phase still in flight
    Pending,
    /// At least one node is recording
    Committed,
    /// Every participating node finished with measured files
    Completed,
    /// Some nodes finished, some failed or were excluded
    PartiallyFailed,
    /// Nothing was recorded
    Aborted,
}

/// Per-node slot inside a session
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub node: Node,

    /// Last known capture state reported by the node
    pub state: CaptureState,

    /// False once the node has been excluded from the session's success
    /// criteria (failed prepare/start, or strict-mode rollback)
    pub participating: bool,
}

/// One synchronized capture attempt across a set of nodes
#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub id: SessionId,
    pub params: CaptureParams,
    pub created_at: DateTime<Utc>,
    pub nodes: HashMap<String, NodeEntry>,
    pub committed: bool,
    pub aborted: bool,
}

impl RecordingSession {
    pub fn new(id: SessionId, params: CaptureParams, nodes: Vec<Node>) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|node| {
                (
                    node.name.clone(),
                    NodeEntry {
                        node,
                        state: CaptureState::Idle,
                        participating: true,
                    },
                )
            })
            .collect();
        Self {
            id,
            params,
            created_at: Utc::now(),
            nodes,
            committed: false,
            aborted: false,
        }
    }

    /// Compute the session outcome from the per-node states.
    pub fn outcome(&self) -> SessionOutcome {
        if !self.committed {
            return if self.aborted {
                SessionOutcome::Aborted
            } else {
                SessionOutcome::Pending
            };
        }
        if self
            .nodes
            .values()
            .any(|e| e.participating && e.state.is_active())
        {
            return SessionOutcome::Committed;
        }
        let done = self
            .nodes
            .values()
            .filter(|e| e.participating && e.state.is_done())
            .count();
        let failed = self
            .nodes
            .values()
            .filter(|e| !e.participating || matches!(e.state, CaptureState::Failed { .. }))
            .count();
        if done == 0 {
            SessionOutcome::Aborted
        } else if failed > 0 {
            SessionOutcome::PartiallyFailed
        } else {
            SessionOutcome::Completed
        }
    }

    /// Wire snapshot of the session
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            id: self.id,
            created_at: self.created_at,
            params: self.params.clone(),
            outcome: self.outcome(),
            nodes: self
                .nodes
                .iter()
                .map(|(name, entry)| {
                    (
                        name.clone(),
                        NodeStatus {
                            addr: entry.node.addr.clone(),
                            state: entry.state.clone(),
                            participating: entry.participating,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Aggregated session status, as reported to the operator surface
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub params: CaptureParams,
    pub outcome: SessionOutcome,
    pub nodes: HashMap<String, NodeStatus>,
}

/// Per-node view inside a `SessionStatus`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub addr: String,
    pub state: CaptureState,
    pub participating: bool,
}

/// Coordinator-level errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("session requested with no nodes")]
    NoNodes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::ErrorResponse;

    fn node(name: &str) -> Node {
        Node {
            name: name.to_string(),
            addr: format!("http://{}:5000", name),
            cameras: vec!["/dev/video0".to_string(), "/dev/video2".to_string()],
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

    fn done_state() -> CaptureState {
        use crate::supervisor::state::{CameraFile, CaptureResult};
        CaptureState::Done {
            result: CaptureResult {
                started_at: Utc::now(),
                output_dir: "/captures/record_default_x".into(),
                cam0: CameraFile {
                    path: "/captures/record_default_x/cam0.mp4".into(),
                    frame_count: 300,
                    duration_ms: 10_000,
                },
                cam1: CameraFile {
                    path: "/captures/record_default_x/cam1.mp4".into(),
                    frame_count: 299,
                    duration_ms: 9_980,
                },
            },
        }
    }

    fn failed_state() -> CaptureState {
        CaptureState::Failed {
            reason: ErrorResponse::new("UNREACHABLE", "start timed out"),
        }
    }

    fn session(entries: &[(&str, CaptureState, bool)], committed: bool, aborted: bool) -> RecordingSession {
        let mut s = RecordingSession::new(
            Uuid::new_v4(),
            params(),
            entries.iter().map(|(name, _, _)| node(name)).collect(),
        );
        for (name, state, participating) in entries {
            let entry = s.nodes.get_mut(*name).unwrap();
            entry.state = state.clone();
            entry.participating = *participating;
        }
        s.committed = committed;
        s.aborted = aborted;
        s
    }

    #[test]
    fn test_outcome_pending_before_commit() {
        let s = session(&[("a", CaptureState::Preparing, true)], false, false);
        assert_eq!(s.outcome(), SessionOutcome::Pending);
    }

    #[test]
    fn test_outcome_aborted_without_commit() {
        let s = session(&[("a", failed_state(), false)], false, true);
        assert_eq!(s.outcome(), SessionOutcome::Aborted);
    }

    #[test]
    fn test_outcome_committed_while_recording() {
        let s = session(
            &[
                ("a", CaptureState::Recording, true),
                ("b", done_state(), true),
            ],
            true,
            false,
        );
        assert_eq!(s.outcome(), SessionOutcome::Committed);
    }

    #[test]
    fn test_outcome_completed_when_all_done() {
        let s = session(
            &[("a", done_state(), true), ("b", done_state(), true)],
            true,
            false,
        );
        assert_eq!(s.outcome(), SessionOutcome::Completed);
    }

    #[test]
    fn test_outcome_partial_with_excluded_node() {
        let s = session(
            &[
                ("a", done_state(), true),
                ("b", done_state(), true),
                ("c", failed_state(), false),
            ],
            true,
            false,
        );
        assert_eq!(s.outcome(), SessionOutcome::PartiallyFailed);
    }

    #[test]
    fn test_outcome_partial_with_failed_participant() {
        let s = session(
            &[("a", done_state(), true), ("b", failed_state(), true)],
            true,
            false,
        );
        assert_eq!(s.outcome(), SessionOutcome::PartiallyFailed);
    }

    #[test]
    fn test_outcome_aborted_when_nothing_done() {
        let s = session(
            &[
                ("a", failed_state(), true),
                ("b", failed_state(), false),
            ],
            true,
            false,
        );
        assert_eq!(s.outcome(), SessionOutcome::Aborted);
    }

    #[test]
    fn test_directory_lookup() {
        let dir = NodeDirectory::new(vec![node("pi1"), node("pi2")]);
        assert_eq!(dir.get("pi2").unwrap().addr, "http://pi2:5000");
        assert!(dir.get("pi3").is_none());
        assert_eq!(dir.nodes().len(), 2);
    }
}
