//! Session coordinator
//!
//! Tracks recording sessions spanning an arbitrary set of nodes and
//! drives the two-phase start: every node validates and reserves its
//! cameras first (prepare), then start commands are dispatched to all
//! participants concurrently (commit) so wall-clock skew between nodes
//! is bounded by network latency variance, not serialized dispatch.
//!
//! Per-node capture state is owned by each node's supervisor; the
//! session map here only mirrors the last known states behind a single
//! mutex, and the session outcome is always computed from it.

pub mod session;
pub mod transport;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::supervisor::state::{CaptureParams, CaptureState};
pub use session::{
    Node, NodeDirectory, NodeStatus, RecordingSession, SessionError, SessionId, SessionOutcome,
    SessionPolicy, SessionStatus,
};
pub use transport::{HttpNodeTransport, NodeTransport, TransportError};

/// Coordinates synchronized capture sessions across nodes
pub struct SessionCoordinator {
    directory: NodeDirectory,
    transport: Arc<dyn NodeTransport>,
    policy: SessionPolicy,
    sessions: Mutex<HashMap<SessionId, RecordingSession>>,
}

impl SessionCoordinator {
    pub fn new(
        directory: NodeDirectory,
        transport: Arc<dyn NodeTransport>,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            directory,
            transport,
            policy,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &NodeDirectory {
        &self.directory
    }

    /// Start a synchronized session across the named nodes.
    ///
    /// The returned id is valid even when the session ends up aborted;
    /// `poll` tells the full story per node.
    pub async fn request_session(
        &self,
        node_names: &[String],
        params: CaptureParams,
    ) -> Result<SessionId, SessionError> {
        if node_names.is_empty() {
            return Err(SessionError::NoNodes);
        }
        let mut nodes = Vec::with_capacity(node_names.len());
        for name in node_names {
            let node = self
                .directory
                .get(name)
                .ok_or_else(|| SessionError::UnknownNode(name.clone()))?;
            nodes.push(node.clone());
        }

        let id = Uuid::new_v4();
        self.sessions
            .lock()
            .insert(id, RecordingSession::new(id, params.clone(), nodes.clone()));
        tracing::info!("session {} requested across {} nodes", id, nodes.len());

        // Phase 1: prepare every node concurrently
        let mut set = JoinSet::new();
        for node in nodes {
            let transport = self.transport.clone();
            let params = params.clone();
            let timeout = self.policy.prepare_timeout;
            set.spawn(async move {
                let result =
                    match tokio::time::timeout(timeout, transport.prepare(&node, &params)).await {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::Unreachable(format!(
                            "prepare timed out after {:?}",
                            timeout
                        ))),
                    };
                (node, result)
            });
        }

        let mut prepared = Vec::new();
        let mut any_failed = false;
        while let Some(joined) = set.join_next().await {
            let Ok((node, result)) = joined else { continue };
            match result {
                Ok(()) => {
                    self.update_entry(id, &node.name, |entry| {
                        entry.state = CaptureState::Preparing;
                    });
                    prepared.push(node);
                }
                Err(err) => {
                    tracing::warn!("node {} failed prepare: {}", node.name, err);
                    any_failed = true;
                    let reason = err.to_response();
                    self.update_entry(id, &node.name, |entry| {
                        entry.state = CaptureState::Failed { reason };
                        entry.participating = false;
                    });
                }
            }
        }

        if any_failed && !self.policy.best_effort {
            // strict mode: release whoever did prepare, record nothing
            self.release_nodes(&prepared).await;
            let _ = self.with_session(id, |session| {
                session.aborted = true;
                for node in &prepared {
                    if let Some(entry) = session.nodes.get_mut(&node.name) {
                        entry.state = CaptureState::Idle;
                        entry.participating = false;
                    }
                }
            });
            tracing::warn!("session {} aborted: a node failed prepare", id);
            return Ok(id);
        }

        if prepared.is_empty() {
            let _ = self.with_session(id, |session| session.aborted = true);
            tracing::warn!("session {} aborted: no node passed prepare", id);
            return Ok(id);
        }

        // Phase 2: commit. Each start is its own task, so no node's
        // round trip delays the next node's command.
        let mut set = JoinSet::new();
        for node in prepared {
            let transport = self.transport.clone();
            let params = params.clone();
            let timeout = self.policy.command_timeout;
            set.spawn(async move {
                let result =
                    match tokio::time::timeout(timeout, transport.start(&node, &params)).await {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::Unreachable(format!(
                            "start timed out after {:?}",
                            timeout
                        ))),
                    };
                (node, result)
            });
        }

        let mut committed = false;
        while let Some(joined) = set.join_next().await {
            let Ok((node, result)) = joined else { continue };
            match result {
                Ok(()) => {
                    committed = true;
                    self.update_entry(id, &node.name, |entry| {
                        entry.state = CaptureState::Recording;
                    });
                }
                Err(err) => {
                    // no retry: a duplicate start could desynchronize a
                    // capture that actually began on the node
                    tracing::warn!("node {} failed start: {}", node.name, err);
                    let reason = err.to_response();
                    self.update_entry(id, &node.name, |entry| {
                        entry.state = CaptureState::Failed { reason };
                        entry.participating = false;
                    });
                }
            }
        }

        let _ = self.with_session(id, |session| {
            session.committed = committed;
            if !committed {
                session.aborted = true;
            }
        });
        tracing::info!("session {} commit finished", id);
        Ok(id)
    }

    /// Explicitly stop every node still capturing. Each node's local
    /// duration timer remains authoritative, so a missed stop only
    /// means the node finishes on its own.
    pub async fn stop(&self, id: SessionId) -> Result<(), SessionError> {
        self.halt(id, false).await
    }

    /// Abort the session: every node still preparing or recording is
    /// told to stop. Partial output files are retained on the nodes.
    pub async fn abort(&self, id: SessionId) -> Result<(), SessionError> {
        self.halt(id, true).await
    }

    async fn halt(&self, id: SessionId, abort: bool) -> Result<(), SessionError> {
        let targets: Vec<Node> = self.with_session(id, |session| {
            if abort {
                session.aborted = true;
            }
            session
                .nodes
                .values()
                .filter(|e| e.participating && !e.state.is_terminal())
                .map(|e| e.node.clone())
                .collect()
        })?;

        let mut set = JoinSet::new();
        for node in targets {
            let transport = self.transport.clone();
            let timeout = self.policy.command_timeout;
            set.spawn(async move {
                let result = match tokio::time::timeout(timeout, transport.stop(&node)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Unreachable(format!(
                        "stop timed out after {:?}",
                        timeout
                    ))),
                };
                (node, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let Ok((node, result)) = joined else { continue };
            match result {
                Ok(state) => {
                    let released = matches!(state, CaptureState::Idle);
                    self.update_entry(id, &node.name, |entry| {
                        entry.state = state;
                        if released {
                            entry.participating = false;
                        }
                    });
                }
                Err(TransportError::Rejected { code, .. }) if code == "NOT_RECORDING" => {
                    // already settled on its own
                }
                Err(err) => {
                    tracing::warn!("node {} failed stop: {}", node.name, err);
                    let reason = err.to_response();
                    self.update_entry(id, &node.name, |entry| {
                        entry.state = CaptureState::Failed { reason };
                    });
                }
            }
        }
        Ok(())
    }

    /// Refresh every live node's state and return the aggregated view.
    /// A node that cannot be reached keeps its last known state.
    pub async fn poll(&self, id: SessionId) -> Result<SessionStatus, SessionError> {
        let targets: Vec<Node> = self.with_session(id, |session| {
            session
                .nodes
                .values()
                .filter(|e| e.participating && !e.state.is_terminal())
                .map(|e| e.node.clone())
                .collect()
        })?;

        let mut set = JoinSet::new();
        for node in targets {
            let transport = self.transport.clone();
            set.spawn(async move {
                let result = transport.status(&node).await;
                (node, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let Ok((node, result)) = joined else { continue };
            match result {
                Ok(state) => {
                    self.update_entry(id, &node.name, |entry| entry.state = state);
                }
                Err(err) => {
                    tracing::debug!("status refresh failed for {}: {}", node.name, err);
                }
            }
        }

        self.with_session(id, |session| session.status())
    }

    /// Snapshot of the last known session state, without refreshing
    pub fn get(&self, id: SessionId) -> Result<SessionStatus, SessionError> {
        self.with_session(id, |session| session.status())
    }

    fn with_session<T>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut RecordingSession) -> T,
    ) -> Result<T, SessionError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?;
        Ok(f(session))
    }

    fn update_entry(&self, id: SessionId, name: &str, f: impl FnOnce(&mut session::NodeEntry)) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(&id) {
            if let Some(entry) = session.nodes.get_mut(name) {
                f(entry);
            }
        }
    }

    /// Best-effort release of nodes that prepared for a session that is
    /// not going to commit
    async fn release_nodes(&self, nodes: &[Node]) {
        let mut set = JoinSet::new();
        for node in nodes {
            let transport = self.transport.clone();
            let node = node.clone();
            let timeout = self.policy.command_timeout;
            set.spawn(async move {
                let _ = tokio::time::timeout(timeout, transport.stop(&node)).await;
            });
        }
        while set.join_next().await.is_some() {}
    }
}
