//! Worker connection sessions
//!
//! One logical session per connected worker. [`SessionManager`] keeps the
//! live session for each `nodeId` (a reconnect supersedes the old one) and
//! gives the dispatcher a non-blocking way to enqueue outbound commands.
//! [`ControllerSession`] handles the frames read from one socket.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::auth::NodeIdentity;
use super::controller::ClusterController;
use crate::protocol::{ErrorCode, ErrorDetails, Message, MessageType, Payload, Peer};

/// Connection lifecycle shared by both ends of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    ConnectedUnregistered,
    ConnectedRegistered,
    Disconnected,
}

impl SessionState {
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Authenticating, ConnectedUnregistered)
                | (ConnectedUnregistered, ConnectedRegistered)
                // re-registration on the same socket is idempotent
                | (ConnectedRegistered, ConnectedRegistered)
                | (Connecting | Authenticating | ConnectedUnregistered | ConnectedRegistered, Disconnected)
        )
    }

    pub fn is_registered(&self) -> bool {
        *self == SessionState::ConnectedRegistered
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::ConnectedUnregistered => "connected(unregistered)",
            SessionState::ConnectedRegistered => "connected(registered)",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Node '{0}' has no registered session")]
    NotRegistered(String),

    #[error("Session for node '{0}' is closed")]
    Closed(String),

    #[error("Illegal session transition {from} -> {to}")]
    IllegalTransition {
        from: SessionState,
        to: SessionState,
    },
}

/// Controller-side view of one live connection
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub state: SessionState,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

/// Live sessions keyed by `nodeId`
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<DashMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an authenticated connection for `node_id`
    ///
    /// Any previous session for the node is cancelled. Returns the new
    /// session id.
    pub fn attach(
        &self,
        node_id: &str,
        outbound: mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
    ) -> String {
        let session_id = Uuid::new_v4().to_string();
        let handle = SessionHandle {
            session_id: session_id.clone(),
            state: SessionState::ConnectedUnregistered,
            connected_at: Utc::now(),
            outbound,
            cancel,
        };

        if let Some(previous) = self.sessions.insert(node_id.to_string(), handle) {
            info!(
                "Node {} reconnected, superseding session {}",
                node_id, previous.session_id
            );
            previous.cancel.cancel();
        }
        session_id
    }

    /// Returns false if `session_id` is no longer the node's live session
    pub fn mark_registered(&self, node_id: &str, session_id: &str) -> bool {
        match self.sessions.get_mut(node_id) {
            Some(mut handle) if handle.session_id == session_id => {
                handle.state = SessionState::ConnectedRegistered;
                true
            }
            _ => false,
        }
    }

    /// Remove the node's session if it is still `session_id`
    ///
    /// A superseded session detaching returns false and leaves the newer
    /// session alone.
    pub fn detach(&self, node_id: &str, session_id: &str) -> bool {
        self.sessions
            .remove_if(node_id, |_, h| h.session_id == session_id)
            .is_some()
    }

    pub fn is_registered(&self, node_id: &str) -> bool {
        self.sessions
            .get(node_id)
            .map(|h| h.state.is_registered() && !h.outbound.is_closed())
            .unwrap_or(false)
    }

    pub fn state(&self, node_id: &str) -> Option<SessionState> {
        self.sessions.get(node_id).map(|h| h.state)
    }

    /// Enqueue a message for a registered node without waiting
    pub fn send(&self, node_id: &str, message: Message) -> Result<(), SessionError> {
        let handle = self
            .sessions
            .get(node_id)
            .ok_or_else(|| SessionError::NotRegistered(node_id.to_string()))?;

        if !handle.state.is_registered() {
            return Err(SessionError::NotRegistered(node_id.to_string()));
        }
        handle
            .outbound
            .send(message)
            .map_err(|_| SessionError::Closed(node_id.to_string()))
    }

    /// Close every session, used on shutdown
    pub fn close_all(&self) {
        for handle in self.sessions.iter() {
            handle.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Frame handler for one authenticated worker socket
pub struct ControllerSession {
    controller: Arc<ClusterController>,
    node: NodeIdentity,
    session_id: String,
    state: SessionState,
    outbound: mpsc::UnboundedSender<Message>,
}

impl ControllerSession {
    pub fn new(
        controller: Arc<ClusterController>,
        node: NodeIdentity,
        session_id: String,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            controller,
            node,
            session_id,
            state: SessionState::ConnectedUnregistered,
            outbound,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node.node_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn advance(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Mark the session closed; further frames are ignored
    pub fn close(&mut self) {
        let _ = self.advance(SessionState::Disconnected);
    }

    /// Handle one text frame. Bad frames are answered with an `error`
    /// message; nothing here ends the session.
    pub async fn handle_text(&mut self, text: &str) {
        if self.state == SessionState::Disconnected {
            return;
        }

        let message = match Message::decode(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("Rejecting frame from {}: {}", self.node.node_id, e);
                self.reply(e.to_reply());
                return;
            }
        };

        if !message.kind.allowed_from(Peer::Worker) {
            warn!(
                "Node {} sent controller-only message {}",
                self.node.node_id, message.kind
            );
            self.reject(
                &message,
                ErrorDetails::new(
                    ErrorCode::CommandInvalid,
                    format!("{} is not accepted from workers", message.kind),
                ),
            );
            return;
        }

        if !self.state.is_registered() && message.kind != MessageType::NodeRegister {
            self.reject(
                &message,
                ErrorDetails::new(
                    ErrorCode::CommandInvalid,
                    format!("{} received before node.register", message.kind),
                ),
            );
            return;
        }

        self.route(message).await;
    }

    async fn route(&mut self, message: Message) {
        let node_id = self.node.node_id.clone();
        let controller = Arc::clone(&self.controller);
        let now = Utc::now();

        match &message.payload {
            Payload::NodeRegister(register) => {
                if register.node_id != node_id {
                    warn!(
                        "Node {} registered as '{}', using authenticated id",
                        node_id, register.node_id
                    );
                }
                let ack = controller.register_node(&self.node, register, now);
                if self.advance(SessionState::ConnectedRegistered).is_ok() {
                    // register.ack must precede any command on the wire
                    self.reply(ack);
                    controller.activate_session(&node_id, &self.session_id);
                }
            }
            Payload::TelemetryHeartbeat(heartbeat) => {
                if let Err(e) = controller.on_heartbeat(&node_id, heartbeat, now) {
                    self.reject(&message, e.to_error_details());
                }
            }
            Payload::TelemetryMetrics(metrics) => {
                trace!("Metrics from {}", node_id);
                if let Err(e) = controller.on_metrics(&node_id, metrics.clone(), now) {
                    self.reject(&message, e.to_error_details());
                }
            }
            Payload::CommandAck(ack) => {
                controller.on_ack(&node_id, ack, now);
            }
            Payload::CommandResult(result) => {
                controller.on_result(&node_id, result, now).await;
            }
            Payload::DeploymentStatus(event) => {
                if let Err(e) = controller.on_deployment_status(&node_id, event, now).await {
                    warn!("Rejected status event from {}: {}", node_id, e);
                    self.reject(&message, e.to_error_details());
                }
            }
            Payload::DeploymentLogs(logs) => {
                if let Err(e) = controller.on_deployment_logs(&node_id, logs).await {
                    self.reject(&message, e.to_error_details());
                }
            }
            Payload::ModelDownloadProgress(progress) => {
                let correlation = message
                    .metadata
                    .as_ref()
                    .and_then(|m| m.correlation_id.as_deref());
                controller.on_download_progress(&node_id, correlation, progress);
            }
            Payload::Error(error) => {
                warn!(
                    "Node {} reported error {} (re: {:?})",
                    node_id, error.error, error.original_message_id
                );
            }
            Payload::Extension(kind, _) => {
                debug!("Ignoring reserved event {} from {}", kind, node_id);
            }
            _ => {
                self.reject(
                    &message,
                    ErrorDetails::new(
                        ErrorCode::CommandInvalid,
                        format!("{} is not accepted from workers", message.kind),
                    ),
                );
            }
        }
    }

    fn reject(&self, offending: &Message, error: ErrorDetails) {
        self.reply(Message::error(Some(offending.message_id.clone()), error));
    }

    fn reply(&self, message: Message) {
        if self.outbound.send(message).is_err() {
            debug!("Session {} closed before reply", self.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::mirror::MirrorHandle;
    use crate::cluster::node::tests::{heartbeat, register_payload};
    use crate::config::ControllerConfig;
    use crate::protocol::{
        ConnectionAckPayload, EmptyPayload, NodeStatus, ReplyStatus, ResourceRef,
    };

    fn outbound() -> (
        mpsc::UnboundedSender<Message>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        mpsc::unbounded_channel()
    }

    fn ping() -> Message {
        Message::new(Payload::ConnectionAck(ConnectionAckPayload {
            status: ReplyStatus::Success,
            node_id: None,
            controller_id: None,
            server_version: None,
            error: None,
        }))
    }

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(Connecting.can_transition_to(Authenticating));
        assert!(Authenticating.can_transition_to(ConnectedUnregistered));
        assert!(ConnectedUnregistered.can_transition_to(ConnectedRegistered));
        assert!(ConnectedRegistered.can_transition_to(ConnectedRegistered));
        assert!(ConnectedRegistered.can_transition_to(Disconnected));
        assert!(!Connecting.can_transition_to(ConnectedRegistered));
        assert!(!Disconnected.can_transition_to(Connecting));
        assert!(!ConnectedRegistered.can_transition_to(ConnectedUnregistered));
    }

    #[test]
    fn test_send_requires_registration() {
        let sessions = SessionManager::new();
        let (tx, mut rx) = outbound();
        let session_id = sessions.attach("n1", tx, CancellationToken::new());

        assert_eq!(
            sessions.send("n1", ping()),
            Err(SessionError::NotRegistered("n1".to_string()))
        );

        assert!(sessions.mark_registered("n1", &session_id));
        assert!(sessions.is_registered("n1"));
        sessions.send("n1", ping()).unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_reconnect_supersedes() {
        let sessions = SessionManager::new();
        let (tx1, _rx1) = outbound();
        let cancel1 = CancellationToken::new();
        let first = sessions.attach("n1", tx1, cancel1.clone());

        let (tx2, _rx2) = outbound();
        let second = sessions.attach("n1", tx2, CancellationToken::new());

        assert!(cancel1.is_cancelled());
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.state("n1"), Some(SessionState::ConnectedUnregistered));

        // The superseded session cannot register or detach the new one
        assert!(!sessions.mark_registered("n1", &first));
        assert!(!sessions.detach("n1", &first));
        assert_eq!(sessions.len(), 1);

        assert!(sessions.detach("n1", &second));
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_closed_channel_not_registered() {
        let sessions = SessionManager::new();
        let (tx, rx) = outbound();
        let session_id = sessions.attach("n1", tx, CancellationToken::new());
        sessions.mark_registered("n1", &session_id);
        drop(rx);

        assert!(!sessions.is_registered("n1"));
        assert_eq!(
            sessions.send("n1", ping()),
            Err(SessionError::Closed("n1".to_string()))
        );
    }

    fn cluster() -> Arc<ClusterController> {
        Arc::new(ClusterController::from_config(
            ControllerConfig::default(),
            MirrorHandle::disabled(),
        ))
    }

    /// Attach a fresh socket for `n1` and wrap it in a frame handler
    fn open_socket(
        controller: &Arc<ClusterController>,
    ) -> (ControllerSession, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = outbound();
        let session_id = controller
            .sessions()
            .attach("n1", tx.clone(), CancellationToken::new());
        let node = NodeIdentity {
            node_id: "n1".to_string(),
            owner: Default::default(),
        };
        (
            ControllerSession::new(Arc::clone(controller), node, session_id, tx),
            rx,
        )
    }

    fn frame(payload: Payload) -> (String, String) {
        let message = Message::new(payload);
        (message.message_id.clone(), message.encode().unwrap())
    }

    fn register_frame() -> String {
        frame(Payload::NodeRegister(register_payload("n1"))).1
    }

    fn heartbeat_frame() -> (String, String) {
        frame(Payload::TelemetryHeartbeat(heartbeat("n1", NodeStatus::Healthy)))
    }

    fn expect_rejection(rx: &mut mpsc::UnboundedReceiver<Message>, original: &str) -> ErrorDetails {
        let reply = rx.try_recv().unwrap();
        match reply.payload {
            Payload::Error(error) => {
                assert_eq!(error.original_message_id.as_deref(), Some(original));
                error.error
            }
            other => panic!("expected error reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frames_before_register_rejected() {
        let controller = cluster();
        let (mut session, mut rx) = open_socket(&controller);

        let (id, text) = heartbeat_frame();
        session.handle_text(&text).await;

        let error = expect_rejection(&mut rx, &id);
        assert_eq!(error.code, ErrorCode::CommandInvalid);
        assert!(controller.registry().get("n1").is_none());
        assert_eq!(session.state(), SessionState::ConnectedUnregistered);
    }

    #[tokio::test]
    async fn test_controller_only_kinds_rejected() {
        let controller = cluster();
        let (mut session, mut rx) = open_socket(&controller);
        session.handle_text(&register_frame()).await;
        assert!(matches!(rx.try_recv().unwrap().payload, Payload::RegisterAck(_)));

        let (id, text) = frame(ping().payload);
        session.handle_text(&text).await;
        assert_eq!(expect_rejection(&mut rx, &id).code, ErrorCode::CommandInvalid);

        let command = Message::command(
            Payload::ModelList(EmptyPayload {}),
            ResourceRef::system("n1"),
        );
        session.handle_text(&command.encode().unwrap()).await;
        assert_eq!(
            expect_rejection(&mut rx, &command.message_id).code,
            ErrorCode::CommandInvalid
        );
        assert!(session.state().is_registered());
    }

    #[tokio::test]
    async fn test_reregister_on_same_socket_is_idempotent() {
        let controller = cluster();
        let (mut session, mut rx) = open_socket(&controller);

        for _ in 0..2 {
            session.handle_text(&register_frame()).await;
            let ack = rx.try_recv().unwrap();
            assert!(matches!(ack.payload, Payload::RegisterAck(_)));
            assert_eq!(session.state(), SessionState::ConnectedRegistered);
            assert!(controller.sessions().is_registered("n1"));
        }

        assert_eq!(controller.registry().list().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_new_socket_must_register_before_heartbeats() {
        let controller = cluster();
        let (mut first, mut first_rx) = open_socket(&controller);
        first.handle_text(&register_frame()).await;
        first_rx.try_recv().unwrap();

        // What the gateway does when the socket drops
        first.close();
        assert!(controller.sessions().detach("n1", first.session_id()));
        controller.on_disconnect("n1", Utc::now());
        assert_eq!(controller.registry().get("n1").unwrap().status, NodeStatus::Offline);

        // Frames on the closed session are ignored
        first.handle_text(&heartbeat_frame().1).await;
        assert!(first_rx.try_recv().is_err());

        let (mut second, mut rx) = open_socket(&controller);
        let (id, text) = heartbeat_frame();
        second.handle_text(&text).await;
        assert_eq!(expect_rejection(&mut rx, &id).code, ErrorCode::CommandInvalid);
        assert_eq!(controller.registry().get("n1").unwrap().status, NodeStatus::Offline);

        second.handle_text(&register_frame()).await;
        assert!(matches!(rx.try_recv().unwrap().payload, Payload::RegisterAck(_)));
        second.handle_text(&heartbeat_frame().1).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(controller.registry().get("n1").unwrap().status, NodeStatus::Healthy);
    }
}
