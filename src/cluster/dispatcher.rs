//! Command dispatcher and correlation table
//!
//! Every command sent to a worker gets an [`OutstandingCommand`] keyed by its
//! `messageId`. Acks and results coming back over any session are matched
//! against that table; the sweeper expires entries whose deadlines pass.
//!
//! The table is a sharded [`DashMap`], so two writers can never touch the
//! same entry concurrently and unrelated commands don't contend.
//!
//! Terminal transitions are returned to the caller rather than applied here.
//! The controller owns the side effects (deployment state, mirror).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::session::{SessionError, SessionManager};
use crate::protocol::{
    CommandAckPayload, CommandResultPayload, CommandStatus, ErrorCode, ErrorDetails, Message,
    MessageType, ReplyStatus, ResourceRef,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Node '{0}' is not connected and registered")]
    NodeUnavailable(String),

    #[error("Message type '{0}' is not a command")]
    NotACommand(MessageType),

    #[error("Command '{0}' already dispatched")]
    Duplicate(String),

    #[error("Command '{0}' not found")]
    NotFound(String),

    #[error("Command '{0}' already finished")]
    AlreadyFinished(String),

    #[error("Command '{0}' was dropped before completing")]
    Abandoned(String),
}

/// Deadlines applied to new commands
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Time allowed between send and `command.ack`
    pub ack_timeout: Duration,
    /// Result deadline used until an ack supplies an estimate
    pub default_result_timeout: Duration,
    /// How long terminal entries stay queryable
    pub retention: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::seconds(10),
            default_result_timeout: Duration::seconds(300),
            retention: Duration::seconds(300),
        }
    }
}

/// An in-flight (or recently finished) command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutstandingCommand {
    pub message_id: String,
    pub node_id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,
    pub status: CommandStatus,
    pub sent_at: DateTime<Utc>,
    pub ack_deadline: DateTime<Utc>,
    pub result_deadline: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds, as estimated by the worker's ack
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

impl OutstandingCommand {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn resource_id(&self) -> Option<&str> {
        self.resource.as_ref().map(|r| r.id.as_str())
    }

    /// Which deadline (if any) has passed at `now`
    fn expired(&self, now: DateTime<Utc>) -> Option<&'static str> {
        match self.status {
            CommandStatus::Pending | CommandStatus::Sent if now > self.ack_deadline => Some("ack"),
            CommandStatus::Acknowledged if now > self.result_deadline => Some("result"),
            _ => None,
        }
    }

    fn finish(&mut self, status: CommandStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
    }
}

/// Shared correlation table plus the session map it sends through
#[derive(Clone)]
pub struct CommandDispatcher {
    config: DispatcherConfig,
    sessions: SessionManager,
    commands: Arc<DashMap<String, OutstandingCommand>>,
    waiters: Arc<DashMap<String, oneshot::Sender<OutstandingCommand>>>,
}

impl CommandDispatcher {
    pub fn new(sessions: SessionManager, config: DispatcherConfig) -> Self {
        Self {
            config,
            sessions,
            commands: Arc::new(DashMap::new()),
            waiters: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Send `command` to `node_id` and start tracking it
    ///
    /// Fails with [`DispatchError::NodeUnavailable`] unless the node's
    /// session is connected and registered.
    pub fn dispatch(
        &self,
        node_id: &str,
        command: Message,
        now: DateTime<Utc>,
    ) -> Result<String, DispatchError> {
        use dashmap::mapref::entry::Entry;

        if !command.kind.is_command() {
            return Err(DispatchError::NotACommand(command.kind));
        }
        if !self.sessions.is_registered(node_id) {
            return Err(DispatchError::NodeUnavailable(node_id.to_string()));
        }

        let message_id = command.message_id.clone();
        let entry = OutstandingCommand {
            message_id: message_id.clone(),
            node_id: node_id.to_string(),
            kind: command.kind,
            resource: command.resource.clone(),
            status: CommandStatus::Pending,
            sent_at: now,
            ack_deadline: now + self.config.ack_timeout,
            result_deadline: now + self.config.default_result_timeout,
            acknowledged_at: None,
            completed_at: None,
            estimated_duration: None,
            progress: None,
            result: None,
            error: None,
        };

        // Tracked before sending so a fast ack always finds its entry
        match self.commands.entry(message_id.clone()) {
            Entry::Occupied(_) => return Err(DispatchError::Duplicate(message_id)),
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }

        let kind = command.kind;
        if let Err(e) = self.sessions.send(node_id, command) {
            self.commands.remove(&message_id);
            self.waiters.remove(&message_id);
            debug!("Dispatch of {} to {} failed: {}", message_id, node_id, e);
            return Err(match e {
                SessionError::NotRegistered(id) | SessionError::Closed(id) => {
                    DispatchError::NodeUnavailable(id)
                }
                _ => DispatchError::NodeUnavailable(node_id.to_string()),
            });
        }

        if let Some(mut tracked) = self.commands.get_mut(&message_id) {
            if tracked.status == CommandStatus::Pending {
                tracked.status = CommandStatus::Sent;
            }
        }

        info!("Dispatched {} {} to node {}", kind, message_id, node_id);
        Ok(message_id)
    }

    /// Dispatch and wait asynchronously for the terminal state
    ///
    /// Resolves on result, timeout or cancellation; the wait never blocks a
    /// session loop.
    pub async fn dispatch_and_wait(
        &self,
        node_id: &str,
        command: Message,
    ) -> Result<OutstandingCommand, DispatchError> {
        let message_id = command.message_id.clone();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(message_id.clone(), tx);

        if let Err(e) = self.dispatch(node_id, command, Utc::now()) {
            self.waiters.remove(&message_id);
            return Err(e);
        }

        rx.await.map_err(|_| DispatchError::Abandoned(message_id))
    }

    // =========================================================================
    // Correlation
    // =========================================================================

    /// Apply a `command.ack`; returns whether it changed anything
    ///
    /// Unknown, foreign, duplicate and late acks are discarded.
    pub fn on_ack(&self, from_node: &str, ack: &CommandAckPayload, now: DateTime<Utc>) -> bool {
        let Some(mut command) = self.commands.get_mut(&ack.original_message_id) else {
            debug!(
                "Discarding ack from {} for unknown command {}",
                from_node, ack.original_message_id
            );
            return false;
        };

        if command.node_id != from_node {
            debug!(
                "Discarding ack for {} from {} (sent to {})",
                command.message_id, from_node, command.node_id
            );
            return false;
        }

        match command.status {
            CommandStatus::Pending | CommandStatus::Sent => {
                command.status = CommandStatus::Acknowledged;
                command.acknowledged_at = Some(now);
                command.estimated_duration = ack.estimated_duration;
                if let Some(secs) = ack.estimated_duration {
                    command.result_deadline = self.estimated_deadline(now, secs);
                }
                debug!(
                    "Command {} acknowledged by {} (estimate {:?}s)",
                    command.message_id, from_node, ack.estimated_duration
                );
                true
            }
            status => {
                debug!(
                    "Discarding duplicate ack for {} ({})",
                    command.message_id, status
                );
                false
            }
        }
    }

    /// Result deadline for a worker estimate, or the default when it does not fit
    fn estimated_deadline(&self, now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
        let fallback = now + self.config.default_result_timeout;
        let Some(estimate) = i64::try_from(secs).ok().and_then(Duration::try_seconds) else {
            warn!("Ignoring out-of-range duration estimate of {}s", secs);
            return fallback;
        };
        now.checked_add_signed(estimate).unwrap_or(fallback)
    }

    /// Apply a `command.result`; returns the finished command if it was new
    pub fn on_result(
        &self,
        from_node: &str,
        result: &CommandResultPayload,
        now: DateTime<Utc>,
    ) -> Option<OutstandingCommand> {
        let finished = {
            let Some(mut command) = self.commands.get_mut(&result.original_message_id) else {
                debug!(
                    "Discarding result from {} for unknown command {}",
                    from_node, result.original_message_id
                );
                return None;
            };

            if command.node_id != from_node {
                debug!(
                    "Discarding result for {} from {} (sent to {})",
                    command.message_id, from_node, command.node_id
                );
                return None;
            }

            if command.is_terminal() {
                debug!(
                    "Discarding late result for {} ({})",
                    command.message_id, command.status
                );
                return None;
            }

            let status = match result.status {
                ReplyStatus::Success => CommandStatus::Success,
                ReplyStatus::Error => CommandStatus::Error,
            };
            command.finish(status, now);
            command.result = result.result.clone();
            command.error = result.error.clone();
            command.progress = result.progress.or(command.progress);

            info!(
                "Command {} {} on node {}",
                command.message_id, command.status, from_node
            );
            command.clone()
        };

        self.notify(&finished);
        Some(finished)
    }

    /// Record intermediate progress reported by an event
    pub fn on_progress(&self, from_node: &str, message_id: &str, progress: u8) -> bool {
        match self.commands.get_mut(message_id) {
            Some(mut command) if command.node_id == from_node && !command.is_terminal() => {
                command.progress = Some(progress.min(100));
                true
            }
            _ => false,
        }
    }

    // =========================================================================
    // Timeouts, cancellation, retention
    // =========================================================================

    /// Expire overdue commands and purge old terminal entries
    ///
    /// Returns each newly timed-out command exactly once.
    pub fn sweep_timeouts(&self, now: DateTime<Utc>) -> Vec<OutstandingCommand> {
        let mut expired = Vec::new();

        for mut command in self.commands.iter_mut() {
            if let Some(deadline) = command.expired(now) {
                warn!(
                    "Command {} ({}) to node {} timed out waiting for {}",
                    command.message_id, command.kind, command.node_id, deadline
                );
                command.finish(CommandStatus::Timeout, now);
                command.error = Some(ErrorDetails::new(
                    ErrorCode::Timeout,
                    format!("No {} received before deadline", deadline),
                ));
                expired.push(command.clone());
            }
        }

        let retention = self.config.retention;
        self.commands.retain(|_, c| match c.completed_at {
            Some(done) if c.is_terminal() => now - done <= retention,
            _ => true,
        });

        for command in &expired {
            self.notify(command);
        }
        expired
    }

    /// Cancel locally; the worker is not told and a late result is discarded
    pub fn cancel(
        &self,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OutstandingCommand, DispatchError> {
        use dashmap::mapref::entry::Entry;

        let mut cancelled = match self.commands.entry(message_id.to_string()) {
            Entry::Vacant(_) => return Err(DispatchError::NotFound(message_id.to_string())),
            Entry::Occupied(slot) if slot.get().is_terminal() => {
                return Err(DispatchError::AlreadyFinished(message_id.to_string()))
            }
            Entry::Occupied(slot) => slot.remove(),
        };

        cancelled.finish(CommandStatus::Cancelled, now);
        info!("Command {} cancelled locally", message_id);
        self.notify(&cancelled);
        Ok(cancelled)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get(&self, message_id: &str) -> Option<OutstandingCommand> {
        self.commands.get(message_id).map(|c| c.clone())
    }

    pub fn list_for_node(&self, node_id: &str) -> Vec<OutstandingCommand> {
        self.commands
            .iter()
            .filter(|c| c.node_id == node_id)
            .map(|c| c.clone())
            .collect()
    }

    /// Number of non-terminal entries
    pub fn in_flight(&self) -> usize {
        self.commands.iter().filter(|c| !c.is_terminal()).count()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn notify(&self, command: &OutstandingCommand) {
        if let Some((_, waiter)) = self.waiters.remove(&command.message_id) {
            let _ = waiter.send(command.clone());
        }
    }
}
