//! Worker side of the node link
//!
//! A session is: connect with the bearer token, wait for `connection.ack`,
//! send `node.register`, wait for `register.ack`, then run telemetry and the
//! command loop until the socket drops. The client reconnects forever with
//! backoff; only a non-retryable handshake rejection ends it.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::executor::CommandExecutor;
use super::handler::CommandHandler;
use super::retry::{Backoff, RetryPolicy};
use super::telemetry::{TelemetryIntervals, TelemetryProducer};
use crate::config::WorkerConfig;
use crate::metrics::{local_ip_address, probe_public_ip, NodeDescriptor, SharedMetricsCollector};
use crate::protocol::{
    ContainerRuntime, ErrorCode, ErrorDetails, Message, MessageType, Payload, Peer, ReplyStatus,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long each handshake step may take
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid controller URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("token is not a valid header value")]
    InvalidToken,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("controller rejected the connection: {0}")]
    Rejected(ErrorDetails),

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("timed out waiting for {0}")]
    HandshakeTimeout(MessageType),

    #[error("connection closed during handshake")]
    ClosedDuringHandshake,

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl WorkerError {
    /// Errors that reconnecting cannot fix
    pub fn is_fatal(&self) -> bool {
        match self {
            WorkerError::Rejected(details) => !details.retryable,
            WorkerError::InvalidUrl { .. } | WorkerError::InvalidToken => true,
            _ => false,
        }
    }
}

pub struct WorkerClient {
    config: WorkerConfig,
    executor: Arc<dyn CommandExecutor>,
    collector: SharedMetricsCollector,
    policy: RetryPolicy,
    handshake_timeout: Duration,
}

impl WorkerClient {
    pub fn new(
        config: WorkerConfig,
        executor: Arc<dyn CommandExecutor>,
        collector: SharedMetricsCollector,
    ) -> Self {
        let policy = config.retry.policy();
        Self {
            config,
            executor,
            collector,
            policy,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Keep a session up until `shutdown` fires or the controller refuses us
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let mut backoff = self.policy.backoff();
        info!(
            "Worker {} connecting to {}",
            self.config.node_id, self.config.controller_url
        );

        loop {
            match self.run_session(&shutdown, &mut backoff).await {
                Ok(()) if shutdown.is_cancelled() => return Ok(()),
                Ok(()) => info!("Connection to controller closed"),
                Err(e) if e.is_fatal() => {
                    error!("Giving up: {}", e);
                    return Err(e);
                }
                Err(e) => warn!("Connection attempt {} failed: {}", backoff.attempt() + 1, e),
            }

            let delay = backoff.next_delay();
            info!("Reconnecting in {}ms", delay.as_millis());
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn connect_request(&self) -> Result<Request, WorkerError> {
        let url = &self.config.controller_url;
        let mut request =
            url.as_str()
                .into_client_request()
                .map_err(|e| WorkerError::InvalidUrl {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
        if let Some(token) = &self.config.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| WorkerError::InvalidToken)?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }

    async fn run_session(
        &self,
        shutdown: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<(), WorkerError> {
        let request = self.connect_request()?;
        let (socket, _) = tokio::time::timeout(self.handshake_timeout, connect_async(request))
            .await
            .map_err(|_| WorkerError::HandshakeTimeout(MessageType::ConnectionAck))??;
        let (mut sink, mut stream) = socket.split();

        let ack = self.await_kind(&mut stream, MessageType::ConnectionAck).await?;
        if let Payload::ConnectionAck(ack) = ack.payload {
            if ack.status == ReplyStatus::Error {
                let details = ack
                    .error
                    .unwrap_or_else(|| ErrorDetails::from_code(ErrorCode::InvalidToken));
                return Err(WorkerError::Rejected(details));
            }
            info!(
                "Connected to controller {}",
                ack.controller_id.as_deref().unwrap_or("unknown")
            );
        }

        let registration = Message::new(Payload::NodeRegister(self.registration().await));
        sink.send(WsMessage::Text(registration.encode()?.into()))
            .await?;

        let ack = self.await_kind(&mut stream, MessageType::RegisterAck).await?;
        let Payload::RegisterAck(ack) = ack.payload else {
            return Err(WorkerError::RegistrationFailed(
                "unexpected register.ack payload".to_string(),
            ));
        };
        if ack.status == ReplyStatus::Error {
            let reason = ack
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "rejected".to_string());
            return Err(WorkerError::RegistrationFailed(reason));
        }
        backoff.reset();
        info!(
            "Registered as {} (heartbeat {}ms, metrics {}ms)",
            ack.node_id, ack.controller_info.heartbeat_interval, ack.controller_info.metrics_interval
        );

        let intervals = TelemetryIntervals::from_millis(
            ack.controller_info.heartbeat_interval,
            ack.controller_info.metrics_interval,
        );
        self.serve(sink, stream, intervals, shutdown.child_token())
            .await;
        Ok(())
    }

    /// Read frames until one of `kind` arrives
    async fn await_kind(
        &self,
        stream: &mut SplitStream<Socket>,
        kind: MessageType,
    ) -> Result<Message, WorkerError> {
        tokio::time::timeout(self.handshake_timeout, next_of_kind(stream, kind))
            .await
            .map_err(|_| WorkerError::HandshakeTimeout(kind))?
    }

    async fn registration(&self) -> crate::protocol::NodeRegisterPayload {
        let container_runtime = match self.executor.runtime().await {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Container runtime unavailable: {}", e);
                ContainerRuntime {
                    runtime_type: "docker".to_string(),
                    version: "unavailable".to_string(),
                    root_dir: String::new(),
                }
            }
        };

        let public_ip_address = match &self.config.public_ip_url {
            Some(url) => match probe_public_ip(url).await {
                Ok(ip) => Some(ip.to_string()),
                Err(e) => {
                    debug!("Public IP lookup failed: {:#}", e);
                    None
                }
            },
            None => None,
        };

        let descriptor = NodeDescriptor {
            node_id: self.config.node_id.clone(),
            name: self.config.display_name().to_string(),
            ip_address: local_ip_address()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            public_ip_address,
            container_runtime,
            gpu_devices: self.executor.gpus(),
        };
        self.collector.write().await.registration(&descriptor)
    }

    /// Registered phase: telemetry out, commands in
    async fn serve(
        &self,
        mut sink: SplitSink<Socket, WsMessage>,
        mut stream: SplitStream<Socket>,
        intervals: TelemetryIntervals,
        session: CancellationToken,
    ) {
        let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();

        let writer = {
            let session = session.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = session.cancelled() => break,
                        next = queue.recv() => {
                            let Some(mut message) = next else { break };
                            message.stamp();
                            match message.encode() {
                                Ok(text) => {
                                    if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                                        warn!("Write to controller failed: {}", e);
                                        session.cancel();
                                        break;
                                    }
                                }
                                Err(e) => error!("Failed to encode {}: {}", message.kind, e),
                            }
                        }
                    }
                }
                let _ = sink.close().await;
            })
        };

        let telemetry = TelemetryProducer::new(
            self.config.node_id.clone(),
            Arc::clone(&self.collector),
            Arc::clone(&self.executor),
            outbound.clone(),
        )
        .spawn(intervals, session.clone());

        let handler = Arc::new(CommandHandler::new(
            self.config.node_id.clone(),
            Arc::clone(&self.executor),
            Arc::clone(&self.collector),
            outbound.clone(),
        ));

        loop {
            tokio::select! {
                _ = session.cancelled() => break,
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        route_frame(text.as_str(), &handler, &outbound);
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("Controller closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Socket error: {}", e);
                        break;
                    }
                }
            }
        }

        session.cancel();
        let _ = writer.await;
        for task in telemetry {
            let _ = task.await;
        }
    }
}

async fn next_of_kind(
    stream: &mut SplitStream<Socket>,
    kind: MessageType,
) -> Result<Message, WorkerError> {
    while let Some(frame) = stream.next().await {
        match frame? {
            WsMessage::Text(text) => match Message::decode(text.as_str()) {
                Ok(message) if message.kind == kind => return Ok(message),
                Ok(Message {
                    payload: Payload::Error(e),
                    ..
                }) => return Err(WorkerError::Rejected(e.error)),
                Ok(other) => debug!("Ignoring {} while waiting for {}", other.kind, kind),
                Err(e) => warn!("Undecodable frame during handshake: {}", e),
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Err(WorkerError::ClosedDuringHandshake)
}

/// Commands go to their own task; everything else is handled inline
fn route_frame(
    text: &str,
    handler: &Arc<CommandHandler>,
    outbound: &mpsc::UnboundedSender<Message>,
) {
    let message = match Message::decode(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Rejecting frame from controller: {}", e);
            let _ = outbound.send(e.to_reply());
            return;
        }
    };

    if !message.kind.allowed_from(Peer::Controller) {
        warn!("Controller sent {}, which only workers may send", message.kind);
        let _ = outbound.send(Message::error(
            Some(message.message_id.clone()),
            ErrorDetails::new(
                ErrorCode::CommandInvalid,
                format!("{} is not accepted from the controller", message.kind),
            ),
        ));
        return;
    }

    if message.kind.is_command() {
        let handler = Arc::clone(handler);
        tokio::spawn(async move { handler.handle(message).await });
        return;
    }

    match message.payload {
        Payload::Error(e) => warn!(
            "Controller reported an error for {}: {}",
            e.original_message_id.as_deref().unwrap_or("-"),
            e.error
        ),
        other => debug!("Ignoring {} from controller", other.message_type()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::new_shared_collector;
    use crate::worker::executor::SimulatedExecutor;

    fn client(url: &str, token: Option<&str>) -> WorkerClient {
        let config = WorkerConfig {
            controller_url: url.to_string(),
            node_id: "gpu-node-1".to_string(),
            token: token.map(str::to_string),
            ..Default::default()
        };
        WorkerClient::new(
            config,
            Arc::new(SimulatedExecutor::single_gpu()),
            new_shared_collector(),
        )
    }

    #[test]
    fn test_connect_request_carries_bearer() {
        let request = client("ws://127.0.0.1:8181/ws/node", Some("secret"))
            .connect_request()
            .unwrap();
        assert_eq!(
            request.headers().get(AUTHORIZATION).unwrap(),
            "Bearer secret"
        );
        assert_eq!(request.uri().path(), "/ws/node");
    }

    #[test]
    fn test_bad_url_is_fatal() {
        let err = client("not a url", None).connect_request().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        let invalid = WorkerError::Rejected(ErrorDetails::from_code(ErrorCode::InvalidToken));
        assert!(invalid.is_fatal());
        let expired = WorkerError::Rejected(ErrorDetails::from_code(ErrorCode::ExpiredToken));
        assert!(!expired.is_fatal());
        assert!(!WorkerError::ClosedDuringHandshake.is_fatal());
        assert!(!WorkerError::HandshakeTimeout(MessageType::RegisterAck).is_fatal());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_while_retrying() {
        // Nothing listens on port 9; every attempt fails and is retried
        let client = client("ws://127.0.0.1:9/ws/node", Some("secret")).with_retry_policy(
            RetryPolicy::new(Duration::from_millis(10), 1.0, Duration::from_millis(10)),
        );
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), client.run(shutdown))
            .await
            .unwrap();
        tokio_test::assert_ok!(result);
    }
}
