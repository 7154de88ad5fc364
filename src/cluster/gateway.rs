//! WebSocket endpoint workers connect to
//!
//! The socket is split in two: a writer task drains the session's outbound
//! queue, while the reader loop feeds frames to [`ControllerSession`]. The
//! session's cancellation token stops both when a reconnect supersedes it.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::api::ControlPlaneState;
use super::auth::bearer_token;
use super::controller::ClusterController;
use super::session::ControllerSession;
use crate::config::NODE_SOCKET_PATH;
use crate::protocol::{
    ConnectionAckPayload, ErrorDetails, Message, Payload, ReplyStatus, PROTOCOL_VERSION,
};

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    token: Option<String>,
}

/// Routes for the worker socket
pub fn node_socket_routes() -> Router<ControlPlaneState> {
    Router::new().route(NODE_SOCKET_PATH, get(node_socket))
}

async fn node_socket(
    ws: WebSocketUpgrade,
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Query(query): Query<SocketQuery>,
) -> Response {
    let token = presented_token(&headers, query.token);
    let controller = Arc::clone(&state.controller);
    ws.on_upgrade(move |socket| serve_socket(controller, socket, token))
}

/// Bearer header first, then the `token` query parameter
fn presented_token(headers: &HeaderMap, query_token: Option<String>) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
        .or_else(|| query_token.filter(|t| !t.is_empty()))
}

async fn serve_socket(controller: Arc<ClusterController>, socket: WebSocket, token: Option<String>) {
    let (mut sink, mut stream) = socket.split();

    let node = match controller.authenticator().authenticate_node(token.as_deref()) {
        Ok(node) => node,
        Err(e) => {
            warn!("Rejected worker connection: {}", e);
            let reply = Message::new(Payload::ConnectionAck(ConnectionAckPayload {
                status: ReplyStatus::Error,
                node_id: None,
                controller_id: Some(controller.config().controller_id.clone()),
                server_version: Some(PROTOCOL_VERSION.to_string()),
                error: Some(ErrorDetails::new(e.code(), e.to_string())),
            }));
            if let Ok(text) = reply.encode() {
                let _ = sink.send(WsMessage::Text(text.into())).await;
            }
            let _ = sink.send(WsMessage::Close(None)).await;
            return;
        }
    };

    let node_id = node.node_id.clone();
    let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();
    let cancel = CancellationToken::new();
    let session_id = controller
        .sessions()
        .attach(&node_id, outbound.clone(), cancel.clone());
    info!("Node {} connected (session {})", node_id, session_id);

    let _ = outbound.send(controller.connection_ack(&node_id));

    let writer = {
        let cancel = cancel.clone();
        let node_id = node_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = queue.recv() => {
                        let Some(mut message) = next else { break };
                        message.stamp();
                        match message.encode() {
                            Ok(text) => {
                                if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                                    debug!("Write to {} failed: {}", node_id, e);
                                    break;
                                }
                            }
                            Err(e) => error!("Failed to encode {} for {}: {}", message.kind, node_id, e),
                        }
                    }
                }
            }
            let _ = sink.send(WsMessage::Close(None)).await;
        })
    };

    let mut session =
        ControllerSession::new(Arc::clone(&controller), node, session_id.clone(), outbound);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Session {} for {} superseded", session_id, node_id);
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => session.handle_text(text.as_str()).await,
                Some(Ok(WsMessage::Binary(_))) => {
                    warn!("Ignoring binary frame from {}", node_id);
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Socket error from {}: {}", node_id, e);
                    break;
                }
            }
        }
    }

    session.close();
    cancel.cancel();
    let _ = writer.await;

    if controller.sessions().detach(&node_id, &session_id) {
        controller.on_disconnect(&node_id, Utc::now());
    } else {
        debug!(
            "Superseded session {} for {} closed, node stays online",
            session_id, node_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_header_token_preferred() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-header"),
        );
        assert_eq!(
            presented_token(&headers, Some("from-query".to_string())).as_deref(),
            Some("from-header")
        );
    }

    #[test]
    fn test_query_token_fallback() {
        let headers = HeaderMap::new();
        assert_eq!(
            presented_token(&headers, Some("from-query".to_string())).as_deref(),
            Some("from-query")
        );
        assert_eq!(presented_token(&headers, Some(String::new())), None);
        assert_eq!(presented_token(&headers, None), None);

        let mut basic = HeaderMap::new();
        basic.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(presented_token(&basic, None), None);
    }
}
