//! Message envelope and JSON codec
//!
//! Every frame is a JSON object with `type`, `messageId`, `timestamp` and a
//! `data` payload. Decoding looks `type` up in the registry first, then
//! parses `data` with that kind's schema, so a bad frame is reported with the
//! offending `messageId` whenever one could be read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::errors::{ErrorCode, ErrorDetails};
use super::payloads::{ErrorPayload, Payload};
use super::types::{MessagePriority, MessageType, ResourceRef};

/// Optional routing hints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<MessagePriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageType,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub resource: Option<ResourceRef>,
    pub metadata: Option<MessageMetadata>,
    pub payload: Payload,
}

/// Why a frame could not be turned into a [`Message`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("malformed message: {reason}")]
    Malformed {
        message_id: Option<String>,
        reason: String,
    },

    #[error("unknown message type '{kind}'")]
    UnknownType {
        message_id: Option<String>,
        kind: String,
    },

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload {
        message_id: Option<String>,
        kind: MessageType,
        reason: String,
    },
}

impl DecodeError {
    /// Id of the offending message, if it could be read
    pub fn message_id(&self) -> Option<&str> {
        match self {
            DecodeError::Malformed { message_id, .. }
            | DecodeError::UnknownType { message_id, .. }
            | DecodeError::InvalidPayload { message_id, .. } => message_id.as_deref(),
        }
    }

    /// Wire error reported back to the sender
    pub fn to_error_details(&self) -> ErrorDetails {
        ErrorDetails::new(ErrorCode::CommandInvalid, self.to_string())
    }

    /// `error` reply referencing the offending message
    pub fn to_reply(&self) -> Message {
        Message::error(self.message_id().map(str::to_string), self.to_error_details())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    message_id: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    resource: Option<ResourceRef>,
    #[serde(default)]
    metadata: Option<MessageMetadata>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope<'a> {
    #[serde(rename = "type")]
    kind: MessageType,
    message_id: &'a str,
    timestamp: DateTime<Utc>,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource: Option<&'a ResourceRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a MessageMetadata>,
}

impl Message {
    /// New message with a fresh id, stamped now
    pub fn new(payload: Payload) -> Self {
        Self {
            kind: payload.message_type(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            resource: None,
            metadata: None,
            payload,
        }
    }

    /// Controller → worker command targeting `resource`
    pub fn command(payload: Payload, resource: ResourceRef) -> Self {
        Self::new(payload).with_resource(resource)
    }

    /// `error` message, optionally referencing the message that caused it
    pub fn error(original_message_id: Option<String>, error: ErrorDetails) -> Self {
        Self::new(Payload::Error(ErrorPayload {
            original_message_id,
            error,
        }))
    }

    pub fn with_resource(mut self, resource: ResourceRef) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.get_or_insert_with(Default::default).correlation_id = Some(id.into());
        self
    }

    /// Reassign the timestamp; called right before a frame is written
    pub fn stamp(&mut self) {
        self.timestamp = Utc::now();
    }

    pub fn resource_id(&self) -> Option<&str> {
        self.resource.as_ref().map(|r| r.id.as_str())
    }

    /// `originalMessageId` of an ack, result or error
    pub fn original_message_id(&self) -> Option<&str> {
        match &self.payload {
            Payload::CommandAck(p) => Some(&p.original_message_id),
            Payload::CommandResult(p) => Some(&p.original_message_id),
            Payload::Error(p) => p.original_message_id.as_deref(),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let wire = WireEnvelope {
            kind: self.kind,
            message_id: &self.message_id,
            timestamp: self.timestamp,
            data: self.payload.to_value()?,
            resource: self.resource.as_ref(),
            metadata: self.metadata.as_ref(),
        };
        serde_json::to_string(&wire)
    }

    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text).map_err(|e| DecodeError::Malformed {
            message_id: None,
            reason: e.to_string(),
        })?;

        let message_id = value
            .get("messageId")
            .and_then(Value::as_str)
            .map(str::to_string);

        let raw: RawEnvelope =
            serde_json::from_value(value).map_err(|e| DecodeError::Malformed {
                message_id: message_id.clone(),
                reason: e.to_string(),
            })?;

        if raw.message_id.trim().is_empty() {
            return Err(DecodeError::Malformed {
                message_id: None,
                reason: "messageId must not be empty".to_string(),
            });
        }

        let kind: MessageType = raw.kind.parse().map_err(|_| DecodeError::UnknownType {
            message_id: message_id.clone(),
            kind: raw.kind.clone(),
        })?;

        let invalid = |reason: String| DecodeError::InvalidPayload {
            message_id: message_id.clone(),
            kind,
            reason,
        };

        if kind.is_command() && raw.resource.is_none() {
            return Err(invalid("commands must carry a resource".to_string()));
        }

        let payload = Payload::decode(kind, raw.data).map_err(|e| invalid(e.to_string()))?;
        payload.validate().map_err(invalid)?;

        Ok(Self {
            kind,
            message_id: raw.message_id,
            timestamp: raw.timestamp,
            resource: raw.resource,
            metadata: raw.metadata,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::payloads::{CommandAckPayload, DeploymentStopPayload, EmptyPayload};
    use serde_json::json;

    #[test]
    fn test_encode_decode() {
        let msg = Message::command(
            Payload::DeploymentStop(DeploymentStopPayload {
                force: true,
                timeout: Some(10),
            }),
            ResourceRef::deployment("d-1"),
        )
        .with_correlation_id("c-1");

        let text = msg.encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "deployment.stop");
        assert_eq!(value["resource"]["id"], "d-1");
        assert_eq!(value["data"]["force"], true);
        assert_eq!(value["metadata"]["correlationId"], "c-1");

        let decoded = Message::decode(&text).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_unknown_type_keeps_message_id() {
        let text = json!({
            "type": "deployment.explode",
            "messageId": "m-42",
            "timestamp": "2024-01-01T00:00:00Z",
            "data": {}
        })
        .to_string();

        let err = Message::decode(&text).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType { .. }));
        assert_eq!(err.message_id(), Some("m-42"));

        let reply = err.to_reply();
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.original_message_id(), Some("m-42"));
        match reply.payload {
            Payload::Error(p) => assert_eq!(p.error.code, ErrorCode::CommandInvalid),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_malformed_json() {
        let err = Message::decode("{not json").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
        assert_eq!(err.message_id(), None);
    }

    #[test]
    fn test_missing_timestamp() {
        let text = json!({"type": "telemetry.heartbeat", "messageId": "m-1"}).to_string();
        let err = Message::decode(&text).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
        assert_eq!(err.message_id(), Some("m-1"));
    }

    #[test]
    fn test_command_requires_resource() {
        let text = json!({
            "type": "deployment.restart",
            "messageId": "m-1",
            "timestamp": "2024-01-01T00:00:00Z"
        })
        .to_string();

        let err = Message::decode(&text).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPayload { .. }));
    }

    #[test]
    fn test_payload_validation_applies() {
        let text = json!({
            "type": "deployment.stop",
            "messageId": "m-1",
            "timestamp": "2024-01-01T00:00:00Z",
            "resource": {"type": "deployment", "id": "d-1"},
            "data": {"timeout": 1000}
        })
        .to_string();

        let err = Message::decode(&text).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::InvalidPayload {
                kind: MessageType::DeploymentStop,
                ..
            }
        ));
    }

    #[test]
    fn test_original_message_id() {
        let ack = Message::new(Payload::CommandAck(CommandAckPayload {
            original_message_id: "m-7".to_string(),
            status: Default::default(),
            estimated_duration: Some(5),
        }));
        assert_eq!(ack.original_message_id(), Some("m-7"));

        let other = Message::new(Payload::ModelList(EmptyPayload {}));
        assert_eq!(other.original_message_id(), None);
    }

    #[test]
    fn test_fresh_ids_are_unique() {
        let a = Message::new(Payload::SystemQuery(EmptyPayload {}));
        let b = Message::new(Payload::SystemQuery(EmptyPayload {}));
        assert_ne!(a.message_id, b.message_id);
    }
}
