//! Credential verification
//!
//! Workers present a bearer token during the WebSocket handshake; REST
//! callers present an API key. Both are compared as SHA-256 hex digests so
//! configuration never holds a secret in clear.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::scope::{Ownership, Role};
use crate::config::{ApiKeyConfig, NodeCredential};
use crate::protocol::ErrorCode;

/// Verified identity of a REST caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl CallerIdentity {
    /// Whether any held role allows issuing commands
    pub fn can_write(&self) -> bool {
        self.roles
            .iter()
            .filter_map(|r| r.parse::<Role>().ok())
            .any(|r| r.can_write())
    }
}

/// Verified identity of a worker node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: String,
    pub owner: Ownership,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authentication token is missing")]
    MissingToken,

    #[error("Authentication token is invalid")]
    InvalidToken,

    #[error("Node '{0}' is disabled")]
    NodeInactive(String),
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::MissingToken => ErrorCode::MissingToken,
            AuthError::InvalidToken => ErrorCode::InvalidToken,
            AuthError::NodeInactive(_) => ErrorCode::NodeInactive,
        }
    }
}

/// Turns presented credentials into verified identities
pub trait Authenticator: Send + Sync {
    fn authenticate_node(&self, token: Option<&str>) -> Result<NodeIdentity, AuthError>;

    fn authenticate_caller(&self, api_key: Option<&str>) -> Result<CallerIdentity, AuthError>;
}

/// Lowercase hex SHA-256 of a token
pub fn token_digest(token: &str) -> String {
    Sha256::digest(token.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Pull a bearer token out of an `Authorization` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Authenticator backed by digests from the controller config
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    nodes: HashMap<String, NodeCredential>,
    api_keys: HashMap<String, CallerIdentity>,
}

impl StaticAuthenticator {
    pub fn new(nodes: &[NodeCredential], api_keys: &[ApiKeyConfig]) -> Self {
        Self {
            nodes: nodes
                .iter()
                .map(|c| (c.token_sha256.to_ascii_lowercase(), c.clone()))
                .collect(),
            api_keys: api_keys
                .iter()
                .map(|k| (k.key_sha256.to_ascii_lowercase(), k.identity.clone()))
                .collect(),
        }
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate_node(&self, token: Option<&str>) -> Result<NodeIdentity, AuthError> {
        let token = token.ok_or(AuthError::MissingToken)?;
        let credential = self
            .nodes
            .get(&token_digest(token))
            .ok_or(AuthError::InvalidToken)?;

        if !credential.active {
            return Err(AuthError::NodeInactive(credential.node_id.clone()));
        }

        Ok(NodeIdentity {
            node_id: credential.node_id.clone(),
            owner: Ownership {
                org_id: credential.org_id.clone(),
                group_id: credential.group_id.clone(),
                user_id: credential.user_id.clone(),
            },
        })
    }

    fn authenticate_caller(&self, api_key: Option<&str>) -> Result<CallerIdentity, AuthError> {
        let key = api_key.ok_or(AuthError::MissingToken)?;
        self.api_keys
            .get(&token_digest(key))
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}
