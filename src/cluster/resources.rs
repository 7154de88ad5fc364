//! REST response envelopes

use serde::{Deserialize, Serialize};

use crate::protocol::ErrorDetails;

/// API version stamped on every list
pub const API_VERSION: &str = "nodelink/v1";

/// A list of resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceList<T> {
    /// API version
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Kind (e.g., "NodeList", "DeploymentList")
    pub kind: String,

    /// List of items
    pub items: Vec<T>,
}

impl<T> ResourceList<T> {
    pub fn new(kind: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: kind.into(),
            items,
        }
    }
}

/// Outcome of a REST operation that has no resource to return
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStatus {
    pub success: bool,

    pub message: String,

    /// Protocol error, when the operation failed with one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl OperationStatus {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            details: None,
        }
    }

    pub fn failure(error: ErrorDetails) -> Self {
        Self {
            success: false,
            message: error.message.clone(),
            error: Some(error),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
