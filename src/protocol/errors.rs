//! Wire error taxonomy
//!
//! Codes are namespaced by category: authentication `1xxx`, command `2xxx`,
//! system `3xxx`. Each code carries a fixed `retryable` flag that callers
//! honor when deciding whether to re-send.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Category a code belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Fatal to the session; it is closed
    Authentication,
    /// Fatal to the command only
    Command,
    /// Generally retryable infrastructure failures
    System,
}

/// Every error code that may appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ErrorCode {
    // Authentication
    MissingToken,
    InvalidToken,
    ExpiredToken,
    NodeNotFound,
    NodeInactive,
    MissingRole,
    DuplicateConnection,

    // Command
    CommandInvalid,
    DeploymentNotFound,
    ModelNotFound,
    GpuUnavailable,
    InsufficientMemory,
    ContainerStartFailed,
    AlreadyRunning,
    NotRunning,

    // System
    InternalError,
    Timeout,
    ResourceExhausted,
    NetworkError,
}

impl ErrorCode {
    /// Numeric code as it appears on the wire
    pub fn code(&self) -> u16 {
        match self {
            ErrorCode::MissingToken => 1001,
            ErrorCode::InvalidToken => 1002,
            ErrorCode::ExpiredToken => 1003,
            ErrorCode::NodeNotFound => 1004,
            ErrorCode::NodeInactive => 1005,
            ErrorCode::MissingRole => 1006,
            ErrorCode::DuplicateConnection => 1007,
            ErrorCode::CommandInvalid => 2001,
            ErrorCode::DeploymentNotFound => 2002,
            ErrorCode::ModelNotFound => 2003,
            ErrorCode::GpuUnavailable => 2004,
            ErrorCode::InsufficientMemory => 2005,
            ErrorCode::ContainerStartFailed => 2006,
            ErrorCode::AlreadyRunning => 2007,
            ErrorCode::NotRunning => 2008,
            ErrorCode::InternalError => 3001,
            ErrorCode::Timeout => 3002,
            ErrorCode::ResourceExhausted => 3003,
            ErrorCode::NetworkError => 3004,
        }
    }

    /// Look a code up by its numeric value
    pub fn from_code(code: u16) -> Option<Self> {
        let found = match code {
            1001 => ErrorCode::MissingToken,
            1002 => ErrorCode::InvalidToken,
            1003 => ErrorCode::ExpiredToken,
            1004 => ErrorCode::NodeNotFound,
            1005 => ErrorCode::NodeInactive,
            1006 => ErrorCode::MissingRole,
            1007 => ErrorCode::DuplicateConnection,
            2001 => ErrorCode::CommandInvalid,
            2002 => ErrorCode::DeploymentNotFound,
            2003 => ErrorCode::ModelNotFound,
            2004 => ErrorCode::GpuUnavailable,
            2005 => ErrorCode::InsufficientMemory,
            2006 => ErrorCode::ContainerStartFailed,
            2007 => ErrorCode::AlreadyRunning,
            2008 => ErrorCode::NotRunning,
            3001 => ErrorCode::InternalError,
            3002 => ErrorCode::Timeout,
            3003 => ErrorCode::ResourceExhausted,
            3004 => ErrorCode::NetworkError,
            _ => return None,
        };
        Some(found)
    }

    pub fn category(&self) -> ErrorCategory {
        match self.code() / 1000 {
            1 => ErrorCategory::Authentication,
            2 => ErrorCategory::Command,
            _ => ErrorCategory::System,
        }
    }

    /// Fixed retry policy for this code
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ExpiredToken
                | ErrorCode::GpuUnavailable
                | ErrorCode::InsufficientMemory
                | ErrorCode::ContainerStartFailed
                | ErrorCode::InternalError
                | ErrorCode::Timeout
                | ErrorCode::ResourceExhausted
                | ErrorCode::NetworkError
        )
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::MissingToken => "Authentication token is missing",
            ErrorCode::InvalidToken => "Authentication token is invalid",
            ErrorCode::ExpiredToken => "Authentication token has expired",
            ErrorCode::NodeNotFound => "Node is not known to the controller",
            ErrorCode::NodeInactive => "Node is disabled",
            ErrorCode::MissingRole => "Caller lacks the required role",
            ErrorCode::DuplicateConnection => "Node already has an active connection",
            ErrorCode::CommandInvalid => "Command is invalid",
            ErrorCode::DeploymentNotFound => "Deployment not found",
            ErrorCode::ModelNotFound => "Model not found",
            ErrorCode::GpuUnavailable => "Requested GPU is unavailable",
            ErrorCode::InsufficientMemory => "Insufficient GPU memory",
            ErrorCode::ContainerStartFailed => "Container failed to start",
            ErrorCode::AlreadyRunning => "Deployment is already running",
            ErrorCode::NotRunning => "Deployment is not running",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::Timeout => "Operation timed out",
            ErrorCode::ResourceExhausted => "Resource exhausted",
            ErrorCode::NetworkError => "Network error",
        }
    }

    /// HTTP status code equivalent, where one exists
    pub fn http_equivalent(&self) -> Option<u16> {
        match self {
            ErrorCode::MissingToken | ErrorCode::InvalidToken | ErrorCode::ExpiredToken => {
                Some(401)
            }
            ErrorCode::NodeNotFound => Some(404),
            ErrorCode::NodeInactive | ErrorCode::MissingRole => Some(403),
            ErrorCode::DuplicateConnection => Some(409),
            ErrorCode::InternalError => Some(500),
            ErrorCode::Timeout => Some(504),
            ErrorCode::ResourceExhausted => Some(503),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.code().to_string()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value
            .parse::<u16>()
            .ok()
            .and_then(ErrorCode::from_code)
            .ok_or_else(|| format!("unknown error code '{}'", value))
    }
}

/// Error payload carried by `error` messages and failed `command.result`s
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub retryable: bool,
    /// Seconds the caller should wait before retrying
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorDetails {
    /// Build details with the code's default message and fixed retry flag
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retryable: code.retryable(),
            retry_after: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_flags() {
        let retryable = [1003, 2004, 2005, 2006, 3001, 3002, 3003, 3004];
        let fixed = [
            1001, 1002, 1004, 1005, 1006, 1007, 2001, 2002, 2003, 2007, 2008,
        ];

        for code in retryable {
            assert!(ErrorCode::from_code(code).unwrap().retryable(), "{}", code);
        }
        for code in fixed {
            assert!(!ErrorCode::from_code(code).unwrap().retryable(), "{}", code);
        }
    }

    #[test]
    fn test_code_roundtrip() {
        for code in (1001..=1007).chain(2001..=2008).chain(3001..=3004) {
            assert_eq!(ErrorCode::from_code(code).unwrap().code(), code);
        }
        assert!(ErrorCode::from_code(4001).is_none());
    }

    #[test]
    fn test_command_codes_match_wire_values() {
        assert_eq!(ErrorCode::from_code(2002), Some(ErrorCode::DeploymentNotFound));
        assert_eq!(ErrorCode::from_code(2003), Some(ErrorCode::ModelNotFound));
        assert_eq!(ErrorCode::ModelNotFound.default_message(), "Model not found");
        assert!(!ErrorCode::DeploymentNotFound.retryable());
        assert!(!ErrorCode::ModelNotFound.retryable());

        let json = serde_json::to_value(ErrorDetails::from_code(ErrorCode::ModelNotFound)).unwrap();
        assert_eq!(json["code"], "2003");
    }

    #[test]
    fn test_categories() {
        assert_eq!(ErrorCode::InvalidToken.category(), ErrorCategory::Authentication);
        assert_eq!(ErrorCode::NotRunning.category(), ErrorCategory::Command);
        assert_eq!(ErrorCode::NetworkError.category(), ErrorCategory::System);
    }

    #[test]
    fn test_http_equivalents() {
        assert_eq!(ErrorCode::MissingToken.http_equivalent(), Some(401));
        assert_eq!(ErrorCode::NodeNotFound.http_equivalent(), Some(404));
        assert_eq!(ErrorCode::NodeInactive.http_equivalent(), Some(403));
        assert_eq!(ErrorCode::DuplicateConnection.http_equivalent(), Some(409));
        assert_eq!(ErrorCode::Timeout.http_equivalent(), Some(504));
        assert_eq!(ErrorCode::CommandInvalid.http_equivalent(), None);
    }

    #[test]
    fn test_details_serialization() {
        let details = ErrorDetails::from_code(ErrorCode::GpuUnavailable).with_retry_after(30);
        let json = serde_json::to_value(&details).unwrap();

        assert_eq!(json["code"], "2004");
        assert_eq!(json["retryable"], true);
        assert_eq!(json["retryAfter"], 30);
        assert!(json.get("details").is_none());

        let parsed: ErrorDetails = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, details);
    }

    #[test]
    fn test_unknown_code_rejected() {
        let result: Result<ErrorDetails, _> = serde_json::from_str(
            r#"{"code":"9999","message":"x","retryable":false}"#,
        );
        assert!(result.is_err());
    }
}
