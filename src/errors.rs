//! Closed error taxonomy shared by every provider, the runner, and both transports.
//!
//! Two tiers exist in the wire protocol: malformed JSON-RPC frames and unknown
//! methods are protocol errors (handled by the transport layer, `-32600`
//! range); everything a tool/provider can fail with is a [`ToolError`] and is
//! returned as a *successful* `tools/call` result with `is_error: true`, per
//! the teacher's own `CallToolResult::error` convention in `server.rs`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of error codes a tool call can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ToolNotFound,
    NoBackends,
    BackendOverrideInvalid,
    BackendOverrideNoMatch,
    ValidationInput,
    ValidationOutput,
    ExecutionFailed,
    StreamNotSupported,
    StreamFailed,
    ChainStepFailed,
    Cancelled,
    Timeout,
    Internal,
}

impl ErrorCode {
    /// Whether a failure with this code is safe to retry against the same backend.
    ///
    /// `timeout` and `no_backends` are transient by nature; everything that
    /// reflects a caller mistake (bad input, unknown tool, mismatched
    /// override) is not.
    pub fn retryable(self) -> bool {
        matches!(self, ErrorCode::Timeout | ErrorCode::NoBackends)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::ToolNotFound => "tool_not_found",
            ErrorCode::NoBackends => "no_backends",
            ErrorCode::BackendOverrideInvalid => "backend_override_invalid",
            ErrorCode::BackendOverrideNoMatch => "backend_override_no_match",
            ErrorCode::ValidationInput => "validation_input",
            ErrorCode::ValidationOutput => "validation_output",
            ErrorCode::ExecutionFailed => "execution_failed",
            ErrorCode::StreamNotSupported => "stream_not_supported",
            ErrorCode::StreamFailed => "stream_failed",
            ErrorCode::ChainStepFailed => "chain_step_failed",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Structured error object returned from a provider's `Handle`.
///
/// `details` must never carry secret-resolved values — resolvers redact
/// before a value can reach an error string (see `secrets::resolver`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ToolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            retryable: code.retryable(),
            code,
            message: message.into(),
            tool_id: None,
            op: None,
            backend_kind: None,
            step_index: None,
            details: None,
        }
    }

    pub fn tool_not_found(tool_id: impl Into<String>) -> Self {
        let tool_id = tool_id.into();
        Self::new(
            ErrorCode::ToolNotFound,
            format!("tool '{tool_id}' not found"),
        )
        .with_tool_id(tool_id)
    }

    pub fn no_backends(tool_id: impl Into<String>) -> Self {
        let tool_id = tool_id.into();
        Self::new(
            ErrorCode::NoBackends,
            format!("tool '{tool_id}' has no enabled backends"),
        )
        .with_tool_id(tool_id)
    }

    pub fn backend_override_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BackendOverrideInvalid, message)
    }

    pub fn backend_override_no_match(tool_id: impl Into<String>) -> Self {
        let tool_id = tool_id.into();
        Self::new(
            ErrorCode::BackendOverrideNoMatch,
            format!("backend_override did not match any backend registered for '{tool_id}'"),
        )
        .with_tool_id(tool_id)
    }

    pub fn validation_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationInput, message)
    }

    pub fn validation_output(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationOutput, message)
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExecutionFailed, message)
    }

    pub fn chain_step_failed(step_index: usize, inner: ToolError) -> Self {
        let mut err = Self::new(
            ErrorCode::ChainStepFailed,
            format!("chain step {step_index} failed: {}", inner.message),
        );
        err.step_index = Some(step_index);
        err.details = Some(serde_json::to_value(&inner).unwrap_or(serde_json::Value::Null));
        err
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn with_tool_id(mut self, tool_id: impl Into<String>) -> Self {
        self.tool_id = Some(tool_id.into());
        self
    }

    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    pub fn with_backend_kind(mut self, kind: impl Into<String>) -> Self {
        self.backend_kind = Some(kind.into());
        self
    }

    /// Wrap an `anyhow::Error` from a backend call as `execution_failed`,
    /// unless its message already matches a more specific code (stopped
    /// backend, timeout) that callers can inspect via string content today
    /// (the backend layer does not yet carry typed errors end to end).
    pub fn from_backend_error(tool_id: &str, backend_kind: &str, err: &anyhow::Error) -> Self {
        let msg = err.to_string();
        if msg.contains("timed out") || msg.contains("timeout") {
            Self::timeout(msg).with_tool_id(tool_id).with_backend_kind(backend_kind)
        } else {
            Self::execution_failed(msg)
                .with_tool_id(tool_id)
                .with_backend_kind(backend_kind)
        }
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ToolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_codes() {
        assert!(ErrorCode::Timeout.retryable());
        assert!(ErrorCode::NoBackends.retryable());
        assert!(!ErrorCode::ValidationInput.retryable());
        assert!(!ErrorCode::ToolNotFound.retryable());
    }

    #[test]
    fn test_chain_step_failed_carries_index_and_inner() {
        let inner = ToolError::execution_failed("boom");
        let err = ToolError::chain_step_failed(2, inner);
        assert_eq!(err.code, ErrorCode::ChainStepFailed);
        assert_eq!(err.step_index, Some(2));
        assert!(err.details.is_some());
    }

    #[test]
    fn test_serializes_snake_case() {
        let err = ToolError::tool_not_found("search:web");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "tool_not_found");
        assert_eq!(json["tool_id"], "search:web");
    }

    #[test]
    fn test_from_backend_error_timeout() {
        let err = anyhow::anyhow!("request timed out after 30s");
        let t = ToolError::from_backend_error("ns:tool", "local", &err);
        assert_eq!(t.code, ErrorCode::Timeout);
    }
}
