//! Structured errors shared by the VM, dispatcher and engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Classification of execution errors.
///
/// The kind decides how the engine reacts: retry, recover with a patched
/// plan, or terminate the branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Plan failed static checks.
    Validation,
    /// Reference to an absent variable in arithmetic or sole-token context.
    UnresolvedVariable,
    /// Tool missing from the registry.
    ToolNotFound,
    /// Tool exists but is outside the task's namespace.
    ToolNotAllowed,
    /// Tool handler raised.
    ToolFailed,
    /// LLM reply could not be parsed to the expected shape.
    LlmParse,
    /// Per-call deadline exceeded.
    Timeout,
    /// External cancellation.
    Cancelled,
    /// Invariant violation inside the engine.
    Internal,
}

impl ErrorKind {
    /// Whether a single transparent retry is worth attempting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ToolFailed | ErrorKind::Timeout)
    }

    /// Whether the error ends the task without recovery.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorKind::Cancelled | ErrorKind::Internal)
    }
}

/// A structured execution error.
///
/// Serializable so it can be embedded in `last_error` of a VM snapshot and
/// in commit details.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct VmError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_no: Option<i64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl VmError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            seq_no: None,
            details: Value::Null,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn unresolved(name: &str) -> Self {
        Self::new(
            ErrorKind::UnresolvedVariable,
            format!("variable '{}' is not defined", name),
        )
    }

    pub fn tool_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolFailed, message)
    }

    pub fn llm_parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LlmParse, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "task was cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attach the sequence number of the failing instruction.
    pub fn at_seq(mut self, seq_no: i64) -> Self {
        self.seq_no = Some(seq_no);
        self
    }

    /// Attach structured context for recovery prompts.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert!(ErrorKind::ToolFailed.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::UnresolvedVariable.is_retryable());

        assert!(ErrorKind::Cancelled.is_terminal());
        assert!(ErrorKind::Internal.is_terminal());
        assert!(!ErrorKind::ToolFailed.is_terminal());
    }

    #[test]
    fn test_error_round_trips_through_json() {
        let err = VmError::unresolved("x")
            .at_seq(5)
            .with_details(serde_json::json!({"instruction": "assign"}));
        let json = serde_json::to_string(&err).unwrap();
        let back: VmError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, ErrorKind::UnresolvedVariable);
        assert_eq!(back.seq_no, Some(5));
        assert_eq!(back.details["instruction"], "assign");
    }
}
