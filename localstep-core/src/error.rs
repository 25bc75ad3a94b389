//! Core error types.

use thiserror::Error;

/// Error names defined by the States language.
pub mod codes {
    /// Wildcard matching any error name.
    pub const ALL: &str = "States.ALL";
    /// Matches any error except `States.Timeout`.
    pub const TASK_FAILED: &str = "States.TaskFailed";
    /// Runtime failure (bad path, non-array Map input, ...).
    pub const RUNTIME: &str = "States.Runtime";
    /// No Choice rule matched and no default was declared.
    pub const NO_CHOICE_MATCHED: &str = "States.NoChoiceMatched";
    /// Default error of a Fail state.
    pub const FAIL: &str = "States.Fail";
    /// A Task ran longer than its `TimeoutSeconds`.
    pub const TIMEOUT: &str = "States.Timeout";
}

/// Errors from the workflow engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid state machine definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("execution is not running: {execution_arn}")]
    ExecutionNotRunning { execution_arn: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub(crate) fn definition(reason: impl Into<String>) -> Self {
        CoreError::InvalidDefinition {
            reason: reason.into(),
        }
    }

    /// Returns an error code suitable for service responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidDefinition { .. } => "InvalidDefinition",
            CoreError::InvalidPath { .. } => "InvalidDefinition",
            CoreError::ExecutionNotRunning { .. } => "ExecutionNotRunning",
            CoreError::Json(_) => "InvalidDefinition",
        }
    }
}

/// A named failure raised while running a state.
///
/// Task invokers return it, and the engine raises it for its own
/// `States.*` conditions. Retriers and catchers match on `error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}: {cause}")]
pub struct TaskFailure {
    pub error: String,
    pub cause: String,
}

impl TaskFailure {
    pub fn new(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            cause: cause.into(),
        }
    }

    pub fn runtime(cause: impl Into<String>) -> Self {
        Self::new(codes::RUNTIME, cause)
    }

    /// Returns true if `error_equals` selects this failure.
    pub fn matches(&self, error_equals: &[String]) -> bool {
        error_equals.iter().any(|name| match name.as_str() {
            codes::ALL => true,
            codes::TASK_FAILED => self.error != codes::TIMEOUT,
            other => other == self.error,
        })
    }
}

impl From<CoreError> for TaskFailure {
    fn from(e: CoreError) -> Self {
        TaskFailure::runtime(e.to_string())
    }
}
