//! Provider error types.

use thiserror::Error;

/// Errors returned by the Step Functions API surface.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("state machine does not exist: {0}")]
    StateMachineDoesNotExist(String),

    #[error("state machine already exists: {0}")]
    StateMachineAlreadyExists(String),

    #[error("execution does not exist: {0}")]
    ExecutionDoesNotExist(String),

    #[error("execution already exists: {0}")]
    ExecutionAlreadyExists(String),

    #[error("invalid state machine definition: {0}")]
    InvalidDefinition(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid ARN: {0}")]
    InvalidArn(String),

    #[error("invalid execution input: {0}")]
    InvalidExecutionInput(String),
}

impl ProviderError {
    /// Returns the AWS error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            ProviderError::StateMachineDoesNotExist(_) => "StateMachineDoesNotExist",
            ProviderError::StateMachineAlreadyExists(_) => "StateMachineAlreadyExists",
            ProviderError::ExecutionDoesNotExist(_) => "ExecutionDoesNotExist",
            ProviderError::ExecutionAlreadyExists(_) => "ExecutionAlreadyExists",
            ProviderError::InvalidDefinition(_) => "InvalidDefinition",
            ProviderError::InvalidName(_) => "InvalidName",
            ProviderError::InvalidArn(_) => "InvalidArn",
            ProviderError::InvalidExecutionInput(_) => "InvalidExecutionInput",
        }
    }

    /// Returns whether the caller sent a bad request, as opposed to naming
    /// something that does not exist.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ProviderError::InvalidDefinition(_)
                | ProviderError::InvalidName(_)
                | ProviderError::InvalidArn(_)
                | ProviderError::InvalidExecutionInput(_)
        )
    }
}

impl From<localstep_core::CoreError> for ProviderError {
    fn from(e: localstep_core::CoreError) -> Self {
        ProviderError::InvalidDefinition(e.to_string())
    }
}
