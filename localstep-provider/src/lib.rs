//! # localstep-provider
//!
//! Step Functions API surface for localstep.
//!
//! This crate provides:
//! - State machine registry with revision tracking
//! - Asynchronous and synchronous executions
//! - ARN construction and name validation
//! - Mock Task responses loaded from configuration
//! - YAML configuration with environment overrides
//! - Background retention of finished executions

pub mod arn;
pub mod config;
pub mod error;
pub mod mock;
pub mod provider;
pub mod retention;

pub use config::{Config, ConfigError, EngineSection, MocksConfig, ProviderConfig, RetentionConfig};
pub use error::ProviderError;
pub use mock::{MockError, MockInvocation, MockResponse, MockTaskInvoker};
pub use provider::{
    CreateStateMachineOutput, ExecutionDescription, ExecutionListItem, StartExecutionOutput,
    StateMachineDescription, StateMachineListItem, StepFunctionsProvider, StopExecutionOutput,
    UpdateStateMachineOutput,
};
pub use retention::{RetentionManager, RetentionStats};
