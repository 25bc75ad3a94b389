//! # localstep-core
//!
//! Workflow engine for localstep.
//!
//! This crate provides:
//! - Amazon States Language definition parsing and validation
//! - Reference paths and payload templates
//! - Choice rule evaluation
//! - The execution engine with retry, catch, Parallel and Map support
//! - Execution histories and the task invoker seam

pub mod choice;
pub mod definition;
pub mod engine;
pub mod error;
pub mod history;
pub mod invoker;
pub mod path;
pub mod payload;
pub mod signal;

pub use choice::{
    evaluate_choice_rules, evaluate_choice_rules_with_context, evaluate_rule, ChoiceRule,
    ComparisonOperator, Condition,
};
pub use definition::{
    parse_definition, parse_definition_str, State, StateKind, StateMachineDefinition, Transition,
};
pub use engine::{execute, EngineConfig, ExecutionEngine, ExecutionOptions};
pub use error::{CoreError, TaskFailure};
pub use history::{Execution, ExecutionHistory, ExecutionStatus, RetryRecord, StateTransition};
pub use invoker::{EchoInvoker, TaskInvoker};
pub use path::JsonPath;
pub use payload::PayloadTemplate;
pub use signal::AbortSignal;
