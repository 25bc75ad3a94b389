//! Execution records and the shared execution handle.

use crate::definition::StateMachineDefinition;
use crate::error::{CoreError, TaskFailure};
use crate::signal::AbortSignal;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Succeeded => "SUCCEEDED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Aborted => "ABORTED",
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(ExecutionStatus::Running),
            "SUCCEEDED" => Ok(ExecutionStatus::Succeeded),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "ABORTED" => Ok(ExecutionStatus::Aborted),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// One retry scheduled by a retrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    /// Error that triggered the retry.
    pub error: String,
    /// 1-based retry number for the matching retrier.
    pub attempt: u32,
    /// Declared delay, before the local wait ceiling is applied.
    pub delay_seconds: f64,
}

/// Record of one visited state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state_name: String,
    pub state_type: String,
    pub input_data: Value,
    pub output_data: Value,
    /// When the state was entered.
    pub timestamp: DateTime<Utc>,

    /// Per-branch (Parallel) or per-item (Map) transitions of the last attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Vec<StateTransition>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retries: Vec<RetryRecord>,

    /// Declared wait of a Wait state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_seconds: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl StateTransition {
    pub fn new(
        state_name: impl Into<String>,
        state_type: impl Into<String>,
        input_data: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            state_name: state_name.into(),
            state_type: state_type.into(),
            input_data,
            output_data: Value::Null,
            timestamp,
            branches: Vec::new(),
            retries: Vec::new(),
            wait_seconds: None,
            error: None,
            cause: None,
        }
    }

    pub(crate) fn set_failure(&mut self, failure: &TaskFailure) {
        self.error = Some(failure.error.clone());
        self.cause = Some(failure.cause.clone());
    }
}

/// Full record of one run of a state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionHistory {
    pub execution_arn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_machine_arn: Option<String>,
    pub name: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub error: Option<String>,
    pub cause: Option<String>,
    pub transitions: Vec<StateTransition>,
}

impl ExecutionHistory {
    /// Creates a `RUNNING` history.
    pub fn new(
        execution_arn: impl Into<String>,
        state_machine_arn: Option<String>,
        name: impl Into<String>,
        input_data: Value,
    ) -> Self {
        Self {
            execution_arn: execution_arn.into(),
            state_machine_arn,
            name: name.into(),
            status: ExecutionStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            input_data,
            output_data: None,
            error: None,
            cause: None,
            transitions: Vec::new(),
        }
    }

    fn close(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
    }
}

/// A live execution shared between the engine task and its observers.
///
/// Every mutation checks the status under the write lock, so nothing is
/// recorded once the history has left `RUNNING`.
#[derive(Debug)]
pub struct Execution {
    arn: String,
    definition: Arc<StateMachineDefinition>,
    history: RwLock<ExecutionHistory>,
    signal: AbortSignal,
}

impl Execution {
    pub fn new(history: ExecutionHistory, definition: Arc<StateMachineDefinition>) -> Self {
        Self {
            arn: history.execution_arn.clone(),
            definition,
            history: RwLock::new(history),
            signal: AbortSignal::new(),
        }
    }

    /// Returns the execution ARN.
    pub fn arn(&self) -> &str {
        &self.arn
    }

    /// The definition this execution was started with.
    pub fn definition(&self) -> &Arc<StateMachineDefinition> {
        &self.definition
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Returns the current status.
    pub fn status(&self) -> ExecutionStatus {
        self.history.read().status
    }

    /// Returns a copy of the execution input.
    pub fn input(&self) -> Value {
        self.history.read().input_data.clone()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.history.read().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.history.read().end_time
    }

    /// Returns a copy of the current history.
    pub fn snapshot(&self) -> ExecutionHistory {
        self.history.read().clone()
    }

    /// Moves a running execution to `ABORTED` and fires its abort signal.
    pub fn stop(
        &self,
        error: Option<String>,
        cause: Option<String>,
    ) -> Result<DateTime<Utc>, CoreError> {
        let stopped_at = {
            let mut history = self.history.write();
            if history.status.is_terminal() {
                return Err(CoreError::ExecutionNotRunning {
                    execution_arn: self.arn.clone(),
                });
            }
            history.close(ExecutionStatus::Aborted);
            history.error = error;
            history.cause = cause;
            history.end_time.unwrap_or_else(Utc::now)
        };
        self.signal.abort();
        tracing::warn!("Execution {} aborted", self.arn);
        Ok(stopped_at)
    }

    /// Appends a transition. Returns false once the execution is terminal.
    pub(crate) fn record(&self, transition: StateTransition) -> bool {
        let mut history = self.history.write();
        if history.status.is_terminal() {
            return false;
        }
        history.transitions.push(transition);
        true
    }

    pub(crate) fn succeed(&self, output: Value) -> bool {
        let mut history = self.history.write();
        if history.status.is_terminal() {
            return false;
        }
        history.close(ExecutionStatus::Succeeded);
        history.output_data = Some(output);
        true
    }

    pub(crate) fn fail(&self, failure: TaskFailure) -> bool {
        let mut history = self.history.write();
        if history.status.is_terminal() {
            return false;
        }
        history.close(ExecutionStatus::Failed);
        history.error = Some(failure.error);
        history.cause = Some(failure.cause);
        true
    }
}
