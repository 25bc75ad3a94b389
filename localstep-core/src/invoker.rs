//! The seam between Task states and whatever does the work.

use crate::error::TaskFailure;
use async_trait::async_trait;
use serde_json::Value;

/// Dispatches the work of a Task state.
///
/// A returned [`TaskFailure`] goes through the state's retriers and
/// catchers; its `error` is the name they match on.
#[async_trait]
pub trait TaskInvoker: Send + Sync {
    async fn invoke(&self, resource: &str, input: Value) -> Result<Value, TaskFailure>;
}

/// Returns every Task's input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoInvoker;

#[async_trait]
impl TaskInvoker for EchoInvoker {
    async fn invoke(&self, _resource: &str, input: Value) -> Result<Value, TaskFailure> {
        Ok(input)
    }
}
