//! Canned Task responses for local runs.

use crate::config::MocksConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use localstep_core::error::codes;
use localstep_core::{TaskFailure, TaskInvoker};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One scripted outcome of a Task invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MockResponse {
    Return(Value),
    Throw(MockError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockError {
    #[serde(rename = "Error")]
    pub error: String,
    #[serde(rename = "Cause", default)]
    pub cause: String,
}

impl MockResponse {
    pub fn throw(error: impl Into<String>, cause: impl Into<String>) -> Self {
        MockResponse::Throw(MockError {
            error: error.into(),
            cause: cause.into(),
        })
    }

    fn outcome(&self) -> Result<Value, TaskFailure> {
        match self {
            MockResponse::Return(value) => Ok(value.clone()),
            MockResponse::Throw(e) => Err(TaskFailure::new(&e.error, &e.cause)),
        }
    }
}

#[derive(Debug)]
struct ResponseQueue {
    responses: Vec<MockResponse>,
    next: usize,
}

impl ResponseQueue {
    /// Takes the next response; the last one repeats.
    fn take(&mut self) -> Option<&MockResponse> {
        let index = self.next.min(self.responses.len().checked_sub(1)?);
        self.next = self.next.saturating_add(1);
        self.responses.get(index)
    }
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq)]
pub struct MockInvocation {
    pub resource: String,
    pub input: Value,
}

/// Task invoker answering from per-resource response lists.
///
/// Responses for a resource are consumed in order and the last one repeats.
/// A resource with no responses echoes its input, or fails with
/// `States.TaskFailed` in strict mode.
#[derive(Debug, Default)]
pub struct MockTaskInvoker {
    queues: DashMap<String, ResponseQueue>,
    invocations: Mutex<Vec<MockInvocation>>,
    strict: bool,
}

impl MockTaskInvoker {
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            ..Default::default()
        }
    }

    pub fn from_config(config: &MocksConfig) -> Self {
        let invoker = Self::new(config.strict);
        for (resource, responses) in &config.resources {
            invoker.set_responses(resource, responses.clone());
        }
        invoker
    }

    /// Builder form of [`set_responses`](Self::set_responses).
    pub fn with_responses(self, resource: &str, responses: Vec<MockResponse>) -> Self {
        self.set_responses(resource, responses);
        self
    }

    /// Replaces the responses for a resource and rewinds it.
    pub fn set_responses(&self, resource: &str, responses: Vec<MockResponse>) {
        self.queues
            .insert(resource.to_string(), ResponseQueue { responses, next: 0 });
    }

    /// Returns every call made so far, oldest first.
    pub fn invocations(&self) -> Vec<MockInvocation> {
        self.invocations.lock().clone()
    }

    pub fn invocation_count(&self, resource: &str) -> usize {
        self.invocations
            .lock()
            .iter()
            .filter(|call| call.resource == resource)
            .count()
    }
}

#[async_trait]
impl TaskInvoker for MockTaskInvoker {
    async fn invoke(&self, resource: &str, input: Value) -> Result<Value, TaskFailure> {
        self.invocations.lock().push(MockInvocation {
            resource: resource.to_string(),
            input: input.clone(),
        });

        let scripted = self
            .queues
            .get_mut(resource)
            .and_then(|mut queue| queue.take().map(MockResponse::outcome));
        if let Some(outcome) = scripted {
            tracing::debug!("Mock response for {}: {:?}", resource, outcome);
            return outcome;
        }

        if self.strict {
            return Err(TaskFailure::new(
                codes::TASK_FAILED,
                format!("no mock response configured for '{}'", resource),
            ));
        }
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_responses_in_order_last_repeats() {
        let invoker = MockTaskInvoker::new(false).with_responses(
            "charge",
            vec![
                MockResponse::throw("Payment.Declined", "expired"),
                MockResponse::Return(json!({"charged": true})),
            ],
        );

        let first = invoker.invoke("charge", json!({})).await.unwrap_err();
        assert_eq!(first.error, "Payment.Declined");
        assert_eq!(first.cause, "expired");

        for _ in 0..3 {
            let value = invoker.invoke("charge", json!({})).await.unwrap();
            assert_eq!(value, json!({"charged": true}));
        }
        assert_eq!(invoker.invocation_count("charge"), 4);
    }

    #[tokio::test]
    async fn test_unknown_resource_echoes() {
        let invoker = MockTaskInvoker::new(false);
        let value = invoker.invoke("other", json!({"a": 1})).await.unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_strict_mode_fails_unknown() {
        let invoker = MockTaskInvoker::new(true);
        let err = invoker.invoke("other", json!({})).await.unwrap_err();
        assert_eq!(err.error, "States.TaskFailed");
    }

    #[tokio::test]
    async fn test_empty_list_falls_through() {
        let invoker = MockTaskInvoker::new(false).with_responses("noop", Vec::new());
        let value = invoker.invoke("noop", json!([1])).await.unwrap();
        assert_eq!(value, json!([1]));
    }

    #[test]
    fn test_response_serde_shape() {
        let parsed: Vec<MockResponse> = serde_json::from_value(json!([
            {"Return": {"ok": true}},
            {"Throw": {"Error": "Custom"}}
        ]))
        .unwrap();
        assert_eq!(parsed[0], MockResponse::Return(json!({"ok": true})));
        assert_eq!(parsed[1], MockResponse::throw("Custom", ""));
    }
}
