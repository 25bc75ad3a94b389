//! Execution engine - drives a definition from `StartAt` to a terminal state.

use crate::choice::evaluate_choice_rules_with_context;
use crate::definition::{
    Catcher, MapState, ParallelState, ResultPath, Retrier, State, StateKind,
    StateMachineDefinition, TaskState, Transition, WaitDuration,
};
use crate::error::{codes, TaskFailure};
use crate::history::{Execution, ExecutionHistory, RetryRecord, StateTransition};
use crate::invoker::TaskInvoker;
use crate::path::JsonPath;
use crate::payload::PayloadTemplate;
use crate::signal::AbortSignal;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Ceiling on any single sleep, both Wait states and retry back-off.
    /// Declared durations are still recorded in the history.
    pub max_wait_seconds: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_wait_seconds: 5.0,
        }
    }
}

/// Naming for a new execution. Missing fields are generated.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub name: Option<String>,
    pub execution_arn: Option<String>,
    pub state_machine_arn: Option<String>,
}

/// Runs state machine definitions against a task invoker.
pub struct ExecutionEngine {
    config: EngineConfig,
    invoker: Arc<dyn TaskInvoker>,
}

impl ExecutionEngine {
    /// Creates an engine that dispatches Task states to `invoker`.
    pub fn new(config: EngineConfig, invoker: Arc<dyn TaskInvoker>) -> Self {
        Self { config, invoker }
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates a `RUNNING` execution without driving it.
    pub fn start(
        &self,
        definition: Arc<StateMachineDefinition>,
        input: Value,
        options: ExecutionOptions,
    ) -> Arc<Execution> {
        let name = options
            .name
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let arn = options.execution_arn.unwrap_or_else(|| {
            format!(
                "arn:aws:states:local:000000000000:execution:local:{}",
                name
            )
        });
        let history = ExecutionHistory::new(arn, options.state_machine_arn, name, input);
        Arc::new(Execution::new(history, definition))
    }

    /// Drives an execution until it succeeds, fails or is stopped, and
    /// returns the final history.
    pub async fn run(&self, execution: Arc<Execution>) -> ExecutionHistory {
        let runner = Runner {
            invoker: self.invoker.clone(),
            max_wait: seconds(self.config.max_wait_seconds),
            signal: execution.signal().clone(),
            context: Arc::new(execution_context(&execution)),
        };
        let definition = execution.definition().clone();
        tracing::info!("Execution {} started", execution.arn());

        let run = runner.run_machine(
            definition.clone(),
            execution.input(),
            Trail::Root(execution.clone()),
            None,
        );
        let outcome = match definition.timeout_seconds {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), run).await {
                Ok((outcome, _)) => outcome,
                Err(_) => {
                    // Stops branches still running on their own tasks.
                    execution.signal().abort();
                    Outcome::Failed(TaskFailure::new(
                        codes::TIMEOUT,
                        format!("execution did not finish within {} seconds", secs),
                    ))
                }
            },
            None => run.await.0,
        };

        match outcome {
            Outcome::Succeeded(output) => {
                if execution.succeed(output) {
                    tracing::info!("Execution {} succeeded", execution.arn());
                }
            }
            Outcome::Failed(failure) => {
                let message = failure.to_string();
                if execution.fail(failure) {
                    tracing::warn!("Execution {} failed: {}", execution.arn(), message);
                }
            }
            Outcome::Aborted => {
                tracing::debug!("Execution {} unwound after abort", execution.arn());
            }
        }

        execution.snapshot()
    }

    /// Starts and runs an execution with generated naming.
    pub async fn execute(
        &self,
        definition: Arc<StateMachineDefinition>,
        input: Value,
    ) -> ExecutionHistory {
        let execution = self.start(definition, input, ExecutionOptions::default());
        self.run(execution).await
    }
}

/// Runs a definition to completion with a one-off engine.
pub async fn execute(
    definition: impl Into<Arc<StateMachineDefinition>>,
    input: Value,
    invoker: Arc<dyn TaskInvoker>,
    max_wait_seconds: f64,
) -> ExecutionHistory {
    let engine = ExecutionEngine::new(EngineConfig { max_wait_seconds }, invoker);
    engine.execute(definition.into(), input).await
}

type MachineFuture = Pin<Box<dyn Future<Output = (Outcome, Trail)> + Send>>;
type GroupResult = (Result<Value, AttemptError>, Vec<Vec<StateTransition>>);

enum Outcome {
    Succeeded(Value),
    Failed(TaskFailure),
    Aborted,
}

/// Where a (sub-)machine records its transitions.
enum Trail {
    Root(Arc<Execution>),
    Nested(Vec<StateTransition>),
}

impl Trail {
    fn record(&mut self, transition: StateTransition) -> bool {
        match self {
            Trail::Root(execution) => execution.record(transition),
            Trail::Nested(transitions) => {
                transitions.push(transition);
                true
            }
        }
    }

    fn into_transitions(self) -> Vec<StateTransition> {
        match self {
            Trail::Root(execution) => execution.snapshot().transitions,
            Trail::Nested(transitions) => transitions,
        }
    }
}

#[derive(Debug, Clone)]
struct MapItem {
    index: usize,
    value: Value,
}

/// What a state hands back to the machine loop.
enum Flow {
    Next(String, Value),
    End(Value),
    Fail(TaskFailure),
    Aborted,
}

enum AttemptError {
    Failed(TaskFailure),
    Aborted,
}

impl From<TaskFailure> for AttemptError {
    fn from(failure: TaskFailure) -> Self {
        AttemptError::Failed(failure)
    }
}

/// The retryable part of a Task, Parallel or Map state.
#[derive(Clone, Copy)]
enum Work<'a> {
    Task(&'a TaskState),
    Parallel(&'a ParallelState),
    Map(&'a MapState),
}

struct Policy<'a> {
    retry: &'a [Retrier],
    catch: &'a [Catcher],
    result_selector: Option<&'a PayloadTemplate>,
    result_path: &'a ResultPath,
    transition: &'a Transition,
}

impl<'a> Work<'a> {
    fn policy(self) -> Policy<'a> {
        match self {
            Work::Task(t) => Policy {
                retry: &t.retry,
                catch: &t.catch,
                result_selector: t.result_selector.as_ref(),
                result_path: &t.result_path,
                transition: &t.transition,
            },
            Work::Parallel(p) => Policy {
                retry: &p.retry,
                catch: &p.catch,
                result_selector: p.result_selector.as_ref(),
                result_path: &p.result_path,
                transition: &p.transition,
            },
            Work::Map(m) => Policy {
                retry: &m.retry,
                catch: &m.catch,
                result_selector: m.result_selector.as_ref(),
                result_path: &m.result_path,
                transition: &m.transition,
            },
        }
    }
}

/// Everything a state needs to know about where it runs.
struct Step<'a> {
    name: &'a str,
    state: &'a State,
    input: &'a Value,
    effective: Value,
    entered: DateTime<Utc>,
    item: Option<&'a MapItem>,
    /// Context object for the first attempt, used by `$$.` paths.
    context: Value,
}

#[derive(Clone)]
struct Runner {
    invoker: Arc<dyn TaskInvoker>,
    max_wait: Duration,
    signal: AbortSignal,
    /// `Execution` and `StateMachine` parts of the context object.
    context: Arc<Value>,
}

impl Runner {
    fn run_machine(
        self,
        definition: Arc<StateMachineDefinition>,
        input: Value,
        mut trail: Trail,
        item: Option<MapItem>,
    ) -> MachineFuture {
        Box::pin(async move {
            let mut current = definition.start_at.clone();
            let mut data = input;
            loop {
                if self.signal.is_aborted() {
                    return (Outcome::Aborted, trail);
                }
                let Some(state) = definition.get_state(&current) else {
                    let failure =
                        TaskFailure::runtime(format!("state '{}' does not exist", current));
                    return (Outcome::Failed(failure), trail);
                };

                let (transition, flow) = self.step(&current, state, data, item.as_ref()).await;
                if matches!(flow, Flow::Aborted) || !trail.record(transition) {
                    return (Outcome::Aborted, trail);
                }

                match flow {
                    Flow::Next(next, output) => {
                        tracing::debug!("{} -> {}", current, next);
                        current = next;
                        data = output;
                    }
                    Flow::End(output) => return (Outcome::Succeeded(output), trail),
                    Flow::Fail(failure) => {
                        tracing::debug!("State {} failed: {}", current, failure);
                        return (Outcome::Failed(failure), trail);
                    }
                    Flow::Aborted => return (Outcome::Aborted, trail),
                }
            }
        })
    }

    async fn step(
        &self,
        name: &str,
        state: &State,
        input: Value,
        item: Option<&MapItem>,
    ) -> (StateTransition, Flow) {
        let entered = Utc::now();
        let mut transition = StateTransition::new(name, state.state_type(), input.clone(), entered);

        let context = self.state_context(name, entered, 0, item);
        let flow = match select_input(state.input_path.as_ref(), &input, &context) {
            Ok(effective) => {
                let step = Step {
                    name,
                    state,
                    input: &input,
                    effective,
                    entered,
                    item,
                    context,
                };
                self.dispatch(step, &mut transition)
                    .await
                    .unwrap_or_else(Flow::Fail)
            }
            Err(failure) => Flow::Fail(failure),
        };

        match &flow {
            Flow::Next(_, output) | Flow::End(output) => transition.output_data = output.clone(),
            Flow::Fail(failure) => transition.set_failure(failure),
            Flow::Aborted => {}
        }
        (transition, flow)
    }

    async fn dispatch(
        &self,
        step: Step<'_>,
        transition: &mut StateTransition,
    ) -> Result<Flow, TaskFailure> {
        let output_path = step.state.output_path.as_ref();
        match &step.state.kind {
            StateKind::Pass {
                result,
                parameters,
                result_path,
                transition: next,
            } => {
                let value = match (result, parameters) {
                    (Some(result), _) => result.clone(),
                    (None, Some(template)) => template.render(&step.effective, &step.context)?,
                    (None, None) => step.effective.clone(),
                };
                let merged = merge_result(result_path, step.input, value)?;
                Ok(advance(next, select_output(output_path, merged, &step.context)?))
            }
            StateKind::Task(task) => self.run_with_retry(&step, Work::Task(task), transition).await,
            StateKind::Parallel(parallel) => {
                self.run_with_retry(&step, Work::Parallel(parallel), transition)
                    .await
            }
            StateKind::Map(map) => self.run_with_retry(&step, Work::Map(map), transition).await,
            StateKind::Choice { rules, default } => {
                let next = evaluate_choice_rules_with_context(rules, &step.effective, &step.context)
                    .or(default.as_deref())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        TaskFailure::new(
                            codes::NO_CHOICE_MATCHED,
                            format!("no choice rule matched in state '{}'", step.name),
                        )
                    })?;
                let output = select_output(output_path, step.effective, &step.context)?;
                Ok(Flow::Next(next, output))
            }
            StateKind::Wait {
                duration,
                transition: next,
            } => {
                let declared = wait_seconds(duration, &step.effective, &step.context)?;
                transition.wait_seconds = Some(declared);
                let output = select_output(output_path, step.effective, &step.context)?;
                if !self.sleep(declared).await {
                    return Ok(Flow::Aborted);
                }
                Ok(advance(next, output))
            }
            StateKind::Succeed => Ok(Flow::End(select_output(
                output_path,
                step.effective,
                &step.context,
            )?)),
            StateKind::Fail { error, cause } => Ok(Flow::Fail(TaskFailure::new(
                error.as_deref().unwrap_or(codes::FAIL),
                cause.as_deref().unwrap_or_default(),
            ))),
        }
    }

    async fn run_with_retry(
        &self,
        step: &Step<'_>,
        work: Work<'_>,
        transition: &mut StateTransition,
    ) -> Result<Flow, TaskFailure> {
        let policy = work.policy();
        let mut attempts = vec![0u32; policy.retry.len()];
        let mut retry_count = 0u32;

        loop {
            let (result, branches) = self.attempt(step, work, retry_count).await;
            transition.branches = branches;

            let failure = match result {
                Ok(result) => {
                    let selected = match policy.result_selector {
                        Some(template) => template
                            .render(&result, &self.context_object(step, retry_count, step.item))?,
                        None => result,
                    };
                    let merged = merge_result(policy.result_path, step.input, selected)?;
                    let output =
                        select_output(step.state.output_path.as_ref(), merged, &step.context)?;
                    return Ok(advance(policy.transition, output));
                }
                Err(AttemptError::Aborted) => return Ok(Flow::Aborted),
                Err(AttemptError::Failed(failure)) => failure,
            };

            // Only the first matching retrier is consulted.
            if let Some(index) = policy
                .retry
                .iter()
                .position(|r| failure.matches(&r.error_equals))
            {
                let retrier = &policy.retry[index];
                if attempts[index] < retrier.max_attempts {
                    attempts[index] += 1;
                    retry_count += 1;
                    let delay = retrier.delay_seconds(attempts[index]);
                    tracing::debug!(
                        "State {} failed with {}, retry {} after {:.3}s",
                        step.name,
                        failure.error,
                        attempts[index],
                        delay
                    );
                    transition.retries.push(RetryRecord {
                        error: failure.error.clone(),
                        attempt: attempts[index],
                        delay_seconds: delay,
                    });
                    if !self.sleep(delay).await {
                        return Ok(Flow::Aborted);
                    }
                    continue;
                }
            }

            if let Some(catcher) = policy
                .catch
                .iter()
                .find(|c| failure.matches(&c.error_equals))
            {
                tracing::debug!(
                    "State {} caught {}, continuing at {}",
                    step.name,
                    failure.error,
                    catcher.next
                );
                let error_output = json!({"Error": failure.error, "Cause": failure.cause});
                let output = merge_result(&catcher.result_path, step.input, error_output)?;
                transition.set_failure(&failure);
                return Ok(Flow::Next(catcher.next.clone(), output));
            }

            return Err(failure);
        }
    }

    async fn attempt(&self, step: &Step<'_>, work: Work<'_>, retry_count: u32) -> GroupResult {
        match work {
            Work::Task(task) => (self.invoke_task(step, task, retry_count).await, Vec::new()),
            Work::Parallel(parallel) => self.run_parallel(step, parallel, retry_count).await,
            Work::Map(map) => self.run_map(step, map, retry_count).await,
        }
    }

    async fn invoke_task(
        &self,
        step: &Step<'_>,
        task: &TaskState,
        retry_count: u32,
    ) -> Result<Value, AttemptError> {
        let payload = match &task.parameters {
            Some(template) => {
                template.render(&step.effective, &self.context_object(step, retry_count, step.item))?
            }
            None => step.effective.clone(),
        };

        let call = async {
            match task.timeout_seconds {
                Some(secs) => tokio::time::timeout(
                    Duration::from_secs(secs),
                    self.invoker.invoke(&task.resource, payload),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(TaskFailure::new(
                        codes::TIMEOUT,
                        format!("task did not finish within {} seconds", secs),
                    ))
                }),
                None => self.invoker.invoke(&task.resource, payload).await,
            }
        };

        tokio::select! {
            result = call => result.map_err(AttemptError::Failed),
            _ = self.signal.aborted() => Err(AttemptError::Aborted),
        }
    }

    async fn run_parallel(
        &self,
        step: &Step<'_>,
        parallel: &ParallelState,
        retry_count: u32,
    ) -> GroupResult {
        let input = match &parallel.parameters {
            Some(template) => {
                let context = self.context_object(step, retry_count, step.item);
                match template.render(&step.effective, &context) {
                    Ok(input) => input,
                    Err(failure) => return (Err(failure.into()), Vec::new()),
                }
            }
            None => step.effective.clone(),
        };

        let runs = parallel
            .branches
            .iter()
            .map(|branch| (branch.clone(), input.clone(), None))
            .collect();
        self.run_group(runs, None).await
    }

    async fn run_map(&self, step: &Step<'_>, map: &MapState, retry_count: u32) -> GroupResult {
        let items = match map.items_path.resolve(&step.effective, &step.context) {
            Some(Value::Array(items)) => items.clone(),
            _ => {
                let failure = TaskFailure::runtime(format!(
                    "ItemsPath '{}' did not resolve to an array",
                    map.items_path
                ));
                return (Err(failure.into()), Vec::new());
            }
        };

        let mut runs = Vec::with_capacity(items.len());
        for (index, value) in items.into_iter().enumerate() {
            let item = MapItem { index, value };
            let input = match &map.item_selector {
                Some(template) => {
                    let context = self.context_object(step, retry_count, Some(&item));
                    match template.render(&step.effective, &context) {
                        Ok(input) => input,
                        Err(failure) => return (Err(failure.into()), Vec::new()),
                    }
                }
                None => item.value.clone(),
            };
            runs.push((map.iterator.clone(), input, Some(item)));
        }

        // A bound at or above the item count never blocks.
        let limit = (map.max_concurrency > 0 && map.max_concurrency < runs.len())
            .then(|| Arc::new(Semaphore::new(map.max_concurrency)));
        self.run_group(runs, limit).await
    }

    /// Runs sub-machines on their own tasks and joins them in order.
    ///
    /// The first failing run cancels its siblings. The failure with the
    /// lowest index is reported.
    async fn run_group(
        &self,
        runs: Vec<(Arc<StateMachineDefinition>, Value, Option<MapItem>)>,
        limit: Option<Arc<Semaphore>>,
    ) -> GroupResult {
        let group = self.signal.child();
        let handles: Vec<_> = runs
            .into_iter()
            .map(|(definition, input, item)| {
                let runner = Runner {
                    signal: group.clone(),
                    ..self.clone()
                };
                let group = group.clone();
                let limit = limit.clone();
                tokio::spawn(async move {
                    let _permit = match limit {
                        Some(semaphore) => tokio::select! {
                            permit = semaphore.acquire_owned() => permit.ok(),
                            _ = group.aborted() => return (Outcome::Aborted, Vec::new()),
                        },
                        None => None,
                    };
                    let (outcome, trail) = runner
                        .run_machine(definition, input, Trail::Nested(Vec::new()), item)
                        .await;
                    if matches!(outcome, Outcome::Failed(_)) {
                        group.abort();
                    }
                    (outcome, trail.into_transitions())
                })
            })
            .collect();

        let mut outputs = Vec::with_capacity(handles.len());
        let mut branches = Vec::with_capacity(handles.len());
        let mut failure = None;
        let mut aborted = false;
        for handle in handles {
            let (outcome, transitions) = match handle.await {
                Ok(done) => done,
                Err(e) => (
                    Outcome::Failed(TaskFailure::runtime(format!("branch task failed: {}", e))),
                    Vec::new(),
                ),
            };
            branches.push(transitions);
            match outcome {
                Outcome::Succeeded(output) => outputs.push(output),
                Outcome::Failed(f) => {
                    failure.get_or_insert(f);
                }
                Outcome::Aborted => aborted = true,
            }
        }

        let result = match failure {
            Some(failure) => Err(AttemptError::Failed(failure)),
            None if aborted || self.signal.is_aborted() => Err(AttemptError::Aborted),
            None => Ok(Value::Array(outputs)),
        };
        (result, branches)
    }

    /// Sleeps for at most the configured ceiling. Returns false on abort.
    async fn sleep(&self, declared_seconds: f64) -> bool {
        let duration = seconds(declared_seconds).min(self.max_wait);
        if duration.is_zero() {
            return !self.signal.is_aborted();
        }
        self.signal.sleep(duration).await
    }

    fn context_object(&self, step: &Step<'_>, retry_count: u32, item: Option<&MapItem>) -> Value {
        self.state_context(step.name, step.entered, retry_count, item)
    }

    fn state_context(
        &self,
        name: &str,
        entered: DateTime<Utc>,
        retry_count: u32,
        item: Option<&MapItem>,
    ) -> Value {
        let mut context = (*self.context).clone();
        if let Value::Object(map) = &mut context {
            map.insert(
                "State".to_string(),
                json!({
                    "Name": name,
                    "EnteredTime": entered.to_rfc3339(),
                    "RetryCount": retry_count,
                }),
            );
            if let Some(item) = item {
                map.insert(
                    "Map".to_string(),
                    json!({"Item": {"Index": item.index, "Value": item.value}}),
                );
            }
        }
        context
    }
}

fn execution_context(execution: &Execution) -> Value {
    let history = execution.snapshot();
    json!({
        "Execution": {
            "Id": history.execution_arn,
            "Name": history.name,
            "Input": history.input_data,
            "StartTime": history.start_time.to_rfc3339(),
        },
        "StateMachine": {
            "Id": history.state_machine_arn,
        },
    })
}

fn advance(transition: &Transition, output: Value) -> Flow {
    match transition {
        Transition::Next(next) => Flow::Next(next.clone(), output),
        Transition::End => Flow::End(output),
    }
}

/// Applies `InputPath`. A null path hands the state an empty object.
fn select_input(
    path: Option<&JsonPath>,
    input: &Value,
    context: &Value,
) -> Result<Value, TaskFailure> {
    match path {
        None => Ok(Value::Object(Map::new())),
        Some(path) => path.resolve(input, context).cloned().ok_or_else(|| {
            TaskFailure::runtime(format!("InputPath '{}' could not be found in the input", path))
        }),
    }
}

/// Applies `OutputPath`. A null path yields an empty object.
fn select_output(
    path: Option<&JsonPath>,
    value: Value,
    context: &Value,
) -> Result<Value, TaskFailure> {
    match path {
        None => Ok(Value::Object(Map::new())),
        Some(path) if path.is_root() => Ok(value),
        Some(path) => path.resolve(&value, context).cloned().ok_or_else(|| {
            TaskFailure::runtime(format!("OutputPath '{}' could not be found in the output", path))
        }),
    }
}

/// Applies `ResultPath` to the state's raw input.
fn merge_result(
    result_path: &ResultPath,
    input: &Value,
    result: Value,
) -> Result<Value, TaskFailure> {
    match result_path {
        ResultPath::Discard => Ok(input.clone()),
        ResultPath::Path(path) if path.is_root() => Ok(result),
        ResultPath::Path(path) => {
            let mut merged = input.clone();
            path.set(&mut merged, result)?;
            Ok(merged)
        }
    }
}

fn wait_seconds(
    duration: &WaitDuration,
    data: &Value,
    context: &Value,
) -> Result<f64, TaskFailure> {
    match duration {
        WaitDuration::Seconds(secs) => Ok(*secs as f64),
        WaitDuration::SecondsPath(path) => path
            .resolve(data, context)
            .and_then(Value::as_f64)
            .filter(|secs| *secs >= 0.0)
            .ok_or_else(|| {
                TaskFailure::runtime(format!(
                    "SecondsPath '{}' did not resolve to a non-negative number",
                    path
                ))
            }),
        WaitDuration::Timestamp(at) => Ok(seconds_until(at.with_timezone(&Utc))),
        WaitDuration::TimestampPath(path) => {
            let raw = path.resolve(data, context).and_then(Value::as_str).ok_or_else(|| {
                TaskFailure::runtime(format!(
                    "TimestampPath '{}' did not resolve to a string",
                    path
                ))
            })?;
            let at = DateTime::parse_from_rfc3339(raw).map_err(|e| {
                TaskFailure::runtime(format!("invalid timestamp '{}': {}", raw, e))
            })?;
            Ok(seconds_until(at.with_timezone(&Utc)))
        }
    }
}

fn seconds_until(at: DateTime<Utc>) -> f64 {
    let millis = (at - Utc::now()).num_milliseconds().max(0);
    millis as f64 / 1000.0
}

fn seconds(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
