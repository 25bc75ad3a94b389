//! State machine definition types.
//!
//! Definitions are Amazon States Language documents:
//!
//! ```json
//! {
//!   "StartAt": "Charge",
//!   "States": {
//!     "Charge": {
//!       "Type": "Task",
//!       "Resource": "arn:aws:lambda:us-east-1:000000000000:function:charge",
//!       "Retry": [{"ErrorEquals": ["Payment.Busy"], "MaxAttempts": 2}],
//!       "Catch": [{"ErrorEquals": ["States.ALL"], "Next": "Refund"}],
//!       "Next": "Done"
//!     },
//!     "Refund": {"Type": "Fail", "Error": "PaymentFailed"},
//!     "Done": {"Type": "Succeed"}
//!   }
//! }
//! ```
//!
//! Parsing is pure: the same document always yields an equal definition.

use crate::choice::ChoiceRule;
use crate::error::{codes, CoreError};
use crate::path::JsonPath;
use crate::payload::PayloadTemplate;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

/// Where a non-terminal state goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Next(String),
    End,
}

/// Where a state's result is placed in its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultPath {
    /// Write the result at this path (`$` replaces the whole input).
    Path(JsonPath),
    /// `"ResultPath": null` - drop the result, pass the input through.
    Discard,
}

impl Default for ResultPath {
    fn default() -> Self {
        ResultPath::Path(JsonPath::root())
    }
}

/// Retry policy attached to a Task, Parallel or Map state.
#[derive(Debug, Clone, PartialEq)]
pub struct Retrier {
    pub error_equals: Vec<String>,
    pub interval_seconds: f64,
    pub max_attempts: u32,
    pub backoff_rate: f64,
    pub max_delay_seconds: Option<f64>,
}

impl Retrier {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_seconds(&self, attempt: u32) -> f64 {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.interval_seconds * self.backoff_rate.powi(exponent);
        match self.max_delay_seconds {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// Fallback routing attached to a Task, Parallel or Map state.
#[derive(Debug, Clone, PartialEq)]
pub struct Catcher {
    pub error_equals: Vec<String>,
    pub next: String,
    pub result_path: ResultPath,
}

/// How long a Wait state waits.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitDuration {
    Seconds(u64),
    SecondsPath(JsonPath),
    Timestamp(DateTime<FixedOffset>),
    TimestampPath(JsonPath),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskState {
    pub resource: String,
    pub parameters: Option<PayloadTemplate>,
    pub result_selector: Option<PayloadTemplate>,
    pub result_path: ResultPath,
    pub timeout_seconds: Option<u64>,
    pub retry: Vec<Retrier>,
    pub catch: Vec<Catcher>,
    pub transition: Transition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParallelState {
    pub branches: Vec<Arc<StateMachineDefinition>>,
    pub parameters: Option<PayloadTemplate>,
    pub result_selector: Option<PayloadTemplate>,
    pub result_path: ResultPath,
    pub retry: Vec<Retrier>,
    pub catch: Vec<Catcher>,
    pub transition: Transition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapState {
    pub iterator: Arc<StateMachineDefinition>,
    pub items_path: JsonPath,
    pub item_selector: Option<PayloadTemplate>,
    /// Maximum items in flight; 0 means unbounded.
    pub max_concurrency: usize,
    pub result_selector: Option<PayloadTemplate>,
    pub result_path: ResultPath,
    pub retry: Vec<Retrier>,
    pub catch: Vec<Catcher>,
    pub transition: Transition,
}

/// Type-specific part of a state.
#[derive(Debug, Clone, PartialEq)]
pub enum StateKind {
    Pass {
        result: Option<Value>,
        parameters: Option<PayloadTemplate>,
        result_path: ResultPath,
        transition: Transition,
    },
    Task(TaskState),
    Choice {
        rules: Vec<ChoiceRule>,
        default: Option<String>,
    },
    Wait {
        duration: WaitDuration,
        transition: Transition,
    },
    Succeed,
    Fail {
        error: Option<String>,
        cause: Option<String>,
    },
    Parallel(ParallelState),
    Map(MapState),
}

/// A state in the machine.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub comment: Option<String>,
    /// `None` when the document sets `"InputPath": null`.
    pub input_path: Option<JsonPath>,
    /// `None` when the document sets `"OutputPath": null`.
    pub output_path: Option<JsonPath>,
    pub kind: StateKind,
}

impl State {
    /// The ASL `Type` name.
    pub fn state_type(&self) -> &'static str {
        match &self.kind {
            StateKind::Pass { .. } => "Pass",
            StateKind::Task(_) => "Task",
            StateKind::Choice { .. } => "Choice",
            StateKind::Wait { .. } => "Wait",
            StateKind::Succeed => "Succeed",
            StateKind::Fail { .. } => "Fail",
            StateKind::Parallel(_) => "Parallel",
            StateKind::Map(_) => "Map",
        }
    }

    pub fn transition(&self) -> Option<&Transition> {
        match &self.kind {
            StateKind::Pass { transition, .. } | StateKind::Wait { transition, .. } => {
                Some(transition)
            }
            StateKind::Task(t) => Some(&t.transition),
            StateKind::Parallel(p) => Some(&p.transition),
            StateKind::Map(m) => Some(&m.transition),
            StateKind::Choice { .. } | StateKind::Succeed | StateKind::Fail { .. } => None,
        }
    }

    /// Names of every state this one can hand control to.
    pub fn successors(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(Transition::Next(next)) = self.transition() {
            out.push(next.as_str());
        }
        match &self.kind {
            StateKind::Choice { rules, default } => {
                out.extend(rules.iter().map(|r| r.next.as_str()));
                out.extend(default.as_deref());
            }
            StateKind::Task(TaskState { catch, .. })
            | StateKind::Parallel(ParallelState { catch, .. })
            | StateKind::Map(MapState { catch, .. }) => {
                out.extend(catch.iter().map(|c| c.next.as_str()));
            }
            _ => {}
        }
        out
    }
}

/// Validated state machine definition.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMachineDefinition {
    pub comment: Option<String>,
    pub start_at: String,
    pub states: BTreeMap<String, State>,
    pub timeout_seconds: Option<u64>,
}

impl StateMachineDefinition {
    /// Parses and validates a definition from JSON.
    pub fn from_json(json: &Value) -> Result<Self, CoreError> {
        let raw: RawDefinition = serde_json::from_value(json.clone())
            .map_err(|e| CoreError::definition(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawDefinition) -> Result<Self, CoreError> {
        if raw.states.is_empty() {
            return Err(CoreError::definition("'States' must not be empty"));
        }
        if !raw.states.contains_key(&raw.start_at) {
            return Err(CoreError::definition(format!(
                "'StartAt' references undefined state '{}'",
                raw.start_at
            )));
        }

        let mut states = BTreeMap::new();
        for (name, value) in &raw.states {
            let state = parse_state(value).map_err(|e| in_state(name, e))?;
            states.insert(name.clone(), state);
        }

        for (name, state) in &states {
            for target in state.successors() {
                if !states.contains_key(target) {
                    return Err(CoreError::definition(format!(
                        "state '{}' transitions to undefined state '{}'",
                        name, target
                    )));
                }
            }
        }

        let reachable = reachable_from(&raw.start_at, &states);
        if let Some(name) = states.keys().find(|n| !reachable.contains(n.as_str())) {
            return Err(CoreError::definition(format!(
                "state '{}' is not reachable from '{}'",
                name, raw.start_at
            )));
        }

        Ok(Self {
            comment: raw.comment,
            start_at: raw.start_at,
            states,
            timeout_seconds: raw.timeout_seconds,
        })
    }

    pub fn get_state(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }
}

impl FromStr for StateMachineDefinition {
    type Err = CoreError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let json: Value =
            serde_json::from_str(text).map_err(|e| CoreError::definition(e.to_string()))?;
        Self::from_json(&json)
    }
}

/// Parses an ASL document into a definition.
pub fn parse_definition(json: &Value) -> Result<StateMachineDefinition, CoreError> {
    StateMachineDefinition::from_json(json)
}

/// Parses an ASL document given as text.
pub fn parse_definition_str(text: &str) -> Result<StateMachineDefinition, CoreError> {
    text.parse()
}

fn reachable_from<'a>(start: &'a str, states: &'a BTreeMap<String, State>) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([start]);
    while let Some(name) = queue.pop_front() {
        if !seen.insert(name) {
            continue;
        }
        if let Some(state) = states.get(name) {
            queue.extend(state.successors());
        }
    }
    seen
}

fn in_state(name: &str, err: CoreError) -> CoreError {
    let reason = match err {
        CoreError::InvalidDefinition { reason } => reason,
        other => other.to_string(),
    };
    CoreError::definition(format!("state '{}': {}", name, reason))
}

/// Raw definition as transmitted.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawDefinition {
    #[serde(default)]
    comment: Option<String>,
    start_at: String,
    states: BTreeMap<String, Value>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

/// Every field any state type may carry; `parse_state` picks the relevant
/// ones for the declared `Type`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawState {
    #[serde(rename = "Type")]
    state_type: String,
    comment: Option<String>,
    next: Option<String>,
    end: Option<bool>,
    #[serde(default, deserialize_with = "nullable")]
    input_path: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    output_path: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    result_path: Option<Option<String>>,
    result: Option<Value>,
    parameters: Option<Value>,
    result_selector: Option<Value>,
    resource: Option<String>,
    timeout_seconds: Option<u64>,
    #[serde(default)]
    retry: Vec<RawRetrier>,
    #[serde(default)]
    catch: Vec<RawCatcher>,
    choices: Option<Vec<Value>>,
    default: Option<String>,
    seconds: Option<u64>,
    seconds_path: Option<String>,
    timestamp: Option<String>,
    timestamp_path: Option<String>,
    error: Option<String>,
    cause: Option<String>,
    branches: Option<Vec<Value>>,
    iterator: Option<Value>,
    item_processor: Option<Value>,
    items_path: Option<String>,
    item_selector: Option<Value>,
    max_concurrency: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawRetrier {
    error_equals: Vec<String>,
    #[serde(default = "default_interval")]
    interval_seconds: f64,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_backoff_rate")]
    backoff_rate: f64,
    #[serde(default)]
    max_delay_seconds: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawCatcher {
    error_equals: Vec<String>,
    next: String,
    #[serde(default, deserialize_with = "nullable")]
    result_path: Option<Option<String>>,
}

fn default_interval() -> f64 {
    1.0
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_rate() -> f64 {
    2.0
}

/// Distinguishes an absent field (`None`) from an explicit `null`
/// (`Some(None)`).
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn parse_state(value: &Value) -> Result<State, CoreError> {
    let raw: RawState =
        serde_json::from_value(value.clone()).map_err(|e| CoreError::definition(e.to_string()))?;

    let input_path = parse_data_path(raw.input_path.as_ref())?;
    let output_path = parse_data_path(raw.output_path.as_ref())?;

    let kind = match raw.state_type.as_str() {
        "Pass" => StateKind::Pass {
            result: raw.result.clone(),
            parameters: parse_template(raw.parameters.as_ref())?,
            result_path: parse_result_path(raw.result_path.as_ref())?,
            transition: parse_transition(&raw)?,
        },
        "Task" => {
            let resource = raw
                .resource
                .clone()
                .ok_or_else(|| CoreError::definition("Task state requires 'Resource'"))?;
            StateKind::Task(TaskState {
                resource,
                parameters: parse_template(raw.parameters.as_ref())?,
                result_selector: parse_template(raw.result_selector.as_ref())?,
                result_path: parse_result_path(raw.result_path.as_ref())?,
                timeout_seconds: raw.timeout_seconds,
                retry: parse_retry(&raw.retry)?,
                catch: parse_catch(&raw.catch)?,
                transition: parse_transition(&raw)?,
            })
        }
        "Choice" => {
            ensure_terminal_fields_absent(&raw)?;
            let choices = raw
                .choices
                .as_deref()
                .filter(|c| !c.is_empty())
                .ok_or_else(|| CoreError::definition("Choice state requires 'Choices'"))?;
            StateKind::Choice {
                rules: choices
                    .iter()
                    .map(ChoiceRule::parse)
                    .collect::<Result<_, _>>()?,
                default: raw.default.clone(),
            }
        }
        "Wait" => StateKind::Wait {
            duration: parse_wait(&raw)?,
            transition: parse_transition(&raw)?,
        },
        "Succeed" => {
            ensure_terminal_fields_absent(&raw)?;
            StateKind::Succeed
        }
        "Fail" => {
            ensure_terminal_fields_absent(&raw)?;
            StateKind::Fail {
                error: raw.error.clone(),
                cause: raw.cause.clone(),
            }
        }
        "Parallel" => {
            let branches = raw
                .branches
                .as_deref()
                .filter(|b| !b.is_empty())
                .ok_or_else(|| CoreError::definition("Parallel state requires 'Branches'"))?;
            StateKind::Parallel(ParallelState {
                branches: branches
                    .iter()
                    .map(|b| parse_definition(b).map(Arc::new))
                    .collect::<Result<_, _>>()?,
                parameters: parse_template(raw.parameters.as_ref())?,
                result_selector: parse_template(raw.result_selector.as_ref())?,
                result_path: parse_result_path(raw.result_path.as_ref())?,
                retry: parse_retry(&raw.retry)?,
                catch: parse_catch(&raw.catch)?,
                transition: parse_transition(&raw)?,
            })
        }
        "Map" => {
            let iterator = raw
                .item_processor
                .as_ref()
                .or(raw.iterator.as_ref())
                .ok_or_else(|| CoreError::definition("Map state requires 'Iterator'"))?;
            let items_path = match &raw.items_path {
                Some(p) => JsonPath::parse(p)?,
                None => JsonPath::root(),
            };
            StateKind::Map(MapState {
                iterator: Arc::new(parse_definition(iterator)?),
                items_path,
                item_selector: parse_template(
                    raw.item_selector.as_ref().or(raw.parameters.as_ref()),
                )?,
                max_concurrency: raw
                    .max_concurrency
                    .map_or(0, |n| usize::try_from(n).unwrap_or(usize::MAX)),
                result_selector: parse_template(raw.result_selector.as_ref())?,
                result_path: parse_result_path(raw.result_path.as_ref())?,
                retry: parse_retry(&raw.retry)?,
                catch: parse_catch(&raw.catch)?,
                transition: parse_transition(&raw)?,
            })
        }
        other => {
            return Err(CoreError::definition(format!(
                "unknown state type '{}'",
                other
            )))
        }
    };

    Ok(State {
        comment: raw.comment,
        input_path,
        output_path,
        kind,
    })
}

fn parse_transition(raw: &RawState) -> Result<Transition, CoreError> {
    match (&raw.next, raw.end.unwrap_or(false)) {
        (Some(next), false) => Ok(Transition::Next(next.clone())),
        (None, true) => Ok(Transition::End),
        (Some(_), true) => Err(CoreError::definition(
            "state declares both 'Next' and 'End'",
        )),
        (None, false) => Err(CoreError::definition(
            "state declares neither 'Next' nor 'End'",
        )),
    }
}

fn ensure_terminal_fields_absent(raw: &RawState) -> Result<(), CoreError> {
    if raw.next.is_some() || raw.end.is_some() {
        return Err(CoreError::definition(format!(
            "{} state must not declare 'Next' or 'End'",
            raw.state_type
        )));
    }
    Ok(())
}

fn parse_data_path(field: Option<&Option<String>>) -> Result<Option<JsonPath>, CoreError> {
    match field {
        None => Ok(Some(JsonPath::root())),
        Some(None) => Ok(None),
        Some(Some(p)) => Ok(Some(JsonPath::parse(p)?)),
    }
}

fn parse_result_path(field: Option<&Option<String>>) -> Result<ResultPath, CoreError> {
    match field {
        None => Ok(ResultPath::default()),
        Some(None) => Ok(ResultPath::Discard),
        Some(Some(p)) => Ok(ResultPath::Path(JsonPath::parse(p)?)),
    }
}

fn parse_template(field: Option<&Value>) -> Result<Option<PayloadTemplate>, CoreError> {
    field.map(PayloadTemplate::parse).transpose()
}

fn parse_wait(raw: &RawState) -> Result<WaitDuration, CoreError> {
    let mut durations = Vec::new();
    if let Some(s) = raw.seconds {
        durations.push(WaitDuration::Seconds(s));
    }
    if let Some(p) = &raw.seconds_path {
        durations.push(WaitDuration::SecondsPath(JsonPath::parse(p)?));
    }
    if let Some(t) = &raw.timestamp {
        let ts = DateTime::parse_from_rfc3339(t)
            .map_err(|e| CoreError::definition(format!("invalid 'Timestamp': {}", e)))?;
        durations.push(WaitDuration::Timestamp(ts));
    }
    if let Some(p) = &raw.timestamp_path {
        durations.push(WaitDuration::TimestampPath(JsonPath::parse(p)?));
    }

    if durations.len() != 1 {
        return Err(CoreError::definition(
            "Wait state requires exactly one of 'Seconds', 'SecondsPath', 'Timestamp', 'TimestampPath'",
        ));
    }
    Ok(durations.remove(0))
}

fn check_error_equals(
    kind: &str,
    position: usize,
    total: usize,
    names: &[String],
) -> Result<(), CoreError> {
    if names.is_empty() {
        return Err(CoreError::definition(format!(
            "{} has an empty 'ErrorEquals'",
            kind
        )));
    }
    if names.iter().any(|n| n == codes::ALL) && (names.len() > 1 || position + 1 != total) {
        return Err(CoreError::definition(format!(
            "'{}' must appear alone in the last {}",
            codes::ALL,
            kind
        )));
    }
    Ok(())
}

fn parse_retry(raw: &[RawRetrier]) -> Result<Vec<Retrier>, CoreError> {
    raw.iter()
        .enumerate()
        .map(|(i, r)| {
            check_error_equals("retrier", i, raw.len(), &r.error_equals)?;
            if r.interval_seconds < 0.0 || r.backoff_rate < 1.0 {
                return Err(CoreError::definition(
                    "retrier needs 'IntervalSeconds' >= 0 and 'BackoffRate' >= 1.0",
                ));
            }
            Ok(Retrier {
                error_equals: r.error_equals.clone(),
                interval_seconds: r.interval_seconds,
                max_attempts: r.max_attempts,
                backoff_rate: r.backoff_rate,
                max_delay_seconds: r.max_delay_seconds,
            })
        })
        .collect()
}

fn parse_catch(raw: &[RawCatcher]) -> Result<Vec<Catcher>, CoreError> {
    raw.iter()
        .enumerate()
        .map(|(i, c)| {
            check_error_equals("catcher", i, raw.len(), &c.error_equals)?;
            Ok(Catcher {
                error_equals: c.error_equals.clone(),
                next: c.next.clone(),
                result_path: parse_result_path(c.result_path.as_ref())?,
            })
        })
        .collect()
}
