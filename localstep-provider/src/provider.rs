//! The Step Functions API surface.
//!
//! Owns the state machine and execution registries. Definitions are held as
//! `Arc`s so an update never disturbs executions that are already running,
//! and every execution runs on its own tokio task.

use crate::arn::{execution_arn, state_machine_arn, state_machine_name, validate_name};
use crate::config::{Config, ProviderConfig};
use crate::error::ProviderError;
use crate::mock::MockTaskInvoker;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use localstep_core::{
    parse_definition, Execution, ExecutionEngine, ExecutionHistory, ExecutionOptions,
    ExecutionStatus, StateMachineDefinition, TaskInvoker,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const MACHINE_TYPE: &str = "STANDARD";

#[derive(Debug, Clone)]
struct StateMachineRecord {
    arn: String,
    name: String,
    definition: Arc<StateMachineDefinition>,
    /// Canonical JSON text of the definition.
    document: String,
    role_arn: Option<String>,
    creation_date: DateTime<Utc>,
    update_date: Option<DateTime<Utc>>,
    revision_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStateMachineOutput {
    pub state_machine_arn: String,
    pub creation_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStateMachineOutput {
    pub update_date: DateTime<Utc>,
    pub revision_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMachineDescription {
    pub state_machine_arn: String,
    pub name: String,
    pub status: &'static str,
    pub definition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
    #[serde(rename = "type")]
    pub machine_type: &'static str,
    pub creation_date: DateTime<Utc>,
    pub revision_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMachineListItem {
    pub state_machine_arn: String,
    pub name: String,
    #[serde(rename = "type")]
    pub machine_type: &'static str,
    pub creation_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionOutput {
    pub execution_arn: String,
    pub start_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDescription {
    pub execution_arn: String,
    pub state_machine_arn: Option<String>,
    pub name: String,
    pub status: ExecutionStatus,
    pub start_date: DateTime<Utc>,
    pub stop_date: Option<DateTime<Utc>>,
    pub input: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub cause: Option<String>,
}

impl From<&ExecutionHistory> for ExecutionDescription {
    fn from(history: &ExecutionHistory) -> Self {
        Self {
            execution_arn: history.execution_arn.clone(),
            state_machine_arn: history.state_machine_arn.clone(),
            name: history.name.clone(),
            status: history.status,
            start_date: history.start_time,
            stop_date: history.end_time,
            input: history.input_data.to_string(),
            output: history.output_data.as_ref().map(Value::to_string),
            error: history.error.clone(),
            cause: history.cause.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionListItem {
    pub execution_arn: String,
    pub state_machine_arn: String,
    pub name: String,
    pub status: ExecutionStatus,
    pub start_date: DateTime<Utc>,
    pub stop_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopExecutionOutput {
    pub stop_date: DateTime<Utc>,
}

/// In-memory Step Functions service.
pub struct StepFunctionsProvider {
    config: ProviderConfig,
    engine: Arc<ExecutionEngine>,
    /// State machines indexed by ARN.
    state_machines: DashMap<String, StateMachineRecord>,
    /// Executions indexed by ARN.
    executions: DashMap<String, Arc<Execution>>,
}

impl StepFunctionsProvider {
    /// Creates an empty provider running executions on `engine`.
    pub fn new(config: ProviderConfig, engine: ExecutionEngine) -> Self {
        Self {
            config,
            engine: Arc::new(engine),
            state_machines: DashMap::new(),
            executions: DashMap::new(),
        }
    }

    /// Builds a provider whose Tasks are answered by the configured mocks.
    pub fn from_config(config: &Config) -> Self {
        Self::with_invoker(config, Arc::new(MockTaskInvoker::from_config(&config.mocks)))
    }

    /// Builds a provider with a caller-supplied Task invoker.
    pub fn with_invoker(config: &Config, invoker: Arc<dyn TaskInvoker>) -> Self {
        let engine = ExecutionEngine::new(config.engine.engine_config(), invoker);
        Self::new(config.provider.clone(), engine)
    }

    /// Returns the account and region used for ARNs.
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Registers a state machine.
    ///
    /// Re-creating a machine with the same definition and role is idempotent.
    pub fn create_state_machine(
        &self,
        name: &str,
        definition: &str,
        role_arn: Option<&str>,
    ) -> Result<CreateStateMachineOutput, ProviderError> {
        validate_name(name)?;
        let (parsed, document) = parse_document(definition)?;
        let arn = state_machine_arn(&self.config.region, &self.config.account_id, name);

        match self.state_machines.entry(arn.clone()) {
            Entry::Occupied(entry) => {
                let existing = entry.get();
                if existing.document == document && existing.role_arn.as_deref() == role_arn {
                    return Ok(CreateStateMachineOutput {
                        state_machine_arn: arn,
                        creation_date: existing.creation_date,
                    });
                }
                Err(ProviderError::StateMachineAlreadyExists(arn))
            }
            Entry::Vacant(slot) => {
                let creation_date = Utc::now();
                slot.insert(StateMachineRecord {
                    arn: arn.clone(),
                    name: name.to_string(),
                    definition: parsed,
                    revision_id: revision_id(&document),
                    document,
                    role_arn: role_arn.map(str::to_string),
                    creation_date,
                    update_date: None,
                });
                tracing::info!("Created state machine {}", arn);
                Ok(CreateStateMachineOutput {
                    state_machine_arn: arn,
                    creation_date,
                })
            }
        }
    }

    /// Replaces a machine's definition and/or role.
    ///
    /// Running executions keep the definition they started with.
    pub fn update_state_machine(
        &self,
        arn: &str,
        definition: Option<&str>,
        role_arn: Option<&str>,
    ) -> Result<UpdateStateMachineOutput, ProviderError> {
        state_machine_name(arn)?;
        let parsed = definition.map(parse_document).transpose()?;

        let mut record = self
            .state_machines
            .get_mut(arn)
            .ok_or_else(|| ProviderError::StateMachineDoesNotExist(arn.to_string()))?;

        let mut changed = false;
        if let Some((definition, document)) = parsed {
            if document != record.document {
                record.definition = definition;
                record.revision_id = revision_id(&document);
                record.document = document;
                changed = true;
            }
        }
        if let Some(role) = role_arn {
            if record.role_arn.as_deref() != Some(role) {
                record.role_arn = Some(role.to_string());
                changed = true;
            }
        }
        if changed {
            record.update_date = Some(Utc::now());
            tracing::info!(
                "Updated state machine {} (revision {})",
                arn,
                record.revision_id
            );
        }

        Ok(UpdateStateMachineOutput {
            update_date: record.update_date.unwrap_or(record.creation_date),
            revision_id: record.revision_id.clone(),
        })
    }

    pub fn describe_state_machine(
        &self,
        arn: &str,
    ) -> Result<StateMachineDescription, ProviderError> {
        state_machine_name(arn)?;
        let record = self
            .state_machines
            .get(arn)
            .ok_or_else(|| ProviderError::StateMachineDoesNotExist(arn.to_string()))?;
        Ok(StateMachineDescription {
            state_machine_arn: record.arn.clone(),
            name: record.name.clone(),
            status: "ACTIVE",
            definition: record.document.clone(),
            role_arn: record.role_arn.clone(),
            machine_type: MACHINE_TYPE,
            creation_date: record.creation_date,
            revision_id: record.revision_id.clone(),
        })
    }

    /// Lists state machines sorted by name.
    pub fn list_state_machines(&self) -> Vec<StateMachineListItem> {
        let mut items: Vec<_> = self
            .state_machines
            .iter()
            .map(|entry| StateMachineListItem {
                state_machine_arn: entry.arn.clone(),
                name: entry.name.clone(),
                machine_type: MACHINE_TYPE,
                creation_date: entry.creation_date,
            })
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        items
    }

    /// Removes a state machine. Its executions keep running and stay visible.
    pub fn delete_state_machine(&self, arn: &str) -> Result<(), ProviderError> {
        state_machine_name(arn)?;
        self.state_machines
            .remove(arn)
            .ok_or_else(|| ProviderError::StateMachineDoesNotExist(arn.to_string()))?;
        tracing::info!("Deleted state machine {}", arn);
        Ok(())
    }

    /// Starts an execution on its own tokio task.
    ///
    /// Must be called from within a tokio runtime. Starting a name that is
    /// still running with the same input returns the existing execution.
    pub fn start_execution(
        &self,
        state_machine_arn: &str,
        name: Option<&str>,
        input: Option<&str>,
    ) -> Result<StartExecutionOutput, ProviderError> {
        let (execution, created) = self.prepare_execution(state_machine_arn, name, input)?;
        if created {
            let engine = self.engine.clone();
            let run = execution.clone();
            tokio::spawn(async move {
                engine.run(run).await;
            });
        }
        Ok(StartExecutionOutput {
            execution_arn: execution.arn().to_string(),
            start_date: execution.start_time(),
        })
    }

    /// Starts an execution and waits for it to finish.
    ///
    /// A duplicate of an existing execution is described as it currently is.
    pub async fn start_sync_execution(
        &self,
        state_machine_arn: &str,
        name: Option<&str>,
        input: Option<&str>,
    ) -> Result<ExecutionDescription, ProviderError> {
        let (execution, created) = self.prepare_execution(state_machine_arn, name, input)?;
        let history = if created {
            self.engine.run(execution).await
        } else {
            execution.snapshot()
        };
        Ok(ExecutionDescription::from(&history))
    }

    pub fn describe_execution(&self, arn: &str) -> Result<ExecutionDescription, ProviderError> {
        let execution = self.execution(arn)?;
        Ok(ExecutionDescription::from(&execution.snapshot()))
    }

    pub fn get_execution_history(&self, arn: &str) -> Result<ExecutionHistory, ProviderError> {
        Ok(self.execution(arn)?.snapshot())
    }

    /// Lists a machine's executions, newest first.
    pub fn list_executions(
        &self,
        state_machine_arn: &str,
        status_filter: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionListItem>, ProviderError> {
        state_machine_name(state_machine_arn)?;
        if !self.state_machines.contains_key(state_machine_arn) {
            return Err(ProviderError::StateMachineDoesNotExist(
                state_machine_arn.to_string(),
            ));
        }

        let mut items: Vec<_> = self
            .executions
            .iter()
            .map(|entry| entry.snapshot())
            .filter(|history| history.state_machine_arn.as_deref() == Some(state_machine_arn))
            .filter(|history| status_filter.map_or(true, |status| history.status == status))
            .map(|history| ExecutionListItem {
                execution_arn: history.execution_arn,
                state_machine_arn: state_machine_arn.to_string(),
                name: history.name,
                status: history.status,
                start_date: history.start_time,
                stop_date: history.end_time,
            })
            .collect();
        items.sort_by(|a, b| {
            b.start_date
                .cmp(&a.start_date)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(items)
    }

    /// Aborts a running execution. Stopping a finished one is a no-op that
    /// reports its original stop date.
    pub fn stop_execution(
        &self,
        arn: &str,
        error: Option<&str>,
        cause: Option<&str>,
    ) -> Result<StopExecutionOutput, ProviderError> {
        let execution = self.execution(arn)?;
        let stop_date = match execution.stop(error.map(str::to_string), cause.map(str::to_string))
        {
            Ok(stopped_at) => stopped_at,
            // Already terminal.
            Err(_) => execution.end_time().unwrap_or_else(Utc::now),
        };
        Ok(StopExecutionOutput { stop_date })
    }

    /// Drops terminal executions that ended more than `ttl` ago.
    pub fn purge_completed(&self, ttl: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return 0;
        };

        let mut purged = 0;
        self.executions.retain(|_, execution| {
            let expired = execution.end_time().is_some_and(|end| end <= cutoff);
            if expired {
                purged += 1;
            }
            !expired
        });
        purged
    }

    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }

    fn execution(&self, arn: &str) -> Result<Arc<Execution>, ProviderError> {
        self.executions
            .get(arn)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ProviderError::ExecutionDoesNotExist(arn.to_string()))
    }

    /// Registers a new execution, or finds the running duplicate.
    /// The flag is true when the execution still has to be run.
    fn prepare_execution(
        &self,
        state_machine_arn: &str,
        name: Option<&str>,
        input: Option<&str>,
    ) -> Result<(Arc<Execution>, bool), ProviderError> {
        state_machine_name(state_machine_arn)?;
        let (machine_name, definition) = {
            let record = self.state_machines.get(state_machine_arn).ok_or_else(|| {
                ProviderError::StateMachineDoesNotExist(state_machine_arn.to_string())
            })?;
            (record.name.clone(), record.definition.clone())
        };

        let input = parse_input(input)?;
        let name = match name {
            Some(name) => {
                validate_name(name)?;
                name.to_string()
            }
            None => Uuid::new_v4().to_string(),
        };
        let arn = execution_arn(
            &self.config.region,
            &self.config.account_id,
            &machine_name,
            &name,
        );

        match self.executions.entry(arn.clone()) {
            Entry::Occupied(entry) => {
                // Reuse is only idempotent while the first run is in flight.
                let existing = entry.get();
                if existing.status() == ExecutionStatus::Running && existing.input() == input {
                    Ok((existing.clone(), false))
                } else {
                    Err(ProviderError::ExecutionAlreadyExists(arn))
                }
            }
            Entry::Vacant(slot) => {
                let execution = self.engine.start(
                    definition,
                    input,
                    ExecutionOptions {
                        name: Some(name),
                        execution_arn: Some(arn.clone()),
                        state_machine_arn: Some(state_machine_arn.to_string()),
                    },
                );
                slot.insert(execution.clone());
                tracing::debug!("Registered execution {}", arn);
                Ok((execution, true))
            }
        }
    }
}

fn parse_document(text: &str) -> Result<(Arc<StateMachineDefinition>, String), ProviderError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ProviderError::InvalidDefinition(e.to_string()))?;
    let definition = parse_definition(&value)?;
    Ok((Arc::new(definition), value.to_string()))
}

fn parse_input(input: Option<&str>) -> Result<Value, ProviderError> {
    match input {
        None => Ok(Value::Object(Default::default())),
        Some(text) => serde_json::from_str(text)
            .map_err(|e| ProviderError::InvalidExecutionInput(e.to_string())),
    }
}

fn revision_id(document: &str) -> String {
    format!("{:08x}", crc32c::crc32c(document.as_bytes()))
}
