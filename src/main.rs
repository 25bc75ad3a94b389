//! localstep - local Step Functions emulator
//!
//! Validates Amazon States Language definitions and runs them offline
//! against mocked Task responses.

use clap::{Parser, Subcommand};
use colored::Colorize;
use localstep_core::{parse_definition_str, ExecutionStatus};
use localstep_provider::{Config, RetentionManager, StepFunctionsProvider};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "localstep")]
#[command(about = "Run Amazon States Language workflows locally")]
#[command(version)]
struct Cli {
    /// Config file (YAML)
    #[arg(short, long, env = "LOCALSTEP_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a definition without running it
    Validate {
        /// Definition file (JSON)
        file: PathBuf,
    },

    /// Run a definition to completion and print the result
    Run {
        /// Definition file (JSON)
        file: PathBuf,

        /// State machine name
        #[arg(short, long, default_value = "local")]
        name: String,

        /// Execution input JSON
        #[arg(short, long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read execution input from a file
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Print every state transition
        #[arg(long)]
        history: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => validate(&file),
        Commands::Run {
            file,
            name,
            input,
            input_file,
            history,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let input = match (input, input_file) {
                (Some(text), _) => Some(text),
                (None, Some(path)) => Some(std::fs::read_to_string(path)?),
                (None, None) => None,
            };
            run(&config, &file, &name, input.as_deref(), history).await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_env_overrides();
            config.validate()?;
            tracing::debug!("Loaded config from {}", path.display());
            config
        }
        None => Config::load()?,
    };
    Ok(config)
}

fn validate(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(file)?;
    match parse_definition_str(&text) {
        Ok(definition) => {
            println!(
                "{} {} ({} states, starts at {})",
                "Valid".green(),
                file.display(),
                definition.states.len(),
                definition.start_at.cyan()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Invalid".red(), e);
            Err(e.into())
        }
    }
}

async fn run(
    config: &Config,
    file: &Path,
    name: &str,
    input: Option<&str>,
    show_history: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let definition = std::fs::read_to_string(file)?;
    let provider = Arc::new(StepFunctionsProvider::from_config(config));

    let retention = Arc::new(RetentionManager::new(
        provider.clone(),
        config.retention.clone(),
    ));
    let retention_handle = {
        let retention = retention.clone();
        tokio::spawn(async move {
            retention.run().await;
        })
    };

    let machine = provider.create_state_machine(name, &definition, None)?;
    tracing::info!("Running {}", machine.state_machine_arn);

    let description = provider
        .start_sync_execution(&machine.state_machine_arn, None, input)
        .await?;

    if show_history {
        let history = provider.get_execution_history(&description.execution_arn)?;
        for transition in &history.transitions {
            println!(
                "{} {} {}",
                transition.timestamp.format("%H:%M:%S%.3f"),
                transition.state_type.dimmed(),
                transition.state_name.cyan()
            );
        }
    }

    let status = match description.status {
        ExecutionStatus::Succeeded => description.status.as_str().green(),
        ExecutionStatus::Running => description.status.as_str().yellow(),
        ExecutionStatus::Failed | ExecutionStatus::Aborted => description.status.as_str().red(),
    };
    println!("{} {}", status, description.execution_arn);

    retention.shutdown();
    let _ = retention_handle.await;

    match description.status {
        ExecutionStatus::Succeeded => {
            if let Some(output) = description.output {
                let value: serde_json::Value = serde_json::from_str(&output)?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            Ok(())
        }
        _ => {
            let error = description.error.unwrap_or_default();
            let cause = description.cause.unwrap_or_default();
            eprintln!("{}: {} {}", "Error".red(), error, cause);
            Err(format!("execution ended with {}", description.status.as_str()).into())
        }
    }
}
