use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use owl_core::config::{AppConfig, ExecutionMode};
use owl_core::event::EventBus;
use owl_core::types::FieldMap;
use owl_engine::{Executor, NodeEnv, NodeRegistry, ProviderRegistry, Strategy, Workflow, WorkflowDef};
use owl_sandbox::Sandbox;

const DEFAULT_LOG_FILTER: &str = "owl=info,warn";

#[derive(Parser)]
#[command(name = "owl", version, about = "Typed DAG workflow orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "owl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow and print the final context as JSON
    Run {
        /// Workflow definition (TOML)
        workflow: PathBuf,
        /// Initial input as NAME=VALUE; VALUE is parsed as JSON when possible
        #[arg(short, long = "input", value_name = "NAME=VALUE")]
        inputs: Vec<String>,
        /// JSON object file with initial inputs, merged before --input
        #[arg(long, value_name = "FILE")]
        inputs_file: Option<PathBuf>,
        /// Run independent nodes concurrently
        #[arg(long)]
        parallel: bool,
        /// Print node events to stderr as JSON lines
        #[arg(long)]
        events: bool,
    },
    /// Validate a workflow without running it
    Check {
        /// Workflow definition (TOML)
        workflow: PathBuf,
    },
    /// Print the workflow as a tree
    Print {
        /// Workflow definition (TOML)
        workflow: PathBuf,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "owl", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    init_tracing(&config);
    if !cli.config.exists() {
        warn!(path = %cli.config.display(), "No config file found, using defaults");
    }

    match cli.command {
        Commands::Run {
            workflow,
            inputs,
            inputs_file,
            parallel,
            events,
        } => {
            let wf = load_workflow(&workflow)?;
            let initial = collect_inputs(inputs_file.as_deref(), &inputs)?;

            let mut executor_config = config.executor.clone();
            if parallel {
                executor_config.mode = ExecutionMode::Parallel;
            }
            let mut executor = Executor::new(build_env(&config)?).with_config(executor_config);

            let printer = if events {
                let bus = Arc::new(EventBus::default());
                let mut rx = bus.subscribe();
                executor = executor.with_events(bus);
                Some(tokio::spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        if let Ok(line) = serde_json::to_string(&event) {
                            eprintln!("{}", line);
                        }
                    }
                }))
            } else {
                None
            };

            let result = executor.run(&wf, initial).await;
            // Dropping the executor closes the bus and ends the printer.
            drop(executor);
            if let Some(printer) = printer {
                let _ = printer.await;
            }

            let output = result?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Check { workflow } => {
            let wf = load_workflow(&workflow)?;
            check_workflow(&wf, &config)?;
            println!(
                "{}: ok ({} nodes, {} edges)",
                wf.name(),
                wf.len(),
                wf.edges().len()
            );
        }
        Commands::Print { workflow } => {
            let wf = load_workflow(&workflow)?;
            print!("{}", wf.pretty_print());
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        AppConfig::load(path).with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(AppConfig::default())
    }
}

/// `RUST_LOG` wins over `[log] filter`, which wins over the default.
fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.log.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_workflow(path: &Path) -> anyhow::Result<Workflow> {
    let def = WorkflowDef::load(path)?;
    let workflow = def
        .compile(&NodeRegistry::new())
        .with_context(|| format!("compiling {}", path.display()))?;
    info!(workflow = %workflow.name(), nodes = workflow.len(), "Loaded workflow");
    Ok(workflow)
}

/// Register a chat provider for every `[providers.<key>]` section.
fn build_env(config: &AppConfig) -> anyhow::Result<NodeEnv> {
    let mut providers = ProviderRegistry::new();
    for (key, model) in &config.providers {
        let provider = owl_llm::chat_provider(key, model)
            .with_context(|| format!("provider '{}'", key))?;
        providers.register(provider);
    }
    Ok(NodeEnv::new(providers, Sandbox::new(config.sandbox.clone())))
}

/// Structure, snippet syntax and provider references.
fn check_workflow(workflow: &Workflow, config: &AppConfig) -> anyhow::Result<()> {
    workflow.validate()?;
    let sandbox = Sandbox::new(config.sandbox.clone());
    for node in workflow.nodes() {
        match node.strategy() {
            Strategy::Sandboxed { source } => {
                sandbox
                    .check(source)
                    .with_context(|| format!("node '{}'", node.id()))?;
            }
            Strategy::Provider { provider, .. } => {
                if !config.providers.contains_key(provider) {
                    bail!(
                        "node '{}' uses provider '{}', which is not configured",
                        node.id(),
                        provider
                    );
                }
            }
            Strategy::Pure(_) => {}
        }
    }
    Ok(())
}

fn collect_inputs(file: Option<&Path>, pairs: &[String]) -> anyhow::Result<FieldMap> {
    let mut inputs = match file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<FieldMap>(&content)
                .with_context(|| format!("{} must hold a JSON object", path.display()))?
        }
        None => FieldMap::new(),
    };
    for pair in pairs {
        let (name, value) = parse_input(pair)?;
        inputs.insert(name, value);
    }
    Ok(inputs)
}

fn parse_input(pair: &str) -> anyhow::Result<(String, Value)> {
    let Some((name, raw)) = pair.split_once('=') else {
        bail!("input '{}' must look like NAME=VALUE", pair);
    };
    if name.is_empty() {
        bail!("input '{}' has an empty name", pair);
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((name.to_string(), value))
}
