//! `pipeflow` command line interface.
//!
//! Thin front end over the core engine: resolves a pipeline's plugin,
//! runs it to a terminal status, and mirrors the job journal to the
//! terminal as it streams in.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use pf_core::config::load_config;
use pf_core::engine::PipelineEngine;
use pf_core::registry::{DirectorySource, PluginRegistry};
use pf_core::sink::{FileSink, JobSink, SinkError};
use pf_core::supervisor::PluginSupervisor;
use pf_protocol::models::{LogRecord, LogStream, RunStatus, StepResult};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "pipeflow", version)]
#[command(about = "Run pipelines through their plugin executables")]
struct Cli {
    /// Path to the configuration file (default: <home>/pipeflow.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Pipeflow home directory, overriding the configured one
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Directory holding built plugin executables, overriding the configured one
    #[arg(long, global = true)]
    plugins_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the steps a pipeline's plugin declares
    Describe {
        /// Pipeline identifier (the plugin executable's file name)
        pipeline: String,
    },
    /// Execute a pipeline run to completion
    Run {
        /// Pipeline identifier (the plugin executable's file name)
        pipeline: String,
    },
}

/// Sink that journals to disk and mirrors every record to the terminal.
struct ConsoleSink {
    inner: FileSink,
}

#[async_trait]
impl JobSink for ConsoleSink {
    async fn append_log(&self, record: LogRecord) -> Result<(), SinkError> {
        let line = match record.stream {
            LogStream::Stdout => record.line.normal(),
            LogStream::Stderr => record.line.yellow(),
        };
        println!("{} {}", format!("[step {}]", record.step_index).dimmed(), line);
        self.inner.append_log(record).await
    }

    async fn record_step_result(&self, job_id: Uuid, result: StepResult) -> Result<(), SinkError> {
        let verdict = if result.succeeded() {
            "ok".green()
        } else {
            format!("exit {}", result.exit_status).red()
        };
        println!(
            "{} {} ({} ms)",
            format!("[step {}]", result.step_index).dimmed(),
            verdict,
            result.duration_ms
        );
        if let Some(message) = &result.error_message {
            println!("{} {}", "error:".red().bold(), message);
        }
        self.inner.record_step_result(job_id, result).await
    }

    async fn set_job_status(&self, job_id: Uuid, status: RunStatus) -> Result<(), SinkError> {
        self.inner.set_job_status(job_id, status).await
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = {
        let home = cli.home.clone().unwrap_or_else(|| PathBuf::from(".pipeflow"));
        let path = cli.config.clone().unwrap_or_else(|| home.join("pipeflow.toml"));
        load_config(&path)?
    };
    if let Some(home) = cli.home {
        config.home_path = home;
    }
    if let Some(plugins_root) = cli.plugins_root {
        config.plugins_root = Some(plugins_root);
    }

    let supervisor = PluginSupervisor::new(config.supervisor_config());
    let registry = Arc::new(PluginRegistry::new(
        Arc::new(DirectorySource::new(config.plugins_root())),
        supervisor.clone(),
    ));

    match cli.command {
        Command::Describe { pipeline } => {
            let descriptor = registry.resolve(&pipeline).await?;
            println!(
                "{} {}",
                pipeline.bold(),
                format!("({})", descriptor.executable_path.display()).dimmed()
            );
            for step in &descriptor.declared_steps {
                println!("  {}. {}", step.index, step.name);
            }
            Ok(())
        }
        Command::Run { pipeline } => {
            let sink = Arc::new(ConsoleSink {
                inner: FileSink::new(config.jobs_root()).await?,
            });
            let engine = PipelineEngine::new(
                supervisor,
                registry,
                Arc::clone(&sink) as Arc<dyn JobSink>,
                config.session_timeouts(),
            );

            let (cancel_tx, cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("{}", "cancelling run...".yellow());
                    let _ = cancel_tx.send(true);
                }
            });

            let report = engine.run_pipeline(&pipeline, cancel_rx).await?;

            let status = match report.status {
                RunStatus::Succeeded => "SUCCEEDED".green().bold(),
                RunStatus::Cancelled => "CANCELLED".yellow().bold(),
                other => format!("{other:?}").to_uppercase().red().bold(),
            };
            println!("{} {} {}", pipeline.bold(), status, format!("job {}", report.job_id).dimmed());

            if report.status != RunStatus::Succeeded {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
