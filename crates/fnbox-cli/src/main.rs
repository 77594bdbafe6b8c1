//! Command-line front end for the fnbox execution engine
//!
//! `fnbox run` executes one function in a Docker sandbox and prints the
//! result envelope together with its metrics. `fnbox check` verifies that the
//! Docker daemon is reachable and shows the effective configuration. Every
//! sandbox the run created is removed before the process exits, including
//! when it is interrupted by Ctrl+C or SIGTERM.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fnbox_core::{
    ConfigLoader, DockerRuntime, EngineConfig, ExecutionEngine, FunctionRecord, InMemoryRegistry,
    Language, SandboxRuntime,
};
use log::LevelFilter;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "fnbox - run functions in pooled Docker sandboxes")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, short, help = "YAML engine configuration; defaults plus FNBOX_* overrides when omitted")]
    config: Option<PathBuf>,

    #[clap(long, short, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a function once and print its result and metrics
    Run {
        #[clap(long, help = "Function language: python or javascript")]
        language: String,

        #[clap(long, help = "Path to the function source")]
        file: PathBuf,

        #[clap(long, default_value = "null", help = "Input payload as JSON")]
        input: String,

        #[clap(long, help = "Timeout in seconds; the configured default when omitted")]
        timeout: Option<u64>,

        #[clap(long, default_value = "cli", help = "Function id, which also names the sandbox")]
        function_id: String,

        #[clap(long = "env", value_parser = parse_env_pair, help = "Environment variable for the function (KEY=VALUE)")]
        env: Vec<(String, String)>,
    },
    /// Check Docker connectivity and print the effective configuration
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    let config = match &cli.config {
        Some(path) => {
            log::info!("Loading configuration from file: {}", path.display());
            ConfigLoader::from_file(path).await?
        }
        None => ConfigLoader::from_env()?,
    };

    match cli.command {
        Commands::Run {
            language,
            file,
            input,
            timeout,
            function_id,
            env,
        } => {
            let mut record = FunctionRecord::new(function_id, language, read_source(&file).await?);
            if let Some(timeout) = timeout {
                record = record.with_timeout(timeout);
            }
            for (key, value) in env {
                record = record.with_env(key, value);
            }
            let input: Value = serde_json::from_str(&input).context("--input is not valid JSON")?;

            if !run_function(config, record, input).await? {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Check => check(config).await,
    }
}

async fn read_source(file: &Path) -> Result<String> {
    tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read function source {}", file.display()))
}

/// Returns whether the function succeeded.
async fn run_function(config: EngineConfig, record: FunctionRecord, input: Value) -> Result<bool> {
    let runtime = DockerRuntime::from_config(&config)?;
    let engine = ExecutionEngine::new(Arc::new(runtime), Arc::new(InMemoryRegistry::new()), config)?;

    let outcome = tokio::select! {
        result = engine.execute(&record.id, &record, &input) => Some(result),
        _ = shutdown_signal() => None,
    };
    engine.shutdown().await;

    let (envelope, metrics) = match outcome {
        Some(result) => result?,
        None => {
            log::warn!("Interrupted before function {} finished", record.id);
            return Ok(false);
        }
    };

    let mut report = serde_json::to_value(&envelope)?;
    report["metrics"] = serde_json::to_value(&metrics)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(envelope.is_success())
}

async fn check(config: EngineConfig) -> Result<()> {
    let runtime = DockerRuntime::from_config(&config)?;
    runtime
        .ping()
        .await
        .context("Docker daemon is not reachable")?;

    println!("Docker daemon: reachable");
    println!("Container prefix: {}", config.container_prefix);
    println!(
        "Memory limit: {} ({} bytes)",
        config.memory_limit,
        config.memory_limit_bytes()?
    );
    println!("CPU quota: {} of one core", config.cpu_quota);
    println!("Default timeout: {}s", config.default_timeout_secs);
    for language in Language::ALL {
        println!("Image for {}: {}", language, config.image_for(language));
    }
    Ok(())
}

fn parse_env_pair(pair: &str) -> Result<(String, String), String> {
    match pair.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", pair)),
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
