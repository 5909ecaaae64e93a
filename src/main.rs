mod cli;

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use clap::Parser;
use colored::Colorize;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, ConfigCommands, RunArgs, StateCommands};
use sqlbackup_cli::core::config::{prompt_config, prompt_required};
use sqlbackup_cli::core::{
    exit_code_for, BackupConfig, CheckpointStore, ConsoleReporter, Gateways, Orchestrator,
    PipelineError, RunContext, RunFailure, RunReport, RunState, Stage,
};
use sqlbackup_cli::utils::{default_output_dir, format_bytes, format_duration, mask_sensitive, AppConfig};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        None => handle_run(RunArgs::default()).await,
        Some(Commands::Run(args)) => handle_run(args).await,
        Some(Commands::Config { command }) => handle_config(command),
        Some(Commands::State { command }) => handle_state(command),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Pick the configuration: interactive, explicit file, saved default, or ask for a path
fn resolve_config(args: &RunArgs, prefs: &AppConfig) -> Result<BackupConfig> {
    if args.interactive {
        let mut config = prompt_config()?;
        config.fill_secrets_from_env();
        return Ok(config);
    }

    let path = match (&args.config, &prefs.default_config) {
        (Some(path), _) => path.clone(),
        (None, Some(saved)) => PathBuf::from(saved),
        (None, None) => {
            let stdin = io::stdin();
            let mut input = stdin.lock();
            PathBuf::from(prompt_required(
                &mut input,
                "Enter the path to the configuration JSON file: ",
            )?)
        }
    };

    BackupConfig::load(&path).map_err(|e| {
        anyhow::Error::new(PipelineError::ConfigurationInvalid(format!("{:#}", e)))
    })
}

fn resolve_output_dir(args: &RunArgs, config: &BackupConfig, prefs: &AppConfig) -> PathBuf {
    args.output
        .clone()
        .or_else(|| config.local_dir.as_ref().map(PathBuf::from))
        .or_else(|| prefs.output_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(default_output_dir)
}

async fn handle_run(args: RunArgs) -> Result<()> {
    let prefs = AppConfig::load().unwrap_or_default();
    let config = resolve_config(&args, &prefs)?;

    if let Some(state_path) = &args.resume {
        return resume_run(&config, state_path).await;
    }

    let output_dir = resolve_output_dir(&args, &config, &prefs);
    let ctx = RunContext::from_config(&config, Local::now().naive_local(), &output_dir)?;
    debug!(run = %ctx.run_name, output = %output_dir.display(), "run context created");

    if args.dry_run {
        print_plan(&ctx);
        return Ok(());
    }

    println!("Starting backup run {} ({} mode)\n", ctx.run_name.bold(), ctx.mode);
    let orchestrator = Orchestrator::new(ctx.clone(), Gateways::for_context(&ctx), Arc::new(ConsoleReporter::new()));
    finish(orchestrator.run().await)
}

async fn resume_run(config: &BackupConfig, state_path: &Path) -> Result<()> {
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(PipelineError::ConfigurationInvalid(errors.join("; ")).into());
    }

    let state = CheckpointStore::load(state_path)
        .and_then(RunState::reopen)
        .map_err(|e| anyhow::Error::new(PipelineError::ConfigurationInvalid(format!("{:#}", e))))?;
    let ctx = state.context.clone().with_credentials(config);

    let next = state
        .last_completed
        .map(|s| format!("after {}", s))
        .unwrap_or_else(|| "from the start".to_string());
    println!("Resuming backup run {} {}\n", ctx.run_name.bold(), next);

    let orchestrator = Orchestrator::new(ctx.clone(), Gateways::for_context(&ctx), Arc::new(ConsoleReporter::new()));
    finish(orchestrator.resume(state).await)
}

fn finish(result: std::result::Result<RunReport, RunFailure>) -> Result<()> {
    match result {
        Ok(report) => {
            println!(
                "\n{} Backup process completed successfully in {}",
                "✔".green().bold(),
                format_duration(report.elapsed)
            );
            println!("  Archive: {}", report.archive_path.display());
            if let Some(receipt) = &report.receipt {
                println!(
                    "  Object:  {}/{} ({})",
                    receipt.bucket,
                    receipt.key,
                    format_bytes(receipt.bytes)
                );
            }
            Ok(())
        }
        Err(failure) => {
            eprintln!(
                "\n{} Backup run aborted at stage {}.",
                "✘".red().bold(),
                failure.stage
            );
            eprintln!("  Partial runs may leave backup files on the server, in the container or locally;");
            eprintln!("  check them and clean up manually if needed.");
            if let Some(command) = failure.resume_command() {
                eprintln!("  Run state: {}", failure.checkpoint.display());
                eprintln!("  Resume with: {}", command);
            }
            Err(anyhow::Error::new(failure))
        }
    }
}

fn print_plan(ctx: &RunContext) {
    println!("Dry run: {} ({} mode)\n", ctx.run_name.bold(), ctx.mode);
    for (i, stage) in Stage::plan(ctx.mode).into_iter().enumerate() {
        println!("  {:>2}. {:<32} {}", i + 1, stage.label(), stage.describe(ctx).dimmed());
    }
    println!("\nRun state: {}", ctx.checkpoint_path.display());
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { path } => {
            let path = match path {
                Some(path) => path,
                None => AppConfig::load()?
                    .default_config
                    .map(PathBuf::from)
                    .ok_or_else(|| anyhow!("No configuration given and no default set"))?,
            };
            let config = BackupConfig::load(&path).map_err(|e| {
                anyhow::Error::new(PipelineError::ConfigurationInvalid(format!("{:#}", e)))
            })?;

            let errors = config.validate();
            if errors.is_empty() {
                println!("✓ {} is valid ({} mode)", path.display(), config.deployment_mode());
                println!("  Server:     {}@{}", config.ssh_user, config.server_ip);
                println!("  SQL Server: {}", config.sql_server_address);
                println!(
                    "  Storage:    {}/{} (key {})",
                    config.minio_endpoint,
                    config.bucket_name,
                    mask_sensitive(&config.minio_access_key, 4)
                );
                Ok(())
            } else {
                println!("✗ {} has {} problem(s):", path.display(), errors.len());
                for error in &errors {
                    println!("  - {}", error);
                }
                Err(PipelineError::ConfigurationInvalid(errors.join("; ")).into())
            }
        }
        ConfigCommands::Template => {
            let template = serde_json::to_string_pretty(&BackupConfig::template())
                .context("Failed to render configuration template")?;
            println!("{}", template);
            Ok(())
        }
        ConfigCommands::SetDefault { path, output_dir } => {
            let mut prefs = AppConfig::load()?;
            if let Some(dir) = output_dir {
                prefs.output_dir = Some(dir.to_string_lossy().to_string());
            }
            prefs.set_default_config(&path)?;
            println!("✓ Default configuration set to {}", path.display());
            if let Some(dir) = &prefs.output_dir {
                println!("✓ Default output directory: {}", dir);
            }
            Ok(())
        }
    }
}

fn handle_state(command: StateCommands) -> Result<()> {
    match command {
        StateCommands::Show { path } => {
            let state = CheckpointStore::load(&path)?;
            let ctx = &state.context;

            println!("Run:            {}", ctx.run_name.bold());
            println!("Mode:           {}", ctx.mode);
            println!("Status:         {:?}", state.status);
            println!(
                "Last completed: {}",
                state
                    .last_completed
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            if let Some(stage) = state.failed_stage {
                println!("Failed stage:   {}", stage.to_string().red());
            }
            if let Some(error) = &state.error {
                println!("Error:          {}", error);
            }
            if let Some(artifacts) = &state.artifacts {
                println!("Artifacts at:   {}", artifacts.location());
                for file in artifacts.files() {
                    println!("  - {}", file);
                }
            }
            println!("Archive:        {}", ctx.archive_path.display());
            println!("Updated:        {}", state.updated_at.to_rfc3339());
            Ok(())
        }
    }
}
