//! FAC Pipeline - Main entry point

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use fac_common::logging::{init_logging, LogConfig, LogGuard, LogLevel, LogOutput};
use fac_pipeline::credentials::{api_key_from_env, resolve_credential};
use fac_pipeline::progress::RunProgress;
use fac_pipeline::source::http::build_client;
use fac_pipeline::{pipeline, probe, Cli, Commands, PipelineConfig, PipelineError};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // A missing .env file is fine
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let guard = match init_tracing(&cli) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        },
    };

    let code = match execute_command(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, exit_code = e.exit_code(), "Command failed");
            eprintln!("{} {}", "Error:".red().bold(), e);
            e.exit_code()
        },
    };

    // process::exit skips destructors; flush file logs first
    drop(guard);
    process::exit(code);
}

fn init_tracing(cli: &Cli) -> anyhow::Result<LogGuard> {
    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Warn
    };
    let output = if cli.log_file {
        LogOutput::Both
    } else {
        LogOutput::Console
    };

    // Environment variables take precedence
    let config = LogConfig::builder()
        .level(level)
        .output(output)
        .log_file_prefix("fac-pipeline")
        .build()
        .with_env_overrides()
        .context("Invalid LOG_* environment variable")?;

    init_logging(&config)
}

async fn execute_command(command: Commands) -> fac_pipeline::Result<i32> {
    match command {
        Commands::Run {
            config,
            output,
            scratch_dir,
            keep_scratch,
            no_progress,
            summary_json,
        } => {
            let mut config = PipelineConfig::load(&config)?;
            if let Some(output) = output {
                config.settings.output_filename = output;
            }
            if let Some(dir) = scratch_dir {
                config.settings.download_directory = dir;
            }
            if keep_scratch {
                config.settings.cleanup_temp_files = false;
            }
            run(config, !no_progress && std::io::stderr().is_terminal(), summary_json).await
        },
        Commands::Validate { config } => validate(&config),
        Commands::Probe { config } => probe(&config).await,
    }
}

async fn run(
    config: PipelineConfig,
    show_progress: bool,
    summary_json: Option<PathBuf>,
) -> fac_pipeline::Result<i32> {
    let summary = pipeline::run(&config, RunProgress::new(show_progress)).await?;

    print!("{}", summary.render_text());
    if let Some(path) = summary_json {
        summary.write_json(&path)?;
        info!(path = %path.display(), "Wrote JSON summary");
    }
    Ok(0)
}

fn validate(path: &std::path::Path) -> fac_pipeline::Result<i32> {
    let config = PipelineConfig::load(path)?;
    let settings = &config.settings;

    println!("{} {}", "Configuration OK:".green().bold(), path.display());
    println!("  Output:    {}", settings.output_filename.display());
    println!("  Scratch:   {}", settings.download_directory.display());
    println!("  Join key:  {}", settings.primary_join_key);
    println!();
    println!("{}", "Datasets:".cyan().bold());
    for spec in &config.sources {
        let policy = spec
            .multiplicity
            .as_ref()
            .map(|p| format!(", {}", p))
            .unwrap_or_default();
        println!("  {:<24} {:<14} {}{}", spec.name, spec.source.as_str(), spec.role, policy);
    }

    if config.requires_credential() && api_key_from_env(&settings.api_key_env).is_none() {
        println!();
        println!(
            "{} {} is not set; run and probe will fail",
            "Note:".yellow().bold(),
            settings.api_key_env
        );
    }
    Ok(0)
}

async fn probe(path: &std::path::Path) -> fac_pipeline::Result<i32> {
    let config = PipelineConfig::load(path)?;
    let key = resolve_credential(&config)?;
    let client = build_client(config.settings.request_timeout())?;

    let results = probe::probe_sources(&config, &client, key.as_ref()).await;
    if results.is_empty() {
        println!("No paginated sources to probe.");
        return Ok(0);
    }

    for result in &results {
        let line = result.to_string();
        if result.is_ok() {
            println!("{}", line.green());
        } else {
            println!("{}", line.red());
        }
    }

    let failed = results.iter().filter(|r| !r.is_ok()).count();
    if failed > 0 {
        let err = PipelineError::source_unavailable(
            format!("{} endpoint(s)", failed),
            "probe failed",
        );
        return Err(err);
    }
    Ok(0)
}
