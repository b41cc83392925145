//! pixflow - Main entry point

use anyhow::Context;
use clap::Parser;
use pixflow_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use pixflow_common::Stage;
use pixflow_pipeline::app;
use pixflow_pipeline::cli::{Cli, Commands};
use pixflow_pipeline::config::PipelineConfig;
use pixflow_pipeline::shutdown::shutdown_token;
use std::process;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("pixflow")
        .filter_directives(if cli.verbose {
            "pixflow_pipeline=debug,pixflow_broker=debug,aws=warn,hyper=warn"
        } else {
            "pixflow_pipeline=info,pixflow_broker=info,aws=warn,hyper=warn"
        })
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        }
    };

    if let Err(e) = execute_command(&cli).await {
        error!(error = %format!("{:#}", e), "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<PipelineConfig> {
    dotenvy::dotenv().ok();
    let mut config = PipelineConfig::from_env().context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn execute_command(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    info!(
        broker = %config.broker.backend,
        output_dir = %config.output_dir.display(),
        workers = config.workers,
        "Configuration loaded"
    );
    let cancel = shutdown_token();

    match &cli.command {
        Commands::Run {
            input,
            success,
            failed,
        } => {
            let summary = app::run_pipeline(config, input, success, failed, cancel).await?;
            println!(
                "Processed {} rows: {} published, {} duplicates, {} invalid",
                summary.reader.rows,
                summary.reader.published,
                summary.reader.duplicates,
                summary.reader.row_errors.len()
            );
            for row_error in &summary.reader.row_errors {
                println!("  {}", row_error);
            }
            println!(
                "{} succeeded ({}), {} failed ({})",
                summary.report.success_rows,
                success.display(),
                summary.report.failure_rows,
                failed.display()
            );
        }

        Commands::Read { input } => {
            let summary = app::run_reader(&config, input, cancel).await?;
            println!(
                "Published {} of {} rows ({} duplicates, {} invalid)",
                summary.published,
                summary.rows,
                summary.duplicates,
                summary.row_errors.len()
            );
        }

        Commands::Download => {
            app::run_stage(&config, Stage::Downloader, cancel).await?;
        }

        Commands::Convert => {
            app::run_stage(&config, Stage::Converter, cancel).await?;
        }

        Commands::Upload => {
            app::run_stage(&config, Stage::Uploader, cancel).await?;
        }

        Commands::Write { success, failed } => {
            let counts = app::run_writer(&config, success, failed, cancel).await?;
            println!(
                "Wrote {} success rows and {} failure rows",
                counts.success_rows, counts.failure_rows
            );
        }
    }

    Ok(())
}
