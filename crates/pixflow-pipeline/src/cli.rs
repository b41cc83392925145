//! Command-line interface

use crate::config::{BrokerBackend, PipelineConfig};
use crate::storage::StoreBackend;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// pixflow - batch grayscale image pipeline
#[derive(Parser, Debug)]
#[command(name = "pixflow")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory for downloaded and converted files
    #[arg(long, env = "PIXFLOW_OUTPUT_DIR", global = true)]
    pub output_dir: Option<PathBuf>,

    /// Download retries after the first attempt
    #[arg(long, env = "PIXFLOW_MAX_RETRIES", global = true)]
    pub max_retries: Option<u32>,

    /// Worker lanes per stage
    #[arg(long, env = "PIXFLOW_WORKERS", global = true)]
    pub workers: Option<usize>,

    /// Health/metrics port, 0 to disable
    #[arg(long, env = "PIXFLOW_METRICS_PORT", global = true)]
    pub metrics_port: Option<u16>,

    /// Comma-separated Kafka bootstrap servers; selects the Kafka backend
    #[arg(long, env = "PIXFLOW_BROKERS", value_delimiter = ',', global = true)]
    pub brokers: Option<Vec<String>>,

    /// Object store for converted images
    #[arg(long, env = "PIXFLOW_STORE", global = true)]
    pub store: Option<StoreBackend>,

    /// Persist seen URLs to this file so reruns skip them
    #[arg(long, env = "PIXFLOW_DEDUP_STORE", global = true)]
    pub dedup_store: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every stage in this process on an in-memory broker
    Run {
        /// CSV file with a `url` header
        #[arg(short, long)]
        input: PathBuf,

        /// Success report
        #[arg(short, long, default_value = "output.csv")]
        success: PathBuf,

        /// Failure report
        #[arg(short, long, default_value = "failed.csv")]
        failed: PathBuf,
    },

    /// Publish the URLs of a CSV file
    Read {
        /// CSV file with a `url` header
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Run the Downloader stage
    Download,

    /// Run the Converter stage
    Convert,

    /// Run the Uploader stage
    Upload,

    /// Run the Writer stage
    Write {
        /// Success report
        #[arg(short, long, default_value = "output.csv")]
        success: PathBuf,

        /// Failure report
        #[arg(short, long, default_value = "failed.csv")]
        failed: PathBuf,
    },
}

impl Cli {
    /// Apply command-line overrides on top of environment configuration
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(max_retries) = self.max_retries {
            config.retry.max_retries = max_retries;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(port) = self.metrics_port {
            config.metrics_port = port;
        }
        if let Some(brokers) = &self.brokers {
            config.broker.brokers = brokers.clone();
            // `run` always uses the in-memory broker
            if !matches!(self.command, Commands::Run { .. }) {
                config.broker.backend = BrokerBackend::Kafka;
            }
        }
        if let Some(store) = self.store {
            config.storage.backend = store;
        }
        if let Some(path) = &self.dedup_store {
            config.dedup_store = Some(path.clone());
        }
    }
}
