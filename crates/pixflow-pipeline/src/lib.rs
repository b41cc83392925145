//! pixflow Pipeline Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Batch image-processing pipeline: a chain of stages that turn a CSV of image
//! URLs into grayscale copies in object storage, coordinated through a
//! partitioned message broker.
//!
//! # Stages
//!
//! - **Reader** ([`reader`]): validates the CSV, deduplicates URLs, publishes one
//!   message per unique URL
//! - **Downloader** ([`downloader`]): fetches with bounded retry, validates the
//!   image format, hashes and stores the bytes locally
//! - **Converter** ([`converter`]): runs the grayscale transform
//! - **Uploader** ([`uploader`]): puts the converted file into object storage
//! - **Writer** ([`sink`]): records successes and failures into CSV reports
//!
//! Every middle stage is a [`stage::Processor`] driven by the shared
//! [`stage::StageRunner`], which owns the worker lanes, outcome routing to the
//! forward or errors topic, and offset commits.
//!
//! # Example
//!
//! ```no_run
//! use pixflow_pipeline::{config::PipelineConfig, pipeline::Pipeline};
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load()?;
//!     let pipeline = Pipeline::from_config(config).await?;
//!     let summary = pipeline
//!         .run(
//!             Path::new("urls.csv"),
//!             Path::new("output.csv"),
//!             Path::new("failed.csv"),
//!             CancellationToken::new(),
//!         )
//!         .await?;
//!     println!("{} succeeded, {} failed", summary.report.success_rows, summary.report.failure_rows);
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod cli;
pub mod codec;
pub mod config;
pub mod converter;
pub mod dedup;
pub mod downloader;
pub mod error;
pub mod fetch;
pub mod health;
pub mod pipeline;
pub mod reader;
pub mod retry;
pub mod shutdown;
pub mod sink;
pub mod stage;
pub mod storage;
pub mod transform;
pub mod uploader;

// Re-export commonly used types
pub use error::{PipelineError, Result};
pub use stage::{Outcome, Processor, StageRunner};
