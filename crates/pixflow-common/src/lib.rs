//! pixflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the pixflow pipeline.
//!
//! # Overview
//!
//! This crate provides common functionality used across all pixflow workspace members:
//!
//! - **Error Handling**: Custom error types and result types
//! - **Checksums**: Streaming content hashing for downloaded images
//! - **Types**: The `WorkItem` that flows between stages and its error annotation
//! - **Logging**: Centralized `tracing` subscriber setup
//!
//! # Example
//!
//! ```no_run
//! use pixflow_common::checksum::ContentHasher;
//!
//! let mut hasher = ContentHasher::new();
//! hasher.update(b"\x89PNG");
//! let hash = hasher.finalize();
//! println!("content hash: {}", hash);
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{PixflowError, Result};
pub use types::{ContentHash, ErrorInfo, ErrorKind, Stage, WorkItem};
