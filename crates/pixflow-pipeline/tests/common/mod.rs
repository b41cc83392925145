//! Shared fixtures for pipeline integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use pixflow_pipeline::config::PipelineConfig;
use pixflow_pipeline::dedup::MemoryDeduplicator;
use pixflow_pipeline::fetch::ReqwestFetcher;
use pixflow_pipeline::pipeline::PipelineParts;
use pixflow_pipeline::retry::RetryPolicy;
use pixflow_pipeline::storage::{LocalObjectStore, StorageConfig};
use pixflow_pipeline::transform::{TransformError, Transformer};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A small colour image encoded in `format`
pub fn image_bytes(format: ImageFormat) -> Vec<u8> {
    let mut img = RgbImage::new(8, 8);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        *pixel = Rgb([(x * 30) as u8, (y * 30) as u8, 128]);
    }
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), format)
        .unwrap();
    buf
}

pub fn png_bytes() -> Vec<u8> {
    image_bytes(ImageFormat::Png)
}

pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// Rows of a CSV file, header included
pub fn read_rows(path: &Path) -> Vec<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .unwrap();
    reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect()
}

/// Retry policy that keeps tests fast
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(1),
        multiplier: 2.0,
        max_delay: Duration::from_millis(5),
    }
}

/// Copies the input unchanged; stands in for ImageMagick
#[derive(Default)]
pub struct CopyTransformer;

#[async_trait]
impl Transformer for CopyTransformer {
    async fn grayscale(&self, input: &Path, output: &Path) -> Result<(), TransformError> {
        tokio::fs::copy(input, output)
            .await
            .map(|_| ())
            .map_err(|e| TransformError::Failed {
                program: "copy".to_string(),
                status: "exit status: 1".to_string(),
                stderr: e.to_string(),
            })
    }
}

/// Workspace for one end-to-end run
pub struct Fixture {
    pub dir: TempDir,
    pub config: PipelineConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = PipelineConfig {
            output_dir: dir.path().join("data"),
            workers: 2,
            metrics_port: 0,
            flush_every: 1,
            flush_interval_secs: 1,
            storage: StorageConfig::for_local(dir.path().join("bucket")),
            ..PipelineConfig::default()
        };
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        Self { dir, config }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn parts(&self) -> PipelineParts {
        PipelineParts {
            fetcher: Arc::new(ReqwestFetcher::new(Duration::from_secs(5)).unwrap()),
            transformer: Arc::new(CopyTransformer),
            store: Arc::new(LocalObjectStore::new(self.config.storage.local_dir.clone())),
            dedup: Arc::new(MemoryDeduplicator::new()),
        }
    }
}
