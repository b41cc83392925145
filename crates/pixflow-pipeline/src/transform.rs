//! Grayscale transformers used by the Converter

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("cannot start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("image transform failed for {path}: {reason}")]
    Image { path: PathBuf, reason: String },

    #[error("transform task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait Transformer: Send + Sync {
    /// Write a grayscale copy of `input` to `output`
    async fn grayscale(&self, input: &Path, output: &Path) -> Result<(), TransformError>;
}

/// Runs an external program; `{input}` and `{output}` in its arguments are
/// replaced with the item's paths
#[derive(Debug, Clone)]
pub struct CommandTransformer {
    program: String,
    args: Vec<String>,
}

impl CommandTransformer {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn render_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }
}

#[async_trait]
impl Transformer for CommandTransformer {
    async fn grayscale(&self, input: &Path, output: &Path) -> Result<(), TransformError> {
        let args = self.render_args(input, output);
        debug!(program = %self.program, ?args, "Running transform");

        let result = tokio::process::Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| TransformError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if result.status.success() {
            return Ok(());
        }

        Err(TransformError::Failed {
            program: self.program.clone(),
            status: result.status.to_string(),
            stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
        })
    }
}

/// Pure-Rust grayscale via the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeTransformer;

impl NativeTransformer {
    fn convert(input: &Path, output: &Path) -> Result<(), TransformError> {
        let image_err = |path: &Path, e: image::ImageError| TransformError::Image {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let format = ImageFormat::from_path(output).map_err(|e| image_err(output, e))?;
        let gray = image::open(input).map_err(|e| image_err(input, e))?.grayscale();

        // Match each encoder's accepted colour types
        let encodable = match format {
            ImageFormat::Jpeg => DynamicImage::ImageLuma8(gray.to_luma8()),
            ImageFormat::Gif => DynamicImage::ImageRgba8(gray.to_rgba8()),
            _ => gray,
        };
        encodable
            .save_with_format(output, format)
            .map_err(|e| image_err(output, e))
    }
}

#[async_trait]
impl Transformer for NativeTransformer {
    async fn grayscale(&self, input: &Path, output: &Path) -> Result<(), TransformError> {
        let (input, output) = (input.to_path_buf(), output.to_path_buf());
        tokio::task::spawn_blocking(move || Self::convert(&input, &output))
            .await
            .map_err(|e| TransformError::Task(e.to_string()))?
    }
}
