//! Converter stage

use crate::stage::{Outcome, Processor};
use crate::transform::Transformer;
use async_trait::async_trait;
use pixflow_common::{ErrorInfo, ErrorKind, Stage, WorkItem};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// `<stem>-converted.<ext>` next to `input`
pub fn converted_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let name = match input.extension() {
        Some(ext) => format!("{}-converted.{}", stem, ext.to_string_lossy()),
        None => format!("{}-converted", stem),
    };
    input.with_file_name(name)
}

pub struct Converter {
    transformer: Arc<dyn Transformer>,
}

impl Converter {
    pub fn new(transformer: Arc<dyn Transformer>) -> Self {
        Self { transformer }
    }
}

#[async_trait]
impl Processor for Converter {
    fn stage(&self) -> Stage {
        Stage::Converter
    }

    #[instrument(skip(self, item, _cancel), fields(url = %item.url))]
    async fn process(&self, mut item: WorkItem, _cancel: &CancellationToken) -> Outcome {
        let Some(input) = item.local_input_path.clone() else {
            return Outcome::Fail(item.fail(ErrorInfo::new(
                Stage::Converter,
                ErrorKind::Permanent,
                "no downloaded file to convert",
            )));
        };

        let output = converted_path(&input);
        match self.transformer.grayscale(&input, &output).await {
            Ok(()) => {
                info!(output = %output.display(), "Converted to grayscale");
                item.local_output_path = Some(output);
                Outcome::Forward(item)
            }
            Err(e) => Outcome::Fail(item.fail(ErrorInfo::new(
                Stage::Converter,
                ErrorKind::Permanent,
                e.to_string(),
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::transform::TransformError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransformer {
        calls: Mutex<Vec<(PathBuf, PathBuf)>>,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl Transformer for RecordingTransformer {
        async fn grayscale(&self, input: &Path, output: &Path) -> Result<(), TransformError> {
            self.calls
                .lock()
                .unwrap()
                .push((input.to_path_buf(), output.to_path_buf()));
            match &self.fail_with {
                Some(stderr) => Err(TransformError::Failed {
                    program: "convert".to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: stderr.clone(),
                }),
                None => Ok(()),
            }
        }
    }

    fn downloaded(path: &str) -> WorkItem {
        let mut item = WorkItem::new("http://example.com/cat.png");
        item.local_input_path = Some(PathBuf::from(path));
        item
    }

    #[test]
    fn test_converted_path() {
        assert_eq!(
            converted_path(Path::new("/data/cat-20240101.png")),
            PathBuf::from("/data/cat-20240101-converted.png")
        );
        assert_eq!(converted_path(Path::new("/data/raw")), PathBuf::from("/data/raw-converted"));
    }

    #[tokio::test]
    async fn test_success_sets_output_path() {
        let transformer = Arc::new(RecordingTransformer::default());
        let converter = Converter::new(transformer.clone());

        let outcome = converter
            .process(downloaded("/data/cat-1.jpg"), &CancellationToken::new())
            .await;

        let Outcome::Forward(item) = outcome else {
            panic!("expected forward, got {outcome:?}");
        };
        assert_eq!(item.local_output_path, Some(PathBuf::from("/data/cat-1-converted.jpg")));
        assert_eq!(transformer.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transform_failure_is_permanent_with_stderr() {
        let converter = Converter::new(Arc::new(RecordingTransformer {
            fail_with: Some("convert: unable to open image".to_string()),
            ..Default::default()
        }));

        let outcome = converter
            .process(downloaded("/data/cat-1.png"), &CancellationToken::new())
            .await;

        let Outcome::Fail(item) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        let error = item.error.unwrap();
        assert_eq!(error.stage, Stage::Converter);
        assert_eq!(error.kind, ErrorKind::Permanent);
        assert!(error.message.contains("unable to open image"));
        assert!(item.local_output_path.is_none());
    }

    #[tokio::test]
    async fn test_missing_input_path_fails() {
        let converter = Converter::new(Arc::new(RecordingTransformer::default()));
        let outcome = converter
            .process(WorkItem::new("http://example.com/x.png"), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, Outcome::Fail(_)));
    }
}
