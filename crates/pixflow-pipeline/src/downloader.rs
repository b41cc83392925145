//! Downloader stage
//!
//! One streaming pass per attempt: every body chunk is written to a partial
//! file, fed to the content hasher and appended to the decode buffer. The
//! format is sniffed from the first bytes so non-image bodies stop early, and
//! the full body is decoded before the file is renamed into place.

use crate::fetch::{FetchError, HttpFetcher};
use crate::health::StageMetrics;
use crate::retry::{retry, RetryError, RetryPolicy, Retryable};
use crate::stage::{Outcome, Processor};
use async_trait::async_trait;
use futures::StreamExt;
use image::ImageFormat;
use pixflow_common::checksum::ContentHasher;
use pixflow_common::{ContentHash, ErrorInfo, ErrorKind, Stage, WorkItem};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Bytes needed before the format is sniffed
const SNIFF_LEN: usize = 16;

/// Fallback stem for URLs without a usable file name
const DEFAULT_STEM: &str = "image";

/// Stem length limit, keeps generated names well under filesystem limits
const MAX_STEM_LEN: usize = 100;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("request failed: {0}")]
    Network(String),

    #[error("HTTP status {status}{}", reason_suffix(.reason))]
    Status {
        status: u16,
        reason: Option<&'static str>,
    },

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("image could not be decoded: {0}")]
    Undecodable(String),

    #[error("local file error at {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn reason_suffix(reason: &Option<&'static str>) -> String {
    reason.map(|r| format!(" ({})", r)).unwrap_or_default()
}

impl DownloadError {
    fn status(status: u16) -> Self {
        DownloadError::Status {
            status,
            reason: reqwest::StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DownloadError::Network(_) | DownloadError::Status { .. } => ErrorKind::Transient,
            DownloadError::UnsupportedFormat(_) | DownloadError::Undecodable(_) => ErrorKind::Permanent,
            DownloadError::LocalIo { .. } => ErrorKind::LocalIo,
        }
    }
}

impl From<FetchError> for DownloadError {
    fn from(e: FetchError) -> Self {
        DownloadError::Network(e.to_string())
    }
}

impl Retryable for DownloadError {
    fn is_transient(&self) -> bool {
        should_retry(self)
    }
}

/// Network failures and non-2xx responses are worth another attempt
pub fn should_retry(error: &DownloadError) -> bool {
    matches!(error, DownloadError::Network(_) | DownloadError::Status { .. })
}

/// A validated image on local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub path: PathBuf,
    pub hash: ContentHash,
    pub format: ImageFormat,
    pub bytes: u64,
}

/// Sanitised file stem derived from the URL's last path segment
pub fn file_stem_for(url: &str) -> String {
    let segment = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .unwrap_or_default();

    let stem = match segment.rsplit_once('.') {
        Some((stem, _ext)) => stem,
        None => segment.as_str(),
    };

    let sanitized: String = stem
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_STEM_LEN)
        .collect();

    if sanitized.is_empty() {
        DEFAULT_STEM.to_string()
    } else {
        sanitized
    }
}

/// Timestamp plus a short random component
pub fn unique_token() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%3f"),
        &random[..8]
    )
}

fn extension_for(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Png => Some("png"),
        ImageFormat::Jpeg => Some("jpg"),
        ImageFormat::Gif => Some("gif"),
        _ => None,
    }
}

/// Check the leading bytes against the supported signatures
fn sniff(prefix: &[u8]) -> Result<ImageFormat, DownloadError> {
    let format = image::guess_format(prefix)
        .map_err(|_| DownloadError::UnsupportedFormat("unrecognised file signature".to_string()))?;
    match extension_for(format) {
        Some(_) => Ok(format),
        None => Err(DownloadError::UnsupportedFormat(format!("{:?}", format))),
    }
}

pub struct Downloader {
    fetcher: Arc<dyn HttpFetcher>,
    policy: RetryPolicy,
    output_dir: PathBuf,
    metrics: Option<Arc<StageMetrics>>,
}

impl Downloader {
    pub fn new(fetcher: Arc<dyn HttpFetcher>, policy: RetryPolicy, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            policy,
            output_dir: output_dir.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<StageMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Download `url` under the retry policy, returning the file and attempt count
    pub async fn download(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<(Downloaded, u32), RetryError<DownloadError>> {
        let result = retry(&self.policy, cancel, "download", |attempt| async move {
            debug!(url, attempt, "Fetching");
            self.attempt(url).await
        })
        .await;

        if let Some(metrics) = &self.metrics {
            let attempts = match &result {
                Ok((_, attempts)) => *attempts,
                Err(e) => e.attempts(),
            };
            metrics.record_retries(attempts.saturating_sub(1));
        }
        result
    }

    async fn attempt(&self, url: &str) -> Result<Downloaded, DownloadError> {
        let response = self.fetcher.get(url).await?;
        if !(200..300).contains(&response.status) {
            return Err(DownloadError::status(response.status));
        }

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| DownloadError::LocalIo {
                path: self.output_dir.clone(),
                source,
            })?;

        let base = self
            .output_dir
            .join(format!("{}-{}", file_stem_for(url), unique_token()));
        let partial = base.with_extension("part");

        let result = stream_to_file(&partial, response.body, response.content_length).await;
        let (hash, buffer, format) = match result {
            Ok(streamed) => streamed,
            Err(e) => {
                remove_quietly(&partial).await;
                return Err(e);
            }
        };

        // Full decode off the async runtime; the buffer is dropped afterwards
        let bytes = buffer.len() as u64;
        let decoded = tokio::task::spawn_blocking(move || {
            image::load_from_memory_with_format(&buffer, format).map(|_| ())
        })
        .await;
        let decode_error = match decoded {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(format!("decoder task failed: {}", e)),
        };
        if let Some(reason) = decode_error {
            remove_quietly(&partial).await;
            return Err(DownloadError::Undecodable(reason));
        }

        let ext = extension_for(format).unwrap_or("img");
        let path = base.with_extension(ext);
        if let Err(source) = tokio::fs::rename(&partial, &path).await {
            remove_quietly(&partial).await;
            return Err(DownloadError::LocalIo { path, source });
        }

        Ok(Downloaded {
            path,
            hash,
            format,
            bytes,
        })
    }
}

async fn stream_to_file(
    path: &Path,
    mut body: crate::fetch::ByteStream,
    content_length: Option<u64>,
) -> Result<(ContentHash, Vec<u8>, ImageFormat), DownloadError> {
    let io_err = |source| DownloadError::LocalIo {
        path: path.to_path_buf(),
        source,
    };

    let mut file = tokio::fs::File::create(path).await.map_err(io_err)?;
    let mut hasher = ContentHasher::new();
    let capacity = content_length.unwrap_or(0).min(64 * 1024 * 1024) as usize;
    let mut buffer = Vec::with_capacity(capacity);
    let mut format = None;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| DownloadError::Network(e.to_string()))?;
        file.write_all(&chunk).await.map_err(io_err)?;
        hasher.update(&chunk);
        buffer.extend_from_slice(&chunk);

        if format.is_none() && buffer.len() >= SNIFF_LEN {
            format = Some(sniff(&buffer)?);
        }
    }

    file.flush().await.map_err(io_err)?;

    if buffer.is_empty() {
        return Err(DownloadError::Undecodable("empty response body".to_string()));
    }
    let format = match format {
        Some(format) => format,
        None => sniff(&buffer)?,
    };

    Ok((hasher.finalize(), buffer, format))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial download");
        }
    }
}

#[async_trait]
impl Processor for Downloader {
    fn stage(&self) -> Stage {
        Stage::Downloader
    }

    #[instrument(skip(self, item, cancel), fields(url = %item.url))]
    async fn process(&self, mut item: WorkItem, cancel: &CancellationToken) -> Outcome {
        match self.download(&item.url, cancel).await {
            Ok((downloaded, attempts)) => {
                info!(
                    path = %downloaded.path.display(),
                    bytes = downloaded.bytes,
                    format = ?downloaded.format,
                    attempts,
                    "Downloaded"
                );
                item.local_input_path = Some(downloaded.path);
                item.content_hash = Some(downloaded.hash);
                Outcome::Forward(item)
            }
            Err(RetryError::Cancelled { attempts, .. }) => {
                info!(attempts, "Download cancelled during backoff");
                Outcome::Abandon(item)
            }
            Err(err) => {
                let attempts = err.attempts();
                let error = err.into_error();
                Outcome::Fail(item.fail(
                    ErrorInfo::new(Stage::Downloader, error.kind(), error.to_string())
                        .with_attempts(attempts),
                ))
            }
        }
    }
}
