//! Ingest/Reader stage
//!
//! Parses the input CSV, deduplicates URLs and publishes one `ingest` message
//! per unique well-formed row. Header problems and an unreadable file are
//! fatal; bad rows are reported and skipped.

use crate::codec::{self, Payload};
use crate::dedup::{DedupError, Deduplicator};
use pixflow_broker::{Broker, BrokerError};
use pixflow_common::WorkItem;
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Rows buffered between the CSV parser thread and the publisher
const ROW_BUFFER: usize = 256;

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("cannot open input file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("input file is empty")]
    EmptyInput,

    #[error("invalid input format: {0}")]
    InvalidFormat(String),

    #[error(transparent)]
    Dedup(#[from] DedupError),

    #[error("failed to publish to '{topic}': {source}")]
    Publish {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to encode message: {0}")]
    Encode(#[from] codec::CodecError),

    #[error("CSV parser task failed: {0}")]
    Join(String),
}

/// A row that could not be turned into a URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    /// 1-based line in the input file
    pub line: u64,
    pub message: String,
}

impl std::fmt::Display for RowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReaderSummary {
    /// Data rows seen, excluding the header
    pub rows: u64,
    pub published: u64,
    pub duplicates: u64,
    pub row_errors: Vec<RowError>,
}

/// Data rows of a validated URL CSV
pub struct UrlRows<R> {
    records: csv::StringRecordsIntoIter<R>,
}

impl UrlRows<File> {
    pub fn open(path: &Path) -> Result<Self, ReaderError> {
        let file = File::open(path).map_err(|source| ReaderError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(file)
    }
}

impl<R: Read> UrlRows<R> {
    /// Validate the header row and position the iterator on the first data row
    pub fn from_reader(reader: R) -> Result<Self, ReaderError> {
        let mut records = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader)
            .into_records();

        let header = match records.next() {
            None => return Err(ReaderError::EmptyInput),
            Some(Err(e)) => return Err(ReaderError::InvalidFormat(e.to_string())),
            Some(Ok(record)) => record,
        };

        let first = header
            .get(0)
            .map(|h| h.trim_start_matches('\u{feff}').trim())
            .unwrap_or_default();
        if !first.eq_ignore_ascii_case("url") {
            return Err(ReaderError::InvalidFormat(format!(
                "expected header 'url', found '{}'",
                first
            )));
        }
        if header.len() != 1 {
            return Err(ReaderError::InvalidFormat(format!(
                "expected a single 'url' column, found {} columns",
                header.len()
            )));
        }

        Ok(Self { records })
    }
}

impl<R: Read> Iterator for UrlRows<R> {
    type Item = Result<String, RowError>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = match self.records.next()? {
            Ok(record) => record,
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or_default();
                return Some(Err(RowError {
                    line,
                    message: e.to_string(),
                }));
            }
        };
        let line = record.position().map(|p| p.line()).unwrap_or_default();

        if record.len() != 1 {
            return Some(Err(RowError {
                line,
                message: format!("expected 1 column, found {}", record.len()),
            }));
        }

        Some(validate_url(&record[0]).map_err(|message| RowError { line, message }))
    }
}

/// Accept absolute http(s) URLs only
///
/// The URL is returned as written so it keys messages and report rows
/// exactly as it appeared in the input. Control characters are rejected
/// because the parser would silently strip them.
pub fn validate_url(raw: &str) -> Result<String, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty url".to_string());
    }
    if raw.chars().any(char::is_control) {
        return Err(format!("url {:?} contains control characters", raw));
    }
    let parsed = Url::parse(raw).map_err(|e| format!("invalid url '{}': {}", raw, e))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(raw.to_string()),
        "http" | "https" => Err(format!("url '{}' has no host", raw)),
        other => Err(format!("unsupported scheme '{}' in '{}'", other, raw)),
    }
}

pub struct Reader {
    broker: Arc<dyn Broker>,
    topic: String,
    dedup: Arc<dyn Deduplicator>,
}

impl Reader {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>, dedup: Arc<dyn Deduplicator>) -> Self {
        Self {
            broker,
            topic: topic.into(),
            dedup,
        }
    }

    /// Validate `path` and publish its rows.
    ///
    /// Opening and header validation happen before anything is published, so
    /// an `Open`, `EmptyInput` or `InvalidFormat` error means nothing was sent.
    #[instrument(skip(self, cancel), fields(path = %path.display()))]
    pub async fn run(&self, path: &Path, cancel: &CancellationToken) -> Result<ReaderSummary, ReaderError> {
        let rows = Self::open(path).await?;
        self.publish_rows(rows, cancel).await
    }

    /// Open `path` and validate its header off the async runtime
    pub async fn open(path: &Path) -> Result<UrlRows<File>, ReaderError> {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || UrlRows::open(&owned))
            .await
            .map_err(|e| ReaderError::Join(e.to_string()))?
    }

    /// Publish every unique well-formed row of an already validated input
    #[instrument(skip_all, fields(topic = %self.topic))]
    pub async fn publish_rows(
        &self,
        rows: UrlRows<File>,
        cancel: &CancellationToken,
    ) -> Result<ReaderSummary, ReaderError> {
        let (tx, mut rx) = mpsc::channel(ROW_BUFFER);
        let parser = tokio::task::spawn_blocking(move || {
            for row in rows {
                if tx.blocking_send(row).is_err() {
                    break;
                }
            }
        });

        let mut summary = ReaderSummary::default();
        while let Some(row) = rx.recv().await {
            if cancel.is_cancelled() {
                warn!(published = summary.published, "Reader cancelled before end of input");
                break;
            }
            summary.rows += 1;
            match row {
                Ok(url) => self.publish_url(&url, &mut summary).await?,
                Err(row_error) => {
                    warn!(line = row_error.line, error = %row_error.message, "Skipping malformed row");
                    summary.row_errors.push(row_error);
                }
            }
        }
        drop(rx);
        parser.await.map_err(|e| ReaderError::Join(e.to_string()))?;

        info!(
            rows = summary.rows,
            published = summary.published,
            duplicates = summary.duplicates,
            row_errors = summary.row_errors.len(),
            "Reader finished"
        );
        Ok(summary)
    }

    async fn publish_url(&self, url: &str, summary: &mut ReaderSummary) -> Result<(), ReaderError> {
        if self.dedup.contains(url) {
            debug!(url, "Duplicate URL skipped");
            summary.duplicates += 1;
            return Ok(());
        }

        let message = codec::encode(&WorkItem::new(url), Payload::Url)?;
        self.broker
            .publish(&self.topic, message)
            .await
            .map_err(|source| ReaderError::Publish {
                topic: self.topic.clone(),
                source,
            })?;
        // a URL whose publish failed stays unseen so a rerun retries it
        self.dedup.mark_seen(url)?;
        summary.published += 1;
        debug!(url, "Published URL");
        Ok(())
    }
}
