//! Writer/Sink stage
//!
//! Consumes `uploaded` and `errors` and appends one CSV row per message.
//! Offsets are committed only after the rows they produced have been flushed,
//! so a crash can duplicate rows but never lose them.

use crate::codec::{self, Payload};
use pixflow_broker::{Broker, BrokerError, Delivery, Subscription};
use pixflow_common::WorkItem;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const SUCCESS_HEADER: [&str; 4] = ["url", "input", "output", "s3url"];
pub const FAILURE_HEADER: [&str; 5] = ["url", "input", "output", "s3url", "error"];

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("cannot create report {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write report row: {0}")]
    Csv(#[from] csv::Error),

    #[error("cannot flush report: {0}")]
    Flush(#[source] std::io::Error),

    #[error("cannot subscribe to '{topic}': {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReportCounts {
    pub success_rows: u64,
    pub failure_rows: u64,
}

fn path_cell(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The success and failure CSV files
pub struct ReportWriter {
    success: csv::Writer<File>,
    failure: csv::Writer<File>,
    flush_every: usize,
    unflushed: usize,
    counts: ReportCounts,
}

impl ReportWriter {
    /// Create (truncate) both files and write their headers
    pub fn create(success_path: &Path, failure_path: &Path, flush_every: usize) -> Result<Self, SinkError> {
        let mut success = Self::open(success_path)?;
        let mut failure = Self::open(failure_path)?;
        success.write_record(SUCCESS_HEADER)?;
        failure.write_record(FAILURE_HEADER)?;
        success.flush().map_err(SinkError::Flush)?;
        failure.flush().map_err(SinkError::Flush)?;

        Ok(Self {
            success,
            failure,
            flush_every: flush_every.max(1),
            unflushed: 0,
            counts: ReportCounts::default(),
        })
    }

    fn open(path: &Path) -> Result<csv::Writer<File>, SinkError> {
        let create_err = |source| SinkError::Create {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(create_err)?;
        }
        let file = File::create(path).map_err(create_err)?;
        Ok(csv::Writer::from_writer(file))
    }

    /// Returns `true` when the row triggered a flush
    pub fn write_success(&mut self, item: &WorkItem) -> Result<bool, SinkError> {
        let input = path_cell(&item.local_input_path);
        let output = path_cell(&item.local_output_path);
        self.success.write_record([
            item.url.as_str(),
            input.as_str(),
            output.as_str(),
            item.remote_url.as_deref().unwrap_or_default(),
        ])?;
        self.counts.success_rows += 1;
        self.row_written()
    }

    pub fn write_failure(&mut self, item: &WorkItem) -> Result<bool, SinkError> {
        let error = item
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown error".to_string());
        let input = path_cell(&item.local_input_path);
        let output = path_cell(&item.local_output_path);
        self.failure.write_record([
            item.url.as_str(),
            input.as_str(),
            output.as_str(),
            item.remote_url.as_deref().unwrap_or_default(),
            error.as_str(),
        ])?;
        self.counts.failure_rows += 1;
        self.row_written()
    }

    fn row_written(&mut self) -> Result<bool, SinkError> {
        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.flush()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn flush(&mut self) -> Result<(), SinkError> {
        self.success.flush().map_err(SinkError::Flush)?;
        self.failure.flush().map_err(SinkError::Flush)?;
        self.unflushed = 0;
        Ok(())
    }

    pub fn has_unflushed(&self) -> bool {
        self.unflushed > 0
    }

    pub fn counts(&self) -> ReportCounts {
        self.counts
    }

    /// Flush both files and close them
    pub fn finish(mut self) -> Result<ReportCounts, SinkError> {
        self.flush()?;
        Ok(self.counts)
    }
}

/// Topic pair and consumer group of the Writer
#[derive(Debug, Clone)]
pub struct SinkIo {
    pub success_topic: String,
    pub errors_topic: String,
    pub group: String,
}

/// Deliveries written but not yet flushed, grouped by subscription
#[derive(Default)]
struct PendingCommits {
    success: Vec<Delivery>,
    failure: Vec<Delivery>,
}

pub struct Writer {
    broker: Arc<dyn Broker>,
    io: SinkIo,
    flush_interval: Duration,
}

impl Writer {
    pub fn new(broker: Arc<dyn Broker>, io: SinkIo, flush_interval: Duration) -> Self {
        Self {
            broker,
            io,
            flush_interval,
        }
    }

    /// Run until both inputs are closed or `cancel` fires.
    ///
    /// The report is flushed and closed on every exit path.
    #[instrument(skip_all, fields(success_topic = %self.io.success_topic, errors_topic = %self.io.errors_topic))]
    pub async fn run(&self, mut report: ReportWriter, cancel: CancellationToken) -> Result<ReportCounts, SinkError> {
        let result = self.consume(&mut report, &cancel).await;
        let flushed = report.finish();
        match (result, flushed) {
            (Err(e), _) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(counts)) => {
                info!(
                    success_rows = counts.success_rows,
                    failure_rows = counts.failure_rows,
                    "Writer finished"
                );
                Ok(counts)
            }
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, SinkError> {
        self.broker
            .subscribe(topic, &self.io.group)
            .await
            .map_err(|source| SinkError::Subscribe {
                topic: topic.to_string(),
                source,
            })
    }

    async fn consume(&self, report: &mut ReportWriter, cancel: &CancellationToken) -> Result<(), SinkError> {
        let success = self.subscribe(&self.io.success_topic).await?;
        let failure = self.subscribe(&self.io.errors_topic).await?;
        let mut success_open = true;
        let mut failure_open = true;
        let mut pending = PendingCommits::default();

        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while success_open || failure_open {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Writer stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if report.has_unflushed() {
                        report.flush()?;
                        debug!("Periodic flush");
                    }
                    commit_all(&mut pending, success.as_ref(), failure.as_ref()).await;
                }
                next = success.next(), if success_open => match next {
                    Ok(Some(delivery)) => {
                        let flushed = match codec::decode(&delivery.message, Payload::RemoteUrl) {
                            Ok(item) => report.write_success(&item)?,
                            Err(e) => {
                                warn!(offset = delivery.offset, error = %e, "Malformed success message");
                                report.write_failure(&malformed(&delivery, &e))?
                            }
                        };
                        pending.success.push(delivery);
                        if flushed {
                            commit_all(&mut pending, success.as_ref(), failure.as_ref()).await;
                        }
                    }
                    Ok(None) => success_open = false,
                    Err(e) => warn!(error = %e, "Receive from success topic failed"),
                },
                next = failure.next(), if failure_open => match next {
                    Ok(Some(delivery)) => {
                        let item = codec::decode(&delivery.message, Payload::Failure)
                            .unwrap_or_else(|e| malformed(&delivery, &e));
                        let flushed = report.write_failure(&item)?;
                        pending.failure.push(delivery);
                        if flushed {
                            commit_all(&mut pending, success.as_ref(), failure.as_ref()).await;
                        }
                    }
                    Ok(None) => failure_open = false,
                    Err(e) => warn!(error = %e, "Receive from errors topic failed"),
                },
            }
        }

        report.flush()?;
        commit_all(&mut pending, success.as_ref(), failure.as_ref()).await;
        Ok(())
    }
}

fn malformed(delivery: &Delivery, error: &codec::CodecError) -> WorkItem {
    let url = delivery.message.key_str().unwrap_or("<missing key>");
    WorkItem::new(url).fail(pixflow_common::ErrorInfo::new(
        pixflow_common::Stage::Writer,
        pixflow_common::ErrorKind::Permanent,
        format!("malformed message on '{}': {}", delivery.topic, error),
    ))
}

async fn commit_all(pending: &mut PendingCommits, success: &dyn Subscription, failure: &dyn Subscription) {
    for (deliveries, subscription) in [
        (&mut pending.success, success),
        (&mut pending.failure, failure),
    ] {
        for delivery in deliveries.drain(..) {
            if let Err(e) = subscription.commit(&delivery).await {
                warn!(topic = %delivery.topic, offset = delivery.offset, error = %e, "Commit failed");
            }
        }
    }
}
