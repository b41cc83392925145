//! Shared stage plumbing
//!
//! A [`StageRunner`] turns a [`Processor`] into a consumer-group member:
//!
//! ```text
//!  subscription ──► pull loop ──► lane[partition % workers] ──► dispatcher ──► forward / errors topic
//!                                  (one item at a time)           (publish, then commit)
//! ```
//!
//! Each lane handles one item at a time, so items of one partition are
//! processed and dispatched in arrival order and commits per partition only
//! move forward. A delivery is committed only after its outcome has been
//! published; abandoned deliveries are never committed and will be redelivered.

use crate::codec::{self, CodecError, Payload};
use crate::config::TopicConfig;
use crate::health::StageMetrics;
use async_trait::async_trait;
use pixflow_broker::{Broker, BrokerError, Delivery, Subscription};
use pixflow_common::{ErrorInfo, ErrorKind, Stage, WorkItem};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Deliveries queued per lane
const LANE_CAPACITY: usize = 16;

/// Pause after a failed receive before polling again
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum StageError {
    #[error("cannot subscribe to '{topic}': {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("cannot publish to '{topic}': {source}")]
    Publish {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("cannot encode outcome: {0}")]
    Encode(#[from] CodecError),

    #[error("broker flush failed: {0}")]
    Flush(#[source] BrokerError),

    #[error("stage task failed: {0}")]
    Task(String),
}

/// What a processor decided for one item
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Advance to the stage's output topic
    Forward(WorkItem),
    /// Route to the errors topic; the item must carry its `error`
    Fail(WorkItem),
    /// Interrupted by shutdown; leave uncommitted for redelivery
    Abandon(WorkItem),
}

impl Outcome {
    pub fn item(&self) -> &WorkItem {
        match self {
            Outcome::Forward(item) | Outcome::Fail(item) | Outcome::Abandon(item) => item,
        }
    }
}

#[async_trait]
pub trait Processor: Send + Sync + 'static {
    fn stage(&self) -> Stage;

    async fn process(&self, item: WorkItem, cancel: &CancellationToken) -> Outcome;
}

/// Topics and payload layouts one stage reads and writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageIo {
    pub input_topic: String,
    pub input: Payload,
    pub output_topic: String,
    pub output: Payload,
    pub errors_topic: String,
    pub group: String,
}

impl StageIo {
    /// Wiring for the three middle stages; `None` for Reader and Writer
    pub fn for_stage(stage: Stage, topics: &TopicConfig, group: impl Into<String>) -> Option<Self> {
        let (input_topic, input, output_topic, output) = match stage {
            Stage::Downloader => (&topics.ingest, Payload::Url, &topics.downloaded, Payload::InputPath),
            Stage::Converter => (
                &topics.downloaded,
                Payload::InputPath,
                &topics.converted,
                Payload::OutputPath,
            ),
            Stage::Uploader => (
                &topics.converted,
                Payload::OutputPath,
                &topics.uploaded,
                Payload::RemoteUrl,
            ),
            Stage::Reader | Stage::Writer => return None,
        };
        Some(Self {
            input_topic: input_topic.clone(),
            input,
            output_topic: output_topic.clone(),
            output,
            errors_topic: topics.errors.clone(),
            group: group.into(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub received: u64,
    pub forwarded: u64,
    pub failed: u64,
    pub abandoned: u64,
}

pub struct StageRunner {
    broker: Arc<dyn Broker>,
    io: StageIo,
    workers: usize,
    metrics: Arc<StageMetrics>,
}

impl StageRunner {
    pub fn new(broker: Arc<dyn Broker>, io: StageIo, workers: usize) -> Self {
        Self {
            broker,
            io,
            workers: workers.max(1),
            metrics: Arc::new(StageMetrics::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<StageMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Consume until the input topic ends or `cancel` fires, then drain.
    ///
    /// Only broker failures end the stage with an error; item failures are
    /// published to the errors topic.
    #[instrument(skip_all, fields(stage = %processor.stage(), topic = %self.io.input_topic))]
    pub async fn run(
        self,
        processor: Arc<dyn Processor>,
        cancel: CancellationToken,
    ) -> Result<StageReport, StageError> {
        let stage = processor.stage();
        let subscription: Arc<dyn Subscription> = Arc::from(
            self.broker
                .subscribe(&self.io.input_topic, &self.io.group)
                .await
                .map_err(|source| StageError::Subscribe {
                    topic: self.io.input_topic.clone(),
                    source,
                })?,
        );
        info!(group = %self.io.group, workers = self.workers, "Stage started");

        // Fires on external cancellation or when the dispatcher gives up
        let stop = cancel.child_token();

        let (outcome_tx, outcome_rx) = mpsc::channel(self.workers * LANE_CAPACITY);
        let dispatcher = tokio::spawn(dispatch(
            self.broker.clone(),
            subscription.clone(),
            self.io.clone(),
            outcome_rx,
            self.metrics.clone(),
            stop.clone(),
        ));

        let mut lanes = Vec::with_capacity(self.workers);
        let mut lane_tasks = JoinSet::new();
        for lane in 0..self.workers {
            let (tx, rx) = mpsc::channel(LANE_CAPACITY);
            lanes.push(tx);
            lane_tasks.spawn(run_lane(
                lane,
                processor.clone(),
                self.io.input,
                rx,
                outcome_tx.clone(),
                cancel.clone(),
            ));
        }
        drop(outcome_tx);

        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    info!("Stopping consumption");
                    break;
                }
                next = subscription.next() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    self.metrics.record_received();
                    let lane = delivery.partition as usize % self.workers;
                    debug!(partition = delivery.partition, offset = delivery.offset, lane, "Routing delivery");
                    if lanes[lane].send(delivery).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!("Input topic closed and drained");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Receive failed, backing off");
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                    }
                }
            }
        }

        drop(lanes);
        while let Some(joined) = lane_tasks.join_next().await {
            joined.map_err(|e| StageError::Task(e.to_string()))?;
        }
        let report = dispatcher
            .await
            .map_err(|e| StageError::Task(e.to_string()))??;

        self.broker.flush().await.map_err(StageError::Flush)?;

        info!(
            stage = %stage,
            received = report.received,
            forwarded = report.forwarded,
            failed = report.failed,
            abandoned = report.abandoned,
            "Stage finished"
        );
        Ok(report)
    }
}

async fn run_lane(
    lane: usize,
    processor: Arc<dyn Processor>,
    input: Payload,
    mut rx: mpsc::Receiver<Delivery>,
    outcomes: mpsc::Sender<(Delivery, Outcome)>,
    cancel: CancellationToken,
) {
    let stage = processor.stage();
    while let Some(delivery) = rx.recv().await {
        if cancel.is_cancelled() {
            debug!(lane, "Lane stopping; queued deliveries stay uncommitted");
            break;
        }

        let outcome = match codec::decode(&delivery.message, input) {
            Ok(item) if item.is_failed() => Outcome::Fail(item),
            Ok(item) => processor.process(item, &cancel).await,
            Err(e) => {
                warn!(lane, partition = delivery.partition, offset = delivery.offset, error = %e, "Malformed message");
                let url = delivery
                    .message
                    .key_str()
                    .filter(|k| !k.is_empty())
                    .unwrap_or("<missing key>");
                Outcome::Fail(WorkItem::new(url).fail(ErrorInfo::new(
                    stage,
                    ErrorKind::Permanent,
                    format!("malformed message: {}", e),
                )))
            }
        };

        let abandoned = matches!(outcome, Outcome::Abandon(_));
        if outcomes.send((delivery, outcome)).await.is_err() || abandoned {
            break;
        }
    }
}

async fn dispatch(
    broker: Arc<dyn Broker>,
    subscription: Arc<dyn Subscription>,
    io: StageIo,
    rx: mpsc::Receiver<(Delivery, Outcome)>,
    metrics: Arc<StageMetrics>,
    stop: CancellationToken,
) -> Result<StageReport, StageError> {
    let result = dispatch_outcomes(broker, subscription, io, rx, metrics).await;
    if result.is_err() {
        stop.cancel();
    }
    result
}

async fn dispatch_outcomes(
    broker: Arc<dyn Broker>,
    subscription: Arc<dyn Subscription>,
    io: StageIo,
    mut rx: mpsc::Receiver<(Delivery, Outcome)>,
    metrics: Arc<StageMetrics>,
) -> Result<StageReport, StageError> {
    let mut report = StageReport::default();

    while let Some((delivery, outcome)) = rx.recv().await {
        report.received += 1;
        let (topic, message) = match &outcome {
            Outcome::Forward(item) => (&io.output_topic, codec::encode(item, io.output)?),
            Outcome::Fail(item) => (&io.errors_topic, codec::encode(item, Payload::Failure)?),
            Outcome::Abandon(item) => {
                report.abandoned += 1;
                metrics.record_abandoned();
                info!(url = %item.url, partition = delivery.partition, offset = delivery.offset, "Item abandoned, left uncommitted");
                continue;
            }
        };

        broker
            .publish(topic, message)
            .await
            .map_err(|source| StageError::Publish {
                topic: topic.clone(),
                source,
            })?;

        match &outcome {
            Outcome::Forward(item) => {
                report.forwarded += 1;
                metrics.record_forwarded();
                debug!(url = %item.url, topic = %topic, "Forwarded");
            }
            Outcome::Fail(item) => {
                report.failed += 1;
                metrics.record_failed();
                if let Some(error) = &item.error {
                    warn!(url = %item.url, kind = %error.kind, error = %error, "Item failed");
                }
            }
            Outcome::Abandon(_) => {}
        }

        if let Err(e) = subscription.commit(&delivery).await {
            warn!(partition = delivery.partition, offset = delivery.offset, error = %e, "Commit failed");
        }
    }

    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_io_wiring() {
        let topics = TopicConfig::default();
        let io = StageIo::for_stage(Stage::Converter, &topics, "pixflow-converter").unwrap();
        assert_eq!(io.input_topic, "downloaded");
        assert_eq!(io.output_topic, "converted");
        assert_eq!(io.output, Payload::OutputPath);
        assert_eq!(io.errors_topic, "errors");

        assert!(StageIo::for_stage(Stage::Reader, &topics, "g").is_none());
        assert!(StageIo::for_stage(Stage::Writer, &topics, "g").is_none());
    }
}
