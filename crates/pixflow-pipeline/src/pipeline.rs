//! Single-process pipeline
//!
//! Runs all five stages against one [`MemoryBroker`]. Completion cascades
//! through topic closes: the Reader finishing closes `ingest`, each middle
//! stage draining its input closes its output, and once the Uploader is done
//! `uploaded` and `errors` are closed so the Writer can finish.

use crate::config::PipelineConfig;
use crate::converter::Converter;
use crate::dedup::Deduplicator;
use crate::downloader::Downloader;
use crate::error::{PipelineError, Result};
use crate::fetch::HttpFetcher;
use crate::health::MetricsRegistry;
use crate::reader::{Reader, ReaderSummary};
use crate::retry::RetryPolicy;
use crate::sink::{ReportCounts, ReportWriter, SinkIo, Writer};
use crate::stage::{Processor, StageIo, StageReport, StageRunner};
use crate::storage::ObjectStore;
use crate::transform::Transformer;
use crate::uploader::Uploader;
use pixflow_broker::{Broker, MemoryBroker};
use pixflow_common::Stage;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// External capabilities the stages are built from
#[derive(Clone)]
pub struct PipelineParts {
    pub fetcher: Arc<dyn HttpFetcher>,
    pub transformer: Arc<dyn Transformer>,
    pub store: Arc<dyn ObjectStore>,
    pub dedup: Arc<dyn Deduplicator>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub reader: ReaderSummary,
    pub downloader: StageReport,
    pub converter: StageReport,
    pub uploader: StageReport,
    pub report: ReportCounts,
}

pub struct Pipeline {
    config: PipelineConfig,
    parts: PipelineParts,
    broker: Arc<MemoryBroker>,
    metrics: MetricsRegistry,
}

type StageTask = JoinHandle<std::result::Result<StageReport, crate::stage::StageError>>;

impl Pipeline {
    pub fn new(config: PipelineConfig, parts: PipelineParts) -> Self {
        let broker = Arc::new(MemoryBroker::new(config.broker.partitions));
        Self {
            config,
            parts,
            broker,
            metrics: MetricsRegistry::new("pipeline"),
        }
    }

    /// Build the production capabilities described by `config`
    pub async fn from_config(config: PipelineConfig) -> anyhow::Result<Self> {
        let parts = crate::app::build_parts(&config).await?;
        Ok(Self::new(config, parts))
    }

    pub fn metrics(&self) -> MetricsRegistry {
        self.metrics.clone()
    }

    pub fn broker(&self) -> Arc<MemoryBroker> {
        self.broker.clone()
    }

    /// Process every URL in `input` and write both reports.
    ///
    /// The input is opened and its header checked before the reports are
    /// created, so a rejected input leaves existing reports untouched.
    /// `cancel` stops consumption early; reports are still flushed.
    #[instrument(skip_all, fields(input = %input.display()))]
    pub async fn run(
        &self,
        input: &Path,
        success: &Path,
        failed: &Path,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let rows = Reader::open(input).await?;
        let report = ReportWriter::create(success, failed, self.config.flush_every)?;
        let stages_cancel = cancel.child_token();
        let broker: Arc<dyn Broker> = self.broker.clone();
        let topics = &self.config.topics;

        let downloader = Downloader::new(
            self.parts.fetcher.clone(),
            RetryPolicy::from(&self.config.retry),
            self.config.output_dir.clone(),
        )
        .with_metrics(self.metrics.stage(Stage::Downloader));
        let download_task = self.spawn_stage(Arc::new(downloader), &stages_cancel);
        let convert_task = self.spawn_stage(
            Arc::new(Converter::new(self.parts.transformer.clone())),
            &stages_cancel,
        );
        let upload_task = self.spawn_stage(
            Arc::new(Uploader::new(
                self.parts.store.clone(),
                self.config.storage.key_prefix.clone(),
            )),
            &stages_cancel,
        );

        let writer = Writer::new(
            broker.clone(),
            SinkIo {
                success_topic: topics.uploaded.clone(),
                errors_topic: topics.errors.clone(),
                group: self.config.broker.group_for(Stage::Writer),
            },
            self.config.flush_interval(),
        );
        let writer_cancel = stages_cancel.clone();
        let writer_task = tokio::spawn(async move { writer.run(report, writer_cancel).await });

        let reader = Reader::new(broker.clone(), topics.ingest.clone(), self.parts.dedup.clone());
        let reader_summary = match reader.publish_rows(rows, &cancel).await {
            Ok(summary) => summary,
            Err(e) => {
                stages_cancel.cancel();
                self.close_all().await;
                let _ = futures::future::join4(download_task, convert_task, upload_task, writer_task).await;
                return Err(e.into());
            }
        };

        let mut summary = RunSummary {
            reader: reader_summary,
            ..RunSummary::default()
        };

        let cascade = async {
            self.broker.close_topic(&topics.ingest).await?;
            summary.downloader = join_stage(Stage::Downloader, download_task).await?;
            self.broker.close_topic(&topics.downloaded).await?;
            summary.converter = join_stage(Stage::Converter, convert_task).await?;
            self.broker.close_topic(&topics.converted).await?;
            summary.uploader = join_stage(Stage::Uploader, upload_task).await?;
            self.broker.close_topic(&topics.uploaded).await?;
            self.broker.close_topic(&topics.errors).await?;
            Ok::<_, PipelineError>(())
        };
        if let Err(e) = cascade.await {
            stages_cancel.cancel();
            self.close_all().await;
            let _ = writer_task.await;
            return Err(e);
        }

        summary.report = writer_task
            .await
            .map_err(|_| PipelineError::Task(Stage::Writer))??;

        info!(
            rows = summary.reader.rows,
            published = summary.reader.published,
            duplicates = summary.reader.duplicates,
            row_errors = summary.reader.row_errors.len(),
            success_rows = summary.report.success_rows,
            failure_rows = summary.report.failure_rows,
            "Pipeline run complete"
        );
        Ok(summary)
    }

    fn spawn_stage(&self, processor: Arc<dyn Processor>, cancel: &CancellationToken) -> StageTask {
        let stage = processor.stage();
        let io = StageIo::for_stage(stage, &self.config.topics, self.config.broker.group_for(stage));
        let runner = io.map(|io| {
            StageRunner::new(self.broker.clone(), io, self.config.workers)
                .with_metrics(self.metrics.stage(stage))
        });
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match runner {
                Some(runner) => runner.run(processor, cancel).await,
                None => Err(crate::stage::StageError::Task(format!(
                    "{} is not a consumer stage",
                    stage
                ))),
            }
        })
    }

    /// Close every topic so stages still waiting on input can exit
    async fn close_all(&self) {
        for topic in self.config.topics.all() {
            // in-memory topics always close
            let _ = self.broker.close_topic(topic).await;
        }
    }
}

async fn join_stage(stage: Stage, task: StageTask) -> Result<StageReport> {
    task.await
        .map_err(|_| PipelineError::Task(stage))?
        .map_err(|source| PipelineError::Stage { stage, source })
}
