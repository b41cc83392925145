//! Composition root: builds stages from configuration and runs CLI commands

use crate::config::{BrokerBackend, PipelineConfig};
use crate::converter::Converter;
use crate::dedup::{Deduplicator, FileDeduplicator, MemoryDeduplicator};
use crate::downloader::Downloader;
use crate::fetch::{HttpFetcher, ReqwestFetcher};
use crate::health::{self, MetricsRegistry};
use crate::pipeline::{Pipeline, PipelineParts, RunSummary};
use crate::reader::{Reader, ReaderSummary};
use crate::retry::RetryPolicy;
use crate::sink::{ReportCounts, ReportWriter, SinkIo, Writer};
use crate::stage::{Processor, StageIo, StageReport, StageRunner};
use crate::storage::{LocalObjectStore, ObjectStore, S3Store, StoreBackend};
use crate::transform::{CommandTransformer, NativeTransformer, Transformer};
use crate::uploader::Uploader;
use anyhow::Context;
use pixflow_broker::Broker;
use pixflow_common::Stage;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub fn build_fetcher(config: &PipelineConfig) -> anyhow::Result<Arc<dyn HttpFetcher>> {
    let fetcher = ReqwestFetcher::new(config.http_timeout()).context("Failed to build HTTP client")?;
    Ok(Arc::new(fetcher))
}

pub fn build_transformer(config: &PipelineConfig) -> Arc<dyn Transformer> {
    if config.transform.is_builtin() {
        info!("Using built-in grayscale transformer");
        Arc::new(NativeTransformer)
    } else {
        info!(program = %config.transform.program, "Using external grayscale command");
        Arc::new(CommandTransformer::new(
            config.transform.program.clone(),
            config.transform.args.clone(),
        ))
    }
}

pub async fn build_store(config: &PipelineConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match config.storage.backend {
        StoreBackend::S3 => Ok(Arc::new(
            S3Store::new(config.storage.clone())
                .await
                .context("Failed to initialize S3 store")?,
        )),
        StoreBackend::Local => {
            info!(dir = %config.storage.local_dir.display(), "Using local object store");
            Ok(Arc::new(LocalObjectStore::new(config.storage.local_dir.clone())))
        }
    }
}

pub fn build_dedup(config: &PipelineConfig) -> anyhow::Result<Arc<dyn Deduplicator>> {
    match &config.dedup_store {
        Some(path) => Ok(Arc::new(
            FileDeduplicator::open(path).context("Failed to open dedup store")?,
        )),
        None => Ok(Arc::new(MemoryDeduplicator::new())),
    }
}

pub async fn build_parts(config: &PipelineConfig) -> anyhow::Result<PipelineParts> {
    Ok(PipelineParts {
        fetcher: build_fetcher(config)?,
        transformer: build_transformer(config),
        store: build_store(config).await?,
        dedup: build_dedup(config)?,
    })
}

/// Broker shared between separately running stage processes
pub async fn connect_broker(config: &PipelineConfig) -> anyhow::Result<Arc<dyn Broker>> {
    match config.broker.backend {
        BrokerBackend::Memory => anyhow::bail!(
            "standalone stages need a shared broker: set PIXFLOW_BROKER_BACKEND=kafka, \
             or use `pixflow run` for the in-memory pipeline"
        ),
        BrokerBackend::Kafka => connect_kafka(config).await,
    }
}

#[cfg(feature = "kafka")]
async fn connect_kafka(config: &PipelineConfig) -> anyhow::Result<Arc<dyn Broker>> {
    use pixflow_broker::{KafkaBroker, KafkaConfig};

    let kafka = KafkaConfig {
        brokers: config.broker.brokers.clone(),
        ..KafkaConfig::default()
    };
    let broker = tokio::task::spawn_blocking(move || KafkaBroker::connect(kafka))
        .await
        .context("Kafka connect task failed")?
        .context("Cannot connect to broker")?;
    Ok(Arc::new(broker))
}

#[cfg(not(feature = "kafka"))]
async fn connect_kafka(_config: &PipelineConfig) -> anyhow::Result<Arc<dyn Broker>> {
    anyhow::bail!("this build has no Kafka support; rebuild with `--features kafka`")
}

/// `pixflow run`
pub async fn run_pipeline(
    config: PipelineConfig,
    input: &Path,
    success: &Path,
    failed: &Path,
    cancel: CancellationToken,
) -> anyhow::Result<RunSummary> {
    let metrics_port = config.metrics_port;
    let pipeline = Pipeline::from_config(config).await?;
    let server = health::start(metrics_port, pipeline.metrics(), cancel.clone()).await?;

    let result = pipeline.run(input, success, failed, cancel.child_token()).await;

    if let Some(server) = server {
        cancel.cancel();
        let _ = server.await;
    }
    Ok(result?)
}

/// `pixflow read`
pub async fn run_reader(config: &PipelineConfig, input: &Path, cancel: CancellationToken) -> anyhow::Result<ReaderSummary> {
    let broker = connect_broker(config).await?;
    let reader = Reader::new(broker.clone(), config.topics.ingest.clone(), build_dedup(config)?);
    let summary = reader.run(input, &cancel).await?;
    broker.flush().await.context("Failed to flush broker")?;
    Ok(summary)
}

/// `pixflow download|convert|upload`
pub async fn run_stage(config: &PipelineConfig, stage: Stage, cancel: CancellationToken) -> anyhow::Result<StageReport> {
    let broker = connect_broker(config).await?;
    let registry = MetricsRegistry::new(stage.as_str());
    let metrics = registry.stage(stage);

    let processor: Arc<dyn Processor> = match stage {
        Stage::Downloader => Arc::new(
            Downloader::new(
                build_fetcher(config)?,
                RetryPolicy::from(&config.retry),
                config.output_dir.clone(),
            )
            .with_metrics(metrics.clone()),
        ),
        Stage::Converter => Arc::new(Converter::new(build_transformer(config))),
        Stage::Uploader => Arc::new(Uploader::new(
            build_store(config).await?,
            config.storage.key_prefix.clone(),
        )),
        Stage::Reader | Stage::Writer => anyhow::bail!("{} is not a consumer stage", stage),
    };

    let io = StageIo::for_stage(stage, &config.topics, config.broker.group_for(stage))
        .context("missing stage wiring")?;
    let server = health::start(config.metrics_port, registry, cancel.clone()).await?;

    let report = StageRunner::new(broker, io, config.workers)
        .with_metrics(metrics)
        .run(processor, cancel.clone())
        .await
        .with_context(|| format!("{} stage failed", stage))?;

    if let Some(server) = server {
        cancel.cancel();
        let _ = server.await;
    }
    Ok(report)
}

/// `pixflow write`
pub async fn run_writer(
    config: &PipelineConfig,
    success: &Path,
    failed: &Path,
    cancel: CancellationToken,
) -> anyhow::Result<ReportCounts> {
    let broker = connect_broker(config).await?;
    let report = ReportWriter::create(success, failed, config.flush_every)?;
    let server = health::start(config.metrics_port, MetricsRegistry::new(Stage::Writer.as_str()), cancel.clone()).await?;

    let writer = Writer::new(
        broker,
        SinkIo {
            success_topic: config.topics.uploaded.clone(),
            errors_topic: config.topics.errors.clone(),
            group: config.broker.group_for(Stage::Writer),
        },
        config.flush_interval(),
    );
    let counts = writer.run(report, cancel.clone()).await?;

    if let Some(server) = server {
        cancel.cancel();
        let _ = server.await;
    }
    Ok(counts)
}
