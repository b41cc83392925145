//! Health and metrics endpoint
//!
//! `GET /health` answers as long as the process is serving; `GET /metrics`
//! returns per-stage counters as JSON.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use dashmap::DashMap;
use pixflow_common::Stage;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Counters for one stage
#[derive(Debug, Default)]
pub struct StageMetrics {
    received: AtomicU64,
    forwarded: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub retries: u64,
}

impl StageMetrics {
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retries(&self, retries: u32) {
        self.retries.fetch_add(u64::from(retries), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Metrics of every stage running in this process
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    /// Process role shown by `/health`, e.g. `downloader` or `pipeline`
    role: String,
    stages: Arc<DashMap<Stage, Arc<StageMetrics>>>,
}

impl MetricsRegistry {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            stages: Arc::new(DashMap::new()),
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// Counters for `stage`, created on first use
    pub fn stage(&self, stage: Stage) -> Arc<StageMetrics> {
        self.stages.entry(stage).or_default().clone()
    }

    pub fn snapshot(&self) -> BTreeMap<String, MetricsSnapshot> {
        self.stages
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().snapshot()))
            .collect()
    }
}

pub fn router(registry: MetricsRegistry) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .with_state(registry)
}

async fn health_check(State(registry): State<MetricsRegistry>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "stage": registry.role(),
    }))
}

async fn metrics(State(registry): State<MetricsRegistry>) -> impl IntoResponse {
    Json(json!({
        "stage": registry.role(),
        "stages": registry.snapshot(),
    }))
}

/// Serve on an already-bound listener until `cancel` fires
pub fn serve(listener: TcpListener, registry: MetricsRegistry, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = axum::serve(listener, router(registry))
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await;
        if let Err(e) = result {
            error!("Metrics server failed: {}", e);
        }
    })
}

/// Bind `0.0.0.0:port` and serve; port 0 disables the endpoint.
///
/// A bind failure is returned to the caller, which treats it as fatal.
pub async fn start(
    port: u16,
    registry: MetricsRegistry,
    cancel: CancellationToken,
) -> anyhow::Result<Option<JoinHandle<()>>> {
    if port == 0 {
        info!("Metrics endpoint disabled");
        return Ok(None);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Cannot bind metrics listener on {}: {}", addr, e))?;
    info!("Metrics endpoint listening on {}", addr);

    Ok(Some(serve(listener, registry, cancel)))
}
