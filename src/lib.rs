// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod assemble;
pub mod config;
pub mod coordinator;
pub mod grid;
pub mod merge;
pub mod metrics;
pub mod pipeline;
pub mod predict;
pub mod progress;
pub mod region;
pub mod sources;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::pipeline::{Pipeline, PipelineError, PipelineReport, PipelineRequest, PipelineState};
pub use crate::progress::{ProgressEvent, ProgressHub, ProgressSink};

use std::sync::Arc;

use axum::Router;

use crate::api::AppState;
use crate::config::PipelineConfig;

/// Full in-process app: config, progress hub, pipeline and router.
/// `/metrics` is merged in when `DEBUG_ROUTES=1`.
pub async fn app() -> anyhow::Result<Router> {
    let cfg = PipelineConfig::load_default()?;
    app_with_config(&cfg)
}

pub fn app_with_config(cfg: &PipelineConfig) -> anyhow::Result<Router> {
    let hub = Arc::new(ProgressHub::new(cfg.broadcast_capacity));
    let pipeline = Arc::new(Pipeline::from_config(cfg, hub.clone())?);
    tracing::info!(
        topic = %cfg.topic,
        sources = ?pipeline.source_order(),
        prediction_url = %cfg.prediction.url,
        "pipeline configured"
    );

    let mut router = api::router(AppState::new(pipeline, hub));
    if metrics::debug_routes_enabled() {
        router = router.merge(metrics::Metrics::init()?.router());
    }
    Ok(router)
}
