// src/pipeline.rs
//! # Pipeline Orchestrator
//! Drives one run: parallel fetch -> merge -> placeholder or prediction -> output,
//! publishing progress at fixed checkpoints.
//!
//! Checkpoints (percent):
//! - 0..10 fetch initiated
//! - 10..40 one step per finished source (see [`ParallelFetchCoordinator`])
//! - 40..50 sources merged
//! - placeholder: 50..70 extracting, 70..90 building output, 90..100 finalized
//! - detailed: 50..65 time series prepared, 65..90 model run, 90..98 metrics, 98..100 finalized
//!
//! Any failure publishes exactly one `error` event and ends the run in `Failed`.
//! Nothing is retried; partial source data from a failed run is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use chrono::NaiveDate;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::assemble::{Assembly, AssemblyStage, OutputAssembler, PipelineOutput};
use crate::config::PipelineConfig;
use crate::coordinator::ParallelFetchCoordinator;
use crate::merge::{merge, FeatureSchema, MergeSource};
use crate::predict::{HttpPredictor, Predictor};
use crate::progress::{ProgressEmitter, ProgressEvent, ProgressSink, DEFAULT_TOPIC};
use crate::region::{DateRange, InputError, Region};
use crate::sources::{HttpSourceFetcher, SourceFetcher, SourceKey};

pub const FETCH_START_PERCENT: f64 = 10.0;
pub const FETCH_END_PERCENT: f64 = 40.0;
pub const MERGED_PERCENT: f64 = 50.0;

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pipeline_runs_total", "Pipeline runs started.");
        describe_counter!("pipeline_failures_total", "Pipeline runs that ended in Failed.");
        describe_counter!("source_fetch_errors_total", "Source fetches that returned an error.");
        describe_counter!("prediction_errors_total", "Prediction calls that returned an error.");
        describe_counter!(
            "pipeline_consistency_warnings_total",
            "Locations the prediction service did not answer for."
        );
        describe_counter!("progress_events_published_total", "Progress events delivered to a topic.");
        describe_histogram!("pipeline_duration_ms", "End-to-end run time in milliseconds.");
        describe_histogram!("source_fetch_ms", "Source fetch time in milliseconds.");
        describe_histogram!("prediction_ms", "Prediction call time in milliseconds.");
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Fetching,
    Merging,
    Placeholder,
    Predicting,
    Assembling,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (s, Failed) => !s.is_terminal(),
            (Init, Fetching)
            | (Fetching, Merging)
            | (Merging, Placeholder)
            | (Merging, Predicting)
            | (Placeholder, Assembling)
            | (Predicting, Assembling)
            | (Assembling, Done) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("{0}")]
    Transport(String),
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl PipelineError {
    /// HTTP status for the JSON error response.
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::Input(_) => 400,
            PipelineError::Transport(_) => 502,
            PipelineError::Unexpected(_) => 500,
        }
    }
}

/// Validated run input.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRequest {
    pub region: Region,
    pub range: DateRange,
    /// `true`: prediction-backed output; `false`: zero-filled placeholder.
    pub detailed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub output: PipelineOutput,
    /// Raw provider payloads keyed by source name.
    pub results: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub state: PipelineState,
}

struct RunState {
    run_id: u64,
    state: PipelineState,
}

impl RunState {
    fn advance(&mut self, next: PipelineState) {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                target: "pipeline",
                run_id = self.run_id,
                from = ?self.state,
                to = ?next,
                "unexpected pipeline transition"
            );
        }
        tracing::debug!(target: "pipeline", run_id = self.run_id, from = ?self.state, to = ?next, "transition");
        self.state = next;
    }
}

pub struct Pipeline {
    topic: String,
    fetchers: Vec<Arc<dyn SourceFetcher>>,
    schemas: HashMap<SourceKey, FeatureSchema>,
    assembler: OutputAssembler,
    progress: Arc<dyn ProgressSink>,
    stage_delay: Duration,
    default_dates: (NaiveDate, NaiveDate),
    runs: AtomicU64,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Wire HTTP fetchers and predictor from config, publishing to `progress`.
    pub fn from_config(cfg: &PipelineConfig, progress: Arc<dyn ProgressSink>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("cropmap-pipeline/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("building http client")?;

        let mut builder = Pipeline::builder()
            .topic(cfg.topic.clone())
            .progress(progress)
            .stage_delay(Duration::from_millis(cfg.stage_delay_ms))
            .default_dates(cfg.default_dates()?)
            .predictor(Arc::new(
                HttpPredictor::new(cfg.prediction.url.clone(), client.clone())
                    .with_timeout(Duration::from_secs(cfg.prediction.timeout_secs)),
            ));
        for key in &cfg.source_order {
            let src = cfg.sources.get(*key);
            let fetcher = HttpSourceFetcher::new(*key, src.url.clone(), client.clone())
                .with_timeout(Duration::from_secs(src.timeout_secs));
            builder = builder.source(Arc::new(fetcher), src.schema());
        }
        builder.build()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn source_order(&self) -> Vec<SourceKey> {
        self.fetchers.iter().map(|f| f.key()).collect()
    }

    /// Validate raw request fields. No progress is published for invalid input.
    pub fn prepare(
        &self,
        geojson: Value,
        detailed: bool,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<PipelineRequest, InputError> {
        let region = Region::new(geojson)?;
        let (default_start, default_end) = self.default_dates;
        let range = DateRange::from_request(start_date, end_date, default_start, default_end)?;
        Ok(PipelineRequest {
            region,
            range,
            detailed,
        })
    }

    pub async fn run(&self, request: PipelineRequest) -> Result<PipelineReport, PipelineError> {
        ensure_metrics_described();
        counter!("pipeline_runs_total").increment(1);

        let run_id = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        let t0 = Instant::now();
        let emitter = Arc::new(ProgressEmitter::new(Arc::clone(&self.progress), self.topic.clone()));
        let mut run = RunState {
            run_id,
            state: PipelineState::Init,
        };

        tracing::info!(
            target: "pipeline",
            run_id,
            detailed = request.detailed,
            start = %request.range.start(),
            end = %request.range.end(),
            "pipeline run started"
        );

        let out = self.drive(&request, &emitter, &mut run).await;
        histogram!("pipeline_duration_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

        match out {
            Ok(report) => {
                tracing::info!(
                    target: "pipeline",
                    run_id,
                    locations = report.output.geometry_collection.len(),
                    warnings = report.warnings.len(),
                    "pipeline run finished"
                );
                Ok(report)
            }
            Err(e) => {
                run.advance(PipelineState::Failed);
                counter!("pipeline_failures_total").increment(1);
                tracing::warn!(target: "pipeline", run_id, error = %e, "pipeline run failed");
                emitter.error(format!("Pipeline failed: {e}"));
                Err(e)
            }
        }
    }

    /// Run on its own task so a panic inside a stage still yields an error event and a 500.
    pub async fn run_isolated(self: &Arc<Self>, request: PipelineRequest) -> Result<PipelineReport, PipelineError> {
        let this = Arc::clone(self);
        match tokio::spawn(async move { this.run(request).await }).await {
            Ok(out) => out,
            Err(join_err) => {
                counter!("pipeline_failures_total").increment(1);
                tracing::error!(target: "pipeline", error = %join_err, "pipeline task aborted");
                let e = PipelineError::Unexpected(join_err.to_string());
                self.progress
                    .publish(&self.topic, ProgressEvent::error(format!("Pipeline failed: {e}")));
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        request: &PipelineRequest,
        emitter: &Arc<ProgressEmitter>,
        run: &mut RunState,
    ) -> Result<PipelineReport, PipelineError> {
        run.advance(PipelineState::Fetching);
        emitter.progress(0.0, FETCH_START_PERCENT, "Fetching satellite data for the selected region");

        let coordinator = ParallelFetchCoordinator::new(Arc::clone(emitter), FETCH_START_PERCENT, FETCH_END_PERCENT);
        let fetched = coordinator
            .run(&self.fetchers, &request.region, &request.range)
            .await
            .map_err(|e| PipelineError::Unexpected(e.to_string()))?;

        if !fetched.all_succeeded() {
            let reasons: Vec<String> = fetched.failures().iter().map(|e| e.to_string()).collect();
            return Err(PipelineError::Transport(format!(
                "failed to fetch source data: {}",
                reasons.join("; ")
            )));
        }

        run.advance(PipelineState::Merging);
        let outcomes = fetched.into_outcomes();
        let empty = FeatureSchema::default();
        let inputs: Vec<MergeSource<'_>> = outcomes
            .iter()
            .map(|(key, result)| MergeSource {
                key: *key,
                grid: result.as_ref().ok().map(|p| &p.grid),
                schema: self.schemas.get(key).unwrap_or(&empty),
            })
            .collect();
        let table = merge(&inputs);
        tracing::debug!(target: "pipeline", run_id = run.run_id, locations = table.len(), "sources merged");
        emitter.progress(
            FETCH_END_PERCENT,
            MERGED_PERCENT,
            format!("Source data merged ({} locations)", table.len()),
        );

        let assembly: Assembly = if request.detailed {
            run.advance(PipelineState::Predicting);
            let stages = Arc::clone(emitter);
            let on_stage = move |stage: AssemblyStage| match stage {
                AssemblyStage::TablePrepared { rows } => {
                    stages.progress(50.0, 65.0, format!("Time series prepared for {rows} locations"))
                }
                AssemblyStage::ModelFinished { predictions } => {
                    stages.progress(65.0, 90.0, format!("Crop model run complete ({predictions} predictions)"))
                }
                AssemblyStage::MetricsComputed { .. } => stages.progress(90.0, 98.0, "Coverage metrics computed"),
            };
            let assembly = self
                .assembler
                .predicted(&table, &on_stage)
                .await
                .map_err(|e| PipelineError::Transport(e.to_string()))?;
            run.advance(PipelineState::Assembling);
            emitter.progress(98.0, 100.0, "Output finalized");
            assembly
        } else {
            run.advance(PipelineState::Placeholder);
            emitter.progress(50.0, 70.0, "Extracting band values");
            self.pace().await;
            emitter.progress(70.0, 90.0, "Building output geometry");
            let assembly = self.assembler.placeholder(&table);
            self.pace().await;
            run.advance(PipelineState::Assembling);
            emitter.progress(90.0, 100.0, "Output finalized");
            assembly
        };

        let mut results = Map::new();
        for (key, result) in outcomes {
            if let Ok(payload) = result {
                results.insert(key.as_str().to_string(), payload.raw);
            }
        }

        run.advance(PipelineState::Done);
        Ok(PipelineReport {
            output: assembly.output,
            results,
            warnings: assembly.warnings.iter().map(|w| w.to_string()).collect(),
            state: run.state,
        })
    }

    async fn pace(&self) {
        if !self.stage_delay.is_zero() {
            tokio::time::sleep(self.stage_delay).await;
        }
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    topic: Option<String>,
    fetchers: Vec<Arc<dyn SourceFetcher>>,
    schemas: HashMap<SourceKey, FeatureSchema>,
    predictor: Option<Arc<dyn Predictor>>,
    progress: Option<Arc<dyn ProgressSink>>,
    stage_delay: Duration,
    default_dates: Option<(NaiveDate, NaiveDate)>,
}

impl PipelineBuilder {
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Add a source; call order is merge priority order.
    pub fn source(mut self, fetcher: Arc<dyn SourceFetcher>, schema: FeatureSchema) -> Self {
        self.schemas.insert(fetcher.key(), schema);
        self.fetchers.push(fetcher);
        self
    }

    pub fn predictor(mut self, predictor: Arc<dyn Predictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    pub fn progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn stage_delay(mut self, delay: Duration) -> Self {
        self.stage_delay = delay;
        self
    }

    pub fn default_dates(mut self, dates: (NaiveDate, NaiveDate)) -> Self {
        self.default_dates = Some(dates);
        self
    }

    pub fn build(self) -> anyhow::Result<Pipeline> {
        if self.fetchers.is_empty() {
            bail!("pipeline needs at least one source");
        }
        let mut keys: Vec<SourceKey> = self.fetchers.iter().map(|f| f.key()).collect();
        keys.sort();
        keys.dedup();
        if keys.len() != self.fetchers.len() {
            bail!("each source may only be registered once");
        }
        let predictor = self.predictor.context("pipeline needs a predictor")?;
        let progress = self.progress.context("pipeline needs a progress sink")?;
        let default_dates = match self.default_dates {
            Some(d) => d,
            None => PipelineConfig::default().default_dates()?,
        };
        Ok(Pipeline {
            topic: self.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            fetchers: self.fetchers,
            schemas: self.schemas,
            assembler: OutputAssembler::new(predictor),
            progress,
            stage_delay: self.stage_delay,
            default_dates,
            runs: AtomicU64::new(0),
        })
    }
}
