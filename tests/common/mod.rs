// tests/common/mod.rs
//
// In-process doubles shared by the integration tests: canned source fetchers,
// a scripted predictor and a progress sink that records every event.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};

use cropmap_pipeline::grid::{parse_source_grid, LocationKey};
use cropmap_pipeline::merge::FeatureSchema;
use cropmap_pipeline::predict::{FeatureTable, PredictionError, PredictionResult, Predictor};
use cropmap_pipeline::progress::{ProgressEvent, ProgressSink, DEFAULT_TOPIC};
use cropmap_pipeline::region::{DateRange, Region};
use cropmap_pipeline::sources::{FetchError, SourceFetcher, SourceKey, SourcePayload};
use cropmap_pipeline::Pipeline;

pub fn polygon() -> Value {
    json!({
        "type": "Polygon",
        "coordinates": [[[10.0, 20.0], [10.5, 20.0], [10.5, 20.5], [10.0, 20.0]]]
    })
}

pub fn region() -> Region {
    Region::new(polygon()).expect("valid polygon")
}

pub fn january() -> DateRange {
    DateRange::new(
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
    )
    .unwrap()
}

/// Returns a fixed payload (or error) after an optional delay.
pub struct StaticFetcher {
    pub key: SourceKey,
    pub delay: Duration,
    pub response: Result<Value, FetchError>,
    pub calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn ok(key: SourceKey, payload: Value) -> Self {
        Self {
            key,
            delay: Duration::ZERO,
            response: Ok(payload),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(key: SourceKey, message: &str) -> Self {
        Self {
            key,
            delay: Duration::ZERO,
            response: Err(FetchError::Transport {
                key,
                message: message.to_string(),
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl SourceFetcher for StaticFetcher {
    async fn fetch(&self, _region: &Region, _range: &DateRange) -> Result<SourcePayload, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let raw = self.response.clone()?;
        let grid = parse_source_grid(&raw).map_err(|e| FetchError::Decode {
            key: self.key,
            message: e.to_string(),
        })?;
        Ok(SourcePayload { raw, grid })
    }

    fn key(&self) -> SourceKey {
        self.key
    }
}

/// Answers with a fixed label per coordinate pair and remembers the last request body.
#[derive(Default)]
pub struct ScriptedPredictor {
    pub answers: Vec<(f64, f64, i64)>,
    pub failure: Option<PredictionError>,
    pub calls: AtomicUsize,
    pub last_table: Mutex<Option<Value>>,
}

impl ScriptedPredictor {
    pub fn answering(answers: &[(f64, f64, i64)]) -> Self {
        Self {
            answers: answers.to_vec(),
            ..Default::default()
        }
    }

    pub fn failing(err: PredictionError) -> Self {
        Self {
            failure: Some(err),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Predictor for ScriptedPredictor {
    async fn predict(&self, table: &FeatureTable) -> Result<PredictionResult, PredictionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_table.lock().unwrap() = Some(serde_json::to_value(table).unwrap());
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let mut out = PredictionResult::new();
        for (lon, lat, label) in &self.answers {
            out.insert(LocationKey::from_coords(*lon, *lat), *label);
        }
        Ok(out)
    }
}

/// Records every published event in order.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, ProgressEvent)>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn topics(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl ProgressSink for RecordingSink {
    fn publish(&self, topic: &str, event: ProgressEvent) {
        self.events.lock().unwrap().push((topic.to_string(), event));
    }
}

pub fn primary_schema() -> FeatureSchema {
    FeatureSchema::new(["B2"])
}

pub fn secondary_schema() -> FeatureSchema {
    FeatureSchema::new(["VV"])
}

pub fn build_pipeline(
    primary: Arc<StaticFetcher>,
    secondary: Arc<StaticFetcher>,
    predictor: Arc<ScriptedPredictor>,
    sink: Arc<dyn ProgressSink>,
) -> Pipeline {
    build_pipeline_with_schemas(
        (primary, primary_schema()),
        (secondary, secondary_schema()),
        predictor,
        sink,
    )
}

pub fn build_pipeline_with_schemas(
    primary: (Arc<StaticFetcher>, FeatureSchema),
    secondary: (Arc<StaticFetcher>, FeatureSchema),
    predictor: Arc<ScriptedPredictor>,
    sink: Arc<dyn ProgressSink>,
) -> Pipeline {
    Pipeline::builder()
        .topic(DEFAULT_TOPIC)
        .source(primary.0, primary.1)
        .source(secondary.0, secondary.1)
        .predictor(predictor)
        .progress(sink)
        .build()
        .expect("pipeline builds")
}

/// End percentages must be strictly increasing and each step must start where the previous ended.
pub fn assert_contiguous(events: &[ProgressEvent]) {
    let mut prev_end = 0.0;
    for (i, ev) in events.iter().filter(|e| !e.is_error()).enumerate() {
        let start = ev.start_progress.expect("progress start");
        let end = ev.end_progress.expect("progress end");
        assert!(
            (start - prev_end).abs() < 1e-9,
            "event {i} starts at {start}, previous ended at {prev_end}"
        );
        assert!(end > start, "event {i} does not advance: {start} -> {end}");
        prev_end = end;
    }
}
