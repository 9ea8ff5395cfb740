// src/predict.rs
//! Prediction stage: flattens the merged table into rows and calls the model service.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use reqwest::Client;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserialize;
use thiserror::Error;

use crate::grid::{LocationKey, MergedFeatureTable, OrderedMap};
use crate::sources::http::describe_transport_error;

pub const DEFAULT_PREDICTION_TIMEOUT_SECS: u64 = 60;

/// Location -> predicted class label.
pub type PredictionResult = OrderedMap<LocationKey, i64>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PredictionError {
    #[error("prediction request failed: {0}")]
    Transport(String),
    #[error("prediction service responded with HTTP {0}")]
    Status(u16),
    #[error("prediction response could not be decoded: {0}")]
    Decode(String),
}

/// One location of the flattened table: `lon`, `lat`, then one column per feature x period.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub location: LocationKey,
    pub columns: OrderedMap<String, f64>,
}

impl Serialize for FeatureRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len() + 2))?;
        map.serialize_entry("lon", &self.location.lon())?;
        map.serialize_entry("lat", &self.location.lat())?;
        for (name, value) in self.columns.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Row-oriented request body, serialized as a JSON array of rows.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(transparent)]
pub struct FeatureTable {
    rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn rows(&self) -> &[FeatureRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub fn column_name(feature: &str, period: &str) -> String {
    format!("{feature}_{period}")
}

/// One row per location, columns ordered by period then feature.
pub fn flatten(table: &MergedFeatureTable) -> FeatureTable {
    let rows = table
        .iter()
        .map(|(loc, series)| {
            let mut columns = OrderedMap::new();
            for (period, features) in series.iter() {
                for (name, value) in features.iter() {
                    columns.insert(column_name(name, period), *value);
                }
            }
            FeatureRow {
                location: loc.clone(),
                columns,
            }
        })
        .collect();
    FeatureTable { rows }
}

#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, table: &FeatureTable) -> Result<PredictionResult, PredictionError>;
}

#[derive(Debug, Deserialize)]
struct PredictionRow {
    lon: f64,
    lat: f64,
    prediction: f64,
}

/// Model endpoint taking the row table and answering `[{lon, lat, prediction}]`.
#[derive(Clone)]
pub struct HttpPredictor {
    url: String,
    client: Client,
    timeout: Duration,
}

impl HttpPredictor {
    pub fn new(url: impl Into<String>, client: Client) -> Self {
        Self {
            url: url.into(),
            client,
            timeout: Duration::from_secs(DEFAULT_PREDICTION_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn predict_inner(&self, table: &FeatureTable) -> Result<PredictionResult, PredictionError> {
        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(table)
            .send()
            .await
            .map_err(|e| PredictionError::Transport(describe_transport_error(&e, self.timeout)))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(PredictionError::Status(status.as_u16()));
        }

        let rows: Vec<PredictionRow> = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                PredictionError::Transport(describe_transport_error(&e, self.timeout))
            } else {
                PredictionError::Decode(e.to_string())
            }
        })?;

        let mut out = PredictionResult::with_capacity(rows.len());
        for row in rows {
            if !row.lon.is_finite() || !row.lat.is_finite() || !row.prediction.is_finite() {
                return Err(PredictionError::Decode(format!(
                    "non-finite value in row ({}, {}, {})",
                    row.lon, row.lat, row.prediction
                )));
            }
            out.insert(LocationKey::from_coords(row.lon, row.lat), row.prediction.round() as i64);
        }
        Ok(out)
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn predict(&self, table: &FeatureTable) -> Result<PredictionResult, PredictionError> {
        let t0 = Instant::now();
        let out = self.predict_inner(table).await;
        histogram!("prediction_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        match &out {
            Ok(p) => tracing::debug!(rows = table.len(), predictions = p.len(), "prediction ok"),
            Err(e) => {
                tracing::warn!(error = %e, "prediction failed");
                counter!("prediction_errors_total").increment(1);
            }
        }
        out
    }
}
