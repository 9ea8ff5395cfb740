// src/assemble.rs
//! Builds the geometry output from the merged table, with or without predictions.

use std::fmt;
use std::sync::Arc;

use metrics::counter;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::grid::{LocationKey, MergedFeatureTable};
use crate::predict::{flatten, PredictionError, PredictionResult, Predictor};

/// Label counted as positive coverage.
pub const POSITIVE_LABEL: i64 = 1;
/// Label for placeholders and locations the model did not answer for.
pub const NEUTRAL_LABEL: i64 = 0;

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageMetrics {
    pub positive_coverage_percent: f64,
    pub negative_coverage_percent: f64,
}

impl CoverageMetrics {
    /// Share of positive labels, rounded to 2 decimals; both zero when there are no labels.
    pub fn from_labels<I: IntoIterator<Item = i64>>(labels: I) -> Self {
        let (mut total, mut positive) = (0usize, 0usize);
        for label in labels {
            total += 1;
            if label == POSITIVE_LABEL {
                positive += 1;
            }
        }
        if total == 0 {
            return Self {
                positive_coverage_percent: 0.0,
                negative_coverage_percent: 0.0,
            };
        }
        let positive = round2(positive as f64 / total as f64 * 100.0);
        Self {
            positive_coverage_percent: positive,
            negative_coverage_percent: round2(100.0 - positive),
        }
    }

    pub fn placeholder() -> Self {
        Self {
            positive_coverage_percent: 0.0,
            negative_coverage_percent: 100.0,
        }
    }
}

/// GeoJSON point feature carrying the location's prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub location: LocationKey,
    pub prediction: i64,
}

struct Point<'a>(&'a LocationKey);

impl Serialize for Point<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", "Point")?;
        map.serialize_entry("coordinates", &[self.0.lon(), self.0.lat()])?;
        map.end()
    }
}

#[derive(serde::Serialize)]
struct Properties<'a> {
    location: &'a LocationKey,
    prediction: i64,
}

impl Serialize for Feature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("type", "Feature")?;
        map.serialize_entry("geometry", &Point(&self.location))?;
        map.serialize_entry(
            "properties",
            &Properties {
                location: &self.location,
                prediction: self.prediction,
            },
        )?;
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutput {
    pub geometry_collection: Vec<Feature>,
    pub metrics: CoverageMetrics,
}

/// The model gave no answer for a location present in the local table.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyWarning {
    pub location: LocationKey,
}

impl fmt::Display for ConsistencyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no prediction returned for location {}; defaulted to {NEUTRAL_LABEL}",
            self.location
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assembly {
    pub output: PipelineOutput,
    pub warnings: Vec<ConsistencyWarning>,
}

/// Milestones inside the prediction-backed path, reported to the caller as they pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyStage {
    TablePrepared { rows: usize },
    ModelFinished { predictions: usize },
    MetricsComputed { warnings: usize },
}

/// Zero-filled output: every location neutral, full negative coverage.
pub fn assemble_placeholder(table: &MergedFeatureTable) -> PipelineOutput {
    PipelineOutput {
        geometry_collection: table
            .keys()
            .map(|loc| Feature {
                location: loc.clone(),
                prediction: NEUTRAL_LABEL,
            })
            .collect(),
        metrics: CoverageMetrics::placeholder(),
    }
}

/// Join predictions onto the table by exact location key. Missing ones default to neutral.
pub fn assemble_with_predictions(table: &MergedFeatureTable, predictions: &PredictionResult) -> Assembly {
    let mut warnings = Vec::new();
    let features: Vec<Feature> = table
        .keys()
        .map(|loc| {
            let prediction = match predictions.get(loc) {
                Some(p) => *p,
                None => {
                    let warning = ConsistencyWarning { location: loc.clone() };
                    tracing::warn!(location = %loc, "{warning}");
                    warnings.push(warning);
                    NEUTRAL_LABEL
                }
            };
            Feature {
                location: loc.clone(),
                prediction,
            }
        })
        .collect();

    if !warnings.is_empty() {
        counter!("pipeline_consistency_warnings_total").increment(warnings.len() as u64);
    }

    let metrics = CoverageMetrics::from_labels(features.iter().map(|f| f.prediction));
    Assembly {
        output: PipelineOutput {
            geometry_collection: features,
            metrics,
        },
        warnings,
    }
}

pub struct OutputAssembler {
    predictor: Arc<dyn Predictor>,
}

impl OutputAssembler {
    pub fn new(predictor: Arc<dyn Predictor>) -> Self {
        Self { predictor }
    }

    pub fn placeholder(&self, table: &MergedFeatureTable) -> Assembly {
        Assembly {
            output: assemble_placeholder(table),
            warnings: Vec::new(),
        }
    }

    /// Flatten, predict, join. An empty table skips the model call.
    pub async fn predicted(
        &self,
        table: &MergedFeatureTable,
        on_stage: &(dyn Fn(AssemblyStage) + Send + Sync),
    ) -> Result<Assembly, PredictionError> {
        let rows = flatten(table);
        on_stage(AssemblyStage::TablePrepared { rows: rows.len() });

        let predictions = if rows.is_empty() {
            PredictionResult::new()
        } else {
            self.predictor.predict(&rows).await?
        };
        on_stage(AssemblyStage::ModelFinished {
            predictions: predictions.len(),
        });

        let assembly = assemble_with_predictions(table, &predictions);
        on_stage(AssemblyStage::MetricsComputed {
            warnings: assembly.warnings.len(),
        });
        Ok(assembly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::parse_source_grid;
    use serde_json::json;

    fn table(locs: &[&str]) -> MergedFeatureTable {
        let mut payload = serde_json::Map::new();
        for l in locs {
            payload.insert(l.to_string(), json!({"p1": {"B2": 0.1}}));
        }
        parse_source_grid(&serde_json::Value::Object(payload)).unwrap()
    }

    #[test]
    fn coverage_sums_to_hundred_or_is_zero() {
        let m = CoverageMetrics::from_labels([1, 0, 0]);
        assert_eq!(m.positive_coverage_percent, 33.33);
        assert_eq!(m.negative_coverage_percent, 66.67);
        assert!((m.positive_coverage_percent + m.negative_coverage_percent - 100.0).abs() < 0.01);

        let m = CoverageMetrics::from_labels([1, 1, 2, 0, 1, 0, 1]);
        assert!((m.positive_coverage_percent + m.negative_coverage_percent - 100.0).abs() < 0.01);

        let m = CoverageMetrics::from_labels(std::iter::empty());
        assert_eq!(m.positive_coverage_percent, 0.0);
        assert_eq!(m.negative_coverage_percent, 0.0);
    }

    #[test]
    fn placeholder_is_all_neutral() {
        let out = assemble_placeholder(&table(&["1,1", "2,2", "3,3"]));
        assert_eq!(out.geometry_collection.len(), 3);
        assert!(out.geometry_collection.iter().all(|f| f.prediction == 0));
        assert_eq!(out.metrics, CoverageMetrics::placeholder());
    }

    #[test]
    fn missing_predictions_default_and_warn() {
        let t = table(&["1,1", "2,2", "3,3"]);
        let mut preds = PredictionResult::new();
        preds.insert(LocationKey::from_coords(1.0, 1.0), 1);
        preds.insert(LocationKey::from_coords(3.0, 3.0), 0);

        let a = assemble_with_predictions(&t, &preds);
        let labels: Vec<_> = a.output.geometry_collection.iter().map(|f| f.prediction).collect();
        assert_eq!(labels, vec![1, 0, 0]);
        assert_eq!(a.warnings.len(), 1);
        assert_eq!(a.warnings[0].location, LocationKey::from_coords(2.0, 2.0));
    }

    #[test]
    fn feature_serializes_as_geojson_point() {
        let f = Feature {
            location: LocationKey::parse("10.0,20.0").unwrap(),
            prediction: 1,
        };
        assert_eq!(
            serde_json::to_value(&f).unwrap(),
            json!({
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [10.0, 20.0]},
                "properties": {"location": "10.0,20.0", "prediction": 1}
            })
        );
    }
}
