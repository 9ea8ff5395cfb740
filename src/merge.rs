// src/merge.rs
//! # Feature Merger
//! Pure join of per-source grids into one [`MergedFeatureTable`].
//!
//! Policy:
//! - Sources are visited in the configured priority order. The first source
//!   that produced a grid is the *primary*: its locations, and within each
//!   location its periods, come first and in its insertion order.
//! - Locations and periods that only other sources know about are appended
//!   afterwards, so every location/period seen anywhere is present.
//! - Every cell carries every feature of every source's vocabulary. A source
//!   that lacks the location, the period or the feature contributes its
//!   configured default for that feature (0.0 when none is configured).
//! - If two vocabularies share a feature name, the higher-priority source wins.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

use crate::grid::{FeatureSet, LocationKey, MergedFeatureTable, PeriodKey, PeriodSeries, SourceGrid};
use crate::sources::SourceKey;

/// Feature vocabulary of one source and its fallback values.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FeatureSchema {
    /// Ordered feature names. Empty means "whatever the payload contains".
    #[serde(default)]
    pub features: Vec<String>,
    /// Value used when a cell is missing. Unlisted features default to 0.0.
    #[serde(default)]
    pub defaults: BTreeMap<String, f64>,
}

impl FeatureSchema {
    pub fn new<I, S>(features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            features: features.into_iter().map(Into::into).collect(),
            defaults: BTreeMap::new(),
        }
    }

    pub fn with_default(mut self, feature: impl Into<String>, value: f64) -> Self {
        self.defaults.insert(feature.into(), value);
        self
    }

    pub fn default_for(&self, feature: &str) -> f64 {
        self.defaults.get(feature).copied().unwrap_or(0.0)
    }
}

/// One merge input. `grid` is `None` when the source failed or was skipped.
#[derive(Debug, Clone, Copy)]
pub struct MergeSource<'a> {
    pub key: SourceKey,
    pub grid: Option<&'a SourceGrid>,
    pub schema: &'a FeatureSchema,
}

/// Effective vocabulary: configured names, or first-seen names from the grid.
pub fn vocabulary(source: &MergeSource<'_>) -> Vec<String> {
    if !source.schema.features.is_empty() {
        return source.schema.features.clone();
    }
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    if let Some(grid) = source.grid {
        for series in grid.values() {
            for features in series.values() {
                for name in features.keys() {
                    if seen.insert(name.clone()) {
                        out.push(name.clone());
                    }
                }
            }
        }
    }
    out
}

/// Merge `sources` (given in priority order) into one table.
pub fn merge(sources: &[MergeSource<'_>]) -> MergedFeatureTable {
    let present: Vec<&SourceGrid> = sources.iter().filter_map(|s| s.grid).collect();
    let vocabularies: Vec<Vec<String>> = sources.iter().map(vocabulary).collect();

    let mut table = MergedFeatureTable::new();
    for loc in location_order(&present) {
        let mut series = PeriodSeries::new();
        for period in period_order(&present, &loc) {
            let cell = merge_cell(sources, &vocabularies, &loc, &period);
            series.insert(period, cell);
        }
        table.insert(loc, series);
    }
    table
}

fn location_order(grids: &[&SourceGrid]) -> Vec<LocationKey> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for grid in grids {
        for loc in grid.keys() {
            if seen.insert(loc.clone()) {
                out.push(loc.clone());
            }
        }
    }
    out
}

fn period_order(grids: &[&SourceGrid], loc: &LocationKey) -> Vec<PeriodKey> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for series in grids.iter().filter_map(|g| g.get(loc)) {
        for period in series.keys() {
            if seen.insert(period.clone()) {
                out.push(period.clone());
            }
        }
    }
    out
}

fn merge_cell(
    sources: &[MergeSource<'_>],
    vocabularies: &[Vec<String>],
    loc: &LocationKey,
    period: &PeriodKey,
) -> FeatureSet {
    let width = vocabularies.iter().map(Vec::len).sum();
    let mut cell = FeatureSet::with_capacity(width);
    for (source, vocab) in sources.iter().zip(vocabularies) {
        let observed = source
            .grid
            .and_then(|g| g.get(loc))
            .and_then(|series| series.get(period));
        for name in vocab {
            if cell.contains_key(name) {
                continue;
            }
            let value = observed
                .and_then(|features| features.get(name))
                .copied()
                .unwrap_or_else(|| source.schema.default_for(name));
            cell.insert(name.clone(), value);
        }
    }
    cell
}
