// src/grid.rs
//! Keyed feature grids shared by the fetch, merge and prediction stages.
//!
//! Providers answer with `location -> period -> feature -> value`. Key order
//! matters downstream (merge output order follows the primary source), so the
//! grids are stored in [`OrderedMap`]s that remember insertion order.

use std::fmt;
use std::hash::{Hash, Hasher};

use indexmap::IndexMap;
use serde::ser::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Label of a sub-interval of the query window (e.g. `"2024-01"`).
pub type PeriodKey = String;

/// Feature name -> numeric value, for one source, location and period.
pub type FeatureSet = OrderedMap<String, f64>;

/// Period -> features, for one location.
pub type PeriodSeries = OrderedMap<PeriodKey, FeatureSet>;

/// One source's answer: location -> period -> features.
pub type SourceGrid = OrderedMap<LocationKey, PeriodSeries>;

/// Union of every source's features, keyed like a [`SourceGrid`].
pub type MergedFeatureTable = OrderedMap<LocationKey, PeriodSeries>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GridError {
    #[error("invalid location key '{0}' (expected \"lon,lat\")")]
    InvalidLocationKey(String),
    #[error("expected a JSON object at {0}")]
    NotAnObject(String),
    #[error("non-numeric feature value at {0}")]
    NonNumeric(String),
}

/// Map that iterates in insertion order. Re-inserting a key keeps its slot.
pub type OrderedMap<K, V> = IndexMap<K, V>;

/// Canonical `"lon,lat"` identity of a sampled location.
///
/// Two keys are equal iff their decoded coordinates are equal, so `"10,20"`
/// and `"10.0, 20.0"` join. The original spelling is kept for output.
#[derive(Debug, Clone)]
pub struct LocationKey {
    raw: String,
    lon: f64,
    lat: f64,
}

impl LocationKey {
    pub fn parse(raw: &str) -> Result<Self, GridError> {
        let bad = || GridError::InvalidLocationKey(raw.to_string());
        let trimmed = raw.trim();
        let inner = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(trimmed);
        let (lon, lat) = inner.split_once(',').ok_or_else(bad)?;
        let lon: f64 = lon.trim().parse().map_err(|_| bad())?;
        let lat: f64 = lat.trim().parse().map_err(|_| bad())?;
        if !lon.is_finite() || !lat.is_finite() {
            return Err(bad());
        }
        Ok(Self {
            raw: trimmed.to_string(),
            lon,
            lat,
        })
    }

    /// Build a key from coordinates returned by a remote service.
    pub fn from_coords(lon: f64, lat: f64) -> Self {
        Self {
            raw: format!("{lon:?},{lat:?}"),
            lon,
            lat,
        }
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

// -0.0 and 0.0 decode to the same location
fn coord_bits(v: f64) -> u64 {
    if v == 0.0 {
        0.0f64.to_bits()
    } else {
        v.to_bits()
    }
}

impl PartialEq for LocationKey {
    fn eq(&self, other: &Self) -> bool {
        coord_bits(self.lon) == coord_bits(other.lon) && coord_bits(self.lat) == coord_bits(other.lat)
    }
}

impl Eq for LocationKey {}

impl Hash for LocationKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        coord_bits(self.lon).hash(state);
        coord_bits(self.lat).hash(state);
    }
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for LocationKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

/// Decode a provider payload into a [`SourceGrid`], keeping the payload's key order.
///
/// `null` feature values are treated as absent so the merge can apply defaults.
pub fn parse_source_grid(payload: &Value) -> Result<SourceGrid, GridError> {
    let locations = payload
        .as_object()
        .ok_or_else(|| GridError::NotAnObject("$".into()))?;

    let mut grid = SourceGrid::with_capacity(locations.len());
    for (raw_loc, periods) in locations {
        let loc = LocationKey::parse(raw_loc)?;
        let periods = periods
            .as_object()
            .ok_or_else(|| GridError::NotAnObject(format!("$.{raw_loc}")))?;

        let series = grid.entry(loc).or_insert_with(PeriodSeries::new);
        for (period, features) in periods {
            let features = features
                .as_object()
                .ok_or_else(|| GridError::NotAnObject(format!("$.{raw_loc}.{period}")))?;

            let mut set = FeatureSet::with_capacity(features.len());
            for (name, value) in features {
                match value {
                    Value::Null => continue,
                    v => {
                        let n = v.as_f64().ok_or_else(|| {
                            GridError::NonNumeric(format!("$.{raw_loc}.{period}.{name}"))
                        })?;
                        set.insert(name.clone(), n);
                    }
                }
            }
            series.insert(period.clone(), set);
        }
    }
    Ok(grid)
}
