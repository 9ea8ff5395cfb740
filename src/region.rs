// src/region.rs
//! Caller-supplied query inputs: the area of interest and the date window.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

const ACCEPTED_GEOJSON_TYPES: [&str; 4] = ["Polygon", "MultiPolygon", "Feature", "FeatureCollection"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("geojson must be a JSON object")]
    RegionNotObject,
    #[error("geojson is missing a string 'type'")]
    RegionMissingType,
    #[error("unsupported geojson type '{0}'")]
    RegionUnsupportedType(String),
    #[error("No geometry provided")]
    RegionMissingGeometry,
    #[error("invalid {field} '{value}' (expected YYYY-MM-DD)")]
    InvalidDate { field: &'static str, value: String },
    #[error("startDate {start} is after endDate {end}")]
    InvertedDateRange { start: NaiveDate, end: NaiveDate },
}

/// Opaque polygon / multi-polygon payload. Forwarded to providers untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Region(Value);

impl Region {
    /// Shape check only; coordinates are the provider's business.
    pub fn new(geojson: Value) -> Result<Self, InputError> {
        if geojson.is_null() {
            return Err(InputError::RegionMissingGeometry);
        }
        let obj = geojson.as_object().ok_or(InputError::RegionNotObject)?;
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(InputError::RegionMissingType)?;
        if !ACCEPTED_GEOJSON_TYPES.contains(&kind) {
            return Err(InputError::RegionUnsupportedType(kind.to_string()));
        }
        if kind == "Feature" && obj.get("geometry").map_or(true, Value::is_null) {
            return Err(InputError::RegionMissingGeometry);
        }
        Ok(Self(geojson))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Inclusive query window, `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, InputError> {
        if start > end {
            return Err(InputError::InvertedDateRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Parse optional request dates, falling back to the configured defaults.
    pub fn from_request(
        start: Option<&str>,
        end: Option<&str>,
        default_start: NaiveDate,
        default_end: NaiveDate,
    ) -> Result<Self, InputError> {
        let start = match start {
            Some(s) => parse_date("startDate", s)?,
            None => default_start,
        };
        let end = match end {
            Some(s) => parse_date("endDate", s)?,
            None => default_end,
        };
        Self::new(start, end)
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn start_str(&self) -> String {
        self.start.format(DATE_FORMAT).to_string()
    }

    pub fn end_str(&self) -> String {
        self.end.format(DATE_FORMAT).to_string()
    }
}

pub fn parse_date(field: &'static str, raw: &str) -> Result<NaiveDate, InputError> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).map_err(|_| InputError::InvalidDate {
        field,
        value: raw.to_string(),
    })
}
