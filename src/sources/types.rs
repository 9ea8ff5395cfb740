// src/sources/types.rs
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::grid::SourceGrid;
use crate::region::{DateRange, Region};

/// Upstream data sources, declared in default merge priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKey {
    /// Optical reflectance bands and indices.
    Primary,
    /// Radar backscatter.
    Secondary,
}

impl SourceKey {
    pub const ALL: [SourceKey; 2] = [SourceKey::Primary, SourceKey::Secondary];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKey::Primary => "primary",
            SourceKey::Secondary => "secondary",
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(SourceKey::Primary),
            "secondary" => Ok(SourceKey::Secondary),
            other => Err(format!("unknown source '{other}'")),
        }
    }
}

/// Failure of one source fetch. A value, never a panic past the fetcher.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    #[error("{key} request failed: {message}")]
    Transport { key: SourceKey, message: String },
    #[error("{key} service responded with HTTP {status}")]
    Status { key: SourceKey, status: u16 },
    #[error("{key} payload could not be decoded: {message}")]
    Decode { key: SourceKey, message: String },
}

impl FetchError {
    pub fn key(&self) -> SourceKey {
        match self {
            FetchError::Transport { key, .. }
            | FetchError::Status { key, .. }
            | FetchError::Decode { key, .. } => *key,
        }
    }
}

/// A successful fetch: the raw body (echoed back to the caller) and its decoded grid.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePayload {
    pub raw: Value,
    pub grid: SourceGrid,
}

#[async_trait::async_trait]
pub trait SourceFetcher: Send + Sync {
    /// One bounded-time request for the region and window.
    async fn fetch(&self, region: &Region, range: &DateRange) -> Result<SourcePayload, FetchError>;
    fn key(&self) -> SourceKey;
}
