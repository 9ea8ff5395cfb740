// src/config/pipeline.rs
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::merge::FeatureSchema;
use crate::predict::DEFAULT_PREDICTION_TIMEOUT_SECS;
use crate::progress::{DEFAULT_BROADCAST_CAPACITY, DEFAULT_TOPIC};
use crate::region::parse_date;
use crate::sources::http::DEFAULT_SOURCE_TIMEOUT_SECS;
use crate::sources::SourceKey;

pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";
pub const ENV_CONFIG_PATH: &str = "PIPELINE_CONFIG_PATH";
pub const ENV_PRIMARY_URL: &str = "PIPELINE_PRIMARY_URL";
pub const ENV_SECONDARY_URL: &str = "PIPELINE_SECONDARY_URL";
pub const ENV_PREDICTION_URL: &str = "PIPELINE_PREDICTION_URL";
pub const ENV_STAGE_DELAY_MS: &str = "PIPELINE_STAGE_DELAY_MS";

const DEFAULT_START_DATE: &str = "2024-01-01";
const DEFAULT_END_DATE: &str = "2024-02-01";
const DEFAULT_STAGE_DELAY_MS: u64 = 300;

fn default_source_timeout() -> u64 {
    DEFAULT_SOURCE_TIMEOUT_SECS
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,
    /// Feature vocabulary in column order. Empty: take names from the payload.
    #[serde(default)]
    pub features: Vec<String>,
    /// Fill value per feature for missing cells (unlisted features use 0.0).
    #[serde(default)]
    pub defaults: BTreeMap<String, f64>,
}

impl SourceConfig {
    pub fn schema(&self) -> FeatureSchema {
        FeatureSchema {
            features: self.features.clone(),
            defaults: self.defaults.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_primary")]
    pub primary: SourceConfig,
    #[serde(default = "default_secondary")]
    pub secondary: SourceConfig,
}

fn default_primary() -> SourceConfig {
    SourcesConfig::default().primary
}

fn default_secondary() -> SourceConfig {
    SourcesConfig::default().secondary
}

impl SourcesConfig {
    pub fn get(&self, key: SourceKey) -> &SourceConfig {
        match key {
            SourceKey::Primary => &self.primary,
            SourceKey::Secondary => &self.secondary,
        }
    }

    fn get_mut(&mut self, key: SourceKey) -> &mut SourceConfig {
        match key {
            SourceKey::Primary => &mut self.primary,
            SourceKey::Secondary => &mut self.secondary,
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            // Optical: Sentinel-2 surface reflectance bands + NDVI
            primary: SourceConfig {
                url: "http://localhost:4000/extract-s2-parameters".into(),
                timeout_secs: DEFAULT_SOURCE_TIMEOUT_SECS,
                features: ["B2", "B3", "B4", "B5", "B6", "B7", "B8", "B8A", "B11", "B12", "NDVI"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                defaults: BTreeMap::new(),
            },
            // Radar: Sentinel-1 backscatter
            secondary: SourceConfig {
                url: "http://localhost:4000/extract-s1-parameters".into(),
                timeout_secs: DEFAULT_SOURCE_TIMEOUT_SECS,
                features: vec!["VV".into(), "VH".into()],
                defaults: BTreeMap::new(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PredictionConfig {
    pub url: String,
    #[serde(default = "default_prediction_timeout")]
    pub timeout_secs: u64,
}

fn default_prediction_timeout() -> u64 {
    DEFAULT_PREDICTION_TIMEOUT_SECS
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6000/crop-prediction-psetae".into(),
            timeout_secs: DEFAULT_PREDICTION_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Progress topic every run publishes to.
    pub topic: String,
    /// Merge priority; the first successful source drives output order.
    pub source_order: Vec<SourceKey>,
    pub sources: SourcesConfig,
    pub prediction: PredictionConfig,
    pub default_start_date: String,
    pub default_end_date: String,
    /// Pacing delay between placeholder stages.
    pub stage_delay_ms: u64,
    pub broadcast_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            source_order: SourceKey::ALL.to_vec(),
            sources: SourcesConfig::default(),
            prediction: PredictionConfig::default(),
            default_start_date: DEFAULT_START_DATE.to_string(),
            default_end_date: DEFAULT_END_DATE.to_string(),
            stage_delay_ms: DEFAULT_STAGE_DELAY_MS,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: PipelineConfig = toml::from_str(s).context("parsing pipeline config toml")?;
        cfg.sanitized()
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Resolve config using env var + fallbacks, then apply env overrides:
    /// 1) $PIPELINE_CONFIG_PATH
    /// 2) config/pipeline.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        let base = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            Self::load_from(&pb)?
        } else {
            let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                Self::load_from(&default_path)?
            } else {
                Self::default()
            }
        };
        base.with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        for (var, key) in [
            (ENV_PRIMARY_URL, SourceKey::Primary),
            (ENV_SECONDARY_URL, SourceKey::Secondary),
        ] {
            if let Some(url) = non_empty_env(var) {
                self.sources.get_mut(key).url = url;
            }
        }
        if let Some(url) = non_empty_env(ENV_PREDICTION_URL) {
            self.prediction.url = url;
        }
        if let Some(raw) = non_empty_env(ENV_STAGE_DELAY_MS) {
            self.stage_delay_ms = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_STAGE_DELAY_MS} must be an integer, got '{raw}'"))?;
        }
        self.sanitized()
    }

    /// Parsed default query window.
    pub fn default_dates(&self) -> Result<(NaiveDate, NaiveDate)> {
        let start = parse_date("default_start_date", &self.default_start_date)?;
        let end = parse_date("default_end_date", &self.default_end_date)?;
        if start > end {
            bail!("default_start_date {start} is after default_end_date {end}");
        }
        Ok((start, end))
    }

    fn sanitized(mut self) -> Result<Self> {
        if self.source_order.is_empty() {
            bail!("source_order must name at least one source");
        }
        let mut seen = HashSet::new();
        for key in &self.source_order {
            if !seen.insert(*key) {
                bail!("source_order lists '{key}' more than once");
            }
        }
        for key in SourceKey::ALL {
            let src = self.sources.get_mut(key);
            if src.timeout_secs == 0 {
                src.timeout_secs = DEFAULT_SOURCE_TIMEOUT_SECS;
            }
        }
        if self.prediction.timeout_secs == 0 {
            self.prediction.timeout_secs = DEFAULT_PREDICTION_TIMEOUT_SECS;
        }
        if self.broadcast_capacity == 0 {
            self.broadcast_capacity = DEFAULT_BROADCAST_CAPACITY;
        }
        if self.topic.trim().is_empty() {
            self.topic = DEFAULT_TOPIC.to_string();
        }
        self.default_dates()?;
        Ok(self)
    }
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}
