// src/sources/http.rs
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use crate::grid::parse_source_grid;
use crate::region::{DateRange, Region};
use crate::sources::types::{FetchError, SourceFetcher, SourceKey, SourcePayload};

pub const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 60;

#[derive(Serialize)]
struct ExtractRequest<'a> {
    region: &'a Value,
    start_date: String,
    end_date: String,
}

/// Imagery provider endpoint for one source (`POST {region, start_date, end_date}`).
#[derive(Clone)]
pub struct HttpSourceFetcher {
    key: SourceKey,
    url: String,
    client: Client,
    timeout: Duration,
}

impl HttpSourceFetcher {
    pub fn new(key: SourceKey, url: impl Into<String>, client: Client) -> Self {
        Self {
            key,
            url: url.into(),
            client,
            timeout: Duration::from_secs(DEFAULT_SOURCE_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_inner(&self, region: &Region, range: &DateRange) -> Result<SourcePayload, FetchError> {
        let body = ExtractRequest {
            region: region.as_value(),
            start_date: range.start_str(),
            end_date: range.end_str(),
        };

        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| FetchError::Transport {
                key: self.key,
                message: describe_transport_error(&e, self.timeout),
            })?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchError::Status {
                key: self.key,
                status: status.as_u16(),
            });
        }

        let raw: Value = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Transport {
                    key: self.key,
                    message: describe_transport_error(&e, self.timeout),
                }
            } else {
                FetchError::Decode {
                    key: self.key,
                    message: e.to_string(),
                }
            }
        })?;
        let grid = parse_source_grid(&raw).map_err(|e| FetchError::Decode {
            key: self.key,
            message: e.to_string(),
        })?;
        Ok(SourcePayload { raw, grid })
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch(&self, region: &Region, range: &DateRange) -> Result<SourcePayload, FetchError> {
        let t0 = Instant::now();
        let out = self.fetch_inner(region, range).await;
        histogram!("source_fetch_ms", "source" => self.key.as_str())
            .record(t0.elapsed().as_secs_f64() * 1_000.0);

        match &out {
            Ok(payload) => tracing::debug!(
                source = %self.key,
                locations = payload.grid.len(),
                "source fetch ok"
            ),
            Err(e) => {
                tracing::warn!(source = %self.key, error = %e, "source fetch failed");
                counter!("source_fetch_errors_total", "source" => self.key.as_str()).increment(1);
            }
        }
        out
    }

    fn key(&self) -> SourceKey {
        self.key
    }
}

pub(crate) fn describe_transport_error(e: &reqwest::Error, timeout: Duration) -> String {
    if e.is_timeout() {
        format!("timed out after {}s", timeout.as_secs_f64())
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    }
}
