// src/coordinator.rs
//! Parallel fan-out over the configured sources with shared completion tracking.
//!
//! Every fetch runs as its own task. When a fetch finishes (success or failure)
//! its task takes the tracker lock, bumps the completion counter, stores its
//! outcome and publishes the matching checkpoint before releasing the lock.
//! The lock is never held across the network call. Sibling fetches are never
//! cancelled: all outcomes are collected before returning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::task::JoinSet;

use crate::progress::ProgressEmitter;
use crate::region::{DateRange, Region};
use crate::sources::{FetchError, SourceFetcher, SourceKey, SourcePayload};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("fetch task aborted: {0}")]
    TaskAborted(String),
}

/// Outcome of every source, in the order the fetchers were given.
#[derive(Debug)]
pub struct FetchResults {
    outcomes: Vec<(SourceKey, Result<SourcePayload, FetchError>)>,
}

impl FetchResults {
    pub fn outcomes(&self) -> &[(SourceKey, Result<SourcePayload, FetchError>)] {
        &self.outcomes
    }

    pub fn failures(&self) -> Vec<&FetchError> {
        self.outcomes.iter().filter_map(|(_, r)| r.as_ref().err()).collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|(_, r)| r.is_ok())
    }

    pub fn into_outcomes(self) -> Vec<(SourceKey, Result<SourcePayload, FetchError>)> {
        self.outcomes
    }
}

#[derive(Default)]
struct CompletionTracker {
    completed: usize,
    results: HashMap<usize, Result<SourcePayload, FetchError>>,
}

/// One instance per pipeline run; `run` consumes it.
pub struct ParallelFetchCoordinator {
    emitter: Arc<ProgressEmitter>,
    start_percent: f64,
    mid_percent: f64,
    tracker: Arc<Mutex<CompletionTracker>>,
}

impl ParallelFetchCoordinator {
    pub fn new(emitter: Arc<ProgressEmitter>, start_percent: f64, mid_percent: f64) -> Self {
        Self {
            emitter,
            start_percent,
            mid_percent: mid_percent.max(start_percent),
            tracker: Arc::new(Mutex::new(CompletionTracker::default())),
        }
    }

    /// Checkpoint reached after the k-th of n completions.
    pub fn checkpoint(start: f64, mid: f64, k: usize, n: usize) -> f64 {
        if n == 0 {
            return mid;
        }
        start + (k as f64) * (mid - start) / (n as f64)
    }

    pub async fn run(
        self,
        fetchers: &[Arc<dyn SourceFetcher>],
        region: &Region,
        range: &DateRange,
    ) -> Result<FetchResults, CoordinatorError> {
        let total = fetchers.len();
        let mut set = JoinSet::new();

        for (idx, fetcher) in fetchers.iter().enumerate() {
            let fetcher = Arc::clone(fetcher);
            let region = region.clone();
            let range = *range;
            let tracker = Arc::clone(&self.tracker);
            let emitter = Arc::clone(&self.emitter);
            let (start, mid) = (self.start_percent, self.mid_percent);

            set.spawn(async move {
                let key = fetcher.key();
                let result = fetcher.fetch(&region, &range).await;

                let mut guard = match tracker.lock() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.completed += 1;
                let k = guard.completed;
                let message = match &result {
                    Ok(_) => format!("{key} source data received ({k}/{total})"),
                    Err(_) => format!("{key} source finished with an error ({k}/{total})"),
                };
                guard.results.insert(idx, result);
                emitter.progress(
                    Self::checkpoint(start, mid, k - 1, total),
                    Self::checkpoint(start, mid, k, total),
                    message,
                );
            });
        }

        let mut aborted = None;
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "fetch task aborted");
                aborted.get_or_insert(CoordinatorError::TaskAborted(e.to_string()));
            }
        }
        if let Some(err) = aborted {
            return Err(err);
        }

        let mut tracker = match self.tracker.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut outcomes = Vec::with_capacity(total);
        for (idx, fetcher) in fetchers.iter().enumerate() {
            let key = fetcher.key();
            match tracker.results.remove(&idx) {
                Some(result) => outcomes.push((key, result)),
                None => {
                    return Err(CoordinatorError::TaskAborted(format!(
                        "{key} task finished without reporting"
                    )))
                }
            }
        }
        Ok(FetchResults { outcomes })
    }
}
