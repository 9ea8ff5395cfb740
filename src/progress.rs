// src/progress.rs
//! Progress broadcasting: a topic-keyed pub/sub hub plus a per-run emitter.
//!
//! Publishing never waits on subscribers. Each topic is a `tokio::sync::broadcast`
//! channel: a subscriber that falls behind loses the oldest events (no resend),
//! and a topic nobody listens to simply drops what is published to it.
//! Subscribers only see events published after they joined.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const DEFAULT_TOPIC: &str = "satellite_progress";
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Progress,
    Error,
}

/// Wire envelope: `{type, startProgress?, endProgress?, message}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_progress: Option<f64>,
    pub message: String,
}

impl ProgressEvent {
    pub fn progress(start: f64, end: f64, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Progress,
            start_progress: Some(start),
            end_progress: Some(end),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Error,
            start_progress: None,
            end_progress: None,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == EventKind::Error
    }
}

/// Fire-and-forget publication to a named topic. Must not fail or block.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, topic: &str, event: ProgressEvent);
}

/// In-process pub/sub transport, one broadcast channel per topic.
#[derive(Debug)]
pub struct ProgressHub {
    topics: RwLock<HashMap<String, broadcast::Sender<ProgressEvent>>>,
    capacity: usize,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<ProgressEvent> {
        let mut topics = match self.topics.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = match self.topics.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics.get(topic).map_or(0, |tx| tx.receiver_count())
    }
}

impl ProgressSink for ProgressHub {
    fn publish(&self, topic: &str, event: ProgressEvent) {
        let topics = match self.topics.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(tx) = topics.get(topic) else {
            tracing::trace!(topic, "progress topic has no subscribers yet; event dropped");
            return;
        };
        match tx.send(event) {
            Ok(receivers) => {
                counter!("progress_events_published_total").increment(1);
                tracing::trace!(topic, receivers, "progress event published");
            }
            Err(_) => tracing::trace!(topic, "no live subscribers; event dropped"),
        }
    }
}

#[derive(Debug, Default)]
struct EmitterState {
    high_water: f64,
    failed: bool,
}

/// Per-run publisher bound to one topic.
///
/// Keeps percentages non-decreasing for the lifetime of the run and emits at
/// most one error event. Publication happens under the emitter lock so events
/// from concurrent tasks of the same run keep their order.
pub struct ProgressEmitter {
    sink: Arc<dyn ProgressSink>,
    topic: String,
    state: Mutex<EmitterState>,
}

impl ProgressEmitter {
    pub fn new(sink: Arc<dyn ProgressSink>, topic: impl Into<String>) -> Self {
        Self {
            sink,
            topic: topic.into(),
            state: Mutex::new(EmitterState::default()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn progress(&self, start: f64, end: f64, message: impl Into<String>) {
        let mut st = self.lock();
        if st.failed {
            return;
        }
        let start = start.max(st.high_water);
        let end = end.max(start);
        st.high_water = end;
        self.sink
            .publish(&self.topic, ProgressEvent::progress(start, end, message));
    }

    /// Terminal error event; later calls are ignored.
    pub fn error(&self, message: impl Into<String>) {
        let mut st = self.lock();
        if st.failed {
            return;
        }
        st.failed = true;
        self.sink.publish(&self.topic, ProgressEvent::error(message));
    }

    pub fn high_water(&self) -> f64 {
        self.lock().high_water
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EmitterState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn envelope_matches_wire_shape() {
        let ev = ProgressEvent::progress(10.0, 25.0, "primary fetched");
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"type": "progress", "startProgress": 10.0, "endProgress": 25.0, "message": "primary fetched"})
        );

        let v = serde_json::to_value(ProgressEvent::error("boom")).unwrap();
        assert_eq!(v, serde_json::json!({"type": "error", "message": "boom"}));
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let hub = ProgressHub::new(4);
        hub.publish("nobody", ProgressEvent::progress(0.0, 10.0, "x"));
        assert_eq!(hub.subscriber_count("nobody"), 0);
    }

    #[test]
    fn late_subscribers_only_see_later_events() {
        let hub = ProgressHub::new(16);
        let mut early = hub.subscribe("t");
        hub.publish("t", ProgressEvent::progress(0.0, 10.0, "one"));
        let mut late = hub.subscribe("t");
        hub.publish("t", ProgressEvent::progress(10.0, 20.0, "two"));

        let early: Vec<_> = drain(&mut early).into_iter().map(|e| e.message).collect();
        let late: Vec<_> = drain(&mut late).into_iter().map(|e| e.message).collect();
        assert_eq!(early, vec!["one", "two"]);
        assert_eq!(late, vec!["two"]);
    }

    #[test]
    fn topics_are_isolated() {
        let hub = ProgressHub::new(16);
        let mut a = hub.subscribe("a");
        let mut b = hub.subscribe("b");
        hub.publish("a", ProgressEvent::progress(0.0, 1.0, "for a"));
        assert_eq!(drain(&mut a).len(), 1);
        assert!(drain(&mut b).is_empty());
    }

    #[test]
    fn emitter_clamps_to_high_water_and_errors_once() {
        let hub = Arc::new(ProgressHub::new(16));
        let mut rx = hub.subscribe("run");
        let emitter = ProgressEmitter::new(hub.clone(), "run");

        emitter.progress(0.0, 40.0, "a");
        emitter.progress(10.0, 25.0, "stale");
        emitter.error("first");
        emitter.error("second");
        emitter.progress(50.0, 60.0, "after failure");

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].start_progress, Some(40.0));
        assert_eq!(events[1].end_progress, Some(40.0));
        assert_eq!(events.iter().filter(|e| e.is_error()).count(), 1);
        assert_eq!(events[2].message, "first");
    }
}
