//! Per-stage latency and pipeline counters.
//! Each latency metric keeps a bounded window of recent samples (µs) and
//! reports nearest-rank percentiles; counters only ever go up.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

const WINDOW_SAMPLES: usize = 512;

/// Times one stage. Recorded only when `finish` is called, so an
/// early-returning stage leaves no sample.
pub struct TimingSpan {
    metric: &'static str,
    started: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    /// Record the elapsed time and return it in microseconds.
    pub fn finish(self) -> u64 {
        let micros = self.started.elapsed().as_micros() as u64;
        self.registry.record(self.metric, micros);
        micros
    }
}

#[derive(Default)]
struct LatencyWindow {
    recent: VecDeque<u64>,
    total: u64,
}

impl LatencyWindow {
    fn push(&mut self, micros: u64) {
        if self.recent.len() == WINDOW_SAMPLES {
            self.recent.pop_front();
        }
        self.recent.push_back(micros);
        self.total += 1;
    }

    /// Nearest-rank percentile over the window; 0 when empty.
    fn percentile(&self, p: f64) -> u64 {
        if self.recent.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.recent.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((p.clamp(0.0, 100.0) / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
    }
}

#[derive(Default)]
pub struct MetricsRegistry {
    latencies: Mutex<HashMap<&'static str, LatencyWindow>>,
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, metric: &'static str, micros: u64) {
        self.latencies.lock().entry(metric).or_default().push(micros);
        tracing::trace!(metric, micros, "latency_sample");
    }

    pub fn incr(&self, counter: &'static str) {
        *self.counters.lock().entry(counter).or_insert(0) += 1;
    }

    pub fn count(&self, counter: &str) -> u64 {
        self.counters.lock().get(counter).copied().unwrap_or(0)
    }

    pub fn span(self: &Arc<Self>, metric: &'static str) -> TimingSpan {
        TimingSpan {
            metric,
            started: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    /// `p` in 0..=100, result in microseconds.
    pub fn percentile(&self, metric: &str, p: f64) -> u64 {
        self.latencies
            .lock()
            .get(metric)
            .map_or(0, |window| window.percentile(p))
    }

    pub fn summary(&self) -> MetricsSnapshot {
        let latencies = self
            .latencies
            .lock()
            .iter()
            .map(|(metric, window)| {
                let summary = LatencySummary {
                    samples: window.total,
                    p50_us: window.percentile(50.0),
                    p95_us: window.percentile(95.0),
                    p99_us: window.percentile(99.0),
                };
                (metric.to_string(), summary)
            })
            .collect();
        let counters = self
            .counters
            .lock()
            .iter()
            .map(|(counter, value)| (counter.to_string(), *value))
            .collect();
        MetricsSnapshot { latencies, counters }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    /// Samples recorded since start, including ones that left the window.
    pub samples: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub latencies: HashMap<String, LatencySummary>,
    pub counters: HashMap<String, u64>,
}

pub mod metric_names {
    pub const TAKE_CAPTURE: &str = "t_take_capture";
    pub const FEATURE_STAGE: &str = "t_feature_stage";
    pub const EMBEDDING_STAGE: &str = "t_embedding_stage";
    pub const CLASSIFY_STAGE: &str = "t_classify_stage";
    pub const CHUNK_TOTAL: &str = "t_chunk_total";
    pub const MODEL_LOAD: &str = "t_model_load";

    pub const TAKES: &str = "takes";
    pub const TAKE_RETRIES: &str = "take_retries";
    pub const CHUNKS_DROPPED: &str = "chunks_dropped";
    pub const DETECTIONS: &str = "detections";
}
