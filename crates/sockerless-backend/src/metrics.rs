//! Request metrics middleware.
//!
//! Counts requests and keeps recent latencies per route. Keys are the route
//! pattern (`GET /containers/{id}/json`), not the concrete URI, so ids never
//! become keys.

use crate::routes::Route;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Latency samples kept per route.
const MAX_SAMPLES: usize = 1000;

#[derive(Debug, Default)]
struct Samples {
    count: u64,
    latencies: Vec<Duration>,
}

/// Per-route request counters.
#[derive(Debug, Default)]
pub struct RequestMetrics {
    routes: Mutex<HashMap<String, Samples>>,
}

/// Latency percentiles in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatencyStats {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub requests: BTreeMap<String, u64>,
    #[serde(rename = "latency_ms")]
    pub latency: BTreeMap<String, LatencyStats>,
    pub uptime_seconds: u64,
    pub containers: usize,
    pub active_resources: usize,
}

impl RequestMetrics {
    /// Creates empty counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one request. When the sample buffer is full the older half is
    /// dropped.
    pub fn record(&self, key: &str, elapsed: Duration) {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let samples = routes.entry(key.to_string()).or_default();
        samples.count += 1;
        if samples.latencies.len() >= MAX_SAMPLES {
            samples.latencies.drain(..MAX_SAMPLES / 2);
        }
        samples.latencies.push(elapsed);
    }

    /// Copies the counters and computes percentiles.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot = MetricsSnapshot::default();
        for (key, samples) in routes.iter() {
            snapshot.requests.insert(key.clone(), samples.count);
            if samples.latencies.is_empty() {
                continue;
            }
            let mut sorted = samples.latencies.clone();
            sorted.sort_unstable();
            let at = |pct: usize| {
                let ms = sorted[sorted.len() * pct / 100].as_millis();
                u64::try_from(ms).unwrap_or(u64::MAX)
            };
            snapshot.latency.insert(
                key.clone(),
                LatencyStats {
                    p50: at(50),
                    p95: at(95),
                    p99: at(99),
                },
            );
        }
        snapshot
    }
}

/// Times the request and records it under the route's pattern.
pub async fn record_request(
    State((metrics, route)): State<(Arc<RequestMetrics>, Route)>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let response = next.run(request).await;
    metrics.record(&route.to_string(), started.elapsed());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_come_from_recorded_samples() {
        let metrics = RequestMetrics::new();
        for ms in 1..=100 {
            metrics.record("GET /_ping", Duration::from_millis(ms));
        }
        metrics.record("POST /containers/create", Duration::from_millis(7));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests["GET /_ping"], 100);
        assert_eq!(snapshot.requests["POST /containers/create"], 1);
        let ping = snapshot.latency["GET /_ping"];
        assert_eq!(ping.p50, 51);
        assert_eq!(ping.p95, 96);
        assert_eq!(ping.p99, 100);
        assert_eq!(snapshot.latency["POST /containers/create"].p99, 7);
    }

    #[test]
    fn sample_buffer_stays_bounded() {
        let metrics = RequestMetrics::new();
        for _ in 0..(MAX_SAMPLES * 3) {
            metrics.record("GET /info", Duration::from_millis(1));
        }
        let routes = metrics.routes.lock().unwrap();
        let samples = &routes["GET /info"];
        assert_eq!(samples.count, 3000);
        assert!(samples.latencies.len() <= MAX_SAMPLES);
    }
}
