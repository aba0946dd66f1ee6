//! Metrics collection utilities.
//!
//! Aggregates global and per-client statistics with latency percentiles.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Aggregated metrics across all clients.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub tokens_solved: u64,
    pub tokens_failed: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_requests: 0,
            successes: 0,
            failures: 0,
            tokens_solved: 0,
            tokens_failed: 0,
            average_latency: None,
            p95_latency: None,
        }
    }
}

/// Client-scoped metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub client_id: String,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rotations: u64,
    pub retries: u64,
    pub circuit_opens: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub last_status: Option<u16>,
}

impl ClientStats {
    fn from_accumulator(client_id: &str, acc: &ClientAccumulator) -> Self {
        let (avg, p95) = acc.latency_stats();
        Self {
            client_id: client_id.to_string(),
            total_requests: acc.total_requests,
            successes: acc.successes,
            failures: acc.failures,
            rotations: acc.rotations,
            retries: acc.retries,
            circuit_opens: acc.circuit_opens,
            average_latency: avg,
            p95_latency: p95,
            last_status: acc.last_status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub clients: Vec<ClientStats>,
}

#[derive(Debug)]
struct ClientAccumulator {
    total_requests: u64,
    successes: u64,
    failures: u64,
    rotations: u64,
    retries: u64,
    circuit_opens: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
    last_status: Option<u16>,
}

impl ClientAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            total_requests: 0,
            successes: 0,
            failures: 0,
            rotations: 0,
            retries: 0,
            circuit_opens: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            last_status: None,
        }
    }

    fn record(&mut self, status: u16, latency: Duration) {
        self.total_requests += 1;
        self.last_status = Some(status);

        if (200..300).contains(&status) {
            self.successes += 1;
        } else {
            self.failures += 1;
        }

        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        percentiles(self.latencies.iter().copied())
    }
}

fn percentiles(samples: impl Iterator<Item = Duration>) -> (Option<Duration>, Option<Duration>) {
    let mut samples: Vec<_> = samples.collect();
    if samples.is_empty() {
        return (None, None);
    }
    samples.sort_unstable();
    let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
    let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
    (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    clients: HashMap<String, ClientAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            clients: HashMap::new(),
        }
    }

    fn accumulator_mut(&mut self, client_id: &str) -> &mut ClientAccumulator {
        let window = self.max_window;
        self.clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientAccumulator::new(window))
    }
}

/// Thread-safe metrics collector shared by event handlers.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(128))),
        }
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_response(&self, client_id: &str, status: u16, latency: Duration) {
        let mut guard = self.lock();
        guard.global.total_requests += 1;
        if (200..300).contains(&status) {
            guard.global.successes += 1;
        } else {
            guard.global.failures += 1;
        }

        if let Some(avg) = guard.global.average_latency {
            let blended = (avg.as_secs_f64() * 0.9) + (latency.as_secs_f64() * 0.1);
            guard.global.average_latency = Some(Duration::from_secs_f64(blended));
        } else {
            guard.global.average_latency = Some(latency);
        }

        guard.accumulator_mut(client_id).record(status, latency);

        let (_, p95) = percentiles(
            guard
                .clients
                .values()
                .flat_map(|client| client.latencies.iter().copied()),
        );
        guard.global.p95_latency = p95;
    }

    /// Failure without a response (transport error, circuit open).
    pub fn record_error(&self, client_id: &str) {
        let mut guard = self.lock();
        guard.global.failures += 1;
        let acc = guard.accumulator_mut(client_id);
        acc.failures += 1;
        acc.last_status = None;
    }

    pub fn record_rotation(&self, client_id: &str) {
        self.lock().accumulator_mut(client_id).rotations += 1;
    }

    pub fn record_retry(&self, client_id: &str) {
        self.lock().accumulator_mut(client_id).retries += 1;
    }

    pub fn record_circuit_open(&self, client_id: &str) {
        self.lock().accumulator_mut(client_id).circuit_opens += 1;
    }

    pub fn record_token_solved(&self) {
        self.lock().global.tokens_solved += 1;
    }

    pub fn record_token_failed(&self) {
        self.lock().global.tokens_failed += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.lock();
        let mut clients: Vec<_> = guard
            .clients
            .iter()
            .map(|(client_id, acc)| ClientStats::from_accumulator(client_id, acc))
            .collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        MetricsSnapshot {
            global: guard.global.clone(),
            clients,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_success_and_failure() {
        let metrics = MetricsCollector::new();
        metrics.record_response("encar", 200, Duration::from_millis(150));
        metrics.record_response("encar", 503, Duration::from_millis(800));
        metrics.record_error("encar");

        let snapshot = metrics.snapshot();
        let client = snapshot.clients.iter().find(|c| c.client_id == "encar").unwrap();
        assert_eq!(client.total_requests, 2);
        assert_eq!(client.successes, 1);
        assert_eq!(client.failures, 2);
        assert_eq!(snapshot.global.failures, 2);
    }

    #[test]
    fn p95_tracks_slowest_samples() {
        let metrics = MetricsCollector::with_window(20);
        for ms in 1..=20u64 {
            metrics.record_response("che168", 200, Duration::from_millis(ms * 10));
        }
        let snapshot = metrics.snapshot();
        let client = &snapshot.clients[0];
        assert_eq!(client.p95_latency, Some(Duration::from_millis(190)));
        assert_eq!(snapshot.global.p95_latency, Some(Duration::from_millis(190)));
    }
}
