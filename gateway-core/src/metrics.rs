//! Prometheus-style counters/gauges/histogram for pipeline outcomes
//! (spec.md 4.12). In-process only -- exposition via `/metrics` is the
//! ambient concern this crate owns; shipping it anywhere is the metrics
//! sink collaborator's job (spec.md 1).

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct Counter(AtomicU64);

impl Counter {
    fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

const DURATION_BUCKETS: [f64; 8] = [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

#[derive(Default)]
struct Histogram {
    bucket_counts: [AtomicU64; 8],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn observe(&self, seconds: f64) {
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// A small hand-rolled `Family<Labels, Counter>`: a label-keyed map of
/// atomic counters, backed by the same `dashmap` the rest of the core
/// already uses for concurrent maps (active requests, guard sets, breaker
/// state).
#[derive(Default)]
struct Family<L: std::hash::Hash + Eq + Clone> {
    series: DashMap<L, Counter>,
}

impl<L: std::hash::Hash + Eq + Clone> Family<L> {
    fn inc(&self, labels: L) {
        self.series.entry(labels).or_default().inc();
    }

    fn inc_by(&self, labels: L, n: u64) {
        self.series.entry(labels).or_default().inc_by(n);
    }

    fn get(&self, labels: &L) -> u64 {
        self.series.get(labels).map(|c| c.get()).unwrap_or(0)
    }
}

pub type RequestLabels = (String, String, String, &'static str);
pub type RateLimitLabels = (String, &'static str);

#[derive(Default)]
pub struct Metrics {
    requests_total: Family<RequestLabels>,
    cu_consumed_total: Family<RequestLabels>,
    rate_limit_exceeded_total: Family<RateLimitLabels>,
    quota_exceeded_total: Family<String>,
    redis_operations_total: Family<(&'static str, &'static str)>,
    whitelist_rejections_total: Family<(String, String)>,
    guard_blocks_total: Family<&'static str>,
    websocket_connections_total: Family<&'static str>,
    websocket_messages_total: Family<&'static str>,
    request_duration_seconds: DashMap<(String, String), Histogram>,
    consumer_monthly_quota: DashMap<String, AtomicU64>,
    consumer_monthly_used: DashMap<String, AtomicU64>,
    circuit_breaker_state: DashMap<String, AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, network: &str, method: &str, consumer: &str, status: &'static str) {
        self.requests_total
            .inc((network.to_string(), method.to_string(), consumer.to_string(), status));
    }

    pub fn record_cu_consumed(&self, network: &str, method: &str, consumer: &str, cu: u64) {
        self.cu_consumed_total.inc_by(
            (network.to_string(), method.to_string(), consumer.to_string(), "consumed"),
            cu,
        );
    }

    pub fn record_rate_limit_exceeded(&self, consumer: &str, limit_type: &'static str) {
        self.rate_limit_exceeded_total
            .inc((consumer.to_string(), limit_type));
    }

    pub fn record_quota_exceeded(&self, consumer: &str) {
        self.quota_exceeded_total.inc(consumer.to_string());
    }

    pub fn record_redis_operation(&self, op: &'static str, status: &'static str) {
        self.redis_operations_total.inc((op, status));
    }

    pub fn record_whitelist_rejection(&self, network: &str, method: &str) {
        self.whitelist_rejections_total
            .inc((network.to_string(), method.to_string()));
    }

    pub fn record_guard_block(&self, block_type: &'static str) {
        self.guard_blocks_total.inc(block_type);
    }

    pub fn record_websocket_connection(&self) {
        self.websocket_connections_total.inc("opened");
    }

    pub fn record_websocket_message(&self, direction: &'static str) {
        self.websocket_messages_total.inc(direction);
    }

    pub fn observe_request_duration(&self, network: &str, method: &str, seconds: f64) {
        self.request_duration_seconds
            .entry((network.to_string(), method.to_string()))
            .or_default()
            .observe(seconds);
    }

    pub fn set_consumer_monthly(&self, consumer: &str, quota: i64, used: i64) {
        self.consumer_monthly_quota
            .entry(consumer.to_string())
            .or_default()
            .store(quota.max(0) as u64, Ordering::Relaxed);
        self.consumer_monthly_used
            .entry(consumer.to_string())
            .or_default()
            .store(used.max(0) as u64, Ordering::Relaxed);
    }

    pub fn set_circuit_breaker_state(&self, endpoint: &str, state: redis_rate_limiter::CircuitState) {
        let value = match state {
            redis_rate_limiter::CircuitState::Closed => 0,
            redis_rate_limiter::CircuitState::Open => 1,
            redis_rate_limiter::CircuitState::HalfOpen => 2,
        };
        self.circuit_breaker_state
            .entry(endpoint.to_string())
            .or_default()
            .store(value, Ordering::Relaxed);
    }

    /// Prometheus text exposition format for the `/metrics` endpoint.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# TYPE gateway_requests_total counter\n");
        for entry in self.requests_total.series.iter() {
            let (network, method, consumer, status) = entry.key();
            out.push_str(&format!(
                "gateway_requests_total{{network=\"{network}\",method=\"{method}\",consumer=\"{consumer}\",status=\"{status}\"}} {}\n",
                entry.value().get()
            ));
        }

        out.push_str("# TYPE gateway_rate_limit_exceeded_total counter\n");
        for entry in self.rate_limit_exceeded_total.series.iter() {
            let (consumer, limit_type) = entry.key();
            out.push_str(&format!(
                "gateway_rate_limit_exceeded_total{{consumer=\"{consumer}\",limit_type=\"{limit_type}\"}} {}\n",
                entry.value().get()
            ));
        }

        out.push_str("# TYPE gateway_quota_exceeded_total counter\n");
        for entry in self.quota_exceeded_total.series.iter() {
            out.push_str(&format!(
                "gateway_quota_exceeded_total{{consumer=\"{}\"}} {}\n",
                entry.key(),
                entry.value().get()
            ));
        }

        out.push_str("# TYPE gateway_redis_circuit_breaker_state gauge\n");
        for entry in self.circuit_breaker_state.iter() {
            out.push_str(&format!(
                "gateway_redis_circuit_breaker_state{{endpoint=\"{}\"}} {}\n",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            ));
        }

        out
    }

    #[cfg(test)]
    pub fn requests_total_for(&self, labels: &RequestLabels) -> u64 {
        self.requests_total.get(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label_set() {
        let metrics = Metrics::new();
        metrics.record_request("eth-mainnet", "eth_call", "alice", "ok");
        metrics.record_request("eth-mainnet", "eth_call", "alice", "ok");
        metrics.record_request("eth-mainnet", "eth_call", "bob", "ok");

        let labels = ("eth-mainnet".to_string(), "eth_call".to_string(), "alice".to_string(), "ok");
        assert_eq!(metrics.requests_total_for(&labels), 2);
    }

    #[test]
    fn render_includes_recorded_series() {
        let metrics = Metrics::new();
        metrics.record_quota_exceeded("alice");
        let rendered = metrics.render();
        assert!(rendered.contains("gateway_quota_exceeded_total{consumer=\"alice\"} 1"));
    }
}
