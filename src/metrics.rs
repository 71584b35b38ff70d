/* src/metrics.rs */

use std::sync::atomic::{AtomicU64, Ordering};

/// Gateway-wide counters, incremented with relaxed atomics so the request
/// path never takes a lock for accounting. Snapshot values are emitted to
/// the tracing sink; an external collector scrapes the spans and events.
#[derive(Debug, Default)]
pub struct Metrics {
    pub requests: AtomicU64,
    pub rate_limited: AtomicU64,
    pub auth_rejections: AtomicU64,
    pub breaker_rejections: AtomicU64,
    pub breaker_transitions: AtomicU64,
    pub upstream_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_rejection(&self) {
        self.auth_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_rejection(&self) {
        self.breaker_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Breaker state changes are rare and operationally significant, so
    /// each one also emits a structured event.
    pub fn record_breaker_transition(&self, backend: &str, from: &str, to: &str) {
        self.breaker_transitions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(backend, from, to, "circuit breaker transition");
    }

    /// Emits the per-request outcome event consumed by the tracing sink.
    pub fn record_outcome(
        &self,
        route: &str,
        service: &str,
        backend: Option<&str>,
        status: u16,
        latency_ms: u64,
    ) {
        tracing::info!(
            route,
            service,
            backend = backend.unwrap_or("-"),
            status,
            latency_ms,
            "request dispatched"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        m.record_request();
        m.record_request();
        m.record_rate_limited();
        m.record_breaker_transition("http://127.0.0.1:1", "closed", "open");
        assert_eq!(m.requests.load(Ordering::Relaxed), 2);
        assert_eq!(m.rate_limited.load(Ordering::Relaxed), 1);
        assert_eq!(m.breaker_transitions.load(Ordering::Relaxed), 1);
    }
}
