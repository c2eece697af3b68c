use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use hickory_proto::op::{Message, ResponseCode};

/// Per-endpoint exchange counters. One instance is created at startup and
/// injected into every upstream client; the core never reaches for ambient
/// state.
#[derive(Debug, Default)]
pub struct Metrics {
    endpoints: DashMap<String, EndpointStats>,
}

#[derive(Debug, Default)]
struct EndpointStats {
    requests: AtomicU64,
    latency_ns: AtomicU64,
    rcodes: DashMap<String, AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exchange(&self, endpoint: &str, rcode: ResponseCode, latency: Duration) {
        let stats = self.endpoints.entry(endpoint.to_string()).or_default();
        stats.requests.fetch_add(1, Ordering::Relaxed);
        stats
            .latency_ns
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
        stats
            .rcodes
            .entry(format!("{rcode:?}"))
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_count(&self, endpoint: &str) -> u64 {
        self.endpoints
            .get(endpoint)
            .map(|s| s.requests.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn rcode_count(&self, endpoint: &str, rcode: ResponseCode) -> u64 {
        self.endpoints
            .get(endpoint)
            .and_then(|s| {
                s.rcodes
                    .get(&format!("{rcode:?}"))
                    .map(|c| c.load(Ordering::Relaxed))
            })
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> String {
        let mut parts = Vec::new();
        for entry in self.endpoints.iter() {
            let requests = entry.requests.load(Ordering::Relaxed);
            let latency_ns = entry.latency_ns.load(Ordering::Relaxed);
            let avg_us = if requests > 0 {
                latency_ns / requests / 1000
            } else {
                0
            };
            parts.push(format!(
                "{} requests={} avg_latency_us={}",
                entry.key(),
                requests,
                avg_us
            ));
        }
        parts.join(", ")
    }
}

/// Tap capability invoked with the accepted answer of a dispatch cycle.
/// Absent by default; the dispatcher works with it as a no-op.
pub trait DnsTap: Send + Sync {
    fn tap(&self, endpoint: &str, query: &Message, response: &Message, start: SystemTime);
}

/// Tap that logs accepted answers through tracing.
#[derive(Debug, Default)]
pub struct LogTap;

impl DnsTap for LogTap {
    fn tap(&self, endpoint: &str, query: &Message, response: &Message, start: SystemTime) {
        let elapsed_ms = start
            .elapsed()
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        tracing::debug!(
            event = "dns_tap",
            upstream = %endpoint,
            query_id = query.id(),
            rcode = ?response.response_code(),
            elapsed_ms,
            "upstream answer accepted"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_exchange_counts_per_endpoint_and_rcode() {
        let metrics = Metrics::new();
        metrics.record_exchange("1.1.1.1:53", ResponseCode::NoError, Duration::from_millis(3));
        metrics.record_exchange("1.1.1.1:53", ResponseCode::ServFail, Duration::from_millis(5));
        metrics.record_exchange("9.9.9.9:53", ResponseCode::NoError, Duration::from_millis(1));

        assert_eq!(metrics.request_count("1.1.1.1:53"), 2);
        assert_eq!(metrics.request_count("9.9.9.9:53"), 1);
        assert_eq!(metrics.rcode_count("1.1.1.1:53", ResponseCode::NoError), 1);
        assert_eq!(metrics.rcode_count("1.1.1.1:53", ResponseCode::ServFail), 1);
        assert_eq!(metrics.rcode_count("8.8.8.8:53", ResponseCode::NoError), 0);
    }

    #[test]
    fn snapshot_reports_known_endpoints() {
        let metrics = Metrics::new();
        metrics.record_exchange("1.1.1.1:53", ResponseCode::NoError, Duration::from_micros(40));
        let snap = metrics.snapshot();
        assert!(snap.contains("1.1.1.1:53"));
        assert!(snap.contains("requests=1"));
    }
}
