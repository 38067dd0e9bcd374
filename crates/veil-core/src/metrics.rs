//! Lightweight, lock-minimal runtime counters.
//!
//! Counters are atomics so hot paths (request handling, token replacement)
//! incur no mutex contention. Latency statistics use one mutex per dimension
//! and are updated at most once per request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// All runtime counters for a running proxy instance.
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_anonymized: AtomicU64,
    pub requests_passthrough: AtomicU64,
    pub requests_auth: AtomicU64,

    pub errors_upstream: AtomicU64,
    pub errors_anonymize: AtomicU64,

    pub tokens_replaced: AtomicU64,
    pub tokens_deanonymized: AtomicU64,

    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_fallbacks: AtomicU64,

    pub sidecar_dispatches: AtomicU64,
    pub sidecar_errors: AtomicU64,

    anon_stats: Mutex<LatencyStats>,
    upstream_stats: Mutex<LatencyStats>,

    started: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            requests_anonymized: AtomicU64::new(0),
            requests_passthrough: AtomicU64::new(0),
            requests_auth: AtomicU64::new(0),
            errors_upstream: AtomicU64::new(0),
            errors_anonymize: AtomicU64::new(0),
            tokens_replaced: AtomicU64::new(0),
            tokens_deanonymized: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_fallbacks: AtomicU64::new(0),
            sidecar_dispatches: AtomicU64::new(0),
            sidecar_errors: AtomicU64::new(0),
            anon_stats: Mutex::new(LatencyStats::default()),
            upstream_stats: Mutex::new(LatencyStats::default()),
            started: Instant::now(),
        }
    }

    /// Records the duration of one anonymization pass.
    pub fn record_anon_latency(&self, d: Duration) {
        self.anon_stats.lock().record(d.as_secs_f64() * 1000.0);
    }

    /// Records the round-trip time to the upstream API.
    pub fn record_upstream_latency(&self, d: Duration) {
        self.upstream_stats.lock().record(d.as_secs_f64() * 1000.0);
    }

    /// Returns a point-in-time copy of all metrics, safe for JSON encoding.
    pub fn snapshot(&self) -> Snapshot {
        let anon = self.anon_stats.lock().snapshot();
        let upstream = self.upstream_stats.lock().snapshot();

        Snapshot {
            requests: RequestCounters {
                total: self.requests_total.load(Ordering::Relaxed),
                anonymized: self.requests_anonymized.load(Ordering::Relaxed),
                passthrough: self.requests_passthrough.load(Ordering::Relaxed),
                auth: self.requests_auth.load(Ordering::Relaxed),
            },
            errors: ErrorCounters {
                upstream: self.errors_upstream.load(Ordering::Relaxed),
                anonymize: self.errors_anonymize.load(Ordering::Relaxed),
            },
            pii_tokens: TokenCounters {
                replaced: self.tokens_replaced.load(Ordering::Relaxed),
                deanonymized: self.tokens_deanonymized.load(Ordering::Relaxed),
            },
            cache: CacheCounters {
                hits: self.cache_hits.load(Ordering::Relaxed),
                misses: self.cache_misses.load(Ordering::Relaxed),
                fallbacks: self.cache_fallbacks.load(Ordering::Relaxed),
            },
            sidecar: SidecarCounters {
                dispatches: self.sidecar_dispatches.load(Ordering::Relaxed),
                errors: self.sidecar_errors.load(Ordering::Relaxed),
            },
            latency: LatencyGroup {
                anonymization_ms: anon,
                upstream_ms: upstream,
            },
            uptime_secs: self.started.elapsed().as_secs_f64(),
        }
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Point-in-time view of all metrics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub requests: RequestCounters,
    pub errors: ErrorCounters,
    pub pii_tokens: TokenCounters,
    pub cache: CacheCounters,
    pub sidecar: SidecarCounters,
    pub latency: LatencyGroup,
    pub uptime_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestCounters {
    pub total: u64,
    pub anonymized: u64,
    pub passthrough: u64,
    pub auth: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorCounters {
    pub upstream: u64,
    pub anonymize: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenCounters {
    pub replaced: u64,
    pub deanonymized: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub fallbacks: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SidecarCounters {
    pub dispatches: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyGroup {
    pub anonymization_ms: LatencySummary,
    pub upstream_ms: LatencySummary,
}

/// Min/mean/max summary for one latency dimension.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub count: u64,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub max_ms: f64,
}

#[derive(Default)]
struct LatencyStats {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl LatencyStats {
    fn record(&mut self, ms: f64) {
        self.count += 1;
        self.sum += ms;
        if self.count == 1 || ms < self.min {
            self.min = ms;
        }
        if ms > self.max {
            self.max = ms;
        }
    }

    fn snapshot(&self) -> LatencySummary {
        if self.count == 0 {
            return LatencySummary::default();
        }
        let round2 = |v: f64| (v * 100.0).round() / 100.0;
        LatencySummary {
            count: self.count,
            min_ms: round2(self.min),
            mean_ms: round2(self.sum / self.count as f64),
            max_ms: round2(self.max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = Metrics::new();
        let snap = m.snapshot();
        assert_eq!(snap.requests.total, 0);
        assert_eq!(snap.pii_tokens.replaced, 0);
        assert_eq!(snap.latency.anonymization_ms.count, 0);
    }

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        Metrics::incr(&m.requests_total);
        Metrics::incr(&m.requests_total);
        Metrics::incr(&m.requests_anonymized);
        Metrics::add(&m.tokens_replaced, 5);

        let snap = m.snapshot();
        assert_eq!(snap.requests.total, 2);
        assert_eq!(snap.requests.anonymized, 1);
        assert_eq!(snap.pii_tokens.replaced, 5);
    }

    #[test]
    fn latency_min_mean_max() {
        let m = Metrics::new();
        m.record_anon_latency(Duration::from_millis(10));
        m.record_anon_latency(Duration::from_millis(20));
        m.record_anon_latency(Duration::from_millis(30));

        let snap = m.snapshot().latency.anonymization_ms;
        assert_eq!(snap.count, 3);
        assert!((snap.min_ms - 10.0).abs() < 0.5);
        assert!((snap.mean_ms - 20.0).abs() < 0.5);
        assert!((snap.max_ms - 30.0).abs() < 0.5);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let m = Metrics::new();
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert!(json.get("piiTokens").is_some());
        assert!(json.get("uptimeSecs").is_some());
        assert!(json["latency"].get("anonymizationMs").is_some());
    }
}
