use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::domain::Decision;

/// Histogram bucket upper bounds in milliseconds, covering 1ms..1s.
const LATENCY_BOUNDS_MS: [u64; 7] = [1, 5, 10, 50, 100, 500, 1000];

/// Fixed-bucket latency histogram backed by atomics.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    // One counter per bound plus the overflow bucket.
    buckets: [AtomicU64; 8],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl LatencyHistogram {
    pub fn record(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let idx = LATENCY_BOUNDS_MS
            .iter()
            .position(|&bound| ms < bound)
            .unwrap_or(LATENCY_BOUNDS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean observation in microseconds.
    pub fn mean_us(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum_us.load(Ordering::Relaxed) as f64 / count as f64
        }
    }

    fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.sum_us.store(0, Ordering::Relaxed);
    }

    fn write_prometheus(&self, out: &mut String, name: &str) {
        let _ = writeln!(out, "# TYPE {name}_bucket counter");
        let mut cumulative = 0u64;
        for (idx, bound) in LATENCY_BOUNDS_MS.iter().enumerate() {
            cumulative += self.buckets[idx].load(Ordering::Relaxed);
            let le = *bound as f64 / 1000.0;
            let _ = writeln!(out, "{name}_bucket{{le=\"{le}\"}} {cumulative}");
        }
        cumulative += self.buckets[LATENCY_BOUNDS_MS.len()].load(Ordering::Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
        let _ = writeln!(out, "{name}_count {}", self.count());
    }
}

/// Process-wide metrics for the decision path.
///
/// All counters are lock-free; the error map takes a short mutex off the
/// hot path. Counters are monotonic between [`reset`](Self::reset) calls.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Total decision requests received, including rejected ones
    pub requests_total: AtomicU64,

    /// Decisions by outcome
    pub decisions_approve: AtomicU64,
    pub decisions_review: AtomicU64,
    pub decisions_decline: AtomicU64,

    /// End-to-end decision latency
    pub decision_latency: LatencyHistogram,

    /// Rule engine
    pub rules_evaluated_total: AtomicU64,
    pub rules_triggered_total: AtomicU64,
    pub rule_evaluation_latency: LatencyHistogram,
    pub evaluations_truncated_total: AtomicU64,

    /// Pattern matcher
    pub pattern_scans_total: AtomicU64,
    pub pattern_blacklist_matches_total: AtomicU64,
    pub pattern_whitelist_matches_total: AtomicU64,
    pub pattern_match_latency: LatencyHistogram,

    /// Reload coordinator
    pub reloads_total: AtomicU64,
    pub reload_errors_total: AtomicU64,

    /// Errors keyed by (component, kind)
    errors: Mutex<AHashMap<(&'static str, &'static str), u64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        MetricsRegistry::default()
    }

    /// Record a decision outcome.
    pub fn record_decision(&self, decision: Decision) {
        match decision {
            Decision::Approve => self.decisions_approve.fetch_add(1, Ordering::Relaxed),
            Decision::Review => self.decisions_review.fetch_add(1, Ordering::Relaxed),
            Decision::Decline => self.decisions_decline.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record rule-engine throughput for one evaluation pass.
    pub fn record_rule_evaluation(&self, evaluated: u64, triggered: u64, elapsed: Duration) {
        self.rules_evaluated_total
            .fetch_add(evaluated, Ordering::Relaxed);
        self.rules_triggered_total
            .fetch_add(triggered, Ordering::Relaxed);
        self.rule_evaluation_latency.record(elapsed);
    }

    /// Record a pattern scan over one request.
    pub fn record_pattern_scan(&self, blacklist_hits: u64, whitelist_hits: u64, elapsed: Duration) {
        self.pattern_scans_total.fetch_add(1, Ordering::Relaxed);
        self.pattern_blacklist_matches_total
            .fetch_add(blacklist_hits, Ordering::Relaxed);
        self.pattern_whitelist_matches_total
            .fetch_add(whitelist_hits, Ordering::Relaxed);
        self.pattern_match_latency.record(elapsed);
    }

    /// Record a reload attempt for any watched artifact.
    pub fn record_reload(&self, success: bool) {
        self.reloads_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.reload_errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Increment the error counter for a component/kind pair.
    pub fn record_error(&self, component: &'static str, kind: &'static str) {
        let mut errors = self.errors.lock();
        *errors.entry((component, kind)).or_insert(0) += 1;
    }

    /// Error count for a component/kind pair.
    pub fn error_count(&self, component: &'static str, kind: &'static str) -> u64 {
        self.errors
            .lock()
            .get(&(component, kind))
            .copied()
            .unwrap_or(0)
    }

    /// Reset all counters. Test and operational tooling only.
    pub fn reset(&self) {
        self.requests_total.store(0, Ordering::Relaxed);
        self.decisions_approve.store(0, Ordering::Relaxed);
        self.decisions_review.store(0, Ordering::Relaxed);
        self.decisions_decline.store(0, Ordering::Relaxed);
        self.rules_evaluated_total.store(0, Ordering::Relaxed);
        self.rules_triggered_total.store(0, Ordering::Relaxed);
        self.evaluations_truncated_total.store(0, Ordering::Relaxed);
        self.pattern_scans_total.store(0, Ordering::Relaxed);
        self.pattern_blacklist_matches_total.store(0, Ordering::Relaxed);
        self.pattern_whitelist_matches_total.store(0, Ordering::Relaxed);
        self.reloads_total.store(0, Ordering::Relaxed);
        self.reload_errors_total.store(0, Ordering::Relaxed);
        self.decision_latency.reset();
        self.rule_evaluation_latency.reset();
        self.pattern_match_latency.reset();
        self.errors.lock().clear();
    }

    /// Export in Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::with_capacity(2048);

        let _ = writeln!(
            out,
            "# HELP riskgate_requests_total Decision requests received\n\
             # TYPE riskgate_requests_total counter\n\
             riskgate_requests_total {}",
            self.requests_total.load(Ordering::Relaxed)
        );

        let _ = writeln!(
            out,
            "# HELP riskgate_decisions_total Decisions by outcome\n\
             # TYPE riskgate_decisions_total counter\n\
             riskgate_decisions_total{{outcome=\"approve\"}} {}\n\
             riskgate_decisions_total{{outcome=\"review\"}} {}\n\
             riskgate_decisions_total{{outcome=\"decline\"}} {}",
            self.decisions_approve.load(Ordering::Relaxed),
            self.decisions_review.load(Ordering::Relaxed),
            self.decisions_decline.load(Ordering::Relaxed),
        );

        self.decision_latency
            .write_prometheus(&mut out, "riskgate_decision_latency_seconds");

        let _ = writeln!(
            out,
            "# TYPE riskgate_rules_evaluated_total counter\n\
             riskgate_rules_evaluated_total {}\n\
             # TYPE riskgate_rules_triggered_total counter\n\
             riskgate_rules_triggered_total {}\n\
             # TYPE riskgate_evaluations_truncated_total counter\n\
             riskgate_evaluations_truncated_total {}",
            self.rules_evaluated_total.load(Ordering::Relaxed),
            self.rules_triggered_total.load(Ordering::Relaxed),
            self.evaluations_truncated_total.load(Ordering::Relaxed),
        );

        self.rule_evaluation_latency
            .write_prometheus(&mut out, "riskgate_rule_evaluation_seconds");

        let _ = writeln!(
            out,
            "# TYPE riskgate_pattern_scans_total counter\n\
             riskgate_pattern_scans_total {}\n\
             # TYPE riskgate_pattern_matches_total counter\n\
             riskgate_pattern_matches_total{{category=\"blacklist\"}} {}\n\
             riskgate_pattern_matches_total{{category=\"whitelist\"}} {}",
            self.pattern_scans_total.load(Ordering::Relaxed),
            self.pattern_blacklist_matches_total.load(Ordering::Relaxed),
            self.pattern_whitelist_matches_total.load(Ordering::Relaxed),
        );

        self.pattern_match_latency
            .write_prometheus(&mut out, "riskgate_pattern_match_seconds");

        let _ = writeln!(
            out,
            "# TYPE riskgate_reloads_total counter\n\
             riskgate_reloads_total {}\n\
             # TYPE riskgate_reload_errors_total counter\n\
             riskgate_reload_errors_total {}",
            self.reloads_total.load(Ordering::Relaxed),
            self.reload_errors_total.load(Ordering::Relaxed),
        );

        let errors = self.errors.lock();
        if !errors.is_empty() {
            let _ = writeln!(out, "# TYPE riskgate_errors_total counter");
            let mut entries: Vec<_> = errors.iter().collect();
            entries.sort();
            for ((component, kind), count) in entries {
                let _ = writeln!(
                    out,
                    "riskgate_errors_total{{component=\"{component}\",kind=\"{kind}\"}} {count}"
                );
            }
        }

        out
    }
}

/// RAII guard recording elapsed time into a histogram on drop.
pub struct TimingGuard<'a> {
    histogram: &'a LatencyHistogram,
    start: Instant,
}

impl<'a> TimingGuard<'a> {
    pub fn new(histogram: &'a LatencyHistogram) -> Self {
        TimingGuard {
            histogram,
            start: Instant::now(),
        }
    }
}

impl Drop for TimingGuard<'_> {
    fn drop(&mut self) {
        self.histogram.record(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_decision() {
        let metrics = MetricsRegistry::new();

        metrics.record_decision(Decision::Approve);
        metrics.record_decision(Decision::Approve);
        metrics.record_decision(Decision::Decline);

        assert_eq!(metrics.decisions_approve.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.decisions_decline.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.decisions_review.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_histogram_buckets() {
        let hist = LatencyHistogram::default();

        hist.record(Duration::from_micros(200));
        hist.record(Duration::from_millis(3));
        hist.record(Duration::from_millis(2000));

        assert_eq!(hist.count(), 3);
        assert_eq!(hist.buckets[0].load(Ordering::Relaxed), 1);
        assert_eq!(hist.buckets[1].load(Ordering::Relaxed), 1);
        assert_eq!(hist.buckets[7].load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_error_counter_keyed() {
        let metrics = MetricsRegistry::new();

        metrics.record_error("orchestrator", "invalid_request");
        metrics.record_error("orchestrator", "invalid_request");
        metrics.record_error("rule_engine", "compile");

        assert_eq!(metrics.error_count("orchestrator", "invalid_request"), 2);
        assert_eq!(metrics.error_count("rule_engine", "compile"), 1);
        assert_eq!(metrics.error_count("rule_engine", "evaluation"), 0);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = MetricsRegistry::new();
        metrics.requests_total.fetch_add(1, Ordering::Relaxed);
        metrics.record_decision(Decision::Approve);
        metrics.record_error("matcher", "match");

        let output = metrics.to_prometheus();

        assert!(output.contains("riskgate_requests_total 1"));
        assert!(output.contains("riskgate_decisions_total{outcome=\"approve\"} 1"));
        assert!(output.contains("riskgate_errors_total{component=\"matcher\",kind=\"match\"} 1"));
    }

    #[test]
    fn test_timing_guard() {
        let hist = LatencyHistogram::default();
        {
            let _guard = TimingGuard::new(&hist);
        }
        assert_eq!(hist.count(), 1);
    }
}
