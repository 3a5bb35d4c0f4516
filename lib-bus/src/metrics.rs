//! Rolling operation metrics.
//!
//! Per operation type: a bounded latency window (min/max/avg and p90/p95/p99)
//! and a sliding-window error rate. `detect_issues` flags operations whose
//! p95 latency or error rate exceeds configured thresholds. Also carries the
//! drop counters the signal router uses under back-pressure.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const LATENCY_WINDOW: usize = 128;
const ERROR_WINDOW: Duration = Duration::from_secs(300);

/// Snapshot of one operation's latency distribution.
#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    pub samples: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// One flagged operation from [`MetricsCollector::detect_issues`].
#[derive(Debug, Clone)]
pub struct MetricIssue {
    pub operation: String,
    pub description: String,
}

/// Thresholds for issue detection.
#[derive(Debug, Clone)]
pub struct IssueThresholds {
    pub p95_ms: f64,
    pub error_rate: f64,
    pub min_samples: usize,
}

impl Default for IssueThresholds {
    fn default() -> Self {
        Self {
            p95_ms: 5_000.0,
            error_rate: 0.25,
            min_samples: 5,
        }
    }
}

#[derive(Default)]
struct OperationWindow {
    latencies_ms: VecDeque<f64>,
    events: VecDeque<(Instant, bool)>,
}

/// Collector shared across the engine; cheap to clone via `Arc`.
#[derive(Default)]
pub struct MetricsCollector {
    windows: Mutex<HashMap<String, OperationWindow>>,
    counters: Mutex<HashMap<String, u64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one operation sample.
    pub fn record(&self, operation: &str, latency: Duration, success: bool) {
        let mut windows = self.windows.lock();
        let window = windows.entry(operation.to_string()).or_default();
        window.latencies_ms.push_back(latency.as_secs_f64() * 1000.0);
        if window.latencies_ms.len() > LATENCY_WINDOW {
            window.latencies_ms.pop_front();
        }
        let now = Instant::now();
        window.events.push_back((now, success));
        while let Some((ts, _)) = window.events.front() {
            if now.duration_since(*ts) > ERROR_WINDOW {
                window.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bump a named counter (router drop accounting, recovery stages, …).
    pub fn increment_counter(&self, name: &str) {
        *self.counters.lock().entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn statistics(&self, operation: &str) -> Option<LatencyStats> {
        let windows = self.windows.lock();
        let window = windows.get(operation)?;
        if window.latencies_ms.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = window.latencies_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let samples = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let percentile = |p: f64| -> f64 {
            let idx = ((samples as f64 * p).ceil() as usize).clamp(1, samples) - 1;
            sorted[idx]
        };
        Some(LatencyStats {
            samples,
            min_ms: sorted[0],
            max_ms: sorted[samples - 1],
            avg_ms: sum / samples as f64,
            p90_ms: percentile(0.90),
            p95_ms: percentile(0.95),
            p99_ms: percentile(0.99),
        })
    }

    /// (error_rate, total, failures) over the sliding window.
    pub fn error_rate(&self, operation: &str) -> (f64, usize, usize) {
        let windows = self.windows.lock();
        let Some(window) = windows.get(operation) else {
            return (0.0, 0, 0);
        };
        let total = window.events.len();
        let failures = window.events.iter().filter(|(_, ok)| !ok).count();
        let rate = if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64
        };
        (rate, total, failures)
    }

    pub fn operations(&self) -> Vec<String> {
        self.windows.lock().keys().cloned().collect()
    }

    /// Flag operations breaching the thresholds.
    pub fn detect_issues(&self, thresholds: &IssueThresholds) -> Vec<MetricIssue> {
        let mut issues = Vec::new();
        for operation in self.operations() {
            if let Some(stats) = self.statistics(&operation) {
                if stats.samples >= thresholds.min_samples && stats.p95_ms > thresholds.p95_ms {
                    issues.push(MetricIssue {
                        operation: operation.clone(),
                        description: format!(
                            "p95 latency {:.0}ms exceeds {:.0}ms",
                            stats.p95_ms, thresholds.p95_ms
                        ),
                    });
                }
            }
            let (rate, total, failures) = self.error_rate(&operation);
            if total >= thresholds.min_samples && rate > thresholds.error_rate {
                issues.push(MetricIssue {
                    operation,
                    description: format!(
                        "error rate {:.0}% ({failures}/{total}) exceeds {:.0}%",
                        rate * 100.0,
                        thresholds.error_rate * 100.0
                    ),
                });
            }
        }
        issues
    }
}
