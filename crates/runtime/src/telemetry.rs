//! Process-wide step telemetry.
//!
//! A single mutex-guarded store; hot-path updates are O(1) counter bumps and
//! one bounded latency sample. Snapshots are taken by the debug surface,
//! never by the step path itself.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const LATENCY_RESERVOIR: usize = 1000;

/// Aggregated telemetry view.
#[derive(Debug, Clone, Serialize, Deserialize, Default, utoipa::ToSchema)]
pub struct TelemetrySnapshot {
    pub total_step_requests: u64,
    pub successful_steps: u64,
    pub failed_steps: u64,
    pub avg_step_latency_ms: f64,
    pub p95_step_latency_ms: f64,
    pub fallback_rate: f64,
    pub ending_distribution: HashMap<String, u64>,
    pub llm_unavailable_errors: u64,
    pub llm_unavailable_ratio: f64,
}

#[derive(Default)]
struct TelemetryInner {
    success_latencies_ms: Vec<f64>,
    total_step_requests: u64,
    successful_steps: u64,
    failed_steps: u64,
    llm_unavailable_errors: u64,
    fallback_steps: u64,
    ending_distribution: HashMap<String, u64>,
}

/// Step telemetry store.
#[derive(Default)]
pub struct TelemetryStore {
    inner: Mutex<TelemetryInner>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        *self.inner.lock() = TelemetryInner::default();
    }

    /// Record a committed step. Replays must not be recorded.
    pub fn record_step_success(
        &self,
        latency_ms: f64,
        fallback_used: bool,
        ending_id: Option<&str>,
    ) {
        let mut inner = self.inner.lock();
        inner.total_step_requests += 1;
        inner.successful_steps += 1;
        inner.success_latencies_ms.push(latency_ms);
        if inner.success_latencies_ms.len() > LATENCY_RESERVOIR {
            let excess = inner.success_latencies_ms.len() - LATENCY_RESERVOIR;
            inner.success_latencies_ms.drain(..excess);
        }
        if fallback_used {
            inner.fallback_steps += 1;
        }
        if let Some(ending_id) = ending_id {
            *inner
                .ending_distribution
                .entry(ending_id.to_string())
                .or_insert(0) += 1;
        }
    }

    /// Record a failed step request by error code.
    pub fn record_step_failure(&self, error_code: &str) {
        let mut inner = self.inner.lock();
        inner.total_step_requests += 1;
        inner.failed_steps += 1;
        if error_code == "LLM_UNAVAILABLE" {
            inner.llm_unavailable_errors += 1;
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let inner = self.inner.lock();
        let successful = inner.successful_steps;
        let total = inner.total_step_requests;
        let fallback_rate = if successful == 0 {
            0.0
        } else {
            inner.fallback_steps as f64 / successful as f64
        };
        let llm_ratio = if total == 0 {
            0.0
        } else {
            inner.llm_unavailable_errors as f64 / total as f64
        };

        let avg = if inner.success_latencies_ms.is_empty() {
            0.0
        } else {
            inner.success_latencies_ms.iter().sum::<f64>()
                / inner.success_latencies_ms.len() as f64
        };
        let p95 = if inner.success_latencies_ms.is_empty() {
            0.0
        } else {
            let mut ordered = inner.success_latencies_ms.clone();
            ordered.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let idx = ((0.95 * (ordered.len() - 1) as f64).round() as usize)
                .min(ordered.len() - 1);
            ordered[idx]
        };

        TelemetrySnapshot {
            total_step_requests: total,
            successful_steps: successful,
            failed_steps: inner.failed_steps,
            avg_step_latency_ms: (avg * 1000.0).round() / 1000.0,
            p95_step_latency_ms: (p95 * 1000.0).round() / 1000.0,
            fallback_rate: (fallback_rate * 10_000.0).round() / 10_000.0,
            ending_distribution: inner.ending_distribution.clone(),
            llm_unavailable_errors: inner.llm_unavailable_errors,
            llm_unavailable_ratio: (llm_ratio * 10_000.0).round() / 10_000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_failure_counters() {
        let store = TelemetryStore::new();
        store.record_step_success(10.0, false, None);
        store.record_step_success(20.0, true, Some("ending_forced_fail"));
        store.record_step_failure("LLM_UNAVAILABLE");
        store.record_step_failure("SESSION_STEP_CONFLICT");

        let snapshot = store.snapshot();
        assert_eq!(snapshot.total_step_requests, 4);
        assert_eq!(snapshot.successful_steps, 2);
        assert_eq!(snapshot.failed_steps, 2);
        assert_eq!(snapshot.fallback_rate, 0.5);
        assert_eq!(snapshot.llm_unavailable_errors, 1);
        assert_eq!(snapshot.llm_unavailable_ratio, 0.25);
        assert_eq!(snapshot.ending_distribution["ending_forced_fail"], 1);
        assert_eq!(snapshot.avg_step_latency_ms, 15.0);
    }

    #[test]
    fn latency_reservoir_is_bounded() {
        let store = TelemetryStore::new();
        for i in 0..1200 {
            store.record_step_success(i as f64, false, None);
        }
        let snapshot = store.snapshot();
        assert_eq!(snapshot.successful_steps, 1200);
        // Oldest samples were dropped; the average reflects the last 1000.
        assert!(snapshot.avg_step_latency_ms >= 199.0);
    }

    #[test]
    fn reset_clears_everything() {
        let store = TelemetryStore::new();
        store.record_step_success(5.0, true, Some("e"));
        store.reset();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.total_step_requests, 0);
        assert!(snapshot.ending_distribution.is_empty());
    }

    #[test]
    fn p95_uses_nearest_rank() {
        let store = TelemetryStore::new();
        for i in 1..=100 {
            store.record_step_success(i as f64, false, None);
        }
        let snapshot = store.snapshot();
        assert_eq!(snapshot.p95_step_latency_ms, 95.0);
    }
}
