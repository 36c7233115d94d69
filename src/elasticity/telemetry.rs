//! Runtime telemetry feeding the elasticity engine.
//!
//! Each context carries a live [`ContextRuntimeInfo`] recorder updated as
//! events run; the evaluator never reads it directly. Instead the monitor
//! captures an immutable [`ContextTelemetry`] per context at one point in
//! time, so every rule evaluation compares metrics from the same epoch.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{ContextName, NodeAddr};

/// Accumulated latency marker statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerStats {
    /// Sum of all recorded intervals, microseconds.
    pub total_us: u64,
    /// Number of recorded intervals.
    pub count: u64,
}

impl MarkerStats {
    /// Mean interval in microseconds, 0.0 when nothing was recorded.
    #[must_use]
    pub fn avg_latency_us(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_us as f64 / self.count as f64
        }
    }
}

/// Immutable per-context metrics captured at one instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextTelemetry {
    /// The measured context.
    pub context: ContextName,
    /// Node hosting the context at capture time.
    pub addr: NodeAddr,
    /// Total event execution time attributed to the context, microseconds.
    pub exec_time_us: u64,
    /// Accesses received, keyed by originating context.
    pub from_access_counts: BTreeMap<ContextName, u64>,
    /// Client requests that entered the system at this context.
    pub client_requests: u64,
    /// Named latency markers.
    pub markers: BTreeMap<String, MarkerStats>,
}

impl ContextTelemetry {
    /// Total number of accesses received from all peers.
    #[must_use]
    pub fn total_from_access_count(&self) -> u64 {
        self.from_access_counts.values().sum()
    }

    /// Mean latency of `marker` in microseconds, 0.0 when absent.
    #[must_use]
    pub fn marker_avg_latency_us(&self, marker: &str) -> f64 {
        self.markers
            .get(marker)
            .map_or(0.0, MarkerStats::avg_latency_us)
    }
}

/// Per-node load metrics captured alongside the context snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerTelemetry {
    /// The measured node.
    pub addr: NodeAddr,
    /// CPU usage over the measurement period, percent in `[0, 100]`.
    pub cpu_usage: f64,
    /// Total CPU time available over the period, microseconds.
    pub total_cpu_time_us: f64,
    /// Client requests handled by the node over the period.
    pub client_requests: u64,
    /// Number of contexts hosted on the node.
    pub hosted_contexts: u64,
}

impl ServerTelemetry {
    /// Projected CPU usage after absorbing a context with the given
    /// execution time, percent.
    #[must_use]
    pub fn usage_after_adding(&self, exec_time_us: f64) -> f64 {
        if self.total_cpu_time_us == 0.0 {
            return 100.0;
        }
        100.0 * (self.cpu_usage * self.total_cpu_time_us * 0.01 + exec_time_us)
            / self.total_cpu_time_us
    }

    /// Projected CPU usage after shedding a context with the given
    /// execution time, percent. Clamped at 0: shedding a context whose
    /// execution time exceeds the measured busy time projects to an
    /// idle node, not a negative one.
    #[must_use]
    pub fn usage_after_removing(&self, exec_time_us: f64) -> f64 {
        if self.total_cpu_time_us == 0.0 {
            return 100.0;
        }
        let projected = 100.0 * (self.cpu_usage * self.total_cpu_time_us * 0.01 - exec_time_us)
            / self.total_cpu_time_us;
        projected.max(0.0)
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    exec_time_us: u64,
    from_access_counts: BTreeMap<ContextName, u64>,
    client_requests: u64,
    markers: BTreeMap<String, MarkerStats>,
    marker_starts: BTreeMap<String, u64>,
}

/// Live telemetry recorder owned by one context.
#[derive(Debug)]
pub struct ContextRuntimeInfo {
    context: ContextName,
    state: Mutex<RecorderState>,
}

impl ContextRuntimeInfo {
    /// Creates an empty recorder for `context`.
    #[must_use]
    pub fn new(context: ContextName) -> Self {
        Self {
            context,
            state: Mutex::new(RecorderState::default()),
        }
    }

    /// Adds event execution time.
    pub fn add_exec_time(&self, elapsed: Duration) {
        self.state.lock().exec_time_us += elapsed.as_micros() as u64;
    }

    /// Counts one access arriving from `from`.
    pub fn record_from_access(&self, from: ContextName) {
        *self.state.lock().from_access_counts.entry(from).or_default() += 1;
    }

    /// Counts one client request entering at this context.
    pub fn record_client_request(&self) {
        self.state.lock().client_requests += 1;
    }

    /// Opens a latency marker at `now_us`. A reopened marker restarts.
    pub fn mark_start(&self, marker: &str, now_us: u64) {
        self.state.lock().marker_starts.insert(marker.to_owned(), now_us);
    }

    /// Closes a latency marker at `now_us`; a close without a matching
    /// open is ignored.
    pub fn mark_end(&self, marker: &str, now_us: u64) {
        let mut state = self.state.lock();
        if let Some(start) = state.marker_starts.remove(marker) {
            let stats = state.markers.entry(marker.to_owned()).or_default();
            stats.total_us += now_us.saturating_sub(start);
            stats.count += 1;
        }
    }

    /// Captures an immutable snapshot, stamped with the hosting node.
    #[must_use]
    pub fn capture(&self, addr: NodeAddr) -> ContextTelemetry {
        let state = self.state.lock();
        ContextTelemetry {
            context: self.context.clone(),
            addr,
            exec_time_us: state.exec_time_us,
            from_access_counts: state.from_access_counts.clone(),
            client_requests: state.client_requests,
            markers: state.markers.clone(),
        }
    }

    /// Resets all counters at the start of a new measurement period.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = RecorderState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_accumulates_and_captures() {
        let info = ContextRuntimeInfo::new(ContextName::new("App.Room[1]"));
        info.add_exec_time(Duration::from_micros(150));
        info.record_from_access(ContextName::new("App.User[1]"));
        info.record_from_access(ContextName::new("App.User[1]"));
        info.record_from_access(ContextName::new("App.User[2]"));
        info.record_client_request();
        info.mark_start("req", 100);
        info.mark_end("req", 350);

        let snap = info.capture(NodeAddr::new("n1"));
        assert_eq!(snap.exec_time_us, 150);
        assert_eq!(snap.total_from_access_count(), 3);
        assert_eq!(snap.client_requests, 1);
        assert!((snap.marker_avg_latency_us("req") - 250.0).abs() < f64::EPSILON);
        assert_eq!(snap.marker_avg_latency_us("absent"), 0.0);

        info.reset();
        assert_eq!(info.capture(NodeAddr::new("n1")).total_from_access_count(), 0);
    }

    #[test]
    fn projected_usage_scales_with_cpu_time() {
        let server = ServerTelemetry {
            addr: NodeAddr::new("n2"),
            cpu_usage: 50.0,
            total_cpu_time_us: 1_000_000.0,
            client_requests: 0,
            hosted_contexts: 3,
        };
        // 50% of 1s is 500ms; adding 100ms of work projects to 60%.
        assert!((server.usage_after_adding(100_000.0) - 60.0).abs() < 1e-9);
        assert!((server.usage_after_removing(100_000.0) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn removal_projection_bottoms_out_at_idle() {
        // A hot context on a lightly measured server: 10% of 1s is
        // 100ms busy, but the context alone recorded 500ms.
        let server = ServerTelemetry {
            addr: NodeAddr::new("n2"),
            cpu_usage: 10.0,
            total_cpu_time_us: 1_000_000.0,
            client_requests: 0,
            hosted_contexts: 1,
        };
        assert_eq!(server.usage_after_removing(500_000.0), 0.0);
    }
}
