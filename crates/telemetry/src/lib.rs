/*!
# Telemetry

Custom metrics and observability for the Relay Firmware.
Counters and gauges the execution engine emits through; log/metric
shipping lives outside this workspace.
*/

use std::collections::HashMap;
use std::sync::Mutex;

/// Shared counter/gauge registry. Cheap to hand around behind an `Arc`;
/// all mutation goes through an internal lock so engines can record
/// from any task.
pub struct TelemetrySystem {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
}

impl TelemetrySystem {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
        }
    }

    pub fn incr(&self, name: &str) {
        self.incr_by(name, 1);
    }

    pub fn incr_by(&self, name: &str, value: u64) {
        let mut counters = self.counters.lock().unwrap();
        *counters.entry(name.to_string()).or_insert(0) += value;
    }

    pub fn record_gauge(&self, name: &str, value: f64) {
        let mut gauges = self.gauges.lock().unwrap();
        gauges.insert(name.to_string(), value);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters.lock().unwrap().clone()
    }

    pub fn health_check(&self) -> serde_json::Value {
        let counters = self.counters.lock().unwrap();
        let gauges = self.gauges.lock().unwrap();
        serde_json::json!({
            "status": "healthy",
            "counter_count": counters.len(),
            "gauge_count": gauges.len(),
        })
    }
}

impl Default for TelemetrySystem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let telemetry = TelemetrySystem::new();
        telemetry.incr("executions_total");
        telemetry.incr_by("executions_total", 2);
        assert_eq!(telemetry.counter("executions_total"), 3);
        assert_eq!(telemetry.counter("missing"), 0);
    }

    #[test]
    fn health_reports_sizes() {
        let telemetry = TelemetrySystem::new();
        telemetry.incr("a");
        telemetry.record_gauge("b", 1.5);
        let health = telemetry.health_check();
        assert_eq!(health["counter_count"], 1);
        assert_eq!(health["gauge_count"], 1);
    }
}
