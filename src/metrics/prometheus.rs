//! Prometheus metrics for the hearth controller.
//!
//! Gauges and counters are plain atomics and work without a Registry;
//! registration is only needed for exposition.

use prometheus::{Gauge, IntCounter, IntGauge, Opts, Registry};

use crate::control::HeatingState;

/// Prometheus metrics for hearth.
#[derive(Clone)]
pub struct HearthMetrics {
    // === Gauges ===
    /// 0 = idle, 1 = automatic heating, 2 = manual heating
    pub heating_state: IntGauge,

    /// Heater threads alive
    pub active_workers: IntGauge,

    /// Last case/ambient sensor reading, °C
    pub case_temperature: Gauge,

    /// Last model-based ambient estimate, °C
    pub estimated_ambient: Gauge,

    /// Uncertainty of the last ambient estimate, °C
    pub estimate_uncertainty: Gauge,

    // === Counters ===
    /// State transitions applied
    pub transitions: IntCounter,

    /// Failed or timed-out sensor reads
    pub sensor_failures: IntCounter,

    /// Heaters restarted after crashing
    pub worker_respawns: IntCounter,

    /// Ticks that ended with missing heaters
    pub worker_spawn_failures: IntCounter,

    /// Automatic calibration runs started
    pub calibration_runs: IntCounter,
}

impl Default for HearthMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn sanitize_prefix(prefix: &str) -> String {
    // Valid chars: [a-zA-Z_:] first, [a-zA-Z0-9_:] after
    prefix
        .chars()
        .enumerate()
        .map(|(i, c)| {
            let ok = c.is_ascii_alphabetic() || c == '_' || c == ':' || (i > 0 && c.is_ascii_digit());
            if ok {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn int_gauge(prefix: &str, name: &str, help: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(format!("{}_{}", prefix, name), help))
        .expect("metric creation should not fail")
}

fn gauge(prefix: &str, name: &str, help: &str) -> Gauge {
    Gauge::with_opts(Opts::new(format!("{}_{}", prefix, name), help))
        .expect("metric creation should not fail")
}

fn counter(prefix: &str, name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(format!("{}_{}", prefix, name), help))
        .expect("metric creation should not fail")
}

impl HearthMetrics {
    /// Metrics with the default prefix "hearth".
    pub fn new() -> Self {
        Self::with_prefix("hearth")
    }

    /// Metrics named `{prefix}_heating_state`, `{prefix}_transitions`, etc.
    ///
    /// Characters not valid in a Prometheus name are replaced with underscores.
    pub fn with_prefix(prefix: &str) -> Self {
        let p = sanitize_prefix(prefix);
        Self {
            heating_state: int_gauge(&p, "heating_state", "Heating state (0 idle, 1 auto, 2 manual)"),
            active_workers: int_gauge(&p, "active_workers", "Heater threads alive"),
            case_temperature: gauge(&p, "case_temperature_celsius", "Case sensor temperature"),
            estimated_ambient: gauge(&p, "estimated_ambient_celsius", "Model-based ambient estimate"),
            estimate_uncertainty: gauge(
                &p,
                "estimate_uncertainty_celsius",
                "One-sigma uncertainty of the ambient estimate",
            ),
            transitions: counter(&p, "transitions", "Heating state transitions"),
            sensor_failures: counter(&p, "sensor_failures", "Failed sensor reads"),
            worker_respawns: counter(&p, "worker_respawns", "Heater threads respawned"),
            worker_spawn_failures: counter(
                &p,
                "worker_spawn_failures",
                "Ticks that left heater slots empty",
            ),
            calibration_runs: counter(&p, "calibration_runs", "Automatic calibration runs"),
        }
    }

    /// Register all metrics with a Registry for exposition.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate names).
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.heating_state.clone()))?;
        registry.register(Box::new(self.active_workers.clone()))?;
        registry.register(Box::new(self.case_temperature.clone()))?;
        registry.register(Box::new(self.estimated_ambient.clone()))?;
        registry.register(Box::new(self.estimate_uncertainty.clone()))?;
        registry.register(Box::new(self.transitions.clone()))?;
        registry.register(Box::new(self.sensor_failures.clone()))?;
        registry.register(Box::new(self.worker_respawns.clone()))?;
        registry.register(Box::new(self.worker_spawn_failures.clone()))?;
        registry.register(Box::new(self.calibration_runs.clone()))?;
        Ok(())
    }

    #[inline]
    pub fn set_state(&self, state: HeatingState) {
        let value = match state {
            HeatingState::Idle => 0,
            HeatingState::HeatingAuto => 1,
            HeatingState::HeatingManual => 2,
        };
        self.heating_state.set(value);
    }

    #[inline]
    pub fn set_active_workers(&self, count: usize) {
        self.active_workers.set(count as i64);
    }

    #[inline]
    pub fn record_transition(&self, to: HeatingState) {
        self.transitions.inc();
        self.set_state(to);
    }

    #[inline]
    pub fn record_case_temperature(&self, celsius: f64) {
        self.case_temperature.set(celsius);
    }

    #[inline]
    pub fn record_estimate(&self, ambient: f64, uncertainty: f64) {
        self.estimated_ambient.set(ambient);
        self.estimate_uncertainty.set(uncertainty);
    }

    #[inline]
    pub fn record_sensor_failure(&self) {
        self.sensor_failures.inc();
    }

    #[inline]
    pub fn record_respawns(&self, count: usize) {
        self.worker_respawns.inc_by(count as u64);
    }

    #[inline]
    pub fn record_spawn_failure(&self) {
        self.worker_spawn_failures.inc();
    }

    #[inline]
    pub fn record_calibration_run(&self) {
        self.calibration_runs.inc();
    }
}

impl std::fmt::Debug for HearthMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HearthMetrics")
            .field("heating_state", &self.heating_state.get())
            .field("active_workers", &self.active_workers.get())
            .field("transitions", &self.transitions.get())
            .field("sensor_failures", &self.sensor_failures.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = HearthMetrics::new();
        assert_eq!(metrics.heating_state.get(), 0);
        assert_eq!(metrics.transitions.get(), 0);
    }

    #[test]
    fn test_state_and_counters() {
        let metrics = HearthMetrics::new();

        metrics.record_transition(HeatingState::HeatingManual);
        assert_eq!(metrics.heating_state.get(), 2);
        assert_eq!(metrics.transitions.get(), 1);

        metrics.record_transition(HeatingState::Idle);
        assert_eq!(metrics.heating_state.get(), 0);
        assert_eq!(metrics.transitions.get(), 2);

        metrics.record_respawns(3);
        metrics.record_respawns(0);
        assert_eq!(metrics.worker_respawns.get(), 3);

        metrics.record_estimate(4.5, 0.3);
        assert!((metrics.estimated_ambient.get() - 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_registry_integration() {
        let metrics = HearthMetrics::with_prefix("shed-1");
        let registry = Registry::new();
        metrics
            .register(&registry)
            .expect("registration should succeed");

        metrics.record_sensor_failure();
        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "shed_1_sensor_failures"));
        assert!(!families
            .iter()
            .any(|f| f.get_name() == "hearth_sensor_failures"));

        // Second registration of the same names is rejected
        assert!(metrics.register(&registry).is_err());
    }

    #[test]
    fn test_prefix_sanitization() {
        assert_eq!(sanitize_prefix("hearth"), "hearth");
        assert_eq!(sanitize_prefix("1box"), "_box");
        assert_eq!(sanitize_prefix("my-app:x9"), "my_app:x9");
    }
}
