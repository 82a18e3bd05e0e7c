//! Configuration types for the hearth controller and estimator.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HearthError, Result};
use crate::estimator::CalibrationPlan;

/// Smallest sample count any calibration may use.
pub const MIN_CALIBRATION_SAMPLES: usize = 4;

/// Longest accepted control tick (one day).
pub const MAX_CHECK_INTERVAL_S: f64 = 86_400.0;

/// Configuration for the hearth runtime.
///
/// This struct can be deserialized from TOML, YAML, JSON, or environment variables
/// using figment. It is validated once by [`HearthConfig::validate`] and never
/// mutated afterwards; the runtime shares it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HearthConfig {
    /// Thread and metric name prefix (default: "hearth")
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Heating starts below this case temperature (default: 0 °C)
    #[serde(default = "default_min_threshold")]
    pub min_threshold_c: f64,

    /// Automatic heating stops at or above this case temperature (default: 5 °C)
    #[serde(default = "default_target_threshold")]
    pub target_threshold_c: f64,

    /// Seconds between control ticks (default: 10)
    #[serde(default = "default_check_interval")]
    pub check_interval_s: f64,

    /// Fraction of each duty period a heater spends computing (default: 0.7)
    #[serde(default = "default_duty_cycle")]
    pub duty_cycle_fraction: f64,

    /// Length of one busy+idle duty period in milliseconds (default: 1000)
    #[serde(default = "default_duty_period_ms")]
    pub duty_period_ms: u64,

    /// CPU set string (e.g., "0-3") for heater workers, or None for all CPUs
    #[serde(default)]
    pub cpuset: Option<String>,

    /// Pin each heater thread to its CPU (default: true)
    #[serde(default = "default_true")]
    pub pin_workers: bool,

    /// Respawn attempts allowed per tick for crashed heaters (default: 3)
    #[serde(default = "default_respawn_limit")]
    pub worker_respawn_limit: u32,

    /// Upper bound on one sensor read in milliseconds (default: 2000)
    #[serde(default = "default_sensor_timeout_ms")]
    pub sensor_timeout_ms: u64,

    /// Consecutive failed reads after which automatic heating is forced off (default: 30)
    #[serde(default = "default_max_sensor_failures")]
    pub max_sensor_failures: u32,

    /// Override flag file written by the dashboard
    #[serde(default = "default_override_path")]
    pub override_path: PathBuf,

    /// Root of the thermal zone tree (default: /sys/class/thermal)
    #[serde(default = "default_thermal_root")]
    pub thermal_root: PathBuf,

    /// Root of the powercap tree (default: /sys/class/powercap)
    #[serde(default = "default_powercap_root")]
    pub powercap_root: PathBuf,

    /// Thermal zone used as the case/ambient channel; discovered when None
    #[serde(default)]
    pub ambient_zone: Option<usize>,

    /// Thermal zone used as the CPU channel; discovered when None
    #[serde(default)]
    pub cpu_zone: Option<usize>,

    /// Board power at 0% CPU for the utilisation estimate (default: 7 W)
    #[serde(default = "default_idle_power")]
    pub idle_power_w: f64,

    /// Board power at 100% CPU for the utilisation estimate (default: 22 W)
    #[serde(default = "default_max_power")]
    pub max_power_w: f64,

    /// Power assumed when no measurement method works (default: 12 W)
    #[serde(default = "default_fallback_power")]
    pub fallback_power_w: f64,

    /// Minimum samples for a valid calibration (default: 4, never below 4)
    #[serde(default = "default_min_samples")]
    pub calibration_min_samples: usize,

    /// Uptime below which cold-start correction may run (default: 60 s)
    #[serde(default = "default_cold_start_uptime")]
    pub cold_start_uptime_s: f64,

    /// Power below which cold-start correction may run (default: 5 W)
    #[serde(default = "default_cold_start_power")]
    pub cold_start_power_w: f64,

    /// Smoothing factor for the cold-start bias nudge (default: 0.1)
    #[serde(default = "default_cold_start_alpha")]
    pub cold_start_smoothing: f64,

    /// Largest bias change one cold-start nudge may apply (default: 1 °C)
    #[serde(default = "default_cold_start_step")]
    pub cold_start_max_step_c: f64,

    /// Directory holding the per-host calibration record
    #[serde(default = "default_calibration_dir")]
    pub calibration_dir: PathBuf,

    /// Refresh the ambient estimate on each control tick (default: true)
    #[serde(default = "default_true")]
    pub ambient_diagnostics: bool,

    /// Automatic calibration ladder.
    #[serde(default)]
    pub calibration: CalibrationPlan,
}

fn default_prefix() -> String {
    "hearth".to_string()
}

fn default_min_threshold() -> f64 {
    0.0
}

fn default_target_threshold() -> f64 {
    5.0
}

fn default_check_interval() -> f64 {
    10.0
}

fn default_duty_cycle() -> f64 {
    0.7
}

fn default_duty_period_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_respawn_limit() -> u32 {
    3
}

fn default_sensor_timeout_ms() -> u64 {
    2000
}

fn default_max_sensor_failures() -> u32 {
    30
}

fn default_override_path() -> PathBuf {
    PathBuf::from("/tmp/thermal_override")
}

fn default_thermal_root() -> PathBuf {
    PathBuf::from("/sys/class/thermal")
}

fn default_powercap_root() -> PathBuf {
    PathBuf::from("/sys/class/powercap")
}

fn default_idle_power() -> f64 {
    7.0
}

fn default_max_power() -> f64 {
    22.0
}

fn default_fallback_power() -> f64 {
    12.0
}

fn default_min_samples() -> usize {
    MIN_CALIBRATION_SAMPLES
}

fn default_cold_start_uptime() -> f64 {
    60.0
}

fn default_cold_start_power() -> f64 {
    5.0
}

fn default_cold_start_alpha() -> f64 {
    0.1
}

fn default_cold_start_step() -> f64 {
    1.0
}

fn default_calibration_dir() -> PathBuf {
    PathBuf::from("/var/lib/hearth")
}

impl Default for HearthConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            min_threshold_c: default_min_threshold(),
            target_threshold_c: default_target_threshold(),
            check_interval_s: default_check_interval(),
            duty_cycle_fraction: default_duty_cycle(),
            duty_period_ms: default_duty_period_ms(),
            cpuset: None,
            pin_workers: true,
            worker_respawn_limit: default_respawn_limit(),
            sensor_timeout_ms: default_sensor_timeout_ms(),
            max_sensor_failures: default_max_sensor_failures(),
            override_path: default_override_path(),
            thermal_root: default_thermal_root(),
            powercap_root: default_powercap_root(),
            ambient_zone: None,
            cpu_zone: None,
            idle_power_w: default_idle_power(),
            max_power_w: default_max_power(),
            fallback_power_w: default_fallback_power(),
            calibration_min_samples: default_min_samples(),
            cold_start_uptime_s: default_cold_start_uptime(),
            cold_start_power_w: default_cold_start_power(),
            cold_start_smoothing: default_cold_start_alpha(),
            cold_start_max_step_c: default_cold_start_step(),
            calibration_dir: default_calibration_dir(),
            ambient_diagnostics: true,
            calibration: CalibrationPlan::default(),
        }
    }
}

impl HearthConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check every cross-field invariant.
    ///
    /// # Errors
    ///
    /// Returns `HearthError::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: String) -> Result<()> {
            Err(HearthError::InvalidConfig(msg))
        }

        if !self.min_threshold_c.is_finite() || !self.target_threshold_c.is_finite() {
            return invalid("thresholds must be finite".to_string());
        }
        if self.target_threshold_c <= self.min_threshold_c {
            return invalid(format!(
                "target_threshold_c ({}) must be greater than min_threshold_c ({})",
                self.target_threshold_c, self.min_threshold_c
            ));
        }
        if !(self.check_interval_s > 0.0 && self.check_interval_s <= MAX_CHECK_INTERVAL_S) {
            return invalid(format!(
                "check_interval_s must be in (0, {}], got {}",
                MAX_CHECK_INTERVAL_S, self.check_interval_s
            ));
        }
        if !(self.duty_cycle_fraction > 0.0 && self.duty_cycle_fraction <= 1.0) {
            return invalid(format!(
                "duty_cycle_fraction must be in (0, 1], got {}",
                self.duty_cycle_fraction
            ));
        }
        if self.duty_period_ms == 0 {
            return invalid("duty_period_ms must be non-zero".to_string());
        }
        if self.sensor_timeout_ms == 0 {
            return invalid("sensor_timeout_ms must be non-zero".to_string());
        }
        if self.max_sensor_failures == 0 {
            return invalid("max_sensor_failures must be at least 1".to_string());
        }
        if self.calibration_min_samples < MIN_CALIBRATION_SAMPLES {
            return invalid(format!(
                "calibration_min_samples must be at least {}, got {}",
                MIN_CALIBRATION_SAMPLES, self.calibration_min_samples
            ));
        }
        if !(self.idle_power_w >= 0.0 && self.max_power_w > self.idle_power_w) {
            return invalid(format!(
                "power envelope must satisfy 0 <= idle_power_w ({}) < max_power_w ({})",
                self.idle_power_w, self.max_power_w
            ));
        }
        if !(self.fallback_power_w > 0.0) {
            return invalid("fallback_power_w must be positive".to_string());
        }
        if !(self.cold_start_uptime_s >= 0.0 && self.cold_start_power_w >= 0.0) {
            return invalid("cold-start thresholds must be non-negative".to_string());
        }
        if Duration::try_from_secs_f64(self.cold_start_uptime_s).is_err() {
            return invalid(format!(
                "cold_start_uptime_s is out of range: {}",
                self.cold_start_uptime_s
            ));
        }
        if !(self.cold_start_smoothing > 0.0 && self.cold_start_smoothing <= 1.0) {
            return invalid(format!(
                "cold_start_smoothing must be in (0, 1], got {}",
                self.cold_start_smoothing
            ));
        }
        if !(self.cold_start_max_step_c > 0.0) {
            return invalid("cold_start_max_step_c must be positive".to_string());
        }
        self.calibration.validate()?;
        if self.calibration.load_levels.len() < self.calibration_min_samples {
            return invalid(format!(
                "calibration.load_levels has {} levels but calibration_min_samples is {}",
                self.calibration.load_levels.len(),
                self.calibration_min_samples
            ));
        }
        Ok(())
    }

    /// Interval between control ticks.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_s)
    }

    /// Upper bound on one sensor read.
    pub fn sensor_timeout(&self) -> Duration {
        Duration::from_millis(self.sensor_timeout_ms)
    }

    /// Busy and idle portions of one heater duty period.
    pub fn duty_cycle(&self) -> crate::pool::DutyCycle {
        crate::pool::DutyCycle::new(
            self.duty_cycle_fraction,
            Duration::from_millis(self.duty_period_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HearthConfig::default();
        assert_eq!(config.prefix, "hearth");
        assert_eq!(config.min_threshold_c, 0.0);
        assert_eq!(config.target_threshold_c, 5.0);
        assert_eq!(config.check_interval_s, 10.0);
        assert_eq!(config.duty_cycle_fraction, 0.7);
        assert_eq!(config.calibration_min_samples, 4);
        assert_eq!(config.cold_start_uptime_s, 60.0);
        assert_eq!(config.cold_start_power_w, 5.0);
        assert!(config.cpuset.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let mut config = HearthConfig::default();
        config.target_threshold_c = 0.0;
        assert!(matches!(
            config.validate(),
            Err(HearthError::InvalidConfig(msg)) if msg.contains("target_threshold_c")
        ));

        config.target_threshold_c = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_duty_cycle() {
        let mut config = HearthConfig::default();
        config.duty_cycle_fraction = 0.0;
        assert!(config.validate().is_err());
        config.duty_cycle_fraction = 1.5;
        assert!(config.validate().is_err());
        config.duty_cycle_fraction = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_small_sample_floor() {
        let mut config = HearthConfig::default();
        config.calibration_min_samples = 3;
        assert!(config.validate().is_err());
        config.calibration_min_samples = 6;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sample_floor_must_fit_ladder() {
        let mut config = HearthConfig::default();
        config.calibration_min_samples = config.calibration.load_levels.len();
        assert!(config.validate().is_ok());

        config.calibration_min_samples += 1;
        assert!(matches!(
            config.validate(),
            Err(HearthError::InvalidConfig(msg)) if msg.contains("load_levels")
        ));
    }

    #[test]
    fn test_rejects_unrepresentable_durations() {
        let mut config = HearthConfig::default();
        config.cold_start_uptime_s = f64::INFINITY;
        assert!(config.validate().is_err());
        config.cold_start_uptime_s = 1e300;
        assert!(config.validate().is_err());

        let mut config = HearthConfig::default();
        config.check_interval_s = 1e300;
        assert!(config.validate().is_err());
        config.check_interval_s = f64::NAN;
        assert!(config.validate().is_err());
        config.check_interval_s = MAX_CHECK_INTERVAL_S;
        assert!(config.validate().is_ok());
        assert_eq!(config.check_interval(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_durations() {
        let mut config = HearthConfig::default();
        config.check_interval_s = 2.5;
        assert_eq!(config.check_interval(), Duration::from_millis(2500));
        assert_eq!(config.sensor_timeout(), Duration::from_secs(2));

        let duty = config.duty_cycle();
        assert_eq!(duty.busy(), Duration::from_millis(700));
        assert_eq!(duty.idle(), Duration::from_millis(300));
    }

    #[test]
    fn test_deserialize_config() {
        let toml = r#"
            prefix = "shed"
            min_threshold_c = -2.0
            target_threshold_c = 4.0
            check_interval_s = 5
            duty_cycle_fraction = 0.5
            cpuset = "0-1"
            override_path = "/run/hearth/override"

            [calibration]
            load_levels = [0.0, 0.5, 1.0, 0.25]
            settle_window_s = 60
        "#;

        let config: HearthConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.prefix, "shed");
        assert_eq!(config.min_threshold_c, -2.0);
        assert_eq!(config.target_threshold_c, 4.0);
        assert_eq!(config.check_interval_s, 5.0);
        assert_eq!(config.cpuset, Some("0-1".to_string()));
        assert_eq!(config.override_path, PathBuf::from("/run/hearth/override"));
        assert_eq!(config.calibration.load_levels, vec![0.0, 0.5, 1.0, 0.25]);
        assert_eq!(config.calibration.settle_window_s, 60);
        assert!(config.validate().is_ok());
    }
}
