//! Sensorless ambient temperature estimation.
//!
//! The enclosure has no dedicated ambient sensor, but the CPU temperature rises
//! over ambient roughly in proportion to the power it dissipates:
//!
//! ```text
//! T_cpu = T_amb + P * R_th + b        =>        T_amb = T_cpu - (P * R_th + b)
//! ```
//!
//! [`AmbientEstimator`] owns the current [`CalibrationModel`], fits new ones
//! from [`CalibrationSample`]s, answers estimates, nudges the bias right after
//! boot, and cross-checks a model with a [`cooldown`] fit.

pub mod cooldown;
pub mod model;
pub mod procedure;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::HearthConfig;
use crate::error::{HearthError, Result};

pub use cooldown::{fit_cooldown, CooldownAgreement, CooldownFit, CooldownPoint};
pub use model::{AmbientEstimate, CalibrationModel, CalibrationSample};
pub use procedure::{CalibrationPlan, CalibrationProcedure};
pub use store::{CalibrationStore, JsonFileStore, MemoryStore};

/// Estimator tuning taken from the configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorSettings {
    pub min_samples: usize,
    pub cold_start_uptime: Duration,
    pub cold_start_power_w: f64,
    pub cold_start_smoothing: f64,
    pub cold_start_max_step_c: f64,
}

impl EstimatorSettings {
    pub fn from_config(config: &HearthConfig) -> Self {
        Self {
            min_samples: config.calibration_min_samples,
            cold_start_uptime: Duration::from_secs_f64(config.cold_start_uptime_s),
            cold_start_power_w: config.cold_start_power_w,
            cold_start_smoothing: config.cold_start_smoothing,
            cold_start_max_step_c: config.cold_start_max_step_c,
        }
    }
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self::from_config(&HearthConfig::default())
    }
}

/// Outcome of a successful calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibrated {
    pub model: CalibrationModel,
    /// False when the store rejected the model; it is still in use.
    pub persisted: bool,
}

/// A cold-start bias adjustment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiasCorrection {
    pub previous_bias: f64,
    pub bias: f64,
}

/// Holder of the current thermal model.
pub struct AmbientEstimator {
    store: Arc<dyn CalibrationStore>,
    settings: EstimatorSettings,
    model: Option<CalibrationModel>,
    cold_start_applied: bool,
}

impl AmbientEstimator {
    /// Create an estimator and load the stored model once.
    ///
    /// A missing, unreadable or invalid record leaves the estimator
    /// uncalibrated; it never fails construction.
    pub fn new(store: Arc<dyn CalibrationStore>, settings: EstimatorSettings) -> Self {
        let model = match store.load() {
            Ok(Some(model)) if model.is_valid(settings.min_samples) => {
                info!(
                    location = %store.location(),
                    r_th = model.thermal_resistance,
                    bias = model.bias,
                    samples = model.sample_count,
                    "loaded calibration"
                );
                Some(model)
            }
            Ok(Some(model)) => {
                warn!(
                    location = %store.location(),
                    samples = model.sample_count,
                    "stored calibration is not valid, ignoring it"
                );
                None
            }
            Ok(None) => {
                debug!(location = %store.location(), "no stored calibration");
                None
            }
            Err(e) => {
                warn!(%e, "failed to load calibration, running uncalibrated");
                None
            }
        };
        Self {
            store,
            settings,
            model,
            cold_start_applied: false,
        }
    }

    pub fn settings(&self) -> &EstimatorSettings {
        &self.settings
    }

    /// The model in use, if any.
    pub fn model(&self) -> Option<&CalibrationModel> {
        self.model.as_ref()
    }

    pub fn is_calibrated(&self) -> bool {
        self.model.is_some()
    }

    /// Fit a new model and make it current.
    ///
    /// On failure the previous model stays in place. A store failure is not an
    /// error: the model is used and `persisted` is false.
    pub fn calibrate(&mut self, samples: &[CalibrationSample]) -> Result<Calibrated> {
        let model = CalibrationModel::fit(samples, self.settings.min_samples)?;
        if model.low_confidence() {
            warn!(
                r_squared = model.r_squared,
                "calibration fit is low confidence"
            );
        }
        let persisted = self.persist(&model);
        self.model = Some(model.clone());
        Ok(Calibrated { model, persisted })
    }

    /// Infer ambient from the current model.
    ///
    /// # Errors
    ///
    /// `NotCalibrated` without a model; `InvalidInput` for bad readings.
    pub fn estimate(&self, cpu_temp: f64, power_watts: f64) -> Result<AmbientEstimate> {
        self.model
            .as_ref()
            .ok_or(HearthError::NotCalibrated)?
            .estimate(cpu_temp, power_watts)
    }

    /// Apply the cold-start bias nudge if the conditions hold.
    ///
    /// Right after boot at low power the CPU has not yet warmed above ambient,
    /// so the bias is moved toward the value that makes the estimate equal the
    /// CPU temperature. Runs at most once per estimator.
    pub fn apply_cold_start(&mut self, power_watts: f64, uptime: Duration) -> Option<BiasCorrection> {
        if self.cold_start_applied
            || uptime >= self.settings.cold_start_uptime
            || !power_watts.is_finite()
            || power_watts < 0.0
            || power_watts >= self.settings.cold_start_power_w
        {
            return None;
        }
        let model = self.model.as_ref()?;

        let target = -power_watts * model.thermal_resistance;
        let max_step = self.settings.cold_start_max_step_c;
        let step = (self.settings.cold_start_smoothing * (target - model.bias))
            .clamp(-max_step, max_step);
        let correction = BiasCorrection {
            previous_bias: model.bias,
            bias: model.bias + step,
        };
        let nudged = model.with_bias(correction.bias);

        self.cold_start_applied = true;
        self.persist(&nudged);
        self.model = Some(nudged);
        info!(
            previous = correction.previous_bias,
            bias = correction.bias,
            uptime_s = uptime.as_secs(),
            "cold-start bias correction"
        );
        Some(correction)
    }

    /// [`estimate`](Self::estimate) after a possible cold-start correction.
    pub fn estimate_with_cold_start(
        &mut self,
        cpu_temp: f64,
        power_watts: f64,
        uptime: Duration,
    ) -> Result<AmbientEstimate> {
        self.apply_cold_start(power_watts, uptime);
        self.estimate(cpu_temp, power_watts)
    }

    /// Fit a cooldown series for validation. The model is not touched.
    pub fn fit_cooldown(
        &self,
        series: &[CooldownPoint],
        ambient_reference: f64,
    ) -> Result<CooldownFit> {
        fit_cooldown(series, ambient_reference)
    }

    fn persist(&self, model: &CalibrationModel) -> bool {
        match self.store.save(model) {
            Ok(()) => true,
            Err(e) => {
                warn!(%e, location = %self.store.location(), "failed to persist calibration");
                false
            }
        }
    }
}

impl std::fmt::Debug for AmbientEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmbientEstimator")
            .field("store", &self.store.location())
            .field("model", &self.model)
            .field("cold_start_applied", &self.cold_start_applied)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<CalibrationSample> {
        vec![
            CalibrationSample::new(24.5, 7.0, 22.0),
            CalibrationSample::new(38.0, 14.0, 22.0),
            CalibrationSample::new(52.0, 22.0, 22.0),
            CalibrationSample::new(45.0, 18.0, 22.0),
        ]
    }

    fn estimator(store: &MemoryStore) -> AmbientEstimator {
        AmbientEstimator::new(Arc::new(store.clone()), EstimatorSettings::default())
    }

    #[test]
    fn test_uncalibrated_estimate_fails() {
        let est = estimator(&MemoryStore::new());
        assert!(!est.is_calibrated());
        assert!(matches!(
            est.estimate(40.0, 10.0),
            Err(HearthError::NotCalibrated)
        ));
    }

    #[test]
    fn test_calibrate_persists_and_reloads() {
        let store = MemoryStore::new();
        let mut est = estimator(&store);
        let outcome = est.calibrate(&samples()).unwrap();
        assert!(outcome.persisted);
        assert_eq!(store.stored(), Some(outcome.model.clone()));

        let reloaded = estimator(&store);
        assert_eq!(reloaded.model(), Some(&outcome.model));
        assert_eq!(
            reloaded.estimate(50.0, 12.0).unwrap(),
            est.estimate(50.0, 12.0).unwrap()
        );
    }

    #[test]
    fn test_failed_calibration_keeps_previous_model() {
        let store = MemoryStore::new();
        let mut est = estimator(&store);
        est.calibrate(&samples()).unwrap();
        let before = est.model().cloned();

        assert!(est.calibrate(&samples()[..3]).is_err());
        assert_eq!(est.model().cloned(), before);
    }

    #[test]
    fn test_store_failure_keeps_model_in_memory() {
        let store = MemoryStore::new();
        store.set_fail_saves(true);
        let mut est = estimator(&store);
        let outcome = est.calibrate(&samples()).unwrap();
        assert!(!outcome.persisted);
        assert!(est.is_calibrated());
        assert!(store.stored().is_none());
    }

    #[test]
    fn test_invalid_stored_model_is_ignored() {
        let mut model = CalibrationModel::fit(&samples(), 4).unwrap();
        model.sample_count = 2;
        let est = estimator(&MemoryStore::with_model(model));
        assert!(!est.is_calibrated());
    }

    #[test]
    fn test_cold_start_nudges_once() {
        let store = MemoryStore::new();
        let mut est = estimator(&store);
        let model = est.calibrate(&samples()).unwrap().model;

        // Too late after boot
        assert!(est
            .apply_cold_start(3.0, Duration::from_secs(120))
            .is_none());
        // Too much power
        assert!(est.apply_cold_start(8.0, Duration::from_secs(10)).is_none());

        let correction = est.apply_cold_start(3.0, Duration::from_secs(10)).unwrap();
        let target = -3.0 * model.thermal_resistance;
        let expected = model.bias + 0.1 * (target - model.bias);
        assert!((correction.bias - expected).abs() < 1e-9);
        assert_eq!(correction.previous_bias, model.bias);
        assert_eq!(est.model().unwrap().bias, correction.bias);
        assert_eq!(store.stored().unwrap().bias, correction.bias);
        assert_eq!(
            est.model().unwrap().thermal_resistance,
            model.thermal_resistance
        );

        assert!(est.apply_cold_start(3.0, Duration::from_secs(11)).is_none());
    }

    #[test]
    fn test_cold_start_step_is_clamped() {
        let store = MemoryStore::new();
        let mut est = estimator(&store);
        let model = est.calibrate(&samples()).unwrap().model;
        let mut settings = *est.settings();
        settings.cold_start_max_step_c = 0.25;
        let mut est = AmbientEstimator::new(Arc::new(store), settings);

        let correction = est.apply_cold_start(1.0, Duration::ZERO).unwrap();
        // b is far below -P*R_th, so the step is positive and clamped
        assert!((correction.bias - (model.bias + 0.25)).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_with_cold_start_uses_new_bias() {
        let mut est = estimator(&MemoryStore::new());
        est.calibrate(&samples()).unwrap();
        let before = est.estimate(30.0, 2.0).unwrap();
        let after = est
            .estimate_with_cold_start(30.0, 2.0, Duration::from_secs(5))
            .unwrap();
        assert!(after.ambient_celsius < before.ambient_celsius);
    }

    #[test]
    fn test_fit_cooldown_leaves_model_alone() {
        let mut est = estimator(&MemoryStore::new());
        est.calibrate(&samples()).unwrap();
        let before = est.model().cloned();
        let series: Vec<_> = (0..6)
            .map(|i| {
                let t = i as f64 * 60.0;
                CooldownPoint::new(t, 20.0 + 30.0 * (-t / 200.0).exp())
            })
            .collect();
        let fit = est.fit_cooldown(&series, 20.0).unwrap();
        assert!((fit.tau - 200.0).abs() < 1e-6);
        assert_eq!(est.model().cloned(), before);
    }
}
