//! Thermal-resistance model `T_cpu = T_amb + P * R_th + b`.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::{HearthError, Result};

/// Models with a coefficient of determination below this are flagged.
pub const LOW_CONFIDENCE_R_SQUARED: f64 = 0.85;

/// One calibration observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    /// CPU package temperature, °C.
    pub cpu_temp: f64,
    /// Board power draw, W.
    pub power_watts: f64,
    /// Independently measured ambient temperature, °C.
    pub ambient_reference: f64,
}

impl CalibrationSample {
    pub fn new(cpu_temp: f64, power_watts: f64, ambient_reference: f64) -> Self {
        Self {
            cpu_temp,
            power_watts,
            ambient_reference,
        }
    }

    /// Temperature rise of the CPU over ambient.
    pub fn rise(&self) -> f64 {
        self.cpu_temp - self.ambient_reference
    }

    fn check(&self, index: usize) -> Result<()> {
        let invalid = |reason: &str| HearthError::InvalidSample {
            index,
            reason: reason.to_string(),
        };
        if !self.cpu_temp.is_finite() {
            return Err(invalid("cpu_temp is not finite"));
        }
        if !self.ambient_reference.is_finite() {
            return Err(invalid("ambient_reference is not finite"));
        }
        if !self.power_watts.is_finite() {
            return Err(invalid("power_watts is not finite"));
        }
        if self.power_watts <= 0.0 {
            return Err(invalid("power_watts must be positive"));
        }
        Ok(())
    }
}

/// Ambient estimate with its one-sigma uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AmbientEstimate {
    pub ambient_celsius: f64,
    pub uncertainty_celsius: f64,
}

/// A fitted thermal model. Never mutated; adjustments build a new model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationModel {
    /// °C per W.
    pub thermal_resistance: f64,
    /// °C.
    pub bias: f64,
    /// Population standard deviation of the fit residuals, °C.
    pub sigma: f64,
    pub r_squared: f64,
    pub sample_count: usize,
    pub created_at: SystemTime,
}

impl CalibrationModel {
    /// Fit the model by ordinary least squares of `cpu_temp - ambient_reference`
    /// against `power_watts`.
    ///
    /// # Errors
    ///
    /// - `CalibrationInsufficientData` with fewer than `min_samples` samples or
    ///   when every sample has the same power.
    /// - `InvalidSample` for non-finite values or non-positive power.
    pub fn fit(samples: &[CalibrationSample], min_samples: usize) -> Result<Self> {
        if samples.len() < min_samples {
            return Err(HearthError::CalibrationInsufficientData(format!(
                "need at least {} samples, got {}",
                min_samples,
                samples.len()
            )));
        }
        for (index, sample) in samples.iter().enumerate() {
            sample.check(index)?;
        }

        let (lo, hi) = samples.iter().fold((f64::MAX, f64::MIN), |(lo, hi), s| {
            (lo.min(s.power_watts), hi.max(s.power_watts))
        });
        if hi - lo <= 0.0 {
            return Err(HearthError::CalibrationInsufficientData(format!(
                "power values must span a range, all samples at {} W",
                lo
            )));
        }

        let n = samples.len() as f64;
        let mean_p = samples.iter().map(|s| s.power_watts).sum::<f64>() / n;
        let mean_rise = samples.iter().map(CalibrationSample::rise).sum::<f64>() / n;

        let (sxx, sxy) = samples.iter().fold((0.0, 0.0), |(sxx, sxy), s| {
            let dx = s.power_watts - mean_p;
            (sxx + dx * dx, sxy + dx * (s.rise() - mean_rise))
        });
        let thermal_resistance = sxy / sxx;
        let bias = mean_rise - thermal_resistance * mean_p;

        let (ss_res, ss_tot) = samples.iter().fold((0.0, 0.0), |(res, tot), s| {
            let residual = s.rise() - (thermal_resistance * s.power_watts + bias);
            let spread = s.rise() - mean_rise;
            (res + residual * residual, tot + spread * spread)
        });
        let sigma = (ss_res / n).sqrt();
        let r_squared = if ss_tot > 0.0 {
            1.0 - ss_res / ss_tot
        } else {
            0.0
        };

        Ok(Self {
            thermal_resistance,
            bias,
            sigma,
            r_squared,
            sample_count: samples.len(),
            created_at: SystemTime::now(),
        })
    }

    /// Whether the fit explains too little variance to be trusted.
    pub fn low_confidence(&self) -> bool {
        self.r_squared < LOW_CONFIDENCE_R_SQUARED
    }

    /// Whether the model is usable for inference.
    pub fn is_valid(&self, min_samples: usize) -> bool {
        self.sample_count >= min_samples
            && self.thermal_resistance.is_finite()
            && self.bias.is_finite()
            && self.sigma.is_finite()
            && self.sigma >= 0.0
    }

    /// A copy with a different bias and a fresh timestamp.
    pub fn with_bias(&self, bias: f64) -> Self {
        Self {
            bias,
            created_at: SystemTime::now(),
            ..self.clone()
        }
    }

    /// Predicted CPU temperature rise over ambient at `power_watts`.
    pub fn predicted_rise(&self, power_watts: f64) -> f64 {
        power_watts * self.thermal_resistance + self.bias
    }

    /// Infer ambient from a CPU temperature and power draw.
    ///
    /// Pure: identical inputs always give identical outputs.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for non-finite values or negative power.
    pub fn estimate(&self, cpu_temp: f64, power_watts: f64) -> Result<AmbientEstimate> {
        if !cpu_temp.is_finite() || !power_watts.is_finite() {
            return Err(HearthError::InvalidInput(format!(
                "non-finite input: cpu_temp={}, power_watts={}",
                cpu_temp, power_watts
            )));
        }
        if power_watts < 0.0 {
            return Err(HearthError::InvalidInput(format!(
                "power must be non-negative, got {} W",
                power_watts
            )));
        }
        Ok(AmbientEstimate {
            ambient_celsius: cpu_temp - self.predicted_rise(power_watts),
            uncertainty_celsius: self.sigma,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_samples() -> Vec<CalibrationSample> {
        vec![
            CalibrationSample::new(24.5, 7.0, 22.0),
            CalibrationSample::new(38.0, 14.0, 22.0),
            CalibrationSample::new(52.0, 22.0, 22.0),
            CalibrationSample::new(45.0, 18.0, 22.0),
        ]
    }

    #[test]
    fn test_fit_worked_example() {
        let model = CalibrationModel::fit(&example_samples(), 4).unwrap();
        assert!((model.thermal_resistance - 1.834).abs() < 0.01);
        assert!((model.bias + 10.09).abs() < 0.05);
        assert!(model.r_squared > 0.95);
        assert!(!model.low_confidence());
        assert_eq!(model.sample_count, 4);
        assert!(model.is_valid(4));
    }

    #[test]
    fn test_fit_exact_line() {
        // rise = 2.5 * P + 3, no noise
        let samples: Vec<_> = [4.0, 9.0, 13.0, 18.0, 25.0]
            .iter()
            .map(|&p| CalibrationSample::new(10.0 + 2.5 * p + 3.0, p, 10.0))
            .collect();
        let model = CalibrationModel::fit(&samples, 4).unwrap();
        assert!((model.thermal_resistance - 2.5).abs() < 1e-9);
        assert!((model.bias - 3.0).abs() < 1e-9);
        assert!(model.sigma < 1e-9);
        assert!((model.r_squared - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_fit_rejects_too_few_samples() {
        let samples = &example_samples()[..3];
        assert!(matches!(
            CalibrationModel::fit(samples, 4),
            Err(HearthError::CalibrationInsufficientData(msg)) if msg.contains("got 3")
        ));
    }

    #[test]
    fn test_fit_rejects_flat_power() {
        let samples: Vec<_> = (0..5)
            .map(|i| CalibrationSample::new(40.0 + i as f64, 10.0, 20.0))
            .collect();
        assert!(matches!(
            CalibrationModel::fit(&samples, 4),
            Err(HearthError::CalibrationInsufficientData(_))
        ));
    }

    #[test]
    fn test_fit_rejects_bad_samples() {
        let mut samples = example_samples();
        samples[2].power_watts = 0.0;
        assert!(matches!(
            CalibrationModel::fit(&samples, 4),
            Err(HearthError::InvalidSample { index: 2, .. })
        ));

        let mut samples = example_samples();
        samples[1].cpu_temp = f64::NAN;
        assert!(matches!(
            CalibrationModel::fit(&samples, 4),
            Err(HearthError::InvalidSample { index: 1, .. })
        ));
    }

    #[test]
    fn test_flat_rise_scores_zero() {
        let samples: Vec<_> = [5.0, 10.0, 15.0, 20.0]
            .iter()
            .map(|&p| CalibrationSample::new(30.0, p, 20.0))
            .collect();
        let model = CalibrationModel::fit(&samples, 4).unwrap();
        assert_eq!(model.r_squared, 0.0);
        assert!(model.low_confidence());
        assert!(model.thermal_resistance.abs() < 1e-12);
    }

    #[test]
    fn test_estimate_is_pure() {
        let model = CalibrationModel::fit(&example_samples(), 4).unwrap();
        let a = model.estimate(60.0, 15.0).unwrap();
        let b = model.estimate(60.0, 15.0).unwrap();
        assert_eq!(a, b);
        let expected = 60.0 - (15.0 * model.thermal_resistance + model.bias);
        assert!((a.ambient_celsius - expected).abs() < 1e-12);
        assert_eq!(a.uncertainty_celsius, model.sigma);
    }

    #[test]
    fn test_estimate_rejects_bad_input() {
        let model = CalibrationModel::fit(&example_samples(), 4).unwrap();
        assert!(matches!(
            model.estimate(f64::NAN, 10.0),
            Err(HearthError::InvalidInput(_))
        ));
        assert!(matches!(
            model.estimate(50.0, -1.0),
            Err(HearthError::InvalidInput(_))
        ));
        assert!(model.estimate(50.0, 0.0).is_ok());
    }

    #[test]
    fn test_with_bias_replaces_only_bias() {
        let model = CalibrationModel::fit(&example_samples(), 4).unwrap();
        let nudged = model.with_bias(1.5);
        assert_eq!(nudged.bias, 1.5);
        assert_eq!(nudged.thermal_resistance, model.thermal_resistance);
        assert_eq!(nudged.sample_count, model.sample_count);
    }
}
