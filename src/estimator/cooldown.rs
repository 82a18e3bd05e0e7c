//! Newtonian cooldown fit `T(t) = T_amb + (T0 - T_amb) * exp(-t / tau)`.
//!
//! Used to cross-check a calibration: a powered-down or idle board decays
//! toward ambient, so the fitted asymptote should agree with a reference
//! thermometer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HearthError, Result};

/// Fewest points a cooldown fit accepts.
pub const MIN_COOLDOWN_POINTS: usize = 5;

/// One point of a cooldown series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CooldownPoint {
    /// Seconds since an arbitrary origin; normalised to the first point.
    pub elapsed_s: f64,
    pub temperature: f64,
}

impl CooldownPoint {
    pub fn new(elapsed_s: f64, temperature: f64) -> Self {
        Self {
            elapsed_s,
            temperature,
        }
    }
}

/// Result of a cooldown fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CooldownFit {
    /// Time constant, seconds.
    pub tau: f64,
    /// Asymptote implied by the fitted intercept, °C.
    pub fitted_ambient: f64,
    /// First temperature of the series, °C.
    pub initial_temp: f64,
    /// Ambient the series was linearised against, °C.
    pub ambient_reference: f64,
    /// RMSE of the exponential model against the measurements, °C.
    pub rmse: f64,
}

/// How well the fitted ambient matches the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownAgreement {
    Good,
    Fair,
    Poor,
}

impl fmt::Display for CooldownAgreement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CooldownAgreement::Good => "good",
            CooldownAgreement::Fair => "fair",
            CooldownAgreement::Poor => "poor",
        })
    }
}

impl CooldownFit {
    /// Absolute gap between fitted and reference ambient.
    pub fn ambient_error(&self) -> f64 {
        (self.fitted_ambient - self.ambient_reference).abs()
    }

    /// Under 2 °C is good, under 4 °C fair, otherwise poor.
    pub fn agreement(&self) -> CooldownAgreement {
        match self.ambient_error() {
            e if e < 2.0 => CooldownAgreement::Good,
            e if e < 4.0 => CooldownAgreement::Fair,
            _ => CooldownAgreement::Poor,
        }
    }
}

/// Fit a cooldown series against a measured ambient.
///
/// # Errors
///
/// `InvalidCooldownSeries` when the series has fewer than five points, holds
/// non-finite values, spans no time, touches the reference, or is not decaying.
pub fn fit_cooldown(series: &[CooldownPoint], ambient_reference: f64) -> Result<CooldownFit> {
    let invalid = |msg: String| -> Result<CooldownFit> {
        Err(HearthError::InvalidCooldownSeries(msg))
    };

    if series.len() < MIN_COOLDOWN_POINTS {
        return invalid(format!(
            "need at least {} points, got {}",
            MIN_COOLDOWN_POINTS,
            series.len()
        ));
    }
    if !ambient_reference.is_finite() {
        return invalid("ambient reference is not finite".to_string());
    }
    if let Some(i) = series
        .iter()
        .position(|p| !p.elapsed_s.is_finite() || !p.temperature.is_finite())
    {
        return invalid(format!("point #{} is not finite", i));
    }
    if let Some(i) = series
        .iter()
        .position(|p| p.temperature <= ambient_reference)
    {
        return invalid(format!(
            "point #{} ({} °C) is not above the ambient reference ({} °C)",
            i, series[i].temperature, ambient_reference
        ));
    }

    let t0 = series[0].elapsed_s;
    let initial_temp = series[0].temperature;
    let xs: Vec<f64> = series.iter().map(|p| p.elapsed_s - t0).collect();
    let ys: Vec<f64> = series
        .iter()
        .map(|p| (p.temperature - ambient_reference).ln())
        .collect();

    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let (sxx, sxy) = xs
        .iter()
        .zip(&ys)
        .fold((0.0, 0.0), |(sxx, sxy), (x, y)| {
            let dx = x - mean_x;
            (sxx + dx * dx, sxy + dx * (y - mean_y))
        });
    if sxx <= 0.0 {
        return invalid("series spans no time".to_string());
    }
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    if slope >= 0.0 {
        return invalid("temperature is not decaying".to_string());
    }

    let tau = -1.0 / slope;
    let fitted_ambient = initial_temp - intercept.exp();
    let sq_err: f64 = xs
        .iter()
        .zip(series)
        .map(|(t, p)| {
            let predicted =
                ambient_reference + (initial_temp - ambient_reference) * (-t / tau).exp();
            (p.temperature - predicted).powi(2)
        })
        .sum();

    Ok(CooldownFit {
        tau,
        fitted_ambient,
        initial_temp,
        ambient_reference,
        rmse: (sq_err / n).sqrt(),
    })
}
