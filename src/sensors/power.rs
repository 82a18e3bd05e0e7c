//! Power draw measurement.
//!
//! Three methods, in order of preference:
//!
//! 1. [`RaplPower`]: the RAPL package energy counter, differentiated over a
//!    short window.
//! 2. [`UtilizationPower`]: global CPU utilisation mapped linearly onto an
//!    idle/max board power envelope.
//! 3. [`FixedPower`]: a configured constant.
//!
//! [`PowerProbe`] tries them in that order and never fails.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::debug;

use crate::config::HearthConfig;
use crate::error::{HearthError, Result};

/// Window over which the RAPL counter is differentiated.
const RAPL_WINDOW: Duration = Duration::from_millis(100);

/// How a power figure was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMethod {
    HardwareCounter,
    UtilizationEstimate,
    FallbackConstant,
}

impl fmt::Display for PowerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerMethod::HardwareCounter => "hardware counter",
            PowerMethod::UtilizationEstimate => "utilization estimate",
            PowerMethod::FallbackConstant => "fallback constant",
        };
        f.write_str(s)
    }
}

/// One power observation.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerSample {
    pub timestamp: SystemTime,
    pub watts: f64,
    pub method: PowerMethod,
}

impl PowerSample {
    fn now(watts: f64, method: PowerMethod) -> Self {
        Self {
            timestamp: SystemTime::now(),
            watts,
            method,
        }
    }
}

/// A source of power measurements. Sampling may block for a short window.
pub trait PowerSource: Send + Sync + 'static {
    /// Take one sample.
    fn sample(&self) -> Result<PowerSample>;

    /// Method used by this source.
    fn method(&self) -> PowerMethod;
}

/// RAPL package energy counter (`energy_uj`).
#[derive(Debug, Clone)]
pub struct RaplPower {
    energy_path: PathBuf,
    max_range_uj: Option<u64>,
    window: Duration,
}

impl RaplPower {
    /// Locate the package-0 counter under a powercap root.
    pub fn discover(powercap_root: &Path) -> Option<Self> {
        [
            powercap_root.join("intel-rapl/intel-rapl:0"),
            powercap_root.join("intel-rapl:0"),
        ]
        .into_iter()
        .find(|dir| dir.join("energy_uj").is_file())
        .map(|dir| Self {
            max_range_uj: read_u64(&dir.join("max_energy_range_uj")).ok(),
            energy_path: dir.join("energy_uj"),
            window: RAPL_WINDOW,
        })
    }

    /// Override the sampling window.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Energy consumed between two counter values, accounting for one
    /// wraparound.
    pub fn energy_delta_uj(before: u64, after: u64, max_range_uj: Option<u64>) -> Option<u64> {
        if after >= before {
            Some(after - before)
        } else {
            max_range_uj
                .and_then(|max| max.checked_sub(before))
                .and_then(|rest| rest.checked_add(after))
        }
    }
}

impl PowerSource for RaplPower {
    fn sample(&self) -> Result<PowerSample> {
        let before = read_u64(&self.energy_path)?;
        let start = Instant::now();
        thread::sleep(self.window);
        let after = read_u64(&self.energy_path)?;
        let elapsed = start.elapsed().as_secs_f64();

        let delta = Self::energy_delta_uj(before, after, self.max_range_uj).ok_or_else(|| {
            HearthError::SensorUnavailable(format!(
                "{}: counter went backwards",
                self.energy_path.display()
            ))
        })?;
        let watts = delta as f64 / 1_000_000.0 / elapsed;
        Ok(PowerSample::now(watts, PowerMethod::HardwareCounter))
    }

    fn method(&self) -> PowerMethod {
        PowerMethod::HardwareCounter
    }
}

/// Power estimated from global CPU utilisation.
pub struct UtilizationPower {
    system: Mutex<System>,
    idle_w: f64,
    max_w: f64,
}

impl UtilizationPower {
    pub fn new(idle_w: f64, max_w: f64) -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
            idle_w,
            max_w,
        }
    }

    /// Watts at a utilisation fraction in `[0, 1]`.
    pub fn watts_at(&self, utilization: f64) -> f64 {
        self.idle_w + (self.max_w - self.idle_w) * utilization.clamp(0.0, 1.0)
    }
}

impl PowerSource for UtilizationPower {
    fn sample(&self) -> Result<PowerSample> {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        system.refresh_cpu_usage();
        let usage = f64::from(system.global_cpu_usage());
        if !usage.is_finite() {
            return Err(HearthError::SensorUnavailable(
                "CPU utilisation unavailable".to_string(),
            ));
        }
        Ok(PowerSample::now(
            self.watts_at(usage / 100.0),
            PowerMethod::UtilizationEstimate,
        ))
    }

    fn method(&self) -> PowerMethod {
        PowerMethod::UtilizationEstimate
    }
}

impl fmt::Debug for UtilizationPower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UtilizationPower")
            .field("idle_w", &self.idle_w)
            .field("max_w", &self.max_w)
            .finish()
    }
}

/// A constant power figure.
#[derive(Debug, Clone, Copy)]
pub struct FixedPower(pub f64);

impl PowerSource for FixedPower {
    fn sample(&self) -> Result<PowerSample> {
        Ok(PowerSample::now(self.0, PowerMethod::FallbackConstant))
    }

    fn method(&self) -> PowerMethod {
        PowerMethod::FallbackConstant
    }
}

/// Tries each source in preference order, ending with a constant.
pub struct PowerProbe {
    sources: Vec<Box<dyn PowerSource>>,
    fallback: FixedPower,
}

impl PowerProbe {
    /// A probe over explicit sources.
    pub fn new(sources: Vec<Box<dyn PowerSource>>, fallback_w: f64) -> Self {
        Self {
            sources,
            fallback: FixedPower(fallback_w),
        }
    }

    /// RAPL if present, then the utilisation estimate, then the fallback.
    pub fn from_config(config: &HearthConfig) -> Self {
        let mut sources: Vec<Box<dyn PowerSource>> = Vec::new();
        if let Some(rapl) = RaplPower::discover(&config.powercap_root) {
            sources.push(Box::new(rapl));
        }
        sources.push(Box::new(UtilizationPower::new(
            config.idle_power_w,
            config.max_power_w,
        )));
        Self::new(sources, config.fallback_power_w)
    }
}

impl PowerSource for PowerProbe {
    fn sample(&self) -> Result<PowerSample> {
        for source in &self.sources {
            match source.sample() {
                Ok(sample) if sample.watts.is_finite() && sample.watts > 0.0 => return Ok(sample),
                Ok(sample) => {
                    debug!(method = %sample.method, watts = sample.watts, "discarding power sample")
                }
                Err(e) => debug!(%e, method = %source.method(), "power source failed"),
            }
        }
        self.fallback.sample()
    }

    /// Method of the most preferred source.
    fn method(&self) -> PowerMethod {
        self.sources
            .first()
            .map(|s| s.method())
            .unwrap_or(PowerMethod::FallbackConstant)
    }
}

impl fmt::Debug for PowerProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods: Vec<_> = self.sources.iter().map(|s| s.method()).collect();
        f.debug_struct("PowerProbe")
            .field("sources", &methods)
            .field("fallback_w", &self.fallback.0)
            .finish()
    }
}

fn read_u64(path: &Path) -> Result<u64> {
    fs::read_to_string(path)
        .map_err(|e| HearthError::SensorUnavailable(format!("{}: {}", path.display(), e)))?
        .trim()
        .parse()
        .map_err(|e| HearthError::SensorUnavailable(format!("{}: {}", path.display(), e)))
}
