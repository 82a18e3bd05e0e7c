//! Sensor access layer.
//!
//! Temperatures come from sysfs thermal zones ([`thermal`]); power draw comes
//! from the RAPL energy counter, a CPU-utilisation estimate or a constant
//! ([`power`]). Every source is behind a trait so the controller and the
//! estimator can be driven by scripted readings in tests.

pub mod power;
pub mod thermal;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::config::HearthConfig;
use crate::error::{HearthError, Result};

pub use power::{
    FixedPower, PowerMethod, PowerProbe, PowerSample, PowerSource, RaplPower, UtilizationPower,
};
pub use thermal::{discover_zones, SysfsThermal, ThermalZone};

/// One temperature observation.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermalReading {
    pub timestamp: SystemTime,
    pub zone_id: String,
    pub temperature_celsius: f64,
}

impl ThermalReading {
    /// A reading taken now.
    pub fn now(zone_id: impl Into<String>, temperature_celsius: f64) -> Self {
        Self {
            timestamp: SystemTime::now(),
            zone_id: zone_id.into(),
            temperature_celsius,
        }
    }
}

/// A temperature channel.
///
/// Reads may block on file I/O; async callers run them on the blocking pool.
pub trait TemperatureSource: Send + Sync + 'static {
    /// Take one reading.
    ///
    /// # Errors
    ///
    /// `HearthError::SensorUnavailable` when the channel cannot be read.
    fn read(&self) -> Result<ThermalReading>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Temperature channel fed by the embedding application.
///
/// Queued readings are returned first, one per read; after that the most
/// recent value repeats. An empty entry (`None`) simulates a failed read.
#[derive(Debug, Clone)]
pub struct SharedTemperature {
    zone_id: Arc<str>,
    state: Arc<Mutex<SharedState>>,
}

#[derive(Debug)]
struct SharedState {
    queue: VecDeque<Option<f64>>,
    current: Option<f64>,
}

impl SharedTemperature {
    /// A channel with no value yet; reads fail until one is set.
    pub fn new(zone_id: &str) -> Self {
        Self {
            zone_id: zone_id.into(),
            state: Arc::new(Mutex::new(SharedState {
                queue: VecDeque::new(),
                current: None,
            })),
        }
    }

    /// Set the value returned once the queue is drained.
    pub fn set(&self, celsius: Option<f64>) {
        self.state.lock().current = celsius;
    }

    /// Queue readings to be returned in order.
    pub fn push_all(&self, readings: impl IntoIterator<Item = Option<f64>>) {
        self.state.lock().queue.extend(readings);
    }
}

impl TemperatureSource for SharedTemperature {
    fn read(&self) -> Result<ThermalReading> {
        let value = {
            let mut state = self.state.lock();
            match state.queue.pop_front() {
                Some(next) => {
                    state.current = next;
                    next
                }
                None => state.current,
            }
        };
        value
            .map(|t| ThermalReading::now(self.zone_id.as_ref(), t))
            .ok_or_else(|| HearthError::SensorUnavailable(format!("{} has no value", self.zone_id)))
    }

    fn describe(&self) -> String {
        format!("shared:{}", self.zone_id)
    }
}

/// The channels the runtime works with.
#[derive(Clone)]
pub struct SensorSuite {
    /// Case/ambient channel driving the thermostat; calibration reference.
    pub ambient: Arc<dyn TemperatureSource>,
    /// CPU package channel feeding the estimator.
    pub cpu: Arc<dyn TemperatureSource>,
    /// Power draw.
    pub power: Arc<dyn PowerSource>,
}

impl SensorSuite {
    /// Discover sysfs channels per the configuration.
    ///
    /// # Errors
    ///
    /// `SensorUnavailable` when no usable thermal zone exists.
    pub fn from_config(config: &HearthConfig) -> Result<Self> {
        let ambient = SysfsThermal::ambient(&config.thermal_root, config.ambient_zone)?;
        let cpu = SysfsThermal::cpu(&config.thermal_root, config.cpu_zone)?;
        Ok(Self {
            ambient: Arc::new(ambient),
            cpu: Arc::new(cpu),
            power: Arc::new(PowerProbe::from_config(config)),
        })
    }
}

impl std::fmt::Debug for SensorSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorSuite")
            .field("ambient", &self.ambient.describe())
            .field("cpu", &self.cpu.describe())
            .field("power", &self.power.method())
            .finish()
    }
}

/// Time since boot.
pub fn uptime() -> Duration {
    Duration::from_secs(sysinfo::System::uptime())
}
