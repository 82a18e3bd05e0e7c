//! sysfs thermal zones.
//!
//! Each zone is a directory `thermal_zoneN` holding a `type` label and a `temp`
//! value in millidegrees Celsius.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{TemperatureSource, ThermalReading};
use crate::error::{HearthError, Result};

/// Zone type fragments that identify a CPU package sensor.
const CPU_ZONE_TYPES: &[&str] = &["x86_pkg_temp", "cpu", "soc", "package"];

/// Zones tried in order for the CPU channel when no type matches.
const CPU_FALLBACK_ZONES: &[usize] = &[1, 2, 3];

/// One `thermal_zoneN` directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThermalZone {
    pub index: usize,
    pub kind: String,
    pub path: PathBuf,
}

impl ThermalZone {
    /// Open zone `index` under `root`.
    pub fn open(root: &Path, index: usize) -> Self {
        let path = root.join(format!("thermal_zone{}", index));
        let kind = fs::read_to_string(path.join("type"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        Self { index, kind, path }
    }

    /// Identifier used in readings, e.g. `thermal_zone0(acpitz)`.
    pub fn id(&self) -> String {
        if self.kind.is_empty() {
            format!("thermal_zone{}", self.index)
        } else {
            format!("thermal_zone{}({})", self.index, self.kind)
        }
    }

    /// Current temperature in °C.
    pub fn read_celsius(&self) -> Result<f64> {
        let raw = fs::read_to_string(self.path.join("temp")).map_err(|e| {
            HearthError::SensorUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        parse_millidegrees(&raw).ok_or_else(|| {
            HearthError::SensorUnavailable(format!(
                "{}: unparseable temperature {:?}",
                self.path.display(),
                raw.trim()
            ))
        })
    }
}

/// Parse a sysfs millidegree value.
pub fn parse_millidegrees(raw: &str) -> Option<f64> {
    raw.trim().parse::<i64>().ok().map(|m| m as f64 / 1000.0)
}

/// Every `thermal_zoneN` under `root`, ordered by index.
pub fn discover_zones(root: &Path) -> Vec<ThermalZone> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut indices: Vec<usize> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("thermal_zone"))
                .and_then(|n| n.parse().ok())
        })
        .collect();
    indices.sort_unstable();
    indices
        .into_iter()
        .map(|index| ThermalZone::open(root, index))
        .collect()
}

/// A temperature channel backed by one thermal zone.
#[derive(Debug, Clone)]
pub struct SysfsThermal {
    zone: ThermalZone,
}

impl SysfsThermal {
    /// Use an explicit zone.
    pub fn new(zone: ThermalZone) -> Self {
        Self { zone }
    }

    /// Case/ambient channel: `explicit` if given, else the first zone typed
    /// `acpi`, else the coldest readable zone.
    pub fn ambient(root: &Path, explicit: Option<usize>) -> Result<Self> {
        if let Some(index) = explicit {
            return Ok(Self::new(ThermalZone::open(root, index)));
        }
        let zones = discover_zones(root);
        if let Some(zone) = zones
            .iter()
            .find(|z| z.kind.to_lowercase().contains("acpi") && z.read_celsius().is_ok())
        {
            debug!(zone = %zone.id(), "ambient channel: acpi zone");
            return Ok(Self::new(zone.clone()));
        }
        zones
            .into_iter()
            .filter_map(|z| z.read_celsius().ok().map(|t| (t, z)))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(t, zone)| {
                debug!(zone = %zone.id(), celsius = t, "ambient channel: coldest zone");
                Self::new(zone)
            })
            .ok_or_else(|| no_zones(root))
    }

    /// CPU channel: `explicit` if given, else a zone typed as a CPU package,
    /// else zones 1-3 in order, else any readable zone.
    pub fn cpu(root: &Path, explicit: Option<usize>) -> Result<Self> {
        if let Some(index) = explicit {
            return Ok(Self::new(ThermalZone::open(root, index)));
        }
        let zones = discover_zones(root);
        let readable = |z: &&ThermalZone| z.read_celsius().is_ok();

        let by_type = zones.iter().filter(readable).find(|z| {
            let kind = z.kind.to_lowercase();
            CPU_ZONE_TYPES.iter().any(|t| kind.contains(t))
        });
        let by_index = || {
            CPU_FALLBACK_ZONES.iter().find_map(|&i| {
                zones
                    .iter()
                    .filter(readable)
                    .find(|z| z.index == i)
            })
        };

        by_type
            .or_else(by_index)
            .or_else(|| zones.iter().find(readable))
            .map(|zone| {
                debug!(zone = %zone.id(), "cpu channel selected");
                Self::new(zone.clone())
            })
            .ok_or_else(|| no_zones(root))
    }

    /// The backing zone.
    pub fn zone(&self) -> &ThermalZone {
        &self.zone
    }
}

impl TemperatureSource for SysfsThermal {
    fn read(&self) -> Result<ThermalReading> {
        let celsius = self.zone.read_celsius()?;
        Ok(ThermalReading::now(self.zone.id(), celsius))
    }

    fn describe(&self) -> String {
        self.zone.id()
    }
}

fn no_zones(root: &Path) -> HearthError {
    HearthError::SensorUnavailable(format!(
        "no readable thermal zone under {}",
        root.display()
    ))
}
