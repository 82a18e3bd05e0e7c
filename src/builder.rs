//! Builder pattern for constructing hearth runtimes.
//!
//! The builder supports multiple configuration sources using figment:
//! - Default values
//! - Config files (TOML, YAML, JSON)
//! - Environment variables
//! - Programmatic overrides
//! - CLI arguments via clap

use crate::config::HearthConfig;
use crate::error::Result;
use crate::estimator::CalibrationStore;
use crate::events::EventSink;
use crate::pool::HeaterPool;
use crate::runtime::{HearthRuntime, RuntimeParts};
use crate::sensors::SensorSuite;
use crate::signal::OverrideChannel;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use prometheus::Registry;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Builder for constructing a `HearthRuntime`.
///
/// Configuration sources are merged in the following order (later sources override earlier):
/// 1. Default values
/// 2. Config files (in order added)
/// 3. Environment variables
/// 4. Programmatic overrides
///
/// Sensors, the override channel, the calibration store and the heater pool
/// are derived from the configuration unless injected.
///
/// # Examples
///
/// ```ignore
/// use hearth::HearthBuilder;
///
/// let runtime = HearthBuilder::new()
///     .file("hearth.toml")
///     .env_prefix("HEARTH")
///     .thresholds(0.0, 5.0)
///     .build()?;
/// ```
pub struct HearthBuilder {
    figment: Figment,
    prometheus_registry: Option<Registry>,
    parts: RuntimeParts,
}

impl Default for HearthBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HearthBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HearthBuilder")
            .field("figment", &self.figment)
            .field(
                "prometheus_registry",
                &self.prometheus_registry.as_ref().map(|_| "<Registry>"),
            )
            .field("sensors", &self.parts.sensors)
            .field("sinks", &self.parts.sinks.len())
            .finish_non_exhaustive()
    }
}

impl HearthBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            figment: Figment::from(Serialized::defaults(HearthConfig::default())),
            prometheus_registry: None,
            parts: RuntimeParts::default(),
        }
    }

    /// Add a configuration file.
    ///
    /// The file format is determined by extension:
    /// - `.toml` -> TOML
    /// - `.yaml`, `.yml` -> YAML
    /// - `.json` -> JSON
    ///
    /// Missing files are silently ignored.
    pub fn file(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        self.figment = match ext {
            "toml" => self.figment.merge(Toml::file(path)),
            "yaml" | "yml" => self.figment.merge(Yaml::file(path)),
            "json" => self.figment.merge(Json::file(path)),
            _ => self.figment.merge(Toml::file(path)),
        };
        self
    }

    /// Add environment variables with the given prefix.
    ///
    /// With prefix `HEARTH`, `HEARTH_MIN_THRESHOLD_C=2` sets
    /// `min_threshold_c`. Nested keys use a double underscore:
    /// `HEARTH_CALIBRATION__SETTLE_WINDOW_S=120`.
    pub fn env_prefix(mut self, prefix: &str) -> Self {
        let prefix = format!("{}_", prefix.trim_end_matches('_'));
        self.figment = self.figment.merge(Env::prefixed(&prefix).split("__"));
        self
    }

    /// Set the thread name and metric prefix.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("prefix", prefix.into()));
        self
    }

    /// Restrict heaters to a CPU set (e.g., "0-3").
    pub fn cpuset(mut self, cpuset: impl Into<String>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("cpuset", cpuset.into()));
        self
    }

    /// Set the hysteresis band in °C.
    pub fn thresholds(mut self, min_c: f64, target_c: f64) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("min_threshold_c", min_c))
            .merge(Serialized::default("target_threshold_c", target_c));
        self
    }

    /// Set the control tick period in seconds.
    pub fn check_interval(mut self, seconds: f64) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("check_interval_s", seconds));
        self
    }

    /// Set the override flag file.
    pub fn override_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("override_path", path.into()));
        self
    }

    /// Set the directory holding the calibration record.
    pub fn calibration_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("calibration_dir", dir.into()));
        self
    }

    /// Set a Prometheus registry for metrics exposition.
    ///
    /// Metrics are always collected; registering them makes them visible
    /// to a scrape endpoint owned by the caller.
    pub fn prometheus_registry(mut self, registry: Registry) -> Self {
        self.prometheus_registry = Some(registry);
        self
    }

    /// Use these sensors instead of the sysfs channels.
    pub fn sensors(mut self, sensors: SensorSuite) -> Self {
        self.parts.sensors = Some(sensors);
        self
    }

    /// Use this override channel instead of the flag file.
    pub fn override_channel(mut self, channel: Arc<dyn OverrideChannel>) -> Self {
        self.parts.overrides = Some(channel);
        self
    }

    /// Use this calibration store instead of the per-host JSON file.
    pub fn calibration_store(mut self, store: Arc<dyn CalibrationStore>) -> Self {
        self.parts.store = Some(store);
        self
    }

    /// Use a prebuilt heater pool instead of one over the configured cpuset.
    pub fn heater_pool(mut self, pool: HeaterPool) -> Self {
        self.parts.pool = Some(pool);
        self
    }

    /// Publish events to an extra sink. Structured logging is always on.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.parts.sinks.push(sink);
        self
    }

    /// Merge CLI arguments into the configuration.
    pub fn with_cli_args(mut self, args: &HearthArgs) -> Self {
        if let Some(config) = &args.hearth_config {
            self = self.file(config);
        }
        if let Some(prefix) = &args.hearth_prefix {
            self = self.prefix(prefix.clone());
        }
        if let Some(cpuset) = &args.hearth_cpuset {
            self = self.cpuset(cpuset.clone());
        }
        if let Some(min) = args.hearth_min_threshold {
            self.figment = self
                .figment
                .merge(Serialized::default("min_threshold_c", min));
        }
        if let Some(target) = args.hearth_target_threshold {
            self.figment = self
                .figment
                .merge(Serialized::default("target_threshold_c", target));
        }
        if let Some(interval) = args.hearth_check_interval {
            self = self.check_interval(interval);
        }
        if let Some(path) = &args.hearth_override_file {
            self = self.override_path(path.clone());
        }
        if let Some(dir) = &args.hearth_calibration_dir {
            self = self.calibration_dir(dir.clone());
        }
        self
    }

    /// Extract and validate the merged configuration.
    pub fn build_config(&self) -> Result<HearthConfig> {
        let config: HearthConfig = self.figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the runtime.
    pub fn build(self) -> Result<HearthRuntime> {
        let config = self.build_config()?;
        let mut parts = self.parts;
        parts.registry = self.prometheus_registry;
        HearthRuntime::from_parts(config, parts)
    }
}

/// CLI arguments for hearth configuration.
///
/// Use with `#[command(flatten)]` in your clap parser.
#[derive(Debug, Default, Clone, clap::Args)]
pub struct HearthArgs {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long)]
    pub hearth_config: Option<PathBuf>,

    /// Thread name and metric prefix
    #[arg(long)]
    pub hearth_prefix: Option<String>,

    /// CPU set for heaters (e.g., "0-3")
    #[arg(long)]
    pub hearth_cpuset: Option<String>,

    /// Start heating below this case temperature (°C)
    #[arg(long, allow_hyphen_values = true)]
    pub hearth_min_threshold: Option<f64>,

    /// Stop heating at or above this case temperature (°C)
    #[arg(long, allow_hyphen_values = true)]
    pub hearth_target_threshold: Option<f64>,

    /// Control tick period in seconds
    #[arg(long)]
    pub hearth_check_interval: Option<f64>,

    /// Override flag file
    #[arg(long)]
    pub hearth_override_file: Option<PathBuf>,

    /// Directory holding the calibration record
    #[arg(long)]
    pub hearth_calibration_dir: Option<PathBuf>,
}
