//! Metrics collection for the hearth controller.
//!
//! Metrics are always collected and can optionally be registered with a
//! Prometheus registry owned by the embedding application.
//!
//! # Available Metrics
//!
//! ## Gauges
//!
//! - `hearth_heating_state` - 0 idle, 1 automatic heating, 2 manual heating
//! - `hearth_active_workers` - Heater threads alive
//! - `hearth_case_temperature_celsius` - Last case sensor reading
//! - `hearth_estimated_ambient_celsius` - Last model-based ambient estimate
//! - `hearth_estimate_uncertainty_celsius` - Its one-sigma uncertainty
//!
//! ## Counters
//!
//! - `hearth_transitions` - Heating state transitions
//! - `hearth_sensor_failures` - Failed sensor reads
//! - `hearth_worker_respawns` - Heaters restarted after crashing
//! - `hearth_worker_spawn_failures` - Ticks that left heater slots empty
//! - `hearth_calibration_runs` - Automatic calibration runs
//!
//! # Example
//!
//! ```ignore
//! let registry = prometheus::Registry::new();
//! let runtime = HearthBuilder::new()
//!     .prometheus_registry(registry.clone())
//!     .build()?;
//!
//! let encoder = prometheus::TextEncoder::new();
//! let mut buffer = Vec::new();
//! encoder.encode(&registry.gather(), &mut buffer)?;
//! ```

mod prometheus;

pub use prometheus::HearthMetrics;
