//! # hearth
//!
//! **Heating an enclosure with the CPU it already has**
//!
//! A thermal controller for small Linux boxes in cold places. When the case
//! gets too cold, hearth burns surplus CPU on pinned heater threads until it is
//! warm again. Alongside, it estimates the ambient temperature without an
//! ambient sensor, from the CPU temperature and the power being dissipated.
//!
//! ## Features
//!
//! - **Hysteresis Control**: `IDLE` / `HEATING_AUTO` / `HEATING_MANUAL` with a
//!   min/target band and a manual override that always wins
//! - **Pinned Heaters**: one duty-cycled heater thread per CPU in a cpuset,
//!   respawned if it dies, always torn down on shutdown
//! - **Sensorless Ambient**: a linear thermal model `T_amb = T_cpu - (P·R_th + b)`
//!   fitted by a calibration load ladder and persisted per host
//! - **Cold-Start Correction**: a one-shot bias nudge right after boot
//! - **Cooldown Validation**: Newton cooling fit to cross-check a model
//! - **Flexible Configuration**: files (TOML/YAML/JSON), environment variables,
//!   code, or CLI arguments
//!
//! ## Quick Start
//!
//! ```ignore
//! use hearth::HearthBuilder;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = HearthBuilder::new()
//!         .file("/etc/hearth/hearth.toml")
//!         .env_prefix("HEARTH")
//!         .thresholds(0.0, 5.0)
//!         .build()?;
//!
//!     let handle = runtime.spawn_controller();
//!
//!     runtime.block_on(async {
//!         tokio::signal::ctrl_c().await
//!     })?;
//!
//!     // Stops the loop and every heater
//!     runtime.block_until_idle();
//!     runtime.block_on(handle)??;
//!     Ok(())
//! }
//! ```
//!
//! ## Ambient Estimation
//!
//! ```ignore
//! // Once per host: walk the load ladder (takes a while)
//! let calibrated = runtime.block_on(runtime.calibrate())?;
//! println!("R_th = {:.3} °C/W", calibrated.model.thermal_resistance);
//!
//! // Any time afterwards
//! let report = runtime.block_on(runtime.estimate_now())?;
//! println!("{:.1} ± {:.1} °C", report.estimate.ambient_celsius,
//!     report.estimate.uncertainty_celsius);
//! ```
//!
//! ## Configuration
//!
//! Configuration sources are merged in order (later sources override earlier):
//!
//! 1. Default values
//! 2. Config files (via `.file()`)
//! 3. Environment variables (via `.env_prefix()`)
//! 4. Programmatic overrides
//! 5. CLI arguments (via `.with_cli_args()`)
//!
//! ### Config File Example (TOML)
//!
//! ```toml
//! min_threshold_c = 0.0
//! target_threshold_c = 5.0
//! check_interval_s = 10
//! cpuset = "0-3"
//! override_path = "/run/hearth/override"
//!
//! [calibration]
//! load_levels = [0.0, 0.15, 0.30, 0.50, 0.70, 0.85, 1.0, 0.40]
//! settle_window_s = 180
//! ```
//!
//! ### Environment Variables
//!
//! With `.env_prefix("HEARTH")`:
//! - `HEARTH_MIN_THRESHOLD_C=-2`
//! - `HEARTH_CPUSET=0-3`
//! - `HEARTH_CALIBRATION__SETTLE_WINDOW_S=120`
//!
//! ### CLI Arguments
//!
//! ```ignore
//! use clap::Parser;
//! use hearth::{HearthArgs, HearthBuilder};
//!
//! #[derive(Parser)]
//! struct MyArgs {
//!     #[command(flatten)]
//!     hearth: HearthArgs,
//! }
//!
//! let args = MyArgs::parse();
//! let runtime = HearthBuilder::new()
//!     .file("config.toml")
//!     .with_cli_args(&args.hearth)
//!     .build()?;
//! ```

pub mod affinity;
pub mod builder;
pub mod config;
pub mod control;
pub mod cpuset;
pub mod error;
pub mod estimator;
pub mod events;
pub mod metrics;
pub mod pool;
pub mod runtime;
pub mod sensors;
pub mod signal;

pub use builder::{HearthArgs, HearthBuilder};
pub use config::HearthConfig;
pub use control::{Controller, HeatingState, Thermostat, Transition, TransitionCause};
pub use error::{HearthError, Result};
pub use estimator::{
    AmbientEstimate, AmbientEstimator, CalibrationModel, CalibrationPlan, CalibrationSample,
    CooldownFit, CooldownPoint,
};
pub use events::{ChannelSink, EventSink, ThermalEvent, TracingSink};
pub use metrics::HearthMetrics;
pub use pool::{DutyCycle, HeaterPool, PoolLease};
pub use runtime::{AmbientReport, AmbientSummary, HearthRuntime};
pub use sensors::{PowerMethod, PowerSample, SensorSuite, ThermalReading};
pub use signal::{OverrideChannel, OverrideSignal};
