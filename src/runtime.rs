//! Hearth runtime.
//!
//! The runtime owns everything a running controller needs: a small tokio
//! runtime for the control loop, the heater pool, the sensor channels, the
//! ambient estimator, metrics and event sinks.
//!
//! # Thread Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      HearthRuntime                       │
//! │  config: Arc<HearthConfig>   estimator: Arc<Mutex<..>>   │
//! │  sinks: SinkSet              shutdown: CancellationToken │
//! └──────────────────────────────────────────────────────────┘
//!          │ control loop, calibration        │ heat()/apply_load()
//!          ▼                                  ▼
//! ┌─────────────────────┐          ┌─────────────────────────┐
//! │   Tokio Workers     │          │   Heater threads        │
//! │  {prefix}-tokio-NN  │          │  {prefix}-heater-NNNN   │
//! │  (+ blocking pool   │          │  pinned one per CPU     │
//! │   for sensor I/O)   │          │                         │
//! └─────────────────────┘          └─────────────────────────┘
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::HearthConfig;
use crate::control::Controller;
use crate::cpuset::format_cpuset;
use crate::error::{HearthError, Result};
use crate::estimator::{
    AmbientEstimate, AmbientEstimator, Calibrated, CalibrationProcedure, CalibrationSample,
    CalibrationStore, CooldownFit, CooldownPoint, EstimatorSettings, JsonFileStore,
};
use crate::events::{EventSink, SinkSet, ThermalEvent, TracingSink};
use crate::metrics::HearthMetrics;
use crate::pool::HeaterPool;
use crate::sensors::{self, PowerSample, SensorSuite};
use crate::signal::{FileOverride, OverrideChannel};

/// Tokio workers; the control loop needs little, sensor reads go to the
/// blocking pool.
const TOKIO_WORKERS: usize = 2;

/// Collaborators that replace the defaults derived from configuration.
#[derive(Default)]
pub(crate) struct RuntimeParts {
    pub sensors: Option<SensorSuite>,
    pub overrides: Option<Arc<dyn OverrideChannel>>,
    pub store: Option<Arc<dyn CalibrationStore>>,
    pub sinks: Vec<Arc<dyn EventSink>>,
    pub pool: Option<HeaterPool>,
    pub registry: Option<Registry>,
}

/// A single ambient reading with the inputs that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct AmbientReport {
    pub estimate: AmbientEstimate,
    pub cpu_temp: f64,
    pub power: PowerSample,
}

/// Min/max/mean of a series of ambient estimates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmbientSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl AmbientSummary {
    /// `None` for an empty series.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let (min, max, sum) = values.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(min, max, sum), &v| (min.min(v), max.max(v), sum + v),
        );
        Some(Self {
            count: values.len(),
            min,
            max,
            mean: sum / values.len() as f64,
        })
    }
}

/// The hearth runtime.
///
/// Cloning is cheap; clones share the same pool, estimator and shutdown
/// token.
///
/// # Examples
///
/// ```ignore
/// let runtime = HearthBuilder::new().file("hearth.toml").build()?;
///
/// runtime.block_on(async {
///     runtime.run().await
/// })?;
/// ```
#[derive(Clone)]
pub struct HearthRuntime {
    inner: Arc<HearthRuntimeInner>,
}

struct HearthRuntimeInner {
    config: Arc<HearthConfig>,
    tokio_runtime: tokio::runtime::Runtime,
    pool: HeaterPool,
    sensors: SensorSuite,
    overrides: Arc<dyn OverrideChannel>,
    estimator: Arc<Mutex<AmbientEstimator>>,
    metrics: HearthMetrics,
    sinks: Arc<SinkSet>,
    task_tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl HearthRuntime {
    /// Assemble a runtime. Typically called via `HearthBuilder::build()`.
    pub(crate) fn from_parts(config: HearthConfig, parts: RuntimeParts) -> Result<Self> {
        let config = Arc::new(config);

        let pool = match parts.pool {
            Some(pool) => pool,
            None => HeaterPool::from_config(&config)?,
        };
        let sensors = match parts.sensors {
            Some(sensors) => sensors,
            None => SensorSuite::from_config(&config)?,
        };
        let overrides = parts
            .overrides
            .unwrap_or_else(|| Arc::new(FileOverride::new(&config.override_path)));
        let store = parts.store.unwrap_or_else(|| {
            Arc::new(JsonFileStore::for_this_host(&config.calibration_dir))
        });

        let mut sinks = SinkSet::new().with(Arc::new(TracingSink));
        for sink in parts.sinks {
            sinks.push(sink);
        }

        let metrics = HearthMetrics::with_prefix(&config.prefix);
        if let Some(registry) = &parts.registry {
            if let Err(e) = metrics.register(registry) {
                warn!(%e, "failed to register prometheus metrics");
            }
        }

        let estimator = AmbientEstimator::new(store, EstimatorSettings::from_config(&config));
        let tokio_runtime = Self::build_tokio_runtime(&config.prefix)?;

        info!(
            prefix = %config.prefix,
            heaters = pool.capacity(),
            cpus = %format_cpuset(pool.cpus()),
            ambient = %sensors.ambient.describe(),
            cpu = %sensors.cpu.describe(),
            power = %sensors.power.method(),
            calibrated = estimator.is_calibrated(),
            "building hearth runtime"
        );

        Ok(Self {
            inner: Arc::new(HearthRuntimeInner {
                config,
                tokio_runtime,
                pool,
                sensors,
                overrides,
                estimator: Arc::new(Mutex::new(estimator)),
                metrics,
                sinks: Arc::new(sinks),
                task_tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    fn build_tokio_runtime(prefix: &str) -> Result<tokio::runtime::Runtime> {
        let name_prefix: Arc<str> = prefix.into();
        let thread_counter = Arc::new(AtomicUsize::new(0));
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(TOKIO_WORKERS)
            .thread_name_fn(move || {
                let id = thread_counter.fetch_add(1, Ordering::SeqCst);
                format!("{}-tokio-{:02}", name_prefix, id)
            })
            .enable_all()
            .build()?;
        Ok(runtime)
    }

    /// The validated configuration.
    pub fn config(&self) -> &HearthConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &HeaterPool {
        &self.inner.pool
    }

    pub fn sensors(&self) -> &SensorSuite {
        &self.inner.sensors
    }

    /// Shared handle to the estimator.
    pub fn estimator(&self) -> Arc<Mutex<AmbientEstimator>> {
        Arc::clone(&self.inner.estimator)
    }

    pub fn metrics(&self) -> &HearthMetrics {
        &self.inner.metrics
    }

    pub fn tokio_handle(&self) -> &tokio::runtime::Handle {
        self.inner.tokio_runtime.handle()
    }

    /// Cancelled by [`shutdown`](Self::shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Run a future to completion on the runtime.
    pub fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.inner.tokio_runtime.block_on(f)
    }

    /// Run the control loop until [`shutdown`](Self::shutdown) is called.
    ///
    /// Every heater is stopped before this returns.
    pub async fn run(&self) -> Result<()> {
        let mut controller = self.controller();
        controller.run(self.inner.shutdown.child_token()).await
    }

    /// Run the control loop as a tracked background task.
    pub fn spawn_controller(&self) -> tokio::task::JoinHandle<Result<()>> {
        let runtime = self.clone();
        self.inner
            .task_tracker
            .spawn_on(async move { runtime.run().await }, self.tokio_handle())
    }

    fn controller(&self) -> Controller {
        let inner = &self.inner;
        let sink: Arc<dyn EventSink> = inner.sinks.clone();
        Controller::new(
            Arc::clone(&inner.config),
            inner.pool.clone(),
            inner.sensors.clone(),
            Arc::clone(&inner.overrides),
            sink,
            inner.metrics.clone(),
        )
        .with_estimator(self.estimator())
    }

    /// Automatic calibration along the configured load ladder.
    ///
    /// # Errors
    ///
    /// `PoolBusy` while heating; `Cancelled` on shutdown or a manual
    /// override off; fit errors if the samples are unusable.
    pub async fn calibrate(&self) -> Result<Calibrated> {
        let inner = &self.inner;
        inner.metrics.record_calibration_run();
        let lease = inner.pool.try_lease()?;
        info!(
            levels = inner.config.calibration.load_levels.len(),
            settle_window_s = inner.config.calibration.settle_window_s,
            "automatic calibration started"
        );

        let sink: Arc<dyn EventSink> = inner.sinks.clone();
        let procedure =
            CalibrationProcedure::new(inner.config.calibration.clone(), inner.sensors.clone(), sink)
                .with_sensor_timeout(inner.config.sensor_timeout());
        let samples = procedure.collect(lease, &inner.shutdown).await?;
        self.calibrate_from_samples(&samples)
    }

    /// Calibrate from samples measured elsewhere.
    pub fn calibrate_from_samples(&self, samples: &[CalibrationSample]) -> Result<Calibrated> {
        let sinks = &self.inner.sinks;
        let result = self.inner.estimator.lock().calibrate(samples);
        match &result {
            Ok(outcome) => {
                if !outcome.persisted {
                    sinks.emit(&ThermalEvent::PersistenceFailure {
                        error: "calibration store rejected the model".to_string(),
                    });
                }
                sinks.emit(&ThermalEvent::CalibrationComplete {
                    model: outcome.model.clone(),
                    persisted: outcome.persisted,
                });
            }
            Err(e) => sinks.emit(&ThermalEvent::CalibrationAborted {
                reason: e.to_string(),
            }),
        }
        result
    }

    /// Take one ambient estimate from live sensors, with cold-start correction.
    pub async fn estimate_now(&self) -> Result<AmbientReport> {
        let sensors = self.inner.sensors.clone();
        let estimator = self.estimator();
        let report = tokio::task::spawn_blocking(move || {
            let cpu = sensors.cpu.read()?;
            let power = sensors.power.sample()?;
            let estimate = estimator.lock().estimate_with_cold_start(
                cpu.temperature_celsius,
                power.watts,
                sensors::uptime(),
            )?;
            Ok::<_, HearthError>(AmbientReport {
                estimate,
                cpu_temp: cpu.temperature_celsius,
                power,
            })
        })
        .await
        .map_err(|e| HearthError::SensorUnavailable(format!("estimate task failed: {}", e)))??;

        self.inner.metrics.record_estimate(
            report.estimate.ambient_celsius,
            report.estimate.uncertainty_celsius,
        );
        self.inner.sinks.emit(&ThermalEvent::AmbientEstimate {
            estimate: report.estimate,
            cpu_temp: report.cpu_temp,
            power_watts: report.power.watts,
            power_method: report.power.method,
        });
        Ok(report)
    }

    /// Estimate every `interval` for `duration` and summarise.
    ///
    /// Failed estimates are logged and skipped. Stops early on shutdown.
    pub async fn monitor(&self, duration: Duration, interval: Duration) -> Result<Option<AmbientSummary>> {
        let mut values = Vec::new();
        let deadline = tokio::time::Instant::now() + duration;
        let mut ticker = tokio::time::interval(interval);

        while tokio::time::Instant::now() < deadline {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.estimate_now().await {
                Ok(report) => values.push(report.estimate.ambient_celsius),
                Err(HearthError::NotCalibrated) => return Err(HearthError::NotCalibrated),
                Err(e) => warn!(%e, "estimate failed"),
            }
        }
        Ok(AmbientSummary::from_values(&values))
    }

    /// Record the CPU temperature every `interval` for `duration`.
    ///
    /// Heaters are not touched; run this with the pool idle. Stops early on
    /// shutdown and returns what was recorded.
    pub async fn record_cooldown(&self, duration: Duration, interval: Duration) -> Result<Vec<CooldownPoint>> {
        let start = tokio::time::Instant::now();
        let deadline = start + duration;
        let mut ticker = tokio::time::interval(interval);
        let mut series = Vec::new();

        while tokio::time::Instant::now() < deadline {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let cpu = Arc::clone(&self.inner.sensors.cpu);
            match tokio::task::spawn_blocking(move || cpu.read()).await {
                Ok(Ok(reading)) => series.push(CooldownPoint::new(
                    start.elapsed().as_secs_f64(),
                    reading.temperature_celsius,
                )),
                Ok(Err(e)) => warn!(%e, "cooldown read failed"),
                Err(e) => warn!(%e, "cooldown read task failed"),
            }
        }
        Ok(series)
    }

    /// Fit a recorded cooldown series against a reference ambient.
    pub fn fit_cooldown(&self, series: &[CooldownPoint], ambient_reference: f64) -> Result<CooldownFit> {
        self.inner.estimator.lock().fit_cooldown(series, ambient_reference)
    }

    /// Stop the control loop and any calibration run, and stop every heater.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.task_tracker.close();
        self.inner.pool.teardown();
    }

    /// Wait for tracked tasks after [`shutdown`](Self::shutdown).
    pub async fn wait_for_shutdown(&self) {
        self.inner.task_tracker.wait().await;
    }

    /// Shut down and block until tracked tasks finish.
    pub fn block_until_idle(&self) {
        self.shutdown();
        self.block_on(self.wait_for_shutdown());
    }
}

impl std::fmt::Debug for HearthRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HearthRuntime")
            .field("config", &self.inner.config)
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for HearthRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HearthRuntime[{}]: heaters({}, cpus={}) band=[{}, {}) °C",
            self.inner.config.prefix,
            self.inner.pool.capacity(),
            format_cpuset(self.inner.pool.cpus()),
            self.inner.config.min_threshold_c,
            self.inner.config.target_threshold_c,
        )
    }
}
