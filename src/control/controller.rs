//! The control loop: read, decide, actuate.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::thermostat::{Thermostat, ThermostatSettings};
use super::{HeatingState, Transition};
use crate::config::HearthConfig;
use crate::error::{HearthError, Result};
use crate::estimator::{AmbientEstimate, AmbientEstimator};
use crate::events::{EventSink, ThermalEvent};
use crate::metrics::HearthMetrics;
use crate::pool::HeaterPool;
use crate::sensors::{self, PowerSample, PowerSource, SensorSuite, TemperatureSource};
use crate::signal::{OverrideChannel, OverrideSignal};

/// What one tick observed and did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub state: HeatingState,
    pub temperature: Option<f64>,
    pub signal: OverrideSignal,
    pub transition: Option<Transition>,
    pub active_workers: usize,
}

/// Drives the heater pool from the thermostat's decisions.
pub struct Controller {
    config: Arc<HearthConfig>,
    thermostat: Thermostat,
    pool: HeaterPool,
    sensors: SensorSuite,
    overrides: Arc<dyn OverrideChannel>,
    sink: Arc<dyn EventSink>,
    metrics: HearthMetrics,
    estimator: Option<Arc<Mutex<AmbientEstimator>>>,
}

impl Controller {
    pub fn new(
        config: Arc<HearthConfig>,
        pool: HeaterPool,
        sensors: SensorSuite,
        overrides: Arc<dyn OverrideChannel>,
        sink: Arc<dyn EventSink>,
        metrics: HearthMetrics,
    ) -> Self {
        Self {
            thermostat: Thermostat::new(ThermostatSettings::from_config(&config)),
            config,
            pool,
            sensors,
            overrides,
            sink,
            metrics,
            estimator: None,
        }
    }

    /// Refresh an ambient estimate on each tick when diagnostics are enabled.
    pub fn with_estimator(mut self, estimator: Arc<Mutex<AmbientEstimator>>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn state(&self) -> HeatingState {
        self.thermostat.state()
    }

    pub fn pool(&self) -> &HeaterPool {
        &self.pool
    }

    /// One control cycle.
    ///
    /// Never fails: sensor, pool and estimator errors are reported through
    /// events, metrics and logs, and the next tick tries again.
    pub async fn tick(&mut self) -> TickOutcome {
        let temperature = match self.read_case().await {
            Ok(t) => {
                self.metrics.record_case_temperature(t);
                Some(t)
            }
            Err(e) => {
                self.metrics.record_sensor_failure();
                self.sink.emit(&ThermalEvent::SensorFault {
                    consecutive: self.thermostat.consecutive_failures() + 1,
                    error: e.to_string(),
                });
                None
            }
        };

        let signal = self.read_override().await;
        let calibration_active = self.pool.is_leased();
        if calibration_active && signal == OverrideSignal::ForceOff && self.pool.revoke_lease() {
            info!("manual override off, cancelling calibration run");
        }

        let transition = self.thermostat.step(temperature, signal, calibration_active);
        if let Some(t) = &transition {
            self.apply(t);
        }
        if self.thermostat.state().is_heating() {
            self.maintain();
        }

        let active_workers = self.pool.active_workers();
        self.metrics.set_active_workers(active_workers);
        self.metrics.set_state(self.thermostat.state());

        if self.config.ambient_diagnostics {
            self.refresh_estimate().await;
        }

        TickOutcome {
            state: self.thermostat.state(),
            temperature,
            signal,
            transition,
            active_workers,
        }
    }

    /// Tick every `check_interval` until `cancel` fires, then stop every heater.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_s = self.config.check_interval_s,
            min_c = self.config.min_threshold_c,
            target_c = self.config.target_threshold_c,
            heaters = self.pool.capacity(),
            "control loop started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let outcome = self.tick().await;
                    debug!(
                        state = %outcome.state,
                        temperature = ?outcome.temperature,
                        workers = outcome.active_workers,
                        "tick"
                    );
                }
            }
        }

        let stopped = self.pool.teardown();
        self.metrics.set_active_workers(0);
        info!(stopped, "control loop stopped");
        Ok(())
    }

    async fn read_case(&self) -> Result<f64> {
        read_with_timeout(Arc::clone(&self.sensors.ambient), self.config.sensor_timeout()).await
    }

    /// A slow or hung override channel counts as no override.
    async fn read_override(&self) -> OverrideSignal {
        let overrides = Arc::clone(&self.overrides);
        let timeout = self.config.sensor_timeout();
        match bounded("override channel", timeout, move || Ok(overrides.current())).await {
            Ok(signal) => signal,
            Err(e) => {
                debug!(%e, "override unavailable, treating as absent");
                OverrideSignal::Absent
            }
        }
    }

    fn apply(&mut self, transition: &Transition) {
        if transition.starts_heating() {
            match self.pool.heat() {
                Ok(workers) => debug!(workers, "heaters started"),
                Err(e) => self.worker_fault(e),
            }
        } else if transition.stops_heating() {
            self.pool.teardown();
        }
        self.metrics.record_transition(transition.to);
        self.sink.emit(&ThermalEvent::Transition(*transition));
    }

    /// Keep the pool heating while the thermostat says so.
    fn maintain(&mut self) {
        if !self.pool.is_heating() {
            if self.pool.is_leased() {
                return;
            }
            warn!(state = %self.thermostat.state(), "heater pool idle while heating, restarting");
            match self.pool.heat() {
                Ok(workers) => debug!(workers, "heaters restarted"),
                Err(e) => self.worker_fault(e),
            }
            return;
        }
        match self.pool.maintain() {
            Ok(respawned) => self.metrics.record_respawns(respawned),
            Err(e) => self.worker_fault(e),
        }
    }

    fn worker_fault(&self, e: HearthError) {
        if let HearthError::WorkerSpawnFailure { .. } = e {
            self.metrics.record_spawn_failure();
        }
        self.sink.emit(&ThermalEvent::WorkerFault {
            error: e.to_string(),
        });
    }

    /// Best effort: failures are logged and dropped.
    async fn refresh_estimate(&self) {
        let Some(estimator) = self.estimator.clone() else {
            return;
        };
        let sensors = self.sensors.clone();
        let job = move || {
            if !estimator.lock().is_calibrated() {
                return Ok(None);
            }
            let cpu = sensors.cpu.read()?;
            let power = sensors.power.sample()?;
            let estimate = estimator.lock().estimate_with_cold_start(
                cpu.temperature_celsius,
                power.watts,
                sensors::uptime(),
            )?;
            Ok(Some((estimate, cpu.temperature_celsius, power)))
        };

        match bounded("ambient estimate", self.config.sensor_timeout() * 2, job).await {
            Ok(Some((estimate, cpu_temp, power))) => self.publish_estimate(estimate, cpu_temp, power),
            Ok(None) => {}
            Err(e) => debug!(%e, "ambient estimate unavailable"),
        }
    }

    fn publish_estimate(&self, estimate: AmbientEstimate, cpu_temp: f64, power: PowerSample) {
        self.metrics
            .record_estimate(estimate.ambient_celsius, estimate.uncertainty_celsius);
        self.sink.emit(&ThermalEvent::AmbientEstimate {
            estimate,
            cpu_temp,
            power_watts: power.watts,
            power_method: power.method,
        });
    }
}

/// Run blocking I/O on the blocking pool with an upper bound on latency.
///
/// A job that outlives `timeout` keeps its blocking thread but its result is
/// discarded.
pub(crate) async fn bounded<T, F>(
    what: impl std::fmt::Display,
    timeout: Duration,
    job: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(job)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(HearthError::SensorUnavailable(format!(
            "{} task failed: {}",
            what, e
        ))),
        Err(_) => Err(HearthError::SensorUnavailable(format!(
            "{} timed out after {:?}",
            what, timeout
        ))),
    }
}

/// Read a temperature on the blocking pool with an upper bound on latency.
pub(crate) async fn read_with_timeout(
    source: Arc<dyn TemperatureSource>,
    timeout: Duration,
) -> Result<f64> {
    let describe = source.describe();
    let reading = bounded(&describe, timeout, move || source.read()).await?;
    if reading.temperature_celsius.is_finite() {
        Ok(reading.temperature_celsius)
    } else {
        Err(HearthError::SensorUnavailable(format!(
            "{} returned {}",
            describe, reading.temperature_celsius
        )))
    }
}

/// Sample power on the blocking pool with an upper bound on latency.
pub(crate) async fn sample_with_timeout(
    source: Arc<dyn PowerSource>,
    timeout: Duration,
) -> Result<PowerSample> {
    let method = source.method();
    bounded(format!("{} power", method), timeout, move || source.sample()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelSink;
    use crate::pool::{DutyCycle, PoolSettings};
    use crate::sensors::{FixedPower, SharedTemperature, ThermalReading};
    use crate::signal::SharedOverride;

    struct Harness {
        controller: Controller,
        case: SharedTemperature,
        overrides: SharedOverride,
        events: tokio::sync::mpsc::UnboundedReceiver<ThermalEvent>,
    }

    fn harness(config: HearthConfig) -> Harness {
        let case = SharedTemperature::new("case");
        let cpu = SharedTemperature::new("cpu");
        cpu.set(Some(40.0));
        let overrides = SharedOverride::new();
        let (sink, events) = ChannelSink::new();
        let pool = HeaterPool::new(
            vec![0, 0],
            PoolSettings {
                prefix: "ctl".to_string(),
                duty: DutyCycle::new(0.1, Duration::from_millis(20)),
                pin: false,
                respawn_limit: 1,
            },
        )
        .unwrap();
        let sensors = SensorSuite {
            ambient: Arc::new(case.clone()),
            cpu: Arc::new(cpu),
            power: Arc::new(FixedPower(10.0)),
        };
        let controller = Controller::new(
            Arc::new(config),
            pool,
            sensors,
            Arc::new(overrides.clone()),
            Arc::new(sink),
            HearthMetrics::new(),
        );
        Harness {
            controller,
            case,
            overrides,
            events,
        }
    }

    fn config() -> HearthConfig {
        HearthConfig {
            max_sensor_failures: 2,
            ambient_diagnostics: false,
            ..HearthConfig::default()
        }
    }

    #[tokio::test]
    async fn test_heating_follows_thermostat() {
        let mut h = harness(config());
        h.case.set(Some(-2.0));
        let outcome = h.controller.tick().await;
        assert_eq!(outcome.state, HeatingState::HeatingAuto);
        assert_eq!(outcome.active_workers, 2);
        assert!(outcome.transition.is_some());

        h.case.set(Some(6.0));
        let outcome = h.controller.tick().await;
        assert_eq!(outcome.state, HeatingState::Idle);
        assert_eq!(outcome.active_workers, 0);
        assert_eq!(h.controller.pool().active_workers(), 0);

        let mut transitions = 0;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, ThermalEvent::Transition(_)) {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 2);
    }

    #[tokio::test]
    async fn test_sensor_failure_holds_then_failsafe() {
        let mut h = harness(config());
        h.case.set(Some(-2.0));
        h.controller.tick().await;

        h.case.set(None);
        let outcome = h.controller.tick().await;
        assert_eq!(outcome.state, HeatingState::HeatingAuto);
        assert_eq!(outcome.temperature, None);
        assert_eq!(outcome.active_workers, 2);

        let outcome = h.controller.tick().await;
        assert_eq!(outcome.state, HeatingState::Idle);
        assert_eq!(outcome.active_workers, 0);

        let faults = std::iter::from_fn(|| h.events.try_recv().ok())
            .filter(|e| matches!(e, ThermalEvent::SensorFault { .. }))
            .count();
        assert_eq!(faults, 2);
    }

    #[tokio::test]
    async fn test_force_off_revokes_calibration_lease() {
        let mut h = harness(config());
        h.case.set(Some(-10.0));
        let lease = h.controller.pool().try_lease().unwrap();

        let outcome = h.controller.tick().await;
        assert_eq!(outcome.state, HeatingState::Idle);
        assert!(!lease.is_revoked());

        h.overrides.set(OverrideSignal::ForceOff);
        h.controller.tick().await;
        assert!(lease.is_revoked());
    }

    #[tokio::test]
    async fn test_idle_pool_restarted_while_heating() {
        let mut h = harness(config());
        h.case.set(Some(-2.0));
        h.controller.tick().await;
        assert!(matches!(
            h.controller.pool().try_lease(),
            Err(HearthError::PoolBusy(_))
        ));

        // Pool lost its heaters behind the thermostat's back
        h.controller.pool().teardown();
        let outcome = h.controller.tick().await;
        assert_eq!(outcome.state, HeatingState::HeatingAuto);
        assert_eq!(outcome.active_workers, 2);
        assert!(h.controller.pool().is_heating());
        h.controller.pool().teardown();
    }

    #[tokio::test]
    async fn test_hung_override_reads_as_absent() {
        struct Hung;
        impl OverrideChannel for Hung {
            fn current(&self) -> OverrideSignal {
                std::thread::sleep(Duration::from_millis(300));
                OverrideSignal::ForceOn
            }
        }

        let mut h = harness(HearthConfig {
            sensor_timeout_ms: 20,
            ..config()
        });
        h.controller.overrides = Arc::new(Hung);
        h.case.set(Some(10.0));
        let outcome = h.controller.tick().await;
        assert_eq!(outcome.signal, OverrideSignal::Absent);
        assert_eq!(outcome.state, HeatingState::Idle);
        assert_eq!(outcome.active_workers, 0);
    }

    #[tokio::test]
    async fn test_busy_estimator_does_not_stall_tick() {
        use crate::estimator::{EstimatorSettings, MemoryStore};

        let estimator = Arc::new(Mutex::new(AmbientEstimator::new(
            Arc::new(MemoryStore::new()),
            EstimatorSettings::default(),
        )));
        let h = harness(HearthConfig {
            ambient_diagnostics: true,
            sensor_timeout_ms: 20,
            ..config()
        });
        let mut controller = h.controller.with_estimator(Arc::clone(&estimator));
        h.case.set(Some(10.0));

        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _guard = estimator.lock();
            held_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(500));
        });
        held_rx.recv().unwrap();

        let started = std::time::Instant::now();
        let outcome = controller.tick().await;
        assert_eq!(outcome.state, HeatingState::Idle);
        assert!(started.elapsed() < Duration::from_millis(300));
        holder.join().unwrap();
    }

    #[tokio::test]
    async fn test_read_timeout_is_sensor_unavailable() {
        struct Slow;
        impl TemperatureSource for Slow {
            fn read(&self) -> Result<ThermalReading> {
                std::thread::sleep(Duration::from_millis(300));
                Ok(ThermalReading::now("slow", 1.0))
            }
            fn describe(&self) -> String {
                "slow".to_string()
            }
        }

        let err = read_with_timeout(Arc::new(Slow), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, HearthError::SensorUnavailable(msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel_and_tears_down() {
        let h = harness(HearthConfig {
            check_interval_s: 0.02,
            ..config()
        });
        h.case.set(Some(-5.0));
        let mut controller = h.controller;
        let cancel = CancellationToken::new();
        let pool = controller.pool().clone();

        let stopper = cancel.clone();
        let handle = tokio::spawn(async move {
            controller.run(stopper).await.unwrap();
            controller
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.active_workers(), 2);
        cancel.cancel();
        let controller = handle.await.unwrap();

        assert_eq!(controller.state(), HeatingState::HeatingAuto);
        assert_eq!(pool.active_workers(), 0);
    }
}
