//! Automatic calibration: step the heater pool through a load ladder and
//! record one sample per level once the CPU temperature settles.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::model::CalibrationSample;
use crate::config::MIN_CALIBRATION_SAMPLES;
use crate::control::{read_with_timeout, sample_with_timeout};
use crate::error::{HearthError, Result};
use crate::events::{EventSink, ThermalEvent};
use crate::pool::PoolLease;
use crate::sensors::SensorSuite;

/// Load ladder and settling rules of an automatic calibration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CalibrationPlan {
    /// Fractions of the heater capacity to hold, in order.
    #[serde(default = "default_load_levels")]
    pub load_levels: Vec<f64>,

    /// Span the CPU temperature must stay flat over (default: 180 s)
    #[serde(default = "default_settle_window")]
    pub settle_window_s: u64,

    /// Seconds between temperature polls while settling (default: 10)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_s: u64,

    /// Largest spread inside the window that counts as settled (default: 0.5 °C)
    #[serde(default = "default_settle_tolerance")]
    pub settle_tolerance_c: f64,

    /// Longest hold per level before sampling anyway (default: 900 s)
    #[serde(default = "default_max_hold")]
    pub max_hold_s: u64,
}

fn default_load_levels() -> Vec<f64> {
    vec![0.0, 0.15, 0.30, 0.50, 0.70, 0.85, 1.0, 0.40]
}

fn default_settle_window() -> u64 {
    180
}

fn default_poll_interval() -> u64 {
    10
}

fn default_settle_tolerance() -> f64 {
    0.5
}

fn default_max_hold() -> u64 {
    900
}

impl Default for CalibrationPlan {
    fn default() -> Self {
        Self {
            load_levels: default_load_levels(),
            settle_window_s: default_settle_window(),
            poll_interval_s: default_poll_interval(),
            settle_tolerance_c: default_settle_tolerance(),
            max_hold_s: default_max_hold(),
        }
    }
}

impl CalibrationPlan {
    /// # Errors
    ///
    /// `InvalidConfig` when the ladder cannot produce a usable calibration or
    /// the timing fields are inconsistent.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(HearthError::InvalidConfig(msg)) };

        if self.load_levels.len() < MIN_CALIBRATION_SAMPLES {
            return invalid(format!(
                "calibration.load_levels needs at least {} levels, got {}",
                MIN_CALIBRATION_SAMPLES,
                self.load_levels.len()
            ));
        }
        if let Some(bad) = self
            .load_levels
            .iter()
            .find(|l| !(0.0..=1.0).contains(*l))
        {
            return invalid(format!("calibration load level {} is outside [0, 1]", bad));
        }
        if self.poll_interval_s == 0 {
            return invalid("calibration.poll_interval_s must be non-zero".to_string());
        }
        if self.settle_window_s < self.poll_interval_s {
            return invalid(format!(
                "calibration.settle_window_s ({}) must cover at least one poll ({})",
                self.settle_window_s, self.poll_interval_s
            ));
        }
        if self.max_hold_s < self.settle_window_s {
            return invalid(format!(
                "calibration.max_hold_s ({}) must be at least settle_window_s ({})",
                self.max_hold_s, self.settle_window_s
            ));
        }
        if !(self.settle_tolerance_c > 0.0) {
            return invalid("calibration.settle_tolerance_c must be positive".to_string());
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_s)
    }

    /// Readings needed to cover the settle window.
    fn window_len(&self) -> usize {
        (self.settle_window_s / self.poll_interval_s) as usize + 1
    }
}

/// Runs a [`CalibrationPlan`] against live sensors.
pub struct CalibrationProcedure {
    plan: CalibrationPlan,
    sensors: SensorSuite,
    sink: Arc<dyn EventSink>,
    sensor_timeout: Duration,
}

impl CalibrationProcedure {
    pub fn new(plan: CalibrationPlan, sensors: SensorSuite, sink: Arc<dyn EventSink>) -> Self {
        Self {
            plan,
            sensors,
            sink,
            sensor_timeout: DEFAULT_SENSOR_TIMEOUT,
        }
    }

    /// Upper bound on each sensor read and power sample.
    pub fn with_sensor_timeout(mut self, timeout: Duration) -> Self {
        self.sensor_timeout = timeout;
        self
    }

    pub fn plan(&self) -> &CalibrationPlan {
        &self.plan
    }

    /// Walk the ladder and return one sample per level.
    ///
    /// Consumes the lease: every heater is stopped before this returns, on
    /// success, error or cancellation alike.
    ///
    /// # Errors
    ///
    /// `Cancelled` when `cancel` fires or the lease is revoked; sensor errors
    /// when a level cannot be sampled.
    pub async fn collect(
        &self,
        lease: PoolLease,
        cancel: &CancellationToken,
    ) -> Result<Vec<CalibrationSample>> {
        let result = self.walk(&lease, cancel).await;
        drop(lease);
        if let Err(e) = &result {
            self.sink.emit(&ThermalEvent::CalibrationAborted {
                reason: e.to_string(),
            });
        }
        result
    }

    async fn walk(
        &self,
        lease: &PoolLease,
        cancel: &CancellationToken,
    ) -> Result<Vec<CalibrationSample>> {
        let steps = self.plan.load_levels.len();
        let mut samples = Vec::with_capacity(steps);

        for (step, &load) in self.plan.load_levels.iter().enumerate() {
            self.sink
                .emit(&ThermalEvent::CalibrationProgress { step, steps, load });
            let heaters = lease.apply_load(load)?;
            debug!(step, load, heaters, "holding calibration level");

            let (cpu_temp, settled) = self.settle(lease, cancel).await?;
            if !settled {
                warn!(step, load, "level did not settle, sampling anyway");
            }
            let power = sample_with_timeout(Arc::clone(&self.sensors.power), self.sensor_timeout);
            let power = guarded(lease, cancel, power).await??;
            let ambient = read_with_timeout(Arc::clone(&self.sensors.ambient), self.sensor_timeout);
            let ambient = guarded(lease, cancel, ambient).await??;

            let sample = CalibrationSample::new(cpu_temp, power.watts, ambient);
            self.sink.emit(&ThermalEvent::CalibrationSample {
                step,
                sample,
                settled,
            });
            samples.push(sample);
        }
        Ok(samples)
    }

    /// Poll the CPU temperature until it is flat over the window or the hold
    /// limit passes. Returns the last reading and whether it settled.
    async fn settle(&self, lease: &PoolLease, cancel: &CancellationToken) -> Result<(f64, bool)> {
        let window_len = self.plan.window_len();
        let max_hold = Duration::from_secs(self.plan.max_hold_s);
        let started = Instant::now();
        let mut window: VecDeque<f64> = VecDeque::with_capacity(window_len);

        loop {
            guarded(lease, cancel, tokio::time::sleep(self.plan.poll_interval())).await?;

            let cpu = read_with_timeout(Arc::clone(&self.sensors.cpu), self.sensor_timeout);
            match guarded(lease, cancel, cpu).await? {
                Ok(temperature) => {
                    if window.len() == window_len {
                        window.pop_front();
                    }
                    window.push_back(temperature);
                }
                Err(e) => debug!(%e, "cpu read failed while settling"),
            }

            if window.len() == window_len && spread(&window) <= self.plan.settle_tolerance_c {
                break;
            }
            if started.elapsed() >= max_hold {
                let last = window.back().copied().ok_or_else(|| {
                    HearthError::SensorUnavailable(
                        "no cpu temperature during calibration level".to_string(),
                    )
                })?;
                return Ok((last, false));
            }
        }

        let last = window.back().copied().unwrap_or_default();
        Ok((last, true))
    }
}

const DEFAULT_SENSOR_TIMEOUT: Duration = Duration::from_secs(2);

/// Race `work` against both cancellation sources.
async fn guarded<T>(
    lease: &PoolLease,
    cancel: &CancellationToken,
    work: impl Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(HearthError::Cancelled),
        _ = lease.token().cancelled() => Err(HearthError::Cancelled),
        out = work => Ok(out),
    }
}

fn spread(window: &VecDeque<f64>) -> f64 {
    let (lo, hi) = window
        .iter()
        .fold((f64::MAX, f64::MIN), |(lo, hi), &t| (lo.min(t), hi.max(t)));
    hi - lo
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelSink;
    use crate::pool::{DutyCycle, HeaterPool, PoolSettings};
    use crate::sensors::{FixedPower, SharedTemperature, TemperatureSource, ThermalReading};

    fn quick_plan() -> CalibrationPlan {
        CalibrationPlan {
            load_levels: vec![0.0, 0.5, 1.0, 0.5],
            settle_window_s: 20,
            poll_interval_s: 10,
            settle_tolerance_c: 0.5,
            max_hold_s: 60,
        }
    }

    fn pool() -> HeaterPool {
        HeaterPool::new(
            vec![0, 0],
            PoolSettings {
                prefix: "cal".to_string(),
                duty: DutyCycle::new(0.1, Duration::from_millis(20)),
                pin: false,
                respawn_limit: 1,
            },
        )
        .unwrap()
    }

    fn suite(cpu: &SharedTemperature, ambient: &SharedTemperature) -> SensorSuite {
        SensorSuite {
            ambient: Arc::new(ambient.clone()),
            cpu: Arc::new(cpu.clone()),
            power: Arc::new(FixedPower(10.0)),
        }
    }

    #[test]
    fn test_default_plan() {
        let plan = CalibrationPlan::default();
        assert_eq!(plan.load_levels.len(), 8);
        assert_eq!(plan.settle_window_s, 180);
        assert!(plan.validate().is_ok());
        assert_eq!(plan.window_len(), 19);
    }

    #[test]
    fn test_plan_validation() {
        let mut plan = quick_plan();
        plan.load_levels = vec![0.0, 0.5, 1.0];
        assert!(plan.validate().is_err());

        let mut plan = quick_plan();
        plan.load_levels[1] = 1.2;
        assert!(plan.validate().is_err());

        let mut plan = quick_plan();
        plan.max_hold_s = 10;
        assert!(plan.validate().is_err());

        let mut plan = quick_plan();
        plan.poll_interval_s = 0;
        assert!(plan.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_collects_one_sample_per_level() {
        let cpu = SharedTemperature::new("cpu");
        let ambient = SharedTemperature::new("case");
        cpu.set(Some(40.0));
        ambient.set(Some(20.0));
        let (sink, mut rx) = ChannelSink::new();
        let procedure = CalibrationProcedure::new(quick_plan(), suite(&cpu, &ambient), Arc::new(sink));

        let pool = pool();
        let lease = pool.try_lease().unwrap();
        let samples = procedure
            .collect(lease, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(samples.len(), 4);
        assert!(samples
            .iter()
            .all(|s| s.cpu_temp == 40.0 && s.ambient_reference == 20.0 && s.power_watts == 10.0));
        assert_eq!(pool.active_workers(), 0);
        assert!(!pool.is_leased());

        let mut settled_samples = 0;
        while let Ok(event) = rx.try_recv() {
            if let ThermalEvent::CalibrationSample { settled, .. } = event {
                assert!(settled);
                settled_samples += 1;
            }
        }
        assert_eq!(settled_samples, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsettled_level_samples_at_hold_limit() {
        let cpu = SharedTemperature::new("cpu");
        let ambient = SharedTemperature::new("case");
        ambient.set(Some(20.0));
        // Rising one degree per poll never settles
        cpu.push_all((0..40).map(|i| Some(30.0 + i as f64)));
        let plan = CalibrationPlan {
            load_levels: vec![0.0, 0.5, 1.0, 0.5],
            ..quick_plan()
        };
        let procedure = CalibrationProcedure::new(plan, suite(&cpu, &ambient), Arc::new(ChannelSink::new().0));

        let pool = pool();
        let samples = procedure
            .collect(pool.try_lease().unwrap(), &CancellationToken::new())
            .await
            .unwrap();
        // Six polls per level at the hold limit
        assert_eq!(samples[0].cpu_temp, 35.0);
        assert_eq!(samples[1].cpu_temp, 41.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_tears_down() {
        let cpu = SharedTemperature::new("cpu");
        let ambient = SharedTemperature::new("case");
        cpu.set(Some(40.0));
        ambient.set(Some(20.0));
        let (sink, mut rx) = ChannelSink::new();
        let procedure = CalibrationProcedure::new(quick_plan(), suite(&cpu, &ambient), Arc::new(sink));

        let pool = pool();
        let cancel = CancellationToken::new();
        let lease = pool.try_lease().unwrap();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(45)).await;
            canceller.cancel();
        });

        let result = procedure.collect(lease, &cancel).await;
        assert!(matches!(result, Err(HearthError::Cancelled)));
        assert_eq!(pool.active_workers(), 0);
        assert!(!pool.is_leased());

        let mut aborted = false;
        while let Ok(event) = rx.try_recv() {
            aborted |= matches!(event, ThermalEvent::CalibrationAborted { .. });
        }
        assert!(aborted);
    }

    struct HungCpu;

    impl TemperatureSource for HungCpu {
        fn read(&self) -> Result<ThermalReading> {
            std::thread::sleep(Duration::from_secs(3));
            Ok(ThermalReading::now("hung", 40.0))
        }

        fn describe(&self) -> String {
            "hung".to_string()
        }
    }

    fn hung_procedure(sensor_timeout: Duration) -> CalibrationProcedure {
        let ambient = SharedTemperature::new("case");
        ambient.set(Some(20.0));
        let sensors = SensorSuite {
            ambient: Arc::new(ambient),
            cpu: Arc::new(HungCpu),
            power: Arc::new(FixedPower(10.0)),
        };
        let plan = CalibrationPlan {
            settle_window_s: 1,
            poll_interval_s: 1,
            max_hold_s: 1,
            ..quick_plan()
        };
        CalibrationProcedure::new(plan, sensors, Arc::new(ChannelSink::new().0))
            .with_sensor_timeout(sensor_timeout)
    }

    #[tokio::test]
    async fn test_cancel_does_not_wait_for_hung_sensor() {
        let procedure = hung_procedure(Duration::from_secs(30));
        let pool = pool();
        let lease = pool.try_lease().unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let result = procedure.collect(lease, &cancel).await;
        assert!(matches!(result, Err(HearthError::Cancelled)));
        assert!(started.elapsed() < Duration::from_millis(2500));
        assert_eq!(pool.active_workers(), 0);
        assert!(!pool.is_leased());
    }

    #[tokio::test]
    async fn test_hung_cpu_sensor_times_out() {
        let procedure = hung_procedure(Duration::from_millis(50));
        let pool = pool();
        let lease = pool.try_lease().unwrap();

        let started = std::time::Instant::now();
        let result = procedure.collect(lease, &CancellationToken::new()).await;
        assert!(matches!(result, Err(HearthError::SensorUnavailable(_))));
        assert!(started.elapsed() < Duration::from_millis(2500));
        assert_eq!(pool.active_workers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_lease_cancels() {
        let cpu = SharedTemperature::new("cpu");
        let ambient = SharedTemperature::new("case");
        cpu.set(Some(40.0));
        ambient.set(Some(20.0));
        let procedure = CalibrationProcedure::new(quick_plan(), suite(&cpu, &ambient), Arc::new(ChannelSink::new().0));

        let pool = pool();
        let lease = pool.try_lease().unwrap();
        let revoker = pool.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            revoker.revoke_lease();
        });

        let result = procedure.collect(lease, &CancellationToken::new()).await;
        assert!(matches!(result, Err(HearthError::Cancelled)));
        assert!(!pool.is_leased());
    }
}
