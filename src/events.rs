//! Events published by the controller and the estimator.
//!
//! Collaborators (a dashboard, a log pipeline) subscribe through an
//! [`EventSink`]. Sinks must not block: they are called inline from the
//! control loop.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::control::Transition;
use crate::estimator::{AmbientEstimate, CalibrationModel, CalibrationSample};
use crate::sensors::PowerMethod;

/// Something observers may care about.
#[derive(Debug, Clone, PartialEq)]
pub enum ThermalEvent {
    /// The heating state changed.
    Transition(Transition),
    /// The case sensor could not be read.
    SensorFault { consecutive: u32, error: String },
    /// Heaters could not be kept at full strength.
    WorkerFault { error: String },
    /// A calibration run moved to a new load level.
    CalibrationProgress { step: usize, steps: usize, load: f64 },
    /// A calibration run recorded a sample.
    CalibrationSample {
        step: usize,
        sample: CalibrationSample,
        settled: bool,
    },
    /// A new model replaced the previous one.
    CalibrationComplete {
        model: CalibrationModel,
        persisted: bool,
    },
    /// A calibration run ended without a model.
    CalibrationAborted { reason: String },
    /// A diagnostic ambient estimate.
    AmbientEstimate {
        estimate: AmbientEstimate,
        cpu_temp: f64,
        power_watts: f64,
        power_method: PowerMethod,
    },
    /// The model could not be written to its store.
    PersistenceFailure { error: String },
}

/// Receives events.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: &ThermalEvent);
}

fn fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Writes events as structured log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &ThermalEvent) {
        match event {
            ThermalEvent::Transition(t) => match t.temperature {
                Some(c) => info!(
                    from = %t.from,
                    to = %t.to,
                    cause = %t.cause,
                    "state change at {:.1}°C ({:.1}°F)",
                    c,
                    fahrenheit(c)
                ),
                None => info!(from = %t.from, to = %t.to, cause = %t.cause, "state change without reading"),
            },
            ThermalEvent::SensorFault { consecutive, error } => {
                warn!(consecutive, %error, "case sensor read failed")
            }
            ThermalEvent::WorkerFault { error } => warn!(%error, "heater capacity degraded"),
            ThermalEvent::CalibrationProgress { step, steps, load } => info!(
                step = step + 1,
                steps,
                load_pct = load * 100.0,
                "calibration level"
            ),
            ThermalEvent::CalibrationSample {
                step,
                sample,
                settled,
            } => info!(
                step = step + 1,
                cpu_temp = sample.cpu_temp,
                power_watts = sample.power_watts,
                ambient_reference = sample.ambient_reference,
                settled,
                "calibration sample"
            ),
            ThermalEvent::CalibrationComplete { model, persisted } => info!(
                r_th = model.thermal_resistance,
                bias = model.bias,
                sigma = model.sigma,
                r_squared = model.r_squared,
                samples = model.sample_count,
                low_confidence = model.low_confidence(),
                persisted,
                "calibration complete"
            ),
            ThermalEvent::CalibrationAborted { reason } => warn!(%reason, "calibration aborted"),
            ThermalEvent::AmbientEstimate {
                estimate,
                cpu_temp,
                power_watts,
                power_method,
            } => info!(
                cpu_temp,
                power_watts,
                %power_method,
                uncertainty = estimate.uncertainty_celsius,
                "estimated ambient {:.1}°C ({:.1}°F)",
                estimate.ambient_celsius,
                fahrenheit(estimate.ambient_celsius)
            ),
            ThermalEvent::PersistenceFailure { error } => {
                warn!(%error, "calibration not persisted")
            }
        }
    }
}

/// Forwards events to an unbounded channel, e.g. for a dashboard.
///
/// Events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ThermalEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ThermalEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &ThermalEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Fan-out to several sinks.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for SinkSet {
    fn emit(&self, event: &ThermalEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

impl std::fmt::Debug for SinkSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkSet")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{HeatingState, TransitionCause};

    fn transition() -> ThermalEvent {
        ThermalEvent::Transition(Transition {
            from: HeatingState::Idle,
            to: HeatingState::HeatingAuto,
            temperature: Some(-1.0),
            cause: TransitionCause::BelowMinimum,
        })
    }

    #[test]
    fn test_fahrenheit() {
        assert_eq!(fahrenheit(0.0), 32.0);
        assert_eq!(fahrenheit(-40.0), -40.0);
        assert_eq!(fahrenheit(100.0), 212.0);
    }

    #[test]
    fn test_sink_set_fans_out() {
        let (a, mut rx_a) = ChannelSink::new();
        let (b, mut rx_b) = ChannelSink::new();
        let set = SinkSet::new()
            .with(Arc::new(a))
            .with(Arc::new(b))
            .with(Arc::new(TracingSink));
        assert_eq!(set.len(), 3);

        set.emit(&transition());
        assert_eq!(rx_a.try_recv().unwrap(), transition());
        assert_eq!(rx_b.try_recv().unwrap(), transition());
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink_survives_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(&transition());
    }
}
