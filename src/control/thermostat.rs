//! Hysteresis thermostat with manual override and sensor failsafe.

use super::{HeatingState, Transition, TransitionCause};
use crate::config::HearthConfig;
use crate::signal::OverrideSignal;

/// Thresholds and limits the thermostat decides with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThermostatSettings {
    pub min_threshold_c: f64,
    pub target_threshold_c: f64,
    pub max_sensor_failures: u32,
}

impl ThermostatSettings {
    pub fn from_config(config: &HearthConfig) -> Self {
        Self {
            min_threshold_c: config.min_threshold_c,
            target_threshold_c: config.target_threshold_c,
            max_sensor_failures: config.max_sensor_failures,
        }
    }
}

impl Default for ThermostatSettings {
    fn default() -> Self {
        Self::from_config(&HearthConfig::default())
    }
}

/// Owner of the heating state.
///
/// Heating starts strictly below `min_threshold_c` and automatic heating stops
/// at or above `target_threshold_c`. Overrides win over both thresholds.
#[derive(Debug, Clone)]
pub struct Thermostat {
    settings: ThermostatSettings,
    state: HeatingState,
    consecutive_failures: u32,
}

impl Thermostat {
    pub fn new(settings: ThermostatSettings) -> Self {
        Self {
            settings,
            state: HeatingState::Idle,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> HeatingState {
        self.state
    }

    pub fn settings(&self) -> &ThermostatSettings {
        &self.settings
    }

    /// Failed reads since the last successful one.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Advance one tick.
    ///
    /// `temperature` is `None` when the read failed. While `calibration_active`
    /// the pool belongs to a calibration run: automatic decisions and `ForceOn`
    /// are suspended, `ForceOff` still applies.
    pub fn step(
        &mut self,
        temperature: Option<f64>,
        signal: OverrideSignal,
        calibration_active: bool,
    ) -> Option<Transition> {
        match temperature {
            Some(_) => self.consecutive_failures = 0,
            None => self.consecutive_failures = self.consecutive_failures.saturating_add(1),
        }

        let (to, cause) = match signal {
            OverrideSignal::ForceOn if calibration_active => return None,
            OverrideSignal::ForceOn => (HeatingState::HeatingManual, TransitionCause::ManualOn),
            OverrideSignal::ForceOff => (HeatingState::Idle, TransitionCause::ManualOff),
            OverrideSignal::Absent if calibration_active => return None,
            OverrideSignal::Absent => self.automatic(temperature)?,
        };

        if to == self.state {
            return None;
        }
        let transition = Transition {
            from: self.state,
            to,
            temperature,
            cause,
        };
        self.state = to;
        Some(transition)
    }

    fn automatic(&self, temperature: Option<f64>) -> Option<(HeatingState, TransitionCause)> {
        let s = &self.settings;
        match (self.state, temperature) {
            (HeatingState::HeatingManual, Some(t)) if t >= s.target_threshold_c => {
                Some((HeatingState::Idle, TransitionCause::OverrideReleased))
            }
            (HeatingState::HeatingManual, _) => {
                Some((HeatingState::HeatingAuto, TransitionCause::OverrideReleased))
            }
            (HeatingState::Idle, Some(t)) if t < s.min_threshold_c => {
                Some((HeatingState::HeatingAuto, TransitionCause::BelowMinimum))
            }
            (HeatingState::HeatingAuto, Some(t)) if t >= s.target_threshold_c => {
                Some((HeatingState::Idle, TransitionCause::ReachedTarget))
            }
            (HeatingState::HeatingAuto, None)
                if self.consecutive_failures >= s.max_sensor_failures =>
            {
                Some((HeatingState::Idle, TransitionCause::SensorFailsafe))
            }
            _ => None,
        }
    }
}
