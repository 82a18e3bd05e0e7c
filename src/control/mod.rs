//! Thermal control state machine.
//!
//! [`Thermostat`] is the pure decision core: readings and override signals go
//! in, transitions come out. [`Controller`] wraps it with sensor I/O, the
//! heater pool and event emission.

mod controller;
mod thermostat;

use std::fmt;

use serde::Serialize;

pub use controller::{Controller, TickOutcome};
pub(crate) use controller::{read_with_timeout, sample_with_timeout};
pub use thermostat::{Thermostat, ThermostatSettings};

/// Heating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeatingState {
    #[default]
    Idle,
    HeatingAuto,
    HeatingManual,
}

impl HeatingState {
    /// Whether heaters should be running in this state.
    pub fn is_heating(self) -> bool {
        !matches!(self, HeatingState::Idle)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HeatingState::Idle => "IDLE",
            HeatingState::HeatingAuto => "HEATING_AUTO",
            HeatingState::HeatingManual => "HEATING_MANUAL",
        }
    }
}

impl fmt::Display for HeatingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// Temperature fell below the minimum threshold.
    BelowMinimum,
    /// Temperature reached the target threshold.
    ReachedTarget,
    /// Operator forced heating on.
    ManualOn,
    /// Operator forced heating off.
    ManualOff,
    /// Operator override was cleared and automatic control took over.
    OverrideReleased,
    /// Too many consecutive sensor failures while heating automatically.
    SensorFailsafe,
}

impl fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransitionCause::BelowMinimum => "below minimum threshold",
            TransitionCause::ReachedTarget => "reached target threshold",
            TransitionCause::ManualOn => "manual override on",
            TransitionCause::ManualOff => "manual override off",
            TransitionCause::OverrideReleased => "override released",
            TransitionCause::SensorFailsafe => "sensor failsafe",
        })
    }
}

/// A change of heating state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Transition {
    pub from: HeatingState,
    pub to: HeatingState,
    /// Case temperature that drove the decision, if the read succeeded.
    pub temperature: Option<f64>,
    pub cause: TransitionCause,
}

impl Transition {
    /// Heaters must start.
    pub fn starts_heating(&self) -> bool {
        !self.from.is_heating() && self.to.is_heating()
    }

    /// Heaters must stop.
    pub fn stops_heating(&self) -> bool {
        self.from.is_heating() && !self.to.is_heating()
    }
}
