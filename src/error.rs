//! Error types for hearth.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the controller, the heater pool and the ambient estimator.
#[derive(Debug, Error)]
pub enum HearthError {
    /// A temperature channel could not be read, or the read timed out.
    #[error("sensor unavailable: {0}")]
    SensorUnavailable(String),

    /// Heater workers could not be (re)spawned within the per-tick retry bound.
    #[error("failed to spawn {missing} of {wanted} heater workers after {attempts} attempts")]
    WorkerSpawnFailure {
        /// Workers still missing after the retries.
        missing: usize,
        /// Workers the pool was asked to run.
        wanted: usize,
        /// Spawn attempts made during this call.
        attempts: u32,
    },

    /// Not enough usable samples to fit the thermal model.
    #[error("insufficient calibration data: {0}")]
    CalibrationInsufficientData(String),

    /// A calibration sample contains an unusable value.
    #[error("invalid calibration sample #{index}: {reason}")]
    InvalidSample { index: usize, reason: String },

    /// Inference was requested before a valid model was loaded or fitted.
    #[error("ambient estimator is not calibrated")]
    NotCalibrated,

    /// Inference inputs are not finite or physically impossible.
    #[error("invalid estimator input: {0}")]
    InvalidInput(String),

    /// A cooldown series cannot be fitted.
    #[error("invalid cooldown series: {0}")]
    InvalidCooldownSeries(String),

    /// Reading or writing the calibration record failed.
    #[error("calibration store error at {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    /// The heater pool is busy (heating, or already leased to a calibration run).
    #[error("heater pool is busy: {0}")]
    PoolBusy(&'static str),

    /// A long-running procedure was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration values are inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error extracting configuration from figment.
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Error parsing CPU set string.
    #[error("invalid cpuset format: {0}")]
    InvalidCpuSet(String),

    /// CPU ID is not available on this system.
    #[error("CPU {0} is not available on this system")]
    CpuNotAvailable(usize),

    /// No CPUs available after applying constraints.
    #[error("no CPUs available after applying constraints")]
    NoCpusAvailable,

    /// Error setting thread affinity.
    #[error("failed to set thread affinity for CPU {0}")]
    AffinityFailed(usize),

    /// I/O failure outside the sensor and store paths (runtime setup, CLI files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HearthError {
    /// Whether the control loop can carry on after this error.
    ///
    /// Sensor faults and degraded heating capacity are retried on the next
    /// tick; everything else is surfaced to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HearthError::SensorUnavailable(_) | HearthError::WorkerSpawnFailure { .. }
        )
    }
}

/// Result type alias for hearth operations.
pub type Result<T> = std::result::Result<T, HearthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(HearthError::SensorUnavailable("zone0".into()).is_recoverable());
        assert!(HearthError::WorkerSpawnFailure {
            missing: 1,
            wanted: 4,
            attempts: 3
        }
        .is_recoverable());
        assert!(!HearthError::NotCalibrated.is_recoverable());
        assert!(!HearthError::Cancelled.is_recoverable());
    }

    #[test]
    fn test_display_messages() {
        let err = HearthError::WorkerSpawnFailure {
            missing: 2,
            wanted: 4,
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "failed to spawn 2 of 4 heater workers after 3 attempts"
        );
        assert_eq!(
            HearthError::CalibrationInsufficientData("need at least 4 samples, got 3".into())
                .to_string(),
            "insufficient calibration data: need at least 4 samples, got 3"
        );
    }
}
