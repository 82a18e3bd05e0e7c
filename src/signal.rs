//! Manual override channel.
//!
//! An operator (usually through a dashboard) can force heating on or off. The
//! controller only reads the channel; writing it belongs to the operator side.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::debug;

/// File content that forces heating on.
pub const FORCE_ON_TOKEN: &str = "HEATING_ON";
/// File content that forces heating off.
pub const FORCE_OFF_TOKEN: &str = "HEATING_OFF";

/// Operator override state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverrideSignal {
    #[default]
    Absent,
    ForceOn,
    ForceOff,
}

impl OverrideSignal {
    /// Parse override file content; anything unrecognised is `Absent`.
    pub fn parse(content: &str) -> Self {
        match content.trim() {
            FORCE_ON_TOKEN => OverrideSignal::ForceOn,
            FORCE_OFF_TOKEN => OverrideSignal::ForceOff,
            _ => OverrideSignal::Absent,
        }
    }
}

/// Read-only view of the override.
pub trait OverrideChannel: Send + Sync + 'static {
    /// Current override. Never fails; unreadable means `Absent`.
    fn current(&self) -> OverrideSignal;
}

/// Override stored in a flag file.
#[derive(Debug, Clone)]
pub struct FileOverride {
    path: PathBuf,
}

impl FileOverride {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl OverrideChannel for FileOverride {
    fn current(&self) -> OverrideSignal {
        match fs::read_to_string(&self.path) {
            Ok(content) => OverrideSignal::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => OverrideSignal::Absent,
            Err(e) => {
                debug!(%e, path = %self.path.display(), "override file unreadable");
                OverrideSignal::Absent
            }
        }
    }
}

/// In-memory override shared with an embedding application.
#[derive(Debug, Clone, Default)]
pub struct SharedOverride {
    state: Arc<AtomicU8>,
}

impl SharedOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, signal: OverrideSignal) {
        let raw = match signal {
            OverrideSignal::Absent => 0,
            OverrideSignal::ForceOn => 1,
            OverrideSignal::ForceOff => 2,
        };
        self.state.store(raw, Ordering::Release);
    }

    pub fn clear(&self) {
        self.set(OverrideSignal::Absent);
    }
}

impl OverrideChannel for SharedOverride {
    fn current(&self) -> OverrideSignal {
        match self.state.load(Ordering::Acquire) {
            1 => OverrideSignal::ForceOn,
            2 => OverrideSignal::ForceOff,
            _ => OverrideSignal::Absent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tokens() {
        assert_eq!(OverrideSignal::parse("HEATING_ON\n"), OverrideSignal::ForceOn);
        assert_eq!(OverrideSignal::parse("  HEATING_OFF "), OverrideSignal::ForceOff);
        assert_eq!(OverrideSignal::parse("heating_on"), OverrideSignal::Absent);
        assert_eq!(OverrideSignal::parse(""), OverrideSignal::Absent);
    }

    #[test]
    fn test_file_override() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FileOverride::new(dir.path().join("thermal_override"));
        assert_eq!(channel.current(), OverrideSignal::Absent);

        fs::write(channel.path(), "HEATING_ON").unwrap();
        assert_eq!(channel.current(), OverrideSignal::ForceOn);

        fs::write(channel.path(), "HEATING_OFF").unwrap();
        assert_eq!(channel.current(), OverrideSignal::ForceOff);

        fs::remove_file(channel.path()).unwrap();
        assert_eq!(channel.current(), OverrideSignal::Absent);
    }

    #[test]
    fn test_shared_override() {
        let channel = SharedOverride::new();
        let handle = channel.clone();
        assert_eq!(channel.current(), OverrideSignal::Absent);
        handle.set(OverrideSignal::ForceOff);
        assert_eq!(channel.current(), OverrideSignal::ForceOff);
        handle.clear();
        assert_eq!(channel.current(), OverrideSignal::Absent);
    }
}
