//! Calibration persistence.
//!
//! One JSON record per host. Records are written to a temporary sibling and
//! renamed into place, so a crash mid-write leaves the previous record intact.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::model::CalibrationModel;
use crate::error::{HearthError, Result};

const RECORD_VERSION: u32 = 1;

/// Where calibration models live between runs.
pub trait CalibrationStore: Send + Sync + 'static {
    /// Load the stored model, `None` if nothing was stored yet.
    fn load(&self) -> Result<Option<CalibrationModel>>;

    /// Replace the stored model.
    fn save(&self, model: &CalibrationModel) -> Result<()>;

    /// Human-readable location for logs.
    fn location(&self) -> String;
}

#[derive(Debug, Serialize, Deserialize)]
struct CalibrationRecord {
    version: u32,
    host: String,
    model: CalibrationModel,
}

/// Host name reduced to characters safe in a file name.
pub fn host_identity() -> String {
    let host = sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());
    let cleaned: String = host
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// JSON file store at `<dir>/ambient-calibration-<host>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    host: String,
}

impl JsonFileStore {
    /// Store for `host` inside `dir`.
    pub fn for_host(dir: impl AsRef<Path>, host: &str) -> Self {
        Self {
            path: dir
                .as_ref()
                .join(format!("ambient-calibration-{}.json", host)),
            host: host.to_string(),
        }
    }

    /// Store for this machine inside `dir`.
    pub fn for_this_host(dir: impl AsRef<Path>) -> Self {
        Self::for_host(dir, &host_identity())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, reason: impl ToString) -> HearthError {
        HearthError::Persistence {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

impl CalibrationStore for JsonFileStore {
    fn load(&self) -> Result<Option<CalibrationModel>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.error(e)),
        };
        let record: CalibrationRecord = serde_json::from_str(&raw).map_err(|e| self.error(e))?;
        if record.version != RECORD_VERSION {
            return Err(self.error(format!("unsupported record version {}", record.version)));
        }
        if record.host != self.host {
            debug!(stored = %record.host, expected = %self.host, "calibration record from another host name");
        }
        Ok(Some(record.model))
    }

    fn save(&self, model: &CalibrationModel) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| self.error(e))?;
        }
        let record = CalibrationRecord {
            version: RECORD_VERSION,
            host: self.host.clone(),
            model: model.clone(),
        };
        let body = serde_json::to_vec_pretty(&record).map_err(|e| self.error(e))?;

        let temp_path = self.path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(&body)?;
            file.sync_all()?;
            fs::rename(&temp_path, &self.path)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&temp_path);
            return Err(self.error(e));
        }
        debug!(path = %self.path.display(), "calibration saved");
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Volatile store, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    model: Arc<Mutex<Option<CalibrationModel>>>,
    fail_saves: Arc<Mutex<bool>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `model`.
    pub fn with_model(model: CalibrationModel) -> Self {
        let store = Self::default();
        *store.model.lock() = Some(model);
        store
    }

    /// Make subsequent saves fail, for exercising persistence errors.
    pub fn set_fail_saves(&self, fail: bool) {
        *self.fail_saves.lock() = fail;
    }

    /// The stored model, if any.
    pub fn stored(&self) -> Option<CalibrationModel> {
        self.model.lock().clone()
    }
}

impl CalibrationStore for MemoryStore {
    fn load(&self) -> Result<Option<CalibrationModel>> {
        Ok(self.stored())
    }

    fn save(&self, model: &CalibrationModel) -> Result<()> {
        if *self.fail_saves.lock() {
            return Err(HearthError::Persistence {
                path: PathBuf::from("<memory>"),
                reason: "saves disabled".to_string(),
            });
        }
        *self.model.lock() = Some(model.clone());
        Ok(())
    }

    fn location(&self) -> String {
        "<memory>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::model::CalibrationSample;

    fn model() -> CalibrationModel {
        let samples = [
            CalibrationSample::new(24.5, 7.0, 22.0),
            CalibrationSample::new(38.0, 14.0, 22.0),
            CalibrationSample::new(52.0, 22.0, 22.0),
            CalibrationSample::new(45.0, 18.0, 22.0),
        ];
        CalibrationModel::fit(&samples, 4).unwrap()
    }

    #[test]
    fn test_json_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::for_host(dir.path().join("nested"), "shed-box");
        assert!(store.load().unwrap().is_none());

        let model = model();
        store.save(&model).unwrap();
        assert!(store
            .path()
            .ends_with("nested/ambient-calibration-shed-box.json"));
        assert!(!store.path().with_extension("json.tmp").exists());
        assert_eq!(store.load().unwrap(), Some(model.clone()));

        let replaced = model.with_bias(0.5);
        store.save(&replaced).unwrap();
        assert_eq!(store.load().unwrap().unwrap().bias, 0.5);
    }

    #[test]
    fn test_json_store_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::for_host(dir.path(), "h");
        fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(
            store.load(),
            Err(HearthError::Persistence { .. })
        ));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());
        store.save(&model()).unwrap();
        assert!(store.clone().load().unwrap().is_some());

        store.set_fail_saves(true);
        assert!(store.save(&model()).is_err());
    }

    #[test]
    fn test_host_identity_is_file_safe() {
        let host = host_identity();
        assert!(!host.is_empty());
        assert!(!host.contains('/'));
    }
}
