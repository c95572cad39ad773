//! I/O tuning loaded from a JSON file.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "HIDPORT_CONFIG";

/// Tuning for device handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Reports buffered per handle before the oldest is dropped.
    pub queue_capacity: usize,
    /// Slice length when waiting on a source that cannot be polled. Bounds how
    /// long `close` takes to stop such a reader.
    pub read_slice_ms: u64,
    /// Size of the buffer a reader thread reads each report into.
    pub max_report_len: usize,
    /// Thread name of per-handle reader threads.
    pub worker_name: String,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 30,
            read_slice_ms: 50,
            max_report_len: 4096,
            worker_name: "hid-reader".into(),
        }
    }
}

impl IoConfig {
    /// Reject values no handle can run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Configuration("queue_capacity must be > 0".into()));
        }
        if self.read_slice_ms == 0 {
            return Err(Error::Configuration("read_slice_ms must be > 0".into()));
        }
        if self.max_report_len == 0 {
            return Err(Error::Configuration("max_report_len must be > 0".into()));
        }
        Ok(())
    }

    pub fn read_slice(&self) -> Duration {
        Duration::from_millis(self.read_slice_ms)
    }
}

/// Config file location, if `HIDPORT_CONFIG` is set.
pub fn config_path() -> Option<PathBuf> {
    std::env::var_os(CONFIG_ENV).map(PathBuf::from)
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<IoConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::Configuration(format!("read {}: {e}", path.display()))
    })?;
    let config: IoConfig = serde_json::from_str(&text).map_err(|e| {
        Error::Configuration(format!("parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    debug!(path = %path.display(), ?config, "Loaded I/O config");
    Ok(config)
}

/// Load the config named by `HIDPORT_CONFIG`, or defaults when unset or absent.
pub fn load_or_default() -> Result<IoConfig> {
    match config_path() {
        Some(path) if path.exists() => load_config(&path),
        Some(path) => {
            debug!(path = %path.display(), "Config file absent, using defaults");
            Ok(IoConfig::default())
        }
        None => Ok(IoConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn scratch_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "hidport-config-{}-{name}.json",
            std::process::id()
        ));
        std::fs::write(&path, contents).expect("write scratch config");
        path
    }

    #[test]
    fn defaults_are_valid() {
        let config = IoConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_capacity, 30);
        assert_eq!(config.read_slice(), Duration::from_millis(50));
    }

    #[test]
    fn validate_rejects_zero_values() {
        let mut config = IoConfig::default();
        config.queue_capacity = 0;
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Configuration);

        let mut config = IoConfig::default();
        config.read_slice_ms = 0;
        assert!(config.validate().is_err());

        let mut config = IoConfig::default();
        config.max_report_len = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let path = scratch_file("partial", r#"{ "queue_capacity": 4 }"#);
        let config = load_config(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.queue_capacity, 4);
        assert_eq!(config.read_slice_ms, 50);
        assert_eq!(config.worker_name, "hid-reader");
    }

    #[test]
    fn malformed_file_is_configuration_error() {
        let path = scratch_file("malformed", "{ queue_capacity: ");
        let err = load_config(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn invalid_values_in_file_are_rejected() {
        let path = scratch_file("zero", r#"{ "read_slice_ms": 0 }"#);
        let err = load_config(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn missing_file_is_configuration_error() {
        let path = std::env::temp_dir().join("hidport-config-does-not-exist.json");
        assert!(load_config(&path).is_err());
    }
}
