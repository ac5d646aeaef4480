//! Crate configuration (Figment-based).
//!
//! Settings merge three layers, later ones winning: built-in defaults, an
//! optional TOML file, and `DAQ_SCAN_*` environment variables (nested keys
//! separated by `__`, e.g. `DAQ_SCAN_SAVING__SESSION=demo`).

use crate::error::{ScanError, ScanResult};
use crate::pipeline::FlushPolicy;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level settings for the scan engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub saving: SavingSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

/// Where and how scans are saved and numbered.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavingSettings {
    /// Session name, used as the root of all node keys.
    pub session: String,
    /// User name recorded in the scan metadata.
    pub user_name: String,
    /// Directory the data files live in.
    pub base_path: PathBuf,
    /// Data file name; `{scan_number}` is substituted when present,
    /// otherwise the destination is considered final.
    pub data_filename: String,
    /// Zero-padding width of formatted scan numbers.
    pub scan_number_width: usize,
    /// Data-policy label recorded in the scan metadata.
    pub data_policy: String,
    /// Live-storage retention for finished scans.
    #[serde(with = "humantime_serde")]
    pub expiration: Duration,
}

impl Default for SavingSettings {
    fn default() -> Self {
        let base_path = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("daq-scan");
        Self {
            session: "session".to_string(),
            user_name: whoami(),
            base_path,
            data_filename: "scan_{scan_number}.csv".to_string(),
            scan_number_width: 4,
            data_policy: "none".to_string(),
            expiration: Duration::from_secs(600),
        }
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Flush thresholds of the channel-data write pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub max_stream_events: usize,
    pub max_bytes: Option<usize>,
    #[serde(with = "humantime_serde")]
    pub max_time: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let defaults = FlushPolicy::default();
        Self {
            max_stream_events: defaults.max_events,
            max_bytes: defaults.max_bytes,
            max_time: defaults.max_time,
        }
    }
}

impl PipelineSettings {
    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy {
            max_events: self.max_stream_events,
            max_bytes: self.max_bytes,
            max_time: self.max_time,
        }
    }
}

impl Settings {
    /// Defaults merged with the optional TOML file and the environment.
    pub fn new(path: Option<&Path>) -> ScanResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("DAQ_SCAN_").split("__"))
            .extract()
            .map_err(|err| ScanError::Config(err.to_string()))
    }

    pub fn from_path(path: &Path) -> ScanResult<Self> {
        Self::new(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.pipeline.max_stream_events, 50);
        assert_eq!(settings.pipeline.max_time, Duration::from_millis(200));
        assert_eq!(settings.saving.scan_number_width, 4);
        assert!(settings.saving.data_filename.contains("{scan_number}"));
    }

    #[test]
    #[serial_test::serial]
    fn test_toml_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(
            file,
            r#"
[saving]
session = "beamtime_12"
data_filename = "run_{{scan_number}}.csv"

[pipeline]
max_stream_events = 7
max_time = "50ms"
"#
        )
        .expect("write config");

        let settings = Settings::from_path(file.path()).expect("parse settings");
        assert_eq!(settings.saving.session, "beamtime_12");
        assert_eq!(settings.pipeline.max_stream_events, 7);
        assert_eq!(settings.pipeline.max_time, Duration::from_millis(50));
        // Untouched keys keep their defaults.
        assert_eq!(settings.saving.scan_number_width, 4);
    }

    #[test]
    #[serial_test::serial]
    fn test_env_overrides_file() {
        std::env::set_var("DAQ_SCAN_SAVING__SESSION", "from_env");
        let settings = Settings::new(None).expect("settings");
        std::env::remove_var("DAQ_SCAN_SAVING__SESSION");
        assert_eq!(settings.saving.session, "from_env");
    }
}
