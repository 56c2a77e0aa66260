//! Configuration management.
use crate::error::SweepError;
use config::Config;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub log_level: String,
    pub storage: StorageSettings,
    #[serde(default)]
    pub timing: TimingSettings,
    /// Adapter-specific instrument configuration (addresses, baud rates).
    /// Opaque to the engine; consumed by whoever wires the bindings.
    #[serde(default)]
    pub instruments: HashMap<String, toml::Value>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    /// Root directory for run records; a dated subdirectory is created per day.
    pub data_dir: String,
    pub default_format: String,
}

/// Settle and ramp pauses used by the acquisition loop.
///
/// The defaults are the values the loop was tuned with on real hardware;
/// tests shrink them to keep runs fast.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimingSettings {
    /// Lock-in time constant in seconds; the inner loop pauses `3 x` this
    /// after every set before reading.
    pub settle_const_secs: f64,
    /// Pause after ramping sweep instruments to a new outer-loop target.
    pub step_settle_secs: f64,
    /// Duration of each instrument ramp during initialization.
    pub ramp_duration_secs: f64,
    /// Pause after forcing the VNA output on in snapshot mode.
    pub vna_output_settle_secs: f64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            settle_const_secs: 0.1,
            step_settle_secs: 5.0,
            ramp_duration_secs: 2.0,
            vna_output_settle_secs: 1.0,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            storage: StorageSettings {
                data_dir: "data".to_string(),
                default_format: "csv".to_string(),
            },
            timing: TimingSettings::default(),
            instruments: HashMap::new(),
        }
    }
}

impl Settings {
    pub fn new(config_name: Option<&str>) -> Result<Self, SweepError> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()
            .map_err(SweepError::Config)?;

        s.try_deserialize().map_err(SweepError::Config)
    }
}
