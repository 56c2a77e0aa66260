//! Mock Hardware Implementations
//!
//! Simulated instruments for driving the acquisition loop without physical
//! hardware. All mocks use async-safe operations (tokio::time::sleep, never
//! std::thread::sleep) and track every command they receive so tests can
//! assert on ordering.
//!
//! # Available Mocks
//!
//! - `MockSource` - settable/rampable output channel (voltage source, generator)
//! - `MockLockIn` - scalar readout with optional noise
//! - `MockVna` - vector network analyzer with per-channel trace handles

use crate::error::{AppResult, SweepError};
use crate::hardware::capabilities::{
    ControlChannel, ScalarChannel, TraceFormat, VectorChannel, VnaChannel, VnaInstrument,
    VnaSettings,
};
use async_trait::async_trait;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::debug;

/// Shared command log for asserting cross-instrument ordering in tests.
pub type EventLog = Arc<Mutex<Vec<String>>>;

fn log_event(log: &Option<EventLog>, entry: String) {
    if let Some(log) = log {
        if let Ok(mut entries) = log.lock() {
            entries.push(entry);
        }
    }
}

// =============================================================================
// MockSource - settable output channel
// =============================================================================

/// Mock output channel that tracks every `set` and `ramp_to` it receives.
pub struct MockSource {
    name: String,
    value: RwLock<f64>,
    sets: Mutex<Vec<f64>>,
    ramps: Mutex<Vec<f64>>,
    events: Option<EventLog>,
}

impl MockSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: RwLock::new(0.0),
            sets: Mutex::new(Vec::new()),
            ramps: Mutex::new(Vec::new()),
            events: None,
        }
    }

    /// Attach a shared event log.
    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    /// Current output value.
    pub async fn value(&self) -> f64 {
        *self.value.read().await
    }

    /// Every value passed to `set`, in order.
    pub fn set_history(&self) -> Vec<f64> {
        self.sets.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Every value passed to `ramp_to`, in order.
    pub fn ramp_history(&self) -> Vec<f64> {
        self.ramps.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ControlChannel for MockSource {
    async fn set(&self, value: f64) -> AppResult<()> {
        *self.value.write().await = value;
        if let Ok(mut sets) = self.sets.lock() {
            sets.push(value);
        }
        log_event(&self.events, format!("{} set {value}", self.name));
        debug!(source = %self.name, value, "mock set");
        Ok(())
    }

    async fn ramp_to(&self, value: f64, duration: Duration) -> AppResult<()> {
        debug!(source = %self.name, value, ?duration, "mock ramp");
        sleep(duration).await;
        *self.value.write().await = value;
        if let Ok(mut ramps) = self.ramps.lock() {
            ramps.push(value);
        }
        log_event(&self.events, format!("{} ramp {value}", self.name));
        Ok(())
    }
}

// =============================================================================
// MockLockIn - scalar readout
// =============================================================================

/// Mock lock-in output returning a fixed value, optionally with noise.
pub struct MockLockIn {
    name: String,
    value: f64,
    noise: f64,
    reads: Mutex<usize>,
}

impl MockLockIn {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            noise: 0.0,
            reads: Mutex::new(0),
        }
    }

    /// Add uniform noise of the given amplitude to every reading.
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude;
        self
    }

    /// Number of readings taken so far.
    pub fn read_count(&self) -> usize {
        self.reads.lock().map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl ScalarChannel for MockLockIn {
    async fn read(&self) -> AppResult<f64> {
        if let Ok(mut reads) = self.reads.lock() {
            *reads += 1;
        }
        let reading = if self.noise > 0.0 {
            self.value + rand::thread_rng().gen_range(-self.noise..self.noise)
        } else {
            self.value
        };
        debug!(channel = %self.name, reading, "mock read");
        Ok(reading)
    }
}

/// Lock-in whose serial link corrupts every response.
///
/// Surfaces the transient-defect taxonomy (checksum mismatch) so failure
/// paths through the acquisition loop can be tested end to end.
pub struct MockFaultyLockIn {
    device: String,
}

impl MockFaultyLockIn {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

#[async_trait]
impl ScalarChannel for MockFaultyLockIn {
    async fn read(&self) -> AppResult<f64> {
        Err(SweepError::ChecksumMismatch {
            device: self.device.clone(),
        })
    }
}

// =============================================================================
// MockVna - vector network analyzer
// =============================================================================

/// Mock VNA with output control, a setup block, and trace channel handles.
///
/// `read_vector` fails while the stimulus output is off, which is what the
/// real instrument's stale-trace guard amounts to in practice.
pub struct MockVna {
    output: RwLock<bool>,
    settings: RwLock<VnaSettings>,
    output_log: Mutex<Vec<bool>>,
    applied: Mutex<usize>,
    events: Option<EventLog>,
}

impl MockVna {
    pub fn new(settings: VnaSettings) -> Self {
        Self {
            output: RwLock::new(false),
            settings: RwLock::new(settings),
            output_log: Mutex::new(Vec::new()),
            applied: Mutex::new(0),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    /// Current stimulus output state.
    pub async fn is_output(&self) -> bool {
        *self.output.read().await
    }

    /// Every output transition commanded, in order.
    pub fn output_transitions(&self) -> Vec<bool> {
        self.output_log.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Number of times the setup block was pushed.
    pub fn apply_count(&self) -> usize {
        self.applied.lock().map(|n| *n).unwrap_or(0)
    }

    async fn trace(&self, channel: VnaChannel) -> AppResult<Vec<f64>> {
        if !*self.output.read().await {
            return Err(SweepError::Instrument(
                "VNA trace read with stimulus output off".to_string(),
            ));
        }
        let settings = self.settings.read().await.clone();
        let points = settings.sweep_points as usize;
        let span = settings.stop_hz - settings.start_hz;
        let trace = (0..points)
            .map(|k| {
                let frac = if points > 1 {
                    k as f64 / (points - 1) as f64
                } else {
                    0.0
                };
                match channel {
                    VnaChannel::Frequency => settings.start_hz + frac * span,
                    // Shallow dip in the middle of the span, enough structure
                    // to tell traces apart in a plot.
                    VnaChannel::Primary => -3.0 - 20.0 / (1.0 + 100.0 * (frac - 0.5).powi(2)),
                    VnaChannel::Secondary => 180.0 * (frac - 0.5),
                }
            })
            .collect();
        Ok(trace)
    }
}

impl Default for MockVna {
    fn default() -> Self {
        Self::new(VnaSettings::default())
    }
}

#[async_trait]
impl VnaInstrument for MockVna {
    async fn set_output(&self, on: bool) -> AppResult<()> {
        *self.output.write().await = on;
        if let Ok(mut log) = self.output_log.lock() {
            log.push(on);
        }
        log_event(&self.events, format!("vna output {on}"));
        debug!(on, "mock vna output");
        Ok(())
    }

    async fn output(&self) -> AppResult<bool> {
        Ok(*self.output.read().await)
    }

    async fn apply(&self, settings: &VnaSettings) -> AppResult<()> {
        *self.settings.write().await = settings.clone();
        if let Ok(mut applied) = self.applied.lock() {
            *applied += 1;
        }
        log_event(&self.events, "vna apply".to_string());
        debug!(format = %settings.format, points = settings.sweep_points, "mock vna setup");
        Ok(())
    }

    fn channel(self: Arc<Self>, channel: VnaChannel) -> Arc<dyn VectorChannel> {
        Arc::new(MockVnaChannel { vna: self, channel })
    }
}

/// Readout handle for one trace channel of a [`MockVna`].
pub struct MockVnaChannel {
    vna: Arc<MockVna>,
    channel: VnaChannel,
}

#[async_trait]
impl VectorChannel for MockVnaChannel {
    async fn read_vector(&self) -> AppResult<Vec<f64>> {
        self.vna.trace(self.channel).await
    }
}

/// A small VNA setup convenient for tests: few points, no averaging.
pub fn test_vna_settings(points: u32, format: TraceFormat) -> VnaSettings {
    VnaSettings {
        format,
        sweep_points: points,
        averaging: false,
        average_count: 1,
        start_hz: 1.0e6,
        stop_hz: 2.0e6,
        power_dbm: -30.0,
        bandwidth_hz: 1.0e3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_source_records_commands() {
        let source = MockSource::new("vch");
        source.set(0.5).await.unwrap();
        source.ramp_to(1.0, Duration::ZERO).await.unwrap();

        assert_eq!(source.value().await, 1.0);
        assert_eq!(source.set_history(), vec![0.5]);
        assert_eq!(source.ramp_history(), vec![1.0]);
    }

    #[tokio::test]
    async fn mock_vna_refuses_reads_with_output_off() {
        let vna = Arc::new(MockVna::new(test_vna_settings(5, TraceFormat::LogMag)));
        let freq = vna.clone().channel(VnaChannel::Frequency);

        assert!(freq.read_vector().await.is_err());

        vna.set_output(true).await.unwrap();
        let trace = freq.read_vector().await.unwrap();
        assert_eq!(trace.len(), 5);
        assert_eq!(trace[0], 1.0e6);
        assert_eq!(trace[4], 2.0e6);
    }

    #[tokio::test]
    async fn mock_lockin_fixed_value() {
        let lockin = MockLockIn::new("vx", 7.5);
        assert_eq!(lockin.read().await.unwrap(), 7.5);
        assert_eq!(lockin.read_count(), 1);
    }
}
