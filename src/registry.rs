//! Parameter registry for control and readout bindings.
//!
//! The registry is the uniform read/write surface over everything the rig
//! exposes: control channels (voltage sources, signal generators), scalar
//! readouts (lock-in outputs), VNA trace channels, and the VNA setup block.
//! The acquisition loop resolves variable names through it instead of
//! reflecting over object members, and every binding is an explicit record
//! with fixed capability interfaces.
//!
//! Bindings are immutable once registered, but may be temporarily detached
//! for the duration of a run (e.g. excluding VNA channels from a no-VNA run)
//! and restored afterwards with their original values preserved.

use crate::config::TimingSettings;
use crate::error::{AppResult, SweepError};
use crate::hardware::capabilities::{
    ControlChannel, ScalarChannel, VectorChannel, VnaInstrument, VnaSettings,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

/// Substring marking a readout key as VNA-sourced.
pub const VNA_KEY_TAG: &str = "vna";
/// Readout key of the VNA frequency axis.
pub const VNA_FREQ_KEY: &str = "vna_freq";
/// Readout key of the primary VNA trace channel.
pub const VNA_PRIMARY_KEY: &str = "vna_y1";
/// Readout key of the secondary VNA trace channel.
pub const VNA_SECONDARY_KEY: &str = "vna_y2";

/// Whether a readout key is VNA-sourced.
pub fn is_vna_key(key: &str) -> bool {
    key.contains(VNA_KEY_TAG)
}

// =============================================================================
// Values
// =============================================================================

/// A control set-point: either a bare scalar or a (value, offset) pair.
///
/// The effective physical value is always `val - off`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueSpec {
    Scalar(f64),
    Offset { val: f64, off: f64 },
}

impl ValueSpec {
    /// The value actually sent to the instrument.
    pub fn effective(&self) -> f64 {
        match self {
            ValueSpec::Scalar(val) => *val,
            ValueSpec::Offset { val, off } => val - off,
        }
    }
}

impl fmt::Display for ValueSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueSpec::Scalar(val) => f.write_str(&group_thousands(*val)),
            ValueSpec::Offset { val, off } => write!(
                f,
                "{} / off={}",
                group_thousands(*val),
                group_thousands(*off)
            ),
        }
    }
}

impl From<f64> for ValueSpec {
    fn from(val: f64) -> Self {
        ValueSpec::Scalar(val)
    }
}

/// Format a number with thousands separators in the integer part.
pub fn group_thousands(value: f64) -> String {
    let raw = format!("{value}");
    let (sign, rest) = match raw.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", raw.as_str()),
    };
    let (int_part, frac_part) = match rest.split_once('.') {
        Some((int_part, frac_part)) => (int_part, Some(frac_part)),
        None => (rest, None),
    };

    let mut grouped = String::with_capacity(raw.len() + int_part.len() / 3);
    grouped.push_str(sign);
    let digits = int_part.len();
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (digits - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if let Some(frac) = frac_part {
        grouped.push('.');
        grouped.push_str(frac);
    }
    grouped
}

// =============================================================================
// Bindings
// =============================================================================

/// Maps a logical variable name to a control channel. Immutable once built.
#[derive(Clone)]
pub struct ControlBinding {
    name: String,
    unit: String,
    handle: Arc<dyn ControlChannel>,
}

impl ControlBinding {
    pub fn new(
        name: impl Into<String>,
        unit: impl Into<String>,
        handle: Arc<dyn ControlChannel>,
    ) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn handle(&self) -> Arc<dyn ControlChannel> {
        self.handle.clone()
    }
}

/// The source side of a readout binding.
#[derive(Clone)]
pub enum ReadoutSource {
    /// One value per trigger.
    Scalar(Arc<dyn ScalarChannel>),
    /// A full trace per trigger (VNA channels).
    Vector(Arc<dyn VectorChannel>),
}

/// Maps a readout key to a measurement channel. Immutable once built.
#[derive(Clone)]
pub struct ReadoutBinding {
    key: String,
    unit: String,
    source: ReadoutSource,
}

impl ReadoutBinding {
    pub fn scalar(
        key: impl Into<String>,
        unit: impl Into<String>,
        handle: Arc<dyn ScalarChannel>,
    ) -> Self {
        Self {
            key: key.into(),
            unit: unit.into(),
            source: ReadoutSource::Scalar(handle),
        }
    }

    pub fn vector(
        key: impl Into<String>,
        unit: impl Into<String>,
        handle: Arc<dyn VectorChannel>,
    ) -> Self {
        Self {
            key: key.into(),
            unit: unit.into(),
            source: ReadoutSource::Vector(handle),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Whether this readout is VNA-sourced (keyed with the reserved tag).
    pub fn is_vna(&self) -> bool {
        is_vna_key(&self.key)
    }

    /// Take one scalar reading. Fails on vector-sourced bindings.
    pub async fn read_scalar(&self) -> AppResult<f64> {
        match &self.source {
            ReadoutSource::Scalar(channel) => channel.read().await,
            ReadoutSource::Vector(_) => Err(SweepError::Configuration(format!(
                "readout '{}' is a vector channel, not a scalar",
                self.key
            ))),
        }
    }

    /// Read the full trace. Fails on scalar-sourced bindings.
    pub async fn read_vector(&self) -> AppResult<Vec<f64>> {
        match &self.source {
            ReadoutSource::Vector(channel) => channel.read_vector().await,
            ReadoutSource::Scalar(_) => Err(SweepError::Configuration(format!(
                "readout '{}' is a scalar channel, not a vector",
                self.key
            ))),
        }
    }
}

/// The VNA handle plus the setup block pushed to it during initialization.
#[derive(Clone)]
pub struct VnaSetup {
    pub handle: Arc<dyn VnaInstrument>,
    pub settings: VnaSettings,
}

struct ControlEntry {
    binding: ControlBinding,
    value: ValueSpec,
    /// Sweep/step annotation shown in place of the value once a plan claims
    /// this variable.
    summary: Option<String>,
}

/// Control bindings detached from the registry for the duration of a run.
///
/// Opaque so the only way back is [`Registry::restore_controls`], which
/// reinstates the exact prior values.
pub struct DetachedControls(Vec<ControlEntry>);

impl DetachedControls {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Uniform, ordered registry of every configured binding.
///
/// Controls and readouts keep their registration order; that order fixes the
/// column order of persisted rows.
#[derive(Default)]
pub struct Registry {
    controls: Vec<ControlEntry>,
    readouts: Vec<ReadoutBinding>,
    vna: Option<VnaSetup>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a control binding with its initial set-point.
    pub fn add_control(
        &mut self,
        binding: ControlBinding,
        initial: impl Into<ValueSpec>,
    ) -> AppResult<()> {
        if self.controls.iter().any(|e| e.binding.name == binding.name) {
            return Err(SweepError::Configuration(format!(
                "control '{}' is already registered",
                binding.name
            )));
        }
        self.controls.push(ControlEntry {
            binding,
            value: initial.into(),
            summary: None,
        });
        Ok(())
    }

    /// The binding registered under `name`, if any.
    pub fn control(&self, name: &str) -> Option<&ControlBinding> {
        self.controls
            .iter()
            .find(|e| e.binding.name == name)
            .map(|e| &e.binding)
    }

    /// Names of all registered controls, in registration order.
    pub fn control_names(&self) -> Vec<String> {
        self.controls
            .iter()
            .map(|e| e.binding.name.clone())
            .collect()
    }

    /// Update the set-point of a registered control.
    pub fn set_value(&mut self, name: &str, value: impl Into<ValueSpec>) -> AppResult<()> {
        let entry = self
            .controls
            .iter_mut()
            .find(|e| e.binding.name == name)
            .ok_or_else(|| {
                SweepError::Configuration(format!("unknown control '{name}'"))
            })?;
        entry.value = value.into();
        Ok(())
    }

    /// Current set-point of a control.
    pub fn value(&self, name: &str) -> Option<ValueSpec> {
        self.controls
            .iter()
            .find(|e| e.binding.name == name)
            .map(|e| e.value)
    }

    /// Annotate a control with its sweep/step summary for display.
    pub fn set_summary(&mut self, name: &str, summary: impl Into<String>) -> AppResult<()> {
        let entry = self
            .controls
            .iter_mut()
            .find(|e| e.binding.name == name)
            .ok_or_else(|| {
                SweepError::Configuration(format!("unknown control '{name}'"))
            })?;
        entry.summary = Some(summary.into());
        Ok(())
    }

    /// Drop all sweep/step annotations.
    pub fn clear_summaries(&mut self) {
        for entry in &mut self.controls {
            entry.summary = None;
        }
    }

    /// Attach the VNA handle and its setup block.
    pub fn set_vna(&mut self, handle: Arc<dyn VnaInstrument>, settings: VnaSettings) {
        self.vna = Some(VnaSetup { handle, settings });
    }

    pub fn vna(&self) -> Option<&VnaSetup> {
        self.vna.as_ref()
    }

    /// Register a readout. Adding an existing key is a no-op; the original
    /// binding is never silently overwritten.
    pub fn add_readout(&mut self, binding: ReadoutBinding) {
        if self.readouts.iter().any(|r| r.key == binding.key) {
            return;
        }
        self.readouts.push(binding);
    }

    /// Remove a readout, returning the binding so it can be restored later.
    /// Removing a nonexistent key is a no-op.
    pub fn remove_readout(&mut self, key: &str) -> Option<ReadoutBinding> {
        let index = self.readouts.iter().position(|r| r.key == key)?;
        Some(self.readouts.remove(index))
    }

    /// All readouts in registration order.
    pub fn readouts(&self) -> &[ReadoutBinding] {
        &self.readouts
    }

    /// Readout keys in registration order.
    pub fn readout_keys(&self) -> Vec<String> {
        self.readouts.iter().map(|r| r.key.clone()).collect()
    }

    /// Detach every readout matching `predicate`, preserving order.
    pub fn take_readouts_where<F>(&mut self, predicate: F) -> Vec<ReadoutBinding>
    where
        F: Fn(&ReadoutBinding) -> bool,
    {
        let mut taken = Vec::new();
        let mut index = 0;
        while index < self.readouts.len() {
            if predicate(&self.readouts[index]) {
                taken.push(self.readouts.remove(index));
            } else {
                index += 1;
            }
        }
        taken
    }

    /// Reattach previously detached readouts. Idempotent per key.
    pub fn restore_readouts(&mut self, bindings: Vec<ReadoutBinding>) {
        for binding in bindings {
            self.add_readout(binding);
        }
    }

    /// Detach every control binding, set-points included.
    pub fn take_controls(&mut self) -> DetachedControls {
        DetachedControls(std::mem::take(&mut self.controls))
    }

    /// Reattach previously detached controls with their exact prior values.
    pub fn restore_controls(&mut self, detached: DetachedControls) {
        for entry in detached.0 {
            if !self
                .controls
                .iter()
                .any(|e| e.binding.name == entry.binding.name)
            {
                self.controls.push(entry);
            }
        }
    }

    /// Ordered `(name, formatted value)` pairs for operator display.
    ///
    /// Numeric values are thousands-grouped; `(val, off)` pairs render as
    /// `"val / off=off"`; planned variables show their sweep summary.
    pub fn display_rows(&self) -> Vec<(String, String)> {
        let mut rows: Vec<(String, String)> = self
            .controls
            .iter()
            .map(|e| {
                let value = match &e.summary {
                    Some(summary) => summary.clone(),
                    None => e.value.to_string(),
                };
                (e.binding.name.clone(), value)
            })
            .collect();

        if let Some(vna) = &self.vna {
            let s = &vna.settings;
            rows.push(("vna_format".into(), s.format.to_string()));
            rows.push(("vna_sweep_pts".into(), group_thousands(s.sweep_points.into())));
            rows.push((
                "vna_avg".into(),
                if s.averaging { "ON" } else { "OFF" }.into(),
            ));
            rows.push(("vna_num_avg".into(), group_thousands(s.average_count.into())));
            rows.push(("vna_power".into(), group_thousands(s.power_dbm)));
            rows.push(("vna_f_start".into(), group_thousands(s.start_hz)));
            rows.push(("vna_f_stop".into(), group_thousands(s.stop_hz)));
        }

        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Drive every binding to its configured state.
    ///
    /// Phase 1 ramps all DC controls to their effective values and waits one
    /// ramp duration for physical settling. Phase 2 then pushes the VNA setup
    /// block and waits again. The ordering is required: the VNA calibration
    /// state may depend on a settled bias point.
    pub async fn initialize(&self, timing: &TimingSettings) -> AppResult<()> {
        let ramp = Duration::from_secs_f64(timing.ramp_duration_secs);

        for entry in &self.controls {
            entry
                .binding
                .handle
                .ramp_to(entry.value.effective(), ramp)
                .await?;
        }
        sleep(ramp).await;

        if let Some(vna) = &self.vna {
            vna.handle.apply(&vna.settings).await?;
        }
        sleep(ramp).await;

        info!("instruments initialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{test_vna_settings, EventLog, MockLockIn, MockSource, MockVna};
    use crate::hardware::TraceFormat;
    use std::sync::Mutex;

    fn registry_with_source(name: &str, initial: ValueSpec) -> (Registry, Arc<MockSource>) {
        let source = Arc::new(MockSource::new(name));
        let mut registry = Registry::new();
        registry
            .add_control(ControlBinding::new(name, "V", source.clone()), initial)
            .unwrap();
        (registry, source)
    }

    #[test]
    fn group_thousands_formats() {
        assert_eq!(group_thousands(200_000_462.0), "200,000,462");
        assert_eq!(group_thousands(1234.5678), "1,234.5678");
        assert_eq!(group_thousands(-4500.0), "-4,500");
        assert_eq!(group_thousands(0.2), "0.2");
    }

    #[test]
    fn value_spec_effective_subtracts_offset() {
        assert_eq!(ValueSpec::Scalar(0.5).effective(), 0.5);
        assert_eq!(ValueSpec::Offset { val: 0.2, off: -1.0 }.effective(), 1.2);
    }

    #[test]
    fn value_spec_display() {
        let spec = ValueSpec::Offset { val: 4_000_000.0, off: 0.5 };
        assert_eq!(spec.to_string(), "4,000,000 / off=0.5");
    }

    #[test]
    fn duplicate_control_is_rejected() {
        let (mut registry, source) = registry_with_source("vch", ValueSpec::Scalar(0.0));
        let err = registry
            .add_control(ControlBinding::new("vch", "V", source), ValueSpec::Scalar(1.0))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn add_readout_is_idempotent() {
        let mut registry = Registry::new();
        let lockin = Arc::new(MockLockIn::new("vx", 1.0));
        registry.add_readout(ReadoutBinding::scalar("Vx", "V", lockin.clone()));
        registry.add_readout(ReadoutBinding::scalar("Vx", "mV", lockin));

        assert_eq!(registry.readouts().len(), 1);
        // The first binding wins; no silent overwrite.
        assert_eq!(registry.readouts()[0].unit(), "V");

        assert!(registry.remove_readout("nope").is_none());
        assert!(registry.remove_readout("Vx").is_some());
        assert!(registry.remove_readout("Vx").is_none());
    }

    #[test]
    fn detach_and_restore_preserves_values() {
        let (mut registry, _source) = registry_with_source(
            "vgt",
            ValueSpec::Offset { val: 0.2, off: -1.0 },
        );
        let detached = registry.take_controls();
        assert!(registry.control("vgt").is_none());

        registry.restore_controls(detached);
        assert_eq!(
            registry.value("vgt"),
            Some(ValueSpec::Offset { val: 0.2, off: -1.0 })
        );
    }

    #[test]
    fn display_rows_use_summary_when_planned() {
        let (mut registry, _source) = registry_with_source("vch", ValueSpec::Scalar(0.2));
        registry
            .set_summary("vch", "sweep / 0.2 : 1 / num=51 / linear / off=0")
            .unwrap();
        let rows = registry.display_rows();
        assert_eq!(rows[0].0, "vch");
        assert!(rows[0].1.starts_with("sweep /"));
    }

    #[tokio::test]
    async fn initialize_ramps_controls_before_vna_setup() {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let source = Arc::new(MockSource::new("vch").with_events(events.clone()));
        let vna = Arc::new(
            MockVna::new(test_vna_settings(11, TraceFormat::LogMag)).with_events(events.clone()),
        );

        let mut registry = Registry::new();
        registry
            .add_control(
                ControlBinding::new("vch", "V", source),
                ValueSpec::Offset { val: 0.5, off: 0.1 },
            )
            .unwrap();
        registry.set_vna(vna, test_vna_settings(11, TraceFormat::LogMag));

        let timing = TimingSettings {
            ramp_duration_secs: 0.0,
            ..TimingSettings::default()
        };
        registry.initialize(&timing).await.unwrap();

        let log = events.lock().unwrap().clone();
        assert_eq!(log, vec!["vch ramp 0.4".to_string(), "vna apply".to_string()]);
    }
}
