//! Integration tests for the acquisition loop.
//!
//! Drives the full engine against mock instruments and an in-memory sink:
//! row emission order, interruption safety, binding restoration, and VNA
//! output discipline.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use sweepstation::config::{Settings, StorageSettings, TimingSettings};
use sweepstation::data::storage::MemorySink;
use sweepstation::error::AppResult;
use sweepstation::experiment::{
    Experiment, RunMode, RunOptions, RunState, StopToken, SweepRequest,
};
use sweepstation::hardware::capabilities::{
    ScalarChannel, TraceFormat, VectorChannel, VnaChannel, VnaInstrument,
};
use sweepstation::hardware::mock::{
    test_vna_settings, MockFaultyLockIn, MockLockIn, MockSource, MockVna,
};
use sweepstation::registry::{ControlBinding, ReadoutBinding, ValueSpec};

/// Settings with every settle pause zeroed so runs finish immediately.
fn fast_settings() -> Settings {
    Settings {
        storage: StorageSettings {
            data_dir: "data".to_string(),
            default_format: "csv".to_string(),
        },
        timing: TimingSettings {
            settle_const_secs: 0.0,
            step_settle_secs: 0.0,
            ramp_duration_secs: 0.0,
            vna_output_settle_secs: 0.0,
        },
        ..Settings::default()
    }
}

struct Rig {
    experiment: Experiment,
    vch: Arc<MockSource>,
    vna: Arc<MockVna>,
}

/// Two sources, one lock-in channel reading a fixed 7.5, and a VNA with
/// `vna_points` trace points.
fn build_rig(vna_points: u32) -> Rig {
    let mut experiment = Experiment::new(fast_settings());
    let vch = Arc::new(MockSource::new("Vch"));
    let vac = Arc::new(MockSource::new("Vac"));
    let vna_settings = test_vna_settings(vna_points, TraceFormat::LogMag);
    let vna = Arc::new(MockVna::new(vna_settings.clone()));

    let registry = experiment.registry_mut();
    registry
        .add_control(
            ControlBinding::new("Vch", "V", vch.clone()),
            ValueSpec::Scalar(0.0),
        )
        .unwrap();
    registry
        .add_control(
            ControlBinding::new("Vac", "Vpp", vac),
            ValueSpec::Scalar(0.05),
        )
        .unwrap();

    registry.add_readout(ReadoutBinding::scalar(
        "Vx",
        "V",
        Arc::new(MockLockIn::new("Vx", 7.5)),
    ));
    registry.set_vna(vna.clone(), vna_settings);
    registry.add_readout(ReadoutBinding::vector(
        "vna_freq",
        "Hz",
        vna.clone().channel(VnaChannel::Frequency),
    ));
    registry.add_readout(ReadoutBinding::vector(
        "vna_y1",
        "U",
        vna.clone().channel(VnaChannel::Primary),
    ));

    Rig {
        experiment,
        vch,
        vna,
    }
}

#[tokio::test]
async fn two_d_run_emits_rows_in_acquisition_order() {
    let mut rig = build_rig(4);
    rig.experiment
        .sweep_params(SweepRequest::new("Vch", 0.0, 1.0, 3))
        .unwrap();
    rig.experiment
        .step_params(Some(SweepRequest::new("Vac", 0.0, 0.5, 2)))
        .unwrap();

    let sink = MemorySink::new();
    let options = RunOptions::new("order_test", RunMode::TwoD).without_vna();
    let outcome = rig
        .experiment
        .run_with_sink(options, Some(Box::new(sink.clone())))
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.rows, 6);

    let rows = sink.rows();
    assert_eq!(rows.len(), 6);
    let pairs: Vec<(usize, usize)> = rows
        .iter()
        .map(|(_, row)| (row[0] as usize, row[1] as usize))
        .collect();
    assert_eq!(pairs, [(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (2, 1)]);
    for (_, row) in &rows {
        assert_eq!(row.len(), 3);
        assert_eq!(row[2], 7.5);
    }

    let schema = sink.schema().unwrap();
    assert_eq!(schema.columns, ["sweep_index", "step_index", "Vx"]);

    // VNA channels sat the run out and are back afterwards.
    let keys = rig.experiment.registry().readout_keys();
    assert_eq!(keys, ["Vx", "vna_freq", "vna_y1"]);
    assert_eq!(sink.close_count(), 1);
}

/// Lock-in channel that requests a stop after a fixed number of readings.
struct StopAfterReads {
    value: f64,
    after: usize,
    reads: AtomicUsize,
    stop: StopToken,
}

#[async_trait]
impl ScalarChannel for StopAfterReads {
    async fn read(&self) -> AppResult<f64> {
        if self.reads.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
            self.stop.stop();
        }
        Ok(self.value)
    }
}

#[tokio::test]
async fn interruption_mid_sweep_closes_the_record_and_restores_bindings() {
    let mut rig = build_rig(4);
    let stop = rig.experiment.stop_token();
    rig.experiment.registry_mut().remove_readout("Vx");
    rig.experiment
        .registry_mut()
        .add_readout(ReadoutBinding::scalar(
            "Vx",
            "V",
            Arc::new(StopAfterReads {
                value: 7.5,
                after: 2,
                reads: AtomicUsize::new(0),
                stop,
            }),
        ));

    rig.experiment
        .sweep_params(SweepRequest::new("Vch", 0.0, 1.0, 5))
        .unwrap();

    let sink = MemorySink::new();
    let options = RunOptions::new("interrupt_test", RunMode::OneD).without_vna();
    let outcome = rig
        .experiment
        .run_with_sink(options, Some(Box::new(sink.clone())))
        .await
        .unwrap();

    // The stop lands during the second reading; its row still goes out, then
    // the loop finalizes instead of starting point three.
    assert_eq!(outcome.state, RunState::Interrupted);
    assert_eq!(outcome.rows, 2);
    assert_eq!(sink.rows().len(), 2);
    assert_eq!(sink.close_count(), 1);
    assert!(!sink.is_open());

    // Detached VNA readouts are back, and control values are untouched.
    let keys = rig.experiment.registry().readout_keys();
    assert!(keys.contains(&"vna_freq".to_string()));
    assert!(keys.contains(&"vna_y1".to_string()));
    assert_eq!(
        rig.experiment.registry().value("Vch"),
        Some(ValueSpec::Scalar(0.0))
    );
}

#[tokio::test]
async fn vna_combined_run_keeps_one_running_counter() {
    let mut rig = build_rig(4);
    rig.experiment
        .sweep_params(SweepRequest::new("Vch", 0.0, 1.0, 2))
        .unwrap();
    rig.experiment.step_params(None).unwrap();

    let sink = MemorySink::new();
    let options = RunOptions::new("vna_combined", RunMode::OneD);
    let outcome = rig
        .experiment
        .run_with_sink(options, Some(Box::new(sink.clone())))
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.rows, 8); // 2 sweep points x 4 trace points

    let rows = sink.rows();
    let schema = sink.schema().unwrap();
    assert_eq!(
        schema.columns,
        ["counter", "step_index", "Vx", "vna_freq", "vna_y1"]
    );
    for (index, (_, row)) in rows.iter().enumerate() {
        assert_eq!(row.len(), 5);
        // The counter spans the whole run without resetting per step.
        assert_eq!(row[0] as usize, index);
        assert_eq!(row[2], 7.5);
    }
    assert_eq!(rows[0].1[1], 0.0);
    assert_eq!(rows[7].1[1], 1.0);

    // Output cycled per point, forced off at the end.
    assert!(!rig.vna.is_output().await);
    assert_eq!(rig.vna.output_transitions().last(), Some(&false));
}

#[tokio::test]
async fn vna_snapshot_forces_output_on_then_off() {
    let mut rig = build_rig(5);
    let sink = MemorySink::new();
    let options = RunOptions::new("snapshot", RunMode::VnaOnly);
    let outcome = rig
        .experiment
        .run_with_sink(options, Some(Box::new(sink.clone())))
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.rows, 5);

    let rows = sink.rows();
    let schema = sink.schema().unwrap();
    assert_eq!(schema.columns, ["point_index", "step_index", "vna_freq", "vna_y1"]);
    for (k, (_, row)) in rows.iter().enumerate() {
        assert_eq!(row[0] as usize, k);
        assert_eq!(row[1], 0.0);
    }

    // The trace read only succeeds with the stimulus on (the mock enforces
    // it), and the run leaves the output off.
    let transitions = rig.vna.output_transitions();
    assert_eq!(transitions.first(), Some(&true));
    assert_eq!(transitions.last(), Some(&false));
    assert!(!rig.vna.is_output().await);

    // Controls and scalar readouts were detached for the snapshot and are
    // back with their values.
    assert_eq!(
        rig.experiment.registry().value("Vch"),
        Some(ValueSpec::Scalar(0.0))
    );
    assert!(rig
        .experiment
        .registry()
        .readout_keys()
        .contains(&"Vx".to_string()));
}

/// Trace channel that requests a stop as soon as it is read.
struct StoppingTrace {
    inner: Arc<dyn VectorChannel>,
    stop: StopToken,
}

#[async_trait]
impl VectorChannel for StoppingTrace {
    async fn read_vector(&self) -> AppResult<Vec<f64>> {
        let trace = self.inner.read_vector().await?;
        self.stop.stop();
        Ok(trace)
    }
}

#[tokio::test]
async fn interrupted_snapshot_still_disables_the_output() {
    let mut rig = build_rig(5);
    let stop = rig.experiment.stop_token();
    let inner = rig.vna.clone().channel(VnaChannel::Primary);
    rig.experiment.registry_mut().remove_readout("vna_y1");
    rig.experiment
        .registry_mut()
        .add_readout(ReadoutBinding::vector(
            "vna_y1",
            "U",
            Arc::new(StoppingTrace { inner, stop }),
        ));

    let sink = MemorySink::new();
    let options = RunOptions::new("snapshot_interrupt", RunMode::VnaOnly);
    let outcome = rig
        .experiment
        .run_with_sink(options, Some(Box::new(sink.clone())))
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Interrupted);
    assert_eq!(outcome.rows, 0);
    assert_eq!(sink.close_count(), 1);
    assert!(!rig.vna.is_output().await);
    assert!(rig.experiment.registry().control("Vch").is_some());
}

#[tokio::test]
async fn instrument_failure_still_closes_the_record_and_restores_bindings() {
    let mut rig = build_rig(4);
    rig.experiment
        .registry_mut()
        .add_readout(ReadoutBinding::scalar(
            "Vy",
            "V",
            Arc::new(MockFaultyLockIn::new("lockin_hf")),
        ));
    rig.experiment
        .sweep_params(SweepRequest::new("Vch", 0.0, 1.0, 3))
        .unwrap();

    let sink = MemorySink::new();
    let options = RunOptions::new("fault_test", RunMode::OneD).without_vna();
    let err = rig
        .experiment
        .run_with_sink(options, Some(Box::new(sink.clone())))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("Checksum mismatch"));
    assert_eq!(sink.close_count(), 1);
    assert!(!sink.is_open());
    assert!(rig
        .experiment
        .registry()
        .readout_keys()
        .contains(&"vna_freq".to_string()));
}

#[tokio::test]
async fn dry_run_drives_instruments_without_opening_a_record() {
    let mut rig = build_rig(4);
    rig.experiment
        .sweep_params(SweepRequest::new("Vch", 0.0, 1.0, 3))
        .unwrap();

    let sink = MemorySink::new();
    let options = RunOptions::new("dry", RunMode::OneD)
        .without_vna()
        .dry_run();
    let outcome = rig
        .experiment
        .run_with_sink(options, Some(Box::new(sink.clone())))
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.rows, 3);
    assert_eq!(sink.open_count(), 0);
    assert!(sink.rows().is_empty());

    // The sweep axis was really driven.
    assert_eq!(rig.vch.set_history(), vec![0.0, 0.5, 1.0]);
}
