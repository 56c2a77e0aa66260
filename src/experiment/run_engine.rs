//! The acquisition loop: a bounded, interruption-safe state machine that
//! ramps instruments to targets, waits for settling, triggers reads, and
//! emits sample rows.
//!
//! Three mode variants share the skeleton:
//!
//! - **No-VNA (1D/2D)**: nested step/sweep loops over scalar readouts.
//! - **VNA combined (1D)**: per sweep point, a full VNA trace plus scalar
//!   lock-in readings, one row per trace point.
//! - **VNA-only snapshot**: a single trace, transposed into per-point rows.
//!
//! Cross-mode guarantees, on every exit path including user interruption:
//! the run record is closed, temporarily detached bindings are restored with
//! their original values, and the VNA stimulus output ends up OFF.

use crate::config::TimingSettings;
use crate::data::storage::{RunSchema, RunSink, DATA_TABLE};
use crate::error::{AppResult, SweepError};
use crate::experiment::plan::{reconcile_vna_readouts, AxisPlan};
use crate::experiment::state::{RunState, StopToken};
use crate::hardware::capabilities::{ControlChannel, VnaSettings};
use crate::registry::{Registry, VnaSetup};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

/// Acquisition mode of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Single sweep axis, degenerate step.
    OneD,
    /// Sweep axis nested inside a step axis.
    TwoD,
    /// One VNA trace, no sweep/step loop.
    VnaOnly,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::OneD => f.write_str("1D"),
            RunMode::TwoD => f.write_str("2D"),
            RunMode::VnaOnly => f.write_str("VNAonly"),
        }
    }
}

impl FromStr for RunMode {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1d" => Ok(RunMode::OneD),
            "2d" => Ok(RunMode::TwoD),
            "vnaonly" | "vna-only" | "vna_only" => Ok(RunMode::VnaOnly),
            other => Err(SweepError::Configuration(format!(
                "unknown run mode '{other}' (expected 1D, 2D or VNAonly)"
            ))),
        }
    }
}

/// Operator-facing knobs for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub name: String,
    pub mode: RunMode,
    pub use_vna: bool,
    pub use_lockin: bool,
    /// When false, instruments are driven but no run record is opened.
    pub save: bool,
}

impl RunOptions {
    pub fn new(name: impl Into<String>, mode: RunMode) -> Self {
        Self {
            name: name.into(),
            mode,
            use_vna: true,
            use_lockin: true,
            save: true,
        }
    }

    pub fn without_vna(mut self) -> Self {
        self.use_vna = false;
        self
    }

    pub fn without_lockin(mut self) -> Self {
        self.use_lockin = false;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.save = false;
        self
    }
}

/// What a finished run reports back.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub state: RunState,
    /// Sample tuples emitted (written when a record was open).
    pub rows: usize,
}

/// How a loop body ended.
enum LoopEnd {
    Completed,
    Interrupted,
}

/// Settle time after enabling the VNA output, derived from the trace setup.
///
/// The thresholds are kept exactly as tuned: below 6000 points a trace with
/// averaging off needs 0.25 s, with averaging on 9 s under 50 averages and
/// `points / (averages x 10)` otherwise; above 6000 points 1 s without
/// averaging, `points / (averages x 10)` with it. The behavior at exactly
/// 6000 points was never defined, so it is rejected rather than guessed.
pub fn vna_settle_secs(settings: &VnaSettings) -> AppResult<f64> {
    if settings.averaging && settings.average_count == 0 {
        return Err(SweepError::Configuration(
            "VNA averaging is enabled with an average count of zero".to_string(),
        ));
    }
    let points = settings.sweep_points;
    if points < 6000 {
        if !settings.averaging {
            Ok(0.25)
        } else if settings.average_count < 50 {
            Ok(9.0)
        } else {
            Ok(f64::from(points) / (f64::from(settings.average_count) * 10.0))
        }
    } else if points > 6000 {
        if !settings.averaging {
            Ok(1.0)
        } else {
            Ok(f64::from(points) / (f64::from(settings.average_count) * 10.0))
        }
    } else {
        Err(SweepError::Configuration(
            "VNA settle time is undefined at exactly 6000 sweep points; \
             configure 5999 or 6001"
                .to_string(),
        ))
    }
}

/// Executes one acquisition run.
///
/// The engine exclusively owns the run record handle for the run's duration
/// and is the only mutator of the registry while a run is active.
pub struct RunEngine {
    timing: TimingSettings,
    stop: StopToken,
    state: RunState,
    row_width: usize,
    rows: usize,
    /// Mode B running counter; spans the whole run, never reset per step.
    counter: usize,
}

impl RunEngine {
    pub fn new(timing: TimingSettings, stop: StopToken) -> Self {
        Self {
            timing,
            stop,
            state: RunState::Idle,
            row_width: 0,
            rows: 0,
            counter: 0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Run the acquisition loop to completion, interruption, or failure.
    ///
    /// `schema` carries the record path and metadata; the engine fills in
    /// the mode-dependent column layout before opening the sink. Passing no
    /// sink executes the full acquisition without persisting anything.
    pub async fn execute(
        &mut self,
        registry: &mut Registry,
        sweep: &AxisPlan,
        step: &AxisPlan,
        options: &RunOptions,
        sink: Option<Box<dyn RunSink>>,
        schema: RunSchema,
    ) -> AppResult<RunOutcome> {
        if !self.state.can_begin() {
            return Err(SweepError::Configuration(format!(
                "cannot start a run while the engine is {}",
                self.state
            )));
        }

        let run_id = Uuid::new_v4().to_string();
        self.state = RunState::Initializing;
        self.rows = 0;
        self.counter = 0;
        info!(%run_id, name = %options.name, mode = %options.mode, "starting run");

        let result = if options.mode == RunMode::VnaOnly {
            self.run_vna_snapshot(registry, sink, schema).await
        } else if options.use_vna {
            if options.mode == RunMode::TwoD {
                Err(SweepError::Configuration(
                    "2D VNA runs are not supported".to_string(),
                ))
            } else {
                self.run_vna_combined(registry, sweep, options, sink, schema)
                    .await
            }
        } else if options.use_lockin {
            self.run_no_vna(registry, sweep, step, options, sink, schema)
                .await
        } else {
            Err(SweepError::Configuration(
                "a run needs at least one readout path; enable the lock-in or the VNA"
                    .to_string(),
            ))
        };

        // The stimulus must be off after every run, whatever happened above.
        if let Some(vna) = registry.vna() {
            if let Err(e) = vna.handle.set_output(false).await {
                warn!(error = %e, "failed to disable VNA output");
            }
        }

        match result {
            Ok(LoopEnd::Completed) => {
                self.state = RunState::Completed;
                info!(%run_id, rows = self.rows, "run completed");
            }
            Ok(LoopEnd::Interrupted) => {
                self.state = RunState::Interrupted;
                warn!(%run_id, rows = self.rows, "data acquisition stopped by user");
            }
            Err(e) => {
                self.state = RunState::Failed;
                return Err(e);
            }
        }

        Ok(RunOutcome {
            run_id,
            state: self.state,
            rows: self.rows,
        })
    }

    // =========================================================================
    // Mode A - no-VNA 1D/2D
    // =========================================================================

    async fn run_no_vna(
        &mut self,
        registry: &mut Registry,
        sweep: &AxisPlan,
        step: &AxisPlan,
        options: &RunOptions,
        mut sink: Option<Box<dyn RunSink>>,
        schema: RunSchema,
    ) -> AppResult<LoopEnd> {
        // VNA channels sit out no-VNA runs; they come back in finalization.
        let saved = registry.take_readouts_where(|r| r.is_vna());

        let outcome = self
            .no_vna_loop(registry, sweep, step, options, &mut sink, schema)
            .await;

        self.state = RunState::Finalizing;
        Self::close_sink(&mut sink).await;
        registry.restore_readouts(saved);
        outcome
    }

    async fn no_vna_loop(
        &mut self,
        registry: &Registry,
        sweep: &AxisPlan,
        step: &AxisPlan,
        options: &RunOptions,
        sink: &mut Option<Box<dyn RunSink>>,
        mut schema: RunSchema,
    ) -> AppResult<LoopEnd> {
        let sweep_controls = resolve_sweep_controls(registry, sweep)?;
        let step_controls = resolve_step_controls(registry, step);
        let ramp = Duration::from_secs_f64(self.timing.ramp_duration_secs);

        schema.columns = ["sweep_index", "step_index"]
            .into_iter()
            .map(String::from)
            .chain(registry.readout_keys())
            .collect();
        self.open_sink(sink, schema).await?;

        for i in 0..step.points() {
            if self.stop.is_stopped() {
                return Ok(LoopEnd::Interrupted);
            }
            self.state = RunState::OuterStep;

            if options.mode == RunMode::TwoD {
                for (handle, list) in step_controls.iter().zip(step.lists()) {
                    if let Some(handle) = handle {
                        handle.set(list[i]).await?;
                    }
                }
                // Park the sweep axis at its first point before settling.
                for (handle, list) in sweep_controls.iter().zip(sweep.lists()) {
                    handle.ramp_to(list[0], ramp).await?;
                }
                self.pause(self.timing.step_settle_secs).await;
            }

            self.state = RunState::InnerSweep;
            for j in 0..sweep.points() {
                if self.stop.is_stopped() {
                    return Ok(LoopEnd::Interrupted);
                }
                for (handle, list) in sweep_controls.iter().zip(sweep.lists()) {
                    handle.set(list[j]).await?;
                }
                self.pause(3.0 * self.timing.settle_const_secs).await;

                let mut row = Vec::with_capacity(self.row_width);
                row.push(j as f64);
                row.push(i as f64);
                for readout in registry.readouts() {
                    row.push(readout.read_scalar().await?);
                }
                self.emit(sink, row).await?;
            }
            info!(step = i + 1, of = step.points(), "outer step finished");
        }
        Ok(LoopEnd::Completed)
    }

    // =========================================================================
    // Mode B - VNA combined (1D)
    // =========================================================================

    async fn run_vna_combined(
        &mut self,
        registry: &mut Registry,
        sweep: &AxisPlan,
        options: &RunOptions,
        mut sink: Option<Box<dyn RunSink>>,
        schema: RunSchema,
    ) -> AppResult<LoopEnd> {
        reconcile_vna_readouts(registry)?;
        let saved = if options.use_lockin {
            Vec::new()
        } else {
            registry.take_readouts_where(|r| !r.is_vna())
        };

        let outcome = self
            .vna_combined_loop(registry, sweep, &mut sink, schema)
            .await;

        self.state = RunState::Finalizing;
        Self::close_sink(&mut sink).await;
        registry.restore_readouts(saved);
        outcome
    }

    async fn vna_combined_loop(
        &mut self,
        registry: &Registry,
        sweep: &AxisPlan,
        sink: &mut Option<Box<dyn RunSink>>,
        mut schema: RunSchema,
    ) -> AppResult<LoopEnd> {
        let vna = require_vna(registry)?;
        let vna_settle = vna_settle_secs(&vna.settings)?;
        let sweep_controls = resolve_sweep_controls(registry, sweep)?;
        let ramp = Duration::from_secs_f64(self.timing.ramp_duration_secs);

        let scalar_reads: Vec<_> = registry.readouts().iter().filter(|r| !r.is_vna()).collect();
        let vector_reads: Vec<_> = registry.readouts().iter().filter(|r| r.is_vna()).collect();

        schema.columns = ["counter", "step_index"]
            .into_iter()
            .map(String::from)
            .chain(scalar_reads.iter().map(|r| r.key().to_string()))
            .chain(vector_reads.iter().map(|r| r.key().to_string()))
            .collect();
        self.open_sink(sink, schema).await?;

        for i in 0..sweep.points() {
            if self.stop.is_stopped() {
                return Ok(LoopEnd::Interrupted);
            }
            self.state = RunState::OuterStep;

            for (handle, list) in sweep_controls.iter().zip(sweep.lists()) {
                handle.ramp_to(list[i], ramp).await?;
            }
            self.pause(self.timing.step_settle_secs).await;

            // Guard against stale trace state: a still-enabled output from
            // the previous point is cycled before re-triggering.
            if vna.handle.output().await? {
                vna.handle.set_output(false).await?;
            }

            for (handle, list) in sweep_controls.iter().zip(sweep.lists()) {
                handle.set(list[i]).await?;
            }
            self.pause(3.0 * self.timing.settle_const_secs).await;

            vna.handle.set_output(true).await?;
            self.pause(vna_settle).await;

            self.state = RunState::InnerSweep;
            let mut lockins = Vec::with_capacity(scalar_reads.len());
            for readout in &scalar_reads {
                lockins.push(readout.read_scalar().await?);
            }
            let mut traces = Vec::with_capacity(vector_reads.len());
            for readout in &vector_reads {
                traces.push(readout.read_vector().await?);
            }
            let points = trace_length(&traces)?;

            for k in 0..points {
                if self.stop.is_stopped() {
                    return Ok(LoopEnd::Interrupted);
                }
                let mut row = Vec::with_capacity(self.row_width);
                row.push(self.counter as f64);
                row.push(i as f64);
                row.extend_from_slice(&lockins);
                for trace in &traces {
                    row.push(trace[k]);
                }
                self.counter += 1;
                self.emit(sink, row).await?;
            }
            info!(point = i + 1, of = sweep.points(), "VNA sweep point finished");
        }
        Ok(LoopEnd::Completed)
    }

    // =========================================================================
    // Mode C - VNA-only snapshot
    // =========================================================================

    async fn run_vna_snapshot(
        &mut self,
        registry: &mut Registry,
        mut sink: Option<Box<dyn RunSink>>,
        schema: RunSchema,
    ) -> AppResult<LoopEnd> {
        reconcile_vna_readouts(registry)?;
        // A snapshot touches nothing but the VNA: every other readout and
        // every control binding sits out the run.
        let saved_reads = registry.take_readouts_where(|r| !r.is_vna());
        let saved_controls = registry.take_controls();

        let outcome = self.vna_snapshot_loop(registry, &mut sink, schema).await;

        self.state = RunState::Finalizing;
        Self::close_sink(&mut sink).await;
        registry.restore_readouts(saved_reads);
        registry.restore_controls(saved_controls);
        outcome
    }

    async fn vna_snapshot_loop(
        &mut self,
        registry: &Registry,
        sink: &mut Option<Box<dyn RunSink>>,
        mut schema: RunSchema,
    ) -> AppResult<LoopEnd> {
        let vna = require_vna(registry)?;

        vna.handle.set_output(true).await?;
        self.pause(self.timing.vna_output_settle_secs).await;

        schema.columns = ["point_index", "step_index"]
            .into_iter()
            .map(String::from)
            .chain(registry.readout_keys())
            .collect();
        self.open_sink(sink, schema).await?;

        self.state = RunState::InnerSweep;
        let mut traces = Vec::new();
        for readout in registry.readouts() {
            traces.push(readout.read_vector().await?);
        }
        let points = trace_length(&traces)?;

        for k in 0..points {
            if self.stop.is_stopped() {
                return Ok(LoopEnd::Interrupted);
            }
            let mut row = Vec::with_capacity(self.row_width);
            row.push(k as f64);
            row.push(0.0);
            for trace in &traces {
                row.push(trace[k]);
            }
            self.emit(sink, row).await?;
        }
        Ok(LoopEnd::Completed)
    }

    // =========================================================================
    // Shared plumbing
    // =========================================================================

    async fn pause(&self, secs: f64) {
        if secs > 0.0 {
            sleep(Duration::from_secs_f64(secs)).await;
        }
    }

    async fn open_sink(
        &mut self,
        sink: &mut Option<Box<dyn RunSink>>,
        schema: RunSchema,
    ) -> AppResult<()> {
        self.row_width = schema.columns.len();
        if let Some(sink) = sink {
            sink.open(&schema).await?;
        }
        Ok(())
    }

    /// Emit one sample tuple. Shape checking lives here, not in the sink.
    async fn emit(
        &mut self,
        sink: &mut Option<Box<dyn RunSink>>,
        row: Vec<f64>,
    ) -> AppResult<()> {
        if row.len() != self.row_width {
            return Err(SweepError::Storage(format!(
                "row has {} columns, run record expects {}",
                row.len(),
                self.row_width
            )));
        }
        if let Some(sink) = sink {
            sink.write_row(DATA_TABLE, &row).await?;
        }
        self.rows += 1;
        Ok(())
    }

    async fn close_sink(sink: &mut Option<Box<dyn RunSink>>) {
        if let Some(mut sink) = sink.take() {
            if let Err(e) = sink.close().await {
                warn!(error = %e, "failed to close run record");
            }
        }
    }
}

fn require_vna(registry: &Registry) -> AppResult<VnaSetup> {
    registry.vna().cloned().ok_or_else(|| {
        SweepError::Configuration("this run mode requires a VNA binding".to_string())
    })
}

/// Sweep variables must all resolve to control bindings.
fn resolve_sweep_controls(
    registry: &Registry,
    plan: &AxisPlan,
) -> AppResult<Vec<Arc<dyn ControlChannel>>> {
    plan.variables()
        .iter()
        .map(|var| {
            registry
                .control(var)
                .map(|binding| binding.handle())
                .ok_or_else(|| {
                    SweepError::Configuration(format!(
                        "sweep variable '{var}' has no control binding"
                    ))
                })
        })
        .collect()
}

/// Step variables without a binding (the degenerate `None` axis) are skipped.
fn resolve_step_controls(
    registry: &Registry,
    plan: &AxisPlan,
) -> Vec<Option<Arc<dyn ControlChannel>>> {
    plan.variables()
        .iter()
        .map(|var| registry.control(var).map(|binding| binding.handle()))
        .collect()
}

fn trace_length(traces: &[Vec<f64>]) -> AppResult<usize> {
    let points = traces.first().map_or(0, Vec::len);
    if traces.iter().any(|trace| trace.len() != points) {
        return Err(SweepError::Instrument(
            "VNA channels returned traces of unequal length".to_string(),
        ));
    }
    Ok(points)
}
