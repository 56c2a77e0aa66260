//! Experiment session: sweep planning, run dispatch, and record naming.
//!
//! An [`Experiment`] owns the parameter registry, the current sweep/step
//! plans, and the stop token. [`Experiment::run`] dispatches one acquisition
//! to the [`run_engine::RunEngine`] with the right sink and schema.

pub mod plan;
pub mod run_engine;
pub mod state;
pub mod sweep;

pub use plan::{
    classify_duration, describe_duration, estimate_run_secs, plan_summaries,
    reconcile_vna_readouts, AxisPlan, DurationClass, PlanKind, DEGENERATE_VAR,
};
pub use run_engine::{vna_settle_secs, RunEngine, RunMode, RunOptions, RunOutcome};
pub use state::{RunState, StopToken};
pub use sweep::{build_lists, build_sweep_list, PerVar, Scale, SweepRequest};

use crate::config::Settings;
use crate::data::storage::{CsvSink, RunSchema, RunSink};
use crate::error::{AppResult, SweepError};
use crate::registry::{group_thousands, Registry};
use std::path::PathBuf;

/// One experiment session: the registry, the planned axes, and run entry
/// points.
pub struct Experiment {
    settings: Settings,
    registry: Registry,
    sweep: Option<AxisPlan>,
    step: Option<AxisPlan>,
    stop: StopToken,
    /// Free-text operator notes, persisted into every run record.
    pub comment: String,
    pub comment2: String,
}

impl Experiment {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            registry: Registry::new(),
            sweep: None,
            step: None,
            stop: StopToken::new(),
            comment: "None".to_string(),
            comment2: "None".to_string(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The token a Ctrl-C handler (or test) uses to stop the current run.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Drive every instrument to its configured state (DC controls first,
    /// then the VNA setup).
    pub async fn initialize_instruments(&self) -> AppResult<()> {
        self.registry.initialize(&self.settings.timing).await
    }

    /// Plan the fast inner axis and annotate the swept variables.
    pub fn sweep_params(&mut self, request: SweepRequest) -> AppResult<()> {
        let plan = AxisPlan::sweep(&request)?;
        for (var, summary) in plan_summaries(PlanKind::Sweep, &request)? {
            self.registry.set_summary(&var, summary)?;
        }
        self.sweep = Some(plan);
        Ok(())
    }

    /// Plan the slow outer axis; `None` installs the degenerate single-point
    /// step.
    pub fn step_params(&mut self, request: Option<SweepRequest>) -> AppResult<()> {
        let plan = match request {
            Some(request) => {
                let plan = AxisPlan::step(&request)?;
                for (var, summary) in plan_summaries(PlanKind::Step, &request)? {
                    self.registry.set_summary(&var, summary)?;
                }
                plan
            }
            None => AxisPlan::degenerate_step(),
        };
        self.step = Some(plan);
        Ok(())
    }

    pub fn sweep_plan(&self) -> Option<&AxisPlan> {
        self.sweep.as_ref()
    }

    pub fn step_plan(&self) -> Option<&AxisPlan> {
        self.step.as_ref()
    }

    /// Raw run-time estimate in seconds for the planned axes.
    pub fn estimate_secs(&self, mode: RunMode, use_vna: bool) -> AppResult<f64> {
        let sweep_points = self
            .sweep
            .as_ref()
            .map(AxisPlan::points)
            .ok_or_else(|| {
                SweepError::Configuration("no sweep parameters planned".to_string())
            })?;
        let step_points = match mode {
            RunMode::TwoD => self.step.as_ref().map_or(1, AxisPlan::points),
            _ => 1,
        };
        let vna_points = self.registry.vna().map(|vna| vna.settings.sweep_points);
        estimate_run_secs(
            use_vna,
            self.settings.timing.settle_const_secs,
            sweep_points,
            step_points,
            vna_points,
        )
    }

    /// Operator-facing estimate, classified into sec/mins/hours.
    pub fn estimate(&self, mode: RunMode, use_vna: bool) -> AppResult<String> {
        let secs = self.estimate_secs(mode, use_vna)?;
        Ok(format!("experiment time is {}", describe_duration(secs)))
    }

    /// Execute one run with the configured storage backend.
    pub async fn run(&mut self, options: RunOptions) -> AppResult<RunOutcome> {
        let sink: Option<Box<dyn RunSink>> = if options.save {
            Some(Box::new(CsvSink::new()))
        } else {
            None
        };
        self.run_with_sink(options, sink).await
    }

    /// Execute one run against an explicit sink (tests, alternate backends).
    ///
    /// When `options.save` is false the sink is ignored and nothing is
    /// opened; instruments are still driven through the full loop.
    pub async fn run_with_sink(
        &mut self,
        options: RunOptions,
        sink: Option<Box<dyn RunSink>>,
    ) -> AppResult<RunOutcome> {
        let sweep = match (&self.sweep, options.mode) {
            (Some(plan), _) => plan.clone(),
            // The snapshot mode never touches the sweep axis.
            (None, RunMode::VnaOnly) => AxisPlan::degenerate_step(),
            (None, _) => {
                return Err(SweepError::Configuration(
                    "no sweep parameters planned".to_string(),
                ))
            }
        };

        if options.mode == RunMode::OneD && !options.use_vna {
            self.step = Some(AxisPlan::degenerate_step());
        }
        let step = self
            .step
            .clone()
            .unwrap_or_else(AxisPlan::degenerate_step);

        let mut schema = RunSchema::new(Vec::new()).with_metadata(self.metadata_rows());
        if options.save {
            schema = schema.with_path(self.record_path(&options.name));
        }
        let sink = if options.save { sink } else { None };

        self.stop.reset();
        let mut engine = RunEngine::new(self.settings.timing.clone(), self.stop.clone());
        engine
            .execute(&mut self.registry, &sweep, &step, &options, sink, schema)
            .await
    }

    /// One store per run: `<data_dir>/<date>/<date>_<name>.csv`.
    fn record_path(&self, name: &str) -> PathBuf {
        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        PathBuf::from(&self.settings.storage.data_dir)
            .join(&date)
            .join(format!("{date}_{name}.csv"))
    }

    fn metadata_rows(&self) -> Vec<(String, String)> {
        let mut rows = self.registry.display_rows();
        rows.push(("comment".to_string(), self.comment.clone()));
        rows.push(("comment2".to_string(), self.comment2.clone()));
        rows.push((
            "tconst".to_string(),
            group_thousands(self.settings.timing.settle_const_secs),
        ));
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockSource;
    use crate::registry::{ControlBinding, ValueSpec};
    use std::sync::Arc;

    fn experiment_with_source(name: &str) -> Experiment {
        let mut experiment = Experiment::new(Settings::default());
        experiment
            .registry_mut()
            .add_control(
                ControlBinding::new(name, "V", Arc::new(MockSource::new(name))),
                ValueSpec::Scalar(0.0),
            )
            .unwrap();
        experiment
    }

    #[test]
    fn step_params_without_arguments_is_degenerate() {
        let mut experiment = experiment_with_source("vch");
        experiment.step_params(None).unwrap();
        let step = experiment.step_plan().unwrap();
        assert!(step.is_degenerate());
        assert_eq!(step.points(), 1);
    }

    #[test]
    fn estimate_requires_a_sweep_plan() {
        let experiment = experiment_with_source("vch");
        assert!(experiment.estimate_secs(RunMode::OneD, false).is_err());
    }

    #[test]
    fn estimate_counts_the_step_axis_only_in_2d() {
        let mut experiment = experiment_with_source("vch");
        experiment
            .sweep_params(SweepRequest::new("vch", 0.0, 1.0, 51))
            .unwrap();
        let one_d = experiment.estimate_secs(RunMode::OneD, false).unwrap();

        experiment
            .registry_mut()
            .add_control(
                ControlBinding::new("vac", "Vpp", Arc::new(MockSource::new("vac"))),
                ValueSpec::Scalar(0.05),
            )
            .unwrap();
        experiment
            .step_params(Some(SweepRequest::new("vac", 0.0, 1.0, 10)))
            .unwrap();
        let two_d = experiment.estimate_secs(RunMode::TwoD, false).unwrap();
        assert!(two_d > one_d);
    }

    #[test]
    fn metadata_rows_carry_comments_and_summaries() {
        let mut experiment = experiment_with_source("vch");
        experiment.comment = "cooldown 12".to_string();
        experiment
            .sweep_params(SweepRequest::new("vch", 0.2, 1.0, 51))
            .unwrap();

        let rows = experiment.metadata_rows();
        let comment = rows.iter().find(|(k, _)| k == "comment").unwrap();
        assert_eq!(comment.1, "cooldown 12");
        let vch = rows.iter().find(|(k, _)| k == "vch").unwrap();
        assert!(vch.1.starts_with("sweep /"));
    }
}
