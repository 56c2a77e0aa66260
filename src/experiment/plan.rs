//! Run planning: sweep/step axis plans, duration estimates, and VNA readout
//! reconciliation.
//!
//! A run is described by two axis plans: the fast inner sweep and the slow
//! outer step. A plan with no declared variables is the degenerate
//! single-point step used for 1D runs.

use crate::error::{AppResult, SweepError};
use crate::experiment::sweep::{build_lists, SweepRequest};
use crate::hardware::capabilities::{VnaChannel, VnaInstrument};
use crate::registry::{
    group_thousands, is_vna_key, ReadoutBinding, Registry, VNA_FREQ_KEY, VNA_PRIMARY_KEY,
    VNA_SECONDARY_KEY,
};
use std::fmt;

/// Variable name of the degenerate single-point step plan.
pub const DEGENERATE_VAR: &str = "None";

/// Which loop an axis plan drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    /// Fast inner loop.
    Sweep,
    /// Slow outer loop.
    Step,
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanKind::Sweep => f.write_str("sweep"),
            PlanKind::Step => f.write_str("step"),
        }
    }
}

/// One axis of a run: ordered variable names, one list per variable, and the
/// shared point count.
///
/// Invariant: every list has exactly `points` entries.
#[derive(Debug, Clone)]
pub struct AxisPlan {
    kind: PlanKind,
    variables: Vec<String>,
    lists: Vec<Vec<f64>>,
    points: usize,
}

impl AxisPlan {
    fn build(kind: PlanKind, request: &SweepRequest) -> AppResult<Self> {
        if request.vars.is_empty() {
            return Err(SweepError::Configuration(format!(
                "{kind} plan needs at least one variable"
            )));
        }
        let lists = build_lists(request)?;
        Ok(Self {
            kind,
            variables: request.vars.clone(),
            lists,
            points: request.count,
        })
    }

    /// Plan the fast inner loop.
    pub fn sweep(request: &SweepRequest) -> AppResult<Self> {
        Self::build(PlanKind::Sweep, request)
    }

    /// Plan the slow outer loop.
    pub fn step(request: &SweepRequest) -> AppResult<Self> {
        Self::build(PlanKind::Step, request)
    }

    /// The single-point step plan used when nothing is stepped.
    pub fn degenerate_step() -> Self {
        Self {
            kind: PlanKind::Step,
            variables: vec![DEGENERATE_VAR.to_string()],
            lists: vec![vec![0.0]],
            points: 1,
        }
    }

    pub fn kind(&self) -> PlanKind {
        self.kind
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn lists(&self) -> &[Vec<f64>] {
        &self.lists
    }

    pub fn points(&self) -> usize {
        self.points
    }

    /// Whether this is the degenerate single-point plan.
    pub fn is_degenerate(&self) -> bool {
        self.variables.len() == 1 && self.variables[0] == DEGENERATE_VAR
    }
}

/// `(variable, summary)` annotations for the registry display, e.g.
/// `"sweep / 0.2 : 1 / num=51 / linear / off=0"`.
pub fn plan_summaries(kind: PlanKind, request: &SweepRequest) -> AppResult<Vec<(String, String)>> {
    let mut summaries = Vec::with_capacity(request.vars.len());
    for (index, var) in request.vars.iter().enumerate() {
        let start = request.start.at(index)?;
        let stop = request.stop.at(index)?;
        let scale = request.scale.at(index)?;
        let offset = request.offset.at(index)?;
        summaries.push((
            var.clone(),
            format!(
                "{kind} / {} : {} / num={} / {scale} / off={}",
                group_thousands(start),
                group_thousands(stop),
                request.count,
                group_thousands(offset)
            ),
        ));
    }
    Ok(summaries)
}

// =============================================================================
// Duration estimation
// =============================================================================

/// Raw run-time estimate in seconds.
///
/// The no-VNA form is `(3·settle·sweep·step + 6·(step−1)) · 1.2`; the 1.2
/// factor is an empirical correction for orchestration overhead and the
/// `6·(step−1)` term covers the per-step ramp and settle pauses. The VNA
/// form is `sweep·5.5 + vna_points·5.5/10`. Estimating a VNA run without a
/// configured VNA is a configuration error.
pub fn estimate_run_secs(
    use_vna: bool,
    settle_const_secs: f64,
    sweep_points: usize,
    step_points: usize,
    vna_sweep_points: Option<u32>,
) -> AppResult<f64> {
    if use_vna {
        let vna_points = vna_sweep_points.ok_or_else(|| {
            SweepError::Configuration(
                "duration estimate for a VNA run requires a configured VNA".to_string(),
            )
        })?;
        let loop_secs = 5.5;
        Ok(sweep_points as f64 * loop_secs + vna_points as f64 * loop_secs / 10.0)
    } else {
        let steps = step_points.max(1) as f64;
        let sweeps = sweep_points as f64;
        Ok((3.0 * settle_const_secs * sweeps * steps + 6.0 * (steps - 1.0)) * 1.2)
    }
}

/// Magnitude class of an estimate, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationClass {
    Seconds,
    Minutes,
    Hours,
}

/// Classify an estimate for display.
pub fn classify_duration(secs: f64) -> DurationClass {
    if secs > 3600.0 {
        DurationClass::Hours
    } else if secs > 60.0 {
        DurationClass::Minutes
    } else {
        DurationClass::Seconds
    }
}

/// Human-readable form of an estimate, e.g. `"approx 2.5 mins"`.
pub fn describe_duration(secs: f64) -> String {
    match classify_duration(secs) {
        DurationClass::Hours => format!("approx {} hours", round1(secs / 3600.0)),
        DurationClass::Minutes => format!("approx {} mins", round1(secs / 60.0)),
        DurationClass::Seconds => format!("approx {} sec", secs.round()),
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

// =============================================================================
// VNA readout reconciliation
// =============================================================================

/// Make the readout map carry exactly the channels the active trace format
/// supports.
///
/// Smith/polar/admittance traces expose three channels (frequency, primary,
/// secondary); every other format exposes two. The secondary channel is
/// added or removed as needed; any other key combination is a configuration
/// error rather than a guess. Returns the VNA-sourced keys after
/// reconciliation, in map order.
pub fn reconcile_vna_readouts(registry: &mut Registry) -> AppResult<Vec<String>> {
    let vna = registry
        .vna()
        .cloned()
        .ok_or_else(|| {
            SweepError::Configuration(
                "VNA readout reconciliation requires a VNA binding".to_string(),
            )
        })?;
    let format = vna.settings.format;

    let vna_keys: Vec<String> = registry
        .readout_keys()
        .into_iter()
        .filter(|key| is_vna_key(key))
        .collect();
    let has_freq = vna_keys.iter().any(|key| key == VNA_FREQ_KEY);
    let has_primary = vna_keys.iter().any(|key| key == VNA_PRIMARY_KEY);
    let has_secondary = vna_keys.iter().any(|key| key == VNA_SECONDARY_KEY);

    if format.has_secondary() {
        match vna_keys.len() {
            3 if has_freq && has_primary && has_secondary => {}
            2 if has_freq && has_primary => {
                let channel = vna.handle.clone().channel(VnaChannel::Secondary);
                registry.add_readout(ReadoutBinding::vector(VNA_SECONDARY_KEY, "U", channel));
            }
            _ => {
                return Err(SweepError::Configuration(format!(
                    "trace format {format} needs VNA readout keys \
                     [{VNA_FREQ_KEY}, {VNA_PRIMARY_KEY}, {VNA_SECONDARY_KEY}], \
                     found {vna_keys:?}"
                )))
            }
        }
    } else {
        match vna_keys.len() {
            3 if has_freq && has_primary && has_secondary => {
                registry.remove_readout(VNA_SECONDARY_KEY);
            }
            2 if has_freq && has_primary => {}
            _ => {
                return Err(SweepError::Configuration(format!(
                    "trace format {format} needs VNA readout keys \
                     [{VNA_FREQ_KEY}, {VNA_PRIMARY_KEY}], found {vna_keys:?}"
                )))
            }
        }
    }

    Ok(registry
        .readout_keys()
        .into_iter()
        .filter(|key| is_vna_key(key))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::TraceFormat;
    use crate::hardware::mock::{test_vna_settings, MockVna};
    use std::sync::Arc;

    fn vna_registry(format: TraceFormat, keys: &[&str]) -> Registry {
        let vna = Arc::new(MockVna::new(test_vna_settings(11, format)));
        let mut registry = Registry::new();
        registry.set_vna(vna.clone(), test_vna_settings(11, format));
        for key in keys {
            let channel = match *key {
                VNA_FREQ_KEY => VnaChannel::Frequency,
                VNA_PRIMARY_KEY => VnaChannel::Primary,
                _ => VnaChannel::Secondary,
            };
            registry.add_readout(ReadoutBinding::vector(
                *key,
                "U",
                vna.clone().channel(channel),
            ));
        }
        registry
    }

    #[test]
    fn degenerate_step_plan_is_single_point() {
        let plan = AxisPlan::degenerate_step();
        assert_eq!(plan.points(), 1);
        assert_eq!(plan.variables(), ["None"]);
        assert_eq!(plan.lists(), [vec![0.0]]);
        assert!(plan.is_degenerate());
    }

    #[test]
    fn sweep_plan_carries_one_list_per_variable() {
        let request = SweepRequest::new("vch", 0.2, 1.0, 51).and_var("vgt");
        let plan = AxisPlan::sweep(&request).unwrap();
        assert_eq!(plan.points(), 51);
        assert_eq!(plan.lists().len(), 2);
        assert!(plan.lists().iter().all(|list| list.len() == 51));
        assert!(!plan.is_degenerate());
    }

    #[test]
    fn estimate_is_strictly_increasing_in_both_counts() {
        let base = estimate_run_secs(false, 0.1, 51, 10, None).unwrap();
        let more_sweeps = estimate_run_secs(false, 0.1, 52, 10, None).unwrap();
        let more_steps = estimate_run_secs(false, 0.1, 51, 11, None).unwrap();
        assert!(more_sweeps > base);
        assert!(more_steps > base);
    }

    #[test]
    fn no_vna_estimate_matches_formula() {
        let secs = estimate_run_secs(false, 0.1, 51, 10, None).unwrap();
        let expected = (3.0 * 0.1 * 51.0 * 10.0 + 6.0 * 9.0) * 1.2;
        assert!((secs - expected).abs() < 1e-9);
    }

    #[test]
    fn vna_estimate_requires_vna_setup() {
        assert!(estimate_run_secs(true, 0.1, 51, 1, None).is_err());
        let secs = estimate_run_secs(true, 0.1, 51, 1, Some(1601)).unwrap();
        let expected = 51.0 * 5.5 + 1601.0 * 5.5 / 10.0;
        assert!((secs - expected).abs() < 1e-9);
    }

    #[test]
    fn duration_classes() {
        assert_eq!(classify_duration(30.0), DurationClass::Seconds);
        assert_eq!(classify_duration(300.0), DurationClass::Minutes);
        assert_eq!(classify_duration(7200.0), DurationClass::Hours);
        assert_eq!(describe_duration(7200.0), "approx 2 hours");
    }

    #[test]
    fn smith_format_gains_the_secondary_channel() {
        let mut registry = vna_registry(TraceFormat::Smith, &[VNA_FREQ_KEY, VNA_PRIMARY_KEY]);
        let keys = reconcile_vna_readouts(&mut registry).unwrap();
        assert_eq!(keys, [VNA_FREQ_KEY, VNA_PRIMARY_KEY, VNA_SECONDARY_KEY]);
    }

    #[test]
    fn logmag_format_sheds_the_secondary_channel() {
        let mut registry = vna_registry(
            TraceFormat::LogMag,
            &[VNA_FREQ_KEY, VNA_PRIMARY_KEY, VNA_SECONDARY_KEY],
        );
        let keys = reconcile_vna_readouts(&mut registry).unwrap();
        assert_eq!(keys, [VNA_FREQ_KEY, VNA_PRIMARY_KEY]);
    }

    #[test]
    fn unexpected_channel_set_is_a_configuration_error() {
        let mut registry = vna_registry(TraceFormat::Smith, &[VNA_FREQ_KEY]);
        assert!(reconcile_vna_readouts(&mut registry).is_err());

        // Right count, wrong keys: still an error, never a guess.
        let mut registry = vna_registry(TraceFormat::LogMag, &["vna_misc", VNA_PRIMARY_KEY]);
        assert!(reconcile_vna_readouts(&mut registry).is_err());
    }

    #[test]
    fn summaries_describe_the_request() {
        let request = SweepRequest::new("vch", 0.2, 1.0, 51);
        let summaries = plan_summaries(PlanKind::Sweep, &request).unwrap();
        assert_eq!(summaries[0].0, "vch");
        assert_eq!(summaries[0].1, "sweep / 0.2 : 1 / num=51 / linear / off=0");
    }
}
