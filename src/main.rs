//! CLI entry point for sweepstation.
//!
//! Drives the acquisition engine against a mock rig: two DC gate sources,
//! an AC excitation source, a two-channel lock-in, and a VNA. Real
//! instrument adapters replace the mocks by implementing the capability
//! traits in `sweepstation::hardware::capabilities`.
//!
//! # Usage
//!
//! Run a 1D gate sweep without the VNA:
//! ```bash
//! sweepstation run --name gate_scan --mode 1D --no-vna --points 51
//! ```
//!
//! Estimate a 2D run before committing to it:
//! ```bash
//! sweepstation estimate --mode 2D --step Vac,0.0,0.5,11
//! ```

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use sweepstation::config::Settings;
use sweepstation::error::SweepError;
use sweepstation::experiment::{Experiment, RunMode, RunOptions, Scale, SweepRequest};
use sweepstation::hardware::capabilities::{TraceFormat, VnaChannel, VnaInstrument, VnaSettings};
use sweepstation::hardware::mock::{MockLockIn, MockSource, MockVna};
use sweepstation::registry::{ControlBinding, ReadoutBinding, ValueSpec};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sweepstation")]
#[command(about = "Sweep orchestration for multi-instrument experiments", long_about = None)]
struct Cli {
    /// Configuration name under config/ (defaults used when omitted)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct AxisArgs {
    /// Sweep variable
    #[arg(long, default_value = "Vch")]
    var: String,

    #[arg(long, default_value_t = 0.2)]
    start: f64,

    #[arg(long, default_value_t = 1.0)]
    stop: f64,

    #[arg(long, default_value_t = 51)]
    points: usize,

    /// linear or log
    #[arg(long, default_value = "linear")]
    scale: String,

    #[arg(long, default_value_t = 0.0)]
    offset: f64,

    /// Outer step axis as VAR,START,STOP,POINTS
    #[arg(long)]
    step: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a run against the mock rig
    Run {
        /// Experiment name used in the record filename
        #[arg(long, default_value = "sweep_0")]
        name: String,

        /// 1D, 2D or VNAonly
        #[arg(long, default_value = "1D")]
        mode: String,

        /// Exclude the VNA readout path
        #[arg(long)]
        no_vna: bool,

        /// Exclude the lock-in readout path
        #[arg(long)]
        no_lockin: bool,

        /// Drive instruments without opening a run record
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        axis: AxisArgs,
    },

    /// Estimate the run duration for the planned axes
    Estimate {
        /// 1D, 2D or VNAonly
        #[arg(long, default_value = "1D")]
        mode: String,

        /// Estimate for the VNA readout path
        #[arg(long)]
        vna: bool,

        #[command(flatten)]
        axis: AxisArgs,
    },

    /// Show the configured parameters of the mock rig
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = match cli.config.as_deref() {
        Some(name) => Settings::new(Some(name))?,
        None => Settings::default(),
    };
    init_tracing(&settings.log_level);

    match cli.command {
        Commands::Run {
            name,
            mode,
            no_vna,
            no_lockin,
            dry_run,
            axis,
        } => {
            let mode: RunMode = mode.parse()?;
            let mut experiment = demo_experiment(settings)?;
            apply_axes(&mut experiment, &axis)?;

            // A single Ctrl-C finishes the current point, finalizes the
            // record, and restores bindings.
            let stop = experiment.stop_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt requested; finishing the current point");
                    stop.stop();
                }
            });

            print_rows(&experiment.registry().display_rows());
            experiment.initialize_instruments().await?;

            let mut options = RunOptions::new(name, mode);
            if no_vna {
                options = options.without_vna();
            }
            if no_lockin {
                options = options.without_lockin();
            }
            if dry_run {
                options = options.dry_run();
            }

            let outcome = experiment.run(options).await?;
            info!(
                run_id = %outcome.run_id,
                state = %outcome.state,
                rows = outcome.rows,
                "run finished"
            );
        }

        Commands::Estimate { mode, vna, axis } => {
            let mode: RunMode = mode.parse()?;
            let mut experiment = demo_experiment(settings)?;
            apply_axes(&mut experiment, &axis)?;
            println!("{}", experiment.estimate(mode, vna)?);
        }

        Commands::Show => {
            let experiment = demo_experiment(settings)?;
            print_rows(&experiment.registry().display_rows());
        }
    }

    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wire up the mock rig the demo commands drive.
fn demo_experiment(settings: Settings) -> Result<Experiment> {
    let mut experiment = Experiment::new(settings);
    let registry = experiment.registry_mut();

    registry.add_control(
        ControlBinding::new("Vch", "V", Arc::new(MockSource::new("Vch"))),
        ValueSpec::Scalar(0.2),
    )?;
    registry.add_control(
        ControlBinding::new("Vgt", "V", Arc::new(MockSource::new("Vgt"))),
        ValueSpec::Offset { val: 0.2, off: 0.0 },
    )?;
    registry.add_control(
        ControlBinding::new("Vac", "Vpp", Arc::new(MockSource::new("Vac"))),
        ValueSpec::Scalar(0.05),
    )?;

    registry.add_readout(ReadoutBinding::scalar(
        "Vx",
        "V",
        Arc::new(MockLockIn::new("Vx", 1.0e-4).with_noise(1.0e-6)),
    ));
    registry.add_readout(ReadoutBinding::scalar(
        "Vy",
        "V",
        Arc::new(MockLockIn::new("Vy", 2.0e-5).with_noise(1.0e-6)),
    ));

    let vna_settings = VnaSettings {
        format: TraceFormat::LogMag,
        sweep_points: 201,
        ..VnaSettings::default()
    };
    let vna = Arc::new(MockVna::new(vna_settings.clone()));
    registry.set_vna(vna.clone(), vna_settings);
    registry.add_readout(ReadoutBinding::vector(
        "vna_freq",
        "Hz",
        vna.clone().channel(VnaChannel::Frequency),
    ));
    registry.add_readout(ReadoutBinding::vector(
        "vna_y1",
        "U",
        vna.channel(VnaChannel::Primary),
    ));

    Ok(experiment)
}

fn apply_axes(experiment: &mut Experiment, axis: &AxisArgs) -> Result<()> {
    let scale: Scale = axis.scale.parse()?;
    experiment.sweep_params(
        SweepRequest::new(&axis.var, axis.start, axis.stop, axis.points)
            .with_scale(scale)
            .with_offset(axis.offset),
    )?;

    match &axis.step {
        Some(arg) => {
            let request = parse_step_axis(arg)?;
            experiment.step_params(Some(request))?;
        }
        None => experiment.step_params(None)?,
    }
    Ok(())
}

fn parse_step_axis(arg: &str) -> Result<SweepRequest> {
    let parts: Vec<&str> = arg.split(',').collect();
    if parts.len() != 4 {
        return Err(SweepError::Configuration(format!(
            "step axis must be VAR,START,STOP,POINTS, got '{arg}'"
        ))
        .into());
    }
    let bad = |what: &str| {
        SweepError::Configuration(format!("step axis has a malformed {what}: '{arg}'"))
    };
    Ok(SweepRequest::new(
        parts[0],
        parts[1].parse::<f64>().map_err(|_| bad("start"))?,
        parts[2].parse::<f64>().map_err(|_| bad("stop"))?,
        parts[3].parse::<usize>().map_err(|_| bad("point count"))?,
    ))
}

fn print_rows(rows: &[(String, String)]) {
    let width = rows.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    for (name, value) in rows {
        println!("{name:<width$}  {value}");
    }
}
