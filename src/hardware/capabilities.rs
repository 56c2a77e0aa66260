//! Atomic Hardware Capabilities
//!
//! This module defines the fine-grained capability traits the acquisition
//! loop drives. Instead of one monolithic `Instrument` trait, devices
//! implement the specific capabilities they actually support:
//!
//! - A voltage source or signal generator implements `ControlChannel`
//! - A lock-in amplifier output implements `ScalarChannel`
//! - A VNA trace channel implements `VectorChannel`
//! - The VNA instrument itself implements `VnaInstrument`
//!
//! Every adapter implements these interfaces explicitly with fixed method
//! signatures; the run engine never dispatches by method name.
//!
//! # Design
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses `AppResult` for errors
//! - Focuses on ONE thing

use crate::error::{AppResult, SweepError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Capability: settable output channel.
///
/// Devices whose output the loop drives (voltage sources, signal generators).
///
/// # Contract
/// - Values are in device-native units.
/// - `set` applies the value immediately.
/// - `ramp_to` slews the output over `duration` and blocks until settled.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Set the output to `value` immediately.
    async fn set(&self, value: f64) -> AppResult<()>;

    /// Ramp the output to `value` over `duration`, blocking until settled.
    async fn ramp_to(&self, value: f64, duration: Duration) -> AppResult<()>;
}

/// Capability: scalar readout.
///
/// Measurement channels that produce one value per trigger (lock-in X/Y,
/// power meters, thermometers).
#[async_trait]
pub trait ScalarChannel: Send + Sync {
    /// Take one reading.
    async fn read(&self) -> AppResult<f64>;
}

/// Capability: vector readout.
///
/// Channels that produce a full trace per trigger, one element per sweep
/// point (VNA frequency axis and trace data).
#[async_trait]
pub trait VectorChannel: Send + Sync {
    /// Read the full trace.
    async fn read_vector(&self) -> AppResult<Vec<f64>>;
}

/// The VNA's selected trace representation.
///
/// Determines how many data channels one trace exposes: Smith, polar and
/// admittance traces carry a secondary value per point, the rest carry only
/// the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceFormat {
    /// Log magnitude (MLOG)
    LogMag,
    /// Linear magnitude (MLIN)
    LinMag,
    /// Phase (PHAS)
    Phase,
    /// Group delay (GDEL)
    GroupDelay,
    /// Standing wave ratio (SWR)
    Swr,
    /// Complex Smith chart (SMIT)
    Smith,
    /// Polar (POL)
    Polar,
    /// Admittance Smith chart (SADM)
    Admittance,
}

impl TraceFormat {
    /// Whether a trace in this format carries a secondary data channel.
    pub fn has_secondary(&self) -> bool {
        matches!(
            self,
            TraceFormat::Smith | TraceFormat::Polar | TraceFormat::Admittance
        )
    }

    /// Number of VNA readout channels this format exposes, including the
    /// frequency axis.
    pub fn channel_count(&self) -> usize {
        if self.has_secondary() {
            3
        } else {
            2
        }
    }

    /// The instrument mnemonic for this format.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            TraceFormat::LogMag => "MLOG",
            TraceFormat::LinMag => "MLIN",
            TraceFormat::Phase => "PHAS",
            TraceFormat::GroupDelay => "GDEL",
            TraceFormat::Swr => "SWR",
            TraceFormat::Smith => "SMIT",
            TraceFormat::Polar => "POL",
            TraceFormat::Admittance => "SADM",
        }
    }
}

impl fmt::Display for TraceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl FromStr for TraceFormat {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MLOG" => Ok(TraceFormat::LogMag),
            "MLIN" => Ok(TraceFormat::LinMag),
            "PHAS" => Ok(TraceFormat::Phase),
            "GDEL" => Ok(TraceFormat::GroupDelay),
            "SWR" => Ok(TraceFormat::Swr),
            "SMIT" => Ok(TraceFormat::Smith),
            "POL" => Ok(TraceFormat::Polar),
            "SADM" => Ok(TraceFormat::Admittance),
            other => Err(SweepError::Configuration(format!(
                "unknown VNA trace format '{other}'"
            ))),
        }
    }
}

/// One of the data channels a VNA trace exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnaChannel {
    /// The stimulus frequency axis.
    Frequency,
    /// The primary trace value.
    Primary,
    /// The secondary trace value (Smith/polar/admittance formats only).
    Secondary,
}

/// Setup applied to the VNA before a run.
///
/// Applied as one block after the DC controls have settled, because the
/// calibration state can depend on the bias point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VnaSettings {
    pub format: TraceFormat,
    pub sweep_points: u32,
    pub averaging: bool,
    pub average_count: u32,
    pub start_hz: f64,
    pub stop_hz: f64,
    pub power_dbm: f64,
    pub bandwidth_hz: f64,
}

impl Default for VnaSettings {
    fn default() -> Self {
        Self {
            format: TraceFormat::LogMag,
            sweep_points: 1601,
            averaging: false,
            average_count: 1,
            start_hz: 1.0e6,
            stop_hz: 3.0e9,
            power_dbm: -20.0,
            bandwidth_hz: 1.0e3,
        }
    }
}

/// Capability: vector network analyzer.
///
/// Covers the three things the run engine needs from a VNA beyond its trace
/// channels: output control, setup, and minting per-channel readout handles.
#[async_trait]
pub trait VnaInstrument: Send + Sync {
    /// Enable or disable the stimulus output.
    async fn set_output(&self, on: bool) -> AppResult<()>;

    /// Query the current stimulus output state.
    async fn output(&self) -> AppResult<bool>;

    /// Push the full setup block to the instrument.
    async fn apply(&self, settings: &VnaSettings) -> AppResult<()>;

    /// A readout handle for one of the trace's data channels.
    fn channel(self: Arc<Self>, channel: VnaChannel) -> Arc<dyn VectorChannel>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smith_polar_admittance_carry_secondary() {
        for format in [TraceFormat::Smith, TraceFormat::Polar, TraceFormat::Admittance] {
            assert!(format.has_secondary());
            assert_eq!(format.channel_count(), 3);
        }
        for format in [TraceFormat::LogMag, TraceFormat::Phase, TraceFormat::Swr] {
            assert!(!format.has_secondary());
            assert_eq!(format.channel_count(), 2);
        }
    }

    #[test]
    fn trace_format_round_trips_through_mnemonic() {
        let format: TraceFormat = "smit".parse().unwrap();
        assert_eq!(format, TraceFormat::Smith);
        assert_eq!(format.to_string(), "SMIT");
        assert!("SMITH_CHART".parse::<TraceFormat>().is_err());
    }
}
