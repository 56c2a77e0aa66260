//! # sweepstation
//!
//! Sweep orchestration and run-state management for multi-instrument
//! experiments: configure control instruments, sweep their outputs across
//! one or two dimensions, read back measurement instruments (lock-in
//! amplifiers, a vector network analyzer), and persist sample tuples
//! row-by-row to a run record.
//!
//! Instrument protocol internals are out of scope; adapters plug in behind
//! the capability traits in [`hardware::capabilities`] and the storage
//! backend behind [`data::storage::RunSink`].
//!
//! ## Crate Structure
//!
//! - **`config`**: Settings loaded from TOML, including the settle/ramp
//!   timing constants the loop runs with.
//! - **`error`**: The `SweepError` enum for centralized error handling.
//! - **`hardware`**: Capability traits (`ControlChannel`, `ScalarChannel`,
//!   `VectorChannel`, `VnaInstrument`) and mock instruments.
//! - **`registry`**: The typed parameter registry mapping variable names to
//!   control and readout bindings.
//! - **`experiment`**: Sweep-list builder, run planner, run-state machine,
//!   and the acquisition loop itself.
//! - **`data`**: Run record sinks (CSV backend, in-memory sink for tests).

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod registry;
