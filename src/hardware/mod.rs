//! Hardware capability traits and mock implementations.
//!
//! Real instrument adapters (SCPI, serial, SDK-backed) live outside this
//! crate and plug in by implementing the capability traits in
//! [`capabilities`]. The [`mock`] module provides simulated devices for
//! development and tests.

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    ControlChannel, ScalarChannel, TraceFormat, VectorChannel, VnaChannel, VnaInstrument,
    VnaSettings,
};
