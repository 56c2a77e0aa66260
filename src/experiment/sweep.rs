//! Sweep-list construction.
//!
//! Turns `(start, stop, count, scale)` specs into ordered numeric sequences,
//! linear or logarithmic, with per-variable offsets subtracted after
//! generation. Multiple variables can be built in one call, each supplying
//! its own endpoints/scale/offset either as a shared scalar or a
//! positionally-indexed list.

use crate::error::{AppResult, SweepError};
use std::fmt;
use std::str::FromStr;

/// Spacing rule for a sweep list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scale {
    /// Evenly spaced values.
    Linear,
    /// Geometrically spaced values (log base 10 of the endpoints).
    Log,
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scale::Linear => f.write_str("linear"),
            Scale::Log => f.write_str("log"),
        }
    }
}

impl FromStr for Scale {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Scale::Linear),
            "log" => Ok(Scale::Log),
            other => Err(SweepError::Configuration(format!(
                "choose log or linear scale, not '{other}'"
            ))),
        }
    }
}

/// Build an ordered sweep list from `start` to `stop` inclusive.
///
/// Endpoints are exact; interior points are evenly spaced on the chosen
/// scale. `count == 1` yields `[start]`, `count == 0` an empty list.
pub fn build_sweep_list(start: f64, stop: f64, count: usize, scale: Scale) -> Vec<f64> {
    match scale {
        Scale::Linear => linspace(start, stop, count),
        Scale::Log => {
            let mut list: Vec<f64> = linspace(start.log10(), stop.log10(), count)
                .into_iter()
                .map(|exp| 10f64.powf(exp))
                .collect();
            // Pin the endpoints; powf round-trips log10 with FP error.
            if let Some(first) = list.first_mut() {
                *first = start;
            }
            if count > 1 {
                if let Some(last) = list.last_mut() {
                    *last = stop;
                }
            }
            list
        }
    }
}

fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let last = count - 1;
            (0..count)
                .map(|i| {
                    if i == last {
                        stop
                    } else {
                        start + (stop - start) * i as f64 / last as f64
                    }
                })
                .collect()
        }
    }
}

/// A per-variable parameter: one value broadcast to every variable, or a
/// positionally-indexed list.
#[derive(Debug, Clone)]
pub enum PerVar<T> {
    All(T),
    Each(Vec<T>),
}

impl<T: Clone> PerVar<T> {
    /// The value for variable `index`. Indexing past the end of an `Each`
    /// list is a caller contract violation and reported as a configuration
    /// error.
    pub fn at(&self, index: usize) -> AppResult<T> {
        match self {
            PerVar::All(value) => Ok(value.clone()),
            PerVar::Each(values) => values.get(index).cloned().ok_or_else(|| {
                SweepError::Configuration(format!(
                    "per-variable list has {} entries, variable index {index} requested",
                    values.len()
                ))
            }),
        }
    }
}

impl<T> From<T> for PerVar<T> {
    fn from(value: T) -> Self {
        PerVar::All(value)
    }
}

impl<T> From<Vec<T>> for PerVar<T> {
    fn from(values: Vec<T>) -> Self {
        PerVar::Each(values)
    }
}

/// Request for one or more sweep lists sharing a point count.
#[derive(Debug, Clone)]
pub struct SweepRequest {
    pub vars: Vec<String>,
    pub start: PerVar<f64>,
    pub stop: PerVar<f64>,
    pub count: usize,
    pub scale: PerVar<Scale>,
    pub offset: PerVar<f64>,
}

impl SweepRequest {
    /// Single-variable linear request with no offset.
    pub fn new(var: impl Into<String>, start: f64, stop: f64, count: usize) -> Self {
        Self {
            vars: vec![var.into()],
            start: PerVar::All(start),
            stop: PerVar::All(stop),
            count,
            scale: PerVar::All(Scale::Linear),
            offset: PerVar::All(0.0),
        }
    }

    pub fn with_scale(mut self, scale: impl Into<PerVar<Scale>>) -> Self {
        self.scale = scale.into();
        self
    }

    pub fn with_offset(mut self, offset: impl Into<PerVar<f64>>) -> Self {
        self.offset = offset.into();
        self
    }

    /// Add another variable sharing this request's point count.
    pub fn and_var(mut self, var: impl Into<String>) -> Self {
        self.vars.push(var.into());
        self
    }
}

/// Build one list per variable, offsets subtracted elementwise after
/// generation.
pub fn build_lists(request: &SweepRequest) -> AppResult<Vec<Vec<f64>>> {
    let mut lists = Vec::with_capacity(request.vars.len());
    for index in 0..request.vars.len() {
        let start = request.start.at(index)?;
        let stop = request.stop.at(index)?;
        let scale = request.scale.at(index)?;
        let offset = request.offset.at(index)?;

        let list: Vec<f64> = build_sweep_list(start, stop, request.count, scale)
            .into_iter()
            .map(|value| value - offset)
            .collect();
        lists.push(list);
    }
    Ok(lists)
}
