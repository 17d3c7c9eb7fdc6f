//!
//! # Tracing path parity
//!
//! The server exposes three ways of tracing the same rays: one `GetTrace`
//! item per ray, the bulk record exchange and the bulk exchange unpacked
//! into columns. They run through different marshaling code on both ends of
//! the wire, so nothing but a check guarantees that the numbers agree.
//!
//! [`ParityCheck`] traces one pupil grid through all three paths, takes the
//! per ray path as the reference and compares intercepts, ray cosines and
//! surface normal cosines ray by ray. The first field drifting beyond the
//! tolerance stops the check with a [`ParityError::Mismatch`] carrying the
//! ray, the field and both values; a clean run returns the largest deviation
//! seen per field in a [`ParityReport`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    BatchError, Link, LinkError, PupilGrid, RayBatch, Trace, TraceColumns, Transport,
};

/// The three ways of tracing rays through the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TracePath {
    /// One `GetTrace` item per ray
    PerRay,
    /// Bulk ray records, read back in place
    Records,
    /// Bulk ray records unpacked into columns
    Columns,
}
impl TracePath {
    pub const ALL: [TracePath; 3] = [TracePath::PerRay, TracePath::Records, TracePath::Columns];
    /// The crate API driving this path
    pub fn api(self) -> &'static str {
        match self {
            TracePath::PerRay => "get_trace",
            TracePath::Records => "array_trace",
            TracePath::Columns => "get_trace_array",
        }
    }
}
impl fmt::Display for TracePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api())
    }
}

/// The ray quantities compared across paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    X,
    Y,
    L,
    M,
    N,
    L2,
    M2,
    N2,
}
impl Field {
    pub const ALL: [Field; 8] = [
        Field::X,
        Field::Y,
        Field::L,
        Field::M,
        Field::N,
        Field::L2,
        Field::M2,
        Field::N2,
    ];
    fn of(self, trace: &Trace) -> f64 {
        match self {
            Field::X => trace.x,
            Field::Y => trace.y,
            Field::L => trace.l,
            Field::M => trace.m,
            Field::N => trace.n,
            Field::L2 => trace.l2,
            Field::M2 => trace.m2,
            Field::N2 => trace.n2,
        }
    }
}
impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::X => "x",
            Field::Y => "y",
            Field::L => "l",
            Field::M => "m",
            Field::N => "n",
            Field::L2 => "l2",
            Field::M2 => "m2",
            Field::N2 => "n2",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParityError {
    #[error("cannot drive the server")]
    Link(#[from] LinkError),
    #[error("{path} failed on ray {ray} with error {code}")]
    TraceFailed {
        path: TracePath,
        ray: usize,
        code: i32,
    },
    #[error("{path} failed")]
    Batch {
        path: TracePath,
        #[source]
        source: BatchError,
    },
    #[error("{path} returned {got} rays, the grid holds {want}")]
    Counts {
        path: TracePath,
        want: usize,
        got: usize,
    },
    #[error(
        "{candidate} disagrees with {reference} on ray {ray}: {field} = {got}, expected {want}, |delta| = {delta:.3e} > {tolerance:.1e}"
    )]
    Mismatch {
        reference: TracePath,
        candidate: TracePath,
        ray: usize,
        field: Field,
        want: f64,
        got: f64,
        delta: f64,
        tolerance: f64,
    },
}

/// Largest absolute deviation seen per compared field
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldDeviations {
    pub x: f64,
    pub y: f64,
    pub l: f64,
    pub m: f64,
    pub n: f64,
    pub l2: f64,
    pub m2: f64,
    pub n2: f64,
}
impl FieldDeviations {
    fn record(&mut self, field: Field, delta: f64) {
        let slot = match field {
            Field::X => &mut self.x,
            Field::Y => &mut self.y,
            Field::L => &mut self.l,
            Field::M => &mut self.m,
            Field::N => &mut self.n,
            Field::L2 => &mut self.l2,
            Field::M2 => &mut self.m2,
            Field::N2 => &mut self.n2,
        };
        if delta > *slot {
            *slot = delta;
        }
    }
    /// The largest deviation across all fields
    pub fn max(&self) -> f64 {
        [
            self.x, self.y, self.l, self.m, self.n, self.l2, self.m2, self.n2,
        ]
        .into_iter()
        .fold(0.0, f64::max)
    }
}
impl fmt::Display for FieldDeviations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x {:.3e}, y {:.3e}, l {:.3e}, m {:.3e}, n {:.3e}, l2 {:.3e}, m2 {:.3e}, n2 {:.3e}",
            self.x, self.y, self.l, self.m, self.n, self.l2, self.m2, self.n2
        )
    }
}

/// Outcome of a clean parity run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParityReport {
    pub rays: usize,
    pub tolerance: f64,
    pub deviations: Vec<(TracePath, FieldDeviations)>,
}
impl ParityReport {
    /// The largest deviation across all paths and fields
    pub fn max_deviation(&self) -> f64 {
        self.deviations
            .iter()
            .map(|(_, d)| d.max())
            .fold(0.0, f64::max)
    }
}
impl fmt::Display for ParityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "parity over {} rays against {}, tolerance {:.1e}:",
            self.rays,
            TracePath::PerRay,
            self.tolerance
        )?;
        for (path, deviations) in &self.deviations {
            writeln!(f, "  {:<16} {}", path.api(), deviations)?;
        }
        Ok(())
    }
}

/// Parity check of the tracing paths over one pupil grid
///
/// Default properties:
///  * grid      : 9x9 (81 rays)
///  * wavelength: 1
///  * tolerance : 1e-10
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParityCheck {
    pub grid: PupilGrid,
    pub wave: i32,
    pub tolerance: f64,
}
impl Default for ParityCheck {
    fn default() -> Self {
        Self {
            grid: Default::default(),
            wave: 1,
            tolerance: 1e-10,
        }
    }
}
impl ParityCheck {
    pub fn new(grid: PupilGrid) -> Self {
        Self {
            grid,
            ..Default::default()
        }
    }
    /// Sets the wavelength number the rays are traced at
    pub fn wave(self, wave: i32) -> Self {
        Self { wave, ..self }
    }
    /// Sets the agreement tolerance
    pub fn tolerance(self, tolerance: f64) -> Self {
        Self { tolerance, ..self }
    }
    /// Traces the grid through the three paths and compares them
    ///
    /// The lens must be loaded and pushed beforehand, the bulk paths trace
    /// the pushed copy
    pub fn run<T: Transport>(&self, link: &mut Link<T>) -> Result<ParityReport, ParityError> {
        let mut reference = Vec::with_capacity(self.grid.len());
        for (ray, (px, py)) in self.grid.points().enumerate() {
            let trace = link.trace_pupil(self.wave, px, py)?;
            if !trace.is_traced() {
                return Err(ParityError::TraceFailed {
                    path: TracePath::PerRay,
                    ray,
                    code: trace.error,
                });
            }
            reference.push(trace);
        }

        let mut batch = RayBatch::from_grid(&self.grid, self.wave);
        link.array_trace(&mut batch)?;
        batch.ensure_traced().map_err(|source| ParityError::Batch {
            path: TracePath::Records,
            source,
        })?;
        let records = batch.columns();

        let columns = link.get_trace_array(self.wave, &self.grid)?;
        columns
            .ensure_traced()
            .map_err(|source| ParityError::Batch {
                path: TracePath::Columns,
                source,
            })?;

        let report = ParityReport {
            rays: self.grid.len(),
            tolerance: self.tolerance,
            deviations: vec![
                (
                    TracePath::Records,
                    self.compare(&reference, TracePath::Records, &records)?,
                ),
                (
                    TracePath::Columns,
                    self.compare(&reference, TracePath::Columns, &columns)?,
                ),
            ],
        };
        log::info!(
            "parity held over {} rays, largest deviation {:.3e} within {:.1e}",
            report.rays,
            report.max_deviation(),
            report.tolerance
        );
        Ok(report)
    }
    fn compare(
        &self,
        reference: &[Trace],
        candidate: TracePath,
        columns: &TraceColumns,
    ) -> Result<FieldDeviations, ParityError> {
        if columns.len() != reference.len() {
            return Err(ParityError::Counts {
                path: candidate,
                want: reference.len(),
                got: columns.len(),
            });
        }
        let mut deviations = FieldDeviations::default();
        for (ray, want) in reference.iter().enumerate() {
            let got = columns.trace(ray);
            for field in Field::ALL {
                let delta = (field.of(&got) - field.of(want)).abs();
                // a NaN delta must fail the agreement test, `delta > tolerance`
                // would wave it through
                let agrees = delta <= self.tolerance;
                if !agrees {
                    return Err(ParityError::Mismatch {
                        reference: TracePath::PerRay,
                        candidate,
                        ray,
                        field,
                        want: field.of(want),
                        got: field.of(&got),
                        delta,
                        tolerance: self.tolerance,
                    });
                }
                deviations.record(field, delta);
            }
        }
        Ok(deviations)
    }
}
