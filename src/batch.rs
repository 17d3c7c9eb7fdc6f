//!
//! # Bulk ray data
//!
//! The array tracing call moves rays in and out of the server as a single
//! block of fixed layout records ([`RayRecord`], the `DDERAYDATA` struct of
//! the Zemax Extensions manual). Record 0 is a header describing the batch,
//! records 1..=n are the rays; the server overwrites the records in place
//! with the trace results.
//!
//! [`RayBatch`] owns such a block, fills it from a [`PupilGrid`], hands it to
//! the transport and unpacks the results. The whole batch travels in one
//! exchange, which is what makes this path orders of magnitude faster than
//! one `GetTrace` item per ray.

use serde::{Deserialize, Serialize};

use crate::{
    protocol::{Trace, IMAGE_SURFACE},
    PupilGrid, TraceMode,
};

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error(
        "{count} of {total} rays failed to trace, first failure at ray {first_ray} with error {first_error}"
    )]
    RayFailures {
        count: usize,
        total: usize,
        first_ray: usize,
        first_error: i32,
    },
}

/// One ray data record of the bulk trace exchange
///
/// The field layout matches the `DDERAYDATA` struct byte for byte. On input
/// with trace type 0 the record carries the normalized coordinates: `(x, y)`
/// is the field point, `(z, l)` the pupil point. On output `(x, y, z)` is
/// the ray intercept, `(l, m, n)` the ray direction cosines and
/// `(exr, eyr, ezr)` the surface normal direction cosines.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RayRecord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub l: f64,
    pub m: f64,
    pub n: f64,
    pub opd: f64,
    pub intensity: f64,
    pub exr: f64,
    pub exi: f64,
    pub eyr: f64,
    pub eyi: f64,
    pub ezr: f64,
    pub ezi: f64,
    pub wave: i32,
    pub error: i32,
    pub vigcode: i32,
    pub want_opd: i32,
}
impl RayRecord {
    /// The traced record recast as a `GetTrace` reply
    ///
    /// The surface normal lands in `(l2, m2, n2)`, which is where `GetTrace`
    /// reports it
    pub fn as_trace(&self) -> Trace {
        Trace {
            error: self.error,
            vigcode: self.vigcode,
            x: self.x,
            y: self.y,
            z: self.z,
            l: self.l,
            m: self.m,
            n: self.n,
            l2: self.exr,
            m2: self.eyr,
            n2: self.ezr,
            intensity: self.intensity,
        }
    }
}

/// Summary of the failed rays of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayFailures {
    pub count: usize,
    pub first_ray: usize,
    pub first_error: i32,
}
impl RayFailures {
    /// The failures recast as the batch error, `total` is the batch size
    pub fn into_error(self, total: usize) -> BatchError {
        BatchError::RayFailures {
            count: self.count,
            total,
            first_ray: self.first_ray,
            first_error: self.first_error,
        }
    }
}

/// A header record followed by ray records, ready for the array trace
#[derive(Debug, Clone, PartialEq)]
pub struct RayBatch {
    records: Vec<RayRecord>,
}
impl RayBatch {
    /// An unset batch of `n_ray` rays traced through `last_surf`
    ///
    /// The header encodes the batch in the fields of record 0: the ray count
    /// in `error`, the trace type in `opd`, the mode in `wave` and the first
    /// and last surfaces in `vigcode` and `want_opd`
    pub fn new(n_ray: usize, mode: TraceMode, last_surf: i32) -> Self {
        let mut records = vec![RayRecord::default(); n_ray + 1];
        records[0].error = n_ray as i32;
        records[0].opd = 0.0;
        records[0].wave = mode.code();
        records[0].vigcode = 0;
        records[0].want_opd = last_surf;
        Self { records }
    }
    /// A batch of real rays through the image surface, one per grid point,
    /// on-axis field, unit intensity
    pub fn from_grid(grid: &PupilGrid, wave: i32) -> Self {
        let mut batch = Self::new(grid.len(), TraceMode::Real, IMAGE_SURFACE);
        for (k, (px, py)) in grid.points().enumerate() {
            batch.set_ray(k, 0.0, 0.0, px, py, wave);
        }
        batch
    }
    /// Sets the normalized coordinates and the wavelength of ray `k`
    pub fn set_ray(&mut self, k: usize, hx: f64, hy: f64, px: f64, py: f64, wave: i32) {
        let r = &mut self.records[k + 1];
        r.x = hx;
        r.y = hy;
        r.z = px;
        r.l = py;
        r.intensity = 1.0;
        r.wave = wave;
        r.want_opd = 0;
    }
    /// Number of rays, the header record not included
    pub fn len(&self) -> usize {
        self.records.len() - 1
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// The ray records
    pub fn rays(&self) -> &[RayRecord] {
        &self.records[1..]
    }
    pub fn rays_mut(&mut self) -> &mut [RayRecord] {
        &mut self.records[1..]
    }
    /// The full block, header included, as the transport exchanges it
    pub(crate) fn records_mut(&mut self) -> &mut [RayRecord] {
        &mut self.records
    }
    /// Scans every traced ray for a non zero error code
    ///
    /// Each ray is inspected on its own; error codes are never summed as
    /// codes of opposite signs would mask one another
    pub fn failures(&self) -> Option<RayFailures> {
        let mut failed = self
            .rays()
            .iter()
            .enumerate()
            .filter(|(_, r)| r.error != 0);
        let (first_ray, first) = failed.next()?;
        Some(RayFailures {
            count: 1 + failed.count(),
            first_ray,
            first_error: first.error,
        })
    }
    /// Errors unless every ray traced cleanly
    pub fn ensure_traced(&self) -> Result<(), BatchError> {
        match self.failures() {
            None => Ok(()),
            Some(failures) => Err(failures.into_error(self.len())),
        }
    }
    /// Unpacks the traced rays into columns, one `Vec` per output quantity
    pub fn columns(&self) -> TraceColumns {
        let mut cols = TraceColumns::with_capacity(self.len());
        for r in self.rays() {
            cols.push(r);
        }
        cols
    }
}

/// Column major trace results
///
/// `(l2, m2, n2)` is the surface normal, carried by the `(exr, eyr, ezr)`
/// record fields on the wire
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceColumns {
    pub error: Vec<i32>,
    pub vigcode: Vec<i32>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub l: Vec<f64>,
    pub m: Vec<f64>,
    pub n: Vec<f64>,
    pub l2: Vec<f64>,
    pub m2: Vec<f64>,
    pub n2: Vec<f64>,
    pub opd: Vec<f64>,
    pub intensity: Vec<f64>,
}
impl TraceColumns {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            error: Vec::with_capacity(n),
            vigcode: Vec::with_capacity(n),
            x: Vec::with_capacity(n),
            y: Vec::with_capacity(n),
            z: Vec::with_capacity(n),
            l: Vec::with_capacity(n),
            m: Vec::with_capacity(n),
            n: Vec::with_capacity(n),
            l2: Vec::with_capacity(n),
            m2: Vec::with_capacity(n),
            n2: Vec::with_capacity(n),
            opd: Vec::with_capacity(n),
            intensity: Vec::with_capacity(n),
        }
    }
    pub fn push(&mut self, r: &RayRecord) {
        self.error.push(r.error);
        self.vigcode.push(r.vigcode);
        self.x.push(r.x);
        self.y.push(r.y);
        self.z.push(r.z);
        self.l.push(r.l);
        self.m.push(r.m);
        self.n.push(r.n);
        self.l2.push(r.exr);
        self.m2.push(r.eyr);
        self.n2.push(r.ezr);
        self.opd.push(r.opd);
        self.intensity.push(r.intensity);
    }
    pub fn len(&self) -> usize {
        self.error.len()
    }
    pub fn is_empty(&self) -> bool {
        self.error.is_empty()
    }
    /// Scans the error column for a failed ray, one entry at a time like
    /// [`RayBatch::failures`]
    pub fn failures(&self) -> Option<RayFailures> {
        let mut failed = self
            .error
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, code)| code != 0);
        let (first_ray, first_error) = failed.next()?;
        Some(RayFailures {
            count: 1 + failed.count(),
            first_ray,
            first_error,
        })
    }
    /// Errors unless every ray traced cleanly
    pub fn ensure_traced(&self) -> Result<(), BatchError> {
        match self.failures() {
            None => Ok(()),
            Some(failures) => Err(failures.into_error(self.len())),
        }
    }
    /// The ray `k` column entries recast as a `GetTrace` reply
    pub fn trace(&self, k: usize) -> Trace {
        Trace {
            error: self.error[k],
            vigcode: self.vigcode[k],
            x: self.x[k],
            y: self.y[k],
            z: self.z[k],
            l: self.l[k],
            m: self.m[k],
            n: self.n[k],
            l2: self.l2[k],
            m2: self.m2[k],
            n2: self.n2[k],
            intensity: self.intensity[k],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encodes_the_batch() {
        let grid = PupilGrid::new(4);
        let mut batch = RayBatch::from_grid(&grid, 1);
        assert_eq!(batch.len(), 81);
        let header = batch.records_mut()[0];
        assert_eq!(header.error, 81);
        assert_eq!(header.opd, 0.0);
        assert_eq!(header.wave, TraceMode::Real.code());
        assert_eq!(header.vigcode, 0);
        assert_eq!(header.want_opd, IMAGE_SURFACE);
    }

    #[test]
    fn rays_follow_the_grid_order() {
        let grid = PupilGrid::new(1);
        let batch = RayBatch::from_grid(&grid, 2);
        let pupil: Vec<_> = batch.rays().iter().map(|r| (r.z, r.l)).collect();
        assert_eq!(pupil, grid.points().collect::<Vec<_>>());
        assert!(batch
            .rays()
            .iter()
            .all(|r| r.wave == 2 && r.intensity == 1.0 && (r.x, r.y) == (0.0, 0.0)));
    }

    #[test]
    fn failure_sweep_is_per_ray() {
        let mut batch = RayBatch::new(10, TraceMode::Real, IMAGE_SURFACE);
        assert!(batch.failures().is_none());
        // codes of opposite signs must not cancel out
        batch.rays_mut()[3].error = -7;
        batch.rays_mut()[8].error = 7;
        let failures = batch.failures().unwrap();
        assert_eq!(failures.count, 2);
        assert_eq!(failures.first_ray, 3);
        assert_eq!(failures.first_error, -7);
        assert!(matches!(
            batch.ensure_traced(),
            Err(BatchError::RayFailures {
                count: 2,
                total: 10,
                first_ray: 3,
                first_error: -7
            })
        ));
    }

    #[test]
    fn column_failure_sweep_matches_the_record_sweep() {
        let mut batch = RayBatch::new(10, TraceMode::Real, IMAGE_SURFACE);
        batch.rays_mut()[3].error = -7;
        batch.rays_mut()[8].error = 7;
        let cols = batch.columns();
        assert_eq!(cols.failures(), batch.failures());
        assert!(matches!(
            cols.ensure_traced(),
            Err(BatchError::RayFailures {
                count: 2,
                total: 10,
                first_ray: 3,
                first_error: -7
            })
        ));
    }

    #[test]
    fn columns_mirror_the_records() {
        let mut batch = RayBatch::new(2, TraceMode::Real, IMAGE_SURFACE);
        batch.rays_mut()[0] = RayRecord {
            x: 1.0,
            y: 2.0,
            z: 3.0,
            l: 0.1,
            m: 0.2,
            n: 0.97,
            exr: -0.01,
            eyr: 0.01,
            ezr: 0.999,
            intensity: 1.0,
            ..Default::default()
        };
        let cols = batch.columns();
        assert_eq!(cols.len(), 2);
        assert_eq!(cols.x[0], 1.0);
        assert_eq!(cols.l2[0], -0.01);
        assert_eq!(cols.trace(0), batch.rays()[0].as_trace());
    }
}
