//!
//! # Pupil sampling grid
//!
//! A square grid of normalized pupil coordinates `(px, py)` used to feed the
//! ray tracing routines. The grid is symmetric about the pupil center and spans
//! `[-0.5, 0.5]` on both axes, i.e. the half pupil.
//!
//! The grid can also be derived from a requested number of rays: the side is
//! the square root of the request rounded to an odd point count, so the number
//! of rays actually traced may differ slightly from the request. Asking for 81
//! rays samples a 9x9 grid, asking for 80 rays samples a 9x9 grid as well.

use serde::{Deserialize, Serialize};

/// Square grid of normalized pupil coordinates
///
/// The grid side is `2 * half + 1` points, the grid holds `side * side` rays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PupilGrid {
    half: u32,
}
impl Default for PupilGrid {
    /// A 9x9 grid (81 rays)
    fn default() -> Self {
        Self { half: 4 }
    }
}
impl PupilGrid {
    /// Creates a grid from its half side, `half = 0` is the single chief ray
    pub fn new(half: u32) -> Self {
        Self { half }
    }
    /// Creates the centered grid closest to `n_ray` points
    ///
    /// With `n_ray` less than 4 this degenerates to the single on-axis ray
    pub fn with_ray_target(n_ray: usize) -> Self {
        let half = (n_ray as f64).sqrt().floor() as u32 / 2;
        Self { half }
    }
    /// Number of points along one side of the grid
    pub fn side(&self) -> usize {
        2 * self.half as usize + 1
    }
    /// Total number of rays in the grid
    pub fn len(&self) -> usize {
        self.side() * self.side()
    }
    /// The grid always holds at least the on-axis ray
    pub fn is_empty(&self) -> bool {
        false
    }
    /// Iterator over the `(px, py)` grid points
    ///
    /// `px` is the slow axis and `py` the fast one, both running from -0.5
    /// to 0.5 inclusive; the iteration order is part of the contract as the
    /// tracing routines index their outputs by grid position
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> {
        let half = self.half as i64;
        let div = (2 * half).max(1) as f64;
        (-half..=half).flat_map(move |i| {
            (-half..=half).map(move |j| (i as f64 / div, j as f64 / div))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_with_square_count() {
        let grid = PupilGrid::with_ray_target(81);
        assert_eq!(grid.side(), 9);
        assert_eq!(grid.len(), 81);
    }

    #[test]
    fn target_snaps_to_an_odd_side() {
        let grid = PupilGrid::with_ray_target(80);
        assert_eq!(grid.len(), 81);
        let grid = PupilGrid::with_ray_target(120);
        assert_eq!(grid.len(), 121);
    }

    #[test]
    fn largest_schedule_entry() {
        let grid = PupilGrid::with_ray_target(10609);
        assert_eq!(grid.side(), 103);
        assert_eq!(grid.len(), 10609);
    }

    #[test]
    fn single_ray() {
        let grid = PupilGrid::with_ray_target(1);
        assert_eq!(grid.len(), 1);
        assert_eq!(grid.points().collect::<Vec<_>>(), vec![(0f64, 0f64)]);
    }

    #[test]
    fn points_span_the_half_pupil() {
        let grid = PupilGrid::new(4);
        let pts: Vec<_> = grid.points().collect();
        assert_eq!(pts.len(), 81);
        assert_eq!(pts[0], (-0.5, -0.5));
        assert_eq!(pts[1], (-0.5, -0.375));
        assert_eq!(pts[80], (0.5, 0.5));
        assert!(pts.iter().all(|(px, py)| px.abs() <= 0.5 && py.abs() <= 0.5));
    }

    #[test]
    fn points_match_len() {
        for half in [0, 1, 4, 13] {
            let grid = PupilGrid::new(half);
            assert_eq!(grid.points().count(), grid.len());
        }
    }
}
