//! Locating galaxy redshifts on the model redshift grid.

use crate::error::FitError;

/// Position of a redshift between two grid nodes: `lower + frac`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPosition {
    pub lower: usize,
    /// In `[0, 1)`; zero means exactly on node `lower`.
    pub frac: f64,
}

impl GridPosition {
    /// Fractional index into the grid.
    pub fn index(&self) -> f64 {
        self.lower as f64 + self.frac
    }
}

/// Require a non-empty, finite, strictly increasing grid.
pub fn check_grid(grid: &[f64]) -> Result<(), FitError> {
    if grid.is_empty() {
        return Err(FitError::GridBounds("redshift grid is empty".into()));
    }
    if let Some(bad) = grid.iter().find(|z| !z.is_finite()) {
        return Err(FitError::GridBounds(format!("redshift grid contains {bad}")));
    }
    if let Some(i) = grid.windows(2).position(|w| w[1] <= w[0]) {
        return Err(FitError::GridBounds(format!(
            "redshift grid is not strictly increasing at index {}: {} then {}",
            i + 1,
            grid[i],
            grid[i + 1]
        )));
    }
    Ok(())
}

/// Locate `z` on a grid already accepted by [`check_grid`].
pub fn locate(grid: &[f64], z: f64) -> Result<GridPosition, FitError> {
    let (first, last) = (grid[0], grid[grid.len() - 1]);
    if !(z >= first && z <= last) {
        return Err(FitError::GridBounds(format!(
            "redshift {z} outside model grid [{first}, {last}] (rebuild the model grid with wider redshift coverage)"
        )));
    }
    if z == last {
        // Put the upper endpoint on the last node with zero weight on its
        // (non-existent) right neighbour.
        return Ok(GridPosition {
            lower: grid.len() - 1,
            frac: 0.0,
        });
    }
    // First node strictly greater than z; z >= first so this is >= 1.
    let upper = grid.partition_point(|&g| g <= z);
    let lower = upper - 1;
    let frac = (z - grid[lower]) / (grid[upper] - grid[lower]);
    Ok(GridPosition { lower, frac })
}
