//! Mathematical utilities: cosmological ages, grid interpolation, weighted statistics.

pub mod cosmology;
pub mod interp;
pub mod stats;

pub use cosmology::*;
pub use interp::*;
pub use stats::*;
