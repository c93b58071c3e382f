//! Model-grid fitting.
//!
//! Responsibilities:
//!
//! - evaluate scale + chi-square for every (galaxy, model) pair (parallel)
//! - build best-fit records, marginal posteriors and weighted draws
//! - drive chunked runs over galaxies and model storage chunks

pub mod chisq;
pub mod orchestrator;
pub mod posterior;

pub use chisq::*;
pub use orchestrator::*;
pub use posterior::*;
