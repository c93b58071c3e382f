//! Input/output helpers.
//!
//! - photometry CSV ingest + subset parsing (`ingest`)
//! - result exports and the overwrite guard (`export`)
//! - streaming chi-square grid dump (`dump`)
//! - parameter file loading (`params`)

pub mod dump;
pub mod export;
pub mod ingest;
pub mod params;

pub use dump::*;
pub use export::*;
pub use ingest::*;
pub use params::*;
