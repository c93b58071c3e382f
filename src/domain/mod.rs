//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - run parameters (`FitParams`, `Cosmology`, `ScaleMode`)
//! - model grid records (`ModelRecord`, `ModelChunk`, `SfhParams`)
//! - observed photometry (`Photometry`)
//! - fit outputs (`GalaxyFit`, `PosteriorDraw`, `QuantityStat`)

pub mod types;

pub use types::*;
