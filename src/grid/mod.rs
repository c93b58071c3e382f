//! Model grid access.
//!
//! The fitter only ever sees a grid through [`ModelGridReader`]: a finite
//! sequence of chunks, each a flat list of models with redshift-indexed flux
//! tables. How chunks are stored is up to the reader.
//!
//! - `memory`: grids built in-process (tests, embedding)
//! - `dir`: a directory with `manifest.json` plus one JSON file per chunk

pub mod dir;
pub mod memory;

pub use dir::*;
pub use memory::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::domain::ModelChunk;
use crate::error::FitError;

/// Source of model chunks.
pub trait ModelGridReader: Sync {
    fn filters(&self) -> &[String];

    /// Redshift nodes of every model's flux table.
    fn redshift_grid(&self) -> &[f64];

    /// Number of models in each chunk, in chunk order.
    fn chunk_lens(&self) -> &[usize];

    /// Read chunk `index`. Model ids must be `(index, position)`.
    fn read_chunk(&self, index: usize) -> Result<ModelChunk, FitError>;

    fn n_chunks(&self) -> usize {
        self.chunk_lens().len()
    }

    fn n_models(&self) -> usize {
        self.chunk_lens().iter().sum()
    }
}

/// Shared flag checked between chunk reads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Read a chunk, retrying failed reads up to `retries` extra times.
///
/// Reads have no side effects, so a retry is always safe.
pub fn read_chunk_with_retry<R: ModelGridReader + ?Sized>(
    reader: &R,
    index: usize,
    retries: usize,
    cancel: Option<&CancelToken>,
) -> Result<ModelChunk, FitError> {
    let mut attempt = 0;
    loop {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(FitError::Cancelled);
        }
        match reader.read_chunk(index) {
            Ok(chunk) => return Ok(chunk),
            Err(err @ (FitError::Grid(_) | FitError::Io(_))) if attempt < retries => {
                attempt += 1;
                tracing::warn!(chunk = index, attempt, error = %err, "model chunk read failed, retrying");
            }
            Err(err) => return Err(err),
        }
    }
}

/// Check a freshly read chunk against the grid geometry.
pub fn validate_chunk(
    chunk: &ModelChunk,
    expected_len: usize,
    n_redshift: usize,
    n_filters: usize,
    max_bursts: usize,
) -> Result<(), FitError> {
    if chunk.models.len() != expected_len {
        return Err(FitError::Grid(format!(
            "chunk {} holds {} models, manifest says {expected_len}",
            chunk.index,
            chunk.models.len()
        )));
    }
    let table_len = n_redshift * n_filters;
    for (pos, model) in chunk.models.iter().enumerate() {
        if model.id.chunk != chunk.index || model.id.index != pos {
            return Err(FitError::Grid(format!(
                "chunk {} model {pos} carries id {:?}",
                chunk.index, model.id
            )));
        }
        if model.flux.len() != table_len {
            return Err(FitError::Grid(format!(
                "chunk {} model {pos}: flux table has {} values, expected {n_redshift}x{n_filters}",
                chunk.index,
                model.flux.len()
            )));
        }
        if model.flux.iter().any(|f| !f.is_finite()) {
            return Err(FitError::Grid(format!(
                "chunk {} model {pos}: non-finite flux",
                chunk.index
            )));
        }
        if model.params.bursts.len() > max_bursts {
            return Err(FitError::Grid(format!(
                "chunk {} model {pos}: {} bursts exceeds max_bursts={max_bursts}",
                chunk.index,
                model.params.bursts.len()
            )));
        }
    }
    Ok(())
}
