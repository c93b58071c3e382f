//! In-memory model grid.

use crate::domain::{ModelChunk, ModelId, ModelRecord};
use crate::error::FitError;
use crate::grid::ModelGridReader;

/// A grid held entirely in memory, split into fixed chunks.
#[derive(Debug, Clone)]
pub struct InMemoryGrid {
    filters: Vec<String>,
    redshift_grid: Vec<f64>,
    chunks: Vec<Vec<ModelRecord>>,
    lens: Vec<usize>,
}

impl InMemoryGrid {
    /// Build a grid from explicit chunks. Model ids are (re)assigned from
    /// chunk order.
    pub fn new(filters: Vec<String>, redshift_grid: Vec<f64>, chunks: Vec<Vec<ModelRecord>>) -> Self {
        let chunks: Vec<Vec<ModelRecord>> = chunks
            .into_iter()
            .enumerate()
            .map(|(c, models)| {
                models
                    .into_iter()
                    .enumerate()
                    .map(|(i, mut m)| {
                        m.id = ModelId { chunk: c, index: i };
                        m
                    })
                    .collect()
            })
            .collect();
        let lens = chunks.iter().map(Vec::len).collect();
        Self {
            filters,
            redshift_grid,
            chunks,
            lens,
        }
    }

    /// Split a flat model list into chunks of at most `chunk_size` models.
    pub fn chunked(
        filters: Vec<String>,
        redshift_grid: Vec<f64>,
        models: Vec<ModelRecord>,
        chunk_size: usize,
    ) -> Self {
        let chunk_size = chunk_size.max(1);
        let mut chunks = Vec::new();
        let mut iter = models.into_iter().peekable();
        while iter.peek().is_some() {
            chunks.push(iter.by_ref().take(chunk_size).collect());
        }
        Self::new(filters, redshift_grid, chunks)
    }
}

impl ModelGridReader for InMemoryGrid {
    fn filters(&self) -> &[String] {
        &self.filters
    }

    fn redshift_grid(&self) -> &[f64] {
        &self.redshift_grid
    }

    fn chunk_lens(&self) -> &[usize] {
        &self.lens
    }

    fn read_chunk(&self, index: usize) -> Result<ModelChunk, FitError> {
        let models = self
            .chunks
            .get(index)
            .ok_or_else(|| FitError::Grid(format!("no chunk {index} (grid has {})", self.chunks.len())))?;
        Ok(ModelChunk {
            index,
            models: models.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SfhParams;

    #[test]
    fn chunked_assigns_ids_per_chunk() {
        let params: SfhParams =
            serde_json::from_str(r#"{"tau":1,"metallicity":0.02,"age":1,"mstar":1}"#).unwrap();
        let models: Vec<ModelRecord> = (0..5)
            .map(|_| ModelRecord {
                id: ModelId { chunk: 9, index: 9 },
                params: params.clone(),
                flux: vec![1.0],
            })
            .collect();
        let grid = InMemoryGrid::chunked(vec!["r".into()], vec![0.1], models, 2);
        assert_eq!(grid.chunk_lens(), &[2, 2, 1]);
        assert_eq!(grid.n_models(), 5);
        let chunk = grid.read_chunk(2).unwrap();
        assert_eq!(chunk.models[0].id, ModelId { chunk: 2, index: 0 });
        assert!(grid.read_chunk(3).is_err());
    }
}
