//! Directory-backed model grid.
//!
//! Layout:
//!
//! ```text
//! <dir>/manifest.json      filters, redshift grid, chunk file list
//! <dir>/chunk_0000.json    [ModelRecord, ...]
//! <dir>/chunk_0001.json
//! ```
//!
//! Only the manifest is read up front; chunk files are opened on demand so
//! at most one chunk is resident per reader call.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::{ModelChunk, ModelId, ModelRecord};
use crate::error::FitError;
use crate::grid::ModelGridReader;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Entry for one chunk file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub file: String,
    pub n_models: usize,
}

/// Contents of `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridManifest {
    pub filters: Vec<String>,
    pub redshift_grid: Vec<f64>,
    pub chunks: Vec<ChunkEntry>,
}

/// Model grid stored as a directory of JSON chunk files.
#[derive(Debug, Clone)]
pub struct DirectoryGrid {
    root: PathBuf,
    manifest: GridManifest,
    lens: Vec<usize>,
}

impl DirectoryGrid {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, FitError> {
        let root = root.as_ref().to_path_buf();
        let path = root.join(MANIFEST_FILE);
        let file = File::open(&path)
            .map_err(|e| FitError::Grid(format!("failed to open grid manifest '{}': {e}", path.display())))?;
        let manifest: GridManifest = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| FitError::Grid(format!("invalid grid manifest '{}': {e}", path.display())))?;
        let lens = manifest.chunks.iter().map(|c| c.n_models).collect();
        Ok(Self { root, manifest, lens })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &GridManifest {
        &self.manifest
    }
}

impl ModelGridReader for DirectoryGrid {
    fn filters(&self) -> &[String] {
        &self.manifest.filters
    }

    fn redshift_grid(&self) -> &[f64] {
        &self.manifest.redshift_grid
    }

    fn chunk_lens(&self) -> &[usize] {
        &self.lens
    }

    fn read_chunk(&self, index: usize) -> Result<ModelChunk, FitError> {
        let entry = self
            .manifest
            .chunks
            .get(index)
            .ok_or_else(|| FitError::Grid(format!("no chunk {index} in manifest")))?;
        let path = self.root.join(&entry.file);
        let file = File::open(&path)
            .map_err(|e| FitError::Grid(format!("failed to open chunk '{}': {e}", path.display())))?;
        let mut models: Vec<ModelRecord> = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| FitError::Grid(format!("invalid chunk '{}': {e}", path.display())))?;
        for (i, m) in models.iter_mut().enumerate() {
            m.id = ModelId { chunk: index, index: i };
        }
        Ok(ModelChunk { index, models })
    }
}

/// Write chunks and a manifest into `root` (created if missing).
pub fn write_grid_dir(
    root: impl AsRef<Path>,
    filters: &[String],
    redshift_grid: &[f64],
    chunks: &[Vec<ModelRecord>],
) -> Result<GridManifest, FitError> {
    let root = root.as_ref();
    std::fs::create_dir_all(root)?;

    let mut entries = Vec::with_capacity(chunks.len());
    for (i, models) in chunks.iter().enumerate() {
        let name = format!("chunk_{i:04}.json");
        let file = File::create(root.join(&name))?;
        serde_json::to_writer(file, models)
            .map_err(|e| FitError::Grid(format!("failed to write chunk '{name}': {e}")))?;
        entries.push(ChunkEntry {
            file: name,
            n_models: models.len(),
        });
    }

    let manifest = GridManifest {
        filters: filters.to_vec(),
        redshift_grid: redshift_grid.to_vec(),
        chunks: entries,
    };
    let file = File::create(root.join(MANIFEST_FILE))?;
    serde_json::to_writer_pretty(file, &manifest)
        .map_err(|e| FitError::Grid(format!("failed to write grid manifest: {e}")))?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SfhParams;

    #[test]
    fn round_trips_through_directory() {
        let dir = tempfile::tempdir().unwrap();
        let params: SfhParams =
            serde_json::from_str(r#"{"tau":2,"metallicity":0.01,"age":3,"mstar":0.6}"#).unwrap();
        let model = ModelRecord {
            id: ModelId { chunk: 0, index: 0 },
            params,
            flux: vec![1.0, 2.0],
        };
        let chunks = vec![vec![model.clone()], vec![model.clone(), model]];
        write_grid_dir(dir.path(), &["r".to_string()], &[0.1, 0.2], &chunks).unwrap();

        let grid = DirectoryGrid::open(dir.path()).unwrap();
        assert_eq!(grid.chunk_lens(), &[1, 2]);
        let chunk = grid.read_chunk(1).unwrap();
        assert_eq!(chunk.models[1].id, ModelId { chunk: 1, index: 1 });
        assert_eq!(chunk.models[1].params.tau, 2.0);
    }

    #[test]
    fn missing_manifest_is_a_grid_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(DirectoryGrid::open(dir.path()), Err(FitError::Grid(_))));
    }
}
