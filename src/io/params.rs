//! Parameter file loading.
//!
//! The parameter file is JSON deserialised into `FitParams`. Grid paths that
//! are relative are resolved against the parameter file's directory so a
//! run directory can be moved as a unit.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::domain::FitParams;
use crate::error::FitError;

pub fn load_params(path: &Path) -> Result<FitParams, FitError> {
    let file = File::open(path)
        .map_err(|e| FitError::Config(format!("failed to open parameter file '{}': {e}", path.display())))?;
    let mut params: FitParams = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| FitError::Config(format!("invalid parameter file '{}': {e}", path.display())))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for grid in &mut params.grids {
        if grid.path.is_relative() {
            grid.path = base.join(&grid.path);
        }
    }
    if params.output_dir.is_relative() {
        params.output_dir = base.join(&params.output_dir);
    }
    Ok(params)
}
