//! Photometry CSV ingest.
//!
//! Expected schema (header names are case-insensitive, column order is free):
//!
//! ```text
//! id,z,flux_<f1>,ivar_<f1>,flux_<f2>,ivar_<f2>,...
//! ```
//!
//! with one `flux_`/`ivar_` pair per configured filter, in maggies. Unlike a
//! lenient ingest that skips bad rows, every row here must parse: a galaxy
//! silently dropped from the sample would shift the index space that subset
//! fits refer to.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use csv::StringRecord;
use nalgebra::DMatrix;

use crate::domain::Photometry;
use crate::error::FitError;

/// Load a photometry CSV for the given filter list.
pub fn load_photometry(path: &Path, filters: &[String]) -> Result<Photometry, FitError> {
    let file = File::open(path)
        .map_err(|e| FitError::Config(format!("failed to open photometry CSV '{}': {e}", path.display())))?;
    read_photometry(file, filters)
}

/// Parse photometry CSV from any reader.
pub fn read_photometry<R: std::io::Read>(input: R, filters: &[String]) -> Result<Photometry, FitError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(input);

    let headers = reader
        .headers()
        .map_err(|e| FitError::Config(format!("failed to read CSV headers: {e}")))?
        .clone();
    let header_map = build_header_map(&headers);

    let id_col = require_column(&header_map, "id")?;
    let z_col = require_column(&header_map, "z")?;
    let mut flux_cols = Vec::with_capacity(filters.len());
    let mut ivar_cols = Vec::with_capacity(filters.len());
    for f in filters {
        let f = f.to_ascii_lowercase();
        flux_cols.push(require_column(&header_map, &format!("flux_{f}"))?);
        ivar_cols.push(require_column(&header_map, &format!("ivar_{f}"))?);
    }

    let mut ids = Vec::new();
    let mut redshift = Vec::new();
    let mut flux = Vec::new();
    let mut ivar = Vec::new();

    for (idx, result) in reader.records().enumerate() {
        // records() starts after the header; CSV lines are 1-based.
        let line = idx + 2;
        let record = result.map_err(|e| FitError::InvalidValue(format!("line {line}: CSV parse error: {e}")))?;

        ids.push(field(&record, id_col, line)?.to_string());
        redshift.push(parse_f64(&record, z_col, line, "z")?);
        for (&fc, &ic) in flux_cols.iter().zip(&ivar_cols) {
            flux.push(parse_f64(&record, fc, line, &headers[fc])?);
            ivar.push(parse_f64(&record, ic, line, &headers[ic])?);
        }
    }

    let n = ids.len();
    let n_filters = filters.len();
    // Values were pushed galaxy by galaxy, i.e. column-major for n_filters × n.
    Ok(Photometry {
        ids,
        redshift,
        flux: DMatrix::from_vec(n_filters, n, flux),
        ivar: DMatrix::from_vec(n_filters, n, ivar),
    })
}

/// Parse a subset specification like `0,3,10-19` into sorted, unique indices.
pub fn parse_index_list(spec: &str) -> Result<Vec<usize>, FitError> {
    let mut out = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let bad = || FitError::Config(format!("invalid subset entry '{part}'"));
        match part.split_once('-') {
            Some((a, b)) => {
                let a: usize = a.trim().parse().map_err(|_| bad())?;
                let b: usize = b.trim().parse().map_err(|_| bad())?;
                if b < a {
                    return Err(bad());
                }
                out.extend(a..=b);
            }
            None => out.push(part.parse().map_err(|_| bad())?),
        }
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name), idx))
        .collect()
}

fn normalize_header_name(name: &str) -> String {
    // Spreadsheet exports may prefix the first header with a UTF-8 BOM.
    let name = name.trim().trim_start_matches('\u{feff}');
    name.to_ascii_lowercase()
}

fn require_column(header_map: &HashMap<String, usize>, name: &str) -> Result<usize, FitError> {
    header_map
        .get(name)
        .copied()
        .ok_or_else(|| FitError::ShapeMismatch(format!("photometry CSV is missing column `{name}`")))
}

fn field<'r>(record: &'r StringRecord, col: usize, line: usize) -> Result<&'r str, FitError> {
    record
        .get(col)
        .ok_or_else(|| FitError::ShapeMismatch(format!("line {line}: too few fields")))
}

fn parse_f64(record: &StringRecord, col: usize, line: usize, name: &str) -> Result<f64, FitError> {
    let raw = field(record, col, line)?;
    raw.parse::<f64>()
        .map_err(|_| FitError::InvalidValue(format!("line {line}: `{name}` is not a number: '{raw}'")))
}
