//! Result exports.
//!
//! - `<prefix>_<grid>_results.csv`: one row per galaxy
//! - `<prefix>_<grid>_draws.csv`: one row per posterior draw
//! - `<prefix>_<grid>_chi2.csv`: full chi-square grid (opt-in, large)
//! - `<prefix>_<grid>_run.json`: run metadata
//!
//! All targets of a run are checked with [`ensure_outputs_absent`] before any
//! fitting starts, so an overwrite refusal never wastes a fit. The chi-square
//! dump is streamed to a [`staging_path`] and renamed into place once the
//! whole run has succeeded.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::domain::{DERIVED_SENTINEL, GalaxyFit, PosteriorDraw, Quantity};
use crate::error::FitError;

/// Output files of one grid configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputPaths {
    pub results: PathBuf,
    pub draws: PathBuf,
    pub chi2: PathBuf,
    pub run: PathBuf,
}

impl OutputPaths {
    pub fn new(dir: &Path, prefix: &str, grid: &str) -> Self {
        let stem = format!("{prefix}_{grid}");
        Self {
            results: dir.join(format!("{stem}_results.csv")),
            draws: dir.join(format!("{stem}_draws.csv")),
            chi2: dir.join(format!("{stem}_chi2.csv")),
            run: dir.join(format!("{stem}_run.json")),
        }
    }

    /// Files this run will write.
    pub fn targets(&self, dump_chi2: bool) -> Vec<&Path> {
        let mut out = vec![self.results.as_path(), self.draws.as_path(), self.run.as_path()];
        if dump_chi2 {
            out.push(self.chi2.as_path());
        }
        out
    }
}

/// Fail with `OutputExists` if any target exists and `overwrite` is off.
pub fn ensure_outputs_absent<'p>(
    targets: impl IntoIterator<Item = &'p Path>,
    overwrite: bool,
) -> Result<(), FitError> {
    if overwrite {
        return Ok(());
    }
    for path in targets {
        if path.exists() {
            return Err(FitError::OutputExists(path.display().to_string()));
        }
    }
    Ok(())
}

/// Sibling path a streamed output is written to before it is published.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

/// Best-effort removal of the files of an aborted run.
pub fn discard_outputs(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed output of failed run"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove output"),
        }
    }
}

/// Write per-galaxy results.
pub fn write_results_csv(path: &Path, results: &[GalaxyFit], filters: &[String]) -> Result<(), FitError> {
    let file = File::create(path)?;
    let mut writer = csv::Writer::from_writer(file);

    let mut header: Vec<String> = [
        "id", "z", "chunk", "index", "model_index", "chi2", "scale", "scale_err", "n_valid_filters", "tau",
        "zmetal", "age", "delayed", "nburst", "av", "mu",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    for q in Quantity::ALL {
        for suffix in ["avg", "50", "err", "16", "84"] {
            header.push(format!("{}_{suffix}", q.label()));
        }
    }
    for f in filters {
        header.push(format!("bestflux_{f}"));
    }
    writer.write_record(&header).map_err(csv_err)?;

    for r in results {
        let mut row: Vec<String> = Vec::with_capacity(header.len());
        row.push(r.id.clone());
        row.push(fmt_f(r.z));
        row.push(fmt_opt_index(r.model.map(|m| m.chunk)));
        row.push(fmt_opt_index(r.model.map(|m| m.index)));
        row.push(fmt_opt_index(r.model_index));
        row.push(fmt_f(r.chi2));
        row.push(fmt_f(r.scale));
        row.push(fmt_f(r.scale_err));
        row.push(r.n_valid_filters.to_string());
        match &r.best {
            Some(p) => {
                row.push(fmt_f(p.tau));
                row.push(fmt_f(p.metallicity));
                row.push(fmt_f(p.age));
                row.push(u8::from(p.delayed).to_string());
                row.push(p.bursts.len().to_string());
                row.push(fmt_f(p.av));
                row.push(fmt_f(p.mu));
            }
            None => {
                for _ in 0..7 {
                    row.push(fmt_f(DERIVED_SENTINEL));
                }
            }
        }
        for s in &r.posterior {
            for v in [s.avg, s.p50, s.err, s.p16, s.p84] {
                row.push(fmt_f(v));
            }
        }
        row.extend(r.best_flux.iter().map(|&v| fmt_f(v)));
        writer.write_record(&row).map_err(csv_err)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write posterior draws, one row per draw.
pub fn write_draws_csv(path: &Path, results: &[GalaxyFit], draws: &[Vec<PosteriorDraw>]) -> Result<(), FitError> {
    let file = File::create(path)?;
    let mut writer = csv::Writer::from_writer(file);
    writer
        .write_record(["id", "draw", "chunk", "index", "model_index", "chi2", "scale", "scale_err"])
        .map_err(csv_err)?;
    for (r, galaxy_draws) in results.iter().zip(draws) {
        for (k, d) in galaxy_draws.iter().enumerate() {
            writer
                .write_record([
                    r.id.clone(),
                    k.to_string(),
                    fmt_opt_index(d.model.map(|m| m.chunk)),
                    fmt_opt_index(d.model.map(|m| m.index)),
                    fmt_opt_index(d.model_index),
                    fmt_f(d.chi2),
                    fmt_f(d.scale),
                    fmt_f(d.scale_err),
                ])
                .map_err(csv_err)?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Write a small JSON document describing the run.
pub fn write_run_json(path: &Path, meta: &serde_json::Value) -> Result<(), FitError> {
    let mut file = File::create(path)?;
    serde_json::to_writer_pretty(&mut file, meta)
        .map_err(|e| FitError::Io(std::io::Error::other(format!("failed to write run metadata: {e}"))))?;
    writeln!(file)?;
    Ok(())
}

pub(crate) fn csv_err(e: csv::Error) -> FitError {
    FitError::Io(std::io::Error::other(format!("CSV write failed: {e}")))
}

pub(crate) fn fmt_f(v: f64) -> String {
    format!("{v:.6e}")
}

fn fmt_opt_index(v: Option<usize>) -> String {
    v.map(|i| i.to_string()).unwrap_or_else(|| "-1".to_string())
}
