//! The `spsfit fit` workflow, kept free of terminal output so it can be
//! driven from tests:
//!
//! params → photometry → open grids → output guard → fit each grid → write
//!
//! Every grid is validated and every output target checked before the first
//! fit, so a bad input or an overwrite refusal never costs a completed fit.
//! Nothing is published until all grids have been fit; on any error the
//! files of the aborted run are removed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::domain::{FitParams, Photometry};
use crate::error::FitError;
use crate::fit::{FitOrchestrator, FitOutput, GridSink};
use crate::grid::{DirectoryGrid, ModelGridReader};
use crate::io::{
    CsvGridSink, OutputPaths, discard_outputs, ensure_outputs_absent, load_params, load_photometry,
    parse_index_list, staging_path, write_draws_csv, write_results_csv, write_run_json,
};

/// Inputs of one `fit` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub params: PathBuf,
    pub photometry: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub overwrite: bool,
    pub dry_run: bool,
    pub subset: Option<String>,
    pub dump_chi2: bool,
}

/// Result of fitting one grid configuration.
#[derive(Debug, Clone)]
pub struct GridRun {
    pub name: String,
    pub grid_path: PathBuf,
    pub n_models: usize,
    pub paths: OutputPaths,
    pub output: FitOutput,
    /// Rows written to the chi-square dump, if one was requested.
    pub chi2_rows: Option<usize>,
}

/// Everything a `fit` invocation computed.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub params: FitParams,
    pub n_galaxies: usize,
    pub subset: Option<Vec<usize>>,
    pub grids: Vec<GridRun>,
    pub dry_run: bool,
}

/// Execute the full fit workflow.
pub fn run_fit(opts: &RunOptions) -> Result<RunOutput, FitError> {
    let mut params = load_params(&opts.params)?;
    if let Some(dir) = &opts.output_dir {
        params.output_dir = dir.clone();
    }
    params.validate()?;
    if params.grids.is_empty() {
        return Err(FitError::Config("parameter file lists no model grids".into()));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = params.grids.iter().find(|g| !seen.insert(g.name.as_str())) {
        return Err(FitError::Config(format!("grid name '{}' appears twice", dup.name)));
    }

    let photometry = load_photometry(&opts.photometry, &params.filters)?;
    let subset = opts.subset.as_deref().map(parse_index_list).transpose()?;
    tracing::info!(
        n_galaxies = photometry.n_galaxies(),
        n_filters = photometry.n_filters(),
        subset = subset.as_ref().map(Vec::len),
        "loaded photometry"
    );

    let readers = params
        .grids
        .iter()
        .map(|spec| DirectoryGrid::open(&spec.path))
        .collect::<Result<Vec<_>, _>>()?;

    // Every grid is validated against the sample before any file is touched.
    for (spec, reader) in params.grids.iter().zip(&readers) {
        let orchestrator = FitOrchestrator::new(reader, &params);
        match &subset {
            Some(indices) => orchestrator.validate_subset(&photometry, indices),
            None => orchestrator.validate(&photometry).map(|_| ()),
        }
        .map_err(|e| annotate(e, &spec.name))?;
    }

    let paths: Vec<OutputPaths> = params
        .grids
        .iter()
        .map(|spec| OutputPaths::new(&params.output_dir, &params.output_prefix, &spec.name))
        .collect();
    if !opts.dry_run {
        ensure_outputs_absent(paths.iter().flat_map(|p| p.targets(opts.dump_chi2)), opts.overwrite)?;
    }

    let mut staged = Vec::new();
    let grids = match fit_grids(&params, &readers, paths, &photometry, subset.as_deref(), opts, &mut staged) {
        Ok(grids) => grids,
        Err(err) => {
            discard_outputs(&staged);
            return Err(err);
        }
    };

    if !opts.dry_run {
        let mut written = Vec::new();
        if let Err(err) = publish(&grids, &params, opts, subset.as_deref(), &mut written) {
            discard_outputs(&staged);
            discard_outputs(&written);
            return Err(err);
        }
    }

    Ok(RunOutput {
        n_galaxies: photometry.n_galaxies(),
        params,
        subset,
        grids,
        dry_run: opts.dry_run,
    })
}

/// Fit every grid. Chi-square dumps go to staging files recorded in `staged`.
fn fit_grids(
    params: &FitParams,
    readers: &[DirectoryGrid],
    paths: Vec<OutputPaths>,
    photometry: &Photometry,
    subset: Option<&[usize]>,
    opts: &RunOptions,
    staged: &mut Vec<PathBuf>,
) -> Result<Vec<GridRun>, FitError> {
    let mut grids = Vec::with_capacity(readers.len());
    for ((spec, reader), paths) in params.grids.iter().zip(readers).zip(paths) {
        tracing::info!(grid = spec.name.as_str(), path = %spec.path.display(), "fitting grid configuration");
        let orchestrator = FitOrchestrator::new(reader, params);

        let mut sink = if opts.dump_chi2 && !opts.dry_run {
            std::fs::create_dir_all(&params.output_dir)?;
            let tmp = staging_path(&paths.chi2);
            staged.push(tmp.clone());
            Some(CsvGridSink::create(&tmp)?)
        } else {
            None
        };
        let sink_ref = sink.as_mut().map(|s| s as &mut dyn GridSink);
        let output = match subset {
            Some(indices) => orchestrator.fit_subset(photometry, indices, sink_ref),
            None => orchestrator.fit_with_sink(photometry, sink_ref),
        }
        .map_err(|e| annotate(e, &spec.name))?;
        let chi2_rows = sink.map(CsvGridSink::finish).transpose()?;

        grids.push(GridRun {
            name: spec.name.clone(),
            grid_path: spec.path.clone(),
            n_models: reader.n_models(),
            paths,
            output,
            chi2_rows,
        });
    }
    Ok(grids)
}

/// Write the outputs of every grid, recording each finished file in `written`.
fn publish(
    grids: &[GridRun],
    params: &FitParams,
    opts: &RunOptions,
    subset: Option<&[usize]>,
    written: &mut Vec<PathBuf>,
) -> Result<(), FitError> {
    std::fs::create_dir_all(&params.output_dir)?;
    for run in grids {
        if run.chi2_rows.is_some() {
            std::fs::rename(staging_path(&run.paths.chi2), &run.paths.chi2)?;
            written.push(run.paths.chi2.clone());
        }
        write_grid_outputs(run, params, &opts.photometry, subset, written)?;
    }
    Ok(())
}

/// Prefix reader-specific errors with the grid name.
fn annotate(err: FitError, grid: &str) -> FitError {
    match err {
        FitError::ShapeMismatch(m) => FitError::ShapeMismatch(format!("grid '{grid}': {m}")),
        FitError::InvalidValue(m) => FitError::InvalidValue(format!("grid '{grid}': {m}")),
        FitError::GridBounds(m) => FitError::GridBounds(format!("grid '{grid}': {m}")),
        FitError::Grid(m) => FitError::Grid(format!("grid '{grid}': {m}")),
        other => other,
    }
}

fn write_grid_outputs(
    run: &GridRun,
    params: &FitParams,
    photometry: &Path,
    subset: Option<&[usize]>,
    written: &mut Vec<PathBuf>,
) -> Result<(), FitError> {
    written.push(run.paths.results.clone());
    write_results_csv(&run.paths.results, &run.output.results, &params.filters)?;
    written.push(run.paths.draws.clone());
    write_draws_csv(&run.paths.draws, &run.output.results, &run.output.draws)?;

    let params_json = serde_json::to_value(params)
        .map_err(|e| FitError::Config(format!("failed to serialise parameters: {e}")))?;
    let meta = serde_json::json!({
        "created": chrono::Local::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "grid": {
            "name": run.name,
            "path": run.grid_path.display().to_string(),
            "n_models": run.n_models,
        },
        "photometry": photometry.display().to_string(),
        "n_galaxies": run.output.len(),
        "n_fit": run.output.n_fit(),
        "subset": subset,
        "chi2_rows": run.chi2_rows,
        "params": params_json,
    });
    written.push(run.paths.run.clone());
    write_run_json(&run.paths.run, &meta)?;
    tracing::info!(grid = run.name.as_str(), results = %run.paths.results.display(), "wrote outputs");
    Ok(())
}
