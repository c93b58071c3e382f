//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments and installs logging
//! - loads `.env` and sizes the worker pool
//! - runs the fit pipeline or describes a grid
//! - prints summaries

use clap::Parser;

use crate::cli::{Cli, Command, FitArgs, InfoArgs};
use crate::error::AppError;
use crate::grid::DirectoryGrid;

pub mod pipeline;

/// Environment variable that fixes the number of worker threads.
pub const THREADS_ENV: &str = "SPSFIT_THREADS";

/// Entry point for the `spsfit` binary.
pub fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();
    configure_threads()?;

    match cli.command {
        Command::Fit(args) => handle_fit(args),
        Command::Info(args) => handle_info(args),
    }
}

fn configure_threads() -> Result<(), AppError> {
    let Ok(raw) = std::env::var(THREADS_ENV) else {
        return Ok(());
    };
    let threads: usize = raw
        .trim()
        .parse()
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| AppError::new(2, format!("{THREADS_ENV} must be a positive integer (got '{raw}')")))?;
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .map_err(|e| AppError::new(2, format!("failed to configure {threads} worker threads: {e}")))?;
    tracing::debug!(threads, "configured worker pool");
    Ok(())
}

fn handle_fit(args: FitArgs) -> Result<(), AppError> {
    let opts = run_options_from_args(&args);
    let run = pipeline::run_fit(&opts)?;

    for grid in &run.grids {
        println!(
            "{}",
            crate::report::format_fit_summary(&grid.name, grid.n_models, &grid.output, args.top)
        );
        if run.dry_run {
            continue;
        }
        println!("Wrote {}", grid.paths.results.display());
        println!("Wrote {}", grid.paths.draws.display());
        println!("Wrote {}", grid.paths.run.display());
        if let Some(rows) = grid.chi2_rows {
            println!("Wrote {} ({rows} rows)", grid.paths.chi2.display());
        }
    }
    if run.dry_run {
        println!("Dry run: no files written.");
    }
    Ok(())
}

fn handle_info(args: InfoArgs) -> Result<(), AppError> {
    let grid = DirectoryGrid::open(&args.grid)?;
    let name = args
        .grid
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| args.grid.display().to_string());
    print!("{}", crate::report::format_grid_info(&name, grid.manifest(), &grid));
    Ok(())
}

pub fn run_options_from_args(args: &FitArgs) -> pipeline::RunOptions {
    pipeline::RunOptions {
        params: args.params.clone(),
        photometry: args.photometry.clone(),
        output_dir: args.output_dir.clone(),
        overwrite: args.overwrite,
        dry_run: args.dry_run,
        subset: args.subset.clone(),
        dump_chi2: args.dump_chi2,
    }
}
