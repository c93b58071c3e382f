//! Command-line parsing for the `spsfit` binary.
//!
//! Argument parsing stays separate from the fitting code: the library never
//! sees a clap type, only `FitParams` and paths.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "spsfit", version, about = "Chi-square SED fitting of galaxy photometry against model grids")]
pub struct Cli {
    /// Maximum log level (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: tracing::Level,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit a photometric catalog against every grid listed in the parameter file.
    Fit(FitArgs),
    /// Describe a model grid directory.
    Info(InfoArgs),
}

#[derive(Debug, Parser, Clone)]
pub struct FitArgs {
    /// JSON parameter file.
    #[arg(short = 'p', long, value_name = "JSON")]
    pub params: PathBuf,

    /// Photometry CSV (`id,z,flux_<f>,ivar_<f>,...`).
    #[arg(short = 'i', long, value_name = "CSV")]
    pub photometry: PathBuf,

    /// Override the output directory from the parameter file.
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Replace existing output files.
    #[arg(long)]
    pub overwrite: bool,

    /// Validate inputs and run the fit without writing any output.
    #[arg(long)]
    pub dry_run: bool,

    /// Fit only these galaxy rows (0-based), e.g. `0,5,10-19`.
    #[arg(long, value_name = "LIST")]
    pub subset: Option<String>,

    /// Also write the full galaxy × model chi-square grid (large).
    #[arg(long)]
    pub dump_chi2: bool,

    /// Galaxies listed in the terminal summary.
    #[arg(long, default_value_t = 10)]
    pub top: usize,
}

#[derive(Debug, Parser, Clone)]
pub struct InfoArgs {
    /// Grid directory containing `manifest.json`.
    #[arg(value_name = "DIR")]
    pub grid: PathBuf,
}
