//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory during fitting
//! - loaded from parameter files and model-grid chunks (JSON)
//! - exported to CSV/JSON at the end of a run

use std::path::PathBuf;

use clap::ValueEnum;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::FitError;

/// Chi-square assigned to (galaxy, model) pairs that could not be fit.
///
/// Any chi-square at or above this value is treated as "no fit".
pub const CHI2_SENTINEL: f64 = 1e6;

/// Value written to derived quantities of galaxies without a valid fit.
pub const DERIVED_SENTINEL: f64 = -1.0;

/// Hard cap on bursts per model; `FitParams::max_bursts` may only lower it.
pub const MAX_BURSTS: usize = 10;

/// How the per-pair flux scale is constrained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ScaleMode {
    /// Clamp negative optima to zero (a model cannot contribute negative mass).
    #[default]
    NonNegative,
    /// Keep the signed least-squares optimum.
    Unconstrained,
}

/// FRW cosmology used for the age-of-universe cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cosmology {
    /// Hubble constant in km/s/Mpc.
    pub h0: f64,
    pub omega_m: f64,
    pub omega_lambda: f64,
}

impl Default for Cosmology {
    fn default() -> Self {
        Self {
            h0: 70.0,
            omega_m: 0.3,
            omega_lambda: 0.7,
        }
    }
}

/// Identifies a model by storage chunk and position within the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelId {
    pub chunk: usize,
    pub index: usize,
}

/// A single star-formation burst superposed on the smooth history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Burst {
    /// Burst onset (Gyr after formation).
    pub tburst: f64,
    /// Burst duration (Gyr).
    pub dtburst: f64,
    /// Mass fraction formed in the burst.
    pub fburst: f64,
}

/// Physical parameters of one grid model.
///
/// Mass-like quantities (`mstar`, `sfr`, `sfr100`) are per unit flux scale:
/// the fitted scale multiplies them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SfhParams {
    /// e-folding time of the smooth component (Gyr).
    pub tau: f64,
    /// Stellar metallicity Z.
    pub metallicity: f64,
    /// Time since formation (Gyr).
    pub age: f64,
    /// `true` for a delayed-tau history, `false` for a simple exponential.
    #[serde(default)]
    pub delayed: bool,
    #[serde(default)]
    pub bursts: Vec<Burst>,
    /// V-band attenuation (mag).
    #[serde(default)]
    pub av: f64,
    /// Fraction of the attenuation arising in the diffuse ISM.
    #[serde(default)]
    pub mu: f64,
    pub mstar: f64,
    #[serde(default)]
    pub sfr: f64,
    #[serde(default)]
    pub sfr100: f64,
    /// Birthrate parameter averaged over the last 100 Myr.
    #[serde(default)]
    pub b100: f64,
    #[serde(default)]
    pub ewoii: f64,
    #[serde(default)]
    pub ewhb: f64,
    #[serde(default)]
    pub ewha: f64,
}

/// One precomputed model: fluxes on the redshift grid plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Assigned by the grid reader; not stored in chunk files.
    #[serde(skip, default = "unassigned_id")]
    pub id: ModelId,
    pub params: SfhParams,
    /// Fluxes (maggies, unit scale), row-major `n_redshift × n_filters`.
    pub flux: Vec<f64>,
}

fn unassigned_id() -> ModelId {
    ModelId { chunk: 0, index: 0 }
}

impl ModelRecord {
    /// Flux row at redshift-grid node `zi`.
    pub fn flux_row(&self, n_filters: usize, zi: usize) -> &[f64] {
        &self.flux[zi * n_filters..(zi + 1) * n_filters]
    }

    /// Linearly interpolate the flux table to fractional grid position
    /// `lower + frac`, writing `n_filters` values into `out`.
    pub fn interpolate_into(&self, n_filters: usize, lower: usize, frac: f64, out: &mut [f64]) {
        let a = self.flux_row(n_filters, lower);
        if frac == 0.0 {
            out.copy_from_slice(a);
            return;
        }
        let b = self.flux_row(n_filters, lower + 1);
        for ((o, &fa), &fb) in out.iter_mut().zip(a).zip(b) {
            *o = (1.0 - frac) * fa + frac * fb;
        }
    }
}

/// A storage chunk of models. Dropped once folded into the accumulator.
#[derive(Debug, Clone)]
pub struct ModelChunk {
    pub index: usize,
    pub models: Vec<ModelRecord>,
}

/// Posterior quantities summarised for every galaxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    Mass,
    Sfr,
    Sfr100,
    B100,
    Age,
    Tau,
    Metallicity,
    Av,
    Mu,
    EwOii,
    EwHb,
    EwHa,
}

impl Quantity {
    pub const ALL: [Quantity; 12] = [
        Quantity::Mass,
        Quantity::Sfr,
        Quantity::Sfr100,
        Quantity::B100,
        Quantity::Age,
        Quantity::Tau,
        Quantity::Metallicity,
        Quantity::Av,
        Quantity::Mu,
        Quantity::EwOii,
        Quantity::EwHb,
        Quantity::EwHa,
    ];

    /// Column stem used in exports.
    pub fn label(self) -> &'static str {
        match self {
            Quantity::Mass => "mass",
            Quantity::Sfr => "sfr",
            Quantity::Sfr100 => "sfr100",
            Quantity::B100 => "b100",
            Quantity::Age => "age",
            Quantity::Tau => "tau",
            Quantity::Metallicity => "zmetal",
            Quantity::Av => "av",
            Quantity::Mu => "mu",
            Quantity::EwOii => "ewoii",
            Quantity::EwHb => "ewhb",
            Quantity::EwHa => "ewha",
        }
    }

    /// Value of this quantity for a model fit with the given scale.
    ///
    /// Mass-like quantities are reported as `log10(scale * value)` and are NaN
    /// when that product is not positive.
    pub fn value(self, params: &SfhParams, scale: f64) -> f64 {
        match self {
            Quantity::Mass => log_scaled(scale, params.mstar),
            Quantity::Sfr => log_scaled(scale, params.sfr),
            Quantity::Sfr100 => log_scaled(scale, params.sfr100),
            Quantity::B100 => params.b100,
            Quantity::Age => params.age,
            Quantity::Tau => params.tau,
            Quantity::Metallicity => params.metallicity,
            Quantity::Av => params.av,
            Quantity::Mu => params.mu,
            Quantity::EwOii => params.ewoii,
            Quantity::EwHb => params.ewhb,
            Quantity::EwHa => params.ewha,
        }
    }
}

fn log_scaled(scale: f64, value: f64) -> f64 {
    let v = scale * value;
    if v > 0.0 && v.is_finite() {
        v.log10()
    } else {
        f64::NAN
    }
}

/// Marginal posterior summary of one quantity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantityStat {
    /// Likelihood-weighted mean.
    pub avg: f64,
    /// Weighted median.
    pub p50: f64,
    /// Half the 16th–84th percentile width.
    pub err: f64,
    pub p16: f64,
    pub p84: f64,
}

impl QuantityStat {
    pub const SENTINEL: QuantityStat = QuantityStat {
        avg: DERIVED_SENTINEL,
        p50: DERIVED_SENTINEL,
        err: DERIVED_SENTINEL,
        p16: DERIVED_SENTINEL,
        p84: DERIVED_SENTINEL,
    };
}

/// Per-galaxy fit result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalaxyFit {
    pub id: String,
    pub z: f64,
    /// Best-fit model, `None` when no model could be fit.
    pub model: Option<ModelId>,
    /// Position of the best-fit model in the concatenated grid.
    pub model_index: Option<usize>,
    pub scale: f64,
    pub scale_err: f64,
    pub chi2: f64,
    pub n_valid_filters: usize,
    /// Parameters of the best-fit model.
    pub best: Option<SfhParams>,
    /// Best-fit model fluxes at the galaxy redshift, times `scale`.
    pub best_flux: Vec<f64>,
    /// One entry per `Quantity::ALL`, same order.
    pub posterior: Vec<QuantityStat>,
}

impl GalaxyFit {
    /// Sentinel record for a galaxy that has not been, or could not be, fit.
    pub fn unfit(id: impl Into<String>, z: f64, n_filters: usize) -> Self {
        Self {
            id: id.into(),
            z,
            model: None,
            model_index: None,
            scale: DERIVED_SENTINEL,
            scale_err: DERIVED_SENTINEL,
            chi2: CHI2_SENTINEL,
            n_valid_filters: 0,
            best: None,
            best_flux: vec![DERIVED_SENTINEL; n_filters],
            posterior: vec![QuantityStat::SENTINEL; Quantity::ALL.len()],
        }
    }

    pub fn is_fit(&self) -> bool {
        self.model.is_some()
    }

    pub fn stat(&self, quantity: Quantity) -> &QuantityStat {
        let idx = Quantity::ALL
            .iter()
            .position(|q| *q == quantity)
            .unwrap_or_default();
        &self.posterior[idx]
    }
}

/// One weighted random draw from a galaxy's model ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PosteriorDraw {
    pub model: Option<ModelId>,
    pub model_index: Option<usize>,
    pub chi2: f64,
    pub scale: f64,
    pub scale_err: f64,
}

impl PosteriorDraw {
    pub const SENTINEL: PosteriorDraw = PosteriorDraw {
        model: None,
        model_index: None,
        chi2: CHI2_SENTINEL,
        scale: DERIVED_SENTINEL,
        scale_err: DERIVED_SENTINEL,
    };
}

/// Observed photometry for a batch of galaxies.
///
/// `flux` and `ivar` are `n_filters × n_galaxies` (one column per galaxy).
#[derive(Debug, Clone, PartialEq)]
pub struct Photometry {
    pub ids: Vec<String>,
    pub redshift: Vec<f64>,
    pub flux: DMatrix<f64>,
    pub ivar: DMatrix<f64>,
}

impl Photometry {
    pub fn n_galaxies(&self) -> usize {
        self.flux.ncols()
    }

    pub fn n_filters(&self) -> usize {
        self.flux.nrows()
    }

    /// Gather the galaxies at `indices` (in the given order) into a new batch.
    pub fn select(&self, indices: &[usize]) -> Photometry {
        Photometry {
            ids: indices.iter().map(|&i| self.ids[i].clone()).collect(),
            redshift: indices.iter().map(|&i| self.redshift[i]).collect(),
            flux: self.flux.select_columns(indices),
            ivar: self.ivar.select_columns(indices),
        }
    }

    /// Contiguous galaxy range `start..start + len`.
    pub fn range(&self, start: usize, len: usize) -> Photometry {
        Photometry {
            ids: self.ids[start..start + len].to_vec(),
            redshift: self.redshift[start..start + len].to_vec(),
            flux: self.flux.columns(start, len).into_owned(),
            ivar: self.ivar.columns(start, len).into_owned(),
        }
    }
}

/// A named model grid to fit against (one pipeline run per entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub name: String,
    pub path: PathBuf,
}

/// Parameters of a fitting run, as read from the JSON parameter file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitParams {
    pub filters: Vec<String>,
    /// Redshift nodes of the model flux tables (strictly increasing).
    pub redshift_grid: Vec<f64>,
    #[serde(default)]
    pub cosmology: Cosmology,
    /// Earliest redshift at which stars may have formed.
    #[serde(default = "default_max_formation_redshift")]
    pub max_formation_redshift: f64,
    #[serde(default = "default_galaxy_chunk_size")]
    pub galaxy_chunk_size: usize,
    /// Optional cap on the accumulated chi-square grid size (MiB).
    #[serde(default)]
    pub memory_budget_mb: Option<usize>,
    #[serde(default = "default_min_valid_filters")]
    pub min_valid_filters: usize,
    #[serde(default = "default_n_draws")]
    pub n_draws: usize,
    #[serde(default = "default_max_bursts")]
    pub max_bursts: usize,
    #[serde(default)]
    pub allow_older_than_universe: bool,
    #[serde(default)]
    pub scale_mode: ScaleMode,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Extra attempts for a failed chunk read.
    #[serde(default = "default_read_retries")]
    pub read_retries: usize,
    #[serde(default)]
    pub grids: Vec<GridSpec>,
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_max_formation_redshift() -> f64 {
    20.0
}
fn default_galaxy_chunk_size() -> usize {
    500
}
fn default_min_valid_filters() -> usize {
    3
}
fn default_n_draws() -> usize {
    2000
}
fn default_max_bursts() -> usize {
    5
}
fn default_seed() -> u64 {
    42
}
fn default_read_retries() -> usize {
    2
}
fn default_output_prefix() -> String {
    "spsfit".to_string()
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

impl FitParams {
    /// Parameters with every optional field at its default.
    pub fn new(filters: Vec<String>, redshift_grid: Vec<f64>) -> Self {
        Self {
            filters,
            redshift_grid,
            cosmology: Cosmology::default(),
            max_formation_redshift: default_max_formation_redshift(),
            galaxy_chunk_size: default_galaxy_chunk_size(),
            memory_budget_mb: None,
            min_valid_filters: default_min_valid_filters(),
            n_draws: default_n_draws(),
            max_bursts: default_max_bursts(),
            allow_older_than_universe: false,
            scale_mode: ScaleMode::default(),
            seed: default_seed(),
            read_retries: default_read_retries(),
            grids: Vec::new(),
            output_prefix: default_output_prefix(),
            output_dir: default_output_dir(),
        }
    }

    pub fn n_filters(&self) -> usize {
        self.filters.len()
    }

    /// Check the scalar settings. Redshift-grid shape is checked by the
    /// orchestrator together with the galaxy redshifts.
    pub fn validate(&self) -> Result<(), FitError> {
        if self.filters.is_empty() {
            return Err(FitError::Config("filter list is empty".into()));
        }
        if self.galaxy_chunk_size == 0 {
            return Err(FitError::Config("galaxy_chunk_size must be > 0".into()));
        }
        if self.n_draws == 0 {
            return Err(FitError::Config("n_draws must be > 0".into()));
        }
        if self.min_valid_filters == 0 || self.min_valid_filters > self.filters.len() {
            return Err(FitError::Config(format!(
                "min_valid_filters must be in 1..={} (got {})",
                self.filters.len(),
                self.min_valid_filters
            )));
        }
        if self.max_bursts > MAX_BURSTS {
            return Err(FitError::Config(format!(
                "max_bursts={} exceeds the supported maximum of {MAX_BURSTS}",
                self.max_bursts
            )));
        }
        let c = &self.cosmology;
        if !(c.h0.is_finite() && c.h0 > 0.0) {
            return Err(FitError::Config(format!("invalid H0={}", c.h0)));
        }
        if !(c.omega_m.is_finite() && c.omega_m > 0.0 && c.omega_lambda.is_finite() && c.omega_lambda >= 0.0)
        {
            return Err(FitError::Config(format!(
                "invalid density parameters: omega_m={}, omega_lambda={}",
                c.omega_m, c.omega_lambda
            )));
        }
        crate::math::check_cosmology(c)?;
        if !(self.max_formation_redshift.is_finite() && self.max_formation_redshift > 0.0) {
            return Err(FitError::Config(format!(
                "invalid max_formation_redshift={}",
                self.max_formation_redshift
            )));
        }
        Ok(())
    }

    /// Galaxy chunk size after applying the optional memory budget.
    ///
    /// The accumulator holds three `f64` values per (galaxy, model) pair.
    pub fn effective_chunk_size(&self, n_models: usize) -> usize {
        let Some(budget_mb) = self.memory_budget_mb else {
            return self.galaxy_chunk_size;
        };
        let per_galaxy = n_models.max(1) * 3 * std::mem::size_of::<f64>();
        let fit = (budget_mb * 1024 * 1024) / per_galaxy;
        self.galaxy_chunk_size.min(fit.max(1))
    }
}
