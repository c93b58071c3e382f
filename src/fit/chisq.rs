//! Scale factors and chi-square for every (galaxy, model) pair.
//!
//! For one galaxy with observed fluxes `o_f`, inverse variances `w_f` and a
//! model interpolated to the galaxy redshift `m_f`, the model enters linearly
//! through a single scale `s` (the stellar mass normalisation), so the
//! weighted least-squares optimum has a closed form:
//!
//! ```text
//! s      = Σ m·o·w / Σ m²·w
//! χ²     = Σ w·(o − s·m)²
//! σ(s)   = 1 / sqrt(Σ m²·w)
//! ```
//!
//! Filters with `w = 0` carry zero weight; their observed flux is masked to
//! zero up front so no per-filter branching is needed in the inner loop.
//!
//! Pairs that cannot be fit get `χ² = CHI2_SENTINEL`:
//! - the galaxy has fewer usable filters than `min_valid_filters`
//! - the model is older than the universe allows at the galaxy redshift
//! - the model has no flux in any usable filter

use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::domain::{CHI2_SENTINEL, DERIVED_SENTINEL, ModelChunk, ModelId, Photometry, ScaleMode};
use crate::math::GridPosition;

/// Per-galaxy constraints computed once by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GalaxyContext {
    pub position: GridPosition,
    /// Oldest allowed model age (Gyr).
    pub max_age: f64,
}

/// Observed photometry of one galaxy with the filter mask applied.
#[derive(Debug, Clone)]
pub struct PreparedGalaxy {
    /// Observed flux, zero where the filter is unusable.
    pub obs: Vec<f64>,
    /// Inverse variance, zero where the filter is unusable.
    pub weight: Vec<f64>,
    pub n_valid: usize,
}

impl PreparedGalaxy {
    pub fn from_columns<'a>(
        flux: impl Iterator<Item = &'a f64>,
        ivar: impl Iterator<Item = &'a f64>,
    ) -> Self {
        let mut obs = Vec::new();
        let mut weight = Vec::new();
        for (&o, &w) in flux.zip(ivar) {
            let usable = w > 0.0 && w.is_finite() && o.is_finite();
            obs.push(if usable { o } else { 0.0 });
            weight.push(if usable { w } else { 0.0 });
        }
        let n_valid = weight.iter().filter(|w| **w > 0.0).count();
        Self { obs, weight, n_valid }
    }
}

/// Mask every galaxy of a batch.
pub fn prepare_batch(batch: &Photometry) -> Vec<PreparedGalaxy> {
    (0..batch.n_galaxies())
        .map(|g| PreparedGalaxy::from_columns(batch.flux.column(g).iter(), batch.ivar.column(g).iter()))
        .collect()
}

/// One (galaxy, model) entry of the grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChiSquareRecord {
    pub model: ModelId,
    pub model_index: usize,
    pub scale: f64,
    pub scale_err: f64,
    pub chi2: f64,
}

impl ChiSquareRecord {
    pub fn is_fit(&self) -> bool {
        self.chi2 < CHI2_SENTINEL
    }
}

/// Lowest chi-square seen so far for a galaxy, with the model's fluxes.
#[derive(Debug, Clone)]
pub struct RunningBest {
    pub chi2: f64,
    pub model_index: Option<usize>,
    /// Interpolated model fluxes times the fitted scale.
    pub flux: Vec<f64>,
}

/// Borrowed view of one galaxy's row across all models.
#[derive(Debug, Clone, Copy)]
pub struct GridRow<'a> {
    pub scale: &'a [f64],
    pub scale_err: &'a [f64],
    pub chi2: &'a [f64],
}

/// Accumulated chi-square grid for a galaxy chunk across all model chunks.
///
/// Stored as `n_models × n_galaxies` column-major matrices so each galaxy's
/// row over models is one contiguous column. Sized once up front; model
/// chunks are written at their running offset.
#[derive(Debug, Clone)]
pub struct ChiSquareGrid {
    scale: DMatrix<f64>,
    scale_err: DMatrix<f64>,
    chi2: DMatrix<f64>,
    best: Vec<RunningBest>,
}

impl ChiSquareGrid {
    pub fn new(n_galaxies: usize, n_models: usize, n_filters: usize) -> Self {
        Self {
            scale: DMatrix::from_element(n_models, n_galaxies, DERIVED_SENTINEL),
            scale_err: DMatrix::from_element(n_models, n_galaxies, DERIVED_SENTINEL),
            chi2: DMatrix::from_element(n_models, n_galaxies, CHI2_SENTINEL),
            best: vec![
                RunningBest {
                    chi2: CHI2_SENTINEL,
                    model_index: None,
                    flux: vec![DERIVED_SENTINEL; n_filters],
                };
                n_galaxies
            ],
        }
    }

    pub fn n_galaxies(&self) -> usize {
        self.chi2.ncols()
    }

    pub fn n_models(&self) -> usize {
        self.chi2.nrows()
    }

    pub fn row(&self, galaxy: usize) -> GridRow<'_> {
        let n = self.n_models();
        let range = galaxy * n..(galaxy + 1) * n;
        GridRow {
            scale: &self.scale.as_slice()[range.clone()],
            scale_err: &self.scale_err.as_slice()[range.clone()],
            chi2: &self.chi2.as_slice()[range],
        }
    }

    pub fn best(&self, galaxy: usize) -> &RunningBest {
        &self.best[galaxy]
    }

    pub fn chi2(&self) -> &DMatrix<f64> {
        &self.chi2
    }
}

/// Evaluates galaxy batches against model chunks.
#[derive(Debug, Clone)]
pub struct ChiSquareEvaluator {
    pub n_filters: usize,
    pub min_valid_filters: usize,
    pub scale_mode: ScaleMode,
    pub allow_older_than_universe: bool,
}

impl ChiSquareEvaluator {
    /// Evaluate every (galaxy, model) pair of `chunk` and write the results
    /// into `grid` at model offset `offset`.
    ///
    /// Galaxies are processed in parallel; each writes only its own column.
    pub fn fold_chunk(
        &self,
        galaxies: &[PreparedGalaxy],
        contexts: &[GalaxyContext],
        chunk: &ModelChunk,
        offset: usize,
        grid: &mut ChiSquareGrid,
    ) {
        let n_models = grid.n_models();
        let len = chunk.models.len();
        if len == 0 || n_models == 0 {
            return;
        }
        debug_assert!(offset + len <= n_models);
        debug_assert_eq!(galaxies.len(), grid.n_galaxies());

        let ChiSquareGrid {
            scale,
            scale_err,
            chi2,
            best,
        } = grid;

        chi2.as_mut_slice()
            .par_chunks_mut(n_models)
            .zip(scale.as_mut_slice().par_chunks_mut(n_models))
            .zip(scale_err.as_mut_slice().par_chunks_mut(n_models))
            .zip(best.par_iter_mut())
            .enumerate()
            .for_each(|(g, (((chi2_col, scale_col), err_col), best))| {
                let chi2_out = &mut chi2_col[offset..offset + len];
                let scale_out = &mut scale_col[offset..offset + len];
                let err_out = &mut err_col[offset..offset + len];
                self.evaluate_galaxy(&galaxies[g], &contexts[g], chunk, chi2_out, scale_out, err_out);
                self.update_best(&contexts[g], chunk, offset, chi2_out, scale_out, best);
            });
    }

    fn evaluate_galaxy(
        &self,
        galaxy: &PreparedGalaxy,
        ctx: &GalaxyContext,
        chunk: &ModelChunk,
        chi2_out: &mut [f64],
        scale_out: &mut [f64],
        err_out: &mut [f64],
    ) {
        if galaxy.n_valid < self.min_valid_filters {
            chi2_out.fill(CHI2_SENTINEL);
            scale_out.fill(DERIVED_SENTINEL);
            err_out.fill(DERIVED_SENTINEL);
            return;
        }

        let mut m = vec![0.0; self.n_filters];
        for (j, model) in chunk.models.iter().enumerate() {
            if model.params.age > ctx.max_age && !self.allow_older_than_universe {
                chi2_out[j] = CHI2_SENTINEL;
                scale_out[j] = DERIVED_SENTINEL;
                err_out[j] = DERIVED_SENTINEL;
                continue;
            }
            model.interpolate_into(self.n_filters, ctx.position.lower, ctx.position.frac, &mut m);
            match self.solve(galaxy, &m) {
                Some((s, ds, c)) => {
                    chi2_out[j] = c;
                    scale_out[j] = s;
                    err_out[j] = ds;
                }
                None => {
                    chi2_out[j] = CHI2_SENTINEL;
                    scale_out[j] = DERIVED_SENTINEL;
                    err_out[j] = DERIVED_SENTINEL;
                }
            }
        }
    }

    /// Closed-form scale, scale error and chi-square for one pair.
    pub fn solve(&self, galaxy: &PreparedGalaxy, m: &[f64]) -> Option<(f64, f64, f64)> {
        let mut smm = 0.0;
        let mut smo = 0.0;
        for ((&mf, &of), &wf) in m.iter().zip(&galaxy.obs).zip(&galaxy.weight) {
            smm += mf * mf * wf;
            smo += mf * of * wf;
        }
        if !(smm > 0.0 && smm.is_finite()) {
            return None;
        }

        let mut scale = smo / smm;
        if self.scale_mode == ScaleMode::NonNegative && scale < 0.0 {
            scale = 0.0;
        }

        let mut chi2 = 0.0;
        for ((&mf, &of), &wf) in m.iter().zip(&galaxy.obs).zip(&galaxy.weight) {
            let r = of - scale * mf;
            chi2 += wf * r * r;
        }
        if !chi2.is_finite() || chi2 >= CHI2_SENTINEL {
            return None;
        }
        Some((scale, 1.0 / smm.sqrt(), chi2))
    }

    fn update_best(
        &self,
        ctx: &GalaxyContext,
        chunk: &ModelChunk,
        offset: usize,
        chi2: &[f64],
        scale: &[f64],
        best: &mut RunningBest,
    ) {
        let mut local: Option<usize> = None;
        for (j, &c) in chi2.iter().enumerate() {
            if c < CHI2_SENTINEL && local.is_none_or(|k| c < chi2[k]) {
                local = Some(j);
            }
        }
        let Some(j) = local else {
            return;
        };
        // Strict comparison: on ties the earlier chunk keeps the lead.
        if chi2[j] < best.chi2 {
            chunk.models[j].interpolate_into(self.n_filters, ctx.position.lower, ctx.position.frac, &mut best.flux);
            for f in best.flux.iter_mut() {
                *f *= scale[j];
            }
            best.chi2 = chi2[j];
            best.model_index = Some(offset + j);
        }
    }
}

/// Records of one galaxy row, joined with model ids.
pub fn row_records<'a>(
    row: GridRow<'a>,
    ids: &'a [ModelId],
) -> impl Iterator<Item = ChiSquareRecord> + 'a {
    ids.iter().enumerate().map(move |(i, &model)| ChiSquareRecord {
        model,
        model_index: i,
        scale: row.scale[i],
        scale_err: row.scale_err[i],
        chi2: row.chi2[i],
    })
}
