//! Run driver: validation, chunking, accumulation, posterior extraction.
//!
//! Per run:
//!
//! ```text
//! VALIDATE → INITIALIZE_OUTPUT
//!   → for each galaxy chunk:
//!       for each model chunk: read (with retry) → validate → fold into grid
//!       → optional grid sink → BUILD_POSTERIOR
//!   → DONE
//! ```
//!
//! Validation runs to completion before the first chunk is read, so a bad
//! input aborts with nothing computed. Galaxy chunks bound memory only; they
//! do not affect results.

use rayon::prelude::*;

use crate::domain::{FitParams, GalaxyFit, Photometry, PosteriorDraw};
use crate::error::FitError;
use crate::fit::chisq::{ChiSquareEvaluator, ChiSquareGrid, GalaxyContext, prepare_batch};
use crate::fit::posterior::{GalaxyKey, GalaxyPosterior, ModelCatalog, PosteriorBuilder};
use crate::grid::{CancelToken, ModelGridReader, read_chunk_with_retry, validate_chunk};
use crate::math::{check_grid, locate, max_age_at};

/// Results of a run, one entry per input galaxy.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOutput {
    pub results: Vec<GalaxyFit>,
    pub draws: Vec<Vec<PosteriorDraw>>,
}

impl FitOutput {
    /// Sentinel output sized to `photometry`.
    pub fn unfit(photometry: &Photometry, n_draws: usize) -> Self {
        let n_filters = photometry.n_filters();
        Self {
            results: photometry
                .ids
                .iter()
                .zip(&photometry.redshift)
                .map(|(id, &z)| GalaxyFit::unfit(id.clone(), z, n_filters))
                .collect(),
            draws: vec![vec![PosteriorDraw::SENTINEL; n_draws]; photometry.n_galaxies()],
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn n_fit(&self) -> usize {
        self.results.iter().filter(|r| r.is_fit()).count()
    }

    /// Write row `i` of `sub` into row `indices[i]` of `self`.
    pub fn scatter(&mut self, indices: &[usize], sub: FitOutput) -> Result<(), FitError> {
        if indices.len() != sub.len() {
            return Err(FitError::ShapeMismatch(format!(
                "{} indices for {} subset results",
                indices.len(),
                sub.len()
            )));
        }
        for ((&i, fit), draws) in indices.iter().zip(sub.results).zip(sub.draws) {
            if i >= self.results.len() {
                return Err(FitError::ShapeMismatch(format!(
                    "index {i} out of range for {} galaxies",
                    self.results.len()
                )));
            }
            self.results[i] = fit;
            self.draws[i] = draws;
        }
        Ok(())
    }
}

/// Receives each galaxy chunk's full chi-square grid before it is dropped.
pub trait GridSink {
    fn write_block(&mut self, ids: &[String], grid: &ChiSquareGrid, catalog: &ModelCatalog) -> Result<(), FitError>;
}

/// Drives one fit of a photometric sample against one model grid.
pub struct FitOrchestrator<'a, R: ModelGridReader + ?Sized> {
    reader: &'a R,
    params: &'a FitParams,
    cancel: Option<CancelToken>,
}

impl<'a, R: ModelGridReader + ?Sized> FitOrchestrator<'a, R> {
    pub fn new(reader: &'a R, params: &'a FitParams) -> Self {
        Self {
            reader,
            params,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Fit every galaxy.
    pub fn fit(&self, photometry: &Photometry) -> Result<FitOutput, FitError> {
        self.fit_with_sink(photometry, None)
    }

    /// Fit every galaxy, streaming each chunk's chi-square grid to `sink`.
    pub fn fit_with_sink(
        &self,
        photometry: &Photometry,
        mut sink: Option<&mut dyn GridSink>,
    ) -> Result<FitOutput, FitError> {
        let contexts = self.validate(photometry)?;
        let params = self.params;

        let mut output = FitOutput::unfit(photometry, params.n_draws);
        let n_galaxies = photometry.n_galaxies();
        if n_galaxies == 0 {
            return Ok(output);
        }

        let n_models = self.reader.n_models();
        let n_filters = params.n_filters();
        let chunk_size = params.effective_chunk_size(n_models);
        tracing::info!(
            n_galaxies,
            n_models,
            n_model_chunks = self.reader.n_chunks(),
            galaxy_chunk_size = chunk_size,
            "starting fit"
        );

        let evaluator = ChiSquareEvaluator {
            n_filters,
            min_valid_filters: params.min_valid_filters,
            scale_mode: params.scale_mode,
            allow_older_than_universe: params.allow_older_than_universe,
        };
        let builder = PosteriorBuilder {
            n_draws: params.n_draws,
            seed: params.seed,
            n_filters,
        };
        let mut catalog = ModelCatalog::with_capacity(n_models);

        for start in (0..n_galaxies).step_by(chunk_size) {
            let len = chunk_size.min(n_galaxies - start);
            let batch = photometry.range(start, len);
            let prepared = prepare_batch(&batch);
            let batch_contexts = &contexts[start..start + len];

            let mut grid = ChiSquareGrid::new(len, n_models, n_filters);
            let mut offset = 0;
            for (k, &expected) in self.reader.chunk_lens().iter().enumerate() {
                let chunk = read_chunk_with_retry(self.reader, k, params.read_retries, self.cancel.as_ref())?;
                validate_chunk(
                    &chunk,
                    expected,
                    params.redshift_grid.len(),
                    n_filters,
                    params.max_bursts,
                )?;
                evaluator.fold_chunk(&prepared, batch_contexts, &chunk, offset, &mut grid);
                if catalog.len() == offset {
                    catalog.push_chunk(&chunk);
                }
                offset += chunk.models.len();
                tracing::debug!(galaxy_start = start, model_chunk = k, offset, "folded model chunk");
            }

            if let Some(sink) = sink.as_deref_mut() {
                sink.write_block(&batch.ids, &grid, &catalog)?;
            }

            let posteriors: Vec<GalaxyPosterior> = (0..len)
                .into_par_iter()
                .map(|g| {
                    let key = GalaxyKey {
                        id: &batch.ids[g],
                        z: batch.redshift[g],
                        n_valid_filters: prepared[g].n_valid,
                    };
                    builder.build(key, grid.row(g), grid.best(g), &catalog)
                })
                .collect();
            for (g, post) in posteriors.into_iter().enumerate() {
                output.results[start + g] = post.fit;
                output.draws[start + g] = post.draws;
            }
            tracing::debug!(galaxy_start = start, galaxies = len, "galaxy chunk done");
        }

        tracing::info!(n_galaxies, n_fit = output.n_fit(), "fit complete");
        Ok(output)
    }

    /// Fit only the galaxies at `indices`; every other row stays at its
    /// sentinel value. Only the selected rows are validated.
    pub fn fit_subset(
        &self,
        photometry: &Photometry,
        indices: &[usize],
        sink: Option<&mut dyn GridSink>,
    ) -> Result<FitOutput, FitError> {
        let sub = self.gather(photometry, indices)?;
        let fitted = self.fit_with_sink(&sub, sink)?;
        let mut output = FitOutput::unfit(photometry, self.params.n_draws);
        output.scatter(indices, fitted)?;
        Ok(output)
    }

    /// VALIDATE for a subset run: index range plus the selected rows only.
    pub fn validate_subset(&self, photometry: &Photometry, indices: &[usize]) -> Result<(), FitError> {
        let sub = self.gather(photometry, indices)?;
        self.validate(&sub).map(|_| ())
    }

    fn gather(&self, photometry: &Photometry, indices: &[usize]) -> Result<Photometry, FitError> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= photometry.n_galaxies()) {
            return Err(FitError::ShapeMismatch(format!(
                "subset index {bad} out of range for {} galaxies",
                photometry.n_galaxies()
            )));
        }
        check_shapes(photometry, self.params.n_filters())?;
        Ok(photometry.select(indices))
    }

    /// VALIDATE: check parameters, grid geometry and photometry; return the
    /// per-galaxy grid positions and age limits.
    pub fn validate(&self, photometry: &Photometry) -> Result<Vec<GalaxyContext>, FitError> {
        let params = self.params;
        params.validate()?;
        check_grid(&params.redshift_grid)?;

        if self.reader.redshift_grid() != params.redshift_grid.as_slice() {
            return Err(FitError::GridBounds(format!(
                "model grid redshift nodes {:?} differ from the configured redshift grid {:?}",
                self.reader.redshift_grid(),
                params.redshift_grid
            )));
        }
        if self.reader.filters() != params.filters.as_slice() {
            return Err(FitError::ShapeMismatch(format!(
                "model grid filters {:?} differ from configured filters {:?}",
                self.reader.filters(),
                params.filters
            )));
        }

        check_shapes(photometry, params.n_filters())?;
        check_values(photometry)?;

        photometry
            .redshift
            .iter()
            .map(|&z| {
                let position = locate(&params.redshift_grid, z)?;
                let max_age = max_age_at(&params.cosmology, z, params.max_formation_redshift);
                Ok(GalaxyContext { position, max_age })
            })
            .collect()
    }
}

fn check_shapes(photometry: &Photometry, n_filters: usize) -> Result<(), FitError> {
    if photometry.flux.shape() != photometry.ivar.shape() {
        return Err(FitError::ShapeMismatch(format!(
            "flux is {:?} but inverse variance is {:?}",
            photometry.flux.shape(),
            photometry.ivar.shape()
        )));
    }
    if photometry.n_filters() != n_filters {
        return Err(FitError::ShapeMismatch(format!(
            "photometry has {} filters, grid has {n_filters}",
            photometry.n_filters()
        )));
    }
    let n = photometry.n_galaxies();
    if photometry.ids.len() != n || photometry.redshift.len() != n {
        return Err(FitError::ShapeMismatch(format!(
            "{} galaxies of photometry but {} ids and {} redshifts",
            n,
            photometry.ids.len(),
            photometry.redshift.len()
        )));
    }
    Ok(())
}

fn check_values(photometry: &Photometry) -> Result<(), FitError> {
    for g in 0..photometry.n_galaxies() {
        let id = &photometry.ids[g];
        if photometry.flux.column(g).iter().any(|v| !v.is_finite()) {
            return Err(FitError::InvalidValue(format!("galaxy {id}: non-finite flux")));
        }
        if photometry.ivar.column(g).iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(FitError::InvalidValue(format!(
                "galaxy {id}: inverse variance must be finite and >= 0"
            )));
        }
        let z = photometry.redshift[g];
        if !(z.is_finite() && z > 0.0) {
            return Err(FitError::InvalidValue(format!("galaxy {id}: redshift {z} must be > 0")));
        }
    }
    Ok(())
}

/// Fit the same sample against several model grids, one full pipeline each.
pub fn fit_configurations<'g>(
    photometry: &Photometry,
    params: &FitParams,
    grids: impl IntoIterator<Item = (&'g str, &'g dyn ModelGridReader)>,
) -> Result<Vec<(String, FitOutput)>, FitError> {
    grids
        .into_iter()
        .map(|(name, reader)| {
            tracing::info!(grid = name, "fitting grid configuration");
            let output = FitOrchestrator::new(reader, params).fit(photometry)?;
            Ok((name.to_string(), output))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ModelId, ModelRecord, SfhParams};
    use crate::grid::InMemoryGrid;
    use nalgebra::DMatrix;

    fn params_for(age: f64) -> SfhParams {
        SfhParams {
            tau: 1.0,
            metallicity: 0.02,
            age,
            delayed: false,
            bursts: vec![],
            av: 0.1,
            mu: 0.3,
            mstar: 1.0,
            sfr: 0.5,
            sfr100: 0.5,
            b100: 0.5,
            ewoii: 0.0,
            ewhb: 0.0,
            ewha: 0.0,
        }
    }

    fn setup() -> (InMemoryGrid, FitParams) {
        let filters: Vec<String> = ["g", "r", "i"].iter().map(|s| s.to_string()).collect();
        let zgrid = vec![0.1, 0.2];
        let models = vec![
            ModelRecord {
                id: ModelId { chunk: 0, index: 0 },
                params: params_for(1.0),
                flux: vec![1.0, 2.0, 3.0, 0.5, 1.0, 1.5],
            },
            ModelRecord {
                id: ModelId { chunk: 0, index: 0 },
                params: params_for(2.0),
                flux: vec![3.0, 2.0, 1.0, 1.5, 1.0, 0.5],
            },
        ];
        let grid = InMemoryGrid::chunked(filters.clone(), zgrid.clone(), models, 1);
        let mut params = FitParams::new(filters, zgrid);
        params.n_draws = 5;
        (grid, params)
    }

    fn photometry(n: usize) -> Photometry {
        Photometry {
            ids: (0..n).map(|i| format!("gal{i}")).collect(),
            redshift: vec![0.1; n],
            flux: DMatrix::from_fn(3, n, |f, _| [1e9, 2e9, 3e9][f]),
            ivar: DMatrix::from_element(3, n, 1e-18),
        }
    }

    #[test]
    fn validate_rejects_mismatched_shapes() {
        let (grid, params) = setup();
        let mut phot = photometry(2);
        phot.ivar = DMatrix::from_element(3, 3, 1.0);
        let err = FitOrchestrator::new(&grid, &params).fit(&phot).unwrap_err();
        assert!(matches!(err, FitError::ShapeMismatch(_)));
    }

    #[test]
    fn validate_rejects_bad_values_and_redshifts() {
        let (grid, params) = setup();
        let mut phot = photometry(1);
        phot.flux[(0, 0)] = f64::NAN;
        assert!(matches!(
            FitOrchestrator::new(&grid, &params).fit(&phot),
            Err(FitError::InvalidValue(_))
        ));

        let mut phot = photometry(1);
        phot.redshift[0] = 0.5;
        assert!(matches!(
            FitOrchestrator::new(&grid, &params).fit(&phot),
            Err(FitError::GridBounds(_))
        ));
    }

    #[test]
    fn grid_mismatch_names_the_differing_nodes() {
        let (grid, mut params) = setup();
        params.redshift_grid = vec![0.1, 0.3];
        let err = FitOrchestrator::new(&grid, &params).validate(&photometry(1)).unwrap_err();
        assert!(matches!(err, FitError::GridBounds(_)));
        let msg = err.to_string();
        assert!(msg.contains("[0.1, 0.2]") && msg.contains("[0.1, 0.3]"), "{msg}");
        assert!(!msg.contains("coverage"));
    }

    #[test]
    fn subset_validation_only_checks_selected_rows() {
        let (grid, params) = setup();
        let mut phot = photometry(3);
        phot.redshift[0] = 0.9;
        let orch = FitOrchestrator::new(&grid, &params);
        assert!(orch.validate_subset(&phot, &[1, 2]).is_ok());
        assert!(matches!(orch.validate_subset(&phot, &[0]), Err(FitError::GridBounds(_))));
        assert!(matches!(orch.validate_subset(&phot, &[3]), Err(FitError::ShapeMismatch(_))));
    }

    #[test]
    fn picks_the_matching_model() {
        let (grid, params) = setup();
        let out = FitOrchestrator::new(&grid, &params).fit(&photometry(3)).unwrap();
        assert_eq!(out.n_fit(), 3);
        for r in &out.results {
            assert_eq!(r.model_index, Some(0));
            assert!((r.scale / 1e9 - 1.0).abs() < 1e-9);
            assert!((r.best_flux[2] - 3e9).abs() < 1.0);
        }
    }

    #[test]
    fn subset_leaves_other_rows_unfit() {
        let (grid, params) = setup();
        let out = FitOrchestrator::new(&grid, &params)
            .fit_subset(&photometry(4), &[3, 1], None)
            .unwrap();
        assert!(out.results[1].is_fit() && out.results[3].is_fit());
        assert!(!out.results[0].is_fit() && !out.results[2].is_fit());
        assert_eq!(out.results[3].id, "gal3");
    }

    #[test]
    fn subset_rejects_out_of_range_indices() {
        let (grid, params) = setup();
        let err = FitOrchestrator::new(&grid, &params)
            .fit_subset(&photometry(2), &[2], None)
            .unwrap_err();
        assert!(matches!(err, FitError::ShapeMismatch(_)));
    }
}
