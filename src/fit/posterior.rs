//! Posterior construction from a galaxy's chi-square row.
//!
//! The likelihood of model `i` relative to the best model is
//! `w_i = exp(−(χ²_i − χ²_min)/2)`; subtracting the minimum keeps the best
//! model at weight 1 so nothing underflows to an all-zero distribution.
//!
//! From these weights we produce:
//! - the best-fit record (minimum χ², ties to the lowest model index)
//! - weighted mean / percentiles of every `Quantity`
//! - `n_draws` weighted draws with replacement
//!
//! Draws use a per-galaxy RNG seeded from the run seed and the galaxy id, so
//! a galaxy gets the same draws however the sample is chunked or subset.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, WeightedAliasIndex};

use crate::domain::{
    CHI2_SENTINEL, DERIVED_SENTINEL, GalaxyFit, ModelChunk, ModelId, PosteriorDraw, Quantity, QuantityStat,
    SfhParams,
};
use crate::fit::chisq::{GridRow, RunningBest};
use crate::math::weighted_summary;

/// Ids and parameters of every model in grid order.
///
/// Flux tables are not kept: only what the posterior needs once a chunk has
/// been folded into the chi-square grid.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    ids: Vec<ModelId>,
    params: Vec<SfhParams>,
}

impl ModelCatalog {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            ids: Vec::with_capacity(n),
            params: Vec::with_capacity(n),
        }
    }

    pub fn push_chunk(&mut self, chunk: &ModelChunk) {
        for m in &chunk.models {
            self.ids.push(m.id);
            self.params.push(m.params.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[ModelId] {
        &self.ids
    }

    pub fn params(&self, index: usize) -> &SfhParams {
        &self.params[index]
    }
}

/// Best-fit record plus posterior draws for one galaxy.
#[derive(Debug, Clone, PartialEq)]
pub struct GalaxyPosterior {
    pub fit: GalaxyFit,
    pub draws: Vec<PosteriorDraw>,
}

/// Galaxy being summarised.
#[derive(Debug, Clone, Copy)]
pub struct GalaxyKey<'a> {
    pub id: &'a str,
    pub z: f64,
    pub n_valid_filters: usize,
}

#[derive(Debug, Clone)]
pub struct PosteriorBuilder {
    pub n_draws: usize,
    pub seed: u64,
    pub n_filters: usize,
}

impl PosteriorBuilder {
    pub fn build(
        &self,
        galaxy: GalaxyKey<'_>,
        row: GridRow<'_>,
        running_best: &RunningBest,
        catalog: &ModelCatalog,
    ) -> GalaxyPosterior {
        let valid: Vec<usize> = (0..row.chi2.len()).filter(|&i| row.chi2[i] < CHI2_SENTINEL).collect();

        let Some(&best) = valid
            .iter()
            .min_by(|&&a, &&b| row.chi2[a].total_cmp(&row.chi2[b]).then(a.cmp(&b)))
        else {
            return self.unfit(galaxy);
        };

        let chi2_min = row.chi2[best];
        let weights: Vec<f64> = valid
            .iter()
            .map(|&i| (-0.5 * (row.chi2[i] - chi2_min)).exp())
            .collect();

        let posterior = Quantity::ALL
            .iter()
            .map(|&q| {
                let values: Vec<f64> = valid
                    .iter()
                    .map(|&i| q.value(catalog.params(i), row.scale[i]))
                    .collect();
                weighted_summary(&values, &weights).unwrap_or(QuantityStat::SENTINEL)
            })
            .collect();

        let best_flux = if running_best.model_index == Some(best) {
            running_best.flux.clone()
        } else {
            vec![DERIVED_SENTINEL; self.n_filters]
        };

        let fit = GalaxyFit {
            id: galaxy.id.to_string(),
            z: galaxy.z,
            model: Some(catalog.ids()[best]),
            model_index: Some(best),
            scale: row.scale[best],
            scale_err: row.scale_err[best],
            chi2: chi2_min,
            n_valid_filters: galaxy.n_valid_filters,
            best: Some(catalog.params(best).clone()),
            best_flux,
            posterior,
        };

        let draws = self.draw(galaxy.id, &valid, weights, row, catalog);
        GalaxyPosterior { fit, draws }
    }

    fn unfit(&self, galaxy: GalaxyKey<'_>) -> GalaxyPosterior {
        let mut fit = GalaxyFit::unfit(galaxy.id, galaxy.z, self.n_filters);
        fit.n_valid_filters = galaxy.n_valid_filters;
        GalaxyPosterior {
            fit,
            draws: vec![PosteriorDraw::SENTINEL; self.n_draws],
        }
    }

    fn draw(
        &self,
        id: &str,
        valid: &[usize],
        weights: Vec<f64>,
        row: GridRow<'_>,
        catalog: &ModelCatalog,
    ) -> Vec<PosteriorDraw> {
        // The best model has weight 1, so the alias table always builds.
        let Ok(dist) = WeightedAliasIndex::new(weights) else {
            return vec![PosteriorDraw::SENTINEL; self.n_draws];
        };
        let mut rng = StdRng::seed_from_u64(galaxy_seed(self.seed, id));
        (0..self.n_draws)
            .map(|_| {
                let i = valid[dist.sample(&mut rng)];
                PosteriorDraw {
                    model: Some(catalog.ids()[i]),
                    model_index: Some(i),
                    chi2: row.chi2[i],
                    scale: row.scale[i],
                    scale_err: row.scale_err[i],
                }
            })
            .collect()
    }
}

/// Per-galaxy RNG seed.
///
/// Hashed with std's `DefaultHasher`, whose algorithm is not fixed across
/// Rust releases: draws reproduce for a given toolchain, not across
/// toolchains. Galaxies sharing an id share a draw stream.
pub fn galaxy_seed(seed: u64, id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ModelRecord;

    fn params(age: f64, mstar: f64) -> SfhParams {
        SfhParams {
            tau: 1.0,
            metallicity: 0.02,
            age,
            delayed: true,
            bursts: vec![],
            av: 0.5,
            mu: 0.3,
            mstar,
            sfr: 0.2,
            sfr100: 0.2,
            b100: 0.3,
            ewoii: 5.0,
            ewhb: 3.0,
            ewha: 20.0,
        }
    }

    fn catalog(ages: &[f64]) -> ModelCatalog {
        let chunk = ModelChunk {
            index: 0,
            models: ages
                .iter()
                .enumerate()
                .map(|(i, &age)| ModelRecord {
                    id: ModelId { chunk: 0, index: i },
                    params: params(age, 1.0),
                    flux: vec![1.0],
                })
                .collect(),
        };
        let mut catalog = ModelCatalog::default();
        catalog.push_chunk(&chunk);
        catalog
    }

    fn builder(n_draws: usize) -> PosteriorBuilder {
        PosteriorBuilder {
            n_draws,
            seed: 7,
            n_filters: 1,
        }
    }

    fn no_best() -> RunningBest {
        RunningBest {
            chi2: CHI2_SENTINEL,
            model_index: None,
            flux: vec![DERIVED_SENTINEL],
        }
    }

    fn key(id: &str) -> GalaxyKey<'_> {
        GalaxyKey {
            id,
            z: 0.1,
            n_valid_filters: 5,
        }
    }

    #[test]
    fn best_fit_is_row_minimum_with_lowest_index_on_ties() {
        let cat = catalog(&[1.0, 2.0, 3.0, 4.0]);
        let chi2 = [5.0, 1.5, CHI2_SENTINEL, 1.5];
        let scale = [1e10, 2e10, -1.0, 3e10];
        let err = [1e8; 4];
        let row = GridRow {
            scale: &scale,
            scale_err: &err,
            chi2: &chi2,
        };
        let post = builder(50).build(key("g1"), row, &no_best(), &cat);
        assert_eq!(post.fit.model_index, Some(1));
        assert_eq!(post.fit.chi2, 1.5);
        assert_eq!(post.fit.best.as_ref().unwrap().age, 2.0);
        assert!((post.fit.stat(Quantity::Mass).avg - 10.3).abs() < 0.5);
        assert_eq!(post.draws.len(), 50);
        assert!(post.draws.iter().all(|d| d.model_index != Some(2)));
    }

    #[test]
    fn single_value_posterior_has_zero_error() {
        let cat = catalog(&[3.0, 3.0, 3.0]);
        let chi2 = [2.0, 4.0, 9.0];
        let scale = [1.0; 3];
        let row = GridRow {
            scale: &scale,
            scale_err: &scale,
            chi2: &chi2,
        };
        let post = builder(10).build(key("g"), row, &no_best(), &cat);
        let age = post.fit.stat(Quantity::Age);
        assert_eq!(age.p50, 3.0);
        assert_eq!(age.err, 0.0);
    }

    #[test]
    fn no_valid_model_gives_sentinel_record() {
        let cat = catalog(&[1.0, 2.0]);
        let chi2 = [CHI2_SENTINEL; 2];
        let other = [DERIVED_SENTINEL; 2];
        let row = GridRow {
            scale: &other,
            scale_err: &other,
            chi2: &chi2,
        };
        let post = builder(4).build(key("bad"), row, &no_best(), &cat);
        assert!(!post.fit.is_fit());
        assert_eq!(post.fit.chi2, CHI2_SENTINEL);
        assert!(post.fit.posterior.iter().all(|s| *s == QuantityStat::SENTINEL));
        assert_eq!(post.draws, vec![PosteriorDraw::SENTINEL; 4]);
        assert_eq!(post.fit.n_valid_filters, 5);
    }

    #[test]
    fn draws_follow_likelihood_weights() {
        let cat = catalog(&[1.0, 2.0]);
        // Weight ratio exp(-2) ≈ 0.135 → model 1 drawn ~12% of the time.
        let chi2 = [0.0, 4.0];
        let scale = [1.0, 1.0];
        let row = GridRow {
            scale: &scale,
            scale_err: &scale,
            chi2: &chi2,
        };
        let post = builder(4000).build(key("g"), row, &no_best(), &cat);
        let frac = post.draws.iter().filter(|d| d.model_index == Some(1)).count() as f64 / 4000.0;
        assert!((frac - 0.119).abs() < 0.03, "frac={frac}");
    }

    #[test]
    fn draws_are_reproducible_per_galaxy_id() {
        let cat = catalog(&[1.0, 2.0, 3.0]);
        let chi2 = [1.0, 1.2, 1.1];
        let scale = [1.0; 3];
        let row = GridRow {
            scale: &scale,
            scale_err: &scale,
            chi2: &chi2,
        };
        let a = builder(30).build(key("same"), row, &no_best(), &cat);
        let b = builder(30).build(key("same"), row, &no_best(), &cat);
        assert_eq!(a.draws, b.draws);
    }

    #[test]
    fn seed_depends_on_run_seed_and_id_only() {
        assert_eq!(galaxy_seed(7, "g1"), galaxy_seed(7, "g1"));
        assert_ne!(galaxy_seed(7, "g1"), galaxy_seed(7, "g2"));
        assert_ne!(galaxy_seed(7, "g1"), galaxy_seed(8, "g1"));
    }
}
