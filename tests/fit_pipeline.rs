use std::sync::atomic::{AtomicUsize, Ordering};

use nalgebra::DMatrix;
use sps_fit::domain::{
    CHI2_SENTINEL, FitParams, ModelChunk, ModelId, ModelRecord, Photometry, PosteriorDraw, Quantity, SfhParams,
};
use sps_fit::error::FitError;
use sps_fit::fit::{ChiSquareGrid, FitOrchestrator, FitOutput, GridSink, ModelCatalog, fit_configurations};
use sps_fit::grid::{CancelToken, InMemoryGrid, ModelGridReader};

const FILTERS: [&str; 4] = ["g", "r", "i", "z"];
const ZGRID: [f64; 4] = [0.05, 0.1, 0.2, 0.4];

fn filters() -> Vec<String> {
    FILTERS.iter().map(|s| s.to_string()).collect()
}

fn sfh(k: usize, age: f64) -> SfhParams {
    SfhParams {
        tau: 0.5 + k as f64,
        metallicity: 0.004 * (1 + k % 3) as f64,
        age,
        delayed: k % 2 == 1,
        bursts: vec![],
        av: 0.1 * k as f64,
        mu: 0.3,
        mstar: 1.0 + 0.1 * k as f64,
        sfr: 0.2,
        sfr100: 0.3,
        b100: 0.5,
        ewoii: 10.0,
        ewhb: 5.0,
        ewha: 20.0,
    }
}

/// Model `k`: a distinct spectral shape, dimming with redshift.
fn model(k: usize, age: f64) -> ModelRecord {
    let mut flux = Vec::with_capacity(ZGRID.len() * FILTERS.len());
    for (zi, _) in ZGRID.iter().enumerate() {
        for f in 0..FILTERS.len() {
            let shape = 1.0 + 0.2 * k as f64 + 0.5 * f as f64 * (k % 3 + 1) as f64;
            flux.push(shape / (1.0 + zi as f64));
        }
    }
    ModelRecord {
        id: ModelId { chunk: 0, index: 0 },
        params: sfh(k, age),
        flux,
    }
}

fn models(n: usize) -> Vec<ModelRecord> {
    (0..n).map(|k| model(k, 1.0 + 0.5 * k as f64)).collect()
}

fn params() -> FitParams {
    let mut p = FitParams::new(filters(), ZGRID.to_vec());
    p.n_draws = 50;
    p
}

/// Galaxy `g` looks like model `g % n_models` scaled by `1e3 * (g + 1)`, with a
/// small deterministic perturbation.
fn photometry(n: usize, n_models: usize) -> Photometry {
    let grid = models(n_models);
    let mut flux = DMatrix::zeros(FILTERS.len(), n);
    for g in 0..n {
        let m = grid[g % n_models].flux_row(FILTERS.len(), 1);
        for f in 0..FILTERS.len() {
            let noise = 1.0 + 0.01 * (((g * 7 + f * 3) % 5) as f64 - 2.0);
            flux[(f, g)] = 1e3 * (g + 1) as f64 * m[f] * noise;
        }
    }
    Photometry {
        ids: (0..n).map(|g| format!("obj{g:03}")).collect(),
        redshift: (0..n).map(|g| [0.1, 0.15, 0.3, 0.06][g % 4]).collect(),
        flux,
        ivar: DMatrix::from_element(FILTERS.len(), n, 1e-4),
    }
}

#[derive(Default)]
struct RowCapture {
    rows: Vec<(String, Vec<f64>)>,
}

impl GridSink for RowCapture {
    fn write_block(&mut self, ids: &[String], grid: &ChiSquareGrid, _catalog: &ModelCatalog) -> Result<(), FitError> {
        for (g, id) in ids.iter().enumerate() {
            self.rows.push((id.clone(), grid.row(g).chi2.to_vec()));
        }
        Ok(())
    }
}

struct CountingReader {
    inner: InMemoryGrid,
    reads: AtomicUsize,
}

impl ModelGridReader for CountingReader {
    fn filters(&self) -> &[String] {
        self.inner.filters()
    }

    fn redshift_grid(&self) -> &[f64] {
        self.inner.redshift_grid()
    }

    fn chunk_lens(&self) -> &[usize] {
        self.inner.chunk_lens()
    }

    fn read_chunk(&self, index: usize) -> Result<ModelChunk, FitError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_chunk(index)
    }
}

#[test]
fn best_fit_is_the_row_minimum() {
    let grid = InMemoryGrid::chunked(filters(), ZGRID.to_vec(), models(7), 3);
    let params = params();
    let phot = photometry(9, 7);
    let mut capture = RowCapture::default();

    let out = FitOrchestrator::new(&grid, &params)
        .fit_with_sink(&phot, Some(&mut capture))
        .unwrap();

    assert_eq!(capture.rows.len(), 9);
    for ((id, row), fit) in capture.rows.iter().zip(&out.results) {
        assert_eq!(id, &fit.id);
        let min = row.iter().copied().fold(f64::INFINITY, f64::min);
        assert!(min < CHI2_SENTINEL);
        assert_eq!(fit.chi2, min);
        assert_eq!(row[fit.model_index.unwrap()], min);
    }
}

#[test]
fn scaled_model_recovers_scale_with_zero_chi2() {
    let grid = InMemoryGrid::chunked(filters(), ZGRID.to_vec(), models(5), 2);
    let params = params();
    let m = models(5)[3].flux_row(FILTERS.len(), 1).to_vec();
    let k = 2.5e4;
    let phot = Photometry {
        ids: vec!["exact".into()],
        redshift: vec![0.1],
        flux: DMatrix::from_fn(FILTERS.len(), 1, |f, _| k * m[f]),
        ivar: DMatrix::from_element(FILTERS.len(), 1, 1.0),
    };

    let out = FitOrchestrator::new(&grid, &params).fit(&phot).unwrap();
    let r = &out.results[0];
    assert_eq!(r.model_index, Some(3));
    assert!((r.scale / k - 1.0).abs() < 1e-10);
    assert!(r.chi2 < 1e-12 * k * k);
    assert!((r.stat(Quantity::Tau).p50 - 3.5).abs() < 1e-12);
}

#[test]
fn zero_weight_filters_do_not_change_the_fit() {
    let grid = InMemoryGrid::chunked(filters(), ZGRID.to_vec(), models(6), 4);
    let params = params();
    let mut a = photometry(1, 6);
    a.ivar[(2, 0)] = 0.0;
    let mut b = a.clone();
    b.flux[(2, 0)] = -7.5e9;

    let fa = FitOrchestrator::new(&grid, &params).fit(&a).unwrap();
    let fb = FitOrchestrator::new(&grid, &params).fit(&b).unwrap();
    let (ra, rb) = (&fa.results[0], &fb.results[0]);
    assert_eq!(ra.n_valid_filters, 3);
    assert_eq!(ra.model_index, rb.model_index);
    assert_eq!(ra.scale, rb.scale);
    assert_eq!(ra.chi2, rb.chi2);
}

#[test]
fn too_few_valid_filters_leaves_galaxy_unfit() {
    let grid = InMemoryGrid::chunked(filters(), ZGRID.to_vec(), models(4), 4);
    let params = params();
    let mut phot = photometry(2, 4);
    phot.ivar[(0, 1)] = 0.0;
    phot.ivar[(1, 1)] = 0.0;

    let out = FitOrchestrator::new(&grid, &params).fit(&phot).unwrap();
    assert!(out.results[0].is_fit());
    let r = &out.results[1];
    assert!(!r.is_fit());
    assert_eq!(r.chi2, CHI2_SENTINEL);
    assert_eq!(r.n_valid_filters, 2);
    assert!(out.draws[1].iter().all(|d| *d == PosteriorDraw::SENTINEL));
}

#[test]
fn single_model_posterior_has_zero_width() {
    let grid = InMemoryGrid::chunked(filters(), ZGRID.to_vec(), models(1), 1);
    let params = params();
    let out = FitOrchestrator::new(&grid, &params).fit(&photometry(3, 1)).unwrap();
    for r in &out.results {
        let age = r.stat(Quantity::Age);
        assert_eq!(age.p50, 1.0);
        assert_eq!(age.avg, 1.0);
        assert_eq!(age.err, 0.0);
    }
    assert!(out.draws.iter().flatten().all(|d| d.model_index == Some(0)));
}

#[test]
fn complementary_subsets_merge_to_the_full_fit() {
    let grid = InMemoryGrid::chunked(filters(), ZGRID.to_vec(), models(8), 3);
    let mut params = params();
    params.galaxy_chunk_size = 4;
    let phot = photometry(11, 8);

    let full = FitOrchestrator::new(&grid, &params).fit(&phot).unwrap();

    let evens: Vec<usize> = (0..11).step_by(2).collect();
    let odds: Vec<usize> = (1..11).step_by(2).collect();
    params.galaxy_chunk_size = 2;
    let orch = FitOrchestrator::new(&grid, &params);
    let a = orch.fit_subset(&phot, &evens, None).unwrap();
    let b = orch.fit_subset(&phot, &odds, None).unwrap();

    let mut merged = FitOutput::unfit(&phot, params.n_draws);
    merged.scatter(&evens, FitOutput {
        results: evens.iter().map(|&i| a.results[i].clone()).collect(),
        draws: evens.iter().map(|&i| a.draws[i].clone()).collect(),
    })
    .unwrap();
    merged.scatter(&odds, FitOutput {
        results: odds.iter().map(|&i| b.results[i].clone()).collect(),
        draws: odds.iter().map(|&i| b.draws[i].clone()).collect(),
    })
    .unwrap();

    assert_eq!(merged, full);
}

#[test]
fn galaxy_chunking_does_not_change_results() {
    let grid = InMemoryGrid::chunked(filters(), ZGRID.to_vec(), models(6), 4);
    let mut params = params();
    let phot = photometry(7, 6);
    let single = FitOrchestrator::new(&grid, &params).fit(&phot).unwrap();

    params.galaxy_chunk_size = 3;
    let chunked = FitOrchestrator::new(&grid, &params).fit(&phot).unwrap();
    assert_eq!(chunked, single);
}

#[test]
fn non_monotonic_grid_fails_before_any_chunk_read() {
    let zgrid = vec![0.05, 0.2, 0.1, 0.4];
    let reader = CountingReader {
        inner: InMemoryGrid::chunked(filters(), zgrid.clone(), models(3), 1),
        reads: AtomicUsize::new(0),
    };
    let params = FitParams {
        redshift_grid: zgrid,
        ..params()
    };

    let err = FitOrchestrator::new(&reader, &params).fit(&photometry(2, 3)).unwrap_err();
    assert!(matches!(err, FitError::GridBounds(_)));
    assert_eq!(reader.reads.load(Ordering::SeqCst), 0);
}

#[test]
fn redshift_outside_grid_fails_before_any_chunk_read() {
    let reader = CountingReader {
        inner: InMemoryGrid::chunked(filters(), ZGRID.to_vec(), models(3), 1),
        reads: AtomicUsize::new(0),
    };
    let params = params();
    let mut phot = photometry(3, 3);
    phot.redshift[2] = 0.9;

    let err = FitOrchestrator::new(&reader, &params).fit(&phot).unwrap_err();
    assert!(matches!(err, FitError::GridBounds(_)));
    assert_eq!(reader.reads.load(Ordering::SeqCst), 0);
}

#[test]
fn models_older_than_the_universe_need_the_override() {
    // At z = 0.4 the universe is under 10 Gyr old.
    let ancient = vec![model(0, 13.0)];
    let grid = InMemoryGrid::chunked(filters(), ZGRID.to_vec(), ancient, 1);
    let mut params = params();
    let mut phot = photometry(1, 1);
    phot.redshift[0] = 0.4;

    let out = FitOrchestrator::new(&grid, &params).fit(&phot).unwrap();
    assert!(!out.results[0].is_fit());

    params.allow_older_than_universe = true;
    let out = FitOrchestrator::new(&grid, &params).fit(&phot).unwrap();
    assert!(out.results[0].is_fit());
    assert_eq!(out.results[0].stat(Quantity::Age).p50, 13.0);
}

#[test]
fn cancelled_run_stops_at_the_next_chunk() {
    let grid = InMemoryGrid::chunked(filters(), ZGRID.to_vec(), models(4), 2);
    let params = params();
    let token = CancelToken::new();
    token.cancel();

    let err = FitOrchestrator::new(&grid, &params)
        .with_cancel(token)
        .fit(&photometry(2, 4))
        .unwrap_err();
    assert!(matches!(err, FitError::Cancelled));
}

#[test]
fn each_configuration_gets_its_own_output() {
    let narrow = InMemoryGrid::chunked(filters(), ZGRID.to_vec(), models(2), 1);
    let wide = InMemoryGrid::chunked(filters(), ZGRID.to_vec(), models(6), 4);
    let params = params();
    let phot = photometry(4, 2);

    let runs = fit_configurations(
        &phot,
        &params,
        [("narrow", &narrow as &dyn ModelGridReader), ("wide", &wide as &dyn ModelGridReader)],
    )
    .unwrap();

    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].0, "narrow");
    assert_eq!(runs[1].0, "wide");
    assert!(runs.iter().all(|(_, out)| out.n_fit() == 4));
    assert!(runs[0].1.results.iter().all(|r| r.model_index.unwrap() < 2));
}
