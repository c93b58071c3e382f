//! Formatted terminal output.
//!
//! Formatting lives here so the fitting code stays free of presentation and
//! output changes stay localized.

use crate::domain::{GalaxyFit, Quantity};
use crate::fit::FitOutput;
use crate::grid::{GridManifest, ModelGridReader};

/// Summary of one grid's fit: counts, chi-square median, first `top` galaxies.
pub fn format_fit_summary(grid: &str, n_models: usize, output: &FitOutput, top: usize) -> String {
    let mut out = String::new();
    let n_fit = output.n_fit();

    out.push_str(&format!("=== spsfit - grid '{grid}' ({n_models} models) ===\n"));
    out.push_str(&format!(
        "Galaxies: n={} | fit={} | unfit={}\n",
        output.len(),
        n_fit,
        output.len() - n_fit
    ));
    match median_chi2(&output.results) {
        Some(m) => out.push_str(&format!("Median best-fit chi2: {m:.3}\n")),
        None => out.push_str("Median best-fit chi2: n/a\n"),
    }

    if top == 0 || output.is_empty() {
        return out;
    }

    out.push_str(&format!(
        "\n{:<16} {:>7} {:>10} {:>7} {:>8} {:>8} {:>6}\n",
        "id", "z", "chi2", "nfilt", "logM", "age", "Av"
    ));
    for r in output.results.iter().take(top) {
        out.push_str(&format_galaxy_line(r));
        out.push('\n');
    }
    if output.len() > top {
        out.push_str(&format!("... {} more\n", output.len() - top));
    }
    out
}

fn format_galaxy_line(r: &GalaxyFit) -> String {
    if !r.is_fit() {
        return format!("{:<16} {:>7.4} {:>10} {:>7}", truncate(&r.id, 16), r.z, "no fit", r.n_valid_filters);
    }
    format!(
        "{:<16} {:>7.4} {:>10.3} {:>7} {:>8.3} {:>8.3} {:>6.2}",
        truncate(&r.id, 16),
        r.z,
        r.chi2,
        r.n_valid_filters,
        r.stat(Quantity::Mass).p50,
        r.stat(Quantity::Age).p50,
        r.stat(Quantity::Av).p50,
    )
}

/// Median best-fit chi-square over fitted galaxies.
pub fn median_chi2(results: &[GalaxyFit]) -> Option<f64> {
    let mut chi2: Vec<f64> = results.iter().filter(|r| r.is_fit()).map(|r| r.chi2).collect();
    if chi2.is_empty() {
        return None;
    }
    chi2.sort_by(f64::total_cmp);
    let mid = chi2.len() / 2;
    Some(if chi2.len() % 2 == 0 {
        0.5 * (chi2[mid - 1] + chi2[mid])
    } else {
        chi2[mid]
    })
}

/// Describe a grid: filters, redshift coverage, chunk layout.
pub fn format_grid_info(name: &str, manifest: &GridManifest, reader: &dyn ModelGridReader) -> String {
    let mut out = String::new();
    out.push_str(&format!("Grid: {name}\n"));
    out.push_str(&format!("Filters ({}): {}\n", manifest.filters.len(), manifest.filters.join(", ")));
    match (manifest.redshift_grid.first(), manifest.redshift_grid.last()) {
        (Some(lo), Some(hi)) => out.push_str(&format!(
            "Redshift nodes: {} | z=[{lo:.4}, {hi:.4}]\n",
            manifest.redshift_grid.len()
        )),
        _ => out.push_str("Redshift nodes: 0\n"),
    }
    out.push_str(&format!(
        "Models: {} in {} chunk(s)\n",
        reader.n_models(),
        reader.n_chunks()
    ));
    for entry in &manifest.chunks {
        out.push_str(&format!("  {:<24} {:>8}\n", entry.file, entry.n_models));
    }
    out
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut t: String = s.chars().take(width.saturating_sub(1)).collect();
    t.push('~');
    t
}
