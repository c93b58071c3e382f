//! Weighted summary statistics for discrete posteriors.
//!
//! Percentiles use the inverse of the weighted empirical CDF: the p-th
//! percentile is the smallest value whose cumulative normalised weight
//! reaches `p`. With a single distinct value every percentile equals it.

use crate::domain::QuantityStat;

/// Summarise `(value, weight)` pairs.
///
/// Pairs with non-finite values or non-positive weights are ignored. Returns
/// `None` when nothing is left.
pub fn weighted_summary(values: &[f64], weights: &[f64]) -> Option<QuantityStat> {
    let mut pairs: Vec<(f64, f64)> = values
        .iter()
        .zip(weights)
        .filter(|(v, w)| v.is_finite() && w.is_finite() && **w > 0.0)
        .map(|(&v, &w)| (v, w))
        .collect();
    if pairs.is_empty() {
        return None;
    }

    let total: f64 = pairs.iter().map(|(_, w)| w).sum();
    let avg = pairs.iter().map(|(v, w)| v * w).sum::<f64>() / total;

    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    let p16 = percentile_sorted(&pairs, total, 0.16);
    let p50 = percentile_sorted(&pairs, total, 0.50);
    let p84 = percentile_sorted(&pairs, total, 0.84);

    Some(QuantityStat {
        avg,
        p50,
        err: 0.5 * (p84 - p16),
        p16,
        p84,
    })
}

fn percentile_sorted(pairs: &[(f64, f64)], total: f64, p: f64) -> f64 {
    let target = p * total;
    let mut cum = 0.0;
    for &(v, w) in pairs {
        cum += w;
        if cum >= target {
            return v;
        }
    }
    // Rounding can leave `cum` a hair below `target` for p close to 1.
    pairs[pairs.len() - 1].0
}
