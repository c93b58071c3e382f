//! Age of the universe for an FRW cosmology.
//!
//! ```text
//! t(z) = (1/H0) ∫_0^{a(z)} da / (a E(a)),   a = 1/(1+z)
//! a E(a) = sqrt(Ωm/a + Ωk + ΩΛ a²),          Ωk = 1 − Ωm − ΩΛ
//! ```
//!
//! Substituting `a = u²` removes the `√a` cusp at the origin:
//!
//! ```text
//! t(z) = (1/H0) ∫_0^{√a} 2u² du / sqrt(Ωm + Ωk u² + ΩΛ u⁶)
//! ```
//!
//! which is smooth, so composite Simpson converges quickly.

use crate::domain::Cosmology;
use crate::error::FitError;

/// Hubble time for H0 = 1 km/s/Mpc, in Gyr.
const HUBBLE_TIME_GYR: f64 = 977.792_221_673;

/// Simpson intervals (even).
const SIMPSON_STEPS: usize = 512;

/// Reject cosmologies without a Big Bang.
///
/// With `x = u²` the integrand denominator is `f(x) = Ωm + Ωk x + ΩΛ x³` on
/// `(0, 1]`. `f(0) = Ωm` and `f(1) = 1`, so the only place it can dip to zero
/// is the interior minimum at `x = sqrt(−Ωk / 3ΩΛ)`.
pub fn check_cosmology(cosmo: &Cosmology) -> Result<(), FitError> {
    let (om, ol) = (cosmo.omega_m, cosmo.omega_lambda);
    let ok = 1.0 - om - ol;
    let f = |x: f64| om + ok * x + ol * x * x * x;

    let mut min = om.min(f(1.0));
    if ol > 0.0 && ok < 0.0 {
        let x = (-ok / (3.0 * ol)).sqrt();
        if x < 1.0 {
            min = min.min(f(x));
        }
    }
    if !(min > 0.0) {
        return Err(FitError::Config(format!(
            "omega_m={om}, omega_lambda={ol} has no Big Bang (expansion rate vanishes in the past)"
        )));
    }
    Ok(())
}

/// Age of the universe (Gyr) at redshift `z`.
pub fn age_at(cosmo: &Cosmology, z: f64) -> f64 {
    let omega_k = 1.0 - cosmo.omega_m - cosmo.omega_lambda;
    let upper = (1.0 / (1.0 + z)).sqrt();
    let integrand = |u: f64| {
        let u2 = u * u;
        let denom = cosmo.omega_m + omega_k * u2 + cosmo.omega_lambda * u2 * u2 * u2;
        2.0 * u2 / denom.sqrt()
    };

    let h = upper / SIMPSON_STEPS as f64;
    let mut sum = integrand(0.0) + integrand(upper);
    for i in 1..SIMPSON_STEPS {
        let w = if i % 2 == 1 { 4.0 } else { 2.0 };
        sum += w * integrand(h * i as f64);
    }
    sum * h / 3.0 * HUBBLE_TIME_GYR / cosmo.h0
}

/// Oldest stellar population allowed at redshift `z`: the time elapsed since
/// `z_form`. Zero when `z >= z_form`.
pub fn max_age_at(cosmo: &Cosmology, z: f64, z_form: f64) -> f64 {
    (age_at(cosmo, z) - age_at(cosmo, z_form)).max(0.0)
}
