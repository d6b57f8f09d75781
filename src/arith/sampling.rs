//! Samplers for secrets, errors and uniform masks.

use rand::Rng;
use rand_core::{CryptoRng, RngCore};

use crate::arith::rns::{RingContext, RnsPoly};

/// Standard deviation of the discrete Gaussian error distribution.
pub const ERROR_STDDEV: f64 = 3.2;

/// Coefficients in `{-1, 0, 1}` with `P(0) = 1/2`.
pub fn ternary<R: RngCore + CryptoRng>(rng: &mut R, n: usize) -> Vec<i64> {
    (0..n)
        .map(|_| match rng.gen_range(0..4u8) {
            0 => -1,
            1 => 1,
            _ => 0,
        })
        .collect()
}

/// Rounded Gaussian samples (Box-Muller), tails cut at six deviations.
pub fn gaussian<R: RngCore + CryptoRng>(rng: &mut R, n: usize, sigma: f64) -> Vec<i64> {
    let bound = 6.0 * sigma;
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen_range(0.0..1.0);
        let radius = (-2.0 * u1.ln()).sqrt() * sigma;
        let angle = 2.0 * std::f64::consts::PI * u2;
        for sample in [radius * angle.cos(), radius * angle.sin()] {
            if sample.abs() <= bound && out.len() < n {
                out.push(sample.round() as i64);
            }
        }
    }
    out
}

/// Independent uniform residues in every limb.
pub fn uniform<R: RngCore + CryptoRng>(rng: &mut R, ring: &RingContext, limb_count: usize) -> RnsPoly {
    let n = ring.degree();
    RnsPoly::from_limbs_fn(ring, limb_count, |_, q| (0..n).map(|_| rng.gen_range(0..q)).collect())
}
