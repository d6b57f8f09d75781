//! Scale and level bookkeeping for encrypted accumulation.
//!
//! CKKS additions require operands at the same level and (approximately) the
//! same scale, and every plaintext multiplication inflates the scale until a
//! rescale brings it back down. [`ScaleLevelManager`] hides those rules from
//! the aggregation code:
//!
//! - `multiply_by_plain_scalar` returns a ciphertext at the input scale,
//!   spending one level when one is available
//! - `add` aligns levels, then reconciles scales beyond the configured
//!   tolerance by coercing both operands to the smaller scale, or at the
//!   floor by lifting both by integer factors to a common scale
//! - at the bottom of the modulus chain rescales are skipped with a warning
//!   and the computation continues at reduced precision
//!
//! Coercion always works on clones; inputs are never modified.

use std::sync::atomic::{AtomicU64, Ordering};

use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::backend::{CiphertextMeta, HomomorphicBackend};
use crate::config::AggregationConfig;
use crate::context::{Ciphertext, SchemeContext};
use crate::errors::{BackendError, Error};

/// Relative distance between two scales.
pub fn relative_gap(a: f64, b: f64) -> f64 {
    (a - b).abs() / a.abs().max(b.abs())
}

/// Result of [`ScaleLevelManager::rescale_if_possible`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RescaleOutcome {
    Rescaled { from_level: usize },
    CannotRescale { level: usize },
}

/// Counts of the numeric adjustments made during a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumericReport {
    pub rescales: u64,
    pub skipped_rescales: u64,
    pub scale_coercions: u64,
    pub level_switches: u64,
}

#[derive(Debug, Default)]
struct Counters {
    rescales: AtomicU64,
    skipped_rescales: AtomicU64,
    scale_coercions: AtomicU64,
    level_switches: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct ScaleLevelManager<'a, B: HomomorphicBackend> {
    ctx: &'a SchemeContext<B>,
    tolerance: f64,
    floor_plain_scale: f64,
    counters: Counters,
}

impl<'a, B: HomomorphicBackend> ScaleLevelManager<'a, B> {
    pub fn new(ctx: &'a SchemeContext<B>, config: &AggregationConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            ctx,
            tolerance: config.scale_tolerance,
            floor_plain_scale: config.floor_plain_scale(),
            counters: Counters::default(),
        })
    }

    pub fn context(&self) -> &'a SchemeContext<B> {
        self.ctx
    }

    pub fn report(&self) -> NumericReport {
        NumericReport {
            rescales: self.counters.rescales.load(Ordering::Relaxed),
            skipped_rescales: self.counters.skipped_rescales.load(Ordering::Relaxed),
            scale_coercions: self.counters.scale_coercions.load(Ordering::Relaxed),
            level_switches: self.counters.level_switches.load(Ordering::Relaxed),
        }
    }

    /// Encryption of zero at exactly `reference_scale`.
    pub fn encrypted_zero<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        reference_scale: f64,
    ) -> Result<Ciphertext<B>, Error> {
        self.ctx.encrypt_at_scale(rng, &[0.0], reference_scale)
    }

    /// Rescales when a level is left; otherwise returns a clone and reports
    /// [`RescaleOutcome::CannotRescale`].
    pub fn rescale_if_possible(&self, ct: &Ciphertext<B>) -> Result<(Ciphertext<B>, RescaleOutcome), Error> {
        let level = ct.level();
        match self.ctx.backend().rescale(ct) {
            Ok(rescaled) => {
                Counters::bump(&self.counters.rescales);
                Ok((rescaled, RescaleOutcome::Rescaled { from_level: level }))
            }
            Err(BackendError::RescaleUnavailable { .. }) => {
                Counters::bump(&self.counters.skipped_rescales);
                warn!(level, scale = ct.scale(), "cannot rescale at modulus floor; precision reduced");
                Ok((ct.clone(), RescaleOutcome::CannotRescale { level }))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// `weight · ct` at the scale of `ct`.
    ///
    /// Above the floor the weight is encoded at the modulus the next rescale
    /// divides by, so the rescaled product lands back on `ct.scale()`. At the
    /// floor the weight is encoded at the configured floor scale and the
    /// result keeps the inflated scale.
    pub fn multiply_by_plain_scalar(&self, ct: &Ciphertext<B>, weight: f64) -> Result<Ciphertext<B>, Error> {
        let backend = self.ctx.backend();
        let plain_scale = match backend.rescale_divisor(ct.level()) {
            Ok(divisor) => divisor,
            Err(BackendError::RescaleUnavailable { .. }) => self.floor_plain_scale,
            Err(err) => return Err(err.into()),
        };
        let product = backend.multiply_plain(ct, weight, plain_scale)?;
        let (result, outcome) = self.rescale_if_possible(&product)?;
        match outcome {
            // pin the scale; divisor round trips can drift by an ulp
            RescaleOutcome::Rescaled { .. } => Ok(backend.with_scale(&result, ct.scale())),
            RescaleOutcome::CannotRescale { .. } => Ok(result),
        }
    }

    /// `acc + weight · term`; a zero weight returns `acc` untouched.
    pub fn accumulate(&self, acc: &Ciphertext<B>, term: &Ciphertext<B>, weight: f64) -> Result<Ciphertext<B>, Error> {
        if weight == 0.0 {
            trace!("zero weight, accumulator unchanged");
            return Ok(acc.clone());
        }
        let weighted = self.multiply_by_plain_scalar(term, weight)?;
        self.add(acc, &weighted)
    }

    /// Level- and scale-aware addition.
    pub fn add(&self, a: &Ciphertext<B>, b: &Ciphertext<B>) -> Result<Ciphertext<B>, Error> {
        let (mut a, mut b) = self.align_levels(a, b)?;
        if relative_gap(a.scale(), b.scale()) > self.tolerance {
            (a, b) = self.coerce_scales(a, b)?;
        }
        self.ctx.add(&a, &b)
    }

    fn align_levels(&self, a: &Ciphertext<B>, b: &Ciphertext<B>) -> Result<(Ciphertext<B>, Ciphertext<B>), Error> {
        let target = a.level().min(b.level());
        Ok((self.switch_to(a, target)?, self.switch_to(b, target)?))
    }

    fn switch_to(&self, ct: &Ciphertext<B>, level: usize) -> Result<Ciphertext<B>, Error> {
        if ct.level() == level {
            return Ok(ct.clone());
        }
        Counters::bump(&self.counters.level_switches);
        trace!(from = ct.level(), to = level, "switching level");
        self.ctx.switch_level(ct, level)
    }

    // Both operands end at the same level and exactly the same scale.
    fn coerce_scales(&self, a: Ciphertext<B>, b: Ciphertext<B>) -> Result<(Ciphertext<B>, Ciphertext<B>), Error> {
        Counters::bump(&self.counters.scale_coercions);
        let a_is_larger = a.scale() > b.scale();
        let (larger, smaller) = if a_is_larger { (a, b) } else { (b, a) };
        trace!(larger = larger.scale(), smaller = smaller.scale(), "coercing scales");

        let (larger, smaller) = match self.ctx.match_scale(&larger, smaller.scale()) {
            Ok(shrunk) => {
                let level = shrunk.level().min(smaller.level());
                (self.switch_to(&shrunk, level)?, self.switch_to(&smaller, level)?)
            }
            Err(err) if err.is_rescale_unavailable() => self.lift_to_common_scale(larger, smaller)?,
            Err(err) => return Err(err),
        };
        Ok(if a_is_larger {
            (larger, smaller)
        } else {
            (smaller, larger)
        })
    }

    // At the floor nothing can shrink. With `larger / smaller ≈ p / q`,
    // `smaller · p` and `larger · q` meet within the tolerance.
    fn lift_to_common_scale(
        &self,
        larger: Ciphertext<B>,
        smaller: Ciphertext<B>,
    ) -> Result<(Ciphertext<B>, Ciphertext<B>), Error> {
        let ratio = larger.scale() / smaller.scale();
        let (p, q) = rational_approximation(ratio, self.tolerance, MAX_LIFT_DENOMINATOR)
            .ok_or(BackendError::Math("scale ratio has no small rational approximation"))?;
        warn!(
            larger = larger.scale(),
            smaller = smaller.scale(),
            p,
            q,
            "cannot shrink scale at modulus floor; lifting both operands"
        );
        let backend = self.ctx.backend();
        let larger = if q == 1 { larger } else { backend.multiply_integer(&larger, q)? };
        let smaller = backend.multiply_integer(&smaller, p)?;
        let common = larger.scale();
        Ok((larger, backend.with_scale(&smaller, common)))
    }
}

const MAX_LIFT_DENOMINATOR: u64 = 1 << 16;

/// Smallest convergent `p / q` of `ratio` within relative `tolerance`, with
/// `q <= max_denominator`.
fn rational_approximation(ratio: f64, tolerance: f64, max_denominator: u64) -> Option<(u64, u64)> {
    if !(ratio.is_finite() && ratio > 0.0) {
        return None;
    }
    let (mut h_prev, mut h) = (0u64, 1u64);
    let (mut k_prev, mut k) = (1u64, 0u64);
    let mut x = ratio;
    for _ in 0..64 {
        if x > u64::MAX as f64 {
            return None;
        }
        let a = x.floor() as u64;
        let h_next = a.checked_mul(h)?.checked_add(h_prev)?;
        let k_next = a.checked_mul(k)?.checked_add(k_prev)?;
        if k_next > max_denominator {
            return None;
        }
        (h_prev, h, k_prev, k) = (h, h_next, k, k_next);
        if h > 0 && relative_gap(h as f64 / k as f64, ratio) <= tolerance {
            return Some((h, k));
        }
        let frac = x - x.floor();
        if frac == 0.0 {
            return None;
        }
        x = 1.0 / frac;
    }
    None
}
