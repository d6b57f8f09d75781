//! Configuration types for the encryption scheme, the threshold committee and
//! the aggregation run.
//!
//! Every type here is plain serde data with a `validate` method; the `new`
//! constructors validate eagerly so that invalid parameters are rejected at
//! construction time rather than half-way through a run.
//!
//! # Example
//!
//! ```rust
//! use ivs_fhe::{SchemeParameters, ThresholdParameters};
//!
//! // 3-of-5 committee over a four-prime modulus chain
//! let scheme = SchemeParameters::new(4096, vec![60, 40, 40, 60], 40).expect("valid scheme");
//! let threshold = ThresholdParameters::new(5, 3, None).expect("valid threshold");
//! assert_eq!(scheme.levels(), 3);
//! assert_eq!(threshold.threshold, 3);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Largest ring dimension accepted by [`SchemeParameters::validate`].
pub const MAX_RING_DIMENSION: usize = 1 << 16;
/// Largest committee accepted by [`ThresholdParameters::validate`].
pub const MAX_COMMITTEE_SIZE: usize = 1024;

/// Immutable CKKS scheme parameters.
///
/// # Fields
///
/// - `ring_dimension`: degree `n` of the cyclotomic ring `X^n + 1`. Must be a
///   power of two. Up to `n` values are packed per ciphertext.
/// - `modulus_bits`: bit sizes of the RNS primes, from the base prime (never
///   dropped) to the last prime (dropped by the first rescale).
/// - `scale_bits`: encoding scale as a power of two.
///
/// # Constraints
///
/// - the chain has at least two primes, each between 20 and 60 bits
/// - every prime leaves room for an NTT-friendly residue class (`q ≡ 1 mod 2n`)
/// - the base prime is larger than the scale so the floor level can still
///   carry a message
///
/// # Example
///
/// ```rust
/// use ivs_fhe::SchemeParameters;
///
/// let params = SchemeParameters::new(1024, vec![60, 40, 40, 60], 40).expect("valid parameters");
/// assert_eq!(params.scale(), (1u64 << 40) as f64);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemeParameters {
    /// Ring dimension `n` (power of two)
    pub ring_dimension: usize,
    /// Bit sizes of the RNS modulus chain, base prime first
    pub modulus_bits: Vec<u32>,
    /// Encoding scale exponent: the scale is `2^scale_bits`
    pub scale_bits: u32,
}

impl SchemeParameters {
    /// Creates and validates scheme parameters.
    pub fn new(ring_dimension: usize, modulus_bits: Vec<u32>, scale_bits: u32) -> Result<Self, Error> {
        let params = Self {
            ring_dimension,
            modulus_bits,
            scale_bits,
        };
        params.validate()?;
        Ok(params)
    }

    /// Maximum number of sequential rescales a fresh ciphertext supports.
    pub fn levels(&self) -> usize {
        self.modulus_bits.len().saturating_sub(1)
    }

    /// Default encoding scale.
    pub fn scale(&self) -> f64 {
        2f64.powi(self.scale_bits as i32)
    }

    /// Validates the parameters.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ivs_fhe::SchemeParameters;
    ///
    /// let params = SchemeParameters {
    ///     ring_dimension: 1000, // not a power of two
    ///     modulus_bits: vec![60, 40],
    ///     scale_bits: 40,
    /// };
    /// assert!(params.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), Error> {
        if !self.ring_dimension.is_power_of_two() || self.ring_dimension < 8 {
            return Err(Error::InvalidConfig(
                "ring dimension must be a power of two and at least 8".into(),
            ));
        }
        if self.ring_dimension > MAX_RING_DIMENSION {
            return Err(Error::InvalidConfig(format!(
                "ring dimension must not exceed {MAX_RING_DIMENSION}"
            )));
        }
        if self.modulus_bits.len() < 2 {
            return Err(Error::InvalidConfig(
                "modulus chain needs at least two primes".into(),
            ));
        }
        // q ≡ 1 (mod 2n) with q < 2^bits needs bits comfortably above log2(2n)
        let min_bits = (2 * self.ring_dimension).trailing_zeros() + 2;
        for &bits in &self.modulus_bits {
            if !(20..=60).contains(&bits) || bits < min_bits {
                return Err(Error::InvalidConfig(format!(
                    "modulus prime of {bits} bits is outside [{}, 60]",
                    min_bits.max(20)
                )));
            }
        }
        if self.scale_bits < 10 || self.scale_bits >= self.modulus_bits[0] {
            return Err(Error::InvalidConfig(
                "scale must be at least 2^10 and below the base prime".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SchemeParameters {
    /// 8192-degree ring with a `[60, 40, 40, 60]` chain and a `2^40` scale.
    fn default() -> Self {
        Self {
            ring_dimension: 8192,
            modulus_bits: vec![60, 40, 40, 60],
            scale_bits: 40,
        }
    }
}

/// Threshold committee parameters.
///
/// # Fields
///
/// - `total_shares`: committee size `N`
/// - `threshold`: number of shares `T` needed to decrypt, `1 ≤ T ≤ N`
/// - `coefficients`: optional explicit non-constant coefficients of the
///   sharing polynomial (`T − 1` values), for deterministic testing only
///
/// # Example
///
/// ```rust
/// use ivs_fhe::ThresholdParameters;
///
/// assert!(ThresholdParameters::new(3, 4, None).is_err());
/// let params = ThresholdParameters::new(5, 3, Some(vec![7, 11])).expect("valid");
/// assert_eq!(params.total_shares, 5);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdParameters {
    /// Committee size
    pub total_shares: usize,
    /// Shares needed to decrypt
    pub threshold: usize,
    /// Explicit sharing polynomial coefficients `a_1..a_{T-1}` (testing only)
    #[serde(default)]
    pub coefficients: Option<Vec<u64>>,
}

impl ThresholdParameters {
    /// Creates and validates threshold parameters.
    pub fn new(total_shares: usize, threshold: usize, coefficients: Option<Vec<u64>>) -> Result<Self, Error> {
        let params = Self {
            total_shares,
            threshold,
            coefficients,
        };
        params.validate()?;
        Ok(params)
    }

    /// Validates the threshold parameters.
    pub fn validate(&self) -> Result<(), Error> {
        if self.total_shares == 0 || self.total_shares > MAX_COMMITTEE_SIZE {
            return Err(Error::InvalidConfig(format!(
                "committee size must be within [1, {MAX_COMMITTEE_SIZE}]"
            )));
        }
        if self.threshold == 0 || self.threshold > self.total_shares {
            return Err(Error::InvalidConfig(
                "threshold must be within [1, total_shares]".into(),
            ));
        }
        if let Some(coefficients) = &self.coefficients {
            if coefficients.len() != self.threshold - 1 {
                return Err(Error::InvalidConfig(format!(
                    "expected {} explicit coefficients, got {}",
                    self.threshold - 1,
                    coefficients.len()
                )));
            }
        }
        Ok(())
    }
}

fn default_max_depth() -> usize {
    2
}

fn default_scale_tolerance() -> f64 {
    1e-3
}

fn default_floor_plain_scale_bits() -> u32 {
    12
}

fn default_cross_disease() -> bool {
    true
}

/// Parameters of one aggregation run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Maximum BFS depth `Dmax`
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Relative scale gap tolerated before operands are coerced
    #[serde(default = "default_scale_tolerance")]
    pub scale_tolerance: f64,
    /// Plain encoding scale (as a power of two) used when a weight has to be
    /// applied at the bottom of the modulus chain
    #[serde(default = "default_floor_plain_scale_bits")]
    pub floor_plain_scale_bits: u32,
    /// Whether per-disease scores are also summed across diseases
    #[serde(default = "default_cross_disease")]
    pub cross_disease: bool,
}

impl AggregationConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.scale_tolerance > 0.0 && self.scale_tolerance < 1.0) {
            return Err(Error::InvalidConfig(
                "scale tolerance must be within (0, 1)".into(),
            ));
        }
        if self.floor_plain_scale_bits == 0 || self.floor_plain_scale_bits > 30 {
            return Err(Error::InvalidConfig(
                "floor plain scale must be within [2^1, 2^30]".into(),
            ));
        }
        Ok(())
    }

    pub fn floor_plain_scale(&self) -> f64 {
        2f64.powi(self.floor_plain_scale_bits as i32)
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            scale_tolerance: default_scale_tolerance(),
            floor_plain_scale_bits: default_floor_plain_scale_bits(),
            cross_disease: default_cross_disease(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_verify_proofs() -> bool {
    true
}

/// Parameters for collecting partial decryptions from committee members.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Deadline for reaching a quorum, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Drop partials whose proof is missing or does not verify
    #[serde(default = "default_verify_proofs")]
    pub verify_proofs: bool,
}

impl CollectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "collection timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            verify_proofs: default_verify_proofs(),
        }
    }
}

/// Everything a computation run needs, loadable from JSON.
///
/// # Example
///
/// ```rust
/// use ivs_fhe::RunConfig;
///
/// let config = RunConfig::from_json(r#"{
///     "scheme": { "ring_dimension": 1024, "modulus_bits": [60, 40, 60], "scale_bits": 40 },
///     "threshold": { "total_shares": 3, "threshold": 2 }
/// }"#).expect("valid config");
/// assert_eq!(config.aggregation.max_depth, 2);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub scheme: SchemeParameters,
    pub threshold: ThresholdParameters,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
}

impl RunConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json(input: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(input)
            .map_err(|err| Error::InvalidConfig(format!("unparseable configuration: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.scheme.validate()?;
        self.threshold.validate()?;
        self.aggregation.validate()?;
        self.collection.validate()?;
        let floor_bits = self.scheme.scale_bits + self.aggregation.floor_plain_scale_bits;
        if floor_bits + 2 > self.scheme.modulus_bits[0] {
            return Err(Error::InvalidConfig(
                "floor plain scale leaves no headroom in the base prime".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_threshold() {
        assert!(matches!(
            ThresholdParameters::new(3, 0, None),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            ThresholdParameters::new(3, 4, None),
            Err(Error::InvalidConfig(_))
        ));
        assert!(ThresholdParameters::new(1, 1, None).is_ok());
    }

    #[test]
    fn explicit_coefficients_must_match_degree() {
        assert!(ThresholdParameters::new(5, 3, Some(vec![1])).is_err());
        assert!(ThresholdParameters::new(5, 3, Some(vec![1, 2])).is_ok());
    }

    #[test]
    fn scheme_parameters_validation() {
        assert!(SchemeParameters::default().validate().is_ok());
        assert!(SchemeParameters::new(1024, vec![60], 40).is_err());
        assert!(SchemeParameters::new(1024, vec![60, 70], 40).is_err());
        assert!(SchemeParameters::new(1024, vec![40, 40], 40).is_err());
        assert!(SchemeParameters::new(1000, vec![60, 40], 40).is_err());
        let params = SchemeParameters::new(1024, vec![60, 40, 40, 60], 40).expect("valid");
        assert_eq!(params.levels(), 3);
    }

    #[test]
    fn run_config_defaults_and_headroom() {
        let config = RunConfig::from_json(
            r#"{
                "scheme": { "ring_dimension": 1024, "modulus_bits": [60, 40, 60], "scale_bits": 40 },
                "threshold": { "total_shares": 3, "threshold": 2 },
                "collection": { "timeout_ms": 500 }
            }"#,
        )
        .expect("valid config");
        assert_eq!(config.aggregation, AggregationConfig::default());
        assert_eq!(config.collection.timeout(), Duration::from_millis(500));
        assert!(config.collection.verify_proofs);

        let squeezed = RunConfig::from_json(
            r#"{
                "scheme": { "ring_dimension": 1024, "modulus_bits": [50, 40, 60], "scale_bits": 40 },
                "threshold": { "total_shares": 3, "threshold": 2 },
                "aggregation": { "floor_plain_scale_bits": 12 }
            }"#,
        );
        assert!(matches!(squeezed, Err(Error::InvalidConfig(_))));
        assert!(RunConfig::from_json("{").is_err());
    }
}
