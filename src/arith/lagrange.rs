//! Lagrange interpolation at zero for Shamir reconstruction.
//!
//! Shares of a secret `f(0)` are evaluations `f(j)` at distinct non-zero
//! points `j`. For a subset `S` of at least `deg(f) + 1` points,
//!
//! ```text
//! f(0) = Σ_{j ∈ S} λ_j · f(j),    λ_j = Π_{m ∈ S, m ≠ j} m / (m − j)
//! ```
//!
//! The weights depend only on the index set and the prime, so callers
//! compute them once per prime and reuse them across every coefficient of a
//! polynomial.

use crate::arith::modular::{inv_mod, mul_mod, sub_mod};
use crate::errors::BackendError;

/// Lagrange weights `λ_j` for reconstructing `f(0)` modulo `q`.
///
/// # Errors
///
/// Fails with [`BackendError::Math`] when an index is zero modulo `q` or two
/// indices coincide.
///
/// # Example
///
/// ```rust
/// use ivs_fhe::arith::lagrange_weights_at_zero;
///
/// let q = 97;
/// // f(x) = 5 + 3x, shares at 1 and 2
/// let weights = lagrange_weights_at_zero(&[1, 2], q).expect("distinct indices");
/// let secret = (weights[0] * 8 + weights[1] * 11) % q;
/// assert_eq!(secret, 5);
/// ```
pub fn lagrange_weights_at_zero(indices: &[u64], q: u64) -> Result<Vec<u64>, BackendError> {
    let points: Vec<u64> = indices.iter().map(|&j| j % q).collect();
    if points.contains(&0) {
        return Err(BackendError::Math("share index must be non-zero"));
    }
    points
        .iter()
        .enumerate()
        .map(|(pos, &j)| {
            let mut numerator = 1u64;
            let mut denominator = 1u64;
            for (other, &m) in points.iter().enumerate() {
                if other == pos {
                    continue;
                }
                if m == j {
                    return Err(BackendError::Math("duplicate share index"));
                }
                numerator = mul_mod(numerator, m, q);
                denominator = mul_mod(denominator, sub_mod(m, j, q), q);
            }
            Ok(mul_mod(numerator, inv_mod(denominator, q)?, q))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arith::modular::{add_mod, ntt_primes};

    fn eval(coeffs: &[u64], x: u64, q: u64) -> u64 {
        coeffs
            .iter()
            .rev()
            .fold(0, |acc, &c| add_mod(mul_mod(acc, x, q), c % q, q))
    }

    #[test]
    fn reconstructs_from_any_subset() {
        let q = ntt_primes(&[50], 1024).expect("prime")[0];
        let poly = [123_456_789u64, 42, 7_777];
        let shares: Vec<u64> = (1..=5).map(|j| eval(&poly, j, q)).collect();

        for subset in [[1u64, 2, 3], [1, 3, 5], [2, 4, 5], [3, 4, 5]] {
            let weights = lagrange_weights_at_zero(&subset, q).expect("distinct");
            let secret = subset
                .iter()
                .zip(&weights)
                .fold(0, |acc, (&j, &w)| add_mod(acc, mul_mod(w, shares[j as usize - 1], q), q));
            assert_eq!(secret, poly[0]);
        }
    }

    #[test]
    fn single_share_weight_is_one() {
        assert_eq!(lagrange_weights_at_zero(&[4], 97).expect("one index"), vec![1]);
    }

    #[test]
    fn rejects_zero_and_duplicate_indices() {
        assert!(lagrange_weights_at_zero(&[0, 1], 97).is_err());
        assert!(lagrange_weights_at_zero(&[2, 2], 97).is_err());
    }
}
