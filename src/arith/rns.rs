//! Polynomials in residue-number-system form.
//!
//! A polynomial modulo `Q = q_0 · q_1 ⋯ q_L` is stored as one coefficient
//! vector ("limb") per prime. A polynomial with `k` limbs lives at level
//! `k − 1`; dropping the last limb either rounds (rescale) or truncates
//! (modulus switch).

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::arith::modular::{
    add_mod, center, inv_mod, mul_mod, neg_mod, ntt_primes, reduce_signed, sub_mod,
};
use crate::arith::ntt::NttTable;
use crate::errors::BackendError;

/// The modulus chain and its NTT tables.
#[derive(Debug)]
pub struct RingContext {
    degree: usize,
    moduli: Vec<u64>,
    modulus_bits: Vec<u32>,
    tables: Vec<NttTable>,
}

impl RingContext {
    pub fn new(degree: usize, modulus_bits: &[u32]) -> Result<Self, BackendError> {
        let moduli = ntt_primes(modulus_bits, degree)?;
        let tables = moduli
            .iter()
            .map(|&q| NttTable::new(q, degree))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            degree,
            moduli,
            modulus_bits: modulus_bits.to_vec(),
            tables,
        })
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn moduli(&self) -> &[u64] {
        &self.moduli
    }

    pub fn modulus(&self, index: usize) -> u64 {
        self.moduli[index]
    }

    pub fn table(&self, index: usize) -> &NttTable {
        &self.tables[index]
    }

    /// Level of a polynomial holding every limb.
    pub fn max_level(&self) -> usize {
        self.moduli.len() - 1
    }

    /// Total bit size of `q_0 ⋯ q_level`.
    pub fn modulus_bits_at(&self, level: usize) -> u32 {
        self.modulus_bits[..=level].iter().sum()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
pub struct RnsPoly {
    limbs: Vec<Vec<u64>>,
}

impl RnsPoly {
    pub fn zero(ring: &RingContext, limb_count: usize) -> Self {
        Self {
            limbs: vec![vec![0; ring.degree()]; limb_count],
        }
    }

    /// Embeds small signed coefficients; missing trailing coefficients are zero.
    pub fn from_signed(ring: &RingContext, coeffs: &[i64], limb_count: usize) -> Self {
        let limbs = (0..limb_count)
            .map(|i| {
                let q = ring.modulus(i);
                let mut limb = vec![0u64; ring.degree()];
                for (slot, &c) in limb.iter_mut().zip(coeffs) {
                    *slot = reduce_signed(c as i128, q);
                }
                limb
            })
            .collect();
        Self { limbs }
    }

    /// Builds a polynomial whose limb `i` is produced by `fill(i, q_i)`.
    pub fn from_limbs_fn<F>(ring: &RingContext, limb_count: usize, mut fill: F) -> Self
    where
        F: FnMut(usize, u64) -> Vec<u64>,
    {
        let limbs = (0..limb_count).map(|i| fill(i, ring.modulus(i))).collect();
        Self { limbs }
    }

    pub(crate) fn from_raw_limbs(limbs: Vec<Vec<u64>>) -> Self {
        Self { limbs }
    }

    pub fn limb_count(&self) -> usize {
        self.limbs.len()
    }

    pub fn level(&self) -> usize {
        self.limbs.len().saturating_sub(1)
    }

    pub fn limbs(&self) -> &[Vec<u64>] {
        &self.limbs
    }

    pub fn limb(&self, index: usize) -> &[u64] {
        &self.limbs[index]
    }

    /// Checks the shape and canonical range of every residue.
    pub fn validate(&self, ring: &RingContext, expected_limbs: usize) -> Result<(), BackendError> {
        if self.limbs.len() != expected_limbs || expected_limbs > ring.moduli().len() {
            return Err(BackendError::Serialization(format!(
                "expected {expected_limbs} limbs, found {}",
                self.limbs.len()
            )));
        }
        for (i, limb) in self.limbs.iter().enumerate() {
            if limb.len() != ring.degree() {
                return Err(BackendError::Serialization(format!(
                    "limb {i} has {} coefficients, expected {}",
                    limb.len(),
                    ring.degree()
                )));
            }
            let q = ring.modulus(i);
            if limb.iter().any(|&c| c >= q) {
                return Err(BackendError::Serialization(format!(
                    "limb {i} holds a residue outside [0, q)"
                )));
            }
        }
        Ok(())
    }

    fn check_same_level(&self, other: &Self) -> Result<(), BackendError> {
        if self.limbs.len() != other.limbs.len() {
            return Err(BackendError::LevelMismatch {
                left: self.level(),
                right: other.level(),
            });
        }
        Ok(())
    }

    fn zip_with<F>(&self, other: &Self, ring: &RingContext, op: F) -> Result<Self, BackendError>
    where
        F: Fn(u64, u64, u64) -> u64,
    {
        self.check_same_level(other)?;
        let limbs = self
            .limbs
            .iter()
            .zip(&other.limbs)
            .enumerate()
            .map(|(i, (a, b))| {
                let q = ring.modulus(i);
                a.iter().zip(b).map(|(&x, &y)| op(x, y, q)).collect()
            })
            .collect();
        Ok(Self { limbs })
    }

    pub fn add(&self, other: &Self, ring: &RingContext) -> Result<Self, BackendError> {
        self.zip_with(other, ring, add_mod)
    }

    pub fn sub(&self, other: &Self, ring: &RingContext) -> Result<Self, BackendError> {
        self.zip_with(other, ring, sub_mod)
    }

    pub fn neg(&self, ring: &RingContext) -> Self {
        let limbs = self
            .limbs
            .iter()
            .enumerate()
            .map(|(i, limb)| {
                let q = ring.modulus(i);
                limb.iter().map(|&c| neg_mod(c, q)).collect()
            })
            .collect();
        Self { limbs }
    }

    /// Ring product, limb by limb through the NTT.
    pub fn mul(&self, other: &Self, ring: &RingContext) -> Result<Self, BackendError> {
        self.check_same_level(other)?;
        let limbs = self
            .limbs
            .iter()
            .zip(&other.limbs)
            .enumerate()
            .map(|(i, (a, b))| ring.table(i).multiply(a, b))
            .collect();
        Ok(Self { limbs })
    }

    /// Multiplies every coefficient by a (possibly large) signed integer.
    pub fn mul_integer(&self, factor: i128, ring: &RingContext) -> Self {
        let limbs = self
            .limbs
            .iter()
            .enumerate()
            .map(|(i, limb)| {
                let q = ring.modulus(i);
                let f = reduce_signed(factor, q);
                limb.iter().map(|&c| mul_mod(c, f, q)).collect()
            })
            .collect();
        Self { limbs }
    }

    /// `self · point + addend`, coefficient-wise.
    pub fn mul_scalar_add(
        &self,
        point: u64,
        addend: &Self,
        ring: &RingContext,
    ) -> Result<Self, BackendError> {
        self.zip_with(addend, ring, |x, y, q| add_mod(mul_mod(x, point % q, q), y, q))
    }

    /// Keeps the first `limb_count` limbs; the represented value is unchanged
    /// as long as it is small compared with the remaining modulus.
    pub fn truncated(&self, limb_count: usize) -> Self {
        Self {
            limbs: self.limbs[..limb_count.min(self.limbs.len())].to_vec(),
        }
    }

    /// Divides by the last prime with rounding and drops its limb.
    pub fn divide_by_last(&self, ring: &RingContext) -> Result<Self, BackendError> {
        let Some((last, rest)) = self.limbs.split_last() else {
            return Err(BackendError::Math("cannot rescale an empty polynomial"));
        };
        if rest.is_empty() {
            return Err(BackendError::RescaleUnavailable { level: 0 });
        }
        let q_last = ring.modulus(rest.len());
        let limbs = rest
            .iter()
            .enumerate()
            .map(|(i, limb)| {
                let q = ring.modulus(i);
                let q_last_inv = inv_mod(q_last % q, q)?;
                Ok(limb
                    .iter()
                    .zip(last)
                    .map(|(&c, &r)| {
                        let r = reduce_signed(center(r, q_last) as i128, q);
                        mul_mod(sub_mod(c, r, q), q_last_inv, q)
                    })
                    .collect())
            })
            .collect::<Result<Vec<_>, BackendError>>()?;
        Ok(Self { limbs })
    }

    /// Limb `index` lifted to signed coefficients.
    pub fn centered_limb(&self, ring: &RingContext, index: usize) -> Vec<i64> {
        let q = ring.modulus(index);
        self.limbs[index].iter().map(|&c| center(c, q)).collect()
    }
}
