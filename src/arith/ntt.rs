//! Negacyclic number-theoretic transform.
//!
//! Multiplication in `Z_q[X]/(X^n + 1)` is done by twisting coefficients with
//! powers of a primitive `2n`-th root of unity `ψ`, running a cyclic NTT with
//! `ω = ψ²`, multiplying pointwise and undoing both steps.

use crate::arith::modular::{add_mod, inv_mod, mul_mod, pow_mod, sub_mod};
use crate::errors::BackendError;

/// Precomputed twiddle factors for one prime.
#[derive(Clone, Debug)]
pub struct NttTable {
    modulus: u64,
    degree: usize,
    psi_powers: Vec<u64>,
    psi_inv_powers: Vec<u64>,
    root_powers: Vec<u64>,
    root_inv_powers: Vec<u64>,
    degree_inv: u64,
}

impl NttTable {
    pub fn new(modulus: u64, degree: usize) -> Result<Self, BackendError> {
        if !degree.is_power_of_two() || degree < 2 {
            return Err(BackendError::UnsupportedParameters(format!(
                "ring dimension {degree} is not a power of two"
            )));
        }
        if (modulus - 1) % (2 * degree as u64) != 0 {
            return Err(BackendError::Math("modulus is not congruent to 1 mod 2n"));
        }
        let psi = primitive_root(modulus, degree)?;
        let psi_inv = inv_mod(psi, modulus)?;
        let omega = mul_mod(psi, psi, modulus);
        let omega_inv = mul_mod(psi_inv, psi_inv, modulus);

        Ok(Self {
            modulus,
            degree,
            psi_powers: powers(psi, degree, modulus),
            psi_inv_powers: powers(psi_inv, degree, modulus),
            root_powers: powers(omega, degree / 2, modulus),
            root_inv_powers: powers(omega_inv, degree / 2, modulus),
            degree_inv: inv_mod(degree as u64, modulus)?,
        })
    }

    pub fn modulus(&self) -> u64 {
        self.modulus
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Coefficients to evaluations, in place.
    pub fn forward(&self, values: &mut [u64]) {
        let q = self.modulus;
        for (value, &twist) in values.iter_mut().zip(&self.psi_powers) {
            *value = mul_mod(*value, twist, q);
        }
        self.transform(values, &self.root_powers);
    }

    /// Evaluations to coefficients, in place.
    pub fn inverse(&self, values: &mut [u64]) {
        let q = self.modulus;
        self.transform(values, &self.root_inv_powers);
        for (value, &twist) in values.iter_mut().zip(&self.psi_inv_powers) {
            *value = mul_mod(mul_mod(*value, self.degree_inv, q), twist, q);
        }
    }

    /// Negacyclic product of two coefficient vectors.
    pub fn multiply(&self, a: &[u64], b: &[u64]) -> Vec<u64> {
        let q = self.modulus;
        let mut fa = a.to_vec();
        let mut fb = b.to_vec();
        self.forward(&mut fa);
        self.forward(&mut fb);
        for (x, y) in fa.iter_mut().zip(&fb) {
            *x = mul_mod(*x, *y, q);
        }
        self.inverse(&mut fa);
        fa
    }

    // iterative Cooley-Tukey over bit-reversed input; roots[k] = ω^k, k < n/2
    fn transform(&self, values: &mut [u64], roots: &[u64]) {
        let n = self.degree;
        let q = self.modulus;
        bit_reverse(values);
        let mut len = 2;
        while len <= n {
            let half = len / 2;
            let stride = n / len;
            for start in (0..n).step_by(len) {
                for k in 0..half {
                    let w = roots[k * stride];
                    let u = values[start + k];
                    let v = mul_mod(values[start + k + half], w, q);
                    values[start + k] = add_mod(u, v, q);
                    values[start + k + half] = sub_mod(u, v, q);
                }
            }
            len <<= 1;
        }
    }
}

fn powers(base: u64, count: usize, q: u64) -> Vec<u64> {
    let mut out = Vec::with_capacity(count);
    let mut acc = 1 % q;
    for _ in 0..count {
        out.push(acc);
        acc = mul_mod(acc, base, q);
    }
    out
}

/// Finds ψ with ψ^n ≡ −1, i.e. a primitive `2n`-th root of unity.
fn primitive_root(q: u64, n: usize) -> Result<u64, BackendError> {
    let exponent = (q - 1) / (2 * n as u64);
    for g in 2..q.min(1 << 16) {
        let psi = pow_mod(g, exponent, q);
        if pow_mod(psi, n as u64, q) == q - 1 {
            return Ok(psi);
        }
    }
    Err(BackendError::Math("no primitive 2n-th root of unity found"))
}

fn bit_reverse(values: &mut [u64]) {
    let n = values.len();
    let mut j = 0;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            values.swap(i, j);
        }
    }
}
