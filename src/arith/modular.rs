//! Word-sized modular arithmetic over primes below `2^61`.
//!
//! Residues are kept in canonical form `[0, q)`. Products go through `u128`
//! so no Montgomery or Barrett state is needed.

use crate::errors::BackendError;

#[inline]
pub fn add_mod(a: u64, b: u64, q: u64) -> u64 {
    let sum = a + b;
    if sum >= q { sum - q } else { sum }
}

#[inline]
pub fn sub_mod(a: u64, b: u64, q: u64) -> u64 {
    if a >= b { a - b } else { a + q - b }
}

#[inline]
pub fn neg_mod(a: u64, q: u64) -> u64 {
    if a == 0 { 0 } else { q - a }
}

#[inline]
pub fn mul_mod(a: u64, b: u64, q: u64) -> u64 {
    ((a as u128 * b as u128) % q as u128) as u64
}

pub fn pow_mod(base: u64, mut exp: u64, q: u64) -> u64 {
    let mut acc = 1 % q;
    let mut base = base % q;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = mul_mod(acc, base, q);
        }
        base = mul_mod(base, base, q);
        exp >>= 1;
    }
    acc
}

/// Multiplicative inverse modulo a prime `q`.
pub fn inv_mod(a: u64, q: u64) -> Result<u64, BackendError> {
    let a = a % q;
    if a == 0 {
        return Err(BackendError::Math("zero has no modular inverse"));
    }
    Ok(pow_mod(a, q - 2, q))
}

/// Maps a signed integer to its canonical residue.
#[inline]
pub fn reduce_signed(value: i128, q: u64) -> u64 {
    value.rem_euclid(q as i128) as u64
}

/// Lifts a residue to the symmetric range `(-q/2, q/2]`.
#[inline]
pub fn center(value: u64, q: u64) -> i64 {
    if value > q / 2 {
        value as i64 - q as i64
    } else {
        value as i64
    }
}

const WITNESSES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

/// Deterministic Miller-Rabin, exact for every 64-bit input.
pub fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    for p in WITNESSES {
        if n % p == 0 {
            return n == p;
        }
    }
    let mut d = n - 1;
    let mut rounds = 0;
    while d % 2 == 0 {
        d /= 2;
        rounds += 1;
    }
    'witness: for a in WITNESSES {
        let mut x = pow_mod(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..rounds {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Generates one distinct prime `q ≡ 1 (mod 2n)` per requested bit size,
/// each the largest such prime below `2^bits` not already taken.
pub fn ntt_primes(bit_sizes: &[u32], ring_dimension: usize) -> Result<Vec<u64>, BackendError> {
    let step = 2 * ring_dimension as u64;
    let mut primes: Vec<u64> = Vec::with_capacity(bit_sizes.len());
    for &bits in bit_sizes {
        if bits > 61 || (1u64 << bits) <= 2 * step {
            return Err(BackendError::UnsupportedParameters(format!(
                "no NTT-friendly {bits}-bit primes for ring dimension {ring_dimension}"
            )));
        }
        let lower = 1u64 << (bits - 1);
        let mut candidate = (1u64 << bits) - step + 1;
        loop {
            if candidate <= lower {
                return Err(BackendError::UnsupportedParameters(format!(
                    "ran out of {bits}-bit NTT-friendly primes"
                )));
            }
            if !primes.contains(&candidate) && is_prime(candidate) {
                primes.push(candidate);
                break;
            }
            candidate -= step;
        }
    }
    Ok(primes)
}
