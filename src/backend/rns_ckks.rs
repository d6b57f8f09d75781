//! Reference CKKS backend over an RNS modulus chain.
//!
//! Values are packed into polynomial coefficients (up to `n` per ciphertext)
//! scaled by the encoding scale. A ciphertext `(c0, c1)` decrypts as
//! `c0 + c1·s ≈ m`. The secret `s` is never held by one party after key
//! generation: each committee member holds a Shamir share `s_j` (per
//! coefficient, per prime), contributes `d_j = c1·s_j mod q_0`, and the
//! combiner computes `c0 + Σ λ_j d_j mod q_0`.
//!
//! Partial decryptions are exact: no smudging noise is added to `d_j`, so
//! this backend assumes partials are only revealed to the combiner.

use core::fmt;
use std::sync::Arc;

use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use zeroize::Zeroize;

use crate::arith::modular::{add_mod, center, mul_mod};
use crate::arith::sampling::{self, ERROR_STDDEV};
use crate::arith::{RingContext, RnsPoly, lagrange_weights_at_zero};
use crate::backend::{CiphertextMeta, HomomorphicBackend};
use crate::config::SchemeParameters;
use crate::errors::BackendError;
use crate::serde_impl::{self, ArtifactKind};

/// Bits kept free above the scale at every level.
const HEADROOM_BITS: f64 = 2.0;
/// Encoded coefficients must fit comfortably in an `i64`.
const MAX_ENCODED_MAGNITUDE: f64 = 9.0e18;
/// Plaintext factors are applied as `i128` integers.
const MAX_PLAIN_FACTOR: f64 = 1.0e30;

#[derive(Clone, Debug)]
pub struct RnsCkks {
    params: SchemeParameters,
    ring: Arc<RingContext>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RnsCiphertext {
    c0: RnsPoly,
    c1: RnsPoly,
    scale: f64,
    slots: usize,
}

impl CiphertextMeta for RnsCiphertext {
    fn scale(&self) -> f64 {
        self.scale
    }

    fn level(&self) -> usize {
        self.c0.level()
    }

    fn slot_count(&self) -> usize {
        self.slots
    }
}

/// Joint encryption key `(b, a)` with `b = −(a·s + e)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RnsPublicKey {
    b: RnsPoly,
    a: RnsPoly,
}

/// Element of the secret-key space, zeroized on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RnsSecret {
    poly: RnsPoly,
}

impl fmt::Debug for RnsSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RnsSecret")
            .field("limbs", &self.poly.limb_count())
            .finish_non_exhaustive()
    }
}

impl Drop for RnsSecret {
    fn drop(&mut self) {
        self.poly.zeroize();
    }
}

/// `c1 · s_j mod q_0` for one share.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RnsPartial {
    share: RnsPoly,
}

impl RnsCkks {
    pub fn new(params: SchemeParameters) -> Result<Self, BackendError> {
        params
            .validate()
            .map_err(|err| BackendError::UnsupportedParameters(err.to_string()))?;
        let ring = RingContext::new(params.ring_dimension, &params.modulus_bits)?;
        Ok(Self {
            params,
            ring: Arc::new(ring),
        })
    }

    pub fn ring(&self) -> &RingContext {
        &self.ring
    }

    fn full_limbs(&self) -> usize {
        self.ring.max_level() + 1
    }

    fn check_headroom(&self, scale: f64, level: usize) -> Result<(), BackendError> {
        let scale_bits = scale.log2();
        let modulus_bits = self.ring.modulus_bits_at(level);
        if !scale.is_finite() || scale <= 0.0 || scale_bits + HEADROOM_BITS >= modulus_bits as f64 {
            return Err(BackendError::ScaleOverflow {
                scale_bits,
                modulus_bits,
            });
        }
        Ok(())
    }

    fn small_poly(&self, coeffs: &[i64], limbs: usize) -> RnsPoly {
        RnsPoly::from_signed(&self.ring, coeffs, limbs)
    }

    fn validate_ciphertext(&self, ct: &RnsCiphertext) -> Result<(), BackendError> {
        let limbs = ct.c0.limb_count();
        if limbs == 0 || limbs > self.full_limbs() {
            return Err(BackendError::Serialization(format!(
                "ciphertext carries {limbs} limbs, chain has {}",
                self.full_limbs()
            )));
        }
        ct.c0.validate(&self.ring, limbs)?;
        ct.c1.validate(&self.ring, limbs)?;
        if !ct.scale.is_finite() || ct.scale <= 0.0 {
            return Err(BackendError::Serialization("ciphertext scale is not positive".into()));
        }
        if ct.slots > self.ring.degree() {
            return Err(BackendError::Serialization(format!(
                "ciphertext claims {} slots, capacity is {}",
                ct.slots,
                self.ring.degree()
            )));
        }
        Ok(())
    }
}

impl HomomorphicBackend for RnsCkks {
    type Ciphertext = RnsCiphertext;
    type PublicKey = RnsPublicKey;
    type Secret = RnsSecret;
    type Partial = RnsPartial;

    fn parameters(&self) -> &SchemeParameters {
        &self.params
    }

    fn max_level(&self) -> usize {
        self.ring.max_level()
    }

    fn slot_capacity(&self) -> usize {
        self.ring.degree()
    }

    fn rescale_divisor(&self, level: usize) -> Result<f64, BackendError> {
        if level == 0 || level > self.ring.max_level() {
            return Err(BackendError::RescaleUnavailable { level });
        }
        Ok(self.ring.modulus(level) as f64)
    }

    fn sample_secret<R: RngCore + CryptoRng>(&self, rng: &mut R) -> RnsSecret {
        let coeffs = sampling::ternary(rng, self.ring.degree());
        RnsSecret {
            poly: self.small_poly(&coeffs, self.full_limbs()),
        }
    }

    fn sample_share_coefficient<R: RngCore + CryptoRng>(&self, rng: &mut R) -> RnsSecret {
        RnsSecret {
            poly: sampling::uniform(rng, &self.ring, self.full_limbs()),
        }
    }

    fn secret_from_scalar(&self, value: u64) -> RnsSecret {
        let n = self.ring.degree();
        RnsSecret {
            poly: RnsPoly::from_limbs_fn(&self.ring, self.full_limbs(), |_, q| vec![value % q; n]),
        }
    }

    fn secret_horner_step(
        &self,
        acc: &RnsSecret,
        point: u64,
        coefficient: &RnsSecret,
    ) -> Result<RnsSecret, BackendError> {
        Ok(RnsSecret {
            poly: acc.poly.mul_scalar_add(point, &coefficient.poly, &self.ring)?,
        })
    }

    #[instrument(level = "debug", skip_all)]
    fn derive_public_key<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        secret: &RnsSecret,
    ) -> Result<RnsPublicKey, BackendError> {
        let limbs = self.full_limbs();
        let a = sampling::uniform(rng, &self.ring, limbs);
        let e = self.small_poly(&sampling::gaussian(rng, self.ring.degree(), ERROR_STDDEV), limbs);
        let b = a.mul(&secret.poly, &self.ring)?.add(&e, &self.ring)?.neg(&self.ring);
        Ok(RnsPublicKey { b, a })
    }

    fn encrypt<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        values: &[f64],
        scale: f64,
        key: &RnsPublicKey,
    ) -> Result<RnsCiphertext, BackendError> {
        let n = self.ring.degree();
        if values.len() > n {
            return Err(BackendError::CapacityExceeded {
                capacity: n,
                provided: values.len(),
            });
        }
        let level = self.ring.max_level();
        self.check_headroom(scale, level)?;
        let coeffs = values
            .iter()
            .map(|&v| {
                let scaled = (v * scale).round();
                if !scaled.is_finite() || scaled.abs() >= MAX_ENCODED_MAGNITUDE {
                    return Err(BackendError::Math("value cannot be encoded at this scale"));
                }
                Ok(scaled as i64)
            })
            .collect::<Result<Vec<i64>, _>>()?;

        let limbs = level + 1;
        let message = self.small_poly(&coeffs, limbs);
        let u = self.small_poly(&sampling::ternary(rng, n), limbs);
        let e0 = self.small_poly(&sampling::gaussian(rng, n, ERROR_STDDEV), limbs);
        let e1 = self.small_poly(&sampling::gaussian(rng, n, ERROR_STDDEV), limbs);

        let c0 = key
            .b
            .mul(&u, &self.ring)?
            .add(&e0, &self.ring)?
            .add(&message, &self.ring)?;
        let c1 = key.a.mul(&u, &self.ring)?.add(&e1, &self.ring)?;
        Ok(RnsCiphertext {
            c0,
            c1,
            scale,
            slots: values.len(),
        })
    }

    fn decrypt_share(&self, ct: &RnsCiphertext, share: &RnsSecret) -> Result<RnsPartial, BackendError> {
        if share.poly.limb_count() != self.full_limbs() {
            return Err(BackendError::Math("secret share does not span the modulus chain"));
        }
        let c1 = ct.c1.truncated(1);
        let s = share.poly.truncated(1);
        Ok(RnsPartial {
            share: c1.mul(&s, &self.ring)?,
        })
    }

    #[instrument(level = "debug", skip_all, fields(partials = partials.len()))]
    fn combine(&self, ct: &RnsCiphertext, partials: &[(u64, &RnsPartial)]) -> Result<Vec<f64>, BackendError> {
        if partials.is_empty() {
            return Err(BackendError::Math("no partial decryptions to combine"));
        }
        let q = self.ring.modulus(0);
        let n = self.ring.degree();
        let indices: Vec<u64> = partials.iter().map(|(index, _)| *index).collect();
        let weights = lagrange_weights_at_zero(&indices, q)?;

        let mut acc = ct.c0.limb(0).to_vec();
        for ((_, partial), &weight) in partials.iter().zip(&weights) {
            if partial.share.limb_count() != 1 || partial.share.limb(0).len() != n {
                return Err(BackendError::Math("partial decryption has the wrong shape"));
            }
            for (slot, &d) in acc.iter_mut().zip(partial.share.limb(0)) {
                *slot = add_mod(*slot, mul_mod(d, weight, q), q);
            }
        }
        Ok(acc
            .iter()
            .take(ct.slots)
            .map(|&c| center(c, q) as f64 / ct.scale)
            .collect())
    }

    fn add(&self, a: &RnsCiphertext, b: &RnsCiphertext) -> Result<RnsCiphertext, BackendError> {
        Ok(RnsCiphertext {
            c0: a.c0.add(&b.c0, &self.ring)?,
            c1: a.c1.add(&b.c1, &self.ring)?,
            scale: a.scale,
            slots: a.slots.max(b.slots),
        })
    }

    fn multiply_plain(
        &self,
        ct: &RnsCiphertext,
        value: f64,
        plain_scale: f64,
    ) -> Result<RnsCiphertext, BackendError> {
        let factor = (value * plain_scale).round();
        if !factor.is_finite() || factor.abs() >= MAX_PLAIN_FACTOR {
            return Err(BackendError::Math("plaintext factor out of range"));
        }
        let scale = ct.scale * plain_scale;
        self.check_headroom(scale, ct.level())?;
        let factor = factor as i128;
        Ok(RnsCiphertext {
            c0: ct.c0.mul_integer(factor, &self.ring),
            c1: ct.c1.mul_integer(factor, &self.ring),
            scale,
            slots: ct.slots,
        })
    }

    fn multiply_integer(&self, ct: &RnsCiphertext, factor: u64) -> Result<RnsCiphertext, BackendError> {
        let scale = ct.scale * factor as f64;
        self.check_headroom(scale, ct.level())?;
        Ok(RnsCiphertext {
            c0: ct.c0.mul_integer(factor as i128, &self.ring),
            c1: ct.c1.mul_integer(factor as i128, &self.ring),
            scale,
            slots: ct.slots,
        })
    }

    fn rescale(&self, ct: &RnsCiphertext) -> Result<RnsCiphertext, BackendError> {
        let divisor = self.rescale_divisor(ct.level())?;
        Ok(RnsCiphertext {
            c0: ct.c0.divide_by_last(&self.ring)?,
            c1: ct.c1.divide_by_last(&self.ring)?,
            scale: ct.scale / divisor,
            slots: ct.slots,
        })
    }

    fn switch_level(&self, ct: &RnsCiphertext, level: usize) -> Result<RnsCiphertext, BackendError> {
        if level > ct.level() {
            return Err(BackendError::LevelUnreachable {
                current: ct.level(),
                target: level,
            });
        }
        Ok(RnsCiphertext {
            c0: ct.c0.truncated(level + 1),
            c1: ct.c1.truncated(level + 1),
            scale: ct.scale,
            slots: ct.slots,
        })
    }

    fn with_scale(&self, ct: &RnsCiphertext, scale: f64) -> RnsCiphertext {
        RnsCiphertext {
            scale,
            ..ct.clone()
        }
    }

    fn encode_ciphertext(&self, ct: &RnsCiphertext) -> Result<Vec<u8>, BackendError> {
        serde_impl::encode(ArtifactKind::Ciphertext, ct)
    }

    fn decode_ciphertext(&self, bytes: &[u8]) -> Result<RnsCiphertext, BackendError> {
        let ct: RnsCiphertext = serde_impl::decode(ArtifactKind::Ciphertext, bytes)?;
        self.validate_ciphertext(&ct)?;
        Ok(ct)
    }

    fn encode_public_key(&self, key: &RnsPublicKey) -> Result<Vec<u8>, BackendError> {
        serde_impl::encode(ArtifactKind::PublicKey, key)
    }

    fn decode_public_key(&self, bytes: &[u8]) -> Result<RnsPublicKey, BackendError> {
        let key: RnsPublicKey = serde_impl::decode(ArtifactKind::PublicKey, bytes)?;
        key.b.validate(&self.ring, self.full_limbs())?;
        key.a.validate(&self.ring, self.full_limbs())?;
        Ok(key)
    }

    fn encode_secret(&self, secret: &RnsSecret) -> Result<Vec<u8>, BackendError> {
        serde_impl::encode(ArtifactKind::Secret, secret)
    }

    fn decode_secret(&self, bytes: &[u8]) -> Result<RnsSecret, BackendError> {
        let secret: RnsSecret = serde_impl::decode(ArtifactKind::Secret, bytes)?;
        secret.poly.validate(&self.ring, self.full_limbs())?;
        Ok(secret)
    }

    fn encode_partial(&self, partial: &RnsPartial) -> Result<Vec<u8>, BackendError> {
        serde_impl::encode(ArtifactKind::Partial, partial)
    }

    fn decode_partial(&self, bytes: &[u8]) -> Result<RnsPartial, BackendError> {
        let partial: RnsPartial = serde_impl::decode(ArtifactKind::Partial, bytes)?;
        partial.share.validate(&self.ring, 1)?;
        Ok(partial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn backend(bits: Vec<u32>) -> RnsCkks {
        RnsCkks::new(SchemeParameters::new(256, bits, 40).expect("params")).expect("backend")
    }

    fn keys(backend: &RnsCkks, rng: &mut StdRng) -> (RnsSecret, RnsPublicKey) {
        let secret = backend.sample_secret(rng);
        let key = backend.derive_public_key(rng, &secret).expect("public key");
        (secret, key)
    }

    fn decrypt(backend: &RnsCkks, ct: &RnsCiphertext, secret: &RnsSecret) -> Vec<f64> {
        let partial = backend.decrypt_share(ct, secret).expect("partial");
        backend.combine(ct, &[(1, &partial)]).expect("combine")
    }

    fn assert_close(actual: &[f64], expected: &[f64], tolerance: f64) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < tolerance, "{a} vs {e}");
        }
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let backend = backend(vec![60, 40, 60]);
        let mut rng = StdRng::seed_from_u64(1);
        let (secret, key) = keys(&backend, &mut rng);
        let values = [0.0, 1.0, -2.5, 0.125, 3.75];
        let ct = backend
            .encrypt(&mut rng, &values, backend.default_scale(), &key)
            .expect("encrypt");
        assert_eq!(ct.level(), 2);
        assert_eq!(ct.slot_count(), 5);
        assert_close(&decrypt(&backend, &ct, &secret), &values, 1e-6);
    }

    #[test]
    fn leveled_arithmetic_tracks_scale() {
        let backend = backend(vec![60, 40, 40, 60]);
        let mut rng = StdRng::seed_from_u64(2);
        let (secret, key) = keys(&backend, &mut rng);
        let scale = backend.default_scale();
        let a = backend.encrypt(&mut rng, &[1.0, 2.0], scale, &key).expect("encrypt");
        let b = backend.encrypt(&mut rng, &[0.5, -1.0], scale, &key).expect("encrypt");

        let sum = backend.add(&a, &b).expect("add");
        assert_close(&decrypt(&backend, &sum, &secret), &[1.5, 1.0], 1e-6);

        let divisor = backend.rescale_divisor(a.level()).expect("divisor");
        let product = backend.multiply_plain(&a, 0.25, divisor).expect("multiply");
        let rescaled = backend.rescale(&product).expect("rescale");
        assert_eq!(rescaled.level(), a.level() - 1);
        assert!((rescaled.scale() / scale - 1.0).abs() < 1e-12);
        assert_close(&decrypt(&backend, &rescaled, &secret), &[0.25, 0.5], 1e-6);

        let lifted = backend.multiply_integer(&b, 3).expect("integer");
        assert_eq!(lifted.scale(), 3.0 * scale);
        assert_close(&decrypt(&backend, &lifted, &secret), &[0.5, -1.0], 1e-6);
    }

    #[test]
    fn level_boundaries_are_enforced() {
        let backend = backend(vec![60, 40]);
        let mut rng = StdRng::seed_from_u64(3);
        let (_, key) = keys(&backend, &mut rng);
        let ct = backend
            .encrypt(&mut rng, &[1.0], backend.default_scale(), &key)
            .expect("encrypt");
        let floor = backend.switch_level(&ct, 0).expect("switch down");
        assert_eq!(floor.scale(), ct.scale());
        assert!(matches!(
            backend.rescale(&floor),
            Err(BackendError::RescaleUnavailable { level: 0 })
        ));
        assert!(matches!(
            backend.switch_level(&floor, 1),
            Err(BackendError::LevelUnreachable { current: 0, target: 1 })
        ));
        assert!(matches!(
            backend.add(&ct, &floor),
            Err(BackendError::LevelMismatch { .. })
        ));
    }

    #[test]
    fn scale_overflow_is_detected() {
        let backend = backend(vec![60, 40]);
        let mut rng = StdRng::seed_from_u64(4);
        let (_, key) = keys(&backend, &mut rng);
        let ct = backend
            .encrypt(&mut rng, &[1.0], backend.default_scale(), &key)
            .expect("encrypt");
        let floor = backend.switch_level(&ct, 0).expect("switch down");
        assert!(matches!(
            backend.multiply_plain(&floor, 0.5, 2f64.powi(30)),
            Err(BackendError::ScaleOverflow { .. })
        ));
        assert!(backend.multiply_plain(&floor, 0.5, 2f64.powi(12)).is_ok());
    }

    #[test]
    fn shamir_shares_combine_to_plaintext() {
        let backend = backend(vec![60, 40, 60]);
        let mut rng = StdRng::seed_from_u64(5);
        let (secret, key) = keys(&backend, &mut rng);
        // 2-of-3: f(x) = s + a·x
        let coefficient = backend.sample_share_coefficient(&mut rng);
        let shares: Vec<RnsSecret> = (1..=3u64)
            .map(|j| backend.secret_horner_step(&coefficient, j, &secret).expect("share"))
            .collect();
        let ct = backend
            .encrypt(&mut rng, &[0.625, 0.25], backend.default_scale(), &key)
            .expect("encrypt");
        let partials: Vec<RnsPartial> = shares
            .iter()
            .map(|s| backend.decrypt_share(&ct, s).expect("partial"))
            .collect();

        for (i, j) in [(0usize, 1usize), (0, 2), (1, 2)] {
            let values = backend
                .combine(&ct, &[(i as u64 + 1, &partials[i]), (j as u64 + 1, &partials[j])])
                .expect("combine");
            assert_close(&values, &[0.625, 0.25], 1e-6);
        }
        // a single share of a degree-1 polynomial reconstructs garbage
        let lone = backend.combine(&ct, &[(1, &partials[0])]).expect("combine");
        assert!((lone[0] - 0.625).abs() > 1.0);
    }

    #[test]
    fn codecs_roundtrip_and_validate() {
        let backend = backend(vec![60, 40, 60]);
        let mut rng = StdRng::seed_from_u64(6);
        let (secret, key) = keys(&backend, &mut rng);
        let ct = backend
            .encrypt(&mut rng, &[0.5], backend.default_scale(), &key)
            .expect("encrypt");

        let bytes = backend.encode_ciphertext(&ct).expect("encode");
        let decoded = backend.decode_ciphertext(&bytes).expect("decode");
        assert_eq!(decoded, ct);
        assert_eq!(backend.encode_ciphertext(&decoded).expect("encode"), bytes);

        let key_bytes = backend.encode_public_key(&key).expect("encode key");
        assert_eq!(backend.decode_public_key(&key_bytes).expect("decode key"), key);
        let secret_bytes = backend.encode_secret(&secret).expect("encode secret");
        assert_eq!(backend.decode_secret(&secret_bytes).expect("decode secret"), secret);

        assert!(backend.decode_ciphertext(&key_bytes).is_err());
        assert!(backend.decode_ciphertext(&bytes[..bytes.len() - 8]).is_err());

        let other = RnsCkks::new(SchemeParameters::new(128, vec![60, 40, 60], 40).expect("params"))
            .expect("backend");
        assert!(other.decode_ciphertext(&bytes).is_err());
    }
}
