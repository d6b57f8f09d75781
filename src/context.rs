//! Per-run scheme context.
//!
//! A [`SchemeContext`] pairs a backend (and therefore the scheme parameters)
//! with the joint encryption key produced by distributed key generation.
//! Every computation run constructs its own context and passes it explicitly;
//! there is no process-wide scheme state.

use rand_core::{CryptoRng, RngCore};
use tracing::{debug, instrument};

use crate::backend::{CiphertextMeta, HomomorphicBackend};
use crate::config::SchemeParameters;
use crate::errors::{BackendError, BatchOutcome, Error};
use crate::threshold::KeyShare;

// Relative slack for treating a scale ratio as a whole number.
const INTEGER_RATIO_EPSILON: f64 = 1e-9;

/// Ciphertext handle type of a backend.
pub type Ciphertext<B> = <B as HomomorphicBackend>::Ciphertext;

#[derive(Clone, Debug)]
pub struct SchemeContext<B: HomomorphicBackend> {
    backend: B,
    joint_key: B::PublicKey,
}

impl<B: HomomorphicBackend> SchemeContext<B> {
    pub fn new(backend: B, joint_key: B::PublicKey) -> Self {
        Self { backend, joint_key }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn joint_key(&self) -> &B::PublicKey {
        &self.joint_key
    }

    pub fn parameters(&self) -> &SchemeParameters {
        self.backend.parameters()
    }

    pub fn default_scale(&self) -> f64 {
        self.backend.default_scale()
    }

    /// Encrypts `values` under the joint key at the default scale.
    pub fn encrypt<R: RngCore + CryptoRng>(&self, rng: &mut R, values: &[f64]) -> Result<Ciphertext<B>, Error> {
        self.encrypt_at_scale(rng, values, self.default_scale())
    }

    pub fn encrypt_at_scale<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        values: &[f64],
        scale: f64,
    ) -> Result<Ciphertext<B>, Error> {
        Ok(self.backend.encrypt(rng, values, scale, &self.joint_key)?)
    }

    /// Encrypts one health vector per key; a failing item does not stop the rest.
    #[instrument(level = "info", skip_all)]
    pub fn encrypt_batch<K, R, I>(&self, rng: &mut R, items: I) -> BatchOutcome<K, Ciphertext<B>>
    where
        K: Ord,
        R: RngCore + CryptoRng,
        I: IntoIterator<Item = (K, Vec<f64>)>,
    {
        let outcome: BatchOutcome<K, Ciphertext<B>> = items
            .into_iter()
            .map(|(key, values)| {
                let result = self.encrypt(rng, &values);
                (key, result)
            })
            .collect();
        debug!(
            encrypted = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "batch encryption finished"
        );
        outcome
    }

    /// Partial decryption of `ct` with one committee member's share.
    pub fn decrypt_with_share(&self, ct: &Ciphertext<B>, share: &KeyShare<B>) -> Result<B::Partial, Error> {
        Ok(self.backend.decrypt_share(ct, share.secret())?)
    }

    /// Adds two ciphertexts that already agree on level and scale.
    pub fn add(&self, a: &Ciphertext<B>, b: &Ciphertext<B>) -> Result<Ciphertext<B>, Error> {
        Ok(self.backend.add(a, b)?)
    }

    pub fn multiply_by_plain(&self, ct: &Ciphertext<B>, value: f64, plain_scale: f64) -> Result<Ciphertext<B>, Error> {
        Ok(self.backend.multiply_plain(ct, value, plain_scale)?)
    }

    pub fn rescale(&self, ct: &Ciphertext<B>) -> Result<Ciphertext<B>, Error> {
        Ok(self.backend.rescale(ct)?)
    }

    pub fn switch_level(&self, ct: &Ciphertext<B>, level: usize) -> Result<Ciphertext<B>, Error> {
        Ok(self.backend.switch_level(ct, level)?)
    }

    /// Brings `ct` to `target` scale.
    ///
    /// Shrinking multiplies by `target / scale` encoded at the next rescale
    /// divisor and rescales, which costs one level and fails with
    /// [`BackendError::RescaleUnavailable`] at the floor. Growing multiplies
    /// by `target / scale`, which must be an integer, and keeps the level.
    pub fn match_scale(&self, ct: &Ciphertext<B>, target: f64) -> Result<Ciphertext<B>, Error> {
        if !(target.is_finite() && target > 0.0) {
            return Err(Error::MalformedInput(format!("invalid target scale {target}")));
        }
        let ratio = target / ct.scale();
        let adjusted = if ratio < 1.0 {
            let divisor = self.backend.rescale_divisor(ct.level())?;
            let product = self.backend.multiply_plain(ct, ratio, divisor)?;
            self.backend.rescale(&product)?
        } else {
            let factor = ratio.round();
            if factor > u64::MAX as f64 {
                return Err(Error::Backend(BackendError::Math("scale ratio too large")));
            }
            if (ratio - factor).abs() > INTEGER_RATIO_EPSILON * ratio {
                return Err(Error::Backend(BackendError::Math("scale ratio is not an integer")));
            }
            self.backend.multiply_integer(ct, factor as u64)?
        };
        Ok(self.backend.with_scale(&adjusted, target))
    }

    pub fn serialize(&self, ct: &Ciphertext<B>) -> Result<Vec<u8>, Error> {
        Ok(self.backend.encode_ciphertext(ct)?)
    }

    /// Decodes a ciphertext; malformed input maps to [`Error::Deserialization`].
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Ciphertext<B>, Error> {
        self.backend
            .decode_ciphertext(bytes)
            .map_err(|err| Error::Deserialization(err.to_string()))
    }
}
