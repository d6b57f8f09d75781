//! Homomorphic backend abstraction.
//!
//! This module defines the boundary between the aggregation/threshold logic
//! and the concrete approximate-arithmetic scheme. Everything above this
//! trait (scale bookkeeping, the weighted BFS, committee coordination,
//! decryption policy) is written against [`HomomorphicBackend`] only.
//!
//! # Architecture
//!
//! - **[`CiphertextMeta`]**: the metadata every ciphertext handle exposes
//!   (scale, level, packed value count)
//! - **[`HomomorphicBackend`]**: secret-key space operations used by the
//!   dealer, encryption, share-wise decryption and combination, the leveled
//!   arithmetic and the byte codecs
//!
//! # Available Backends
//!
//! - **[`RnsCkks`]**: reference CKKS over an RNS modulus chain with NTT
//!   multiplication and Shamir-shared secret keys
//!
//! # Contract
//!
//! - Ciphertexts are values: every operation returns a new ciphertext and
//!   never mutates its inputs.
//! - `rescale` fails with [`BackendError::RescaleUnavailable`] at level 0.
//! - `switch_level` only moves down and keeps the scale.
//! - `add` requires operands at the same level; it does not reconcile scales.
//! - `decode_ciphertext(encode_ciphertext(ct)) == ct`, and re-encoding an
//!   accepted byte string reproduces it exactly.
//!
//! # Example
//!
//! ```rust
//! use ivs_fhe::backend::{CiphertextMeta, HomomorphicBackend, RnsCkks};
//! use ivs_fhe::SchemeParameters;
//! use rand::SeedableRng;
//! use rand_chacha::ChaCha20Rng;
//!
//! let params = SchemeParameters::new(64, vec![60, 40, 60], 40).expect("params");
//! let backend = RnsCkks::new(params).expect("backend");
//! let mut rng = ChaCha20Rng::seed_from_u64(5);
//!
//! let secret = backend.sample_secret(&mut rng);
//! let key = backend.derive_public_key(&mut rng, &secret).expect("public key");
//! let ct = backend.encrypt(&mut rng, &[1.5], backend.default_scale(), &key).expect("encrypt");
//! assert_eq!(ct.level(), 2);
//!
//! let partial = backend.decrypt_share(&ct, &secret).expect("partial");
//! let values = backend.combine(&ct, &[(1, &partial)]).expect("combine");
//! assert!((values[0] - 1.5).abs() < 1e-6);
//! ```

use core::fmt::Debug;

use rand_core::{CryptoRng, RngCore};

use crate::config::SchemeParameters;
use crate::errors::BackendError;

mod rns_ckks;
pub use rns_ckks::{RnsCiphertext, RnsCkks, RnsPartial, RnsPublicKey, RnsSecret};

/// Metadata carried by every ciphertext handle.
pub trait CiphertextMeta {
    /// Encoding scale of the packed values.
    fn scale(&self) -> f64;

    /// Number of rescales still available.
    fn level(&self) -> usize;

    /// Number of packed values.
    fn slot_count(&self) -> usize;
}

/// A leveled approximate-arithmetic homomorphic scheme with threshold
/// decryption.
///
/// Backends are cheap to clone (shared ring context) so committee members
/// and worker tasks can each hold one.
pub trait HomomorphicBackend: Clone + Debug + Send + Sync + 'static {
    type Ciphertext: CiphertextMeta + Clone + Debug + Send + Sync + 'static;
    type PublicKey: Clone + Debug + Send + Sync + 'static;
    /// An element of the secret-key space: the master secret, a sharing
    /// polynomial coefficient, or one member's share.
    type Secret: Clone + Debug + Send + Sync + 'static;
    /// A partial decryption produced from one secret share.
    type Partial: Clone + Debug + Send + Sync + 'static;

    fn parameters(&self) -> &SchemeParameters;

    /// Level of a freshly encrypted ciphertext.
    fn max_level(&self) -> usize;

    /// Maximum number of values packed in one ciphertext.
    fn slot_capacity(&self) -> usize;

    fn default_scale(&self) -> f64 {
        self.parameters().scale()
    }

    /// The factor a rescale divides by when applied at `level`.
    fn rescale_divisor(&self, level: usize) -> Result<f64, BackendError>;

    /// Samples a master secret key.
    fn sample_secret<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Self::Secret;

    /// Samples a uniformly random element of the secret-key space, used as a
    /// non-constant coefficient of the sharing polynomial.
    fn sample_share_coefficient<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Self::Secret;

    /// Embeds an integer into the secret-key space.
    fn secret_from_scalar(&self, value: u64) -> Self::Secret;

    /// One Horner step of share evaluation: `acc · point + coefficient`.
    fn secret_horner_step(
        &self,
        acc: &Self::Secret,
        point: u64,
        coefficient: &Self::Secret,
    ) -> Result<Self::Secret, BackendError>;

    /// Derives the joint encryption key for a master secret.
    fn derive_public_key<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        secret: &Self::Secret,
    ) -> Result<Self::PublicKey, BackendError>;

    /// Encrypts `values` at `scale`.
    fn encrypt<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        values: &[f64],
        scale: f64,
        key: &Self::PublicKey,
    ) -> Result<Self::Ciphertext, BackendError>;

    /// Partial decryption of `ct` under one share of the secret key.
    fn decrypt_share(
        &self,
        ct: &Self::Ciphertext,
        share: &Self::Secret,
    ) -> Result<Self::Partial, BackendError>;

    /// Combines partials `(share index, partial)` into the packed values.
    /// The caller is responsible for passing a quorum of distinct shares.
    fn combine(
        &self,
        ct: &Self::Ciphertext,
        partials: &[(u64, &Self::Partial)],
    ) -> Result<Vec<f64>, BackendError>;

    fn add(&self, a: &Self::Ciphertext, b: &Self::Ciphertext) -> Result<Self::Ciphertext, BackendError>;

    /// Multiplies by the plaintext constant `value` encoded at `plain_scale`;
    /// the result scale is `ct.scale() · plain_scale`.
    fn multiply_plain(
        &self,
        ct: &Self::Ciphertext,
        value: f64,
        plain_scale: f64,
    ) -> Result<Self::Ciphertext, BackendError>;

    /// Multiplies by an exact integer; the result scale is `ct.scale() · factor`.
    fn multiply_integer(
        &self,
        ct: &Self::Ciphertext,
        factor: u64,
    ) -> Result<Self::Ciphertext, BackendError>;

    fn rescale(&self, ct: &Self::Ciphertext) -> Result<Self::Ciphertext, BackendError>;

    fn switch_level(
        &self,
        ct: &Self::Ciphertext,
        level: usize,
    ) -> Result<Self::Ciphertext, BackendError>;

    /// Relabels the scale without touching the ciphertext body.
    fn with_scale(&self, ct: &Self::Ciphertext, scale: f64) -> Self::Ciphertext;

    fn encode_ciphertext(&self, ct: &Self::Ciphertext) -> Result<Vec<u8>, BackendError>;
    fn decode_ciphertext(&self, bytes: &[u8]) -> Result<Self::Ciphertext, BackendError>;

    fn encode_public_key(&self, key: &Self::PublicKey) -> Result<Vec<u8>, BackendError>;
    fn decode_public_key(&self, bytes: &[u8]) -> Result<Self::PublicKey, BackendError>;

    fn encode_secret(&self, secret: &Self::Secret) -> Result<Vec<u8>, BackendError>;
    fn decode_secret(&self, bytes: &[u8]) -> Result<Self::Secret, BackendError>;

    fn encode_partial(&self, partial: &Self::Partial) -> Result<Vec<u8>, BackendError>;
    fn decode_partial(&self, bytes: &[u8]) -> Result<Self::Partial, BackendError>;
}
