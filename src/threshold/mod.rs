//! T-of-N threshold key management and decryption.
//!
//! # Protocol Overview
//!
//! 1. **Key Generation** ([`ThresholdKeyCoordinator::generate_keys`]): a
//!    dealer samples the master secret, derives the joint public key and hands
//!    member `i` the evaluation at `i` of a random degree-`T−1` polynomial
//!    whose constant term is the master secret.
//!
//! 2. **Partial Decryption** ([`KeyShare::partial_decrypt`]): each member
//!    decrypts with its share and optionally attaches a [`PartialProof`]
//!    binding the partial to the ciphertext.
//!
//! 3. **Collection** ([`collect_partials`]): partials are requested
//!    concurrently from [`PartialDecryptionSource`]s, failed members are
//!    replaced, and the round is bounded by a deadline.
//!
//! 4. **Combination** ([`ThresholdDecryptor::combine`]): `T` verified partials
//!    (or all `N` under a `requires_all_shares` policy) are combined with
//!    Lagrange weights at zero.
//!
//! [`ThresholdDecryptor::decrypt`] runs steps 2 to 4 behind the artifact's
//! [`DecryptionPolicy`](crate::policy::DecryptionPolicy).
//!
//! No noise flooding is added to partials, so a partial can leak information
//! about its share across many decryptions. Deployments that publish partials
//! need a smudging backend.

mod collect;
mod coordinator;
pub(crate) mod decryptor;
mod keys;

pub use collect::{CollectionReport, LocalMember, PartialDecryptionSource, collect_partials};
pub use coordinator::ThresholdKeyCoordinator;
pub use decryptor::{
    DecryptionOutcome, DecryptionRequest, DecryptionStage, PartialDecryption, PartialProof,
    ThresholdDecryptor,
};
pub use keys::{CommitteeMember, KeyGenOutput, KeyShare};
