//! # ivs-fhe: encrypted Individual Vulnerability Scores
//!
//! Computes, for every user of a contact graph, a distance-weighted sum of the
//! encrypted health values of the users around them, without ever decrypting
//! an individual's health. Scores are released only through a T-of-N
//! threshold decryption gated by a per-artifact policy.
//!
//! ## Overview
//!
//! For a source user `s` and one disease,
//!
//! ```text
//! IVS[s] = Σ_{d = 0..Dmax} Σ_{u at BFS depth d from s} 2^-(d+1) · health[u]
//! ```
//!
//! Health values are CKKS ciphertexts under a joint key whose secret is
//! Shamir-shared across a committee. Graph structure and weights are public.
//! Per-disease scores can be summed into a cross-disease total per user.
//!
//! ## Architecture
//!
//! - **[`backend`]**: the [`HomomorphicBackend`](backend::HomomorphicBackend)
//!   trait and the reference RNS-CKKS implementation
//! - **[`arith`]**: modular arithmetic, negacyclic NTT and RNS polynomials
//! - **[`context`]**: the per-run [`SchemeContext`]
//! - **[`scale`]**: scale/level bookkeeping for leveled arithmetic
//! - **[`graph`]** and **[`aggregator`]**: contact graphs and the weighted BFS
//! - **[`threshold`]**: key generation, partial decryption, collection and
//!   combination
//! - **[`policy`]**: decryption policies and audit events
//! - **[`storage`]** and **[`jobs`]**: blob storage glue and recompute requests
//! - **[`config`]** and **[`errors`]**: configuration and error types
//!
//! ## Quick Example
//!
//! ```rust
//! use ivs_fhe::aggregator::EncryptedAggregator;
//! use ivs_fhe::backend::RnsCkks;
//! use ivs_fhe::graph::{DiseaseGraph, UserId};
//! use ivs_fhe::policy::{MemoryAuditLog, PolicyRegistry};
//! use ivs_fhe::threshold::{CommitteeMember, ThresholdDecryptor, ThresholdKeyCoordinator};
//! use ivs_fhe::{AggregationConfig, SchemeContext, SchemeParameters, ThresholdParameters};
//! use rand::SeedableRng;
//! use rand_chacha::ChaCha20Rng;
//!
//! # fn main() -> Result<(), ivs_fhe::Error> {
//! let backend = RnsCkks::new(SchemeParameters::new(64, vec![60, 40, 40, 60], 40)?)?;
//! let mut rng = ChaCha20Rng::seed_from_u64(1);
//!
//! // 2-of-3 committee
//! let coordinator = ThresholdKeyCoordinator::new(&backend, ThresholdParameters::new(3, 2, None)?)?;
//! let committee: Vec<_> = (0..3)
//!     .map(|i| CommitteeMember::new(format!("member-{i}"), format!("10.0.0.{i}:9000")))
//!     .collect();
//! let keys = coordinator.generate_keys(&mut rng, &committee)?;
//! let ctx = SchemeContext::new(backend.clone(), keys.joint_public_key.clone());
//!
//! let mut graph = DiseaseGraph::from_edges(
//!     "flu",
//!     ["ann", "bob"],
//!     [(UserId::from("ann"), UserId::from("bob"))],
//! )?;
//! graph.set_health(&UserId::from("bob"), ctx.encrypt(&mut rng, &[1.0])?)?;
//!
//! let aggregator = EncryptedAggregator::new(&ctx, AggregationConfig::default())?;
//! let result = aggregator.run(&[graph]);
//! let ann = &result.diseases[0].scores[&UserId::from("ann")];
//!
//! // any two members can decrypt
//! let partials = [
//!     keys.shares[0].partial_decrypt(&backend, ann, false)?,
//!     keys.shares[2].partial_decrypt(&backend, ann, false)?,
//! ];
//! let (policies, audit) = (PolicyRegistry::new(), MemoryAuditLog::new());
//! let decryptor = ThresholdDecryptor::new(&ctx, coordinator.parameters().clone(), &policies, &audit)?
//!     .without_proof_verification();
//! let outcome = decryptor.combine(ann, partials.to_vec(), 2)?;
//! assert!((outcome.values[0] - 0.25).abs() < 1e-3);
//! # Ok(())
//! # }
//! ```
//!
//! ## Security Considerations
//!
//! - **Honest dealer**: key generation is dealer-based; the master secret
//!   exists in one process for the duration of
//!   [`generate_keys`](threshold::ThresholdKeyCoordinator::generate_keys).
//! - **No noise flooding**: partial decryptions are not smudged, so published
//!   partials leak information about the shares over many decryptions.
//! - **Partial proofs** bind a partial to its ciphertext and share index; they
//!   do not prove the partial was computed with the right share.
//! - **Reference parameters**: the demo and test parameters are far below
//!   production security levels.

pub mod aggregator;
pub mod arith;
pub mod backend;
pub mod config;
pub mod context;
pub mod errors;
pub mod graph;
pub mod jobs;
pub mod policy;
pub mod scale;
mod serde_impl;
pub mod storage;
pub mod threshold;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{AggregationConfig, CollectionConfig, RunConfig, SchemeParameters, ThresholdParameters};
pub use context::{Ciphertext, SchemeContext};
pub use errors::{BackendError, BatchOutcome, Error};
