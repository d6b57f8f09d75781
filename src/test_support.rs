//! Shared fixtures for unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use crate::backend::{HomomorphicBackend, RnsCkks};
use crate::config::{SchemeParameters, ThresholdParameters};
use crate::context::{Ciphertext, SchemeContext};
use crate::errors::Error;
use crate::storage::ContentId;
use crate::threshold::{
    CommitteeMember, KeyShare, LocalMember, PartialDecryption, PartialDecryptionSource,
    ThresholdKeyCoordinator,
};

pub(crate) const TEST_RING_DIMENSION: usize = 256;

pub(crate) fn committee(size: usize) -> Vec<CommitteeMember> {
    (0..size)
        .map(|i| CommitteeMember::new(format!("m{i}"), format!("127.0.0.1:{}", 7000 + i)))
        .collect()
}

/// Context plus dealt shares for an `n`-member committee with threshold `t`.
pub(crate) fn setup_with_shares(
    modulus_bits: Vec<u32>,
    n: usize,
    t: usize,
) -> (SchemeContext<RnsCkks>, ThresholdParameters, Vec<KeyShare<RnsCkks>>) {
    let params = SchemeParameters::new(TEST_RING_DIMENSION, modulus_bits, 40).expect("scheme params");
    let backend = RnsCkks::new(params).expect("backend");
    let threshold = ThresholdParameters::new(n, t, None).expect("threshold params");
    let coordinator = ThresholdKeyCoordinator::new(&backend, threshold.clone()).expect("coordinator");
    let mut rng = ChaCha20Rng::seed_from_u64(0x1d5 + n as u64 * 7 + t as u64);
    let output = coordinator
        .generate_keys(&mut rng, &committee(n))
        .expect("keygen");
    let ctx = SchemeContext::new(backend, output.joint_public_key);
    (ctx, threshold, output.shares)
}

pub(crate) fn setup(
    modulus_bits: Vec<u32>,
    n: usize,
    t: usize,
) -> (SchemeContext<RnsCkks>, Vec<KeyShare<RnsCkks>>) {
    let (ctx, _, shares) = setup_with_shares(modulus_bits, n, t);
    (ctx, shares)
}

/// Decrypts with every share.
pub(crate) fn decrypt_all(
    ctx: &SchemeContext<RnsCkks>,
    shares: &[KeyShare<RnsCkks>],
    ct: &Ciphertext<RnsCkks>,
) -> Vec<f64> {
    let partials: Vec<_> = shares
        .iter()
        .map(|share| ctx.decrypt_with_share(ct, share).expect("partial"))
        .collect();
    let indexed: Vec<(u64, &_)> = shares
        .iter()
        .zip(&partials)
        .map(|(share, partial)| (share.share_index() as u64, partial))
        .collect();
    ctx.backend().combine(ct, &indexed).expect("combine")
}

pub(crate) fn local_members(
    ctx: &SchemeContext<RnsCkks>,
    shares: &[KeyShare<RnsCkks>],
) -> Vec<Arc<dyn PartialDecryptionSource<RnsCkks>>> {
    shares
        .iter()
        .map(|share| {
            Arc::new(LocalMember::new(ctx.backend().clone(), share.clone()))
                as Arc<dyn PartialDecryptionSource<RnsCkks>>
        })
        .collect()
}

/// A member that is always unreachable.
pub(crate) struct FailingMember(String);

impl FailingMember {
    pub(crate) fn new(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[async_trait]
impl<B: HomomorphicBackend> PartialDecryptionSource<B> for FailingMember {
    fn member_id(&self) -> &str {
        &self.0
    }

    async fn request_partial(
        &self,
        _artifact: &ContentId,
        _ct: &Ciphertext<B>,
    ) -> Result<PartialDecryption<B>, Error> {
        Err(Error::MalformedInput(format!("member {} unreachable", self.0)))
    }
}
