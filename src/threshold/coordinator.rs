use std::collections::BTreeSet;

use rand_core::{CryptoRng, RngCore};
use rayon::prelude::*;
use tracing::{info, instrument};

use crate::backend::HomomorphicBackend;
use crate::config::ThresholdParameters;
use crate::errors::{BackendError, Error};
use crate::threshold::keys::{CommitteeMember, KeyGenOutput, KeyShare};

/// Dealer-based distributed key generation.
///
/// The master secret `s` is the constant term of a random polynomial
/// `f(x) = s + a_1 x + … + a_{T−1} x^{T−1}` over the secret-key space; member
/// `i` (1-based, committee order) receives `f(i)`. The master secret and the
/// coefficients only live for the duration of [`generate_keys`] and are
/// zeroized when dropped.
///
/// [`generate_keys`]: ThresholdKeyCoordinator::generate_keys
#[derive(Debug)]
pub struct ThresholdKeyCoordinator<'a, B: HomomorphicBackend> {
    backend: &'a B,
    params: ThresholdParameters,
}

impl<'a, B: HomomorphicBackend> ThresholdKeyCoordinator<'a, B> {
    pub fn new(backend: &'a B, params: ThresholdParameters) -> Result<Self, Error> {
        params.validate()?;
        Ok(Self { backend, params })
    }

    pub fn parameters(&self) -> &ThresholdParameters {
        &self.params
    }

    /// Checks the committee against the configured size; ids must be
    /// non-empty and unique.
    pub fn validate_committee(&self, committee: &[CommitteeMember]) -> Result<(), Error> {
        if committee.len() != self.params.total_shares {
            return Err(Error::CommitteeSizeMismatch {
                expected: self.params.total_shares,
                actual: committee.len(),
            });
        }
        let mut seen = BTreeSet::new();
        for member in committee {
            if member.id.is_empty() {
                return Err(Error::InvalidConfig("committee member id must not be empty".into()));
            }
            if !seen.insert(member.id.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate committee member id {}",
                    member.id
                )));
            }
        }
        Ok(())
    }

    /// Generates the joint public key and one share per committee member.
    #[instrument(
        level = "info",
        skip_all,
        fields(total_shares = self.params.total_shares, threshold = self.params.threshold)
    )]
    pub fn generate_keys<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        committee: &[CommitteeMember],
    ) -> Result<KeyGenOutput<B>, Error> {
        self.validate_committee(committee)?;

        let master = self.backend.sample_secret(rng);
        let joint_public_key = self.backend.derive_public_key(rng, &master)?;
        let coefficients: Vec<B::Secret> = match &self.params.coefficients {
            Some(explicit) => explicit
                .iter()
                .map(|&value| self.backend.secret_from_scalar(value))
                .collect(),
            None => (1..self.params.threshold)
                .map(|_| self.backend.sample_share_coefficient(rng))
                .collect(),
        };

        let shares = committee
            .par_iter()
            .enumerate()
            .map(|(position, member)| {
                let index = position as u32 + 1;
                let secret = evaluate_share(self.backend, &master, &coefficients, index as u64)?;
                Ok(KeyShare::new(
                    member.id.clone(),
                    index,
                    secret,
                    joint_public_key.clone(),
                ))
            })
            .collect::<Result<Vec<_>, BackendError>>()?;

        info!(shares = shares.len(), "key shares dealt");
        Ok(KeyGenOutput {
            joint_public_key,
            shares,
        })
    }

    /// Loads a serialized key share, failing with [`Error::Deserialization`]
    /// on malformed input.
    pub fn load_key_share(&self, bytes: &[u8]) -> Result<KeyShare<B>, Error> {
        let share = KeyShare::from_bytes(self.backend, bytes)?;
        if share.share_index() as usize > self.params.total_shares {
            return Err(Error::Deserialization(format!(
                "share index {} exceeds committee size {}",
                share.share_index(),
                self.params.total_shares
            )));
        }
        Ok(share)
    }
}

/// Horner evaluation of `constant + Σ coefficients[k−1] · point^k`.
fn evaluate_share<B: HomomorphicBackend>(
    backend: &B,
    constant: &B::Secret,
    coefficients: &[B::Secret],
    point: u64,
) -> Result<B::Secret, BackendError> {
    let mut highest_first = coefficients.iter().rev();
    let Some(top) = highest_first.next() else {
        return Ok(constant.clone());
    };
    let mut acc = top.clone();
    for coefficient in highest_first {
        acc = backend.secret_horner_step(&acc, point, coefficient)?;
    }
    backend.secret_horner_step(&acc, point, constant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RnsCkks;
    use crate::config::SchemeParameters;
    use crate::context::SchemeContext;
    use crate::test_support::committee;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn backend() -> RnsCkks {
        RnsCkks::new(SchemeParameters::new(128, vec![60, 40, 60], 40).expect("params")).expect("backend")
    }

    fn combine_subset(ctx: &SchemeContext<RnsCkks>, shares: &[&KeyShare<RnsCkks>], values: &[f64]) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(99);
        let ct = ctx.encrypt(&mut rng, values).expect("encrypt");
        let partials: Vec<_> = shares
            .iter()
            .map(|share| ctx.decrypt_with_share(&ct, share).expect("partial"))
            .collect();
        let indexed: Vec<(u64, &_)> = shares
            .iter()
            .zip(&partials)
            .map(|(share, partial)| (share.share_index() as u64, partial))
            .collect();
        ctx.backend().combine(&ct, &indexed).expect("combine")
    }

    fn run_every_subset(total: usize, threshold: usize, coefficients: Option<Vec<u64>>) {
        let backend = backend();
        let params = ThresholdParameters::new(total, threshold, coefficients).expect("params");
        let coordinator = ThresholdKeyCoordinator::new(&backend, params).expect("coordinator");
        let mut rng = StdRng::seed_from_u64(total as u64 * 31 + threshold as u64);
        let output = coordinator
            .generate_keys(&mut rng, &committee(total))
            .expect("keygen");
        assert_eq!(output.shares.len(), total);
        let ctx = SchemeContext::new(backend.clone(), output.joint_public_key.clone());

        // every T-subset of 1..=N
        for mask in 0u32..(1 << total) {
            if mask.count_ones() as usize != threshold {
                continue;
            }
            let subset: Vec<&KeyShare<RnsCkks>> = output
                .shares
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, share)| share)
                .collect();
            let values = combine_subset(&ctx, &subset, &[0.75, -0.125]);
            assert!((values[0] - 0.75).abs() < 1e-6, "mask {mask:b}: {values:?}");
            assert!((values[1] + 0.125).abs() < 1e-6, "mask {mask:b}: {values:?}");
        }
    }

    #[test]
    fn every_threshold_subset_decrypts() {
        run_every_subset(3, 2, None);
        run_every_subset(5, 3, None);
        run_every_subset(4, 4, None);
        run_every_subset(1, 1, None);
    }

    #[test]
    fn explicit_coefficients_are_honoured() {
        run_every_subset(4, 3, Some(vec![17, 123_456]));
    }

    #[test]
    fn fewer_than_threshold_shares_do_not_decrypt() {
        let backend = backend();
        let params = ThresholdParameters::new(5, 3, None).expect("params");
        let coordinator = ThresholdKeyCoordinator::new(&backend, params).expect("coordinator");
        let mut rng = StdRng::seed_from_u64(3);
        let output = coordinator.generate_keys(&mut rng, &committee(5)).expect("keygen");
        let ctx = SchemeContext::new(backend.clone(), output.joint_public_key.clone());
        let values = combine_subset(&ctx, &[&output.shares[0], &output.shares[4]], &[0.5]);
        assert!((values[0] - 0.5).abs() > 1.0);
    }

    #[test]
    fn committee_must_match_configuration() {
        let backend = backend();
        let params = ThresholdParameters::new(3, 2, None).expect("params");
        let coordinator = ThresholdKeyCoordinator::new(&backend, params).expect("coordinator");
        let mut rng = StdRng::seed_from_u64(4);

        assert!(matches!(
            coordinator.generate_keys(&mut rng, &committee(4)),
            Err(Error::CommitteeSizeMismatch { expected: 3, actual: 4 })
        ));
        let mut duplicated = committee(3);
        duplicated[2].id = duplicated[0].id.clone();
        assert!(matches!(
            coordinator.validate_committee(&duplicated),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn key_shares_roundtrip_through_bytes() {
        let backend = backend();
        let params = ThresholdParameters::new(3, 2, None).expect("params");
        let coordinator = ThresholdKeyCoordinator::new(&backend, params).expect("coordinator");
        let mut rng = StdRng::seed_from_u64(5);
        let output = coordinator.generate_keys(&mut rng, &committee(3)).expect("keygen");

        let share = &output.shares[1];
        let bytes = share.to_bytes(&backend).expect("encode");
        let loaded = coordinator.load_key_share(&bytes).expect("load");
        assert_eq!(loaded.party_id(), share.party_id());
        assert_eq!(loaded.share_index(), 2);
        assert_eq!(loaded.secret(), share.secret());
        assert_eq!(loaded.joint_public_key(), &output.joint_public_key);

        assert!(matches!(
            coordinator.load_key_share(&bytes[..bytes.len() / 2]),
            Err(Error::Deserialization(_))
        ));
        assert!(matches!(
            coordinator.load_key_share(b"garbage"),
            Err(Error::Deserialization(_))
        ));
    }
}
