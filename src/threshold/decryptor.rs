use std::collections::BTreeMap;
use std::sync::Arc;

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::backend::HomomorphicBackend;
use crate::config::{CollectionConfig, ThresholdParameters};
use crate::context::{Ciphertext, SchemeContext};
use crate::errors::{BackendError, Error};
use crate::policy::{AuditAction, AuditEvent, AuditOutcome, AuditSink, PolicyRegistry};
use crate::storage::ContentId;
use crate::threshold::collect::{PartialDecryptionSource, collect_partials};

const PROOF_DOMAIN: &str = "ivs-fhe partial decryption transcript v1";

/// One committee member's contribution to a threshold decryption.
#[derive(Clone, Debug)]
pub struct PartialDecryption<B: HomomorphicBackend> {
    pub party_id: String,
    /// Evaluation point of the member's key share
    pub share_index: u32,
    pub partial: B::Partial,
    pub proof: Option<PartialProof>,
}

/// Transcript digest binding a partial to its ciphertext, the joint key and
/// the share index.
///
/// This detects partials that were altered or replayed against another
/// ciphertext. It is not a zero-knowledge proof of correct decryption: a
/// member holding a wrong share can still produce a matching digest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialProof([u8; 32]);

impl PartialProof {
    pub fn create<B: HomomorphicBackend>(
        backend: &B,
        ct: &Ciphertext<B>,
        joint_key: &B::PublicKey,
        share_index: u32,
        partial: &B::Partial,
    ) -> Result<Self, BackendError> {
        transcript(backend, ct, joint_key, share_index, partial).map(Self)
    }

    pub fn verify<B: HomomorphicBackend>(
        &self,
        backend: &B,
        ct: &Ciphertext<B>,
        joint_key: &B::PublicKey,
        share_index: u32,
        partial: &B::Partial,
    ) -> Result<bool, BackendError> {
        Ok(transcript(backend, ct, joint_key, share_index, partial)? == self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

fn transcript<B: HomomorphicBackend>(
    backend: &B,
    ct: &Ciphertext<B>,
    joint_key: &B::PublicKey,
    share_index: u32,
    partial: &B::Partial,
) -> Result<[u8; 32], BackendError> {
    let mut hasher = Hasher::new_derive_key(PROOF_DOMAIN);
    for segment in [
        backend.encode_ciphertext(ct)?,
        backend.encode_public_key(joint_key)?,
        backend.encode_partial(partial)?,
    ] {
        hasher.update(&(segment.len() as u64).to_le_bytes());
        hasher.update(&segment);
    }
    hasher.update(&share_index.to_le_bytes());
    Ok(*hasher.finalize().as_bytes())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecryptionStage {
    Requested,
    Authorizing,
    Collecting,
    Combining,
    Done,
}

/// A request to decrypt one stored artifact.
///
/// `stage` records how far the request got; after a failure it names the
/// stage that failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionRequest {
    pub artifact: ContentId,
    pub requester: String,
    pub stage: DecryptionStage,
}

impl DecryptionRequest {
    pub fn new(artifact: ContentId, requester: impl Into<String>) -> Self {
        Self {
            artifact,
            requester: requester.into(),
            stage: DecryptionStage::Requested,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecryptionOutcome {
    pub values: Vec<f64>,
    /// Share indices that went into the combination, ascending
    pub used_shares: Vec<u32>,
    /// `(member id, reason)` for every contribution that was not used
    pub rejected: Vec<(String, String)>,
}

/// Policy-gated threshold decryption.
pub struct ThresholdDecryptor<'a, B: HomomorphicBackend> {
    ctx: &'a SchemeContext<B>,
    params: ThresholdParameters,
    policies: &'a PolicyRegistry,
    audit: &'a dyn AuditSink,
    verify_proofs: bool,
}

impl<'a, B: HomomorphicBackend> ThresholdDecryptor<'a, B> {
    pub fn new(
        ctx: &'a SchemeContext<B>,
        params: ThresholdParameters,
        policies: &'a PolicyRegistry,
        audit: &'a dyn AuditSink,
    ) -> Result<Self, Error> {
        params.validate()?;
        Ok(Self {
            ctx,
            params,
            policies,
            audit,
            verify_proofs: true,
        })
    }

    /// Accept partials without a valid proof.
    pub fn without_proof_verification(mut self) -> Self {
        self.verify_proofs = false;
        self
    }

    /// Checks the policy for `artifact` and returns the number of shares the
    /// decryption needs: `N` when the policy requires all shares, `T`
    /// otherwise.
    pub fn authorize(&self, artifact: &ContentId, requester: &str) -> Result<(usize, bool), Error> {
        match self.policies.authorize(artifact, requester) {
            Ok(policy) => {
                if policy.audit_log {
                    self.audit.record(AuditEvent::now(
                        requester,
                        artifact,
                        AuditAction::Authorize,
                        AuditOutcome::Granted,
                    ))?;
                }
                let required = if policy.requires_all_shares {
                    self.params.total_shares
                } else {
                    self.params.threshold
                };
                Ok((required, policy.audit_log))
            }
            Err(err) => {
                warn!(%artifact, requester, error = %err, "decryption denied");
                if self.policies.get(artifact).is_some_and(|policy| policy.audit_log) {
                    self.audit.record(AuditEvent::now(
                        requester,
                        artifact,
                        AuditAction::Authorize,
                        AuditOutcome::Denied(err.to_string()),
                    ))?;
                }
                Err(err)
            }
        }
    }

    /// Whether a partial carries a proof that verifies against `ct`.
    pub fn verify_partial(&self, ct: &Ciphertext<B>, partial: &PartialDecryption<B>) -> bool {
        partial.proof.is_some_and(|proof| {
            proof
                .verify(
                    self.ctx.backend(),
                    ct,
                    self.ctx.joint_key(),
                    partial.share_index,
                    &partial.partial,
                )
                .unwrap_or(false)
        })
    }

    /// Combines `required` partials into the plaintext values.
    ///
    /// Partials with a duplicate or out-of-range share index are dropped, as
    /// are unverifiable ones when proof verification is on. The `required`
    /// lowest share indices among the rest are combined.
    #[instrument(level = "info", skip_all, fields(required = required, provided = partials.len()))]
    pub fn combine(
        &self,
        ct: &Ciphertext<B>,
        partials: Vec<PartialDecryption<B>>,
        required: usize,
    ) -> Result<DecryptionOutcome, Error> {
        self.combine_checked(ct, partials, required, self.verify_proofs)
    }

    fn combine_checked(
        &self,
        ct: &Ciphertext<B>,
        partials: Vec<PartialDecryption<B>>,
        required: usize,
        verify: bool,
    ) -> Result<DecryptionOutcome, Error> {
        let mut rejected = Vec::new();
        let mut by_index: BTreeMap<u32, PartialDecryption<B>> = BTreeMap::new();
        for partial in partials {
            let reason = if partial.share_index == 0 || partial.share_index as usize > self.params.total_shares {
                Some("share index out of range")
            } else if by_index.contains_key(&partial.share_index) {
                Some("duplicate share index")
            } else if verify && !self.verify_partial(ct, &partial) {
                Some("proof missing or invalid")
            } else {
                None
            };
            match reason {
                Some(reason) => rejected.push((partial.party_id, reason.to_string())),
                None => {
                    by_index.insert(partial.share_index, partial);
                }
            }
        }

        if by_index.len() < required {
            return Err(Error::InsufficientShares {
                required,
                provided: by_index.len(),
            });
        }

        let selected: Vec<(u64, &B::Partial)> = by_index
            .iter()
            .take(required)
            .map(|(&index, partial)| (index as u64, &partial.partial))
            .collect();
        let values = self.ctx.backend().combine(ct, &selected)?;
        let used_shares = by_index.keys().take(required).copied().collect();
        debug!(?used_shares, rejected = rejected.len(), "partials combined");
        Ok(DecryptionOutcome {
            values,
            used_shares,
            rejected,
        })
    }

    /// Runs a request through authorization, collection and combination.
    #[instrument(
        level = "info",
        skip_all,
        fields(artifact = %request.artifact, requester = %request.requester, members = members.len())
    )]
    pub async fn decrypt(
        &self,
        request: &mut DecryptionRequest,
        ct: &Ciphertext<B>,
        members: &[Arc<dyn PartialDecryptionSource<B>>],
        config: &CollectionConfig,
    ) -> Result<DecryptionOutcome, Error> {
        request.stage = DecryptionStage::Authorizing;
        let (required, audited) = self.authorize(&request.artifact, &request.requester)?;

        request.stage = DecryptionStage::Collecting;
        let verify = self.verify_proofs && config.verify_proofs;
        let report = collect_partials(
            members,
            &request.artifact,
            Arc::new(ct.clone()),
            required,
            config.timeout(),
            |partial| !verify || self.verify_partial(ct, partial),
        )
        .await;
        if report.timed_out {
            warn!(collected = report.partials.len(), required, "collection deadline reached");
        }

        request.stage = DecryptionStage::Combining;
        let result = self
            .combine_checked(ct, report.partials, required, false)
            .map(|mut outcome| {
                outcome.rejected.extend(report.rejected);
                outcome
            });

        if audited {
            let outcome = match &result {
                Ok(outcome) => AuditOutcome::Decrypted {
                    shares: outcome.used_shares.clone(),
                },
                Err(err) => AuditOutcome::Failed(err.to_string()),
            };
            self.audit.record(AuditEvent::now(
                &request.requester,
                &request.artifact,
                AuditAction::Combine,
                outcome,
            ))?;
        }

        let outcome = result?;
        request.stage = DecryptionStage::Done;
        info!(used = ?outcome.used_shares, "threshold decryption finished");
        Ok(outcome)
    }
}
