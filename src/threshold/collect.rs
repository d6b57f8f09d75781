use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, instrument, warn};

use crate::backend::HomomorphicBackend;
use crate::context::Ciphertext;
use crate::errors::Error;
use crate::storage::ContentId;
use crate::threshold::decryptor::PartialDecryption;
use crate::threshold::keys::KeyShare;

/// A committee member that can be asked for a partial decryption.
#[async_trait]
pub trait PartialDecryptionSource<B: HomomorphicBackend>: Send + Sync {
    fn member_id(&self) -> &str;

    async fn request_partial(
        &self,
        artifact: &ContentId,
        ct: &Ciphertext<B>,
    ) -> Result<PartialDecryption<B>, Error>;
}

/// A member whose key share lives in this process.
#[derive(Debug)]
pub struct LocalMember<B: HomomorphicBackend> {
    backend: B,
    share: KeyShare<B>,
    attach_proof: bool,
}

impl<B: HomomorphicBackend> LocalMember<B> {
    pub fn new(backend: B, share: KeyShare<B>) -> Self {
        Self {
            backend,
            share,
            attach_proof: true,
        }
    }

    pub fn without_proof(mut self) -> Self {
        self.attach_proof = false;
        self
    }
}

#[async_trait]
impl<B: HomomorphicBackend> PartialDecryptionSource<B> for LocalMember<B> {
    fn member_id(&self) -> &str {
        self.share.party_id()
    }

    async fn request_partial(
        &self,
        _artifact: &ContentId,
        ct: &Ciphertext<B>,
    ) -> Result<PartialDecryption<B>, Error> {
        self.share.partial_decrypt(&self.backend, ct, self.attach_proof)
    }
}

/// Result of one collection round.
#[derive(Debug)]
pub struct CollectionReport<B: HomomorphicBackend> {
    /// Accepted partials, at most `required`, distinct share indices
    pub partials: Vec<PartialDecryption<B>>,
    /// `(member id, reason)` for failed or rejected members
    pub rejected: Vec<(String, String)>,
    pub timed_out: bool,
}

type Pending<B> = JoinSet<(String, Result<PartialDecryption<B>, Error>)>;

/// Requests partials concurrently until `required` have been accepted.
///
/// The first `required` members are asked up front. A member that fails, or
/// whose partial `accept` rejects or repeats an index already collected, is
/// replaced by the next member not yet asked. Collection stops at the
/// deadline; outstanding requests are aborted either way.
#[instrument(level = "info", skip_all, fields(%artifact, required = required, members = members.len()))]
pub async fn collect_partials<B, F>(
    members: &[Arc<dyn PartialDecryptionSource<B>>],
    artifact: &ContentId,
    ct: Arc<Ciphertext<B>>,
    required: usize,
    timeout: Duration,
    mut accept: F,
) -> CollectionReport<B>
where
    B: HomomorphicBackend,
    F: FnMut(&PartialDecryption<B>) -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut report = CollectionReport {
        partials: Vec::with_capacity(required),
        rejected: Vec::new(),
        timed_out: false,
    };
    let mut indices = BTreeSet::new();
    let mut queue = members.iter();
    let mut set: Pending<B> = JoinSet::new();

    let launch = |set: &mut Pending<B>, member: &Arc<dyn PartialDecryptionSource<B>>| {
        let member = Arc::clone(member);
        let artifact = artifact.clone();
        let ct = Arc::clone(&ct);
        set.spawn(async move {
            let result = member.request_partial(&artifact, &ct).await;
            (member.member_id().to_string(), result)
        });
    };

    for member in queue.by_ref().take(required) {
        launch(&mut set, member);
    }

    while report.partials.len() < required {
        let joined = match timeout_at(deadline, set.join_next()).await {
            Err(_) => {
                report.timed_out = true;
                break;
            }
            Ok(None) => break,
            Ok(Some(joined)) => joined,
        };

        let reason = match joined {
            Err(join_err) => Some(("unknown".to_string(), join_err.to_string())),
            Ok((member, Err(err))) => Some((member, err.to_string())),
            Ok((member, Ok(partial))) => {
                if indices.contains(&partial.share_index) {
                    Some((member, "duplicate share index".to_string()))
                } else if !accept(&partial) {
                    Some((member, "partial rejected".to_string()))
                } else {
                    debug!(%member, index = partial.share_index, "partial accepted");
                    indices.insert(partial.share_index);
                    report.partials.push(partial);
                    None
                }
            }
        };

        if let Some((member, reason)) = reason {
            warn!(%member, %reason, "member contribution unusable");
            report.rejected.push((member, reason));
            if let Some(next) = queue.next() {
                launch(&mut set, next);
            }
        }
    }

    set.abort_all();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RnsCkks;
    use crate::test_support::{FailingMember, local_members, setup_with_shares};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    struct SlowMember(LocalMember<RnsCkks>, Duration);

    #[async_trait]
    impl PartialDecryptionSource<RnsCkks> for SlowMember {
        fn member_id(&self) -> &str {
            self.0.member_id()
        }

        async fn request_partial(
            &self,
            artifact: &ContentId,
            ct: &Ciphertext<RnsCkks>,
        ) -> Result<PartialDecryption<RnsCkks>, Error> {
            tokio::time::sleep(self.1).await;
            self.0.request_partial(artifact, ct).await
        }
    }

    fn artifact() -> ContentId {
        ContentId::for_bytes(b"artifact")
    }

    #[tokio::test]
    async fn failed_members_are_replaced() {
        let (ctx, _, shares) = setup_with_shares(vec![60, 40, 60], 4, 2);
        let mut rng = StdRng::seed_from_u64(50);
        let ct = Arc::new(ctx.encrypt(&mut rng, &[1.0]).expect("encrypt"));
        let mut members = local_members(&ctx, &shares);
        members[0] = Arc::new(FailingMember::new("m0"));

        let report = collect_partials(&members, &artifact(), ct, 2, Duration::from_secs(5), |_| true).await;
        assert!(!report.timed_out);
        let mut indices: Vec<u32> = report.partials.iter().map(|p| p.share_index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![2, 3]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, "m0");
    }

    #[tokio::test]
    async fn rejected_partials_are_replaced() {
        let (ctx, _, shares) = setup_with_shares(vec![60, 40, 60], 3, 2);
        let mut rng = StdRng::seed_from_u64(51);
        let ct = Arc::new(ctx.encrypt(&mut rng, &[1.0]).expect("encrypt"));
        let members = local_members(&ctx, &shares);

        let report = collect_partials(&members, &artifact(), ct, 2, Duration::from_secs(5), |partial| {
            partial.share_index != 1
        })
        .await;
        let mut indices: Vec<u32> = report.partials.iter().map(|p| p.share_index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![2, 3]);
        assert_eq!(report.rejected[0].1, "partial rejected");
    }

    #[tokio::test]
    async fn slow_members_hit_the_deadline() {
        let (ctx, _, shares) = setup_with_shares(vec![60, 40, 60], 2, 2);
        let mut rng = StdRng::seed_from_u64(52);
        let ct = Arc::new(ctx.encrypt(&mut rng, &[1.0]).expect("encrypt"));
        let backend = ctx.backend().clone();
        let members: Vec<Arc<dyn PartialDecryptionSource<RnsCkks>>> = vec![
            Arc::new(LocalMember::new(backend.clone(), shares[0].clone())),
            Arc::new(SlowMember(
                LocalMember::new(backend, shares[1].clone()),
                Duration::from_secs(30),
            )),
        ];

        let report = collect_partials(&members, &artifact(), ct, 2, Duration::from_millis(100), |_| true).await;
        assert!(report.timed_out);
        assert_eq!(report.partials.len(), 1);
    }
}
