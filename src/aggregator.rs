//! Encrypted Individual Vulnerability Score aggregation.
//!
//! For a source user `s` and one disease,
//!
//! ```text
//! IVS[s] = Σ_{d = 0..Dmax} Σ_{u at BFS depth d from s} 2^-(d+1) · health[u]
//! ```
//!
//! where `health[u]` is encrypted and the graph and weights are public. The
//! traversal is level-synchronous with a visited set, so a user reachable by
//! several paths contributes once, at its shortest distance. Users without a
//! health entry contribute nothing.
//!
//! Sources are scored in parallel with rayon. Each source owns its
//! accumulator and draws its encryption randomness from a ChaCha stream
//! derived from the run seed, the disease and the source id.
//!
//! # Example
//!
//! ```rust
//! use ivs_fhe::aggregator::reference_ivs;
//! use ivs_fhe::graph::{DiseaseGraph, UserId};
//!
//! let mut graph: DiseaseGraph<f64> = DiseaseGraph::from_edges(
//!     "flu",
//!     ["ann", "bob"],
//!     [(UserId::from("ann"), UserId::from("bob"))],
//! ).expect("graph");
//! graph.set_health(&UserId::from("bob"), 1.0).expect("known user");
//!
//! let scores = reference_ivs(&graph, 2);
//! assert_eq!(scores[&UserId::from("ann")], 0.25);
//! assert_eq!(scores[&UserId::from("bob")], 0.5);
//! ```

use std::collections::BTreeMap;

use rand::RngCore;
use rand::rngs::OsRng;
use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};

use crate::backend::{CiphertextMeta, HomomorphicBackend};
use crate::config::AggregationConfig;
use crate::context::{Ciphertext, SchemeContext};
use crate::errors::{BatchOutcome, Error};
use crate::graph::{DiseaseGraph, UserId};
use crate::scale::{NumericReport, ScaleLevelManager};

const RNG_DOMAIN: &str = "ivs-fhe aggregation rng v1";

/// Weight of a contribution at BFS depth `depth`.
pub fn depth_weight(depth: usize) -> f64 {
    0.5f64.powi(depth as i32 + 1)
}

/// Plaintext IVS for every user of `graph`, the oracle the encrypted path is
/// checked against.
pub fn reference_ivs(graph: &DiseaseGraph<f64>, max_depth: usize) -> BTreeMap<UserId, f64> {
    graph
        .users()
        .map(|source| {
            let score = graph
                .bfs_layers(source, max_depth)
                .iter()
                .enumerate()
                .map(|(depth, layer)| {
                    let weight = depth_weight(depth);
                    layer
                        .iter()
                        .filter_map(|user| graph.health(user))
                        .map(|health| weight * health)
                        .sum::<f64>()
                })
                .sum();
            (source.clone(), score)
        })
        .collect()
}

/// Plaintext cross-disease totals.
pub fn reference_totals<'g, I>(per_disease: I) -> BTreeMap<UserId, f64>
where
    I: IntoIterator<Item = &'g BTreeMap<UserId, f64>>,
{
    let mut totals = BTreeMap::new();
    for scores in per_disease {
        for (user, score) in scores {
            *totals.entry(user.clone()).or_insert(0.0) += score;
        }
    }
    totals
}

/// Encrypted scores of one disease.
#[derive(Debug)]
pub struct DiseaseScores<C> {
    pub disease_id: String,
    pub scores: BTreeMap<UserId, C>,
    pub failures: BTreeMap<UserId, Error>,
}

/// Output of [`EncryptedAggregator::run`].
#[derive(Debug)]
pub struct EncryptedIvsResult<C> {
    /// Per-disease scores, in input order
    pub diseases: Vec<DiseaseScores<C>>,
    /// Cross-disease totals, when enabled
    pub totals: Option<BatchOutcome<UserId, C>>,
    pub numeric: NumericReport,
}

impl<C> EncryptedIvsResult<C> {
    pub fn disease(&self, disease_id: &str) -> Option<&DiseaseScores<C>> {
        self.diseases.iter().find(|d| d.disease_id == disease_id)
    }
}

pub struct EncryptedAggregator<'a, B: HomomorphicBackend> {
    ctx: &'a SchemeContext<B>,
    manager: ScaleLevelManager<'a, B>,
    config: AggregationConfig,
    seed: [u8; 32],
}

impl<'a, B: HomomorphicBackend> EncryptedAggregator<'a, B> {
    pub fn new(ctx: &'a SchemeContext<B>, config: AggregationConfig) -> Result<Self, Error> {
        let manager = ScaleLevelManager::new(ctx, &config)?;
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Ok(Self {
            ctx,
            manager,
            config,
            seed,
        })
    }

    /// Fixes the run seed, making every encryption of zero reproducible.
    pub fn with_seed(mut self, seed: [u8; 32]) -> Self {
        self.seed = seed;
        self
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    pub fn numeric_report(&self) -> NumericReport {
        self.manager.report()
    }

    fn source_rng(&self, disease_id: &str, source: &UserId) -> ChaCha20Rng {
        let mut hasher = blake3::Hasher::new_derive_key(RNG_DOMAIN);
        hasher.update(&self.seed);
        hasher.update(&(disease_id.len() as u64).to_le_bytes());
        hasher.update(disease_id.as_bytes());
        hasher.update(source.as_str().as_bytes());
        ChaCha20Rng::from_seed(*hasher.finalize().as_bytes())
    }

    /// Encrypted IVS of one source for one disease.
    pub fn score_source(&self, graph: &DiseaseGraph<Ciphertext<B>>, source: &UserId) -> Result<Ciphertext<B>, Error> {
        let mut rng = self.source_rng(graph.disease_id(), source);
        let reference_scale = graph
            .health(source)
            .map_or_else(|| self.ctx.default_scale(), |ct| ct.scale());
        let mut acc = self.manager.encrypted_zero(&mut rng, reference_scale)?;

        for (depth, layer) in graph.bfs_layers(source, self.config.max_depth).iter().enumerate() {
            let weight = depth_weight(depth);
            for user in layer {
                if let Some(health) = graph.health(user) {
                    acc = self.manager.accumulate(&acc, health, weight)?;
                }
            }
        }
        Ok(acc)
    }

    /// Scores every user of the graph.
    #[instrument(level = "info", skip_all, fields(disease = graph.disease_id(), users = graph.user_count()))]
    pub fn score_disease(&self, graph: &DiseaseGraph<Ciphertext<B>>) -> DiseaseScores<Ciphertext<B>> {
        let sources: Vec<UserId> = graph.users().cloned().collect();
        self.score_sources(graph, &sources)
    }

    /// Scores the given sources only; unknown sources are reported as failures.
    pub fn score_users(&self, graph: &DiseaseGraph<Ciphertext<B>>, sources: &[UserId]) -> DiseaseScores<Ciphertext<B>> {
        self.score_sources(graph, sources)
    }

    fn score_sources(&self, graph: &DiseaseGraph<Ciphertext<B>>, sources: &[UserId]) -> DiseaseScores<Ciphertext<B>> {
        let outcome: BatchOutcome<UserId, Ciphertext<B>> = sources
            .par_iter()
            .map(|source| {
                let result = if graph.contains(source) {
                    self.score_source(graph, source)
                } else {
                    Err(Error::UnknownUser(source.to_string()))
                };
                (source.clone(), result)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .collect();

        for (user, err) in &outcome.failed {
            warn!(disease = graph.disease_id(), %user, error = %err, "scoring failed");
        }
        debug!(
            disease = graph.disease_id(),
            scored = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "disease scored"
        );
        DiseaseScores {
            disease_id: graph.disease_id().to_string(),
            scores: outcome.succeeded,
            failures: outcome.failed,
        }
    }

    /// Sums per-disease scores user by user, in disease order. Users absent
    /// from a disease are skipped for that disease.
    #[instrument(level = "info", skip_all, fields(diseases = diseases.len()))]
    pub fn aggregate(&self, diseases: &[DiseaseScores<Ciphertext<B>>]) -> BatchOutcome<UserId, Ciphertext<B>> {
        let mut totals: BTreeMap<UserId, Ciphertext<B>> = BTreeMap::new();
        let mut failed: BTreeMap<UserId, Error> = BTreeMap::new();
        for disease in diseases {
            for (user, score) in &disease.scores {
                if failed.contains_key(user) {
                    continue;
                }
                let next = match totals.remove(user) {
                    None => Ok(score.clone()),
                    Some(previous) => self.manager.add(&previous, score),
                };
                match next {
                    Ok(total) => {
                        totals.insert(user.clone(), total);
                    }
                    Err(err) => {
                        failed.insert(user.clone(), err);
                    }
                }
            }
        }
        BatchOutcome {
            succeeded: totals,
            failed,
        }
    }

    /// Scores every graph and, when configured, the cross-disease totals.
    #[instrument(level = "info", skip_all, fields(diseases = graphs.len(), max_depth = self.config.max_depth))]
    pub fn run(&self, graphs: &[DiseaseGraph<Ciphertext<B>>]) -> EncryptedIvsResult<Ciphertext<B>> {
        let diseases: Vec<_> = graphs.iter().map(|graph| self.score_disease(graph)).collect();
        let totals = self.config.cross_disease.then(|| self.aggregate(&diseases));
        let numeric = self.manager.report();
        info!(
            rescales = numeric.rescales,
            skipped_rescales = numeric.skipped_rescales,
            coercions = numeric.scale_coercions,
            "aggregation finished"
        );
        EncryptedIvsResult {
            diseases,
            totals,
            numeric,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RnsCkks;
    use crate::test_support::{decrypt_all, setup};
    use rand::rngs::StdRng;

    fn edge(a: &str, b: &str) -> (UserId, UserId) {
        (UserId::from(a), UserId::from(b))
    }

    fn plain_graph(disease: &str, infected: &[&str]) -> DiseaseGraph<f64> {
        let mut graph = DiseaseGraph::from_edges(
            disease,
            ["U1", "U2", "U3", "U4", "U5", "U6"],
            [
                edge("U1", "U2"),
                edge("U2", "U3"),
                edge("U2", "U5"),
                edge("U3", "U4"),
                edge("U3", "U6"),
            ],
        )
        .expect("graph");
        for user in ["U1", "U2", "U3", "U4", "U5", "U6"] {
            let status = if infected.contains(&user) { 1.0 } else { 0.0 };
            graph.set_health(&UserId::from(user), status).expect("known");
        }
        graph
    }

    fn encrypt_graph(ctx: &SchemeContext<RnsCkks>, graph: &DiseaseGraph<f64>, seed: u64) -> DiseaseGraph<Ciphertext<RnsCkks>> {
        let mut rng = StdRng::seed_from_u64(seed);
        graph
            .clone()
            .resolve_health(|_, status| ctx.encrypt(&mut rng, &[status]))
            .0
    }

    fn score(scores: &BTreeMap<UserId, f64>, user: &str) -> f64 {
        scores[&UserId::from(user)]
    }

    const USERS: [&str; 6] = ["U1", "U2", "U3", "U4", "U5", "U6"];
    const IVS_A: [f64; 6] = [0.25, 0.625, 0.5, 0.25, 0.25, 0.625];
    const IVS_B: [f64; 6] = [0.625, 0.5, 0.25, 0.0, 0.625, 0.0];

    #[test]
    fn reference_vectors_match() {
        let a = reference_ivs(&plain_graph("A", &["U2", "U6"]), 2);
        let b = reference_ivs(&plain_graph("B", &["U1", "U5"]), 2);
        let totals = reference_totals([&a, &b]);
        for (i, user) in USERS.iter().enumerate() {
            assert_eq!(score(&a, user), IVS_A[i], "A/{user}");
            assert_eq!(score(&b, user), IVS_B[i], "B/{user}");
            assert_eq!(score(&totals, user), IVS_A[i] + IVS_B[i], "total/{user}");
        }
        assert_eq!(score(&totals, "U1"), 0.875);
        assert_eq!(score(&totals, "U2"), 1.125);
    }

    #[test]
    fn isolated_source_and_missing_health() {
        let mut graph: DiseaseGraph<f64> =
            DiseaseGraph::from_edges("A", ["solo", "x", "y"], [edge("x", "y")]).expect("graph");
        graph.set_health(&UserId::from("solo"), 1.0).expect("known");
        graph.set_health(&UserId::from("x"), 1.0).expect("known");
        let scores = reference_ivs(&graph, 2);
        assert_eq!(score(&scores, "solo"), 0.5);
        assert_eq!(score(&scores, "x"), 0.5);
        assert_eq!(score(&scores, "y"), 0.25);
    }

    #[test]
    fn encrypted_scores_match_plaintext_oracle() {
        let (ctx, shares) = setup(vec![60, 40, 40, 40, 60], 3, 2);
        let plain_a = plain_graph("A", &["U2", "U6"]);
        let plain_b = plain_graph("B", &["U1", "U5"]);
        let graphs = vec![encrypt_graph(&ctx, &plain_a, 1), encrypt_graph(&ctx, &plain_b, 2)];

        let aggregator = EncryptedAggregator::new(&ctx, AggregationConfig::default())
            .expect("aggregator")
            .with_seed([7; 32]);
        let result = aggregator.run(&graphs);

        let expected_a = reference_ivs(&plain_a, 2);
        let expected_b = reference_ivs(&plain_b, 2);
        let expected_totals = reference_totals([&expected_a, &expected_b]);

        for (disease, expected) in [("A", &expected_a), ("B", &expected_b)] {
            let scores = result.disease(disease).expect("disease scored");
            assert!(scores.failures.is_empty());
            for (user, ct) in &scores.scores {
                let value = decrypt_all(&ctx, &shares, ct)[0];
                assert!((value - expected[user]).abs() < 1e-3, "{disease}/{user}: {value}");
            }
        }

        let totals = result.totals.expect("cross-disease totals");
        assert!(totals.is_complete());
        assert_eq!(totals.succeeded.len(), 6);
        for (user, ct) in &totals.succeeded {
            let value = decrypt_all(&ctx, &shares, ct)[0];
            assert!((value - expected_totals[user]).abs() < 1e-3, "total/{user}: {value}");
        }
        assert!((decrypt_all(&ctx, &shares, &totals.succeeded[&UserId::from("U2")])[0] - 1.125).abs() < 1e-3);
    }

    #[test]
    fn short_chain_still_scores_with_reduced_precision() {
        let (ctx, shares) = setup(vec![60, 40], 1, 1);
        let plain = plain_graph("A", &["U2", "U6"]);
        let mut rng = StdRng::seed_from_u64(3);
        // health already at the floor: every weight skips its rescale
        let (graph, failures) = plain.clone().resolve_health(|_, status| {
            let fresh = ctx.encrypt(&mut rng, &[status])?;
            ctx.switch_level(&fresh, 0)
        });
        assert!(failures.is_empty());
        let aggregator = EncryptedAggregator::new(&ctx, AggregationConfig::default()).expect("aggregator");

        let scores = aggregator.score_disease(&graph);
        assert!(scores.failures.is_empty());
        let expected = reference_ivs(&plain, 2);
        for (user, ct) in &scores.scores {
            let value = decrypt_all(&ctx, &shares, ct)[0];
            assert!((value - expected[user]).abs() < 1e-2, "{user}: {value}");
        }
        assert!(aggregator.numeric_report().skipped_rescales > 0);
    }

    #[test]
    fn users_absent_from_a_disease_are_skipped_in_totals() {
        let (ctx, shares) = setup(vec![60, 40, 40, 60], 1, 1);
        let mut rng = StdRng::seed_from_u64(4);
        let mut only_a: DiseaseGraph<Ciphertext<RnsCkks>> =
            DiseaseGraph::from_edges("A", ["p", "q"], [edge("p", "q")]).expect("graph");
        only_a
            .set_health(&UserId::from("q"), ctx.encrypt(&mut rng, &[1.0]).expect("encrypt"))
            .expect("known");
        let only_b: DiseaseGraph<Ciphertext<RnsCkks>> =
            DiseaseGraph::from_edges("B", ["q"], Vec::<(UserId, UserId)>::new()).expect("graph");

        let aggregator = EncryptedAggregator::new(&ctx, AggregationConfig::default()).expect("aggregator");
        let result = aggregator.run(&[only_a, only_b]);
        let totals = result.totals.expect("totals");
        assert_eq!(totals.succeeded.len(), 2);
        let p = decrypt_all(&ctx, &shares, &totals.succeeded[&UserId::from("p")])[0];
        let q = decrypt_all(&ctx, &shares, &totals.succeeded[&UserId::from("q")])[0];
        assert!((p - 0.25).abs() < 1e-3);
        assert!((q - 0.5).abs() < 1e-3);
    }

    #[test]
    fn unknown_target_users_are_reported() {
        let (ctx, _) = setup(vec![60, 40, 60], 1, 1);
        let graph: DiseaseGraph<Ciphertext<RnsCkks>> =
            DiseaseGraph::from_edges("A", ["p"], Vec::<(UserId, UserId)>::new()).expect("graph");
        let aggregator = EncryptedAggregator::new(&ctx, AggregationConfig::default()).expect("aggregator");
        let scores = aggregator.score_users(&graph, &[UserId::from("p"), UserId::from("ghost")]);
        assert_eq!(scores.scores.len(), 1);
        assert!(matches!(
            scores.failures.get(&UserId::from("ghost")),
            Some(Error::UnknownUser(_))
        ));
    }
}
