//! Content-addressed storage glue.
//!
//! Health ciphertexts and computed scores are stored as opaque blobs keyed by
//! their BLAKE3 digest. A [`GraphSnapshot`] references health blobs by
//! [`ContentId`] and is resolved into an encrypted [`DiseaseGraph`] through a
//! [`BlobStore`]; scores go back out through a [`ResultSink`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::aggregator::EncryptedIvsResult;
use crate::backend::HomomorphicBackend;
use crate::config::AggregationConfig;
use crate::context::{Ciphertext, SchemeContext};
use crate::errors::{BackendError, BatchOutcome, Error};
use crate::graph::{DiseaseGraph, UserId};

/// BLAKE3 digest of a blob, hex encoded.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentId(String);

impl ContentId {
    pub fn for_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait BlobStore: Send + Sync {
    fn put(&self, bytes: Vec<u8>) -> Result<ContentId, Error>;

    /// Fails with [`Error::BlobNotFound`] for unknown ids.
    fn get(&self, id: &ContentId) -> Result<Vec<u8>, Error>;
}

/// In-process blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<ContentId, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, bytes: Vec<u8>) -> Result<ContentId, Error> {
        let id = ContentId::for_bytes(&bytes);
        self.blobs.write().entry(id.clone()).or_insert(bytes);
        Ok(id)
    }

    fn get(&self, id: &ContentId) -> Result<Vec<u8>, Error> {
        self.blobs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::BlobNotFound(id.to_string()))
    }
}

/// What a stored score covers.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScoreScope {
    Disease(String),
    /// Cross-disease total over the listed diseases
    Aggregate { diseases: Vec<String> },
}

/// A persisted encrypted score.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub user: UserId,
    pub scope: ScoreScope,
    pub cid: ContentId,
    pub computed_at: DateTime<Utc>,
    /// JSON of the aggregation parameters the score was computed with
    pub parameters: String,
}

pub trait ResultSink: Send + Sync {
    fn store(&self, record: ScoreRecord) -> Result<(), Error>;
}

#[derive(Debug, Default)]
pub struct MemoryResultSink {
    records: Mutex<Vec<ScoreRecord>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ScoreRecord> {
        self.records.lock().clone()
    }

    /// Latest record for `user` in `scope`.
    pub fn latest(&self, user: &UserId, scope: &ScoreScope) -> Option<ScoreRecord> {
        self.records
            .lock()
            .iter()
            .rev()
            .find(|record| &record.user == user && &record.scope == scope)
            .cloned()
    }
}

impl ResultSink for MemoryResultSink {
    fn store(&self, record: ScoreRecord) -> Result<(), Error> {
        self.records.lock().push(record);
        Ok(())
    }
}

/// Serializable description of one disease graph whose health payloads live
/// in a blob store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub disease_id: String,
    pub users: Vec<UserId>,
    pub edges: Vec<(UserId, UserId)>,
    pub health: BTreeMap<UserId, ContentId>,
    #[serde(default)]
    pub max_contacts: Option<usize>,
}

/// Serializes `ct` and stores it, returning its content id.
pub fn store_ciphertext<B: HomomorphicBackend>(
    ctx: &SchemeContext<B>,
    store: &dyn BlobStore,
    ct: &Ciphertext<B>,
) -> Result<ContentId, Error> {
    store.put(ctx.serialize(ct)?)
}

/// Fetches and decodes the ciphertext stored under `id`.
pub fn load_ciphertext<B: HomomorphicBackend>(
    ctx: &SchemeContext<B>,
    store: &dyn BlobStore,
    id: &ContentId,
) -> Result<Ciphertext<B>, Error> {
    ctx.deserialize(&store.get(id)?)
}

/// Resolves a snapshot into an encrypted graph.
///
/// A malformed contact list fails the whole snapshot. Health entries that
/// cannot be fetched or decoded, or that name unknown users, are reported
/// per user; those users keep no health entry.
#[instrument(level = "info", skip_all, fields(disease = %snapshot.disease_id, users = snapshot.users.len()))]
pub fn load_disease_graph<B: HomomorphicBackend>(
    ctx: &SchemeContext<B>,
    store: &dyn BlobStore,
    snapshot: GraphSnapshot,
) -> Result<(DiseaseGraph<Ciphertext<B>>, BTreeMap<UserId, Error>), Error> {
    let mut graph: DiseaseGraph<ContentId> = DiseaseGraph::new(snapshot.disease_id);
    if let Some(limit) = snapshot.max_contacts {
        graph = graph.with_max_contacts(limit);
    }
    for user in snapshot.users {
        graph.add_user(user);
    }
    for (a, b) in &snapshot.edges {
        graph.add_contact(a, b)?;
    }

    let mut unknown = BTreeMap::new();
    for (user, cid) in snapshot.health {
        if let Err(err) = graph.set_health(&user, cid) {
            unknown.insert(user, err);
        }
    }

    let (graph, mut failures) = graph.resolve_health(|_, cid| load_ciphertext(ctx, store, &cid));
    failures.extend(unknown);
    for (user, err) in &failures {
        warn!(disease = graph.disease_id(), %user, error = %err, "health entry unavailable");
    }
    Ok((graph, failures))
}

#[derive(Serialize)]
struct RecordParameters<'a> {
    aggregation: &'a AggregationConfig,
    diseases: Vec<&'a str>,
}

/// Stores every score of `result` and emits one [`ScoreRecord`] per score.
#[instrument(level = "info", skip_all, fields(diseases = result.diseases.len()))]
pub fn persist_result<B: HomomorphicBackend>(
    ctx: &SchemeContext<B>,
    store: &dyn BlobStore,
    sink: &dyn ResultSink,
    result: &EncryptedIvsResult<Ciphertext<B>>,
    config: &AggregationConfig,
) -> Result<BatchOutcome<(ScoreScope, UserId), ContentId>, Error> {
    let disease_ids: Vec<&str> = result.diseases.iter().map(|d| d.disease_id.as_str()).collect();
    let parameters = serde_json::to_string(&RecordParameters {
        aggregation: config,
        diseases: disease_ids.clone(),
    })
    .map_err(|err| BackendError::Serialization(err.to_string()))?;
    let computed_at = Utc::now();

    let mut outcome = BatchOutcome::new();
    let mut persist = |scope: ScoreScope, user: &UserId, ct: &Ciphertext<B>| {
        let stored = store_ciphertext(ctx, store, ct).and_then(|cid| {
            sink.store(ScoreRecord {
                user: user.clone(),
                scope: scope.clone(),
                cid: cid.clone(),
                computed_at,
                parameters: parameters.clone(),
            })?;
            Ok(cid)
        });
        outcome.record((scope, user.clone()), stored);
    };

    for disease in &result.diseases {
        for (user, ct) in &disease.scores {
            persist(ScoreScope::Disease(disease.disease_id.clone()), user, ct);
        }
    }
    if let Some(totals) = &result.totals {
        let scope = ScoreScope::Aggregate {
            diseases: disease_ids.iter().map(|id| id.to_string()).collect(),
        };
        for (user, ct) in &totals.succeeded {
            persist(scope.clone(), user, ct);
        }
    }

    debug!(
        stored = outcome.succeeded.len(),
        failed = outcome.failed.len(),
        "scores persisted"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{EncryptedAggregator, reference_ivs};
    use crate::backend::{CiphertextMeta, RnsCkks};
    use crate::test_support::{decrypt_all, setup};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn user(id: &str) -> UserId {
        UserId::from(id)
    }

    #[test]
    fn content_ids_are_blake3_hex() {
        let id = ContentId::for_bytes(b"health");
        assert_eq!(id.as_str().len(), 64);
        assert_eq!(id, ContentId::for_bytes(b"health"));
        assert_ne!(id, ContentId::for_bytes(b"health!"));

        let store = MemoryBlobStore::new();
        let stored = store.put(b"health".to_vec()).expect("put");
        assert_eq!(stored, id);
        assert_eq!(store.get(&id).expect("get"), b"health");
        assert!(matches!(
            store.get(&ContentId::new("missing")),
            Err(Error::BlobNotFound(_))
        ));
    }

    #[test]
    fn snapshots_resolve_with_per_user_failures() {
        let (ctx, shares) = setup(vec![60, 40, 40, 60], 3, 2);
        let store = MemoryBlobStore::new();
        let mut rng = StdRng::seed_from_u64(21);
        let ct = ctx.encrypt(&mut rng, &[1.0]).expect("encrypt");
        let good = store_ciphertext(&ctx, &store, &ct).expect("store");
        let garbage = store.put(b"not a ciphertext".to_vec()).expect("put");

        let snapshot = GraphSnapshot {
            disease_id: "A".into(),
            users: vec![user("a"), user("b"), user("c")],
            edges: vec![(user("a"), user("b")), (user("b"), user("c"))],
            health: BTreeMap::from([
                (user("a"), good),
                (user("b"), garbage),
                (user("c"), ContentId::new("missing")),
                (user("z"), ContentId::new("missing")),
            ]),
            max_contacts: None,
        };
        let (graph, failures) = load_disease_graph(&ctx, &store, snapshot).expect("load");
        assert_eq!(graph.edge_count(), 2);
        let a = graph.health(&user("a")).expect("resolved");
        assert_eq!(a.level(), ct.level());
        assert!((decrypt_all(&ctx, &shares, a)[0] - 1.0).abs() < 1e-6);
        assert!(graph.health(&user("b")).is_none());
        assert!(matches!(failures.get(&user("b")), Some(Error::Deserialization(_))));
        assert!(matches!(failures.get(&user("c")), Some(Error::BlobNotFound(_))));
        assert!(matches!(failures.get(&user("z")), Some(Error::UnknownUser(_))));
    }

    #[test]
    fn malformed_edges_fail_the_snapshot() {
        let (ctx, _) = setup(vec![60, 40], 1, 1);
        let snapshot = GraphSnapshot {
            disease_id: "A".into(),
            users: vec![user("a")],
            edges: vec![(user("a"), user("ghost"))],
            ..GraphSnapshot::default()
        };
        assert!(matches!(
            load_disease_graph(&ctx, &MemoryBlobStore::new(), snapshot),
            Err(Error::UnknownUser(_))
        ));
    }

    #[test]
    fn persisted_scores_decrypt_to_plaintext_scores() {
        let (ctx, shares) = setup(vec![60, 40, 40, 60], 3, 2);
        let mut plain: DiseaseGraph<f64> =
            DiseaseGraph::from_edges("A", ["a", "b"], [(user("a"), user("b"))]).expect("graph");
        plain.set_health(&user("b"), 1.0).expect("known");

        let mut rng = StdRng::seed_from_u64(22);
        let mut encrypted: DiseaseGraph<Ciphertext<RnsCkks>> =
            DiseaseGraph::from_edges("A", ["a", "b"], [(user("a"), user("b"))]).expect("graph");
        let ct = ctx.encrypt(&mut rng, &[1.0]).expect("encrypt");
        encrypted.set_health(&user("b"), ct).expect("known");

        let config = AggregationConfig::default();
        let aggregator = EncryptedAggregator::new(&ctx, config.clone())
            .expect("aggregator")
            .with_seed([3u8; 32]);
        let result = aggregator.run(&[encrypted]);

        let store = MemoryBlobStore::new();
        let sink = MemoryResultSink::new();
        let outcome = persist_result(&ctx, &store, &sink, &result, &config).expect("persist");
        // two per-disease scores plus two totals
        assert_eq!(outcome.succeeded.len(), 4);
        assert!(outcome.failed.is_empty());
        assert_eq!(sink.records().len(), 4);

        let expected = reference_ivs(&plain, config.max_depth);
        let record = sink
            .latest(&user("a"), &ScoreScope::Disease("A".into()))
            .expect("record");
        let parameters: serde_json::Value = serde_json::from_str(&record.parameters).expect("json");
        assert_eq!(parameters["aggregation"]["max_depth"], 2);
        assert_eq!(parameters["diseases"][0], "A");

        let stored = load_ciphertext(&ctx, &store, &record.cid).expect("load");
        let value = decrypt_all(&ctx, &shares, &stored)[0];
        assert!((value - expected[&user("a")]).abs() < 1e-3);
    }
}
