use std::collections::BTreeMap;
use std::sync::Arc;

use rand::{SeedableRng, rngs::StdRng};
use tracing::info;
use tracing_subscriber::fmt;

use ivs_fhe::aggregator::{EncryptedAggregator, reference_ivs, reference_totals};
use ivs_fhe::backend::RnsCkks;
use ivs_fhe::graph::{DiseaseGraph, UserId};
use ivs_fhe::jobs::RecomputeQueue;
use ivs_fhe::policy::{DecryptionPolicy, MemoryAuditLog, PolicyRegistry};
use ivs_fhe::storage::{
    GraphSnapshot, MemoryBlobStore, MemoryResultSink, ScoreScope, load_disease_graph, persist_result,
    store_ciphertext,
};
use ivs_fhe::threshold::{
    CommitteeMember, DecryptionRequest, LocalMember, PartialDecryptionSource, ThresholdDecryptor,
    ThresholdKeyCoordinator,
};
use ivs_fhe::{RunConfig, SchemeContext};

const USERS: [&str; 6] = ["U1", "U2", "U3", "U4", "U5", "U6"];
const CONTACTS: [(&str, &str); 5] = [("U1", "U2"), ("U2", "U3"), ("U2", "U5"), ("U3", "U4"), ("U3", "U6")];

const CONFIG: &str = r#"{
    "scheme": { "ring_dimension": 1024, "modulus_bits": [60, 40, 40, 40, 60], "scale_bits": 40 },
    "threshold": { "total_shares": 5, "threshold": 3 },
    "aggregation": { "max_depth": 2 },
    "collection": { "timeout_ms": 2000 }
}"#;

fn plain_graph(disease: &str, infected: &[&str]) -> Result<DiseaseGraph<f64>, ivs_fhe::Error> {
    let edges = CONTACTS.map(|(a, b)| (UserId::from(a), UserId::from(b)));
    let mut graph = DiseaseGraph::from_edges(disease, USERS, edges)?;
    for user in USERS {
        let status = if infected.contains(&user) { 1.0 } else { 0.0 };
        graph.set_health(&UserId::from(user), status)?;
    }
    Ok(graph)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_max_level(tracing::Level::INFO)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .with_target(false)
        .with_ansi(false)
        .init();

    let config = RunConfig::from_json(CONFIG)?;
    let mut rng = StdRng::seed_from_u64(42);
    info!(
        parties = config.threshold.total_shares,
        threshold = config.threshold.threshold,
        ring_dimension = config.scheme.ring_dimension,
        "starting ivs pipeline"
    );

    // Key generation
    let backend = RnsCkks::new(config.scheme.clone())?;
    let coordinator = ThresholdKeyCoordinator::new(&backend, config.threshold.clone())?;
    let committee: Vec<_> = (0..config.threshold.total_shares)
        .map(|i| CommitteeMember::new(format!("member-{i}"), format!("10.0.0.{i}:9000")))
        .collect();
    let keys = coordinator.generate_keys(&mut rng, &committee)?;
    let ctx = SchemeContext::new(backend.clone(), keys.joint_public_key.clone());

    // Users upload encrypted health; the tracker publishes snapshots
    let store = MemoryBlobStore::new();
    let plain = [plain_graph("A", &["U2", "U6"])?, plain_graph("B", &["U1", "U5"])?];
    let mut graphs = BTreeMap::new();
    for disease in &plain {
        let mut health = BTreeMap::new();
        for (user, status) in disease.health_entries() {
            let ct = ctx.encrypt(&mut rng, &[*status])?;
            health.insert(user.clone(), store_ciphertext(&ctx, &store, &ct)?);
        }
        let snapshot = GraphSnapshot {
            disease_id: disease.disease_id().to_string(),
            users: disease.users().cloned().collect(),
            edges: CONTACTS.map(|(a, b)| (UserId::from(a), UserId::from(b))).to_vec(),
            health,
            max_contacts: None,
        };
        let (graph, failures) = load_disease_graph(&ctx, &store, snapshot)?;
        info!(disease = graph.disease_id(), failures = failures.len(), "graph loaded");
        graphs.insert(graph.disease_id().to_string(), graph);
    }

    // Aggregation
    let aggregator = EncryptedAggregator::new(&ctx, config.aggregation.clone())?;
    let encrypted: Vec<_> = graphs.values().cloned().collect();
    let result = aggregator.run(&encrypted);
    let sink = MemoryResultSink::new();
    let persisted = persist_result(&ctx, &store, &sink, &result, &config.aggregation)?;
    info!(
        stored = persisted.succeeded.len(),
        failed = persisted.failed.len(),
        skipped_rescales = result.numeric.skipped_rescales,
        "scores persisted"
    );

    // Threshold decryption of every total
    let policies = PolicyRegistry::new();
    let audit = MemoryAuditLog::new();
    let decryptor = ThresholdDecryptor::new(&ctx, config.threshold.clone(), &policies, &audit)?;
    let members: Vec<Arc<dyn PartialDecryptionSource<RnsCkks>>> = keys
        .shares
        .iter()
        .map(|share| {
            Arc::new(LocalMember::new(backend.clone(), share.clone())) as Arc<dyn PartialDecryptionSource<RnsCkks>>
        })
        .collect();

    let expected = reference_totals(
        plain
            .iter()
            .map(|graph| reference_ivs(graph, config.aggregation.max_depth))
            .collect::<Vec<_>>()
            .iter(),
    );
    let scope = ScoreScope::Aggregate {
        diseases: vec!["A".into(), "B".into()],
    };
    for user in USERS.map(UserId::from) {
        let Some(record) = sink.latest(&user, &scope) else {
            continue;
        };
        policies.register(record.cid.clone(), DecryptionPolicy::allow(["health-authority"]).audited())?;
        let ct = ivs_fhe::storage::load_ciphertext(&ctx, &store, &record.cid)?;
        let mut request = DecryptionRequest::new(record.cid.clone(), "health-authority");
        let outcome = decryptor.decrypt(&mut request, &ct, &members, &config.collection).await?;
        info!(
            %user,
            ivs = outcome.values[0],
            expected = expected[&user],
            shares = ?outcome.used_shares,
            "total decrypted"
        );
    }
    info!(events = audit.events().len(), "audit trail recorded");

    // A targeted recompute for one user
    let queue = RecomputeQueue::new();
    let id = queue.submit("health-authority", vec!["A".into()], Some(UserId::from("U3")))?;
    if let Some((processed, outcome)) = queue.process_next(&aggregator, &graphs) {
        let status = queue.get(processed).map(|request| request.status);
        info!(id, processed, ok = outcome.is_ok(), ?status, "recompute processed");
    }

    Ok(())
}
