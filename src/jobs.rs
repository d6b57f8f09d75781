//! Recompute requests.
//!
//! A [`RecomputeRequest`] asks for the scores of a set of diseases to be
//! recomputed, for every user or for one target user. Requests move through
//! `Pending → InProgress → Completed | Failed`; workers claim the oldest
//! pending request and report back.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::aggregator::{DiseaseScores, EncryptedAggregator, EncryptedIvsResult};
use crate::backend::HomomorphicBackend;
use crate::context::Ciphertext;
use crate::errors::Error;
use crate::graph::{DiseaseGraph, UserId};

/// Default bound on the number of diseases in one request.
pub const MAX_REQUEST_DISEASES: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecomputeRequest {
    pub id: u64,
    pub requester: String,
    /// `None` recomputes every user
    pub target_user: Option<UserId>,
    pub disease_ids: Vec<String>,
    pub requested_at: DateTime<Utc>,
    pub status: RequestStatus,
    #[serde(default)]
    pub failure: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    requests: BTreeMap<u64, RecomputeRequest>,
}

#[derive(Debug)]
pub struct RecomputeQueue {
    max_diseases: usize,
    state: Mutex<QueueState>,
}

impl Default for RecomputeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RecomputeQueue {
    pub fn new() -> Self {
        Self::with_max_diseases(MAX_REQUEST_DISEASES)
    }

    pub fn with_max_diseases(max_diseases: usize) -> Self {
        Self {
            max_diseases,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Queues a request and returns its id.
    pub fn submit(
        &self,
        requester: impl Into<String>,
        disease_ids: Vec<String>,
        target_user: Option<UserId>,
    ) -> Result<u64, Error> {
        if disease_ids.is_empty() {
            return Err(Error::MalformedInput("recompute request names no disease".into()));
        }
        if disease_ids.len() > self.max_diseases {
            return Err(Error::MalformedInput(format!(
                "recompute request names {} diseases, limit is {}",
                disease_ids.len(),
                self.max_diseases
            )));
        }
        let distinct: BTreeSet<&String> = disease_ids.iter().collect();
        if distinct.len() != disease_ids.len() {
            return Err(Error::MalformedInput("duplicate disease in recompute request".into()));
        }

        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let request = RecomputeRequest {
            id,
            requester: requester.into(),
            target_user,
            disease_ids,
            requested_at: Utc::now(),
            status: RequestStatus::Pending,
            failure: None,
        };
        info!(id, requester = %request.requester, diseases = ?request.disease_ids, "recompute requested");
        state.requests.insert(id, request);
        Ok(id)
    }

    pub fn get(&self, id: u64) -> Option<RecomputeRequest> {
        self.state.lock().requests.get(&id).cloned()
    }

    /// Ids of pending requests, oldest first.
    pub fn pending(&self) -> Vec<u64> {
        self.state
            .lock()
            .requests
            .values()
            .filter(|request| request.status == RequestStatus::Pending)
            .map(|request| request.id)
            .collect()
    }

    /// Moves the oldest pending request to `InProgress` and returns it.
    pub fn claim_next(&self) -> Option<RecomputeRequest> {
        let mut state = self.state.lock();
        let request = state
            .requests
            .values_mut()
            .find(|request| request.status == RequestStatus::Pending)?;
        request.status = RequestStatus::InProgress;
        Some(request.clone())
    }

    pub fn complete(&self, id: u64) -> Result<(), Error> {
        self.finish(id, RequestStatus::Completed, None)
    }

    pub fn fail(&self, id: u64, reason: impl Into<String>) -> Result<(), Error> {
        self.finish(id, RequestStatus::Failed, Some(reason.into()))
    }

    fn finish(&self, id: u64, status: RequestStatus, failure: Option<String>) -> Result<(), Error> {
        let mut state = self.state.lock();
        let request = state.requests.get_mut(&id).ok_or(Error::UnknownRequest(id))?;
        if request.status != RequestStatus::InProgress {
            return Err(Error::MalformedInput(format!(
                "recompute request {id} is {:?}, not in progress",
                request.status
            )));
        }
        request.status = status;
        request.failure = failure;
        Ok(())
    }

    /// Claims the next request, runs it and records the outcome.
    pub fn process_next<B: HomomorphicBackend>(
        &self,
        aggregator: &EncryptedAggregator<'_, B>,
        graphs: &BTreeMap<String, DiseaseGraph<Ciphertext<B>>>,
    ) -> Option<(u64, Result<EncryptedIvsResult<Ciphertext<B>>, Error>)> {
        let request = self.claim_next()?;
        let result = execute_request(aggregator, &request, graphs);
        let recorded = match &result {
            Ok(_) => self.complete(request.id),
            Err(err) => {
                warn!(id = request.id, error = %err, "recompute failed");
                self.fail(request.id, err.to_string())
            }
        };
        match recorded {
            Ok(()) => Some((request.id, result)),
            Err(err) => Some((request.id, Err(err))),
        }
    }
}

/// Runs the aggregator over the requested diseases, in request order.
///
/// With a target user only that user's scores are computed; diseases the
/// user is not part of contribute nothing.
#[instrument(level = "info", skip_all, fields(id = request.id, diseases = request.disease_ids.len()))]
pub fn execute_request<B: HomomorphicBackend>(
    aggregator: &EncryptedAggregator<'_, B>,
    request: &RecomputeRequest,
    graphs: &BTreeMap<String, DiseaseGraph<Ciphertext<B>>>,
) -> Result<EncryptedIvsResult<Ciphertext<B>>, Error> {
    let selected = request
        .disease_ids
        .iter()
        .map(|id| {
            graphs
                .get(id)
                .ok_or_else(|| Error::MalformedInput(format!("unknown disease {id}")))
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let diseases: Vec<DiseaseScores<Ciphertext<B>>> = match &request.target_user {
        None => selected.iter().map(|graph| aggregator.score_disease(graph)).collect(),
        Some(target) => {
            if !selected.iter().any(|graph| graph.contains(target)) {
                return Err(Error::UnknownUser(target.to_string()));
            }
            selected
                .iter()
                .map(|graph| {
                    if graph.contains(target) {
                        aggregator.score_users(graph, std::slice::from_ref(target))
                    } else {
                        DiseaseScores {
                            disease_id: graph.disease_id().to_string(),
                            scores: BTreeMap::new(),
                            failures: BTreeMap::new(),
                        }
                    }
                })
                .collect()
        }
    };

    let totals = aggregator
        .config()
        .cross_disease
        .then(|| aggregator.aggregate(&diseases));
    Ok(EncryptedIvsResult {
        diseases,
        totals,
        numeric: aggregator.numeric_report(),
    })
}
