//! Decryption policies and audit events.
//!
//! Every decryptable artifact needs a registered [`DecryptionPolicy`];
//! artifacts without one are denied. Policies name the requesters allowed to
//! trigger a threshold decryption (or the wildcard `"*"`), whether all `N`
//! shares are required, whether the request is audited, and an optional
//! expiry.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::Error;
use crate::storage::ContentId;

/// Requester entry matching everyone.
pub const WILDCARD_REQUESTER: &str = "*";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionPolicy {
    pub allowed_requesters: BTreeSet<String>,
    /// Collect all `N` shares instead of a `T` quorum
    #[serde(default)]
    pub requires_all_shares: bool,
    #[serde(default)]
    pub audit_log: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl DecryptionPolicy {
    pub fn allow<I, S>(requesters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_requesters: requesters.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn allow_anyone() -> Self {
        Self::allow([WILDCARD_REQUESTER])
    }

    pub fn requiring_all_shares(mut self) -> Self {
        self.requires_all_shares = true;
        self
    }

    pub fn audited(mut self) -> Self {
        self.audit_log = true;
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn permits(&self, requester: &str) -> bool {
        self.allowed_requesters.contains(WILDCARD_REQUESTER)
            || self.allowed_requesters.contains(requester)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Policies keyed by artifact.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: RwLock<HashMap<ContentId, DecryptionPolicy>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a policy. An artifact's policy can only be replaced once it
    /// has expired.
    pub fn register(&self, artifact: ContentId, policy: DecryptionPolicy) -> Result<(), Error> {
        let mut policies = self.policies.write();
        if let Some(existing) = policies.get(&artifact) {
            if !existing.is_expired_at(Utc::now()) {
                return Err(Error::PolicyAlreadyRegistered(artifact.to_string()));
            }
        }
        debug!(%artifact, requesters = policy.allowed_requesters.len(), "policy registered");
        policies.insert(artifact, policy);
        Ok(())
    }

    pub fn get(&self, artifact: &ContentId) -> Option<DecryptionPolicy> {
        self.policies.read().get(artifact).cloned()
    }

    pub fn can_decrypt(&self, artifact: &ContentId, requester: &str) -> bool {
        self.can_decrypt_at(artifact, requester, Utc::now())
    }

    pub fn can_decrypt_at(&self, artifact: &ContentId, requester: &str, now: DateTime<Utc>) -> bool {
        self.authorize_at(artifact, requester, now).is_ok()
    }

    /// Returns the policy that admits `requester`, or why it does not.
    pub fn authorize(&self, artifact: &ContentId, requester: &str) -> Result<DecryptionPolicy, Error> {
        self.authorize_at(artifact, requester, Utc::now())
    }

    pub fn authorize_at(
        &self,
        artifact: &ContentId,
        requester: &str,
        now: DateTime<Utc>,
    ) -> Result<DecryptionPolicy, Error> {
        let policy = self
            .get(artifact)
            .ok_or_else(|| Error::PolicyNotFound(artifact.to_string()))?;
        if policy.is_expired_at(now) {
            return Err(Error::PolicyExpired(artifact.to_string()));
        }
        if !policy.permits(requester) {
            return Err(Error::Unauthorized {
                requester: requester.to_string(),
                artifact: artifact.to_string(),
            });
        }
        Ok(policy)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    Authorize,
    Combine,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    Granted,
    Denied(String),
    Decrypted { shares: Vec<u32> },
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub requester: String,
    pub artifact: ContentId,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
}

impl AuditEvent {
    pub fn now(requester: &str, artifact: &ContentId, action: AuditAction, outcome: AuditOutcome) -> Self {
        Self {
            requester: requester.to_string(),
            artifact: artifact.clone(),
            timestamp: Utc::now(),
            action,
            outcome,
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<(), Error>;
}

/// Keeps audit events in memory and mirrors them to the `tracing` log.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

impl AuditSink for MemoryAuditLog {
    fn record(&self, event: AuditEvent) -> Result<(), Error> {
        info!(
            requester = %event.requester,
            artifact = %event.artifact,
            action = ?event.action,
            outcome = ?event.outcome,
            "audit"
        );
        self.events.lock().push(event);
        Ok(())
    }
}
