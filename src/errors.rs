//! Error types for the crate.
//!
//! This module defines low-level backend errors returned by homomorphic
//! backend implementations as well as the high-level `Error` type used by
//! the aggregation and threshold layers.
//!
//! The errors are implemented with `thiserror` so they are easy to convert
//! and debug in higher-level code. Batch operations report per-item
//! failures through [`BatchOutcome`] instead of aborting the whole batch.
//!
//! # Examples
//!
//! ```rust
//! use ivs_fhe::errors::{BackendError, Error};
//!
//! let err: Error = BackendError::RescaleUnavailable { level: 0 }.into();
//! assert!(err.to_string().contains("rescale"));
//! ```

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors bubbled up from homomorphic backend implementations.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unsupported parameters: {0}")]
    UnsupportedParameters(String),
    #[error("serialization failure: {0}")]
    Serialization(String),
    #[error("math error: {0}")]
    Math(&'static str),
    #[error("operand level mismatch: left {left}, right {right}")]
    LevelMismatch { left: usize, right: usize },
    #[error("level {target} unreachable from level {current}")]
    LevelUnreachable { current: usize, target: usize },
    #[error("rescale unavailable at level {level}")]
    RescaleUnavailable { level: usize },
    #[error("scale 2^{scale_bits:.1} exceeds the {modulus_bits}-bit modulus at this level")]
    ScaleOverflow { scale_bits: f64, modulus_bits: u32 },
    #[error("too many values: capacity {capacity}, provided {provided}")]
    CapacityExceeded { capacity: usize, provided: usize },
    #[error("{0}")]
    Other(String),
}

/// High-level errors returned by the aggregation and threshold APIs.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("committee size mismatch: expected {expected}, got {actual}")]
    CommitteeSizeMismatch { expected: usize, actual: usize },
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("deserialization failed: {0}")]
    Deserialization(String),
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("user {user} already has the maximum of {limit} contacts")]
    TooManyContacts { user: String, limit: usize },
    #[error("no decryption policy registered for artifact {0}")]
    PolicyNotFound(String),
    #[error("decryption policy already registered for artifact {0}")]
    PolicyAlreadyRegistered(String),
    #[error("decryption policy for artifact {0} has expired")]
    PolicyExpired(String),
    #[error("requester {requester} is not authorized to decrypt artifact {artifact}")]
    Unauthorized { requester: String, artifact: String },
    #[error("insufficient shares: required {required}, provided {provided}")]
    InsufficientShares { required: usize, provided: usize },
    #[error("blob not found: {0}")]
    BlobNotFound(String),
    #[error("audit sink failure: {0}")]
    Audit(String),
    #[error("unknown recompute request {0}")]
    UnknownRequest(u64),
}

impl Error {
    /// Returns `true` when the error came from a rescale attempted at the
    /// bottom of the modulus chain.
    pub fn is_rescale_unavailable(&self) -> bool {
        matches!(self, Error::Backend(BackendError::RescaleUnavailable { .. }))
    }
}

/// Per-item results of a batch operation.
///
/// A failing item never aborts its siblings; callers inspect `failed` to
/// decide whether to retry or surface the gaps.
#[derive(Debug)]
pub struct BatchOutcome<K, T> {
    pub succeeded: BTreeMap<K, T>,
    pub failed: BTreeMap<K, Error>,
}

impl<K: Ord, T> BatchOutcome<K, T> {
    pub fn new() -> Self {
        Self {
            succeeded: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }

    /// Files `result` under `key` in the matching bucket.
    pub fn record(&mut self, key: K, result: Result<T, Error>) {
        match result {
            Ok(value) => {
                self.succeeded.insert(key, value);
            }
            Err(err) => {
                self.failed.insert(key, err);
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Ord, T> Default for BatchOutcome<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, T> FromIterator<(K, Result<T, Error>)> for BatchOutcome<K, T> {
    fn from_iter<I: IntoIterator<Item = (K, Result<T, Error>)>>(iter: I) -> Self {
        let mut outcome = Self::new();
        for (key, result) in iter {
            outcome.record(key, result);
        }
        outcome
    }
}
