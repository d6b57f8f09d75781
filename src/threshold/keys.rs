use core::fmt;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::backend::HomomorphicBackend;
use crate::context::Ciphertext;
use crate::errors::{BackendError, Error};
use crate::serde_impl::{self, ArtifactKind, KeyShareRecord};
use crate::threshold::decryptor::{PartialDecryption, PartialProof};

/// A committee member as registered for key generation.
///
/// # Fields
///
/// - `id`: unique member identifier, also used as the key share's party id
/// - `address`: network address the member's decryption service listens on
/// - `public_key`: optional transport key for delivering the share
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeMember {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub public_key: Option<Vec<u8>>,
}

impl CommitteeMember {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            public_key: None,
        }
    }

    pub fn with_public_key(mut self, key: Vec<u8>) -> Self {
        self.public_key = Some(key);
        self
    }
}

/// One member's share of the joint secret key.
///
/// The share index is the evaluation point of the sharing polynomial
/// (`1..=N`, in committee order). Fewer than `T` shares reveal nothing about
/// the joint secret.
pub struct KeyShare<B: HomomorphicBackend> {
    party_id: String,
    share_index: u32,
    secret: B::Secret,
    joint_public_key: B::PublicKey,
}

impl<B: HomomorphicBackend> Clone for KeyShare<B> {
    fn clone(&self) -> Self {
        Self {
            party_id: self.party_id.clone(),
            share_index: self.share_index,
            secret: self.secret.clone(),
            joint_public_key: self.joint_public_key.clone(),
        }
    }
}

impl<B: HomomorphicBackend> fmt::Debug for KeyShare<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyShare")
            .field("party_id", &self.party_id)
            .field("share_index", &self.share_index)
            .finish_non_exhaustive()
    }
}

impl<B: HomomorphicBackend> KeyShare<B> {
    pub(crate) fn new(
        party_id: String,
        share_index: u32,
        secret: B::Secret,
        joint_public_key: B::PublicKey,
    ) -> Self {
        Self {
            party_id,
            share_index,
            secret,
            joint_public_key,
        }
    }

    pub fn party_id(&self) -> &str {
        &self.party_id
    }

    pub fn share_index(&self) -> u32 {
        self.share_index
    }

    pub fn joint_public_key(&self) -> &B::PublicKey {
        &self.joint_public_key
    }

    pub(crate) fn secret(&self) -> &B::Secret {
        &self.secret
    }

    /// Computes this member's partial decryption of `ct`, optionally with a
    /// transcript proof binding it to the ciphertext and the joint key.
    #[instrument(level = "debug", skip_all, fields(party = %self.party_id, index = self.share_index))]
    pub fn partial_decrypt(
        &self,
        backend: &B,
        ct: &Ciphertext<B>,
        with_proof: bool,
    ) -> Result<PartialDecryption<B>, Error> {
        let partial = backend.decrypt_share(ct, &self.secret)?;
        let proof = if with_proof {
            Some(PartialProof::create(
                backend,
                ct,
                &self.joint_public_key,
                self.share_index,
                &partial,
            )?)
        } else {
            None
        };
        Ok(PartialDecryption {
            party_id: self.party_id.clone(),
            share_index: self.share_index,
            partial,
            proof,
        })
    }

    /// Serializes the share for delivery to its owner.
    pub fn to_bytes(&self, backend: &B) -> Result<Vec<u8>, Error> {
        let record = KeyShareRecord {
            party_id: self.party_id.clone(),
            share_index: self.share_index,
            secret: backend.encode_secret(&self.secret)?,
            joint_public_key: backend.encode_public_key(&self.joint_public_key)?,
        };
        Ok(serde_impl::encode(ArtifactKind::KeyShare, &record)?)
    }

    /// Inverse of [`KeyShare::to_bytes`].
    pub fn from_bytes(backend: &B, bytes: &[u8]) -> Result<Self, Error> {
        let decode = || -> Result<Self, BackendError> {
            let record: KeyShareRecord = serde_impl::decode(ArtifactKind::KeyShare, bytes)?;
            if record.share_index == 0 {
                return Err(BackendError::Serialization("share index must be positive".into()));
            }
            Ok(Self {
                party_id: record.party_id.clone(),
                share_index: record.share_index,
                secret: backend.decode_secret(&record.secret)?,
                joint_public_key: backend.decode_public_key(&record.joint_public_key)?,
            })
        };
        decode().map_err(|err| Error::Deserialization(err.to_string()))
    }
}

/// Output of distributed key generation.
pub struct KeyGenOutput<B: HomomorphicBackend> {
    pub joint_public_key: B::PublicKey,
    /// One share per committee member, in committee order
    pub shares: Vec<KeyShare<B>>,
}

impl<B: HomomorphicBackend> fmt::Debug for KeyGenOutput<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGenOutput")
            .field("shares", &self.shares)
            .finish_non_exhaustive()
    }
}
