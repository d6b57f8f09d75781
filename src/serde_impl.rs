//! Byte codecs for ciphertexts, keys and partial decryptions.
//!
//! Every artifact that leaves the process (to the blob store, to a committee
//! member, to disk) is wrapped in a small envelope:
//!
//! ```text
//! ┌──────────┬─────────┬──────┬───────────────────────────┐
//! │ "IVS"    │ version │ kind │ fixed-int bincode body    │
//! │ 3 bytes  │ 1 byte  │ 1    │ rest                      │
//! └──────────┴─────────┴──────┴───────────────────────────┘
//! ```
//!
//! The body encoding is deterministic and rejects trailing bytes, so
//! `encode(decode(bytes)) == bytes` for every accepted input. Bodies are
//! bounded by [`MAX_ARTIFACT_BYTES`] before any allocation happens.
//!
//! Structural validation (limb counts, residue ranges) is the backend's job;
//! this module only guarantees the framing.

use bincode::Options;
use serde::Serialize;
use serde::de::DeserializeOwned;
use zeroize::Zeroize;

use crate::errors::BackendError;

const MAGIC: [u8; 3] = *b"IVS";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 5;

/// Upper bound on an encoded artifact body.
pub const MAX_ARTIFACT_BYTES: u64 = 1 << 30;

/// What an envelope carries; decoding with the wrong kind fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ArtifactKind {
    Ciphertext = 1,
    PublicKey = 2,
    Secret = 3,
    Partial = 4,
    KeyShare = 5,
}

impl ArtifactKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Ciphertext),
            2 => Some(Self::PublicKey),
            3 => Some(Self::Secret),
            4 => Some(Self::Partial),
            5 => Some(Self::KeyShare),
            _ => None,
        }
    }
}

fn body_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
        .with_limit(MAX_ARTIFACT_BYTES)
}

/// Wraps `value` in an envelope of the given kind.
pub fn encode<T: Serialize>(kind: ArtifactKind, value: &T) -> Result<Vec<u8>, BackendError> {
    let body = body_options()
        .serialize(value)
        .map_err(|err| BackendError::Serialization(err.to_string()))?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.push(kind as u8);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Opens an envelope, checking magic, version and kind.
pub fn decode<T: DeserializeOwned>(kind: ArtifactKind, bytes: &[u8]) -> Result<T, BackendError> {
    if bytes.len() < HEADER_LEN || bytes[..3] != MAGIC {
        return Err(BackendError::Serialization("missing artifact header".into()));
    }
    if bytes[3] != VERSION {
        return Err(BackendError::Serialization(format!(
            "unsupported artifact version {}",
            bytes[3]
        )));
    }
    match ArtifactKind::from_byte(bytes[4]) {
        Some(found) if found == kind => {}
        Some(found) => {
            return Err(BackendError::Serialization(format!(
                "expected {kind:?} artifact, found {found:?}"
            )));
        }
        None => {
            return Err(BackendError::Serialization(format!(
                "unknown artifact kind {}",
                bytes[4]
            )));
        }
    }
    body_options()
        .deserialize(&bytes[HEADER_LEN..])
        .map_err(|err| BackendError::Serialization(err.to_string()))
}

/// Wire form of a committee member's key share. The secret and public key
/// are nested backend envelopes.
#[derive(Serialize, serde::Deserialize)]
pub(crate) struct KeyShareRecord {
    pub party_id: String,
    pub share_index: u32,
    pub secret: Vec<u8>,
    pub joint_public_key: Vec<u8>,
}

impl Drop for KeyShareRecord {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
    struct Sample {
        values: Vec<u64>,
        scale: f64,
    }

    #[test]
    fn envelope_roundtrip_is_byte_exact() {
        let sample = Sample {
            values: vec![1, 2, u64::MAX],
            scale: 2f64.powi(40),
        };
        let bytes = encode(ArtifactKind::Ciphertext, &sample).expect("encode");
        let decoded: Sample = decode(ArtifactKind::Ciphertext, &bytes).expect("decode");
        assert_eq!(decoded, sample);
        assert_eq!(encode(ArtifactKind::Ciphertext, &decoded).expect("encode"), bytes);
    }

    #[test]
    fn rejects_wrong_kind_header_and_trailing_bytes() {
        let sample = Sample {
            values: vec![3],
            scale: 1.0,
        };
        let bytes = encode(ArtifactKind::Partial, &sample).expect("encode");

        assert!(decode::<Sample>(ArtifactKind::Ciphertext, &bytes).is_err());
        assert!(decode::<Sample>(ArtifactKind::Partial, &bytes[..4]).is_err());

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(decode::<Sample>(ArtifactKind::Partial, &trailing).is_err());

        let mut bad_magic = bytes;
        bad_magic[0] = b'X';
        assert!(decode::<Sample>(ArtifactKind::Partial, &bad_magic).is_err());
    }
}
