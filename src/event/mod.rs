//! The signed event: canonical serialization, identity derivation, and
//! Schnorr signature verification (spec §3, §4.1).

mod canonical;
mod tag;

pub use tag::Tag;

use secp256k1::{schnorr, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum EventError {
    #[error("invalid: {0}")]
    InvalidStructure(String),
    #[error("invalid: id does not match event contents")]
    IdMismatch,
    #[error("invalid: signature verification failed")]
    BadSignature,
}

/// The atomic unit of content (spec §3).
///
/// Unknown top-level JSON fields are preserved in `extra` so that
/// round-tripping an event with fields this relay does not recognise still
/// reproduces the same canonical form (and hence the same `id`) on replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub pubkey: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub kind: i64,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sig: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    /// Recompute this event's id from its contents (spec §4.1
    /// `serialize-for-id`).
    pub fn compute_id(&self) -> String {
        let canonical = canonical::serialize_for_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(digest)
    }

    /// Verify structural validity, id derivation, and the BIP-340 Schnorr
    /// signature (spec §4.1 `verify`).
    pub fn verify(&self) -> Result<(), EventError> {
        if self.pubkey.is_empty() || self.sig.is_empty() {
            return Err(EventError::InvalidStructure(
                "pubkey and sig are required".into(),
            ));
        }
        if self.kind < 0 {
            return Err(EventError::InvalidStructure("kind must be >= 0".into()));
        }
        let pubkey_bytes = hex::decode(&self.pubkey)
            .map_err(|_| EventError::InvalidStructure("pubkey is not valid hex".into()))?;
        if pubkey_bytes.len() != 32 {
            return Err(EventError::InvalidStructure(
                "pubkey must be 32 bytes".into(),
            ));
        }
        let sig_bytes = hex::decode(&self.sig)
            .map_err(|_| EventError::InvalidStructure("sig is not valid hex".into()))?;
        if sig_bytes.len() != 64 {
            return Err(EventError::InvalidStructure("sig must be 64 bytes".into()));
        }

        if self.compute_id() != self.id {
            return Err(EventError::IdMismatch);
        }

        let id_bytes = hex::decode(&self.id)
            .map_err(|_| EventError::InvalidStructure("id is not valid hex".into()))?;
        let xonly = XOnlyPublicKey::from_slice(&pubkey_bytes)
            .map_err(|_| EventError::InvalidStructure("pubkey is not a valid point".into()))?;
        let sig = schnorr::Signature::from_slice(&sig_bytes)
            .map_err(|_| EventError::InvalidStructure("sig is not a valid signature".into()))?;
        let msg = Message::from_digest_slice(&id_bytes)
            .map_err(|_| EventError::InvalidStructure("id is not a valid digest".into()))?;

        let secp = Secp256k1::verification_only();
        secp.verify_schnorr(&sig, &msg, &xonly)
            .map_err(|_| EventError::BadSignature)
    }

    /// True iff `e.tags` carries an `expiration` tag whose value has already
    /// passed relative to `now` (spec §4.1 `is-expired`).
    pub fn is_expired(&self, now: i64) -> bool {
        self.tags.iter().any(|t| {
            t.is_named("expiration")
                && t.value()
                    .and_then(|v| v.parse::<i64>().ok())
                    .map(|exp| exp <= now)
                    .unwrap_or(false)
        })
    }

    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> {
        self.tags.iter().filter(move |t| t.is_named(name))
    }

    /// The replacement identity tuple's `d` component for parameterised
    /// replaceable kinds: the second element of the first `d` tag, or an
    /// empty string if absent (spec §3).
    pub fn d_tag_value(&self) -> String {
        self.tags_named("d")
            .next()
            .and_then(|t| t.value())
            .unwrap_or("")
            .to_string()
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use rand::rngs::OsRng;
    use secp256k1::{Keypair, Secp256k1};

    /// Build and sign a kind-1 event with the given content/tags, for tests
    /// across the crate.
    pub fn signed_event(kind: i64, content: &str, tags: Vec<Tag>, created_at: i64) -> Event {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut OsRng);
        signed_event_with_keypair(&keypair, kind, content, tags, created_at)
    }

    pub fn new_keypair() -> secp256k1::Keypair {
        let secp = Secp256k1::new();
        Keypair::new(&secp, &mut OsRng)
    }

    pub fn signed_event_with_keypair(
        keypair: &secp256k1::Keypair,
        kind: i64,
        content: &str,
        tags: Vec<Tag>,
        created_at: i64,
    ) -> Event {
        let secp = Secp256k1::new();
        let (xonly, _parity) = keypair.x_only_public_key();
        let pubkey = hex::encode(xonly.serialize());
        let canonical = canonical::serialize_for_id(&pubkey, created_at, kind, &tags, content);
        let digest = Sha256::digest(canonical.as_bytes());
        let id = hex::encode(digest);
        let msg = Message::from_digest_slice(&digest).unwrap();
        let sig = secp.sign_schnorr(&msg, keypair);
        Event {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content: content.to_string(),
            sig: hex::encode(sig.as_ref()),
            extra: serde_json::Map::new(),
        }
    }
}
