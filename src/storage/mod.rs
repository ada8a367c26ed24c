//! The storage contract (spec §4.3): replacement rules, tombstoning, and
//! count/query semantics, independent of backend.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::event::Event;
use crate::filter::Filter;
use crate::kind;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum StorageError {
    #[error("event is deleted")]
    Deleted,
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("operation cancelled")]
    Cancelled,
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result of a `save` call, distinguishing the replacement outcomes of
/// spec §3/§4.3. `Replaced` and `Discarded` only occur for replaceable
/// classes; `Duplicate` only for an id already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// No prior event under this identity; stored as new.
    Inserted,
    /// A prior event under the same identity existed and was superseded.
    Replaced,
    /// A prior event under the same identity outranks this one; this event
    /// was silently discarded, store unchanged.
    Discarded,
    /// An event with this exact id is already stored; no-op.
    Duplicate,
}

/// The three disjoint replaceable-class rule families of spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceableClass {
    /// Kind 0, kind 3, and `[10000, 20000)`: unique per `(pubkey, kind)`.
    Regular,
    /// `[30000, 40000)`: unique per `(pubkey, kind, d-tag value)`.
    Addressable,
    /// Every other kind: idempotent by id, no replacement.
    NonReplaceable,
}

pub fn classify(kind: i64) -> ReplaceableClass {
    if kind::is_regular_replaceable(kind) {
        ReplaceableClass::Regular
    } else if kind::is_addressable(kind) {
        ReplaceableClass::Addressable
    } else {
        ReplaceableClass::NonReplaceable
    }
}

/// `(created_at, id)` ordering used to decide which of two events under the
/// same identity wins (spec §3, §4.3): greater `created_at` wins; ties
/// broken by the lexicographically greater id.
pub fn replacement_order_key(event: &Event) -> (i64, &str) {
    (event.created_at, event.id.as_str())
}

/// A storage backend. Every operation accepts a cancellation token and MUST
/// return promptly once it observes cancellation, leaving the store either
/// fully applied or not applied at all (spec §4.3, §5).
#[async_trait]
pub trait Storage: Send + Sync {
    async fn save(&self, event: Event, cancel: &CancelToken) -> Result<SaveOutcome, StorageError>;

    async fn query(
        &self,
        filters: &[Filter],
        cancel: &CancelToken,
    ) -> Result<Vec<Event>, StorageError>;

    async fn count(&self, filters: &[Filter], cancel: &CancelToken) -> Result<u64, StorageError>;

    async fn get(&self, id: &str, cancel: &CancelToken) -> Result<Event, StorageError>;

    async fn tombstone(
        &self,
        id: &str,
        requester_pubkey: &str,
        cancel: &CancelToken,
    ) -> Result<(), StorageError>;

    async fn tombstone_all_by(&self, pubkey: &str, cancel: &CancelToken) -> Result<u64, StorageError>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_matches_spec_boundaries() {
        assert_eq!(classify(0), ReplaceableClass::Regular);
        assert_eq!(classify(3), ReplaceableClass::Regular);
        assert_eq!(classify(10000), ReplaceableClass::Regular);
        assert_eq!(classify(19999), ReplaceableClass::Regular);
        assert_eq!(classify(1), ReplaceableClass::NonReplaceable);
        assert_eq!(classify(30000), ReplaceableClass::Addressable);
        assert_eq!(classify(39999), ReplaceableClass::Addressable);
        assert_eq!(classify(40000), ReplaceableClass::NonReplaceable);
    }
}
