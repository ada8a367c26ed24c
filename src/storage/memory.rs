//! The in-memory backend: the authoritative replacement/tombstone/ordering
//! behaviour mandated by spec §9 ("this spec mandates the in-memory
//! behaviour as the contract").

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{classify, replacement_order_key, ReplaceableClass, SaveOutcome, Storage, StorageError};
use crate::cancel::CancelToken;
use crate::event::Event;
use crate::filter::{effective_limit, Filter};
use crate::now_unix;

#[derive(Default)]
struct State {
    events: HashMap<String, Event>,
    tombstones: HashSet<String>,
    /// `(pubkey, kind)` -> id, for `ReplaceableClass::Regular`.
    regular_index: HashMap<(String, i64), String>,
    /// `(pubkey, kind, d)` -> id, for `ReplaceableClass::Addressable`.
    addressable_index: HashMap<(String, i64, String), String>,
}

/// A `Storage` implementation backed entirely by in-process memory. Intended
/// both as the reference backend and as the store used in tests.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_cancel(cancel: &CancelToken) -> Result<(), StorageError> {
        if cancel.is_cancelled() {
            Err(StorageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn save(&self, event: Event, cancel: &CancelToken) -> Result<SaveOutcome, StorageError> {
        Self::check_cancel(cancel)?;
        let mut state = self
            .state
            .write()
            .map_err(|_| StorageError::Backend("store lock poisoned".into()))?;

        if state.tombstones.contains(&event.id) {
            return Err(StorageError::Deleted);
        }
        if state.events.contains_key(&event.id) {
            return Ok(SaveOutcome::Duplicate);
        }

        match classify(event.kind) {
            ReplaceableClass::Regular => {
                let key = (event.pubkey.clone(), event.kind);
                save_replaceable(&mut state.regular_index, &mut state.events, key, event)
            }
            ReplaceableClass::Addressable => {
                let key = (event.pubkey.clone(), event.kind, event.d_tag_value());
                save_replaceable(&mut state.addressable_index, &mut state.events, key, event)
            }
            ReplaceableClass::NonReplaceable => {
                let id = event.id.clone();
                state.events.insert(id, event);
                Ok(SaveOutcome::Inserted)
            }
        }
    }

    async fn query(
        &self,
        filters: &[Filter],
        cancel: &CancelToken,
    ) -> Result<Vec<Event>, StorageError> {
        Self::check_cancel(cancel)?;
        let state = self
            .state
            .read()
            .map_err(|_| StorageError::Backend("store lock poisoned".into()))?;
        let now = now_unix();

        let mut matched: Vec<&Event> = state
            .events
            .values()
            .filter(|e| !state.tombstones.contains(&e.id))
            .filter(|e| !e.is_expired(now))
            .filter(|e| filters.is_empty() || filters.iter().any(|f| f.matches(e)))
            .collect();

        matched.sort_by(|a, b| replacement_order_key(b).cmp(&replacement_order_key(a)));

        let mut seen = HashSet::new();
        matched.retain(|e| seen.insert(e.id.clone()));

        if let Some(limit) = effective_limit(filters) {
            matched.truncate(limit as usize);
        }

        Ok(matched.into_iter().cloned().collect())
    }

    async fn count(&self, filters: &[Filter], cancel: &CancelToken) -> Result<u64, StorageError> {
        Self::check_cancel(cancel)?;
        let state = self
            .state
            .read()
            .map_err(|_| StorageError::Backend("store lock poisoned".into()))?;
        let now = now_unix();
        let count = state
            .events
            .values()
            .filter(|e| !state.tombstones.contains(&e.id))
            .filter(|e| !e.is_expired(now))
            .filter(|e| filters.is_empty() || filters.iter().any(|f| f.matches(e)))
            .count();
        Ok(count as u64)
    }

    async fn get(&self, id: &str, cancel: &CancelToken) -> Result<Event, StorageError> {
        Self::check_cancel(cancel)?;
        let state = self
            .state
            .read()
            .map_err(|_| StorageError::Backend("store lock poisoned".into()))?;
        if state.tombstones.contains(id) {
            return Err(StorageError::Deleted);
        }
        state.events.get(id).cloned().ok_or(StorageError::NotFound)
    }

    async fn tombstone(
        &self,
        id: &str,
        requester_pubkey: &str,
        cancel: &CancelToken,
    ) -> Result<(), StorageError> {
        Self::check_cancel(cancel)?;
        let mut state = self
            .state
            .write()
            .map_err(|_| StorageError::Backend("store lock poisoned".into()))?;
        let Some(event) = state.events.get(id) else {
            return Err(StorageError::NotFound);
        };
        if event.pubkey != requester_pubkey {
            return Err(StorageError::Unauthorized);
        }
        state.tombstones.insert(id.to_string());
        Ok(())
    }

    async fn tombstone_all_by(&self, pubkey: &str, cancel: &CancelToken) -> Result<u64, StorageError> {
        Self::check_cancel(cancel)?;
        let mut state = self
            .state
            .write()
            .map_err(|_| StorageError::Backend("store lock poisoned".into()))?;
        let ids: Vec<String> = state
            .events
            .values()
            .filter(|e| e.pubkey == pubkey)
            .map(|e| e.id.clone())
            .collect();
        for id in &ids {
            state.tombstones.insert(id.clone());
        }
        Ok(ids.len() as u64)
    }

    async fn close(&self) {
        // Nothing to release: the store is entirely in-process memory.
    }
}

/// Apply the `(created_at, id)` comparator of spec §3 for a replaceable
/// identity key shared by regular and addressable classes.
fn save_replaceable<K: std::hash::Hash + Eq>(
    index: &mut HashMap<K, String>,
    events: &mut HashMap<String, Event>,
    key: K,
    incoming: Event,
) -> Result<SaveOutcome, StorageError> {
    match index.get(&key) {
        Some(existing_id) => {
            let existing = events
                .get(existing_id)
                .expect("replaceable index entry without a backing event");
            if replacement_order_key(existing) >= replacement_order_key(&incoming) {
                return Ok(SaveOutcome::Discarded);
            }
            let existing_id = existing_id.clone();
            events.remove(&existing_id);
            let id = incoming.id.clone();
            index.insert(key, id.clone());
            events.insert(id, incoming);
            Ok(SaveOutcome::Replaced)
        }
        None => {
            let id = incoming.id.clone();
            index.insert(key, id.clone());
            events.insert(id, incoming);
            Ok(SaveOutcome::Inserted)
        }
    }
}
