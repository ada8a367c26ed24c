//! Filter evaluation, stored replay, and live broadcast routing (spec
//! §4.4).

pub mod search;

use std::collections::HashMap;

use crate::cancel::CancelToken;
use crate::event::Event;
use crate::filter::{effective_limit, Filter};
use crate::kind;
use crate::storage::{Storage, StorageError};

/// A client's live subscriptions: `sub_id -> filters`, disjoint per spec §3
/// ("replaced if the same id is re-requested").
#[derive(Default)]
pub struct SubscriptionTable {
    subs: HashMap<String, Vec<Filter>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `filters` under `sub_id`, replacing any prior subscription
    /// with that id.
    pub fn insert(&mut self, sub_id: String, filters: Vec<Filter>) {
        self.subs.insert(sub_id, filters);
    }

    pub fn remove(&mut self, sub_id: &str) -> Option<Vec<Filter>> {
        self.subs.remove(sub_id)
    }

    pub fn get(&self, sub_id: &str) -> Option<&Vec<Filter>> {
        self.subs.get(sub_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Filter>)> {
        self.subs.iter()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}

/// Gift-wrap events (kind 1059) deliver only to a filter that explicitly
/// asks for this recipient via `#p`; every other kind passes through
/// unconditionally (spec §4.2, §4.4).
pub fn gift_wrap_gate(event: &Event, filter: &Filter) -> bool {
    if event.kind != kind::GIFT_WRAP {
        return true;
    }
    let Some(recipient) = kind::gift_wrap_recipient(event) else {
        return false;
    };
    filter
        .tags
        .0
        .get("p")
        .map(|values| values.iter().any(|v| recipient.starts_with(v.as_str())))
        .unwrap_or(false)
}

fn search_ok(filter: &Filter, event: &Event) -> bool {
    match filter.search.as_deref() {
        Some(s) if !s.is_empty() => search::evaluate(s, event),
        _ => true,
    }
}

fn filter_admits(filter: &Filter, event: &Event) -> bool {
    filter.matches(event) && gift_wrap_gate(event, filter) && search_ok(filter, event)
}

/// True iff `event` satisfies at least one filter in `filters` (the
/// disjunction of spec §3), subject to the gift-wrap and search gates, and
/// has not expired as of `now`. Used both for live delivery and for
/// re-checking storage-query candidates during stored replay.
pub fn is_deliverable(filters: &[Filter], event: &Event, now: i64) -> bool {
    if event.is_expired(now) {
        return false;
    }
    filters.iter().any(|f| filter_admits(f, event))
}

/// Stored-event replay for a newly (re)registered subscription (spec
/// §4.4). Always re-checks storage-query candidates in-memory against the
/// gift-wrap gate and the search sub-language — a no-op re-check when
/// neither applies — so that limit truncation happens after those gates
/// rather than before.
pub async fn stored_replay(
    storage: &dyn Storage,
    filters: &[Filter],
    cancel: &CancelToken,
) -> Result<Vec<Event>, StorageError> {
    if filters.is_empty() {
        return Ok(Vec::new());
    }
    let unlimited: Vec<Filter> = filters
        .iter()
        .map(|f| Filter {
            limit: None,
            search: None,
            ..f.clone()
        })
        .collect();
    let candidates = storage.query(&unlimited, cancel).await?;

    let mut results: Vec<Event> = candidates
        .into_iter()
        .filter(|e| filters.iter().any(|f| filter_admits(f, e)))
        .collect();

    if let Some(limit) = effective_limit(filters) {
        results.truncate(limit as usize);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_support::signed_event;
    use crate::event::Tag;
    use crate::storage::memory::MemoryStore;

    fn cancel() -> CancelToken {
        CancelToken::new()
    }

    #[tokio::test]
    async fn stored_replay_applies_search_after_storage_query() {
        let store = MemoryStore::new();
        let a = signed_event(1, "blockchain news", vec![], 1000);
        let b = signed_event(1, "crypto news", vec![], 1001);
        let c = signed_event(1, "unrelated", vec![], 1002);
        store.save(a.clone(), &cancel()).await.unwrap();
        store.save(b, &cancel()).await.unwrap();
        store.save(c, &cancel()).await.unwrap();

        let filters = vec![Filter {
            search: Some("news -crypto".into()),
            ..Default::default()
        }];
        let results = stored_replay(&store, &filters, &cancel()).await.unwrap();
        assert_eq!(results, vec![a]);
    }

    #[tokio::test]
    async fn stored_replay_truncates_to_limit_after_gating() {
        let store = MemoryStore::new();
        let recipient = "a".repeat(64);
        let wrap_for_recipient =
            signed_event(kind::GIFT_WRAP, "x", vec![Tag::new(vec!["p".into(), recipient.clone()])], 1000);
        let wrap_for_other = signed_event(
            kind::GIFT_WRAP,
            "y",
            vec![Tag::new(vec!["p".into(), "b".repeat(64)])],
            1001,
        );
        store.save(wrap_for_recipient.clone(), &cancel()).await.unwrap();
        store.save(wrap_for_other, &cancel()).await.unwrap();

        let mut tags = std::collections::HashMap::new();
        tags.insert("p".to_string(), vec![recipient]);
        let filters = vec![Filter {
            kinds: Some(vec![kind::GIFT_WRAP]),
            tags: crate::filter::TagFilters(tags),
            limit: Some(10),
            ..Default::default()
        }];
        let results = stored_replay(&store, &filters, &cancel()).await.unwrap();
        assert_eq!(results, vec![wrap_for_recipient]);
    }

    #[test]
    fn gift_wrap_gate_requires_matching_p_tag_filter() {
        let recipient = "a".repeat(64);
        let e = signed_event(
            kind::GIFT_WRAP,
            "",
            vec![Tag::new(vec!["p".into(), recipient.clone()])],
            1000,
        );
        let mut tags = std::collections::HashMap::new();
        tags.insert("p".to_string(), vec![recipient]);
        let targeted = Filter {
            tags: crate::filter::TagFilters(tags),
            ..Default::default()
        };
        assert!(gift_wrap_gate(&e, &targeted));

        let untargeted = Filter::default();
        assert!(!gift_wrap_gate(&e, &untargeted));
    }

    #[test]
    fn non_gift_wrap_events_pass_the_gate_unconditionally() {
        let e = signed_event(1, "hi", vec![], 1000);
        assert!(gift_wrap_gate(&e, &Filter::default()));
    }

    #[test]
    fn subscription_table_replaces_on_reinsert_and_removes_on_close() {
        let mut table = SubscriptionTable::new();
        table.insert("s".into(), vec![Filter::default()]);
        assert_eq!(table.len(), 1);
        table.insert("s".into(), vec![Filter { limit: Some(1), ..Default::default() }]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("s").unwrap()[0].limit, Some(1));
        let removed = table.remove("s");
        assert!(removed.is_some());
        assert!(table.is_empty());
    }
}
