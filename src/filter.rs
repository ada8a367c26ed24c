//! Subscription filters and the generic event-match predicate (spec §4.2,
//! §4.3).

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// A single subscription filter. Every populated field narrows the match;
/// an event must satisfy every populated field to match (spec §4.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    /// `#e`, `#p`, and any other single-letter tag filters, keyed by the
    /// letter without its leading `#`.
    #[serde(flatten)]
    pub tags: TagFilters,
}

/// Tag filters arrive as `#<letter>` keys in the wire JSON object; this
/// collects them into a map keyed by the bare letter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagFilters(pub std::collections::HashMap<String, Vec<String>>);

impl Serialize for TagFilters {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(&format!("#{k}"), v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for TagFilters {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw: std::collections::HashMap<String, Vec<String>> =
            serde::Deserialize::deserialize(deserializer)?;
        let mut tags = std::collections::HashMap::new();
        for (k, v) in raw {
            if let Some(letter) = k.strip_prefix('#') {
                if letter.chars().count() == 1 {
                    tags.insert(letter.to_string(), v);
                }
            }
        }
        Ok(TagFilters(tags))
    }
}

impl Filter {
    /// Does `event` satisfy every populated field of this filter (spec
    /// §4.1 `matches`)?
    ///
    /// Id and author constraints match by prefix; each tag-name entry
    /// matches by prefix when the tag name is `e` or `p` (its values are
    /// ids/pubkeys) and exactly otherwise.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| event.id.starts_with(id.as_str())) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors
                .iter()
                .any(|a| event.pubkey.starts_with(a.as_str()))
            {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (letter, values) in &self.tags.0 {
            let prefix_matched = letter == "e" || letter == "p";
            let has_match = event.tags_named(letter).any(|t| {
                let Some(v) = t.value() else { return false };
                values.iter().any(|want| {
                    if prefix_matched {
                        v.starts_with(want.as_str())
                    } else {
                        v == want
                    }
                })
            });
            if !has_match {
                return false;
            }
        }
        true
    }

    /// True iff this filter carries no `search` term — used to decide
    /// whether a stored-event query needs the search sub-language at all.
    pub fn has_search(&self) -> bool {
        self.search.as_deref().map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// A copy of this filter with `search` removed, for storage backends
    /// that cannot evaluate the search sub-language themselves: the caller
    /// re-applies the original filter afterwards (spec §6).
    pub fn without_search(&self) -> Filter {
        Filter {
            search: None,
            ..self.clone()
        }
    }
}

/// The smallest positive `limit` across a set of filters, per spec §4.3:
/// when multiple filters in a `REQ` carry a `limit`, the smallest governs
/// how many stored events are replayed in total.
pub fn effective_limit(filters: &[Filter]) -> Option<u64> {
    filters.iter().filter_map(|f| f.limit).min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_support::signed_event;
    use crate::event::Tag;

    #[test]
    fn empty_filter_matches_everything() {
        let e = signed_event(1, "hi", vec![], 1000);
        assert!(Filter::default().matches(&e));
    }

    #[test]
    fn ids_authors_and_kinds_narrow_the_match() {
        let e = signed_event(1, "hi", vec![], 1000);
        let mut f = Filter {
            kinds: Some(vec![1]),
            ..Default::default()
        };
        assert!(f.matches(&e));
        f.kinds = Some(vec![2]);
        assert!(!f.matches(&e));

        let mut f2 = Filter {
            authors: Some(vec![e.pubkey.clone()]),
            ..Default::default()
        };
        assert!(f2.matches(&e));
        f2.authors = Some(vec!["deadbeef".into()]);
        assert!(!f2.matches(&e));

        let mut f3 = Filter {
            ids: Some(vec![e.id.clone()]),
            ..Default::default()
        };
        assert!(f3.matches(&e));
        f3.ids = Some(vec!["0000".into()]);
        assert!(!f3.matches(&e));
    }

    #[test]
    fn since_and_until_bound_created_at_inclusively() {
        let e = signed_event(1, "hi", vec![], 1000);
        assert!(Filter {
            since: Some(1000),
            ..Default::default()
        }
        .matches(&e));
        assert!(!Filter {
            since: Some(1001),
            ..Default::default()
        }
        .matches(&e));
        assert!(Filter {
            until: Some(1000),
            ..Default::default()
        }
        .matches(&e));
        assert!(!Filter {
            until: Some(999),
            ..Default::default()
        }
        .matches(&e));
    }

    #[test]
    fn tag_filters_require_at_least_one_matching_value() {
        let e = signed_event(
            1,
            "hi",
            vec![Tag::new(vec!["p".into(), "abc".into()])],
            1000,
        );
        let mut tags = std::collections::HashMap::new();
        tags.insert("p".to_string(), vec!["abc".to_string(), "xyz".to_string()]);
        let f = Filter {
            tags: TagFilters(tags.clone()),
            ..Default::default()
        };
        assert!(f.matches(&e));

        tags.insert("p".to_string(), vec!["xyz".to_string()]);
        let f2 = Filter {
            tags: TagFilters(tags),
            ..Default::default()
        };
        assert!(!f2.matches(&e));
    }

    #[test]
    fn ids_and_authors_match_by_prefix() {
        let e = signed_event(1, "hi", vec![], 1000);
        let short_id = Filter {
            ids: Some(vec![e.id[..8].to_string()]),
            ..Default::default()
        };
        assert!(short_id.matches(&e));
        let short_author = Filter {
            authors: Some(vec![e.pubkey[..8].to_string()]),
            ..Default::default()
        };
        assert!(short_author.matches(&e));
        let wrong_prefix = Filter {
            ids: Some(vec!["ffffffff".into()]),
            ..Default::default()
        };
        assert!(!wrong_prefix.matches(&e));
    }

    #[test]
    fn e_and_p_tag_filters_match_by_prefix_other_tags_match_exactly() {
        let e = signed_event(
            1,
            "hi",
            vec![
                Tag::new(vec!["e".into(), "abcdef1234".into()]),
                Tag::new(vec!["k".into(), "1".into()]),
            ],
            1000,
        );
        let mut tags = std::collections::HashMap::new();
        tags.insert("e".to_string(), vec!["abcdef".to_string()]);
        assert!(Filter {
            tags: TagFilters(tags),
            ..Default::default()
        }
        .matches(&e));

        let mut exact = std::collections::HashMap::new();
        exact.insert("k".to_string(), vec!["1".to_string()]);
        assert!(Filter {
            tags: TagFilters(exact),
            ..Default::default()
        }
        .matches(&e));

        let mut exact_mismatch = std::collections::HashMap::new();
        exact_mismatch.insert("k".to_string(), vec!["11".to_string()]);
        assert!(!Filter {
            tags: TagFilters(exact_mismatch),
            ..Default::default()
        }
        .matches(&e));
    }

    #[test]
    fn effective_limit_picks_the_smallest_across_filters() {
        let filters = vec![
            Filter {
                limit: Some(50),
                ..Default::default()
            },
            Filter {
                limit: Some(10),
                ..Default::default()
            },
            Filter::default(),
        ];
        assert_eq!(effective_limit(&filters), Some(10));
        assert_eq!(effective_limit(&[Filter::default()]), None);
    }

    #[test]
    fn tag_filter_json_round_trips_through_hash_prefixed_keys() {
        let json = r#"{"kinds":[1],"#e":["abc"],"#p":["def"]}"#;
        let f: Filter = serde_json::from_str(json).unwrap();
        assert_eq!(f.kinds, Some(vec![1]));
        assert_eq!(f.tags.0.get("e"), Some(&vec!["abc".to_string()]));
        assert_eq!(f.tags.0.get("p"), Some(&vec!["def".to_string()]));
    }

    #[test]
    fn without_search_clears_only_the_search_term() {
        let f = Filter {
            search: Some("hello world".into()),
            kinds: Some(vec![1]),
            ..Default::default()
        };
        let stripped = f.without_search();
        assert_eq!(stripped.search, None);
        assert_eq!(stripped.kinds, Some(vec![1]));
        assert!(f.has_search());
        assert!(!stripped.has_search());
    }
}
