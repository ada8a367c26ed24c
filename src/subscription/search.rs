//! The full-text search sub-language (spec §4.4), applied to a candidate
//! set already narrowed by `storage.query`.

use crate::event::Event;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SearchQuery {
    pub required: Vec<String>,
    pub excluded: Vec<String>,
    pub domain: Option<String>,
    pub language: Option<String>,
    pub nsfw: Option<bool>,
}

/// Parse a `search` string into required terms, exclusions, and extension
/// directives. Whitespace-separated; `-term` excludes, `key:value` with a
/// recognised key is a directive, an unrecognised key is ignored entirely,
/// everything else is a required term.
pub fn parse(search: &str) -> SearchQuery {
    let mut query = SearchQuery::default();
    for token in search.split_whitespace() {
        if let Some(rest) = token.strip_prefix('-') {
            if !rest.is_empty() {
                query.excluded.push(rest.to_lowercase());
            }
            continue;
        }
        if let Some((key, value)) = token.split_once(':') {
            if !key.is_empty() && !value.is_empty() {
                match key {
                    "domain" => {
                        query.domain = Some(value.to_string());
                        continue;
                    }
                    "language" => {
                        query.language = Some(value.to_string());
                        continue;
                    }
                    "nsfw" => {
                        if let Ok(flag) = value.parse::<bool>() {
                            query.nsfw = Some(flag);
                        }
                        continue;
                    }
                    _ => continue,
                }
            }
        }
        query.required.push(token.to_lowercase());
    }
    query
}

/// Does `event` satisfy every required term, every exclusion, and every
/// extension directive in `query`?
pub fn matches(query: &SearchQuery, event: &Event) -> bool {
    let haystacks: Vec<String> = std::iter::once(event.content.to_lowercase())
        .chain(
            event
                .tags
                .iter()
                .filter_map(|t| t.value())
                .map(str::to_lowercase),
        )
        .collect();

    for term in &query.required {
        if !haystacks.iter().any(|h| h.contains(term.as_str())) {
            return false;
        }
    }
    for term in &query.excluded {
        if haystacks.iter().any(|h| h.contains(term.as_str())) {
            return false;
        }
    }
    if let Some(domain) = &query.domain {
        let suffix = format!("@{}", domain.to_lowercase());
        let ok = event.tags_named("nip05").any(|t| {
            t.value()
                .map(|v| v.to_lowercase().ends_with(&suffix))
                .unwrap_or(false)
        });
        if !ok {
            return false;
        }
    }
    if let Some(language) = &query.language {
        let ok = event
            .tags_named("language")
            .any(|t| t.value().map(|v| v.eq_ignore_ascii_case(language)).unwrap_or(false));
        if !ok {
            return false;
        }
    }
    if let Some(wants_nsfw) = query.nsfw {
        let has_content_warning = event.tags_named("content-warning").next().is_some();
        if wants_nsfw != has_content_warning {
            return false;
        }
    }
    true
}

/// Convenience wrapper: does `event` satisfy the raw `search` string?
pub fn evaluate(search: &str, event: &Event) -> bool {
    matches(&parse(search), event)
}
