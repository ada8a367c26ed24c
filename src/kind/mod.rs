//! Per-kind semantic validators (spec §4.2). Each validator is a pure
//! function of the event, invoked by the orchestrator after signature
//! verification and before any storage side effect.

use thiserror::Error;

use crate::event::Event;

pub const AUTH: i64 = 22242;
pub const FOLLOW_LIST: i64 = 3;
pub const COMMENT: i64 = 1111;
pub const REACTION: i64 = 7;
pub const RELAY_LIST: i64 = 10002;
pub const DELETION: i64 = 5;
pub const VANISH_REQUEST: i64 = 62;
pub const GIFT_WRAP: i64 = 1059;

/// Profile and regular-replaceable kinds: kind 0, kind 3, and `[10000, 20000)`.
pub fn is_regular_replaceable(kind: i64) -> bool {
    kind == 0 || kind == 3 || (10000..20000).contains(&kind)
}

/// Parameterised-replaceable ("addressable") kinds: `[30000, 40000)`.
pub fn is_addressable(kind: i64) -> bool {
    (30000..40000).contains(&kind)
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ValidationError {
    #[error("invalid: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ValidationError {
    ValidationError::Invalid(msg.into())
}

fn is_hex64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Dispatch to the validator selected by `event.kind`. Kinds with no
/// enumerated rule are accepted unconditionally (spec §4.2 covers only the
/// enumerated kinds; all others pass through to storage).
pub fn validate(event: &Event) -> Result<(), ValidationError> {
    match event.kind {
        AUTH => validate_auth(event),
        FOLLOW_LIST => validate_follow_list(event),
        COMMENT => validate_comment(event),
        REACTION => validate_reaction(event),
        RELAY_LIST => validate_relay_list(event),
        VANISH_REQUEST => validate_vanish_request(event),
        _ => Ok(()),
    }
}

pub fn validate_auth(event: &Event) -> Result<(), ValidationError> {
    if event.content.is_empty() {
        return Err(invalid("auth event content must not be empty"));
    }
    event
        .verify()
        .map_err(|e| invalid(format!("auth signature invalid: {e}")))
}

pub fn validate_follow_list(event: &Event) -> Result<(), ValidationError> {
    if !event.content.is_empty() {
        return Err(invalid("follow list content must be empty"));
    }
    let p_tags: Vec<_> = event.tags_named("p").collect();
    if p_tags.is_empty() {
        return Err(invalid("follow list requires at least one p tag"));
    }
    for t in &p_tags {
        let Some(v) = t.value() else {
            return Err(invalid("p tag missing a value"));
        };
        if !is_hex64(v) {
            return Err(invalid("p tag value must be 64 hex characters"));
        }
    }
    Ok(())
}

pub fn validate_comment(event: &Event) -> Result<(), ValidationError> {
    if event.content.trim().is_empty() {
        return Err(invalid("comment content must not be blank"));
    }
    let root_tag = event
        .tags
        .iter()
        .find(|t| matches!(t.name(), Some("E") | Some("A") | Some("I")));
    let Some(root_tag) = root_tag else {
        return Err(invalid("comment requires an uppercase root-scope tag"));
    };
    let root_kind: i64 = event
        .tags_named("K")
        .next()
        .and_then(|t| t.value())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| invalid("comment requires a K tag carrying the root kind"))?;
    if root_kind == 1 {
        return Err(invalid(
            "comment root kind must not be 1 (use the legacy reply convention)",
        ));
    }
    let parent_tag = event
        .tags
        .iter()
        .find(|t| matches!(t.name(), Some("e") | Some("a") | Some("i")));
    if parent_tag.is_none() {
        return Err(invalid("comment requires a lowercase parent-scope tag"));
    }
    if event.tags_named("k").next().and_then(|t| t.value()).is_none() {
        return Err(invalid("comment requires a k tag carrying the parent kind"));
    }
    let _ = root_tag;
    Ok(())
}

pub fn validate_reaction(event: &Event) -> Result<(), ValidationError> {
    let has_e = event
        .tags_named("e")
        .any(|t| t.value().map(is_hex64).unwrap_or(false));
    if !has_e {
        return Err(invalid("reaction requires an e tag with a 64-hex id"));
    }
    for t in event.tags_named("p") {
        if let Some(v) = t.value() {
            if !is_hex64(v) {
                return Err(invalid("reaction p tag value must be 64 hex characters"));
            }
        }
    }
    for t in event.tags_named("k") {
        if let Some(v) = t.value() {
            if v.parse::<i64>().is_err() {
                return Err(invalid("reaction k tag value must be an integer"));
            }
        }
    }
    match event.content.as_str() {
        "" | "+" | "-" => Ok(()),
        c if is_custom_emoji_shortcode(c) => Ok(()),
        c if is_single_emoji(c) => Ok(()),
        _ => Err(invalid(
            "reaction content must be empty, +, -, an emoji, or :shortcode:",
        )),
    }
}

fn is_custom_emoji_shortcode(s: &str) -> bool {
    s.len() >= 3
        && s.starts_with(':')
        && s.ends_with(':')
        && s[1..s.len() - 1]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && s.len() > 2
}

fn is_single_emoji(s: &str) -> bool {
    // A permissive check: non-ASCII and not made of ASCII word characters.
    !s.is_empty() && s.chars().all(|c| !c.is_ascii())
}

pub fn validate_relay_list(event: &Event) -> Result<(), ValidationError> {
    if !event.content.is_empty() {
        return Err(invalid("relay list content must be empty"));
    }
    for t in event.tags_named("r") {
        let Some(url) = t.value() else {
            return Err(invalid("r tag missing a URL"));
        };
        let scheme_ok = url.starts_with("ws://") || url.starts_with("wss://");
        if !scheme_ok {
            return Err(invalid("r tag URL must use ws or wss"));
        }
        let host = url.splitn(2, "://").nth(1).unwrap_or("");
        let host = host.split(['/', '?', '#']).next().unwrap_or("");
        if host.is_empty() {
            return Err(invalid("r tag URL must have a non-empty host"));
        }
        if let Some(marker) = t.get(2) {
            if marker != "read" && marker != "write" {
                return Err(invalid("r tag marker must be read or write"));
            }
        }
    }
    Ok(())
}

pub fn validate_vanish_request(event: &Event) -> Result<(), ValidationError> {
    let has_relay = event
        .tags_named("relay")
        .any(|t| t.value().map(|v| !v.is_empty()).unwrap_or(false));
    if !has_relay {
        return Err(invalid("vanish request requires a non-empty relay tag"));
    }
    Ok(())
}

/// Does this vanish-request event name this relay (or `ALL_RELAYS`) as its
/// target, per spec §4.2?
pub fn vanish_targets_this_relay(event: &Event, this_relay_url: &str) -> bool {
    event.tags_named("relay").any(|t| {
        t.value()
            .map(|v| v == "ALL_RELAYS" || v.eq_ignore_ascii_case(this_relay_url))
            .unwrap_or(false)
    })
}

/// The gift-wrap's intended recipient, read from its `p` tag (spec §4.2).
pub fn gift_wrap_recipient(event: &Event) -> Option<&str> {
    event.tags_named("p").next().and_then(|t| t.value())
}
