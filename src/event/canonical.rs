//! Canonical serialization used for event id derivation (spec §3).
//!
//! Does not rely on `serde_json`'s default string escaping: serde_json emits
//! `\b`/`\f` for backspace/form-feed, while the wire format here calls for
//! ``/``. A general-purpose encoder's defaults silently break id
//! derivation, so this is a small hand-written compact encoder instead.

use super::tag::Tag;

/// Escape a string per the canonical rules: `"`, `\`, and control characters
/// U+0000..=U+001F. Newline, carriage return, and tab get their short forms;
/// every other control character is rendered as `\u00XX`.
pub fn push_escaped_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) <= 0x1F => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Produce the canonical array `[0, pubkey, created_at, kind, tags, content]`
/// as a compact byte string with no inter-element whitespace.
pub fn serialize_for_id(pubkey: &str, created_at: i64, kind: i64, tags: &[Tag], content: &str) -> String {
    let mut out = String::with_capacity(content.len() + 64);
    out.push('[');
    out.push_str("0,");
    push_escaped_string(&mut out, pubkey);
    out.push(',');
    out.push_str(&created_at.to_string());
    out.push(',');
    out.push_str(&kind.to_string());
    out.push(',');
    out.push('[');
    for (i, tag) in tags.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('[');
        for (j, value) in tag.0.iter().enumerate() {
            if j > 0 {
                out.push(',');
            }
            push_escaped_string(&mut out, value);
        }
        out.push(']');
    }
    out.push(']');
    out.push(',');
    push_escaped_string(&mut out, content);
    out.push(']');
    out
}
