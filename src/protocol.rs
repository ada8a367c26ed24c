//! Inbound/outbound wire envelopes (spec §4.5, §6): JSON arrays tagged by
//! their first element.

use thiserror::Error;

use crate::event::Event;
use crate::filter::Filter;

#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Event),
    Req { sub_id: String, filters: Vec<Filter> },
    Close(String),
    Count { count_id: String, filters: Vec<Filter> },
    Auth(Event),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame is not valid JSON")]
    InvalidJson,
    #[error("frame must be a non-empty JSON array whose first element is a string tag")]
    NotAnArray,
    #[error("unrecognised message tag: {0}")]
    UnknownTag(String),
    #[error("malformed {0} envelope")]
    Malformed(&'static str),
}

/// Parse one transport frame into a `ClientMessage` (spec §4.5). Frames
/// that are not a non-empty JSON array with a recognised tag are reported
/// as `ParseError`s; the reader turns those into a NOTICE and otherwise
/// ignores the frame, never terminating the session.
pub fn parse_client_message(raw: &str) -> Result<ClientMessage, ParseError> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|_| ParseError::InvalidJson)?;
    let arr = value.as_array().ok_or(ParseError::NotAnArray)?;
    let tag = arr
        .first()
        .and_then(|v| v.as_str())
        .ok_or(ParseError::NotAnArray)?;

    match tag {
        "EVENT" => {
            let event_val = arr.get(1).ok_or(ParseError::Malformed("EVENT"))?;
            let event: Event = serde_json::from_value(event_val.clone())
                .map_err(|_| ParseError::Malformed("EVENT"))?;
            Ok(ClientMessage::Event(event))
        }
        "AUTH" => {
            let event_val = arr.get(1).ok_or(ParseError::Malformed("AUTH"))?;
            let event: Event = serde_json::from_value(event_val.clone())
                .map_err(|_| ParseError::Malformed("AUTH"))?;
            Ok(ClientMessage::Auth(event))
        }
        "CLOSE" => {
            let sub_id = arr
                .get(1)
                .and_then(|v| v.as_str())
                .ok_or(ParseError::Malformed("CLOSE"))?;
            Ok(ClientMessage::Close(sub_id.to_string()))
        }
        "REQ" => {
            let sub_id = arr
                .get(1)
                .and_then(|v| v.as_str())
                .ok_or(ParseError::Malformed("REQ"))?;
            let filters = parse_filters(&arr[2.min(arr.len())..]).map_err(|_| ParseError::Malformed("REQ"))?;
            Ok(ClientMessage::Req {
                sub_id: sub_id.to_string(),
                filters,
            })
        }
        "COUNT" => {
            let count_id = arr
                .get(1)
                .and_then(|v| v.as_str())
                .ok_or(ParseError::Malformed("COUNT"))?;
            let filters =
                parse_filters(&arr[2.min(arr.len())..]).map_err(|_| ParseError::Malformed("COUNT"))?;
            Ok(ClientMessage::Count {
                count_id: count_id.to_string(),
                filters,
            })
        }
        other => Err(ParseError::UnknownTag(other.to_string())),
    }
}

fn parse_filters(values: &[serde_json::Value]) -> Result<Vec<Filter>, ()> {
    values
        .iter()
        .map(|v| serde_json::from_value::<Filter>(v.clone()).map_err(|_| ()))
        .collect()
}

/// Machine-readable OK/CLOSED reason prefixes (spec §4.5, §7).
pub mod reason {
    pub const DUPLICATE: &str = "duplicate";
    pub const INVALID: &str = "invalid";
    pub const RATE_LIMITED: &str = "rate-limited";
    pub const ERROR: &str = "error";
    pub const EXPIRED: &str = "event has expired";
    pub const AUTHENTICATED: &str = "authenticated";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const VANISH_PROCESSED: &str = "Request to Vanish processed";
}

#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event { sub_id: String, event: Box<Event> },
    Eose { sub_id: String },
    Ok { event_id: String, accepted: bool, reason: String },
    Notice { message: String },
    Count { count_id: String, count: u64, approximate: bool },
    Closed { id: String, reason: String },
}

impl RelayMessage {
    pub fn event(sub_id: impl Into<String>, event: Event) -> Self {
        Self::Event {
            sub_id: sub_id.into(),
            event: Box::new(event),
        }
    }

    pub fn eose(sub_id: impl Into<String>) -> Self {
        Self::Eose { sub_id: sub_id.into() }
    }

    pub fn ok(event_id: impl Into<String>, accepted: bool, reason: impl Into<String>) -> Self {
        Self::Ok {
            event_id: event_id.into(),
            accepted,
            reason: reason.into(),
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        Self::Notice { message: message.into() }
    }

    pub fn count(count_id: impl Into<String>, count: u64, approximate: bool) -> Self {
        Self::Count {
            count_id: count_id.into(),
            count,
            approximate,
        }
    }

    pub fn closed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Closed {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Render as the compact JSON array the wire protocol expects.
    pub fn to_json(&self) -> String {
        let value = match self {
            Self::Event { sub_id, event } => serde_json::json!(["EVENT", sub_id, event.as_ref()]),
            Self::Eose { sub_id } => serde_json::json!(["EOSE", sub_id]),
            Self::Ok {
                event_id,
                accepted,
                reason,
            } => serde_json::json!(["OK", event_id, accepted, reason]),
            Self::Notice { message } => serde_json::json!(["NOTICE", message]),
            Self::Count {
                count_id,
                count,
                approximate,
            } => {
                let mut obj = serde_json::Map::new();
                obj.insert("count".to_string(), serde_json::json!(count));
                if *approximate {
                    obj.insert("approximate".to_string(), serde_json::json!(true));
                }
                serde_json::json!(["COUNT", count_id, obj])
            }
            Self::Closed { id, reason } => serde_json::json!(["CLOSED", id, reason]),
        };
        value.to_string()
    }
}
