//! Nostr relay message types.
//!
//! The JSON-array frames exchanged with relays (NIP-01, NIP-42):
//! - Client to Relay: REQ, CLOSE, EVENT, AUTH
//! - Relay to Client: EVENT, EOSE, OK, NOTICE, AUTH
//!
//! Also home of [`Filter`], including the client-only annotations that never
//! go over the wire.

use nostr::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur when parsing relay messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Frame was well formed but the embedded event was not an event.
    #[error("invalid event in frame: {0}")]
    InvalidEvent(String),
}

/// Messages sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage<'a> {
    /// `["EVENT", <event>]`
    Event(&'a Event),
    /// `["REQ", <subscription_id>, <filter>, ...]`
    Req {
        subscription_id: &'a str,
        filters: &'a [Filter],
    },
    /// `["CLOSE", <subscription_id>]`
    Close { subscription_id: &'a str },
    /// `["AUTH", <event>]`
    Auth(&'a Event),
}

impl ClientMessage<'_> {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let value = match self {
            ClientMessage::Event(event) => serde_json::json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = Vec::with_capacity(filters.len() + 2);
                frame.push(Value::from("REQ"));
                frame.push(Value::from(*subscription_id));
                for filter in filters.iter() {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            ClientMessage::Close { subscription_id } => serde_json::json!(["CLOSE", subscription_id]),
            ClientMessage::Auth(event) => serde_json::json!(["AUTH", event]),
        };
        Ok(value.to_string())
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", <subscription_id>, <event>]`
    Event {
        subscription_id: String,
        event: Event,
    },
    /// `["EOSE", <subscription_id>]`
    Eose { subscription_id: String },
    /// `["OK", <event_id>, <accepted>, <reason>?]`
    Ok {
        event_id: String,
        accepted: bool,
        reason: String,
    },
    /// `["NOTICE", <text>]`
    Notice { message: String },
    /// `["AUTH", <challenge>]`
    Auth { challenge: String },
}

fn string_at(frame: &[Value], index: usize, what: &str) -> Result<String, MessageError> {
    frame
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidFormat(format!("{what} not a string")))
}

fn expect_len(frame: &[Value], len: usize, tag: &str) -> Result<(), MessageError> {
    if frame.len() != len {
        return Err(MessageError::InvalidFormat(format!(
            "{tag} frame has {} elements, expected {len}",
            frame.len()
        )));
    }
    Ok(())
}

impl RelayMessage {
    /// Parse a raw text frame.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let mut frame: Vec<Value> =
            serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;

        let tag = frame
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| MessageError::InvalidFormat("first element not a string".to_string()))?
            .to_string();

        match tag.as_str() {
            "EVENT" => {
                expect_len(&frame, 3, "EVENT")?;
                let subscription_id = string_at(&frame, 1, "subscription_id")?;
                let event = serde_json::from_value(frame.swap_remove(2))
                    .map_err(|e| MessageError::InvalidEvent(e.to_string()))?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "EOSE" => {
                expect_len(&frame, 2, "EOSE")?;
                Ok(RelayMessage::Eose {
                    subscription_id: string_at(&frame, 1, "subscription_id")?,
                })
            }
            "OK" => {
                if frame.len() < 3 {
                    return Err(MessageError::InvalidFormat(
                        "OK frame needs an event id and a status".to_string(),
                    ));
                }
                let event_id = string_at(&frame, 1, "event_id")?;
                let accepted = frame[2].as_bool().ok_or_else(|| {
                    MessageError::InvalidFormat("OK status not a boolean".to_string())
                })?;
                let reason = frame
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    accepted,
                    reason,
                })
            }
            "NOTICE" => {
                expect_len(&frame, 2, "NOTICE")?;
                Ok(RelayMessage::Notice {
                    message: string_at(&frame, 1, "message")?,
                })
            }
            "AUTH" => {
                expect_len(&frame, 2, "AUTH")?;
                Ok(RelayMessage::Auth {
                    challenge: string_at(&frame, 1, "challenge")?,
                })
            }
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

/// Subscription filter.
///
/// Tag constraints are keyed with their `#` prefix (`"#e"`, `"#p"`) exactly as
/// they appear on the wire. `relay` and `no_cache` are client-side annotations
/// and are never serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// NIP-50 full text search
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,

    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,

    /// Only send this filter to the given relay.
    #[serde(skip)]
    pub relay: Option<String>,

    /// Never answer this filter from the event cache.
    #[serde(skip)]
    pub no_cache: bool,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn search(mut self, term: impl Into<String>) -> Self {
        self.search = Some(term.into());
        self
    }

    /// Add a tag constraint; `name` is the bare tag name (`"e"`, `"p"`).
    pub fn tag(mut self, name: &str, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags
            .insert(format!("#{name}"), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn relay(mut self, url: impl Into<String>) -> Self {
        self.relay = Some(url.into());
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    /// Tag constraints as `(bare name, values)` pairs.
    pub fn tag_constraints(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.tags
            .iter()
            .filter_map(|(key, values)| key.strip_prefix('#').map(|name| (name, values.as_slice())))
    }

    /// A filter whose id list was emptied can never match.
    pub fn is_exhausted(&self) -> bool {
        self.ids.as_ref().is_some_and(Vec::is_empty)
    }

    /// NIP-01 matching. `limit` and `search` are relay-side concerns and
    /// are ignored; id and author entries match as prefixes.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids
            && !ids.iter().any(|id| event.id.starts_with(id.as_str()))
        {
            return false;
        }

        if let Some(authors) = &self.authors
            && !authors.iter().any(|a| event.pubkey.starts_with(a.as_str()))
        {
            return false;
        }

        if let Some(kinds) = &self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }

        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }

        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }

        self.tag_constraints().all(|(name, values)| {
            event
                .tag_values(name)
                .any(|value| values.iter().any(|v| v == value))
        })
    }
}

/// True if any filter in the set matches.
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| f.matches(event))
}
