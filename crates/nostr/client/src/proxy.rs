//! Message contract for running a pool behind a message-passing boundary.
//!
//! Only the wire types live here. Requests are `{"action": ..., "data": ...}`
//! and responses carry a `type` tag plus the subscription or request id they
//! answer.

use crate::message::Filter;
use nostr::Event;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "action",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ProxyRequest {
    Subscribe {
        subscription_id: String,
        filters: Vec<Filter>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relays: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_delay_ms: Option<u64>,
    },
    Unsubscribe {
        subscription_id: String,
    },
    Publish {
        event: Event,
        relays: Vec<String>,
    },
    Close,
    FetchAndCacheMetadata {
        request_id: String,
        pubkey: String,
    },
    FetchAndCacheContactList {
        request_id: String,
        pubkey: String,
    },
    SetWriteRelaysForPubKey {
        pubkey: String,
        write_relays: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ProxyResponse {
    Event {
        subscription_id: String,
        event: Event,
        #[serde(default)]
        relay_url: Option<String>,
        #[serde(default)]
        after_eose: bool,
    },
    Eose {
        subscription_id: String,
        relay_url: String,
        #[serde(default)]
        min_created_at: Option<u64>,
    },
    Metadata {
        request_id: String,
        event: Option<Event>,
    },
    ContactList {
        request_id: String,
        event: Option<Event>,
    },
    Error {
        #[serde(default)]
        request_id: Option<String>,
        message: String,
    },
}
