//! NIP-42: Authentication of clients to relays
//!
//! A relay sends `["AUTH", <challenge>]`; the client answers with
//! `["AUTH", <signed kind 22242 event>]` carrying the relay url and challenge.

use crate::nip01::{EventTemplate, unix_now};

pub const CLIENT_AUTH_KIND: u16 = 22242;

/// Unsigned auth event answering `challenge` from `relay_url`.
pub fn auth_template(relay_url: &str, challenge: &str) -> EventTemplate {
    EventTemplate {
        created_at: unix_now(),
        kind: CLIENT_AUTH_KIND,
        tags: vec![
            vec!["relay".to_string(), relay_url.to_string()],
            vec!["challenge".to_string(), challenge.to_string()],
        ],
        content: String::new(),
    }
}
