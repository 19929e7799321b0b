//! Outbox routing for subscriptions without explicit relays.
//!
//! Events FROM a user are read from that user's WRITE relays (NIP-65). The
//! model keeps the write relays learnt so far and splits authored filters so
//! each relay only gets asked about the authors that publish there.

use crate::error::{ClientError, Result};
use crate::message::Filter;
use nostr::{Event, RELAY_LIST_METADATA_KIND, RelayListMetadata};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

#[derive(Debug, Clone)]
struct WriteRelays {
    relays: Vec<String>,
    /// `created_at` of the relay list these came from; 0 when set by hand
    created_at: u64,
}

/// Where each part of a filter set should go.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RelayPlan {
    pub filters_by_relay: BTreeMap<String, Vec<Filter>>,
    /// Filter parts restricted to authors whose relays are still unknown
    pub pending: Vec<Filter>,
    pub unknown_authors: Vec<String>,
}

impl RelayPlan {
    pub fn is_empty(&self) -> bool {
        self.filters_by_relay.is_empty() && self.pending.is_empty()
    }
}

/// Write relays by pubkey
#[derive(Default)]
pub struct OutboxModel {
    write_relays: RwLock<HashMap<String, WriteRelays>>,
}

impl OutboxModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Learn write relays from a kind 10002 event. Older lists never replace newer ones.
    ///
    /// Returns whether the stored relays changed.
    pub fn update_relay_list(&self, event: &Event) -> Result<bool> {
        if event.kind != RELAY_LIST_METADATA_KIND {
            return Err(ClientError::InvalidEvent(format!(
                "expected kind {}, got {}",
                RELAY_LIST_METADATA_KIND, event.kind
            )));
        }

        let metadata = RelayListMetadata::from_event(event)
            .map_err(|e| ClientError::InvalidEvent(e.to_string()))?;

        let mut write_relays = self.write_relays.write();
        if let Some(existing) = write_relays.get(&event.pubkey)
            && existing.created_at > event.created_at
        {
            return Ok(false);
        }
        write_relays.insert(
            event.pubkey.clone(),
            WriteRelays {
                relays: metadata.write_relays(),
                created_at: event.created_at,
            },
        );
        trace!("Updated write relays for {}", event.pubkey);
        Ok(true)
    }

    pub fn set_write_relays(&self, pubkey: &str, relays: Vec<String>) {
        self.write_relays.write().insert(
            pubkey.to_string(),
            WriteRelays {
                relays,
                created_at: 0,
            },
        );
    }

    /// `None` if nothing is known about `pubkey`.
    pub fn get_write_relays(&self, pubkey: &str) -> Option<Vec<String>> {
        self.write_relays
            .read()
            .get(pubkey)
            .map(|entry| entry.relays.clone())
    }

    /// Route `filters` to relays.
    ///
    /// Authorless filters go to `default_relays`. Authored filters are split
    /// per write relay; authors with no known (or an empty) relay list end up
    /// in [`RelayPlan::pending`].
    pub fn plan(&self, filters: &[Filter], default_relays: &[String]) -> RelayPlan {
        let mut plan = RelayPlan::default();
        let write_relays = self.write_relays.read();

        for filter in filters {
            let Some(authors) = &filter.authors else {
                for relay in default_relays {
                    plan.filters_by_relay
                        .entry(relay.clone())
                        .or_default()
                        .push(filter.clone());
                }
                continue;
            };

            let mut authors_by_relay: BTreeMap<&str, Vec<String>> = BTreeMap::new();
            let mut unknown = Vec::new();
            for author in authors {
                match write_relays.get(author) {
                    Some(entry) if !entry.relays.is_empty() => {
                        for relay in &entry.relays {
                            authors_by_relay
                                .entry(relay.as_str())
                                .or_default()
                                .push(author.clone());
                        }
                    }
                    _ => unknown.push(author.clone()),
                }
            }

            for (relay, authors) in authors_by_relay {
                let mut part = filter.clone();
                part.authors = Some(authors);
                plan.filters_by_relay
                    .entry(relay.to_string())
                    .or_default()
                    .push(part);
            }
            if !unknown.is_empty() {
                for author in &unknown {
                    if !plan.unknown_authors.contains(author) {
                        plan.unknown_authors.push(author.clone());
                    }
                }
                let mut part = filter.clone();
                part.authors = Some(unknown);
                plan.pending.push(part);
            }
        }

        plan
    }
}
