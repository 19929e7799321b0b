//! Bounded, multi-indexed LRU cache of events the pool has already seen.
//!
//! Besides answering id lookups, the cache rewrites outgoing filters so that
//! relays are only asked for what is not already known locally.

use crate::message::Filter;
use nostr::{Event, KIND_CONTACTS, KIND_METADATA};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::trace;

pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

/// Kinds where only the newest event per author is kept in the author index.
fn is_singleton_kind(kind: u16) -> bool {
    kind == KIND_METADATA || kind == KIND_CONTACTS
}

struct CachedEvent {
    event: Event,
    /// Position in `recency`
    touched: u64,
}

/// Filters to send to relays plus the events already answered locally.
#[derive(Debug, Default)]
pub struct CachedFilterResult {
    pub filters: Vec<Filter>,
    pub events: Vec<Event>,
}

pub struct EventCache {
    capacity: usize,
    clock: u64,
    events: HashMap<String, CachedEvent>,
    /// touch tick -> id, oldest first
    recency: BTreeMap<u64, String>,
    /// pubkey -> kind -> ids
    by_author_kind: HashMap<String, HashMap<u16, Vec<String>>>,
    /// "name:value" -> ids
    by_tag: HashMap<String, Vec<String>>,
}

impl Default for EventCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl EventCache {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            clock: 0,
            events: HashMap::new(),
            recency: BTreeMap::new(),
            by_author_kind: HashMap::new(),
            by_tag: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Insert an event, or refresh its recency if it is already cached.
    ///
    /// Returns true if the event was new.
    pub fn add_event(&mut self, event: Event) -> bool {
        if self.events.contains_key(&event.id) {
            self.touch(&event.id);
            return false;
        }

        if self.events.len() >= self.capacity {
            self.evict_oldest();
        }

        self.index(&event);
        self.clock += 1;
        self.recency.insert(self.clock, event.id.clone());
        self.events.insert(
            event.id.clone(),
            CachedEvent {
                event,
                touched: self.clock,
            },
        );
        true
    }

    /// Remove an event and every index entry pointing at it.
    pub fn delete_event(&mut self, event: &Event) -> bool {
        self.delete_event_by_id(&event.id)
    }

    pub fn delete_event_by_id(&mut self, id: &str) -> bool {
        let Some(entry) = self.events.remove(id) else {
            return false;
        };
        self.recency.remove(&entry.touched);
        self.unindex(&entry.event);
        true
    }

    /// Look up an event and mark it most recently used.
    pub fn get_event_by_id(&mut self, id: &str) -> Option<Event> {
        self.touch(id);
        self.events.get(id).map(|entry| entry.event.clone())
    }

    /// Membership test that leaves recency untouched.
    pub fn has_event_by_id(&self, id: &str) -> bool {
        self.events.contains_key(id)
    }

    /// Newest cached event for `(pubkey, kind)`.
    pub fn latest_event(&self, pubkey: &str, kind: u16) -> Option<&Event> {
        self.events_by_author_kind(pubkey, kind)
            .into_iter()
            .max_by_key(|event| event.created_at)
    }

    pub fn events_by_author_kind(&self, pubkey: &str, kind: u16) -> Vec<&Event> {
        self.by_author_kind
            .get(pubkey)
            .and_then(|kinds| kinds.get(&kind))
            .map(|ids| ids.iter().filter_map(|id| self.event(id)).collect())
            .unwrap_or_default()
    }

    pub fn metadata_for(&self, pubkey: &str) -> Option<&Event> {
        self.latest_event(pubkey, KIND_METADATA)
    }

    pub fn contacts_for(&self, pubkey: &str) -> Option<&Event> {
        self.latest_event(pubkey, KIND_CONTACTS)
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.recency.clear();
        self.by_author_kind.clear();
        self.by_tag.clear();
    }

    /// Cached ids from least to most recently used.
    pub fn ids_by_recency(&self) -> Vec<String> {
        self.recency.values().cloned().collect()
    }

    /// Answer what we can from the cache and trim the filters accordingly.
    ///
    /// Per filter, one strategy applies, in this order:
    /// 1. `ids`: cached ids are answered and dropped from the filter
    /// 2. `authors`: per author (and kind, if given) hits; filter unchanged
    /// 3. `#tag` constraints: tag index hits; filter unchanged
    ///
    /// Filters flagged `no_cache` pass through untouched. Hits are checked
    /// against the full filter before they are returned.
    pub fn get_cached_events_with_updated_filters(
        &mut self,
        filters: Vec<Filter>,
        relays: &[String],
    ) -> CachedFilterResult {
        let mut result = CachedFilterResult::default();
        let mut hit_ids = HashSet::new();

        for mut filter in filters {
            if filter.no_cache {
                result.filters.push(filter);
                continue;
            }

            // hits are checked against the filter as asked, before its ids are trimmed
            let asked = filter.clone();
            let mut hits: Vec<String> = Vec::new();
            if let Some(ids) = filter.ids.take() {
                let (cached, missing): (Vec<String>, Vec<String>) =
                    ids.into_iter().partition(|id| self.events.contains_key(id));
                for id in &cached {
                    self.touch(id);
                }
                hits.extend(cached);
                filter.ids = Some(missing);
            } else if let Some(authors) = &filter.authors {
                for author in authors {
                    let Some(kinds) = self.by_author_kind.get(author) else {
                        continue;
                    };
                    match &filter.kinds {
                        Some(wanted) => {
                            for kind in wanted {
                                hits.extend(kinds.get(kind).into_iter().flatten().cloned());
                            }
                        }
                        None => hits.extend(kinds.values().flatten().cloned()),
                    }
                }
            } else {
                for (name, values) in filter.tag_constraints() {
                    for value in values {
                        if let Some(ids) = self.by_tag.get(&format!("{name}:{value}")) {
                            hits.extend(ids.iter().cloned());
                        }
                    }
                }
            }

            for id in hits {
                if hit_ids.contains(&id) {
                    continue;
                }
                if let Some(event) = self.event(&id)
                    && asked.matches(event)
                {
                    result.events.push(event.clone());
                    hit_ids.insert(id);
                }
            }
            result.filters.push(filter);
        }

        trace!(
            "Cache answered {} events for {} relays",
            result.events.len(),
            relays.len()
        );
        result
    }

    fn event(&self, id: &str) -> Option<&Event> {
        self.events.get(id).map(|entry| &entry.event)
    }

    fn touch(&mut self, id: &str) {
        let Self {
            events,
            recency,
            clock,
            ..
        } = self;
        if let Some(entry) = events.get_mut(id) {
            recency.remove(&entry.touched);
            *clock += 1;
            entry.touched = *clock;
            recency.insert(*clock, id.to_string());
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((_, id)) = self.recency.pop_first()
            && let Some(entry) = self.events.remove(&id)
        {
            trace!("Evicting {} from event cache", id);
            self.unindex(&entry.event);
        }
    }

    fn index(&mut self, event: &Event) {
        let Self {
            events,
            by_author_kind,
            by_tag,
            ..
        } = self;

        let slot = by_author_kind
            .entry(event.pubkey.clone())
            .or_default()
            .entry(event.kind)
            .or_default();
        if is_singleton_kind(event.kind) {
            let newer = slot
                .first()
                .and_then(|id| events.get(id))
                .is_none_or(|current| event.created_at > current.event.created_at);
            if newer {
                slot.clear();
                slot.push(event.id.clone());
            }
        } else {
            slot.push(event.id.clone());
        }

        for key in tag_keys(event) {
            by_tag.entry(key).or_default().push(event.id.clone());
        }
    }

    fn unindex(&mut self, event: &Event) {
        if let Some(kinds) = self.by_author_kind.get_mut(&event.pubkey) {
            if let Some(ids) = kinds.get_mut(&event.kind) {
                ids.retain(|id| id != &event.id);
                if ids.is_empty() {
                    kinds.remove(&event.kind);
                }
            }
            if kinds.is_empty() {
                self.by_author_kind.remove(&event.pubkey);
            }
        }

        for key in tag_keys(event) {
            if let Some(ids) = self.by_tag.get_mut(&key) {
                ids.retain(|id| id != &event.id);
                if ids.is_empty() {
                    self.by_tag.remove(&key);
                }
            }
        }
    }

    #[cfg(test)]
    fn indexes_reference(&self, id: &str) -> bool {
        self.by_author_kind
            .values()
            .flat_map(HashMap::values)
            .chain(self.by_tag.values())
            .any(|ids| ids.iter().any(|x| x == id))
    }

    #[cfg(test)]
    fn all_indexed_ids(&self) -> HashSet<String> {
        self.by_author_kind
            .values()
            .flat_map(HashMap::values)
            .chain(self.by_tag.values())
            .flatten()
            .cloned()
            .collect()
    }
}

/// Distinct `name:value` keys for an event's tags.
fn tag_keys(event: &Event) -> Vec<String> {
    let mut keys: Vec<String> = event
        .tags
        .iter()
        .filter(|tag| tag.len() >= 2)
        .map(|tag| format!("{}:{}", tag[0], tag[1]))
        .collect();
    keys.sort();
    keys.dedup();
    keys
}
