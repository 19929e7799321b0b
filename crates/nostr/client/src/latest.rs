//! Single-flight lookup of the newest event of one kind per pubkey.
//!
//! Used for profile metadata (kind 0), contact lists (kind 3) and relay
//! lists (kind 10002). Concurrent `get`s for the same pubkey share one
//! subscription; resolved events are memoized for the life of the pool.

use crate::error::{ClientError, Result};
use crate::message::Filter;
use crate::pool::{RelayPool, SubscribeOptions, Subscription};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, WeakShared};
use nostr::Event;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// A pending or finished lookup. Clones share the result.
pub type LatestLookup = Shared<BoxFuture<'static, Result<Event>>>;

/// What the lookup subscription filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookupBy {
    /// `{"authors": [pubkey]}`
    #[default]
    Author,
    /// `{"#p": [pubkey]}`
    PubkeyTag,
}

/// Resolved events and running lookups, shared by every view of one cache.
#[derive(Default)]
pub(crate) struct LatestMemo {
    data: Mutex<HashMap<String, Event>>,
    inflight: Mutex<HashMap<String, WeakShared<BoxFuture<'static, Result<Event>>>>>,
}

impl LatestMemo {
    pub(crate) fn get(&self, pubkey: &str) -> Option<Event> {
        self.data.lock().get(pubkey).cloned()
    }

    pub(crate) fn insert(&self, pubkey: &str, event: Event) {
        self.data.lock().insert(pubkey.to_string(), event);
    }
}

/// Unsubscribes when the lookup settles or every caller gives up on it.
struct SubscriptionGuard(Subscription);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

/// Memoized "latest kind K event for pubkey P" over a fixed relay set.
///
/// Borrows the pool and must not outlive it. The futures returned by
/// [`get`](Self::get) are `'static`; if the pool is closed or dropped
/// first they fail with [`ClientError::Closed`].
pub struct SingleFlightLatestCache<'p> {
    pool: &'p RelayPool,
    memo: Arc<LatestMemo>,
    kind: u16,
    relays: Vec<String>,
    lookup: LookupBy,
}

impl<'p> SingleFlightLatestCache<'p> {
    /// A cache with its own memo table.
    pub fn new(pool: &'p RelayPool, kind: u16, relays: Vec<String>, lookup: LookupBy) -> Self {
        Self::with_memo(pool, Arc::new(LatestMemo::default()), kind, relays, lookup)
    }

    pub(crate) fn with_memo(
        pool: &'p RelayPool,
        memo: Arc<LatestMemo>,
        kind: u16,
        relays: Vec<String>,
        lookup: LookupBy,
    ) -> Self {
        Self {
            pool,
            memo,
            kind,
            relays,
            lookup,
        }
    }

    /// Same memo table, different relays.
    pub fn with_relays(mut self, relays: Vec<String>) -> Self {
        self.relays = relays;
        self
    }

    pub fn kind(&self) -> u16 {
        self.kind
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    /// Memoized value, without starting a lookup.
    pub fn cached(&self, pubkey: &str) -> Option<Event> {
        self.memo.get(pubkey)
    }

    pub fn set(&self, pubkey: &str, event: Event) {
        self.memo.insert(pubkey, event);
    }

    /// The latest event for `pubkey`.
    ///
    /// Resolves from the memo if possible, otherwise joins the running lookup
    /// for `pubkey` or starts one. A lookup fails with a timeout after
    /// [`LOOKUP_TIMEOUT`], or with [`ClientError::Exhausted`] once every relay
    /// has sent EOSE without a match.
    pub fn get(&self, pubkey: &str) -> LatestLookup {
        if let Some(event) = self.memo.get(pubkey) {
            return ready(Ok(event));
        }

        let mut inflight = self.memo.inflight.lock();
        // lookups dropped before settling never remove themselves
        inflight.retain(|_, weak| weak.upgrade().is_some());
        if let Some(running) = inflight.get(pubkey).and_then(WeakShared::upgrade) {
            return running;
        }
        if let Some(event) = self.memo.get(pubkey) {
            return ready(Ok(event));
        }

        let lookup = self.start(pubkey);
        if let Some(weak) = lookup.downgrade() {
            inflight.insert(pubkey.to_string(), weak);
        }
        lookup
    }

    fn filter(&self, pubkey: &str) -> Filter {
        let filter = Filter::new().kinds([self.kind]);
        match self.lookup {
            LookupBy::Author => filter.authors([pubkey]),
            LookupBy::PubkeyTag => filter.tag("p", [pubkey]),
        }
    }

    fn start(&self, pubkey: &str) -> LatestLookup {
        let kind = self.kind;
        let relays = self.relays.clone();
        if relays.is_empty() {
            return ready(Err(exhausted(pubkey, kind, &relays)));
        }

        let (tx, rx) = oneshot::channel::<Result<Event>>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        let found = tx.clone();

        let eose_relays = relays.clone();
        let eose_pubkey = pubkey.to_string();
        let finished: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
        let on_eose = move |relay: &str, _min_created_at: Option<u64>| {
            if !eose_relays.iter().any(|r| r == relay) {
                return;
            }
            let all_done = {
                let mut finished = finished.lock();
                finished.insert(relay.to_string());
                finished.len() >= eose_relays.len()
            };
            if all_done && let Some(tx) = tx.lock().take() {
                let _ = tx.send(Err(exhausted(&eose_pubkey, kind, &eose_relays)));
            }
        };

        let subscription = self.pool.subscribe(
            vec![self.filter(pubkey)],
            Some(&relays),
            move |event, _| {
                if let Some(tx) = found.lock().take() {
                    let _ = tx.send(Ok(event.clone()));
                }
            },
            SubscribeOptions {
                on_eose: Some(Arc::new(on_eose)),
                dont_send_other_filters: true,
                quiet: true,
                ..Default::default()
            },
        );
        let guard = SubscriptionGuard(subscription);

        let memo = self.memo.clone();
        let pubkey = pubkey.to_string();
        let mut closed = self.pool.closed_signal();

        async move {
            let _guard = guard;
            let outcome = tokio::select! {
                result = rx => result.unwrap_or(Err(ClientError::Closed)),
                _ = tokio::time::sleep(LOOKUP_TIMEOUT) => Err(ClientError::Timeout(format!(
                    "Timeout fetching kind {kind} for {pubkey}"
                ))),
                _ = closed.wait_for(|closed| *closed) => Err(ClientError::Closed),
            };

            match &outcome {
                Ok(event) => memo.insert(&pubkey, event.clone()),
                Err(e) => debug!("Lookup of kind {} for {} failed: {}", kind, pubkey, e),
            }
            memo.inflight.lock().remove(&pubkey);
            outcome
        }
        .boxed()
        .shared()
    }
}

fn ready(result: Result<Event>) -> LatestLookup {
    futures::future::ready(result).boxed().shared()
}

fn exhausted(pubkey: &str, kind: u16, relays: &[String]) -> ClientError {
    ClientError::Exhausted {
        pubkey: pubkey.to_string(),
        kind,
        relays: relays.to_vec(),
    }
}
