//! Relay pool: one logical subscribe/publish API over many relays.
//!
//! The pool owns every [`RelayConnection`] and the shared [`EventCache`].
//! A logical subscription is fanned out to one relay subscription per target
//! relay (optionally merged with other subscriptions to the same relay inside
//! a coalescing window) and each event id reaches its callback at most once.

use crate::cache::EventCache;
use crate::config::PoolConfig;
use crate::crypto::{EventCrypto, Secp256k1Crypto};
use crate::dispatcher::{RelayEvent, RelayEventKind};
use crate::error::{ClientError, Result};
use crate::latest::{LatestMemo, LookupBy, SingleFlightLatestCache};
use crate::message::{Filter, matches_any};
use crate::outbox::OutboxModel;
use crate::relay::{
    EoseListener, EventListener, KnownEventLookup, PublishHandle, RelayConnection, RelayOptions,
    SubscriptionOptions,
};
use crate::subscription::{DeliveryTracker, generate_subscription_id};
use crate::transport::ReadyState;
use crate::zap::{HttpLnurlClient, LnurlClient, ZapResult, fetch_zap_invoice};
use futures::future::join_all;
use nostr::{
    Event, KIND_CONTACTS, KIND_METADATA, RELAY_LIST_METADATA_KIND, auth_template,
    zap_endpoint_from_metadata, zap_request_template,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

/// How long [`RelayPool::get_event_by_id`] waits for an answer.
pub const GET_EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a delivered event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMeta<'a> {
    /// `None` for events answered from the cache
    pub relay_url: Option<&'a str>,
    /// The relay had already sent EOSE for this subscription
    pub after_eose: bool,
}

pub type OnEvent = Arc<dyn Fn(&Event, EventMeta<'_>) + Send + Sync>;
/// `(relay_url, oldest created_at seen from that relay before EOSE)`
pub type OnEose = Arc<dyn Fn(&str, Option<u64>) + Send + Sync>;
/// `(relay_url, payload)`
pub type RelayCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Coalescing window: filters for the same relay requested within it share one REQ
    pub max_delay: Option<Duration>,
    pub on_eose: Option<OnEose>,
    /// Skip the cache rewrite
    pub no_cache: bool,
    /// Skip the cache rewrite and never merge with other subscriptions
    pub dont_send_other_filters: bool,
    /// Overrides [`PoolConfig::skip_verification`]
    pub skip_verification: Option<bool>,
    /// Never log this subscription
    pub quiet: bool,
}

/// Pool-level view of relay lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Connected { relay_url: String },
    Disconnected { relay_url: String },
    Error { relay_url: String, error: String },
    Notice { relay_url: String, message: String },
    Auth { relay_url: String, challenge: String },
}

#[derive(Default)]
struct PoolListeners {
    auth: Vec<RelayCallback>,
    error: Vec<RelayCallback>,
    notice: Vec<RelayCallback>,
}

struct SubscriptionState {
    id: String,
    on_event: OnEvent,
    on_eose: Option<OnEose>,
    tracker: Mutex<DeliveryTracker>,
    /// `None` once unsubscribed
    routes: Mutex<Option<Vec<Arc<Route>>>>,
    quiet: bool,
}

impl SubscriptionState {
    fn is_closed(&self) -> bool {
        self.routes.lock().is_none()
    }

    fn add_route(&self, route: &Arc<Route>) -> bool {
        match self.routes.lock().as_mut() {
            Some(routes) => {
                routes.push(route.clone());
                true
            }
            None => false,
        }
    }

    fn deliver(&self, relay_url: Option<&str>, event: &Event) {
        if self.is_closed() {
            return;
        }
        let after_eose = {
            let mut tracker = self.tracker.lock();
            let after_eose = relay_url.is_some_and(|url| tracker.record_event(url, event.created_at));
            if !tracker.first_delivery(&event.id) {
                return;
            }
            after_eose
        };
        (self.on_event)(
            event,
            EventMeta {
                relay_url,
                after_eose,
            },
        );
    }

    fn eose(&self, relay_url: &str) {
        if self.is_closed() {
            return;
        }
        let first = self.tracker.lock().mark_eose(relay_url);
        if let (Some(min_created_at), Some(on_eose)) = (first, &self.on_eose) {
            on_eose(relay_url, min_created_at);
        }
    }
}

#[derive(Clone)]
struct Member {
    sub: Arc<SubscriptionState>,
    filters: Vec<Filter>,
}

/// One relay subscription serving one or more logical subscriptions.
struct Route {
    relay: RelayConnection,
    sub_id: String,
    members: Mutex<Vec<Member>>,
}

impl Route {
    fn eose(&self) {
        let members: Vec<Member> = self.members.lock().clone();
        for member in members {
            member.sub.eose(self.relay.url());
        }
    }
}

#[derive(Clone, Copy)]
struct RouteOptions {
    coalesce: Option<Duration>,
    skip_verification: bool,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    crypto: Arc<dyn EventCrypto>,
    lnurl: Arc<dyn LnurlClient>,
    relays: Mutex<HashMap<String, RelayConnection>>,
    cache: Option<Mutex<EventCache>>,
    outbox: OutboxModel,
    listeners: Mutex<PoolListeners>,
    events_tx: broadcast::Sender<PoolEvent>,
    /// Members waiting for a coalescing window, by (relay url, skip_verification)
    batches: Mutex<HashMap<(String, bool), Vec<Member>>>,
    closed: watch::Sender<bool>,
    metadata_memo: Arc<LatestMemo>,
    contacts_memo: Arc<LatestMemo>,
    write_relay_memo: Arc<LatestMemo>,
}

/// Handle to a logical subscription.
///
/// Dropping the handle does not unsubscribe; call [`unsubscribe`](Self::unsubscribe).
#[derive(Clone)]
pub struct Subscription {
    state: Arc<SubscriptionState>,
    pool: Weak<PoolInner>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_closed()
    }

    /// Tear the subscription down on every relay it was sent to.
    pub fn unsubscribe(&self) {
        match self.pool.upgrade() {
            Some(pool) => pool.unsubscribe(&self.state),
            None => {
                self.state.routes.lock().take();
            }
        }
    }
}

/// A pool of relay connections.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl RelayPool {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(Secp256k1Crypto),
            Arc::new(HttpLnurlClient::new()),
        )
    }

    /// Default config with `relays` as default relays, registered up front.
    pub fn with_relays(relays: Vec<String>) -> Self {
        let pool = Self::new(PoolConfig::default().with_default_relays(relays.clone()));
        for url in &relays {
            if let Err(e) = pool.add_or_get_relay(url) {
                warn!("Skipping relay {}: {}", url, e);
            }
        }
        pool
    }

    pub fn with_collaborators(
        config: PoolConfig,
        crypto: Arc<dyn EventCrypto>,
        lnurl: Arc<dyn LnurlClient>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(1000);
        let (closed, _) = watch::channel(false);
        let cache = config
            .use_event_cache
            .then(|| Mutex::new(EventCache::new(config.event_cache_capacity)));

        Self {
            inner: Arc::new(PoolInner {
                config,
                crypto,
                lnurl,
                relays: Mutex::new(HashMap::new()),
                cache,
                outbox: OutboxModel::new(),
                listeners: Mutex::new(PoolListeners::default()),
                events_tx,
                batches: Mutex::new(HashMap::new()),
                closed,
                metadata_memo: Arc::new(LatestMemo::default()),
                contacts_memo: Arc::new(LatestMemo::default()),
                write_relay_memo: Arc::new(LatestMemo::default()),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    /// Look up or create the connection for `url`. Does not connect.
    pub fn add_or_get_relay(&self, url: &str) -> Result<RelayConnection> {
        self.inner.add_or_get_relay(url)
    }

    /// `(url, state)` for every relay, sorted by url.
    pub fn relay_statuses(&self) -> Vec<(String, ReadyState)> {
        let mut statuses: Vec<(String, ReadyState)> = self
            .inner
            .relays
            .lock()
            .iter()
            .map(|(url, relay)| (url.clone(), relay.status()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    /// Connect every known relay and wait for the attempts to settle.
    pub async fn connect_all(&self) -> Vec<(String, Result<()>)> {
        let relays: Vec<RelayConnection> = self.inner.relays.lock().values().cloned().collect();
        let results = join_all(relays.iter().map(|relay| relay.connect())).await;
        relays
            .iter()
            .map(|relay| relay.url().to_string())
            .zip(results)
            .collect()
    }

    /// Receiver for relay lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn on_auth<F>(&self, listener: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.inner.listeners.lock().auth.push(Arc::new(listener));
    }

    pub fn on_error<F>(&self, listener: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.inner.listeners.lock().error.push(Arc::new(listener));
    }

    pub fn on_notice<F>(&self, listener: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.inner.listeners.lock().notice.push(Arc::new(listener));
    }

    /// Subscribe to `filters` on `relays`, or on each author's write relays when `None`.
    ///
    /// Cached matches are delivered before this returns, with
    /// `relay_url: None`. Each event id reaches `on_event` at most once.
    pub fn subscribe<F>(
        &self,
        filters: Vec<Filter>,
        relays: Option<&[String]>,
        on_event: F,
        options: SubscribeOptions,
    ) -> Subscription
    where
        F: Fn(&Event, EventMeta<'_>) + Send + Sync + 'static,
    {
        let inner = &self.inner;
        let state = Arc::new(SubscriptionState {
            id: generate_subscription_id(),
            on_event: Arc::new(on_event),
            on_eose: options.on_eose.clone(),
            tracker: Mutex::new(DeliveryTracker::new()),
            routes: Mutex::new(Some(Vec::new())),
            quiet: options.quiet,
        });
        let subscription = Subscription {
            state: state.clone(),
            pool: Arc::downgrade(inner),
        };
        if inner.is_closed() {
            debug!("Ignoring subscribe on a closed pool");
            return subscription;
        }

        let route = RouteOptions {
            coalesce: options
                .max_delay
                .filter(|delay| !delay.is_zero() && !options.dont_send_other_filters),
            skip_verification: options
                .skip_verification
                .unwrap_or(inner.config.skip_verification),
        };

        let mut filters = filters;
        if let Some(cache) = &inner.cache
            && !options.no_cache
            && !options.dont_send_other_filters
        {
            let cache_relays = relays
                .map(<[String]>::to_vec)
                .unwrap_or_else(|| inner.config.default_relays.clone());
            let answered = cache
                .lock()
                .get_cached_events_with_updated_filters(filters, &cache_relays);
            for event in &answered.events {
                state.deliver(None, event);
            }
            filters = answered.filters;
        }
        filters.retain(|filter| !filter.is_exhausted());

        let (annotated, unrouted): (Vec<Filter>, Vec<Filter>) =
            filters.into_iter().partition(|filter| filter.relay.is_some());

        let mut targets: BTreeMap<String, Vec<Filter>> = BTreeMap::new();
        for mut filter in annotated {
            if let Some(relay) = filter.relay.take() {
                targets.entry(relay).or_default().push(filter);
            }
        }

        match relays {
            Some(relays) => {
                for relay in relays {
                    targets
                        .entry(relay.clone())
                        .or_default()
                        .extend(unrouted.iter().cloned());
                }
            }
            None => {
                let plan = inner.outbox.plan(&unrouted, &inner.config.default_relays);
                for (relay, filters) in plan.filters_by_relay {
                    targets.entry(relay).or_default().extend(filters);
                }
                if !plan.pending.is_empty() {
                    self.discover_and_attach(&state, plan.unknown_authors, plan.pending, route);
                } else if targets.is_empty() {
                    for relay in &inner.config.default_relays {
                        targets.entry(relay.clone()).or_default();
                    }
                }
            }
        }

        for (relay, filters) in targets {
            if filters.is_empty() {
                state.eose(&relay);
            } else {
                inner.attach(&state, &relay, filters, route);
            }
        }

        subscription
    }

    /// Subscribe the parts of `pending` once the write relays of `authors` are looked up.
    fn discover_and_attach(
        &self,
        state: &Arc<SubscriptionState>,
        authors: Vec<String>,
        pending: Vec<Filter>,
        route: RouteOptions,
    ) {
        let cache = self.write_relay_cache();
        let lookups: Vec<_> = authors.iter().map(|author| cache.get(author)).collect();
        let pool = self.clone();
        let state = state.clone();

        tokio::spawn(async move {
            for (author, result) in authors.iter().zip(join_all(lookups).await) {
                if let Err(e) = result {
                    debug!("No write relays for {}: {}", author, e);
                }
            }
            if state.is_closed() || pool.is_closed() {
                return;
            }

            let inner = &pool.inner;
            let plan = inner.outbox.plan(&pending, &inner.config.default_relays);
            let mut targets = plan.filters_by_relay;
            for filter in plan.pending {
                for relay in &inner.config.default_relays {
                    targets.entry(relay.clone()).or_default().push(filter.clone());
                }
            }
            for (relay, filters) in targets {
                inner.attach(&state, &relay, filters, route);
            }
        });
    }

    /// Send `event` to every relay in `relays`.
    ///
    /// Acknowledgements are tracked per relay through the returned handles.
    pub fn publish(&self, event: &Event, relays: &[String]) -> Result<Vec<PublishHandle>> {
        if event.id.is_empty() {
            return Err(ClientError::InvalidEvent(
                "can't publish an event without an id".to_string(),
            ));
        }
        let targets = relays
            .iter()
            .map(|url| self.inner.add_or_get_relay(url))
            .collect::<Result<Vec<_>>>()?;

        targets
            .iter()
            .map(|relay| {
                relay.connect_in_background();
                relay.publish(event)
            })
            .collect()
    }

    /// Answer an auth challenge from `relay_url`.
    pub fn authenticate(
        &self,
        relay_url: &str,
        challenge: &str,
        secret_key: &[u8; 32],
    ) -> Result<PublishHandle> {
        let event = self
            .inner
            .crypto
            .sign(&auth_template(relay_url, challenge), secret_key)?;
        let relay = self.inner.add_or_get_relay(relay_url)?;
        relay.connect_in_background();
        relay.auth(&event)
    }

    /// NIP-50 search; otherwise the same as [`subscribe`](Self::subscribe).
    pub fn search<F>(
        &self,
        term: &str,
        relays: &[String],
        on_event: F,
        max_delay: Option<Duration>,
    ) -> Subscription
    where
        F: Fn(&Event, EventMeta<'_>) + Send + Sync + 'static,
    {
        self.subscribe(
            vec![Filter::new().search(term)],
            Some(relays),
            on_event,
            SubscribeOptions {
                max_delay,
                ..Default::default()
            },
        )
    }

    /// Fetch one event by id, from the cache when possible.
    ///
    /// `Ok(None)` once every relay sent EOSE without it. An empty `relays`
    /// means the default relays.
    pub async fn get_event_by_id(
        &self,
        id: &str,
        relays: &[String],
        max_delay: Option<Duration>,
    ) -> Result<Option<Event>> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let relays = if relays.is_empty() {
            self.inner.config.default_relays.clone()
        } else {
            relays.to_vec()
        };

        let (tx, rx) = oneshot::channel::<Option<Event>>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let found = tx.clone();
        let waiting: Mutex<HashSet<String>> = Mutex::new(relays.iter().cloned().collect());

        let subscription = self.subscribe(
            vec![Filter::new().ids([id])],
            Some(&relays),
            move |event, _| {
                if let Some(tx) = found.lock().take() {
                    let _ = tx.send(Some(event.clone()));
                }
            },
            SubscribeOptions {
                max_delay,
                on_eose: Some(Arc::new(move |relay: &str, _: Option<u64>| {
                    let done = {
                        let mut waiting = waiting.lock();
                        waiting.remove(relay);
                        waiting.is_empty()
                    };
                    if done && let Some(tx) = tx.lock().take() {
                        let _ = tx.send(None);
                    }
                })),
                ..Default::default()
            },
        );

        let mut closed = self.closed_signal();
        let outcome = tokio::select! {
            found = rx => found.map_err(|_| ClientError::Closed),
            _ = tokio::time::sleep(GET_EVENT_TIMEOUT) => {
                Err(ClientError::Timeout(format!("Timeout fetching event {id}")))
            }
            _ = closed.wait_for(|closed| *closed) => Err(ClientError::Closed),
        };
        subscription.unsubscribe();
        outcome
    }

    /// Zap `recipient_pubkey` from the holder of `sender_key`.
    ///
    /// Resolves the recipient's LNURL endpoint from their metadata, signs a
    /// zap request and returns it with the invoice. The request is published
    /// to the default relays only if [`PoolConfig::zap_auto_publish`] is set.
    pub async fn zap(
        &self,
        sender_key: &[u8; 32],
        recipient_pubkey: &str,
        amount_sats: u64,
        comment: &str,
    ) -> Result<ZapResult> {
        let metadata = match self.cached_metadata(recipient_pubkey) {
            Some(event) => event,
            None => self.fetch_and_cache_metadata(recipient_pubkey).await?,
        };
        let endpoint = zap_endpoint_from_metadata(&metadata.content)?;

        let amount_msats = amount_sats.saturating_mul(1000);
        let template = zap_request_template(
            recipient_pubkey,
            amount_msats,
            &self.inner.config.default_relays,
            comment,
            endpoint.lnurl.as_deref(),
        );
        let zap_request_event = self.inner.crypto.sign(&template, sender_key)?;

        let invoice = fetch_zap_invoice(
            self.inner.lnurl.as_ref(),
            &endpoint,
            &zap_request_event,
            amount_msats,
        )
        .await?;
        info!("Got zap invoice for {} sats to {}", amount_sats, recipient_pubkey);

        if self.inner.config.zap_auto_publish {
            self.publish(&zap_request_event, &self.inner.config.default_relays)?;
        }

        Ok(ZapResult {
            zap_request_event,
            invoice,
        })
    }

    /// Kind 0 lookups on the discovery relays.
    pub fn metadata_cache(&self) -> SingleFlightLatestCache<'_> {
        SingleFlightLatestCache::with_memo(
            self,
            self.inner.metadata_memo.clone(),
            KIND_METADATA,
            self.inner.config.discovery_relays.clone(),
            LookupBy::Author,
        )
    }

    /// Kind 3 lookups on the discovery relays.
    pub fn contact_list_cache(&self) -> SingleFlightLatestCache<'_> {
        SingleFlightLatestCache::with_memo(
            self,
            self.inner.contacts_memo.clone(),
            KIND_CONTACTS,
            self.inner.config.discovery_relays.clone(),
            LookupBy::Author,
        )
    }

    /// Kind 10002 lookups on the discovery relays.
    pub fn write_relay_cache(&self) -> SingleFlightLatestCache<'_> {
        SingleFlightLatestCache::with_memo(
            self,
            self.inner.write_relay_memo.clone(),
            RELAY_LIST_METADATA_KIND,
            self.inner.config.discovery_relays.clone(),
            LookupBy::Author,
        )
    }

    pub async fn fetch_and_cache_metadata(&self, pubkey: &str) -> Result<Event> {
        self.metadata_cache().get(pubkey).await
    }

    pub async fn fetch_and_cache_contact_list(&self, pubkey: &str) -> Result<Event> {
        self.contact_list_cache().get(pubkey).await
    }

    /// Seed the metadata memo and the event cache.
    pub fn set_cached_metadata(&self, pubkey: &str, event: Event) {
        if let Some(cache) = &self.inner.cache {
            cache.lock().add_event(event.clone());
        }
        self.inner.metadata_memo.insert(pubkey, event);
    }

    pub fn set_write_relays_for_pubkey(&self, pubkey: &str, relays: Vec<String>) {
        self.inner.outbox.set_write_relays(pubkey, relays);
    }

    pub fn write_relays_for_pubkey(&self, pubkey: &str) -> Option<Vec<String>> {
        self.inner.outbox.get_write_relays(pubkey)
    }

    fn cached_metadata(&self, pubkey: &str) -> Option<Event> {
        self.inner.metadata_memo.get(pubkey).or_else(|| {
            self.inner
                .cache
                .as_ref()
                .and_then(|cache| cache.lock().metadata_for(pubkey).cloned())
        })
    }

    /// Subscribe to the events `event` references through `e` tags.
    ///
    /// `None` if it references none.
    pub fn subscribe_referenced_events<F>(
        &self,
        event: &Event,
        on_event: F,
        max_delay: Option<Duration>,
    ) -> Option<Subscription>
    where
        F: Fn(&Event, EventMeta<'_>) + Send + Sync + 'static,
    {
        let ids: Vec<&str> = event.tag_values("e").collect();
        if ids.is_empty() {
            return None;
        }
        Some(self.subscribe(
            vec![Filter::new().ids(ids)],
            None,
            on_event,
            SubscribeOptions {
                max_delay,
                ..Default::default()
            },
        ))
    }

    /// [`subscribe_referenced_events`](Self::subscribe_referenced_events), also
    /// warming the metadata cache for the author and every `p`-tagged pubkey.
    pub fn subscribe_referenced_events_and_prefetch_metadata<F>(
        &self,
        event: &Event,
        on_event: F,
        max_delay: Option<Duration>,
    ) -> Option<Subscription>
    where
        F: Fn(&Event, EventMeta<'_>) + Send + Sync + 'static,
    {
        let mut pubkeys = vec![event.pubkey.as_str()];
        pubkeys.extend(event.tag_values("p"));
        pubkeys.dedup();
        let metadata = self.metadata_cache();
        for pubkey in pubkeys {
            let lookup = metadata.get(pubkey);
            let pubkey = pubkey.to_string();
            tokio::spawn(async move {
                if let Err(e) = lookup.await {
                    debug!("Metadata prefetch for {} failed: {}", pubkey, e);
                }
            });
        }
        self.subscribe_referenced_events(event, on_event, max_delay)
    }

    /// Cached event by id; refreshes its recency.
    pub fn cached_event(&self, id: &str) -> Option<Event> {
        self.inner
            .cache
            .as_ref()
            .and_then(|cache| cache.lock().get_event_by_id(id))
    }

    /// Close every relay. Pending lookups fail with [`ClientError::Closed`].
    pub async fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        info!("Closing relay pool");
        self.inner.batches.lock().clear();
        let relays: Vec<RelayConnection> = self
            .inner
            .relays
            .lock()
            .drain()
            .map(|(_, relay)| relay)
            .collect();
        join_all(relays.iter().map(|relay| relay.close())).await;
    }
}

impl PoolInner {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn add_or_get_relay(self: &Arc<Self>, url: &str) -> Result<RelayConnection> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let mut relays = self.relays.lock();
        if let Some(relay) = relays.get(url) {
            return Ok(relay.clone());
        }

        let pool = Arc::downgrade(self);
        let known_event: KnownEventLookup = Arc::new(move |id: &str| {
            pool.upgrade()
                .and_then(|pool| {
                    pool.cache
                        .as_ref()
                        .map(|cache| cache.lock().has_event_by_id(id))
                })
                .unwrap_or(false)
        });

        let relay = RelayConnection::new(
            url,
            RelayOptions {
                transport: self.config.transport.clone(),
                crypto: self.crypto.clone(),
                known_event: Some(known_event),
            },
        )?;

        for kind in [
            RelayEventKind::Connect,
            RelayEventKind::Disconnect,
            RelayEventKind::Error,
            RelayEventKind::Notice,
            RelayEventKind::Auth,
        ] {
            let pool = Arc::downgrade(self);
            let relay_url = url.to_string();
            relay.on(kind, move |event| {
                if let Some(pool) = pool.upgrade() {
                    pool.handle_relay_event(&relay_url, event);
                }
            });
        }

        debug!("Added relay {} to pool", url);
        relays.insert(url.to_string(), relay.clone());
        Ok(relay)
    }

    fn handle_relay_event(&self, relay_url: &str, event: &RelayEvent) {
        let relay_url = relay_url.to_string();
        let pool_event = match event {
            RelayEvent::Connect => {
                debug!("Relay {} is open", relay_url);
                PoolEvent::Connected { relay_url }
            }
            RelayEvent::Disconnect => {
                debug!("Relay {} went away", relay_url);
                PoolEvent::Disconnected { relay_url }
            }
            RelayEvent::Error(error) => {
                if self.config.log_errors_and_notices {
                    warn!("Relay {} error: {}", relay_url, error);
                }
                let listeners = self.listeners.lock().error.clone();
                listeners.iter().for_each(|listener| listener(&relay_url, error));
                PoolEvent::Error {
                    relay_url,
                    error: error.clone(),
                }
            }
            RelayEvent::Notice(message) => {
                if self.config.log_errors_and_notices {
                    info!("Notice from {}: {}", relay_url, message);
                }
                let listeners = self.listeners.lock().notice.clone();
                listeners.iter().for_each(|listener| listener(&relay_url, message));
                PoolEvent::Notice {
                    relay_url,
                    message: message.clone(),
                }
            }
            RelayEvent::Auth(challenge) => {
                debug!("Auth challenge from {}", relay_url);
                let listeners = self.listeners.lock().auth.clone();
                listeners.iter().for_each(|listener| listener(&relay_url, challenge));
                PoolEvent::Auth {
                    relay_url,
                    challenge: challenge.clone(),
                }
            }
        };
        let _ = self.events_tx.send(pool_event);
    }

    fn attach(
        self: &Arc<Self>,
        state: &Arc<SubscriptionState>,
        relay_url: &str,
        filters: Vec<Filter>,
        route: RouteOptions,
    ) {
        let relay = match self.add_or_get_relay(relay_url) {
            Ok(relay) => relay,
            Err(e) => {
                warn!("Can't subscribe {} on {}: {}", state.id, relay_url, e);
                return;
            }
        };
        if self.config.log_subscriptions && !state.quiet {
            info!(
                "Subscribing {} on {}: {}",
                state.id,
                relay_url,
                serde_json::to_string(&filters).unwrap_or_default()
            );
        }
        relay.connect_in_background();

        let member = Member {
            sub: state.clone(),
            filters,
        };
        match route.coalesce {
            Some(delay) => self.enqueue(relay, member, delay, route.skip_verification),
            None => self.open_route(relay, state.id.clone(), vec![member], route.skip_verification),
        }
    }

    fn enqueue(
        self: &Arc<Self>,
        relay: RelayConnection,
        member: Member,
        delay: Duration,
        skip_verification: bool,
    ) {
        let key = (relay.url().to_string(), skip_verification);
        {
            let mut batches = self.batches.lock();
            if let Some(batch) = batches.get_mut(&key) {
                batch.push(member);
                return;
            }
            batches.insert(key.clone(), vec![member]);
        }

        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(pool) = pool.upgrade() {
                pool.flush(relay, key);
            }
        });
    }

    fn flush(self: &Arc<Self>, relay: RelayConnection, key: (String, bool)) {
        let members: Vec<Member> = self
            .batches
            .lock()
            .remove(&key)
            .unwrap_or_default()
            .into_iter()
            .filter(|member| !member.sub.is_closed())
            .collect();
        if members.is_empty() || self.is_closed() {
            return;
        }
        debug!(
            "Merging {} subscriptions into one REQ on {}",
            members.len(),
            relay.url()
        );
        self.open_route(relay, generate_subscription_id(), members, key.1);
    }

    fn open_route(
        self: &Arc<Self>,
        relay: RelayConnection,
        sub_id: String,
        members: Vec<Member>,
        skip_verification: bool,
    ) {
        let route = Arc::new(Route {
            relay: relay.clone(),
            sub_id: sub_id.clone(),
            members: Mutex::new(Vec::new()),
        });
        let members: Vec<Member> = members
            .into_iter()
            .filter(|member| member.sub.add_route(&route))
            .collect();
        if members.is_empty() {
            return;
        }

        let mut filters: Vec<Filter> = Vec::new();
        for filter in members.iter().flat_map(|member| &member.filters) {
            if !filters.contains(filter) {
                filters.push(filter.clone());
            }
        }
        *route.members.lock() = members;

        let pool = Arc::downgrade(self);
        let event_route = Arc::downgrade(&route);
        let on_event: EventListener = Arc::new(move |event: &Event| {
            if let (Some(pool), Some(route)) = (pool.upgrade(), event_route.upgrade()) {
                pool.route_event(&route, event);
            }
        });
        let eose_route = Arc::downgrade(&route);
        let on_eose: EoseListener = Arc::new(move || {
            if let Some(route) = eose_route.upgrade() {
                route.eose();
            }
        });

        relay.sub_with_listeners(
            filters,
            SubscriptionOptions {
                id: Some(sub_id),
                skip_verification,
            },
            Some(on_event),
            Some(on_eose),
        );
    }

    /// Cache an accepted event and hand it to every member it matches.
    fn route_event(&self, route: &Route, event: &Event) {
        let event = self.accept_event(event);
        let members: Vec<Member> = route
            .members
            .lock()
            .iter()
            .filter(|member| matches_any(&member.filters, &event))
            .cloned()
            .collect();
        for member in members {
            member.sub.deliver(Some(route.relay.url()), &event);
        }
    }

    fn accept_event(&self, event: &Event) -> Event {
        let mut event = event.clone();
        if self.config.delete_signatures {
            event.sig.clear();
        }
        if let Some(cache) = &self.cache {
            cache.lock().add_event(event.clone());
        }
        if event.kind == RELAY_LIST_METADATA_KIND
            && let Err(e) = self.outbox.update_relay_list(&event)
        {
            debug!("Ignoring relay list {}: {}", event.id, e);
        }
        event
    }

    fn unsubscribe(&self, state: &Arc<SubscriptionState>) {
        let Some(routes) = state.routes.lock().take() else {
            return;
        };
        if self.config.log_subscriptions && !state.quiet {
            info!("Unsubscribing {}", state.id);
        }
        for route in routes {
            let orphaned = {
                let mut members = route.members.lock();
                members.retain(|member| !Arc::ptr_eq(&member.sub, state));
                members.is_empty()
            };
            if orphaned {
                route.relay.unsub(&route.sub_id);
            }
        }
        for members in self.batches.lock().values_mut() {
            members.retain(|member| !Arc::ptr_eq(&member.sub, state));
        }
    }
}
