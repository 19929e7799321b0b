//! Protocol state machine for a single relay.
//!
//! Wraps one [`TransportConnection`] and keeps the relay's open subscriptions,
//! publish listeners and the outbound frames queued while disconnected.
//! Inbound frames go through a [`SequentialMessageQueue`], so each relay's
//! messages are handled strictly in arrival order.

use crate::crypto::{EventCrypto, Secp256k1Crypto};
use crate::dispatcher::{EventDispatcher, ListenerId, RelayEvent, RelayEventKind};
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter, MessageError, RelayMessage, matches_any};
use crate::queue::SequentialMessageQueue;
use crate::subscription::{generate_subscription_id, monitor_subscription_id};
use crate::transport::{ReadyState, TransportConfig, TransportConnection, TransportHandler};
use futures::FutureExt;
use nostr::Event;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// How long a published event may take to come back on the monitor subscription.
pub const SEEN_TIMEOUT: Duration = Duration::from_secs(5);

pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;
pub type EoseListener = Arc<dyn Fn() + Send + Sync>;
/// Answers "is this event id already known (and verified)?"
pub type KnownEventLookup = Arc<dyn Fn(&str) -> bool + Send + Sync>;

type SignalListener = Arc<dyn Fn() + Send + Sync>;
type FailureListener = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    /// Reuse a subscription id; a fresh one is generated otherwise.
    pub id: Option<String>,
    pub skip_verification: bool,
}

/// Construction options for a [`RelayConnection`].
#[derive(Clone)]
pub struct RelayOptions {
    pub transport: TransportConfig,
    pub crypto: Arc<dyn EventCrypto>,
    /// Events this lookup knows skip signature verification.
    pub known_event: Option<KnownEventLookup>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            crypto: Arc::new(Secp256k1Crypto),
            known_event: None,
        }
    }
}

struct OpenSub {
    filters: Arc<Vec<Filter>>,
    skip_verification: bool,
    /// Ids already delivered on this subscription
    seen: HashSet<String>,
}

#[derive(Default)]
struct SubListeners {
    event: Vec<(ListenerId, EventListener)>,
    eose: Vec<(ListenerId, EoseListener)>,
}

#[derive(Default)]
struct PubListeners {
    ok: Vec<SignalListener>,
    seen: Vec<SignalListener>,
    failed: Vec<FailureListener>,
    acknowledged: bool,
    monitoring: bool,
}

#[derive(Default)]
struct RelayState {
    open_subs: HashMap<String, OpenSub>,
    sub_listeners: HashMap<String, SubListeners>,
    pub_listeners: HashMap<String, PubListeners>,
    /// Frames written while the socket was not open, in FIFO order
    send_on_connect: Vec<String>,
    /// Seen-deadline timers by event id
    monitors: HashMap<String, JoinHandle<()>>,
}

struct RelayInner {
    url: String,
    transport: TransportConnection,
    dispatcher: EventDispatcher,
    crypto: Arc<dyn EventCrypto>,
    known_event: Option<KnownEventLookup>,
    state: Mutex<RelayState>,
}

/// Bridges transport callbacks into the relay without owning it.
struct RelayTransportHandler {
    relay: Arc<OnceLock<Weak<RelayInner>>>,
    queue: SequentialMessageQueue<String>,
}

impl RelayTransportHandler {
    fn relay(&self) -> Option<Arc<RelayInner>> {
        self.relay.get().and_then(Weak::upgrade)
    }
}

impl TransportHandler for RelayTransportHandler {
    fn on_open(&self) {
        if let Some(relay) = self.relay() {
            relay.on_open();
        }
    }

    fn on_message(&self, payload: String) {
        self.queue.push(payload);
    }

    fn on_error(&self, error: &ClientError) {
        if let Some(relay) = self.relay() {
            relay.dispatcher.emit(&RelayEvent::Error(error.to_string()));
        }
    }

    fn on_close(&self, _intentional: bool) {
        if let Some(relay) = self.relay() {
            relay.dispatcher.emit(&RelayEvent::Disconnect);
        }
    }
}

/// Handle to one relay. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RelayConnection {
    inner: Arc<RelayInner>,
}

impl fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.inner.url)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl RelayConnection {
    /// Create a relay connection. Does not connect.
    pub fn new(url: &str, options: RelayOptions) -> Result<Self> {
        let slot: Arc<OnceLock<Weak<RelayInner>>> = Arc::new(OnceLock::new());

        let queue_slot = slot.clone();
        let queue = SequentialMessageQueue::new(
            url,
            Arc::new(move |frame: String| {
                let relay = queue_slot.get().and_then(Weak::upgrade);
                async move {
                    match relay {
                        Some(relay) => relay.handle_message(&frame),
                        None => Ok(()),
                    }
                }
                .boxed()
            }),
        );

        let handler = Arc::new(RelayTransportHandler {
            relay: slot.clone(),
            queue,
        });
        let transport = TransportConnection::new(url, options.transport, handler)?;

        let inner = Arc::new(RelayInner {
            url: url.to_string(),
            transport,
            dispatcher: EventDispatcher::new(),
            crypto: options.crypto,
            known_event: options.known_event,
            state: Mutex::new(RelayState::default()),
        });
        let _ = slot.set(Arc::downgrade(&inner));

        Ok(Self { inner })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn status(&self) -> ReadyState {
        self.inner.transport.ready_state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_open()
    }

    pub async fn connect(&self) -> Result<()> {
        self.inner.transport.connect().await
    }

    /// Start connecting without waiting, unless a socket is already up or opening.
    pub fn connect_in_background(&self) {
        if self.status() != ReadyState::Closed {
            return;
        }
        let relay = self.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.connect().await {
                debug!("Background connect to {} failed: {}", relay.url(), e);
            }
        });
    }

    /// Close the socket and cancel pending seen-deadlines.
    pub async fn close(&self) {
        let timers: Vec<JoinHandle<()>> = {
            let mut state = self.inner.state.lock();
            state.monitors.drain().map(|(_, timer)| timer).collect()
        };
        for timer in timers {
            timer.abort();
        }
        self.inner.transport.close().await;
    }

    pub fn on<F>(&self, kind: RelayEventKind, listener: F) -> ListenerId
    where
        F: Fn(&RelayEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on(kind, listener)
    }

    pub fn off(&self, kind: RelayEventKind, id: ListenerId) -> bool {
        self.inner.dispatcher.off(kind, id)
    }

    /// Register (or replace) a subscription and send its REQ if connected.
    ///
    /// While disconnected the REQ goes out when the socket opens.
    pub fn sub(&self, filters: Vec<Filter>, options: SubscriptionOptions) -> RelaySubscription {
        self.sub_with_listeners(filters, options, None, None)
    }

    /// Like [`sub`](Self::sub), with listeners in place before the REQ is sent.
    pub fn sub_with_listeners(
        &self,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
        on_event: Option<EventListener>,
        on_eose: Option<EoseListener>,
    ) -> RelaySubscription {
        let id = options.id.unwrap_or_else(generate_subscription_id);
        let filters = Arc::new(filters);
        {
            let mut state = self.inner.state.lock();
            let seen = state
                .open_subs
                .remove(&id)
                .map(|previous| previous.seen)
                .unwrap_or_default();
            state.open_subs.insert(
                id.clone(),
                OpenSub {
                    filters: filters.clone(),
                    skip_verification: options.skip_verification,
                    seen,
                },
            );
            let listeners = state.sub_listeners.entry(id.clone()).or_default();
            if let Some(listener) = on_event {
                listeners.event.push((ListenerId::next(), listener));
            }
            if let Some(listener) = on_eose {
                listeners.eose.push((ListenerId::next(), listener));
            }
        }

        if self.is_connected() {
            self.inner.send_req(&id, &filters);
        }

        RelaySubscription {
            relay: self.clone(),
            id,
            skip_verification: options.skip_verification,
        }
    }

    /// Forget subscription `id` and send CLOSE if connected.
    pub fn unsub(&self, id: &str) {
        self.inner.unsub(id);
    }

    pub fn subscription_filters(&self, id: &str) -> Option<Vec<Filter>> {
        self.inner
            .state
            .lock()
            .open_subs
            .get(id)
            .map(|sub| sub.filters.as_ref().clone())
    }

    /// Ids of the subscriptions currently registered on this relay.
    pub fn open_subscription_ids(&self) -> Vec<String> {
        self.inner.state.lock().open_subs.keys().cloned().collect()
    }

    /// Send `["EVENT", event]`, queueing it if the socket is not open.
    pub fn publish(&self, event: &Event) -> Result<PublishHandle> {
        self.send_event_frame(event, ClientMessage::Event(event))
    }

    /// Send `["AUTH", event]` in answer to a challenge.
    pub fn auth(&self, event: &Event) -> Result<PublishHandle> {
        self.send_event_frame(event, ClientMessage::Auth(event))
    }

    fn send_event_frame(&self, event: &Event, message: ClientMessage<'_>) -> Result<PublishHandle> {
        if event.id.is_empty() {
            return Err(ClientError::InvalidEvent(
                "can't send an event without an id".to_string(),
            ));
        }
        let frame = message.to_json()?;
        self.inner
            .state
            .lock()
            .pub_listeners
            .entry(event.id.clone())
            .or_default();
        self.inner.send_or_queue(frame);

        Ok(PublishHandle {
            relay: self.clone(),
            event_id: event.id.clone(),
        })
    }

    /// Frames waiting for the socket to open.
    pub fn queued_frames(&self) -> usize {
        self.inner.state.lock().send_on_connect.len()
    }

    /// Deadline and listener are in place before the monitor REQ goes out.
    fn start_monitoring(&self, event_id: &str) {
        let monitor_id = monitor_subscription_id(event_id);
        {
            let mut state = self.inner.state.lock();
            if state.monitors.contains_key(event_id) {
                return;
            }
            state.pub_listeners.entry(event_id.to_string()).or_default().monitoring = true;

            let relay = Arc::downgrade(&self.inner);
            let id = event_id.to_string();
            let timer_monitor_id = monitor_id.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(SEEN_TIMEOUT).await;
                if let Some(relay) = relay.upgrade() {
                    relay.unsub(&timer_monitor_id);
                    relay.finish_monitor(&id, Some("event not seen after 5 seconds"));
                }
            });
            state.monitors.insert(event_id.to_string(), timer);
        }

        let relay = Arc::downgrade(&self.inner);
        let id = event_id.to_string();
        let seen_monitor_id = monitor_id.clone();
        let on_seen: EventListener = Arc::new(move |_: &Event| {
            if let Some(relay) = relay.upgrade() {
                relay.unsub(&seen_monitor_id);
                relay.finish_monitor(&id, None);
            }
        });
        self.sub_with_listeners(
            vec![Filter::new().ids([event_id])],
            SubscriptionOptions {
                id: Some(monitor_id),
                skip_verification: false,
            },
            Some(on_seen),
            None,
        );
    }
}

impl RelayInner {
    fn on_open(&self) {
        let (subs, queued) = {
            let mut state = self.state.lock();
            let subs: Vec<(String, Arc<Vec<Filter>>)> = state
                .open_subs
                .iter()
                .map(|(id, sub)| (id.clone(), sub.filters.clone()))
                .collect();
            (subs, std::mem::take(&mut state.send_on_connect))
        };

        debug!(
            "Relay {} open: replaying {} subscriptions and {} queued frames",
            self.url,
            subs.len(),
            queued.len()
        );
        for (id, filters) in subs {
            self.send_req(&id, &filters);
        }
        for frame in queued {
            self.send_or_queue(frame);
        }
        self.dispatcher.emit(&RelayEvent::Connect);
    }

    fn send_or_queue(&self, frame: String) {
        if self.transport.is_open() && self.transport.send(frame.clone()).is_ok() {
            return;
        }
        trace!("Queueing frame for {} until connected", self.url);
        self.state.lock().send_on_connect.push(frame);
    }

    fn send_req(&self, id: &str, filters: &[Filter]) {
        let message = ClientMessage::Req {
            subscription_id: id,
            filters,
        };
        match message.to_json() {
            Ok(frame) => self.send_or_queue(frame),
            Err(e) => warn!("Failed to encode REQ {} for {}: {}", id, self.url, e),
        }
    }

    fn send_close(&self, id: &str) {
        if !self.transport.is_open() {
            return;
        }
        match (ClientMessage::Close {
            subscription_id: id,
        })
        .to_json()
        {
            Ok(frame) => {
                let _ = self.transport.send(frame);
            }
            Err(e) => warn!("Failed to encode CLOSE {} for {}: {}", id, self.url, e),
        }
    }

    fn unsub(&self, id: &str) {
        let existed = {
            let mut state = self.state.lock();
            state.sub_listeners.remove(id);
            state.open_subs.remove(id).is_some()
        };
        if existed {
            self.send_close(id);
        }
    }

    fn handle_message(&self, frame: &str) -> Result<()> {
        let message = match RelayMessage::from_json(frame) {
            Ok(message) => message,
            Err(MessageError::UnknownType(kind)) => {
                trace!("Ignoring {} frame from {}", kind, self.url);
                return Ok(());
            }
            Err(MessageError::InvalidEvent(reason)) => {
                debug!("Dropping malformed event from {}: {}", self.url, reason);
                return Ok(());
            }
            Err(MessageError::InvalidFormat(reason)) => {
                let error = format!("Failed to parse message from {}: {}", self.url, reason);
                self.dispatcher.emit(&RelayEvent::Error(error.clone()));
                return Err(ClientError::Protocol(error));
            }
        };

        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.handle_event(&subscription_id, event),
            RelayMessage::Eose { subscription_id } => {
                let listeners: Vec<EoseListener> = self
                    .state
                    .lock()
                    .sub_listeners
                    .get(&subscription_id)
                    .map(|l| l.eose.iter().map(|(_, f)| f.clone()).collect())
                    .unwrap_or_default();
                for listener in listeners {
                    listener();
                }
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                reason,
            } => self.handle_ok(&event_id, accepted, &reason),
            RelayMessage::Notice { message } => {
                self.dispatcher.emit(&RelayEvent::Notice(message));
            }
            RelayMessage::Auth { challenge } => {
                self.dispatcher.emit(&RelayEvent::Auth(challenge));
            }
        }
        Ok(())
    }

    fn handle_event(&self, subscription_id: &str, event: Event) {
        let (filters, skip_verification) = {
            let state = self.state.lock();
            let Some(sub) = state.open_subs.get(subscription_id) else {
                trace!("Event for unknown subscription {} on {}", subscription_id, self.url);
                return;
            };
            if sub.seen.contains(&event.id) {
                return;
            }
            (sub.filters.clone(), sub.skip_verification)
        };

        if let Err(e) = self.check_event(&event, skip_verification) {
            debug!("Dropping event {} from {}: {}", event.id, self.url, e);
            return;
        }
        if !matches_any(&filters, &event) {
            debug!(
                "Dropping event {} from {}: does not match subscription {}",
                event.id, self.url, subscription_id
            );
            return;
        }

        let listeners: Vec<EventListener> = {
            let mut state = self.state.lock();
            let Some(sub) = state.open_subs.get_mut(subscription_id) else {
                return;
            };
            if !sub.seen.insert(event.id.clone()) {
                return;
            }
            state
                .sub_listeners
                .get(subscription_id)
                .map(|l| l.event.iter().map(|(_, f)| f.clone()).collect())
                .unwrap_or_default()
        };
        for listener in listeners {
            listener(&event);
        }
    }

    /// Shape always; signature unless skipped or already known.
    fn check_event(&self, event: &Event, skip_verification: bool) -> Result<()> {
        if !self.crypto.validate_shape(event) {
            return Err(ClientError::Validation("badly shaped event".to_string()));
        }
        let known = self.known_event.as_ref().is_some_and(|known| known(&event.id));
        if !skip_verification && !known && !self.crypto.verify(event) {
            return Err(ClientError::Validation("bad signature".to_string()));
        }
        Ok(())
    }

    fn handle_ok(&self, event_id: &str, accepted: bool, reason: &str) {
        let (ok, failed) = {
            let mut state = self.state.lock();
            let Some(listeners) = state.pub_listeners.get_mut(event_id) else {
                return;
            };
            listeners.acknowledged = true;
            let ok = listeners.ok.clone();
            let failed = listeners.failed.clone();
            if !listeners.monitoring {
                state.pub_listeners.remove(event_id);
            }
            (ok, failed)
        };

        if accepted {
            ok.iter().for_each(|listener| listener());
        } else {
            debug!("Relay {} rejected {}: {}", self.url, event_id, reason);
            failed.iter().for_each(|listener| listener(reason));
        }
    }

    /// `failure` is `None` when the event was seen.
    fn finish_monitor(&self, event_id: &str, failure: Option<&str>) {
        let (timer, seen, failed) = {
            let mut state = self.state.lock();
            let Some(timer) = state.monitors.remove(event_id) else {
                return;
            };
            let Some(listeners) = state.pub_listeners.get_mut(event_id) else {
                return;
            };
            listeners.monitoring = false;
            let seen = listeners.seen.clone();
            let failed = listeners.failed.clone();
            if listeners.acknowledged {
                state.pub_listeners.remove(event_id);
            }
            (timer, seen, failed)
        };

        match failure {
            None => {
                timer.abort();
                seen.iter().for_each(|listener| listener());
            }
            Some(reason) => {
                debug!("Relay {} never echoed {}: {}", self.url, event_id, reason);
                failed.iter().for_each(|listener| listener(reason));
            }
        }
    }
}

/// One subscription on one relay.
#[derive(Debug, Clone)]
pub struct RelaySubscription {
    relay: RelayConnection,
    id: String,
    skip_verification: bool,
}

impl RelaySubscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn relay(&self) -> &RelayConnection {
        &self.relay
    }

    /// Replace the filters, keeping the id and the already-delivered set.
    pub fn resub(&self, filters: Vec<Filter>) -> RelaySubscription {
        self.relay.sub(
            filters,
            SubscriptionOptions {
                id: Some(self.id.clone()),
                skip_verification: self.skip_verification,
            },
        )
    }

    /// Forget the subscription and send CLOSE if connected.
    pub fn unsub(&self) {
        self.relay.inner.unsub(&self.id);
    }

    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        if let Some(listeners) = self.relay.inner.state.lock().sub_listeners.get_mut(&self.id) {
            listeners.event.push((id, Arc::new(listener)));
        }
        id
    }

    pub fn on_eose<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        if let Some(listeners) = self.relay.inner.state.lock().sub_listeners.get_mut(&self.id) {
            listeners.eose.push((id, Arc::new(listener)));
        }
        id
    }

    pub fn off(&self, listener: ListenerId) {
        if let Some(listeners) = self.relay.inner.state.lock().sub_listeners.get_mut(&self.id) {
            listeners.event.retain(|(id, _)| *id != listener);
            listeners.eose.retain(|(id, _)| *id != listener);
        }
    }
}

/// Acknowledgement tracking for one published event on one relay.
#[derive(Debug, Clone)]
pub struct PublishHandle {
    relay: RelayConnection,
    event_id: String,
}

impl PublishHandle {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn relay_url(&self) -> &str {
        self.relay.url()
    }

    /// Relay answered `OK true`.
    pub fn on_ok<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.with_listeners(|l| l.ok.push(Arc::new(listener)));
    }

    /// Relay answered `OK false`, or the event was not seen in time.
    pub fn on_failed<F>(&self, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.with_listeners(|l| l.failed.push(Arc::new(listener)));
    }

    /// Event came back on a subscription within [`SEEN_TIMEOUT`].
    ///
    /// Registering the first seen listener starts the monitor subscription.
    pub fn on_seen<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.with_listeners(|l| l.seen.push(Arc::new(listener)));
        self.relay.start_monitoring(&self.event_id);
    }

    fn with_listeners(&self, register: impl FnOnce(&mut PubListeners)) {
        let mut state = self.relay.inner.state.lock();
        register(state.pub_listeners.entry(self.event_id.clone()).or_default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::UnsignedEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubCrypto {
        signatures_valid: bool,
    }

    impl EventCrypto for StubCrypto {
        fn sign(&self, _template: &nostr::EventTemplate, _key: &[u8; 32]) -> Result<Event> {
            Err(ClientError::Crypto("stub".to_string()))
        }
        fn verify(&self, _event: &Event) -> bool {
            self.signatures_valid
        }
        fn validate_shape(&self, event: &Event) -> bool {
            nostr::validate_event(event)
        }
        fn compute_id(&self, _event: &UnsignedEvent) -> Result<String> {
            Ok("0".repeat(64))
        }
    }

    fn relay(signatures_valid: bool) -> RelayConnection {
        RelayConnection::new(
            "ws://127.0.0.1:1",
            RelayOptions {
                transport: TransportConfig::default(),
                crypto: Arc::new(StubCrypto { signatures_valid }),
                known_event: None,
            },
        )
        .unwrap()
    }

    fn event(n: u64, kind: u16) -> Event {
        Event {
            id: format!("{n:064x}"),
            pubkey: "a".repeat(64),
            created_at: n,
            kind,
            tags: vec![],
            content: String::new(),
            sig: "b".repeat(128),
        }
    }

    fn frame(sub: &str, event: &Event) -> String {
        serde_json::json!(["EVENT", sub, event]).to_string()
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Event) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move |_: &Event| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_event_delivered_once_per_subscription() {
        let relay = relay(true);
        let sub = relay.sub(vec![Filter::new().kinds([1])], SubscriptionOptions::default());
        let (count, listener) = counter();
        sub.on_event(listener);

        let e = event(1, 1);
        relay.inner.handle_message(&frame(sub.id(), &e)).unwrap();
        relay.inner.handle_message(&frame(sub.id(), &e)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // re-subscribing with the same id keeps the delivered set
        let sub = sub.resub(vec![Filter::new().kinds([1, 2])]);
        relay.inner.handle_message(&frame(sub.id(), &e)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_subscription_and_mismatch_are_dropped() {
        let relay = relay(true);
        let sub = relay.sub(vec![Filter::new().kinds([1])], SubscriptionOptions::default());
        let (count, listener) = counter();
        sub.on_event(listener);

        relay.inner.handle_message(&frame("nope", &event(1, 1))).unwrap();
        relay.inner.handle_message(&frame(sub.id(), &event(2, 7))).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_bad_signature_dropped_unless_skipped() {
        let relay = relay(false);
        let strict = relay.sub(vec![Filter::new()], SubscriptionOptions::default());
        let lax = relay.sub(
            vec![Filter::new()],
            SubscriptionOptions {
                id: None,
                skip_verification: true,
            },
        );
        let (strict_count, strict_listener) = counter();
        let (lax_count, lax_listener) = counter();
        strict.on_event(strict_listener);
        lax.on_event(lax_listener);

        let e = event(3, 1);
        relay.inner.handle_message(&frame(strict.id(), &e)).unwrap();
        relay.inner.handle_message(&frame(lax.id(), &e)).unwrap();
        assert_eq!(strict_count.load(Ordering::SeqCst), 0);
        assert_eq!(lax_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_check_event_reports_validation_errors() {
        let strict = relay(false);
        let e = event(4, 1);
        assert_eq!(
            strict.inner.check_event(&e, false),
            Err(ClientError::Validation("bad signature".to_string()))
        );
        assert_eq!(strict.inner.check_event(&e, true), Ok(()));

        let mut malformed = event(5, 1);
        malformed.sig = "zz".to_string();
        assert_eq!(
            relay(true).inner.check_event(&malformed, true),
            Err(ClientError::Validation("badly shaped event".to_string()))
        );
    }

    #[test]
    fn test_known_events_skip_verification() {
        let relay = RelayConnection::new(
            "ws://127.0.0.1:1",
            RelayOptions {
                transport: TransportConfig::default(),
                crypto: Arc::new(StubCrypto {
                    signatures_valid: false,
                }),
                known_event: Some(Arc::new(|id: &str| id == format!("{:064x}", 9))),
            },
        )
        .unwrap();
        let sub = relay.sub(vec![Filter::new()], SubscriptionOptions::default());
        let (count, listener) = counter();
        sub.on_event(listener);

        relay.inner.handle_message(&frame(sub.id(), &event(9, 1))).unwrap();
        relay.inner.handle_message(&frame(sub.id(), &event(10, 1))).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_badly_shaped_event_is_silently_dropped() {
        let relay = relay(true);
        let errors = Arc::new(AtomicUsize::new(0));
        let e2 = errors.clone();
        relay.on(RelayEventKind::Error, move |_| {
            e2.fetch_add(1, Ordering::SeqCst);
        });
        let sub = relay.sub(vec![Filter::new()], SubscriptionOptions::default());
        let (count, listener) = counter();
        sub.on_event(listener);

        let mut bad = event(4, 1);
        bad.sig = "short".to_string();
        relay.inner.handle_message(&frame(sub.id(), &bad)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_malformed_frame_emits_error() {
        let relay = relay(true);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        relay.on(RelayEventKind::Error, move |event| {
            if let RelayEvent::Error(text) = event {
                sink.lock().push(text.clone());
            }
        });

        assert!(relay.inner.handle_message("{not json").is_err());
        assert!(relay.inner.handle_message(r#"["UNKNOWN", 1]"#).is_ok());
        assert_eq!(errors.lock().len(), 1);
    }

    #[test]
    fn test_eose_notice_and_auth() {
        let relay = relay(true);
        let sub = relay.sub(vec![Filter::new()], SubscriptionOptions::default());
        let eose = Arc::new(AtomicUsize::new(0));
        let e = eose.clone();
        sub.on_eose(move || {
            e.fetch_add(1, Ordering::SeqCst);
        });

        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in [RelayEventKind::Notice, RelayEventKind::Auth] {
            let sink = events.clone();
            relay.on(kind, move |event| sink.lock().push(event.clone()));
        }

        relay
            .inner
            .handle_message(&format!(r#"["EOSE","{}"]"#, sub.id()))
            .unwrap();
        relay.inner.handle_message(r#"["NOTICE","hello"]"#).unwrap();
        relay.inner.handle_message(r#"["AUTH","challenge"]"#).unwrap();

        assert_eq!(eose.load(Ordering::SeqCst), 1);
        assert_eq!(
            *events.lock(),
            vec![
                RelayEvent::Notice("hello".to_string()),
                RelayEvent::Auth("challenge".to_string())
            ]
        );
    }

    #[test]
    fn test_ok_routes_to_ok_or_failed() {
        let relay = relay(true);
        let accepted = relay.publish(&event(5, 1)).unwrap();
        let rejected = relay.publish(&event(6, 1)).unwrap();

        let oks = Arc::new(AtomicUsize::new(0));
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let o = oks.clone();
        accepted.on_ok(move || {
            o.fetch_add(1, Ordering::SeqCst);
        });
        let r = reasons.clone();
        rejected.on_failed(move |reason| r.lock().push(reason.to_string()));

        relay
            .inner
            .handle_message(&format!(r#"["OK","{}",true,""]"#, accepted.event_id()))
            .unwrap();
        relay
            .inner
            .handle_message(&format!(r#"["OK","{}",false,"blocked"]"#, rejected.event_id()))
            .unwrap();

        assert_eq!(oks.load(Ordering::SeqCst), 1);
        assert_eq!(*reasons.lock(), vec!["blocked".to_string()]);
    }

    #[test]
    fn test_publish_without_id_fails_immediately() {
        let relay = relay(true);
        let mut e = event(7, 1);
        e.id.clear();
        assert!(matches!(relay.publish(&e), Err(ClientError::InvalidEvent(_))));
        assert_eq!(relay.queued_frames(), 0);
    }

    #[test]
    fn test_disconnected_publish_is_queued_and_sub_is_registered() {
        let relay = relay(true);
        relay.publish(&event(8, 1)).unwrap();
        relay.auth(&event(9, 22242)).unwrap();
        let sub = relay.sub(vec![Filter::new()], SubscriptionOptions::default());

        assert_eq!(relay.queued_frames(), 2);
        assert_eq!(relay.open_subscription_ids(), vec![sub.id().to_string()]);

        sub.unsub();
        assert!(relay.open_subscription_ids().is_empty());
    }

    #[tokio::test]
    async fn test_seen_fires_when_monitor_receives_event() {
        let relay = relay(true);
        let published = event(11, 1);
        let handle = relay.publish(&published).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        handle.on_seen(move || {
            s.fetch_add(1, Ordering::SeqCst);
        });

        let monitor_id = monitor_subscription_id(&published.id);
        assert!(relay.open_subscription_ids().contains(&monitor_id));

        relay.inner.handle_message(&frame(&monitor_id, &published)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!relay.open_subscription_ids().contains(&monitor_id));
    }

    #[tokio::test]
    async fn test_monitor_listener_and_deadline_exist_before_req() {
        let relay = relay(true);
        let published = event(13, 1);
        let handle = relay.publish(&published).unwrap();
        handle.on_seen(|| {});

        let monitor_id = monitor_subscription_id(&published.id);
        let state = relay.inner.state.lock();
        assert!(state.open_subs.contains_key(&monitor_id));
        assert_eq!(state.sub_listeners[&monitor_id].event.len(), 1);
        assert!(state.monitors.contains_key(&published.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_after_seen_deadline() {
        let relay = relay(true);
        let handle = relay.publish(&event(12, 1)).unwrap();

        let reasons = Arc::new(Mutex::new(Vec::new()));
        let r = reasons.clone();
        handle.on_failed(move |reason| r.lock().push(reason.to_string()));
        handle.on_seen(|| panic!("event was never echoed"));

        tokio::time::sleep(SEEN_TIMEOUT + Duration::from_millis(10)).await;

        assert_eq!(*reasons.lock(), vec!["event not seen after 5 seconds".to_string()]);
        assert!(relay.open_subscription_ids().is_empty());
    }
}
