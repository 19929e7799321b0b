//! Relay pool against in-process relays

mod support;

use async_trait::async_trait;
use nostr::{Event, KIND_CONTACTS, generate_secret_key, verify_event};
use nostr_relaypool::{
    ClientError, Filter, LnurlClient, PoolConfig, RelayPool, Result, Secp256k1Crypto,
    SubscribeOptions,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use support::*;

type Received = Arc<Mutex<Vec<(Event, Option<String>, bool)>>>;

fn urls(relays: &[&MockRelay]) -> Vec<String> {
    relays.iter().map(|r| r.url.clone()).collect()
}

fn config_for(relays: &[&MockRelay]) -> PoolConfig {
    PoolConfig::default()
        .with_default_relays(urls(relays))
        .with_discovery_relays(urls(relays))
}

/// Pool with every relay already connected, so REQs go out immediately.
async fn connected_pool(config: PoolConfig, relays: &[&MockRelay]) -> RelayPool {
    let pool = RelayPool::new(config);
    for relay in relays {
        pool.add_or_get_relay(&relay.url).unwrap();
    }
    for (url, result) in pool.connect_all().await {
        result.unwrap_or_else(|e| panic!("connect to {url}: {e}"));
    }
    pool
}

fn collect(
    pool: &RelayPool,
    filters: Vec<Filter>,
    relays: Option<&[String]>,
    options: SubscribeOptions,
) -> Received {
    let received: Received = Arc::default();
    let sink = received.clone();
    pool.subscribe(
        filters,
        relays,
        move |event, meta| {
            sink.lock().push((
                event.clone(),
                meta.relay_url.map(str::to_string),
                meta.after_eose,
            ))
        },
        options,
    );
    received
}

fn eose_recorder() -> (Arc<Mutex<Vec<String>>>, SubscribeOptions) {
    let eoses: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = eoses.clone();
    let options = SubscribeOptions {
        on_eose: Some(Arc::new(move |relay: &str, _: Option<u64>| {
            sink.lock().push(relay.to_string())
        })),
        ..Default::default()
    };
    (eoses, options)
}

#[tokio::test]
async fn test_event_on_two_relays_is_delivered_once() {
    let a = MockRelay::start().await;
    let b = MockRelay::start().await;
    let note = signed_event(1, vec![], "hello from both");
    a.store(note.clone());
    b.store(note.clone());

    let pool = connected_pool(config_for(&[&a, &b]), &[&a, &b]).await;
    let (eoses, options) = eose_recorder();
    let received = collect(&pool, vec![Filter::new().kinds([1])], Some(urls(&[&a, &b]).as_slice()), options);

    wait_until(Duration::from_secs(5), || eoses.lock().len() == 2).await;

    let received = received.lock();
    assert_eq!(received.len(), 1);
    let (event, relay_url, after_eose) = &received[0];
    assert_eq!(event.id, note.id);
    assert!(urls(&[&a, &b]).contains(relay_url.as_ref().unwrap()));
    assert!(!after_eose);

    let mut eoses = eoses.lock().clone();
    eoses.sort();
    let mut expected = urls(&[&a, &b]);
    expected.sort();
    assert_eq!(eoses, expected);
}

#[tokio::test]
async fn test_live_event_after_eose_is_delivered_once() {
    let a = MockRelay::start().await;
    let b = MockRelay::start().await;
    let relays = urls(&[&a, &b]);
    let pool = connected_pool(config_for(&[&a, &b]), &[&a, &b]).await;

    let (eoses, options) = eose_recorder();
    let received = collect(&pool, vec![Filter::new().kinds([1])], Some(&relays), options);
    wait_until(Duration::from_secs(5), || eoses.lock().len() == 2).await;

    let note = signed_event(1, vec![], "live");
    pool.publish(&note, &relays).unwrap();

    wait_until(Duration::from_secs(5), || {
        a.stored().len() == 1 && b.stored().len() == 1
    })
    .await;
    wait_until(Duration::from_secs(5), || !received.lock().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0.id, note.id);
    assert!(received[0].2);
}

#[tokio::test]
async fn test_publish_is_acknowledged_and_seen() {
    let relay = MockRelay::start().await;
    let pool = connected_pool(config_for(&[&relay]), &[&relay]).await;

    let note = signed_event(1, vec![], "ack me");
    let handles = pool.publish(&note, &[relay.url.clone()]).unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].relay_url(), relay.url);

    let ok = Arc::new(AtomicBool::new(false));
    let seen = Arc::new(AtomicBool::new(false));
    let failed = Arc::new(AtomicBool::new(false));
    {
        let ok = ok.clone();
        handles[0].on_ok(move || ok.store(true, Ordering::SeqCst));
        let seen = seen.clone();
        handles[0].on_seen(move || seen.store(true, Ordering::SeqCst));
        let failed = failed.clone();
        handles[0].on_failed(move |_| failed.store(true, Ordering::SeqCst));
    }

    wait_until(Duration::from_secs(5), || {
        ok.load(Ordering::SeqCst) && seen.load(Ordering::SeqCst)
    })
    .await;
    assert!(!failed.load(Ordering::SeqCst));
    assert_eq!(relay.stored(), vec![note]);
}

#[tokio::test]
async fn test_concurrent_metadata_lookups_share_one_request() {
    let a = MockRelay::start().await;
    let b = MockRelay::start().await;
    let key = generate_secret_key();
    let pubkey = pubkey_of(&key);
    let profile = signed_event_with_key(&key, 0, vec![], r#"{"name":"alice"}"#);
    a.store(profile.clone());
    b.store(profile.clone());

    let pool = connected_pool(config_for(&[&a, &b]), &[&a, &b]).await;
    let cache = pool.metadata_cache();
    let (first, second) = within(async { tokio::join!(cache.get(&pubkey), cache.get(&pubkey)) }).await;
    assert_eq!(first.unwrap(), profile);
    assert_eq!(second.unwrap(), profile);

    wait_until(Duration::from_secs(5), || {
        a.request_count() == 1 && b.request_count() == 1
    })
    .await;

    let again = pool.fetch_and_cache_metadata(&pubkey).await.unwrap();
    assert_eq!(again, profile);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.request_count(), 1);
    assert_eq!(b.request_count(), 1);
}

#[tokio::test]
async fn test_missing_contact_list_is_exhausted() {
    let a = MockRelay::start().await;
    let b = MockRelay::start().await;
    let pool = connected_pool(config_for(&[&a, &b]), &[&a, &b]).await;
    let pubkey = pubkey_of(&generate_secret_key());

    let err = within(pool.fetch_and_cache_contact_list(&pubkey))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ClientError::Exhausted {
            pubkey: pubkey.clone(),
            kind: KIND_CONTACTS,
            relays: urls(&[&a, &b]),
        }
    );
    assert_eq!(
        err.to_string(),
        format!("Can't find data for {pubkey} with kind 3 on relays {},{}", a.url, b.url)
    );
}

#[tokio::test]
async fn test_get_event_by_id_uses_cache_second_time() {
    let relay = MockRelay::start().await;
    let note = signed_event(1, vec![], "by id");
    relay.store(note.clone());
    let pool = connected_pool(config_for(&[&relay]), &[&relay]).await;
    let relays = vec![relay.url.clone()];

    let found = within(pool.get_event_by_id(&note.id, &relays, None)).await;
    assert_eq!(found.unwrap(), Some(note.clone()));
    assert_eq!(relay.request_count(), 1);

    let again = within(pool.get_event_by_id(&note.id, &relays, None)).await;
    assert_eq!(again.unwrap(), Some(note.clone()));
    assert_eq!(relay.request_count(), 1);
    assert_eq!(pool.cached_event(&note.id), Some(note));
}

#[tokio::test]
async fn test_get_event_by_id_missing_is_none() {
    let relay = MockRelay::start().await;
    let pool = connected_pool(config_for(&[&relay]), &[&relay]).await;

    let found = within(pool.get_event_by_id(&"a".repeat(64), &[relay.url.clone()], None)).await;
    assert_eq!(found.unwrap(), None);
}

#[tokio::test]
async fn test_auth_challenge_and_answer() {
    let relay = MockRelay::with_challenge("challenge-123").await;
    let pool = RelayPool::new(config_for(&[&relay]));

    let challenges: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
    {
        let challenges = challenges.clone();
        pool.on_auth(move |relay_url, challenge| {
            challenges
                .lock()
                .push((relay_url.to_string(), challenge.to_string()))
        });
    }
    pool.add_or_get_relay(&relay.url).unwrap();
    pool.connect_all().await;

    wait_until(Duration::from_secs(5), || !challenges.lock().is_empty()).await;
    assert_eq!(
        challenges.lock()[0],
        (relay.url.clone(), "challenge-123".to_string())
    );

    let key = generate_secret_key();
    let handle = pool.authenticate(&relay.url, "challenge-123", &key).unwrap();
    let ok = Arc::new(AtomicBool::new(false));
    {
        let ok = ok.clone();
        handle.on_ok(move || ok.store(true, Ordering::SeqCst));
    }
    wait_until(Duration::from_secs(5), || ok.load(Ordering::SeqCst)).await;

    let auth = relay.auth_events();
    assert_eq!(auth.len(), 1);
    assert_eq!(auth[0].kind, 22242);
    assert_eq!(auth[0].pubkey, pubkey_of(&key));
    assert_eq!(auth[0].tag_values("relay").collect::<Vec<_>>(), vec![relay.url.as_str()]);
    assert_eq!(auth[0].tag_values("challenge").collect::<Vec<_>>(), vec!["challenge-123"]);
    assert!(verify_event(&auth[0]).unwrap());
}

#[tokio::test]
async fn test_search_sends_search_filter() {
    let relay = MockRelay::start().await;
    let note = signed_event(1, vec![], "rust async runtimes");
    relay.store(note.clone());
    let pool = connected_pool(config_for(&[&relay]), &[&relay]).await;

    let received: Received = Arc::default();
    {
        let sink = received.clone();
        pool.search(
            "rust",
            &[relay.url.clone()],
            move |event, meta| {
                sink.lock()
                    .push((event.clone(), meta.relay_url.map(str::to_string), meta.after_eose))
            },
            None,
        );
    }

    wait_until(Duration::from_secs(5), || !received.lock().is_empty()).await;
    assert_eq!(received.lock()[0].0, note);
    let requests = relay.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1, vec![Filter::new().search("rust")]);
}

#[tokio::test]
async fn test_coalesced_subscriptions_share_one_request() {
    let relay = MockRelay::start().await;
    let note = signed_event(1, vec![], "note");
    let reaction = signed_event(7, vec![vec!["e".to_string(), note.id.clone()]], "+");
    relay.store(note.clone());
    relay.store(reaction.clone());
    let pool = connected_pool(config_for(&[&relay]), &[&relay]).await;
    let relays = vec![relay.url.clone()];

    let options = SubscribeOptions {
        max_delay: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let notes = collect(&pool, vec![Filter::new().kinds([1])], Some(&relays), options.clone());
    let reactions = collect(&pool, vec![Filter::new().kinds([7])], Some(&relays), options);

    wait_until(Duration::from_secs(5), || {
        !notes.lock().is_empty() && !reactions.lock().is_empty()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(notes.lock().len(), 1);
    assert_eq!(notes.lock()[0].0, note);
    assert_eq!(reactions.lock().len(), 1);
    assert_eq!(reactions.lock()[0].0, reaction);

    let requests = relay.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].1,
        vec![Filter::new().kinds([1]), Filter::new().kinds([7])]
    );
}

#[tokio::test]
async fn test_cached_events_answer_later_subscriptions() {
    let relay = MockRelay::start().await;
    let key = generate_secret_key();
    let note = signed_event_with_key(&key, 1, vec![], "cache me");
    relay.store(note.clone());
    let pool = connected_pool(config_for(&[&relay]), &[&relay]).await;
    let relays = vec![relay.url.clone()];

    let first = collect(&pool, vec![Filter::new().ids([note.id.clone()])], Some(&relays), SubscribeOptions::default());
    wait_until(Duration::from_secs(5), || !first.lock().is_empty()).await;

    let second = collect(&pool, vec![Filter::new().ids([note.id.clone()])], Some(&relays), SubscribeOptions::default());
    let second = second.lock();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].0, note);
    assert_eq!(second[0].1, None);
    assert_eq!(relay.request_count(), 1);
}

#[tokio::test]
async fn test_authors_are_routed_to_discovered_write_relays() {
    let discovery = MockRelay::start().await;
    let write = MockRelay::start().await;
    let key = generate_secret_key();
    let author = pubkey_of(&key);

    discovery.store(signed_event_with_key(
        &key,
        10002,
        vec![vec!["r".to_string(), write.url.clone()]],
        "",
    ));
    let note = signed_event_with_key(&key, 1, vec![], "from my write relay");
    write.store(note.clone());

    let pool = RelayPool::new(config_for(&[&discovery]));
    let received = collect(
        &pool,
        vec![Filter::new().authors([author.clone()]).kinds([1])],
        None,
        SubscribeOptions::default(),
    );

    wait_until(Duration::from_secs(5), || !received.lock().is_empty()).await;
    let received = received.lock();
    assert_eq!(received[0].0, note);
    assert_eq!(received[0].1.as_deref(), Some(write.url.as_str()));
    assert_eq!(pool.write_relays_for_pubkey(&author), Some(vec![write.url.clone()]));
}

#[tokio::test]
async fn test_referenced_events_are_fetched() {
    let relay = MockRelay::start().await;
    let root = signed_event(1, vec![], "root");
    relay.store(root.clone());
    let reply = signed_event(1, vec![vec!["e".to_string(), root.id.clone()]], "reply");
    let pool = connected_pool(config_for(&[&relay]), &[&relay]).await;

    let received: Received = Arc::default();
    let sink = received.clone();
    let subscription = pool.subscribe_referenced_events(
        &reply,
        move |event, meta| {
            sink.lock()
                .push((event.clone(), meta.relay_url.map(str::to_string), meta.after_eose))
        },
        None,
    );
    assert!(subscription.is_some());

    wait_until(Duration::from_secs(5), || !received.lock().is_empty()).await;
    assert_eq!(received.lock()[0].0, root);
}

#[tokio::test]
async fn test_subscription_is_replayed_after_reconnect() {
    let port = next_test_port();
    let url = test_relay_url(port);
    let mut config = PoolConfig::default()
        .with_default_relays([url.clone()])
        .with_discovery_relays([url.clone()]);
    config.transport.auto_reconnect = true;
    config.transport.min_reconnect_delay = Duration::from_millis(50);
    let pool = RelayPool::new(config);

    let received = collect(&pool, vec![Filter::new().kinds([1])], Some(std::slice::from_ref(&url)), SubscribeOptions::default());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(received.lock().is_empty());

    let relay = MockRelay::start_on(port).await;
    let note = signed_event(1, vec![], "late relay");
    relay.store(note.clone());

    wait_until(Duration::from_secs(5), || !received.lock().is_empty()).await;
    assert_eq!(received.lock()[0].0, note);
    pool.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent_and_final() {
    let relay = MockRelay::start().await;
    let pool = connected_pool(config_for(&[&relay]), &[&relay]).await;

    pool.close().await;
    pool.close().await;

    assert!(pool.is_closed());
    assert!(pool.relay_statuses().is_empty());
    assert_eq!(pool.add_or_get_relay(&relay.url).unwrap_err(), ClientError::Closed);
    assert_eq!(
        pool.get_event_by_id(&"a".repeat(64), &[relay.url.clone()], None)
            .await
            .unwrap_err(),
        ClientError::Closed
    );
}

/// Canned LNURL responses by url.
struct StubLnurl(HashMap<String, Value>);

#[async_trait]
impl LnurlClient for StubLnurl {
    async fn get_json(&self, url: &str, _query: &[(&str, String)]) -> Result<Value> {
        self.0
            .get(url)
            .cloned()
            .ok_or_else(|| ClientError::Http(format!("{url} returned 404 Not Found")))
    }
}

fn zap_pool(config: PoolConfig) -> RelayPool {
    let responses = HashMap::from([
        (
            "https://example.com/.well-known/lnurlp/alice".to_string(),
            json!({
                "callback": "https://example.com/callback",
                "allowsNostr": true,
                "nostrPubkey": "4".repeat(64),
                "minSendable": 1000,
                "maxSendable": 100_000_000,
            }),
        ),
        (
            "https://example.com/callback".to_string(),
            json!({ "pr": "lnbc210n1invoice" }),
        ),
    ]);
    RelayPool::with_collaborators(config, Arc::new(Secp256k1Crypto), Arc::new(StubLnurl(responses)))
}

#[tokio::test]
async fn test_zap_signs_request_and_returns_invoice() {
    let relay = MockRelay::start().await;
    let pool = zap_pool(config_for(&[&relay]));

    let recipient_key = generate_secret_key();
    let recipient = pubkey_of(&recipient_key);
    pool.set_cached_metadata(
        &recipient,
        signed_event_with_key(&recipient_key, 0, vec![], r#"{"lud16":"alice@example.com"}"#),
    );

    let sender_key = generate_secret_key();
    let zap = pool.zap(&sender_key, &recipient, 21, "gm").await.unwrap();

    assert_eq!(zap.invoice, "lnbc210n1invoice");
    let request = &zap.zap_request_event;
    assert_eq!(request.kind, 9734);
    assert_eq!(request.pubkey, pubkey_of(&sender_key));
    assert_eq!(request.content, "gm");
    assert_eq!(request.tag_values("p").collect::<Vec<_>>(), vec![recipient.as_str()]);
    assert_eq!(request.tag_values("amount").collect::<Vec<_>>(), vec!["21000"]);
    assert!(verify_event(request).unwrap());
    assert!(pool.relay_statuses().is_empty());
}

#[tokio::test]
async fn test_zap_auto_publish_sends_request_to_default_relays() {
    let relay = MockRelay::start().await;
    let mut config = config_for(&[&relay]);
    config.zap_auto_publish = true;
    let pool = zap_pool(config);

    let recipient_key = generate_secret_key();
    let recipient = pubkey_of(&recipient_key);
    pool.set_cached_metadata(
        &recipient,
        signed_event_with_key(&recipient_key, 0, vec![], r#"{"lud16":"alice@example.com"}"#),
    );

    let zap = pool.zap(&generate_secret_key(), &recipient, 21, "").await.unwrap();
    wait_until(Duration::from_secs(5), || relay.stored().len() == 1).await;
    assert_eq!(relay.stored()[0], zap.zap_request_event);
}
