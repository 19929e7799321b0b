//! In-process relay for integration tests.
//!
//! Speaks enough NIP-01 for the pool: stored events are answered on REQ
//! followed by EOSE, published events are acknowledged with OK and pushed
//! to every live subscription that matches them.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use nostr::{Event, EventTemplate, finalize_event, generate_secret_key, get_public_key_hex};
use nostr_relaypool::{Filter, matches_any};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

static INIT: Once = Once::new();
static NEXT_PORT: AtomicU16 = AtomicU16::new(17000);

/// Install a fmt subscriber once per test binary; `RUST_LOG` overrides `warn`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

pub fn next_test_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

pub fn test_relay_url(port: u16) -> String {
    format!("ws://127.0.0.1:{port}")
}

#[derive(Default)]
struct RelayState {
    events: Mutex<Vec<Event>>,
    requests: Mutex<Vec<(String, Vec<Filter>)>>,
    auth_events: Mutex<Vec<Event>>,
    connections: AtomicUsize,
    challenge: Option<String>,
}

pub struct MockRelay {
    pub url: String,
    state: Arc<RelayState>,
    live: broadcast::Sender<Event>,
    kick: broadcast::Sender<()>,
    server: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start() -> Self {
        Self::start_with(None).await
    }

    /// A relay that sends `["AUTH", challenge]` to every new connection.
    pub async fn with_challenge(challenge: &str) -> Self {
        Self::start_with(Some(challenge.to_string())).await
    }

    async fn start_with(challenge: Option<String>) -> Self {
        for _ in 0..100 {
            if let Some(relay) = Self::bind(next_test_port(), challenge.clone()).await {
                return relay;
            }
        }
        panic!("no free port for the mock relay");
    }

    /// Listen on `port`; panics if it is taken.
    pub async fn start_on(port: u16) -> Self {
        Self::bind(port, None)
            .await
            .unwrap_or_else(|| panic!("port {port} is taken"))
    }

    async fn bind(port: u16, challenge: Option<String>) -> Option<Self> {
        init_tracing();
        let listener = TcpListener::bind(("127.0.0.1", port)).await.ok()?;
        let state = Arc::new(RelayState {
            challenge,
            ..Default::default()
        });
        let (live, _) = broadcast::channel(256);
        let (kick, _) = broadcast::channel(4);

        let server = {
            let state = state.clone();
            let live = live.clone();
            let kick = kick.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let kicked = kick.subscribe();
                    tokio::spawn(serve(stream, state.clone(), live.clone(), kicked));
                }
            })
        };

        Some(Self {
            url: test_relay_url(port),
            state,
            live,
            kick,
            server,
        })
    }

    pub fn store(&self, event: Event) {
        self.state.events.lock().push(event);
    }

    /// Every REQ received so far, in order.
    pub fn requests(&self) -> Vec<(String, Vec<Filter>)> {
        self.state.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().len()
    }

    pub fn stored(&self) -> Vec<Event> {
        self.state.events.lock().clone()
    }

    pub fn auth_events(&self) -> Vec<Event> {
        self.state.auth_events.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Push `event` to live subscriptions without storing it.
    pub fn broadcast(&self, event: Event) {
        let _ = self.live.send(event);
    }

    /// Drop every live connection without a close handshake; the listener stays up.
    pub fn drop_connections(&self) {
        let _ = self.kick.send(());
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve(
    stream: TcpStream,
    state: Arc<RelayState>,
    live: broadcast::Sender<Event>,
    mut kicked: broadcast::Receiver<()>,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::text(frame.to_string())).await.is_err() {
                break;
            }
        }
    });

    if let Some(challenge) = &state.challenge {
        let _ = tx.send(json!(["AUTH", challenge]));
    }

    let subs: Arc<Mutex<HashMap<String, Vec<Filter>>>> = Arc::default();
    let pusher = {
        let subs = subs.clone();
        let tx = tx.clone();
        let mut events = live.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let targets: Vec<String> = subs
                    .lock()
                    .iter()
                    .filter(|(_, filters)| matches_any(filters, &event))
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in targets {
                    let _ = tx.send(json!(["EVENT", id, event]));
                }
            }
        })
    };

    loop {
        let message = tokio::select! {
            message = source.next() => match message {
                Some(Ok(message)) => message,
                _ => break,
            },
            _ = kicked.recv() => break,
        };
        let Ok(text) = message.to_text() else {
            continue;
        };
        let Ok(Value::Array(frame)) = serde_json::from_str::<Value>(text) else {
            continue;
        };
        match frame.first().and_then(Value::as_str) {
            Some("REQ") => {
                let id = frame[1].as_str().unwrap_or_default().to_string();
                let filters: Vec<Filter> = frame[2..]
                    .iter()
                    .filter_map(|f| serde_json::from_value(f.clone()).ok())
                    .collect();
                state.requests.lock().push((id.clone(), filters.clone()));

                let stored: Vec<Event> = state
                    .events
                    .lock()
                    .iter()
                    .filter(|event| matches_any(&filters, event))
                    .cloned()
                    .collect();
                for event in stored {
                    let _ = tx.send(json!(["EVENT", id, event]));
                }
                let _ = tx.send(json!(["EOSE", id]));
                subs.lock().insert(id, filters);
            }
            Some("CLOSE") => {
                if let Some(id) = frame[1].as_str() {
                    subs.lock().remove(id);
                }
            }
            Some("EVENT") => {
                let Ok(event) = serde_json::from_value::<Event>(frame[1].clone()) else {
                    continue;
                };
                state.events.lock().push(event.clone());
                let _ = tx.send(json!(["OK", event.id, true, ""]));
                let _ = live.send(event);
            }
            Some("AUTH") => {
                let Ok(event) = serde_json::from_value::<Event>(frame[1].clone()) else {
                    continue;
                };
                let _ = tx.send(json!(["OK", event.id, true, ""]));
                state.auth_events.lock().push(event);
            }
            _ => {}
        }
    }

    pusher.abort();
    writer.abort();
}

/// Signed event from a fresh key.
pub fn signed_event(kind: u16, tags: Vec<Vec<String>>, content: &str) -> Event {
    signed_event_with_key(&generate_secret_key(), kind, tags, content)
}

pub fn signed_event_with_key(
    secret_key: &[u8; 32],
    kind: u16,
    tags: Vec<Vec<String>>,
    content: &str,
) -> Event {
    finalize_event(&EventTemplate::now(kind, tags, content), secret_key).unwrap()
}

pub fn pubkey_of(secret_key: &[u8; 32]) -> String {
    get_public_key_hex(secret_key).unwrap()
}

/// Poll `condition` every 10ms until it holds; panics after `timeout`.
pub async fn wait_until<F>(timeout: Duration, condition: F)
where
    F: Fn() -> bool,
{
    let polling = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    if tokio::time::timeout(timeout, polling).await.is_err() {
        panic!("condition not met within {timeout:?}");
    }
}

/// `future` or panic after five seconds.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}
