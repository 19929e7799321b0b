//! One WebSocket to one relay url.
//!
//! Owns the socket, the reader and writer tasks, and the reconnect policy.
//! Outbound frames are not buffered here: `send` fails with `NotConnected`
//! unless the socket is open, and the caller decides whether to queue.

use crate::error::{ClientError, Result};
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Socket state, numbered like the browser WebSocket `readyState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

/// Receives socket lifecycle callbacks. Called from the transport's tasks.
pub trait TransportHandler: Send + Sync {
    fn on_open(&self);
    fn on_message(&self, payload: String);
    fn on_error(&self, error: &ClientError);
    /// `intentional` is true when the close was requested through `close()`.
    fn on_close(&self, intentional: bool);
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Reconnect after a close we did not ask for
    pub auto_reconnect: bool,
    pub connect_timeout: Duration,
    /// Floor for the first and every later reconnect delay
    pub min_reconnect_delay: Duration,
    pub backoff_factor: u32,
    /// Upper bound for the reconnect delay; `None` grows without limit
    pub max_reconnect_delay: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            connect_timeout: Duration::from_secs(10),
            min_reconnect_delay: Duration::from_millis(2000),
            backoff_factor: 3,
            max_reconnect_delay: Some(Duration::from_secs(300)),
        }
    }
}

/// Delay before the next reconnect: `max(min, previous * factor)`, capped.
pub fn next_reconnect_delay(previous: Duration, config: &TransportConfig) -> Duration {
    let grown = previous
        .saturating_mul(config.backoff_factor)
        .max(config.min_reconnect_delay);
    match config.max_reconnect_delay {
        Some(cap) => grown.min(cap),
        None => grown,
    }
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<()>>>;

struct TransportState {
    ready: ReadyState,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    connecting: Option<ConnectAttempt>,
    closed_by_client: bool,
    reconnect_delay: Duration,
    reconnect_timer: Option<JoinHandle<()>>,
    close_waiters: Vec<oneshot::Sender<()>>,
    /// Bumped on every successful open so a stale reader cannot close a newer socket.
    generation: u64,
}

struct TransportInner {
    url: String,
    config: TransportConfig,
    handler: Arc<dyn TransportHandler>,
    state: Mutex<TransportState>,
}

/// Cheap to clone; clones share the socket.
#[derive(Clone)]
pub struct TransportConnection {
    inner: Arc<TransportInner>,
}

impl TransportConnection {
    pub fn new(
        url: &str,
        config: TransportConfig,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Self> {
        let parsed = Url::parse(url)?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed.scheme()
            )));
        }

        Ok(Self {
            inner: Arc::new(TransportInner {
                url: url.to_string(),
                config,
                handler,
                state: Mutex::new(TransportState {
                    ready: ReadyState::Closed,
                    outbound: None,
                    connecting: None,
                    closed_by_client: false,
                    reconnect_delay: Duration::ZERO,
                    reconnect_timer: None,
                    close_waiters: Vec::new(),
                    generation: 0,
                }),
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn ready_state(&self) -> ReadyState {
        self.inner.state.lock().ready
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Delay the next reconnect will wait, zero after a successful open.
    pub fn reconnect_delay(&self) -> Duration {
        self.inner.state.lock().reconnect_delay
    }

    /// Open the socket. Concurrent callers share one attempt.
    pub async fn connect(&self) -> Result<()> {
        let attempt = {
            let mut state = self.inner.state.lock();
            if state.ready == ReadyState::Open {
                return Ok(());
            }
            match &state.connecting {
                Some(attempt) => attempt.clone(),
                None => {
                    state.closed_by_client = false;
                    let attempt = self.inner.clone().open().boxed().shared();
                    state.connecting = Some(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Write a text frame. Fails unless the socket is open.
    pub fn send(&self, payload: String) -> Result<()> {
        let state = self.inner.state.lock();
        match (state.ready, &state.outbound) {
            (ReadyState::Open, Some(outbound)) => outbound
                .send(Message::Text(payload.into()))
                .map_err(|_| ClientError::NotConnected),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Close on purpose: cancels any pending reconnect and resolves once the
    /// socket is closed. Repeated calls wait on the same close.
    pub async fn close(&self) {
        let waiter = {
            let mut state = self.inner.state.lock();
            state.closed_by_client = true;
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
            match state.ready {
                ReadyState::Closed => return,
                ReadyState::Open => {
                    if let Some(outbound) = &state.outbound {
                        let _ = outbound.send(Message::Close(None));
                    }
                    state.ready = ReadyState::Closing;
                }
                // an in-flight open notices `closed_by_client` and closes itself
                ReadyState::Connecting | ReadyState::Closing => {}
            }
            let (tx, rx) = oneshot::channel();
            state.close_waiters.push(tx);
            rx
        };
        let _ = waiter.await;
    }
}

impl TransportInner {
    async fn open(self: Arc<Self>) -> Result<()> {
        self.state.lock().ready = ReadyState::Connecting;
        info!("Connecting to relay: {}", self.url);

        let stream = match timeout(self.config.connect_timeout, connect_async(self.url.as_str()))
            .await
        {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => return Err(self.connect_failed(ClientError::Transport(e.to_string()))),
            Err(_) => {
                return Err(self.connect_failed(ClientError::Timeout(format!(
                    "Connection timeout after {:?}",
                    self.config.connect_timeout
                ))));
            }
        };

        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let (generation, close_now) = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.ready = ReadyState::Open;
            state.outbound = Some(outbound.clone());
            state.connecting = None;
            state.reconnect_delay = Duration::ZERO;
            (state.generation, state.closed_by_client)
        };

        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    warn!("Failed to write to {}: {}", url, e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        info!("Connected to relay: {}", self.url);
        self.handler.on_open();

        let inner = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => inner.handler.on_message(text.as_str().to_string()),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => inner.handler.on_message(text),
                        Err(_) => debug!("Dropping non-UTF-8 binary frame from {}", inner.url),
                    },
                    Ok(Message::Close(frame)) => {
                        debug!("Relay {} sent close: {:?}", inner.url, frame);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error from {}: {}", inner.url, e);
                        inner
                            .handler
                            .on_error(&ClientError::Transport(e.to_string()));
                        break;
                    }
                }
            }
            inner.handle_close(generation);
        });

        if close_now {
            let mut state = self.state.lock();
            if state.ready == ReadyState::Open {
                let _ = outbound.send(Message::Close(None));
                state.ready = ReadyState::Closing;
            }
        }

        Ok(())
    }

    fn connect_failed(self: &Arc<Self>, error: ClientError) -> ClientError {
        warn!("Failed to connect to {}: {}", self.url, error);
        let (reconnect, waiters) = {
            let mut state = self.state.lock();
            state.ready = ReadyState::Closed;
            state.connecting = None;
            (
                self.config.auto_reconnect && !state.closed_by_client,
                std::mem::take(&mut state.close_waiters),
            )
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }
        self.handler.on_error(&error);
        if reconnect {
            self.schedule_reconnect();
        }
        error
    }

    fn handle_close(self: &Arc<Self>, generation: u64) {
        let (intentional, waiters) = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.ready = ReadyState::Closed;
            state.outbound = None;
            (
                std::mem::take(&mut state.closed_by_client),
                std::mem::take(&mut state.close_waiters),
            )
        };

        info!("Disconnected from relay: {} (intentional: {})", self.url, intentional);
        for waiter in waiters {
            let _ = waiter.send(());
        }
        self.handler.on_close(intentional);

        if !intentional && self.config.auto_reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let delay = {
            let mut state = self.state.lock();
            state.reconnect_delay = next_reconnect_delay(state.reconnect_delay, &self.config);
            state.reconnect_delay
        };
        info!("Reconnecting to {} in {:?}", self.url, delay);

        let inner = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.state.lock().reconnect_timer = None;
            let transport = TransportConnection { inner };
            if let Err(e) = transport.connect().await {
                debug!("Reconnect to {} failed: {}", transport.url(), e);
            }
        });

        if let Some(previous) = self.state.lock().reconnect_timer.replace(timer) {
            previous.abort();
        }
    }
}
