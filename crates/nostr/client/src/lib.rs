//! Multi-relay Nostr client.
//!
//! This crate provides:
//! - WebSocket connections to relays with reconnect backoff
//! - Message parsing and validation (NIP-01 relay protocol)
//! - A relay pool that fans subscriptions out to many relays and delivers
//!   each event id once per subscription
//! - A bounded LRU event cache that answers filters before they hit the network
//! - Single-flight lookups of profile metadata, contact lists and relay lists
//! - NIP-42 auth, NIP-50 search and NIP-57 zap requests
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_relaypool::{Filter, PoolConfig, RelayPool, SubscribeOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let pool = RelayPool::new(PoolConfig::from_env());
//!     let relays = vec!["wss://relay.damus.io".to_string(), "wss://nos.lol".to_string()];
//!
//!     // Kind 1 notes; an event seen on both relays is delivered once
//!     let subscription = pool.subscribe(
//!         vec![Filter::new().kinds([1]).limit(10)],
//!         Some(&relays),
//!         |event, meta| println!("{} from {:?}", event.id, meta.relay_url),
//!         SubscribeOptions::default(),
//!     );
//!
//!     if let Ok(profile) = pool.fetch_and_cache_metadata("3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d").await {
//!         println!("profile: {}", profile.content);
//!     }
//!
//!     subscription.unsubscribe();
//!     pool.close().await;
//! }
//! ```

mod cache;
mod config;
mod crypto;
mod dispatcher;
mod error;
mod latest;
mod message;
mod outbox;
mod pool;
mod proxy;
mod queue;
mod relay;
mod subscription;
mod transport;
mod zap;

pub use cache::{CachedFilterResult, DEFAULT_CACHE_CAPACITY, EventCache};
pub use config::{DEFAULT_DISCOVERY_RELAYS, PoolConfig};
pub use crypto::{EventCrypto, Secp256k1Crypto};
pub use dispatcher::{EventDispatcher, ListenerId, RelayEvent, RelayEventKind};
pub use error::{ClientError, Result};
pub use latest::{LOOKUP_TIMEOUT, LatestLookup, LookupBy, SingleFlightLatestCache};
pub use message::{ClientMessage, Filter, MessageError, RelayMessage, matches_any};
pub use outbox::{OutboxModel, RelayPlan};
pub use pool::{
    EventMeta, GET_EVENT_TIMEOUT, OnEose, OnEvent, PoolEvent, RelayCallback, RelayPool,
    SubscribeOptions, Subscription,
};
pub use proxy::{ProxyRequest, ProxyResponse};
pub use queue::{MessageHandler, SequentialMessageQueue};
pub use relay::{
    PublishHandle, RelayConnection, RelayOptions, RelaySubscription, SEEN_TIMEOUT,
    SubscriptionOptions,
};
pub use subscription::{DeliveryTracker, generate_subscription_id};
pub use transport::{ReadyState, TransportConfig, TransportConnection, TransportHandler};
pub use zap::{HttpLnurlClient, LnurlClient, ZapResult, fetch_zap_invoice};

/// Relays used when a filter has no author to route by.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://nostr.wine",
];

/// Create a relay pool over [`DEFAULT_RELAYS`].
pub fn default_pool() -> RelayPool {
    RelayPool::with_relays(DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect())
}
