//! Pool configuration.

use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::transport::TransportConfig;
use tracing::warn;

/// Relays queried for kind-10002 relay lists when an author's write relays are unknown.
pub const DEFAULT_DISCOVERY_RELAYS: &[&str] = &["wss://us.rbr.bio", "wss://eu.rbr.bio"];

pub const ENV_RELAYS: &str = "NOSTR_RELAYS";
pub const ENV_CACHE_CAPACITY: &str = "NOSTR_RELAYPOOL_CACHE_CAPACITY";
pub const ENV_AUTO_RECONNECT: &str = "NOSTR_RELAYPOOL_AUTO_RECONNECT";
pub const ENV_LOG_SUBSCRIPTIONS: &str = "NOSTR_RELAYPOOL_LOG_SUBSCRIPTIONS";

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Keep accepted events in an in-memory LRU and answer filters from it
    pub use_event_cache: bool,
    pub event_cache_capacity: usize,
    pub log_subscriptions: bool,
    pub log_errors_and_notices: bool,
    /// Pool-wide default for skipping signature checks
    pub skip_verification: bool,
    /// Strip `sig` from delivered and cached events
    pub delete_signatures: bool,
    /// Targets for filters that carry no author
    pub default_relays: Vec<String>,
    pub discovery_relays: Vec<String>,
    /// Publish the signed zap request to the default relays after fetching the invoice
    pub zap_auto_publish: bool,
    pub transport: TransportConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            use_event_cache: true,
            event_cache_capacity: DEFAULT_CACHE_CAPACITY,
            log_subscriptions: false,
            log_errors_and_notices: true,
            skip_verification: false,
            delete_signatures: false,
            default_relays: crate::DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect(),
            discovery_relays: DEFAULT_DISCOVERY_RELAYS
                .iter()
                .map(|r| r.to_string())
                .collect(),
            zap_auto_publish: false,
            transport: TransportConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Defaults overlaid with `NOSTR_RELAYS` and the `NOSTR_RELAYPOOL_*` variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_default_relays(mut self, relays: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.default_relays = relays.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_discovery_relays(
        mut self,
        relays: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.discovery_relays = relays.into_iter().map(Into::into).collect();
        self
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(relays) = lookup(ENV_RELAYS) {
            let relays: Vec<String> = relays
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
            if !relays.is_empty() {
                self.default_relays = relays;
            }
        }
        if let Some(raw) = lookup(ENV_CACHE_CAPACITY) {
            match raw.trim().parse::<usize>() {
                Ok(capacity) => self.event_cache_capacity = capacity,
                Err(e) => warn!("Ignoring {}={:?}: {}", ENV_CACHE_CAPACITY, raw, e),
            }
        }
        if let Some(flag) = lookup(ENV_AUTO_RECONNECT).and_then(|raw| parse_flag(ENV_AUTO_RECONNECT, &raw)) {
            self.transport.auto_reconnect = flag;
        }
        if let Some(flag) =
            lookup(ENV_LOG_SUBSCRIPTIONS).and_then(|raw| parse_flag(ENV_LOG_SUBSCRIPTIONS, &raw))
        {
            self.log_subscriptions = flag;
        }
        self
    }
}

fn parse_flag(key: &str, raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("Ignoring {}={:?}: expected a boolean", key, raw);
            None
        }
    }
}
