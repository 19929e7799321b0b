//! Subscription ids and per-subscription delivery bookkeeping.

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Id of the subscription that watches for a published event's echo.
pub fn monitor_subscription_id(event_id: &str) -> String {
    let prefix: String = event_id.chars().take(5).collect();
    format!("monitor-{prefix}")
}

#[derive(Debug, Clone, Copy, Default)]
struct RelayProgress {
    eose: bool,
    min_created_at: Option<u64>,
}

/// What one logical subscription has delivered so far, across every relay.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    seen: HashSet<String>,
    relays: HashMap<String, RelayProgress>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the id; false if it was delivered before.
    pub fn first_delivery(&mut self, event_id: &str) -> bool {
        if self.seen.contains(event_id) {
            return false;
        }
        self.seen.insert(event_id.to_string())
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Note an event from `relay`; returns whether that relay was past EOSE.
    pub fn record_event(&mut self, relay: &str, created_at: u64) -> bool {
        let progress = self.relays.entry(relay.to_string()).or_default();
        if !progress.eose {
            progress.min_created_at = Some(
                progress
                    .min_created_at
                    .map_or(created_at, |min| min.min(created_at)),
            );
        }
        progress.eose
    }

    /// First EOSE from `relay` returns the oldest `created_at` seen before it.
    /// Later EOSEs from the same relay return `None`.
    pub fn mark_eose(&mut self, relay: &str) -> Option<Option<u64>> {
        let progress = self.relays.entry(relay.to_string()).or_default();
        if progress.eose {
            return None;
        }
        progress.eose = true;
        Some(progress.min_created_at)
    }
}
