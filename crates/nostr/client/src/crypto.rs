//! Signing and verification seam.
//!
//! The pool never touches secp256k1 directly; it calls an [`EventCrypto`]
//! at validation and publish points. [`Secp256k1Crypto`] delegates to the
//! `nostr` crate.

use crate::error::Result;
use nostr::{Event, EventTemplate, UnsignedEvent};

pub trait EventCrypto: Send + Sync {
    fn sign(&self, template: &EventTemplate, secret_key: &[u8; 32]) -> Result<Event>;

    /// Id and signature are both correct.
    fn verify(&self, event: &Event) -> bool;

    /// Fields have the right encoding and width.
    fn validate_shape(&self, event: &Event) -> bool;

    fn compute_id(&self, event: &UnsignedEvent) -> Result<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Secp256k1Crypto;

impl EventCrypto for Secp256k1Crypto {
    fn sign(&self, template: &EventTemplate, secret_key: &[u8; 32]) -> Result<Event> {
        Ok(nostr::finalize_event(template, secret_key)?)
    }

    fn verify(&self, event: &Event) -> bool {
        nostr::verify_event(event).unwrap_or(false)
    }

    fn validate_shape(&self, event: &Event) -> bool {
        nostr::validate_event(event)
    }

    fn compute_id(&self, event: &UnsignedEvent) -> Result<String> {
        Ok(nostr::get_event_hash(event)?)
    }
}
