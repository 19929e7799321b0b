//! Nostr protocol types for the relay pool client.
//!
//! This crate provides:
//! - NIP-01: events, canonical serialization, id hashing, signing and verification
//! - NIP-42: authentication of clients to relays
//! - NIP-57: zap requests and LNURL pay endpoint resolution
//! - NIP-65: relay list metadata
//!
//! # Features
//!
//! - `full` (default): key generation, hashing, Schnorr signing and verification
//! - `minimal`: just the event types and serialization

pub mod nip01;
pub mod nip42;
pub mod nip57;
pub mod nip65;

pub use nip01::{
    Event, EventTemplate, KIND_CONTACTS, KIND_METADATA, KIND_TEXT_NOTE, Nip01Error,
    UnsignedEvent, serialize_event, unix_now, validate_event,
};

#[cfg(feature = "full")]
pub use nip01::{
    finalize_event, generate_secret_key, get_event_hash, get_public_key_hex, verify_event,
};

pub use nip42::{CLIENT_AUTH_KIND, auth_template};

pub use nip57::{
    LnurlInvoiceResponse, LnurlPayResponse, Nip57Error, ZAP_REQUEST_KIND, ZapEndpoint,
    ZapRequest, decode_lnurl, zap_endpoint_from_metadata, zap_request_template,
};

pub use nip65::{
    Nip65Error, RELAY_LIST_METADATA_KIND, RelayEntry, RelayListMetadata, RelayMarker, relay_tag,
};
