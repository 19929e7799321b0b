//! Client error types

use thiserror::Error;

/// Errors surfaced by the relay pool and its connections.
///
/// Cloneable so that a single failed lookup can be handed to every caller
/// that joined it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Connect or send failure on a socket
    #[error("Transport error: {0}")]
    Transport(String),

    /// Relay sent a frame we could not parse
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Event failed shape or signature checks
    #[error("Validation error: {0}")]
    Validation(String),

    /// A bounded wait ran out
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Every relay finished its stored events without a match
    #[error("Can't find data for {pubkey} with kind {kind} on relays {}", relays.join(","))]
    Exhausted {
        pubkey: String,
        kind: u16,
        relays: Vec<String>,
    },

    /// Caller handed us an event that breaks the API contract
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Not connected to relay")]
    NotConnected,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Zap failed: {0}")]
    Zap(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    /// The pool shut down while the operation was pending
    #[error("Relay pool closed")]
    Closed,
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        ClientError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Http(err.to_string())
    }
}

impl From<nostr::Nip01Error> for ClientError {
    fn from(err: nostr::Nip01Error) -> Self {
        ClientError::Crypto(err.to_string())
    }
}

impl From<nostr::Nip57Error> for ClientError {
    fn from(err: nostr::Nip57Error) -> Self {
        ClientError::Zap(err.to_string())
    }
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
