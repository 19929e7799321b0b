//! NIP-57: Lightning Zaps
//!
//! The zap-request side of the protocol:
//!
//! 1. Find the recipient's LNURL pay endpoint from their kind 0 metadata
//!    (`lud16` lightning address or bech32 `lud06` LNURL).
//! 2. Build and sign a kind 9734 zap request.
//! 3. Hand the request to the endpoint's callback, which returns an invoice.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/57.md>

use crate::nip01::{Event, EventTemplate, unix_now};
use serde::Deserialize;
use thiserror::Error;

pub const ZAP_REQUEST_KIND: u16 = 9734;

#[derive(Debug, Error)]
pub enum Nip57Error {
    #[error("invalid zap request: {0}")]
    InvalidZapRequest(String),

    #[error("profile has no lud16 or lud06 entry")]
    NoPaymentEndpoint,

    #[error("invalid lightning address: {0}")]
    InvalidLightningAddress(String),

    #[error("invalid lnurl: {0}")]
    InvalidLnurl(String),

    #[error("endpoint does not accept nostr zaps")]
    ZapsNotSupported,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where to ask for a zap invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZapEndpoint {
    /// LNURL pay request url (the well-known url for lud16).
    pub url: String,
    /// The bech32 lnurl when the profile used `lud06`; echoed to the callback.
    pub lnurl: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProfilePaymentFields {
    lud06: Option<String>,
    lud16: Option<String>,
}

/// Resolve the LNURL pay endpoint from kind 0 metadata content.
///
/// `lud16` wins when both are present.
pub fn zap_endpoint_from_metadata(content: &str) -> Result<ZapEndpoint, Nip57Error> {
    let fields: ProfilePaymentFields = serde_json::from_str(content)?;

    if let Some(address) = fields.lud16.filter(|s| !s.is_empty()) {
        let (name, domain) = address
            .split_once('@')
            .filter(|(name, domain)| !name.is_empty() && !domain.is_empty())
            .ok_or_else(|| Nip57Error::InvalidLightningAddress(address.clone()))?;
        return Ok(ZapEndpoint {
            url: format!("https://{domain}/.well-known/lnurlp/{name}"),
            lnurl: None,
        });
    }

    if let Some(lnurl) = fields.lud06.filter(|s| !s.is_empty()) {
        return Ok(ZapEndpoint {
            url: decode_lnurl(&lnurl)?,
            lnurl: Some(lnurl),
        });
    }

    Err(Nip57Error::NoPaymentEndpoint)
}

/// Decode a bech32 `lnurl1...` string into the url it wraps.
pub fn decode_lnurl(lnurl: &str) -> Result<String, Nip57Error> {
    let (hrp, data) =
        bech32::decode(lnurl).map_err(|e| Nip57Error::InvalidLnurl(e.to_string()))?;
    if !hrp.as_str().eq_ignore_ascii_case("lnurl") {
        return Err(Nip57Error::InvalidLnurl(format!("unexpected prefix {hrp}")));
    }
    String::from_utf8(data).map_err(|e| Nip57Error::InvalidLnurl(e.to_string()))
}

/// LNURL pay endpoint response, as far as zaps care about it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LnurlPayResponse {
    pub callback: String,
    #[serde(default)]
    pub allows_nostr: bool,
    pub nostr_pubkey: Option<String>,
    pub min_sendable: Option<u64>,
    pub max_sendable: Option<u64>,
}

impl LnurlPayResponse {
    /// Callback url, if the endpoint advertises nostr zap support.
    pub fn zap_callback(&self) -> Result<&str, Nip57Error> {
        match (&self.nostr_pubkey, self.allows_nostr) {
            (Some(pubkey), true) if !pubkey.is_empty() => Ok(&self.callback),
            _ => Err(Nip57Error::ZapsNotSupported),
        }
    }
}

/// Callback response: either an invoice or an LNURL error.
#[derive(Debug, Clone, Deserialize)]
pub struct LnurlInvoiceResponse {
    pub pr: Option<String>,
    pub status: Option<String>,
    pub reason: Option<String>,
}

/// Unsigned kind 9734 zap request for a profile zap.
pub fn zap_request_template(
    recipient_pubkey: &str,
    amount_msats: u64,
    relays: &[String],
    comment: &str,
    lnurl: Option<&str>,
) -> EventTemplate {
    let mut relay_tag = vec!["relays".to_string()];
    relay_tag.extend(relays.iter().cloned());

    let mut tags = vec![
        vec!["p".to_string(), recipient_pubkey.to_string()],
        vec!["amount".to_string(), amount_msats.to_string()],
        relay_tag,
    ];
    if let Some(lnurl) = lnurl {
        tags.push(vec!["lnurl".to_string(), lnurl.to_string()]);
    }

    EventTemplate {
        created_at: unix_now(),
        kind: ZAP_REQUEST_KIND,
        tags,
        content: comment.to_string(),
    }
}

/// The fields of a signed zap request that the recipient's wallet reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZapRequest {
    pub event: Event,
    pub recipient_pubkey: String,
    pub relays: Vec<String>,
    pub amount_msats: Option<u64>,
}

impl ZapRequest {
    pub fn from_event(event: Event) -> Result<Self, Nip57Error> {
        if event.kind != ZAP_REQUEST_KIND {
            return Err(Nip57Error::InvalidZapRequest(format!(
                "expected kind {ZAP_REQUEST_KIND}, got {}",
                event.kind
            )));
        }

        let recipients: Vec<String> = event.tag_values("p").map(str::to_string).collect();
        let recipient_pubkey = match recipients.as_slice() {
            [] => return Err(Nip57Error::InvalidZapRequest("missing p tag".to_string())),
            [pubkey] => pubkey.clone(),
            _ => return Err(Nip57Error::InvalidZapRequest("multiple p tags".to_string())),
        };

        let amount_msats = match event.tag_values("amount").next() {
            Some(raw) => Some(raw.parse().map_err(|_| {
                Nip57Error::InvalidZapRequest(format!("invalid amount: {raw}"))
            })?),
            None => None,
        };

        let relays = event
            .tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some("relays"))
            .flat_map(|t| t.iter().skip(1).cloned())
            .collect();

        Ok(Self {
            event,
            recipient_pubkey,
            relays,
            amount_msats,
        })
    }
}
